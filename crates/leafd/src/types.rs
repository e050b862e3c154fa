//! Core types shared by the watchers, the reconciliation engine and the event loop.

use crate::error::{LeafError, Result};
use std::fmt;
use std::ops::Deref;

/// Kernel limit on interface names, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Tri-state link view folded from kernel operstates and LLDP neighbor changes.
///
/// No ordering is defined between states; only equality matters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Unknown,
    Down,
    Up,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Unknown => "unknown",
            LinkState::Down => "down",
            LinkState::Up => "up",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Administrative state requested for the leaf set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdminState {
    Up,
    Down,
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Up => f.write_str("up"),
            AdminState::Down => f.write_str("down"),
        }
    }
}

/// Name of a kernel network interface.
///
/// Bounded by `IFNAMSIZ - 1` bytes and free of the characters the kernel
/// rejects (`/`, whitespace, NUL).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceName(String);

impl InterfaceName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() < IFNAMSIZ
            && name != "."
            && name != ".."
            && !name
                .chars()
                .any(|c| c == '/' || c == '\0' || c.is_whitespace());
        if valid {
            Ok(Self(name))
        } else {
            Err(LeafError::InvalidInterfaceName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for InterfaceName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for InterfaceName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for InterfaceName {
    type Error = LeafError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

/// Ordered, immutable set of leaf interfaces fixed at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafSet {
    names: Vec<InterfaceName>,
}

impl LeafSet {
    /// Build the set, dropping repeated names but keeping first-seen order.
    pub fn new(names: impl IntoIterator<Item = InterfaceName>) -> Self {
        let mut unique: Vec<InterfaceName> = Vec::new();
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self { names: unique }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

impl Deref for LeafSet {
    type Target = [InterfaceName];

    fn deref(&self) -> &Self::Target {
        &self.names
    }
}

impl fmt::Display for LeafSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names.iter().map(InterfaceName::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Last netlink-observed state of the upstream interface.
#[derive(Clone, Debug)]
pub struct UpstreamTracker {
    name: InterfaceName,
    current_state: LinkState,
}

impl UpstreamTracker {
    pub fn new(name: InterfaceName) -> Self {
        Self {
            name,
            current_state: LinkState::Unknown,
        }
    }

    pub fn name(&self) -> &InterfaceName {
        &self.name
    }

    pub fn current_state(&self) -> LinkState {
        self.current_state
    }

    pub fn is_upstream(&self, ifname: &str) -> bool {
        self.name == ifname
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        self.current_state = state;
    }
}

/// Watcher that produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSource {
    Netlink,
    Lldp,
}

/// A single observation handed from a watcher to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkEvent {
    pub source: EventSource,
    pub ifname: InterfaceName,
    pub new_state: LinkState,
    /// Remote port, LLDP only. Informational.
    pub remote_ifname: Option<String>,
    /// Remote chassis name, LLDP only. Informational.
    pub remote_fqdn: Option<String>,
}

impl LinkEvent {
    pub fn netlink(ifname: InterfaceName, new_state: LinkState) -> Self {
        Self {
            source: EventSource::Netlink,
            ifname,
            new_state,
            remote_ifname: None,
            remote_fqdn: None,
        }
    }

    pub fn lldp(
        ifname: InterfaceName,
        new_state: LinkState,
        remote_ifname: Option<String>,
        remote_fqdn: Option<String>,
    ) -> Self {
        Self {
            source: EventSource::Lldp,
            ifname,
            new_state,
            remote_ifname,
            remote_fqdn,
        }
    }
}
