//! Reconciliation engine
//!
//! Applies the upstream/leaf policy to every incoming `LinkEvent`:
//!
//! - kernel reports the upstream down (or unknown): force every leaf down at once
//! - kernel reports the upstream up: record it, leaves stay down
//! - LLDP confirms a neighbor on the upstream: bring every leaf up
//! - LLDP loses the upstream neighbor: nothing, carrier loss is the down signal
//! - anything about other interfaces: ignored
//!
//! Commands go through `LinkControl` synchronously, so a later decision can
//! never overtake an earlier one.

use crate::netlink_control::LinkControl;
use crate::types::{AdminState, EventSource, LeafSet, LinkEvent, LinkState, UpstreamTracker};
use tracing::{debug, error, info, trace};

/// Leaf-set command chosen for one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafAction {
    /// Upstream lost carrier; leaves go down.
    ForceDown,
    /// Upstream neighbor confirmed; leaves come back up.
    Restore,
}

impl LeafAction {
    pub fn admin_state(self) -> AdminState {
        match self {
            LeafAction::ForceDown => AdminState::Down,
            LeafAction::Restore => AdminState::Up,
        }
    }
}

pub struct Reconciler<C> {
    control: C,
    upstream: UpstreamTracker,
    leaves: LeafSet,
}

impl<C: LinkControl> Reconciler<C> {
    pub fn new(control: C, upstream: UpstreamTracker, leaves: LeafSet) -> Self {
        Self {
            control,
            upstream,
            leaves,
        }
    }

    pub fn upstream(&self) -> &UpstreamTracker {
        &self.upstream
    }

    pub fn leaves(&self) -> &LeafSet {
        &self.leaves
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Evaluate the policy for `event`, updating the upstream tracker.
    ///
    /// Issues no command; `handle` does that.
    pub fn decide(&mut self, event: &LinkEvent) -> Option<LeafAction> {
        if !self.upstream.is_upstream(event.ifname.as_str()) {
            trace!(
                source = ?event.source,
                ifname = %event.ifname,
                state = %event.new_state,
                "Ignoring event for non-upstream interface"
            );
            return None;
        }

        match (event.source, event.new_state) {
            (EventSource::Netlink, LinkState::Down | LinkState::Unknown) => {
                self.upstream.set_state(event.new_state);
                info!(
                    upstream = %event.ifname,
                    state = %event.new_state,
                    leaves = %self.leaves,
                    "Upstream lost carrier, forcing leaves down"
                );
                Some(LeafAction::ForceDown)
            }
            (EventSource::Netlink, LinkState::Up) => {
                self.upstream.set_state(LinkState::Up);
                info!(upstream = %event.ifname, "Upstream carrier up, waiting for LLDP neighbor");
                None
            }
            (EventSource::Lldp, LinkState::Up) => {
                info!(
                    upstream = %event.ifname,
                    remote_ifname = event.remote_ifname.as_deref().unwrap_or("-"),
                    remote_fqdn = event.remote_fqdn.as_deref().unwrap_or("-"),
                    carrier = %self.upstream.current_state(),
                    leaves = %self.leaves,
                    "LLDP neighbor confirmed, restoring leaves"
                );
                Some(LeafAction::Restore)
            }
            (EventSource::Lldp, _) => {
                debug!(upstream = %event.ifname, "LLDP neighbor lost, leaves unchanged");
                None
            }
        }
    }

    /// Evaluate `event` and issue the resulting leaf-set command.
    ///
    /// A failed command is logged; the next event is handled normally.
    pub fn handle(&mut self, event: &LinkEvent) -> Option<LeafAction> {
        let action = self.decide(event)?;
        if self.leaves.is_empty() {
            debug!(?action, "No leaf interfaces configured");
            return Some(action);
        }
        let state = action.admin_state();
        if let Err(e) = self.control.set_interfaces_state(&self.leaves, state) {
            error!(error = %e, %state, leaves = %self.leaves, "Failed to change leaf state");
        }
        Some(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LeafError;
    use crate::netlink_control::MockLinkControl;
    use crate::types::InterfaceName;
    use pretty_assertions::assert_eq;

    fn name(s: &str) -> InterfaceName {
        InterfaceName::new(s).unwrap()
    }

    fn leaves() -> LeafSet {
        LeafSet::new(vec![name("swp1"), name("swp2")])
    }

    fn reconciler(control: MockLinkControl) -> Reconciler<MockLinkControl> {
        Reconciler::new(control, UpstreamTracker::new(name("eth0")), leaves())
    }

    fn netlink(ifname: &str, state: LinkState) -> LinkEvent {
        LinkEvent::netlink(name(ifname), state)
    }

    fn lldp(ifname: &str, state: LinkState) -> LinkEvent {
        LinkEvent::lldp(
            name(ifname),
            state,
            Some("neighbor1".to_string()),
            Some("switch1.example".to_string()),
        )
    }

    fn expect_leaves(control: &mut MockLinkControl, state: AdminState, times: usize) {
        control
            .expect_set_interfaces_state()
            .withf(move |names, s| {
                names.iter().map(InterfaceName::as_str).eq(["swp1", "swp2"]) && *s == state
            })
            .times(times)
            .returning(|_, _| Ok(()));
    }

    #[test]
    fn test_netlink_down_forces_leaves_down() {
        let mut control = MockLinkControl::new();
        expect_leaves(&mut control, AdminState::Down, 1);
        let mut engine = reconciler(control);

        let action = engine.handle(&netlink("eth0", LinkState::Down));
        assert_eq!(action, Some(LeafAction::ForceDown));
        assert_eq!(engine.upstream().current_state(), LinkState::Down);
    }

    #[test]
    fn test_netlink_unknown_counts_as_down() {
        let mut control = MockLinkControl::new();
        expect_leaves(&mut control, AdminState::Down, 1);
        let mut engine = reconciler(control);

        assert_eq!(
            engine.handle(&netlink("eth0", LinkState::Unknown)),
            Some(LeafAction::ForceDown)
        );
        assert_eq!(engine.upstream().current_state(), LinkState::Unknown);
    }

    #[test]
    fn test_repeated_down_is_repeated_command() {
        let mut control = MockLinkControl::new();
        expect_leaves(&mut control, AdminState::Down, 3);
        let mut engine = reconciler(control);
        for _ in 0..3 {
            engine.handle(&netlink("eth0", LinkState::Down));
        }
    }

    #[test]
    fn test_netlink_up_only_records_state() {
        let mut control = MockLinkControl::new();
        control.expect_set_interfaces_state().never();
        let mut engine = reconciler(control);

        assert_eq!(engine.handle(&netlink("eth0", LinkState::Up)), None);
        assert_eq!(engine.upstream().current_state(), LinkState::Up);
    }

    #[test]
    fn test_lldp_up_restores_without_prior_netlink_up() {
        let mut control = MockLinkControl::new();
        expect_leaves(&mut control, AdminState::Up, 1);
        let mut engine = reconciler(control);

        assert_eq!(engine.handle(&lldp("eth0", LinkState::Up)), Some(LeafAction::Restore));
        assert_eq!(engine.upstream().current_state(), LinkState::Unknown);
    }

    #[test]
    fn test_lldp_down_is_noop() {
        let mut control = MockLinkControl::new();
        control.expect_set_interfaces_state().never();
        let mut engine = reconciler(control);
        engine.handle(&netlink("eth0", LinkState::Up));

        assert_eq!(engine.handle(&lldp("eth0", LinkState::Down)), None);
        assert_eq!(engine.upstream().current_state(), LinkState::Up);
    }

    #[test]
    fn test_non_upstream_events_ignored_for_both_sources() {
        let mut control = MockLinkControl::new();
        control.expect_set_interfaces_state().never();
        let mut engine = reconciler(control);

        for state in [LinkState::Down, LinkState::Up, LinkState::Unknown] {
            assert_eq!(engine.handle(&netlink("swp1", state)), None);
            assert_eq!(engine.handle(&lldp("swp1", state)), None);
        }
        assert_eq!(engine.upstream().current_state(), LinkState::Unknown);
    }

    #[test]
    fn test_control_failure_is_not_fatal() {
        let mut control = MockLinkControl::new();
        control
            .expect_set_interfaces_state()
            .times(2)
            .returning(|_, _| Err(LeafError::Netlink("timed out".to_string())));
        let mut engine = reconciler(control);

        assert_eq!(
            engine.handle(&netlink("eth0", LinkState::Down)),
            Some(LeafAction::ForceDown)
        );
        assert_eq!(engine.handle(&lldp("eth0", LinkState::Up)), Some(LeafAction::Restore));
    }

    #[test]
    fn test_empty_leaf_set_issues_no_command() {
        let mut control = MockLinkControl::new();
        control.expect_set_interfaces_state().never();
        let mut engine =
            Reconciler::new(control, UpstreamTracker::new(name("eth0")), LeafSet::default());

        assert_eq!(
            engine.handle(&netlink("eth0", LinkState::Down)),
            Some(LeafAction::ForceDown)
        );
        assert_eq!(engine.upstream().current_state(), LinkState::Down);
    }

    #[test]
    fn test_down_up_confirm_sequence() {
        let mut control = MockLinkControl::new();
        let mut seq = mockall::Sequence::new();
        control
            .expect_set_interfaces_state()
            .withf(|_, s| *s == AdminState::Down)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        control
            .expect_set_interfaces_state()
            .withf(|_, s| *s == AdminState::Up)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let mut engine = reconciler(control);

        engine.handle(&netlink("eth0", LinkState::Down));
        engine.handle(&netlink("eth0", LinkState::Up));
        engine.handle(&lldp("eth0", LinkState::Up));
        assert_eq!(engine.upstream().current_state(), LinkState::Up);
    }
}
