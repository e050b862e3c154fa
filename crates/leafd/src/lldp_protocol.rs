//! LLDP client protocol
//!
//! Framing used on lldpd's control socket: a 16-byte native-endian header
//! (`u32` message type, `u32` padding, `u64` payload length) followed by the
//! payload. Only the two messages the daemon needs are understood: the
//! neighbor-change subscription and the notifications it produces.
//!
//! A notification payload is lldpd's marshalled `struct lldpd_neighbor_change`.
//! The marshaller writes each object as its original address, a size word it
//! leaves at zero, then the raw structure. Every object reached through a
//! pointer follows its parent, padded to 8 bytes:
//!
//! ```text
//! [orig|0] lldpd_neighbor_change { char *ifname; int state; lldpd_port *neighbor }
//! [orig|0] "eth0\0"
//! [orig|0] lldpd_port { .., lldpd_chassis *p_chassis, .., char *p_id, int p_id_len, char *p_descr, .. }
//! [orig|0]   lldpd_chassis { .., char *c_name, .. }
//! [orig|0]     c_id, c_name, c_descr, management addresses ..
//! [orig|0]   p_id, p_descr ..
//! ```
//!
//! Objects are found by the original address stored in the parent's pointer
//! field, so sub-objects the daemon does not need are skipped without knowing
//! their size. Field offsets are those of lldpd 1.0 on LP64 targets.

use crate::error::{LeafError, Result};
use crate::types::{InterfaceName, LinkEvent, LinkState};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 16;

/// Upper bound on a single frame; anything larger means a desynchronized stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub const MSG_SUBSCRIBE: u32 = 8;
pub const MSG_NOTIFICATION: u32 = 9;

/// Original address plus the unused size word.
pub const OBJECT_HEADER_LEN: usize = 16;
const OBJECT_ALIGN: usize = 8;

// struct lldpd_neighbor_change
const CHANGE_IFNAME: usize = 0;
const CHANGE_STATE: usize = 8;
const CHANGE_NEIGHBOR: usize = 16;
const CHANGE_LEN: usize = 24;

// struct lldpd_port
const PORT_CHASSIS: usize = 16;
const PORT_ID: usize = 72;
const PORT_ID_LEN: usize = 80;
const PORT_DESCR: usize = 88;

// struct lldpd_chassis
const CHASSIS_NAME: usize = 40;

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub payload: Bytes,
}

pub fn encode_frame(msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32_ne(msg_type);
    out.put_u32_ne(0);
    out.put_u64_ne(payload.len() as u64);
    out.put_slice(payload);
    out.to_vec()
}

/// Incremental frame decoder.
///
/// Bytes are fed as they arrive; frames come out once complete, so a frame
/// split across several socket reads is reassembled and several frames in
/// one read are all returned.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Payload length announced by a buffered header.
    fn declared_len(&self) -> Result<Option<usize>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = (&self.buffer[8..HEADER_LEN]).get_u64_ne();
        if len > MAX_FRAME_LEN as u64 {
            return Err(LeafError::Lldp(format!(
                "Frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }
        Ok(Some(len as usize))
    }

    /// Bytes still to read before the first buffered frame is complete.
    pub fn missing(&self) -> Result<usize> {
        Ok(match self.declared_len()? {
            None => HEADER_LEN - self.buffer.len(),
            Some(len) => (HEADER_LEN + len).saturating_sub(self.buffer.len()),
        })
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(len) = self.declared_len()? else {
            return Ok(None);
        };
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let msg_type = self.buffer.get_u32_ne();
        self.buffer.advance(HEADER_LEN - 4);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Frame { msg_type, payload }))
    }
}

/// Kind of neighbor table change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            -1 => Some(ChangeKind::Deleted),
            0 => Some(ChangeKind::Updated),
            1 => Some(ChangeKind::Added),
            _ => None,
        }
    }

    /// A deleted neighbor is down; an added or refreshed one is up.
    pub fn link_state(self) -> LinkState {
        match self {
            ChangeKind::Deleted => LinkState::Down,
            ChangeKind::Added | ChangeKind::Updated => LinkState::Up,
        }
    }
}

/// Marshalled object tree of one notification.
struct ObjectTree<'a> {
    data: &'a [u8],
}

impl<'a> ObjectTree<'a> {
    fn word(&self, at: usize) -> Option<u64> {
        self.data.get(at..at.checked_add(8)?).map(|mut b| b.get_u64_ne())
    }

    fn int(&self, at: usize) -> Option<i32> {
        self.data.get(at..at.checked_add(4)?).map(|mut b| b.get_i32_ne())
    }

    /// Body offset of the object whose original address is `orig`, at or after `from`.
    fn locate(&self, orig: u64, from: usize) -> Option<usize> {
        if orig == 0 {
            return None;
        }
        let mut at = from.next_multiple_of(OBJECT_ALIGN);
        while at + OBJECT_HEADER_LEN <= self.data.len() {
            if self.word(at) == Some(orig) && self.word(at + 8) == Some(0) {
                return Some(at + OBJECT_HEADER_LEN);
            }
            at += OBJECT_ALIGN;
        }
        None
    }

    /// Resolve the pointer stored at `field` of the object at `body`.
    fn follow(&self, body: usize, field: usize) -> Option<usize> {
        let orig = self.word(body + field)?;
        self.locate(orig, body + field + 8)
    }

    fn c_string(&self, body: usize) -> Option<&'a [u8]> {
        let rest = self.data.get(body..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        Some(&rest[..end])
    }

    fn fixed_string(&self, body: usize, len: i32) -> Option<&'a [u8]> {
        let len = usize::try_from(len).ok()?;
        self.data.get(body..body.checked_add(len)?)
    }
}

/// Printable text, or nothing: port ids may be raw MAC addresses.
fn text(bytes: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(bytes).ok()?;
    if s.is_empty() || s.chars().any(char::is_control) {
        return None;
    }
    Some(s.to_string())
}

/// Decoded neighbor-change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborChange {
    pub kind: ChangeKind,
    pub local_ifname: String,
    pub remote_ifname: Option<String>,
    pub remote_fqdn: Option<String>,
}

impl NeighborChange {
    /// Decode a marshalled `lldpd_neighbor_change`.
    ///
    /// The local interface and change kind are required. The remote port
    /// (port id, else port description) and chassis name are informational
    /// and come out as `None` when they cannot be resolved.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let tree = ObjectTree { data: payload };
        let body = OBJECT_HEADER_LEN;
        if payload.len() < body + CHANGE_LEN {
            return Err(LeafError::Lldp(format!(
                "Truncated notification ({} bytes)",
                payload.len()
            )));
        }

        let raw_kind = tree
            .int(body + CHANGE_STATE)
            .ok_or_else(|| LeafError::Lldp("Truncated notification".to_string()))?;
        let kind = ChangeKind::from_wire(raw_kind)
            .ok_or_else(|| LeafError::Lldp(format!("Unknown neighbor change kind {}", raw_kind)))?;

        let local_ifname = tree
            .follow(body, CHANGE_IFNAME)
            .and_then(|at| tree.c_string(at))
            .ok_or_else(|| LeafError::Lldp("Notification without local interface".to_string()))?;
        let local_ifname = std::str::from_utf8(local_ifname)
            .map_err(|_| LeafError::Lldp("Local interface name is not UTF-8".to_string()))?
            .to_string();

        let port = tree.follow(body, CHANGE_NEIGHBOR);
        let remote_ifname = port.and_then(|port| {
            let id = tree.follow(port, PORT_ID).and_then(|at| {
                tree.fixed_string(at, tree.int(port + PORT_ID_LEN)?)
                    .and_then(text)
            });
            id.or_else(|| {
                tree.follow(port, PORT_DESCR)
                    .and_then(|at| tree.c_string(at))
                    .and_then(text)
            })
        });
        let remote_fqdn = port
            .and_then(|port| tree.follow(port, PORT_CHASSIS))
            .and_then(|chassis| tree.follow(chassis, CHASSIS_NAME))
            .and_then(|at| tree.c_string(at))
            .and_then(text);

        Ok(Self {
            kind,
            local_ifname,
            remote_ifname,
            remote_fqdn,
        })
    }

    pub fn into_event(self) -> Result<LinkEvent> {
        let ifname = InterfaceName::new(self.local_ifname)?;
        Ok(LinkEvent::lldp(
            ifname,
            self.kind.link_state(),
            self.remote_ifname,
            self.remote_fqdn,
        ))
    }
}
