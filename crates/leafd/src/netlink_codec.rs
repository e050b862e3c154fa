//! Routing-netlink wire codec for link messages
//!
//! Parsing walks kernel buffers with bounds-checked cursors: every header and
//! attribute length is validated against the bytes that remain before it is
//! used, so a malformed message can only ever produce "no event".
//! Request builders for the control channel live here too.

use crate::error::{LeafError, Result};
use crate::types::{AdminState, InterfaceName, LinkEvent, LinkState};
use tracing::trace;

/// Netlink message and attribute alignment.
pub const NLMSG_ALIGNTO: usize = 4;
/// Size of `struct nlmsghdr`.
pub const NLMSG_HDRLEN: usize = 16;
/// Size of `struct ifinfomsg`.
pub const IFINFOMSG_LEN: usize = 16;
/// Size of `struct rtattr`.
pub const RTA_HDRLEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_SETLINK: u16 = 19;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_OPERSTATE: u16 = 16;

/// Attribute type flag bits that are not part of the type.
const NLA_TYPE_MASK: u16 = !((1 << 15) | (1 << 14));

pub const IFF_UP: u32 = 0x1;

/// Multicast group carrying link notifications.
pub const RTNLGRP_LINK: u32 = 1;

/// Kernel `IF_OPER_*` codes, indexed by value, and the state each folds to.
///
/// Any code at or beyond the table length is unknown to this build.
pub const OPERSTATE_TABLE: [(&str, LinkState); 7] = [
    ("unknown", LinkState::Unknown),
    ("notpresent", LinkState::Unknown),
    ("down", LinkState::Down),
    ("lowerlayerdown", LinkState::Down),
    ("testing", LinkState::Unknown),
    ("dormant", LinkState::Unknown),
    ("up", LinkState::Up),
];

#[inline]
pub const fn nl_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Fold a kernel operstate code into a `LinkState`.
pub fn fold_operstate(code: u8) -> Result<LinkState> {
    OPERSTATE_TABLE
        .get(code as usize)
        .map(|(_, state)| *state)
        .ok_or(LeafError::UnknownOperState(code))
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(data: &[u8], at: usize) -> Option<i32> {
    read_u32(data, at).map(|v| v as i32)
}

/// Decoded `struct nlmsghdr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NlMsgHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        Some(Self {
            len: read_u32(data, 0)?,
            msg_type: read_u16(data, 4)?,
            flags: read_u16(data, 6)?,
            seq: read_u32(data, 8)?,
            pid: read_u32(data, 12)?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_ne_bytes());
        out.extend_from_slice(&self.msg_type.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.pid.to_ne_bytes());
    }
}

/// Cursor over the netlink messages packed in one datagram.
///
/// Yields `(header, payload)` pairs and stops at the first message whose
/// declared length does not fit the remaining buffer.
pub struct MessageCursor<'a> {
    data: &'a [u8],
    truncated: bool,
}

impl<'a> MessageCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            truncated: false,
        }
    }

    /// True when decoding stopped on a malformed message rather than the end of the buffer.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl<'a> Iterator for MessageCursor<'a> {
    type Item = (NlMsgHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let header = match NlMsgHeader::parse(self.data) {
            Some(h) => h,
            None => {
                self.truncated = true;
                self.data = &[];
                return None;
            }
        };
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > self.data.len() {
            self.truncated = true;
            self.data = &[];
            return None;
        }
        let payload = &self.data[NLMSG_HDRLEN..len];
        let advance = nl_align(len).min(self.data.len());
        self.data = &self.data[advance..];
        Some((header, payload))
    }
}

/// One `(type, value)` attribute triplet; the length is `value.len()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attr<'a> {
    pub kind: u16,
    pub value: &'a [u8],
}

/// Bounds-checked walk over an `rtattr` stream.
pub struct AttrCursor<'a> {
    data: &'a [u8],
    malformed: bool,
}

impl<'a> AttrCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            malformed: false,
        }
    }

    /// True when the walk stopped on an attribute that overran the buffer.
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }
}

impl<'a> Iterator for AttrCursor<'a> {
    type Item = Attr<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < RTA_HDRLEN {
            // Trailing bytes shorter than a header are padding only if zero-length.
            if !self.data.is_empty() {
                self.malformed = true;
                self.data = &[];
            }
            return None;
        }
        let len = read_u16(self.data, 0)? as usize;
        let kind = read_u16(self.data, 2)? & NLA_TYPE_MASK;
        if len < RTA_HDRLEN || len > self.data.len() {
            self.malformed = true;
            self.data = &[];
            return None;
        }
        let value = &self.data[RTA_HDRLEN..len];
        let advance = nl_align(len).min(self.data.len());
        self.data = &self.data[advance..];
        Some(Attr { kind, value })
    }
}

/// Decoded `struct ifinfomsg`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkHeader {
    pub family: u8,
    pub link_type: u16,
    pub index: i32,
    pub flags: u32,
    pub change: u32,
}

impl LinkHeader {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < IFINFOMSG_LEN {
            return None;
        }
        Some(Self {
            family: payload[0],
            link_type: read_u16(payload, 2)?,
            index: read_i32(payload, 4)?,
            flags: read_u32(payload, 8)?,
            change: read_u32(payload, 12)?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.family);
        out.push(0);
        out.extend_from_slice(&self.link_type.to_ne_bytes());
        out.extend_from_slice(&self.index.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.change.to_ne_bytes());
    }
}

/// Extract a NUL-terminated string attribute.
fn attr_string(value: &[u8]) -> Option<&str> {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    std::str::from_utf8(&value[..end]).ok()
}

/// Link fields pulled out of one link message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkUpdate {
    pub ifname: InterfaceName,
    pub state: LinkState,
}

fn is_link_message(msg_type: u16) -> bool {
    matches!(msg_type, RTM_NEWLINK | RTM_SETLINK | RTM_DELLINK)
}

/// Decode one link message payload.
///
/// `Ok(None)` covers every recoverable case: non-link types, missing name or
/// operstate, truncated attribute streams. `Err(UnknownOperState)` is the
/// only error and is fatal for the caller.
pub fn decode_link_message(msg_type: u16, payload: &[u8]) -> Result<Option<LinkUpdate>> {
    if !is_link_message(msg_type) {
        return Ok(None);
    }
    let Some(header) = LinkHeader::parse(payload) else {
        trace!(msg_type, len = payload.len(), "Link message shorter than ifinfomsg");
        return Ok(None);
    };

    let mut ifname = None;
    let mut operstate = None;
    let mut attrs = AttrCursor::new(&payload[nl_align(IFINFOMSG_LEN)..]);
    for attr in attrs.by_ref() {
        match attr.kind {
            IFLA_IFNAME => ifname = attr_string(attr.value),
            IFLA_OPERSTATE => operstate = attr.value.first().copied(),
            _ => {}
        }
    }
    if attrs.is_malformed() {
        trace!(index = header.index, "Malformed attribute stream, dropping link message");
        return Ok(None);
    }

    let Some(name) = ifname else {
        trace!(index = header.index, "Link message without IFLA_IFNAME");
        return Ok(None);
    };
    let Some(code) = operstate else {
        trace!(ifname = name, "Link message without IFLA_OPERSTATE");
        return Ok(None);
    };
    let state = fold_operstate(code)?;
    let Ok(ifname) = InterfaceName::new(name) else {
        trace!(ifname = name, "Kernel reported an unusable interface name");
        return Ok(None);
    };

    Ok(Some(LinkUpdate { ifname, state }))
}

/// Decode every link notification packed in one datagram.
pub fn decode_link_events(datagram: &[u8]) -> Result<Vec<LinkEvent>> {
    let mut events = Vec::new();
    let mut messages = MessageCursor::new(datagram);
    for (header, payload) in messages.by_ref() {
        if let Some(update) = decode_link_message(header.msg_type, payload)? {
            events.push(LinkEvent::netlink(update.ifname, update.state));
        }
    }
    if messages.is_truncated() {
        trace!(len = datagram.len(), "Truncated netlink datagram");
    }
    Ok(events)
}

/// Interface index and name from one RTM_NEWLINK dump entry.
pub fn decode_link_entry(payload: &[u8]) -> Option<(i32, String)> {
    let header = LinkHeader::parse(payload)?;
    let mut attrs = AttrCursor::new(&payload[nl_align(IFINFOMSG_LEN)..]);
    let name = attrs
        .by_ref()
        .find(|attr| attr.kind == IFLA_IFNAME)
        .and_then(|attr| attr_string(attr.value))?;
    Some((header.index, name.to_string()))
}

/// Errno carried by an NLMSG_ERROR payload; 0 is a plain ACK.
pub fn decode_ack(payload: &[u8]) -> Option<i32> {
    read_i32(payload, 0).map(|err| -err)
}

fn finish(mut msg: Vec<u8>) -> Vec<u8> {
    let len = msg.len() as u32;
    msg[0..4].copy_from_slice(&len.to_ne_bytes());
    msg
}

/// RTM_GETLINK dump request for every interface.
pub fn encode_link_dump_request(seq: u32) -> Vec<u8> {
    let mut msg = Vec::with_capacity(NLMSG_HDRLEN + IFINFOMSG_LEN);
    NlMsgHeader {
        len: 0,
        msg_type: RTM_GETLINK,
        flags: NLM_F_REQUEST | NLM_F_DUMP,
        seq,
        pid: 0,
    }
    .write(&mut msg);
    LinkHeader {
        family: libc::AF_UNSPEC as u8,
        link_type: 0,
        index: 0,
        flags: 0,
        change: 0,
    }
    .write(&mut msg);
    finish(msg)
}

/// RTM_NEWLINK request flipping only the IFF_UP flag of one interface.
pub fn encode_admin_state_request(seq: u32, index: i32, state: AdminState) -> Vec<u8> {
    let mut msg = Vec::with_capacity(NLMSG_HDRLEN + IFINFOMSG_LEN);
    NlMsgHeader {
        len: 0,
        msg_type: RTM_NEWLINK,
        flags: NLM_F_REQUEST | NLM_F_ACK,
        seq,
        pid: 0,
    }
    .write(&mut msg);
    LinkHeader {
        family: libc::AF_UNSPEC as u8,
        link_type: 0,
        index,
        flags: match state {
            AdminState::Up => IFF_UP,
            AdminState::Down => 0,
        },
        change: IFF_UP,
    }
    .write(&mut msg);
    finish(msg)
}
