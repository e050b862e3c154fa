//! Integration tests for leafd reconciliation
//!
//! Drives the engine and the event loop through the public API:
//! - upstream down/up/confirm sequences against an in-memory kernel
//! - kernel-format link datagrams through the netlink decoder
//! - neighbor notifications from a fake lldpd over a Unix socket
//! - fast-down while lldpd takes connections but never answers

use sonic_leafd::lldp_protocol::{
    ChangeKind, HEADER_LEN, MSG_NOTIFICATION, MSG_SUBSCRIBE, NeighborChange, encode_frame,
};
use sonic_leafd::netlink_codec::{
    IFINFOMSG_LEN, IFLA_IFNAME, IFLA_OPERSTATE, NLMSG_HDRLEN, RTM_NEWLINK, decode_link_events,
    nl_align,
};
use sonic_leafd::{
    AdminState, EventLoop, InterfaceName, LeafAction, LeafError, LeafSet, LinkControl, LinkEvent,
    LinkState, LldpClient, Reconciler, Result, UpstreamTracker, Watcher,
};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::thread;
use std::time::{Duration, Instant};

/// In-memory kernel link table
#[derive(Default)]
struct FakeKernel {
    links: HashMap<String, AdminState>,
    commands: Vec<(Vec<String>, AdminState)>,
}

impl FakeKernel {
    fn with_links(names: &[&str]) -> Self {
        Self {
            links: names
                .iter()
                .map(|n| (n.to_string(), AdminState::Up))
                .collect(),
            commands: Vec::new(),
        }
    }

    fn state_of(&self, name: &str) -> Option<AdminState> {
        self.links.get(name).copied()
    }
}

impl LinkControl for FakeKernel {
    fn interfaces_exist(&mut self, names: &[InterfaceName]) -> Result<()> {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| !self.links.contains_key(n.as_str()))
            .map(|n| n.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LeafError::InvalidInterface(missing))
        }
    }

    fn set_interfaces_state(&mut self, names: &[InterfaceName], state: AdminState) -> Result<()> {
        self.commands
            .push((names.iter().map(|n| n.to_string()).collect(), state));
        for name in names {
            if let Some(current) = self.links.get_mut(name.as_str()) {
                *current = state;
            }
        }
        Ok(())
    }
}

fn name(s: &str) -> InterfaceName {
    InterfaceName::new(s).unwrap()
}

fn setup() -> Reconciler<FakeKernel> {
    let mut kernel = FakeKernel::with_links(&["eth0", "swp1", "swp2"]);
    let upstream = name("eth0");
    let leaves = LeafSet::new(vec![name("swp1"), name("swp2")]);
    kernel.interfaces_exist(std::slice::from_ref(&upstream)).unwrap();
    kernel.interfaces_exist(&leaves).unwrap();
    Reconciler::new(kernel, UpstreamTracker::new(upstream), leaves)
}

fn lldp_event(ifname: &str, kind: ChangeKind) -> LinkEvent {
    NeighborChange {
        kind,
        local_ifname: ifname.to_string(),
        remote_ifname: Some("neighbor1".to_string()),
        remote_fqdn: Some("switch1.example".to_string()),
    }
    .into_event()
    .unwrap()
}

#[test]
fn test_startup_validation_names_every_missing_interface() {
    let mut kernel = FakeKernel::with_links(&["eth0"]);
    let err = kernel
        .interfaces_exist(&[name("swp1"), name("eth0"), name("swp2")])
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid interface(s): swp1, swp2");
}

#[test]
fn test_down_up_confirm_cycle() {
    let mut engine = setup();

    // Upstream carrier lost
    let action = engine.handle(&LinkEvent::netlink(name("eth0"), LinkState::Down));
    assert_eq!(action, Some(LeafAction::ForceDown));
    assert_eq!(engine.control().commands.len(), 1);
    assert_eq!(
        engine.control().commands[0],
        (vec!["swp1".to_string(), "swp2".to_string()], AdminState::Down)
    );

    // Carrier back, leaves still held down
    assert_eq!(
        engine.handle(&LinkEvent::netlink(name("eth0"), LinkState::Up)),
        None
    );
    assert_eq!(engine.upstream().current_state(), LinkState::Up);
    assert_eq!(engine.control().commands.len(), 1);
    assert_eq!(engine.control().state_of("swp1"), Some(AdminState::Down));

    // Neighbor confirmed
    let action = engine.handle(&lldp_event("eth0", ChangeKind::Added));
    assert_eq!(action, Some(LeafAction::Restore));
    assert_eq!(engine.control().commands.len(), 2);
    assert_eq!(engine.control().commands[1].1, AdminState::Up);
    assert_eq!(engine.control().state_of("swp2"), Some(AdminState::Up));
}

#[test]
fn test_lldp_change_on_leaf_is_ignored() {
    let mut engine = setup();
    assert_eq!(engine.handle(&lldp_event("swp1", ChangeKind::Deleted)), None);
    assert!(engine.control().commands.is_empty());
}

#[test]
fn test_vanished_leaf_does_not_stop_the_others() {
    // swp2 passed validation at startup and was removed externally since
    let kernel = FakeKernel::with_links(&["eth0", "swp1"]);
    let leaves = LeafSet::new(vec![name("swp1"), name("swp2")]);
    let mut engine = Reconciler::new(kernel, UpstreamTracker::new(name("eth0")), leaves);

    let action = engine.handle(&LinkEvent::netlink(name("eth0"), LinkState::Down));
    assert_eq!(action, Some(LeafAction::ForceDown));
    assert_eq!(engine.control().state_of("swp1"), Some(AdminState::Down));
    assert_eq!(engine.control().state_of("swp2"), None);

    let action = engine.handle(&lldp_event("eth0", ChangeKind::Updated));
    assert_eq!(action, Some(LeafAction::Restore));
    assert_eq!(engine.control().state_of("swp1"), Some(AdminState::Up));
}

/// Build one RTM_NEWLINK message the way the kernel lays it out.
fn link_datagram(index: i32, ifname: &str, operstate: u8) -> Vec<u8> {
    fn attr(kind: u16, value: &[u8]) -> Vec<u8> {
        let len = 4 + value.len();
        let mut out = Vec::with_capacity(nl_align(len));
        out.extend_from_slice(&(len as u16).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(value);
        out.resize(nl_align(len), 0);
        out
    }

    let mut name = ifname.as_bytes().to_vec();
    name.push(0);
    let mut body = vec![0u8; IFINFOMSG_LEN];
    body[4..8].copy_from_slice(&index.to_ne_bytes());
    body.extend(attr(IFLA_IFNAME, &name));
    body.extend(attr(IFLA_OPERSTATE, &[operstate]));

    let mut msg = Vec::with_capacity(NLMSG_HDRLEN + body.len());
    msg.extend_from_slice(&((NLMSG_HDRLEN + body.len()) as u32).to_ne_bytes());
    msg.extend_from_slice(&RTM_NEWLINK.to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend(body);
    msg
}

/// Watch channel stand-in carrying kernel-format datagrams
struct DatagramWatch {
    socket: UnixDatagram,
}

impl Watcher for DatagramWatch {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn receive(&mut self) -> Result<Vec<LinkEvent>> {
        let mut events = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => events.extend(decode_link_events(&buf[..n])?),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(events)
    }
}

/// lldpd's marshalled `lldpd_neighbor_change`: every object is its original
/// address, a zero size word and the raw structure, padded to 8 bytes.
fn lldpd_notification(state: i32, local: &str, chassis_name: &str) -> Vec<u8> {
    fn object(out: &mut Vec<u8>, orig: u64, body: &[u8]) {
        out.resize(out.len().next_multiple_of(8), 0);
        out.extend_from_slice(&orig.to_ne_bytes());
        out.extend_from_slice(&0u64.to_ne_bytes());
        out.extend_from_slice(body);
    }
    fn c_string(s: &str) -> Vec<u8> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        bytes
    }

    let (ifname, port, chassis, name) = (
        0x55e1_07a0_2c40u64,
        0x55e1_07a0_8e00u64,
        0x55e1_07a0_7b30u64,
        0x55e1_07a0_7cb0u64,
    );
    // struct lldpd_neighbor_change { char *ifname; int state; struct lldpd_port *neighbor; }
    let mut change = [0u8; 24];
    change[0..8].copy_from_slice(&ifname.to_ne_bytes());
    change[8..12].copy_from_slice(&state.to_ne_bytes());
    change[16..24].copy_from_slice(&port.to_ne_bytes());
    // p_chassis follows the TAILQ entry
    let mut port_struct = [0u8; 304];
    port_struct[16..24].copy_from_slice(&chassis.to_ne_bytes());
    // c_name
    let mut chassis_struct = [0u8; 120];
    chassis_struct[40..48].copy_from_slice(&name.to_ne_bytes());

    let mut payload = Vec::new();
    object(&mut payload, 0x7ffc_91d2_4a10, &change);
    object(&mut payload, ifname, &c_string(local));
    object(&mut payload, port, &port_struct);
    object(&mut payload, chassis, &chassis_struct);
    object(&mut payload, name, &c_string(chassis_name));
    encode_frame(MSG_NOTIFICATION, &payload)
}

#[test]
fn test_lldpd_notification_decodes() {
    let frame = lldpd_notification(1, "eth0", "switch1.example");
    let change = NeighborChange::decode(&frame[HEADER_LEN..]).unwrap();
    assert_eq!(change.kind, ChangeKind::Added);
    assert_eq!(change.local_ifname, "eth0");
    assert_eq!(change.remote_ifname, None);
    assert_eq!(change.remote_fqdn.as_deref(), Some("switch1.example"));
}

fn accept_subscriber(listener: &UnixListener) -> UnixStream {
    let (mut stream, _) = listener.accept().unwrap();
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).unwrap();
    stream.write_all(&encode_frame(MSG_SUBSCRIBE, &[])).unwrap();
    stream
}

#[test]
fn test_event_loop_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lldpd.socket");
    let listener = UnixListener::bind(&path).unwrap();
    let server = thread::spawn(move || accept_subscriber(&listener));
    let lldp = LldpClient::connect(&path, Duration::from_secs(2)).unwrap();
    let mut lldpd = server.join().unwrap();

    let (kernel_side, watch_side) = UnixDatagram::pair().unwrap();
    watch_side.set_nonblocking(true).unwrap();
    let watch = DatagramWatch { socket: watch_side };

    let mut event_loop = EventLoop::new(watch, lldp, setup(), Duration::from_millis(50));

    // operstate 2 = down
    kernel_side.send(&link_datagram(2, "eth0", 2)).unwrap();
    event_loop.run_once().unwrap();
    assert_eq!(event_loop.engine().upstream().current_state(), LinkState::Down);
    assert_eq!(event_loop.engine().control().state_of("swp1"), Some(AdminState::Down));

    // operstate 6 = up, and a foreign interface in the same wakeup
    kernel_side.send(&link_datagram(2, "eth0", 6)).unwrap();
    kernel_side.send(&link_datagram(7, "swp9", 2)).unwrap();
    event_loop.run_once().unwrap();
    assert_eq!(event_loop.engine().upstream().current_state(), LinkState::Up);
    assert_eq!(event_loop.engine().control().commands.len(), 1);

    // NEIGHBOR_CHANGE_ADDED
    lldpd
        .write_all(&lldpd_notification(1, "eth0", "switch1.example"))
        .unwrap();
    event_loop.run_once().unwrap();
    assert_eq!(event_loop.engine().control().commands.len(), 2);
    assert_eq!(event_loop.engine().control().state_of("swp2"), Some(AdminState::Up));
}

#[test]
fn test_event_loop_stops_on_unknown_operstate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lldpd.socket");
    let listener = UnixListener::bind(&path).unwrap();
    let server = thread::spawn(move || accept_subscriber(&listener));
    let lldp = LldpClient::connect(&path, Duration::from_secs(2)).unwrap();
    let _lldpd = server.join().unwrap();

    let (kernel_side, watch_side) = UnixDatagram::pair().unwrap();
    watch_side.set_nonblocking(true).unwrap();
    let mut event_loop = EventLoop::new(
        DatagramWatch { socket: watch_side },
        lldp,
        setup(),
        Duration::from_millis(50),
    );

    kernel_side.send(&link_datagram(2, "eth0", 7)).unwrap();
    let err = event_loop
        .run(&std::sync::atomic::AtomicBool::new(false))
        .unwrap_err();
    assert!(err.is_fatal_decode());
    assert!(event_loop.engine().control().commands.is_empty());
}

#[test]
fn test_fast_down_while_lldp_daemon_stalls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lldpd.socket");
    let listener = UnixListener::bind(&path).unwrap();
    let server = thread::spawn(move || (accept_subscriber(&listener), listener));
    let lldp = LldpClient::connect(&path, Duration::from_secs(2)).unwrap();
    let (lldpd, listener) = server.join().unwrap();

    let (kernel_side, watch_side) = UnixDatagram::pair().unwrap();
    watch_side.set_nonblocking(true).unwrap();
    let mut event_loop = EventLoop::new(
        DatagramWatch { socket: watch_side },
        lldp,
        setup(),
        Duration::from_millis(10),
    );

    // lldpd drops the client; its socket keeps taking connections nobody answers.
    drop(lldpd);
    event_loop.run_once().unwrap();
    listener.set_nonblocking(true).unwrap();

    let mut stalled = None;
    for _ in 0..100 {
        let started = Instant::now();
        event_loop.run_once().unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "reconnect held the loop for {:?}",
            started.elapsed()
        );
        if let Ok((stream, _)) = listener.accept() {
            stalled = Some(stream);
            break;
        }
    }
    let mut stalled = stalled.expect("client never reconnected");
    let mut request = [0u8; HEADER_LEN];
    stalled.read_exact(&mut request).unwrap();
    assert_eq!(u32::from_ne_bytes(request[..4].try_into().unwrap()), MSG_SUBSCRIBE);

    // Subscription unanswered: carrier loss must still act at once.
    kernel_side.send(&link_datagram(2, "eth0", 2)).unwrap();
    let started = Instant::now();
    event_loop.run_once().unwrap();
    let elapsed = started.elapsed();
    assert_eq!(event_loop.engine().control().state_of("swp1"), Some(AdminState::Down));
    assert_eq!(event_loop.engine().control().state_of("swp2"), Some(AdminState::Down));
    assert!(elapsed < Duration::from_millis(500), "leaf down took {:?}", elapsed);
}
