//! Retransmission backoff under loss and fast retransmit on duplicate ACKs.

mod common;

use std::time::Duration;

use common::*;
use stack::{Ipv4Config, MacAddr, TcpPolicy, TcpSocket, TcpState};

const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x20];
const HOST_IP: [u8; 4] = [192, 168, 1, 10];
const PEER_IP: [u8; 4] = [192, 168, 1, 20];

fn policy() -> TcpPolicy {
	TcpPolicy {
		rto_initial: Duration::from_millis(200),
		rto_min: Duration::from_millis(200),
		..TcpPolicy::default()
	}
}

struct Rig {
	stack: stack::Stack,
	id: stack::IfaceId,
	frames: FrameLog,
	clock: std::sync::Arc<stack::TestClock>,
}

fn inject(rig: &Rig, seq: u32, ack: u32, flags: u8, data: &[u8]) {
	let seg = tcp(PEER_IP, HOST_IP, 5000, 80, seq, ack, flags, 4096, data);
	rig.stack.input(rig.id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 6, 64, &seg))).unwrap();
}

/// A server-side connection driven entirely by injected frames.
fn establish() -> (Rig, TcpSocket, u32) {
	let clock = now_clock();
	let stack = stack_on(clock.clone(), policy());

	let (id, frames) = add_ready_iface(
		&stack,
		&clock,
		"eth0",
		HOST_MAC,
		1500,
		Ipv4Config {
			addr: HOST_IP.into(),
			mask: [255, 255, 255, 0].into(),
			gateway: None,
		},
	);

	stack.arp_add_static(id, PEER_IP.into(), MacAddr(PEER_MAC)).unwrap();

	let listener = stack.tcp_listen([0, 0, 0, 0].into(), 80, 8).unwrap();

	let rig = Rig { stack, id, frames, clock };

	inject(&rig, 1000, 0, SYN, &[]);

	let synack = drain(&rig.frames).into_iter().find(|f| ip_proto(f) == 6).expect("SYN+ACK");
	let iss = tcp_seq(&synack);

	inject(&rig, 1001, iss.wrapping_add(1), ACK, &[]);

	let sock = listener.accept(Some(Duration::ZERO)).unwrap();
	assert_eq!(sock.state().unwrap(), TcpState::Established);

	(rig, sock, iss)
}

fn data_frames(frames: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
	frames.into_iter().filter(|f| ip_proto(f) == 6 && !tcp_data(f).is_empty()).collect()
}

#[test]
fn backoff_doubles_under_loss() {
	let (rig, sock, iss) = establish();

	sock.send(b"hello", Some(Duration::ZERO)).unwrap();

	let sent = data_frames(drain(&rig.frames));
	assert_eq!(sent.len(), 1);
	assert_eq!(tcp_seq(&sent[0]), iss.wrapping_add(1));
	assert_eq!(tcp_data(&sent[0]), b"hello");

	// The peer stays silent; the timer fires at 200, then 400, then 800 ms.
	let mut observed = Vec::new();
	let mut elapsed = Duration::ZERO;

	for _ in 0..15 {
		rig.clock.advance(Duration::from_millis(100));
		elapsed += Duration::from_millis(100);
		rig.stack.tick();

		for f in data_frames(drain(&rig.frames)) {
			assert_eq!(tcp_seq(&f), iss.wrapping_add(1));
			assert_eq!(tcp_data(&f), b"hello");
			observed.push(elapsed);
		}
	}

	assert_eq!(
		observed,
		[Duration::from_millis(200), Duration::from_millis(600), Duration::from_millis(1400)]
	);
}

#[test]
fn triple_duplicate_ack_fast_retransmits() {
	let (rig, sock, iss) = establish();

	sock.send(b"hello", Some(Duration::ZERO)).unwrap();
	assert_eq!(data_frames(drain(&rig.frames)).len(), 1);

	// Two duplicates are not enough.
	inject(&rig, 1001, iss.wrapping_add(1), ACK, &[]);
	inject(&rig, 1001, iss.wrapping_add(1), ACK, &[]);
	assert!(data_frames(drain(&rig.frames)).is_empty());

	// The third triggers the retransmission with no timer involved.
	inject(&rig, 1001, iss.wrapping_add(1), ACK, &[]);

	let fast = data_frames(drain(&rig.frames));
	assert_eq!(fast.len(), 1);
	assert_eq!(tcp_seq(&fast[0]), iss.wrapping_add(1));
	assert_eq!(tcp_data(&fast[0]), b"hello");
}

#[test]
fn ack_stops_the_timer_and_frees_the_ring() {
	let (rig, sock, iss) = establish();

	sock.send(b"hello", Some(Duration::ZERO)).unwrap();
	drain(&rig.frames);

	// The peer acknowledges everything.
	inject(&rig, 1001, iss.wrapping_add(6), ACK, &[]);

	// No retransmission ever comes.
	for _ in 0..10 {
		rig.clock.advance(Duration::from_millis(200));
		rig.stack.tick();
	}

	assert!(data_frames(drain(&rig.frames)).is_empty());
}

#[test]
fn zero_window_engages_one_byte_probes() {
	let (rig, sock, iss) = establish();

	// The peer closes its window entirely.
	let seg = tcp(PEER_IP, HOST_IP, 5000, 80, 1001, iss.wrapping_add(1), ACK, 0, &[]);
	rig.stack.input(rig.id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 6, 64, &seg))).unwrap();

	sock.send(b"stuck", Some(Duration::ZERO)).unwrap();

	// Nothing moves immediately.
	assert!(data_frames(drain(&rig.frames)).is_empty());

	// The persist timer sends a probe of exactly one byte.
	rig.clock.advance(Duration::from_millis(600));
	rig.stack.tick();

	let probes = data_frames(drain(&rig.frames));
	assert_eq!(probes.len(), 1);
	assert_eq!(tcp_data(&probes[0]), b"s");
}

#[test]
fn retransmission_exhaustion_kills_the_connection() {
	let (rig, sock, _iss) = establish();

	sock.send(b"hello", Some(Duration::ZERO)).unwrap();
	drain(&rig.frames);

	// Way past R2 doublings with no acknowledgment in sight.
	for _ in 0..400 {
		rig.clock.advance(Duration::from_millis(500));
		rig.stack.tick();
	}

	let mut buf = [0u8; 4];
	assert_eq!(sock.recv(&mut buf, Some(Duration::ZERO)).unwrap_err(), stack::Error::Timeout);
}
