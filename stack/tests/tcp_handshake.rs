//! Passive open, three-way handshake, data transfer, and the orderly close
//! through TimeWait.

mod common;

use std::time::Duration;

use common::*;
use stack::{Ipv4Config, MacAddr, TcpPolicy, TcpState};

const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x20];
const HOST_IP: [u8; 4] = [192, 168, 1, 10];
const PEER_IP: [u8; 4] = [192, 168, 1, 20];

fn policy() -> TcpPolicy {
	TcpPolicy {
		msl: Duration::from_millis(500),
		..TcpPolicy::default()
	}
}

fn host(policy: TcpPolicy) -> (stack::Stack, stack::IfaceId, FrameLog, std::sync::Arc<stack::TestClock>) {
	let clock = now_clock();
	let stack = stack_on(clock.clone(), policy);

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

	(stack, id, frames, clock)
}

fn inject_tcp(stack: &stack::Stack, id: stack::IfaceId, seq: u32, ack: u32, flags: u8, data: &[u8]) {
	let seg = tcp(PEER_IP, HOST_IP, 5000, 80, seq, ack, flags, 4096, data);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 6, 64, &seg))).unwrap();
}

#[test]
fn handshake_and_orderly_close() {
	let (stack, id, frames, clock) = host(policy());

	let listener = stack.tcp_listen([0, 0, 0, 0].into(), 80, 8).unwrap();

	// SYN in: the child answers SYN+ACK with its own ISS.
	inject_tcp(&stack, id, 1000, 0, SYN, &[]);

	let synack = drain(&frames)
		.into_iter()
		.find(|f| ip_proto(f) == 6 && tcp_flags(f) == SYN | ACK)
		.expect("SYN+ACK");

	assert_eq!(tcp_sport(&synack), 80);
	assert_eq!(tcp_dport(&synack), 5000);
	assert_eq!(tcp_ack(&synack), 1001);

	let iss = tcp_seq(&synack);

	// Nothing to accept until the handshake completes.
	assert!(listener.accept(Some(Duration::ZERO)).is_err());

	// ACK of the SYN+ACK promotes the child.
	inject_tcp(&stack, id, 1001, iss.wrapping_add(1), ACK, &[]);

	let sock = listener.accept(Some(Duration::ZERO)).unwrap();
	assert_eq!(sock.state().unwrap(), TcpState::Established);

	// Data flows to the user in order.
	inject_tcp(&stack, id, 1001, iss.wrapping_add(1), ACK | PSH, b"hello");

	let mut buf = [0u8; 16];
	assert_eq!(sock.recv(&mut buf, Some(Duration::ZERO)).unwrap(), 5);
	assert_eq!(&buf[..5], b"hello");

	// Orderly close: our FIN takes the next sequence number.
	drain(&frames);
	sock.close().unwrap();

	let fin = drain(&frames)
		.into_iter()
		.find(|f| ip_proto(f) == 6 && tcp_flags(f) & FIN != 0)
		.expect("FIN");

	assert_eq!(tcp_seq(&fin), iss.wrapping_add(1));
	assert_eq!(sock.state().unwrap(), TcpState::FinWait1);

	// Peer acknowledges our FIN and closes too.
	inject_tcp(&stack, id, 1006, iss.wrapping_add(2), ACK | FIN, &[]);

	assert_eq!(sock.state().unwrap(), TcpState::TimeWait);

	// Their FIN got acknowledged.
	let last_ack = drain(&frames)
		.into_iter()
		.find(|f| ip_proto(f) == 6 && tcp_flags(f) == ACK)
		.expect("final ACK");
	assert_eq!(tcp_ack(&last_ack), 1007);

	// TimeWait lingers for twice the MSL, then the socket is destroyed.
	clock.advance(Duration::from_millis(400));
	stack.tick();
	assert_eq!(sock.state().unwrap(), TcpState::TimeWait);

	clock.advance(Duration::from_millis(700));
	stack.tick();
	assert!(sock.state().is_err());
}

#[test]
fn out_of_order_segments_coalesce() {
	let (stack, id, frames, _clock) = host(policy());

	let listener = stack.tcp_listen([0, 0, 0, 0].into(), 80, 8).unwrap();

	inject_tcp(&stack, id, 1000, 0, SYN, &[]);
	let synack = drain(&frames).into_iter().find(|f| ip_proto(f) == 6).unwrap();
	let iss = tcp_seq(&synack);

	inject_tcp(&stack, id, 1001, iss.wrapping_add(1), ACK, &[]);
	let sock = listener.accept(Some(Duration::ZERO)).unwrap();

	// The second half arrives first and waits in the reassembly list.
	inject_tcp(&stack, id, 1006, iss.wrapping_add(1), ACK, b"world");

	let mut buf = [0u8; 16];
	assert!(sock.recv(&mut buf, Some(Duration::ZERO)).is_err());

	// The gap-filling ACK shows RCV.NXT unmoved.
	let dup = drain(&frames)
		.into_iter()
		.filter(|f| ip_proto(f) == 6)
		.last()
		.expect("duplicate ACK");
	assert_eq!(tcp_ack(&dup), 1001);

	// The missing head arrives; both halves surface in order.
	inject_tcp(&stack, id, 1001, iss.wrapping_add(1), ACK, b"hello");

	assert_eq!(sock.recv(&mut buf, Some(Duration::ZERO)).unwrap(), 10);
	assert_eq!(&buf[..10], b"helloworld");
}

#[test]
fn segment_at_window_edge_gets_duplicate_ack() {
	let (stack, id, frames, _clock) = host(policy());

	let listener = stack.tcp_listen([0, 0, 0, 0].into(), 80, 8).unwrap();

	inject_tcp(&stack, id, 1000, 0, SYN, &[]);
	let synack = drain(&frames).into_iter().find(|f| ip_proto(f) == 6).unwrap();
	let iss = tcp_seq(&synack);

	inject_tcp(&stack, id, 1001, iss.wrapping_add(1), ACK, &[]);
	let _sock = listener.accept(Some(Duration::ZERO)).unwrap();

	// The advertised window on the SYN+ACK bounds what the peer may send.
	let wnd = u16::from_be_bytes([transport(&synack)[14], transport(&synack)[15]]) as u32;

	// One byte exactly at RCV.NXT+RCV.WND is out of window.
	inject_tcp(&stack, id, 1001 + wnd, iss.wrapping_add(1), ACK, b"x");

	let dup = drain(&frames)
		.into_iter()
		.filter(|f| ip_proto(f) == 6)
		.last()
		.expect("duplicate ACK");

	assert_eq!(tcp_flags(&dup), ACK);
	assert_eq!(tcp_ack(&dup), 1001);
}

#[test]
fn reset_tears_down_and_latches() {
	let (stack, id, frames, _clock) = host(policy());

	let listener = stack.tcp_listen([0, 0, 0, 0].into(), 80, 8).unwrap();

	inject_tcp(&stack, id, 1000, 0, SYN, &[]);
	let synack = drain(&frames).into_iter().find(|f| ip_proto(f) == 6).unwrap();
	let iss = tcp_seq(&synack);

	inject_tcp(&stack, id, 1001, iss.wrapping_add(1), ACK, &[]);
	let sock = listener.accept(Some(Duration::ZERO)).unwrap();

	inject_tcp(&stack, id, 1001, iss.wrapping_add(1), RST | ACK, &[]);

	let mut buf = [0u8; 4];
	assert_eq!(sock.recv(&mut buf, Some(Duration::ZERO)).unwrap_err(), stack::Error::ResetByPeer);
	assert_eq!(sock.send(b"x", Some(Duration::ZERO)).unwrap_err(), stack::Error::ResetByPeer);
}

#[test]
fn stray_segment_is_reset() {
	let (stack, id, frames, _clock) = host(policy());

	// No listener at all: a SYN meets RST.
	inject_tcp(&stack, id, 1000, 0, SYN, &[]);

	let rst = drain(&frames)
		.into_iter()
		.find(|f| ip_proto(f) == 6)
		.expect("RST");

	assert!(tcp_flags(&rst) & RST != 0);
	// It acknowledges the SYN it refuses.
	assert_eq!(tcp_ack(&rst), 1001);
}
