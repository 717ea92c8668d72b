//! Active open: the client side of the handshake, option announcement, and
//! the blocking connect call.

mod common;

use std::time::Duration;

use common::*;
use stack::{Ipv4Config, MacAddr, TcpState};

const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x20];
const HOST_IP: [u8; 4] = [192, 168, 1, 10];
const PEER_IP: [u8; 4] = [192, 168, 1, 20];

fn host() -> (stack::Stack, stack::IfaceId, FrameLog, std::sync::Arc<stack::TestClock>) {
	let clock = now_clock();
	let stack = stack_on(clock.clone(), Default::default());

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

/// MSS option value announced in a SYN, if present.
fn syn_mss(f: &[u8]) -> Option<u16> {
	let t = transport(f);
	let off = (t[12] >> 4) as usize * 4;
	let mut opts = &t[20..off];

	while let [kind, rest @ ..] = opts {
		match kind {
			0 => break,
			1 => opts = rest,
			2 if rest.len() >= 3 && rest[0] == 4 => return Some(u16::from_be_bytes([rest[1], rest[2]])),
			_ => {
				let len = *rest.first()? as usize;
				opts = opts.get(len..)?;
			}
		}
	}

	None
}

#[test]
fn connect_completes_on_syn_ack() {
	let (stack, id, frames, _clock) = host();

	let dialer = stack.clone();
	let user = std::thread::spawn(move || {
		dialer.tcp_connect(stack::SocketAddr::new(PEER_IP.into(), 80), Some(Duration::from_secs(5)))
	});

	// The SYN carries our MSS, derived from the link MTU.
	let syn = wait_frame(&frames, |f| eth_type(f) == 0x0800 && ip_proto(f) == 6);

	assert_eq!(tcp_flags(&syn) & SYN, SYN);
	assert_eq!(tcp_flags(&syn) & ACK, 0);
	assert_eq!(tcp_dport(&syn), 80);
	assert_eq!(syn_mss(&syn), Some(1460));

	let iss = tcp_seq(&syn);
	let sport = tcp_sport(&syn);
	assert!(sport >= 49152);

	// SYN+ACK back; the ACK completes the handshake and wakes the caller.
	let synack = tcp(PEER_IP, HOST_IP, 80, sport, 9000, iss.wrapping_add(1), SYN | ACK, 4096, &[]);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 6, 64, &synack))).unwrap();

	let sock = user.join().unwrap().unwrap();
	assert_eq!(sock.state().unwrap(), TcpState::Established);

	let ack = wait_frame(&frames, |f| ip_proto(f) == 6 && tcp_flags(f) == ACK);
	assert_eq!(tcp_ack(&ack), 9001);
	assert_eq!(tcp_seq(&ack), iss.wrapping_add(1));
}

#[test]
fn connect_times_out_without_a_peer() {
	let (stack, id, frames, _clock) = host();

	let err = stack
		.tcp_connect(stack::SocketAddr::new(PEER_IP.into(), 80), Some(Duration::from_millis(50)))
		.unwrap_err();

	assert_eq!(err, stack::Error::Timeout);

	// The attempt is gone: a late SYN+ACK meets a reset, not a connection.
	let syn = drain(&frames).into_iter().find(|f| ip_proto(f) == 6).expect("SYN");
	let (iss, sport) = (tcp_seq(&syn), tcp_sport(&syn));

	let late = tcp(PEER_IP, HOST_IP, 80, sport, 9000, iss.wrapping_add(1), SYN | ACK, 4096, &[]);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 6, 64, &late))).unwrap();

	let rst = drain(&frames).into_iter().find(|f| ip_proto(f) == 6).expect("RST");
	assert!(tcp_flags(&rst) & RST != 0);
	assert_eq!(tcp_seq(&rst), iss.wrapping_add(1));
}

#[test]
fn nagle_holds_small_writes_while_data_is_in_flight() {
	let (stack, id, frames, _clock) = host();

	let dialer = stack.clone();
	let user = std::thread::spawn(move || {
		dialer.tcp_connect(stack::SocketAddr::new(PEER_IP.into(), 80), Some(Duration::from_secs(5)))
	});

	let syn = wait_frame(&frames, |f| eth_type(f) == 0x0800 && ip_proto(f) == 6);
	let iss = tcp_seq(&syn);
	let sport = tcp_sport(&syn);

	let synack = tcp(PEER_IP, HOST_IP, 80, sport, 9000, iss.wrapping_add(1), SYN | ACK, 4096, &[]);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 6, 64, &synack))).unwrap();

	let sock = user.join().unwrap().unwrap();
	drain(&frames);

	// First small write goes straight out.
	sock.send(b"aa", Some(Duration::ZERO)).unwrap();

	// The second waits behind the unacknowledged first.
	sock.send(b"bb", Some(Duration::ZERO)).unwrap();

	let sent: Vec<_> = drain(&frames).into_iter().filter(|f| ip_proto(f) == 6 && !tcp_data(f).is_empty()).collect();
	assert_eq!(sent.len(), 1);
	assert_eq!(tcp_data(&sent[0]), b"aa");

	// The ACK releases the coalesced remainder.
	let ack = tcp(PEER_IP, HOST_IP, 80, sport, 9001, iss.wrapping_add(3), ACK, 4096, &[]);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 6, 64, &ack))).unwrap();

	let sent: Vec<_> = drain(&frames).into_iter().filter(|f| ip_proto(f) == 6 && !tcp_data(f).is_empty()).collect();
	assert_eq!(sent.len(), 1);
	assert_eq!(tcp_data(&sent[0]), b"bb");
}
