//! ARP resolution followed by an ICMP echo exchange, end to end.

mod common;

use std::time::Duration;

use common::*;
use stack::ip::Checksum;
use stack::Ipv4Config;

const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x20];
const HOST_IP: [u8; 4] = [192, 168, 1, 10];
const PEER_IP: [u8; 4] = [192, 168, 1, 20];

#[test]
fn arp_resolve_then_ping() {
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
			gateway: Some([192, 168, 1, 1].into()),
		},
	);

	// A user blocks in ping while the stack resolves and transmits.
	let pinger = stack.clone();
	let user = std::thread::spawn(move || pinger.ping(PEER_IP.into(), 0x1234, 1, &[b'A'; 32], Some(Duration::from_secs(5))));

	// First on the wire: exactly one ARP request for the peer.
	let req = wait_frame(&frames, |f| eth_type(f) == 0x0806);
	assert_eq!(&req[14..22], &[0, 1, 0x08, 0x00, 6, 4, 0, 1]);
	assert_eq!(&req[38..42], &PEER_IP);
	assert_eq!(drain(&frames).iter().filter(|f| eth_type(f) == 0x0806).count(), 1);

	// The reply releases the queued echo request.
	let reply = arp_reply(PEER_MAC, PEER_IP, HOST_MAC.0, HOST_IP);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0806, &reply)).unwrap();

	let echo = wait_frame(&frames, |f| eth_type(f) == 0x0800 && ip_proto(f) == 1);

	assert_eq!(eth_dst(&echo), PEER_MAC);
	assert_eq!(ip_src(&echo), HOST_IP);
	assert_eq!(ip_dst(&echo), PEER_IP);
	assert!(ip_header_valid(&echo));

	let msg = transport(&echo);
	assert_eq!(msg[0], 8);
	assert_eq!(Checksum::of(msg).end(), [0, 0]);
	assert_eq!(&msg[4..8], &[0x12, 0x34, 0x00, 0x01]);
	assert_eq!(&msg[8..], &[b'A'; 32]);

	// The echo reply wakes the blocked user with the payload length.
	let pong = icmp_echo(0, 0x1234, 1, &[b'A'; 32]);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 1, 64, &pong))).unwrap();

	assert_eq!(user.join().unwrap().unwrap(), 32);
}

#[test]
fn echo_requests_are_answered() {
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

	stack.arp_add_static(id, PEER_IP.into(), stack::MacAddr(PEER_MAC)).unwrap();

	let ping = icmp_echo(8, 7, 3, b"payload");
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 1, 64, &ping))).unwrap();

	let reply = wait_frame(&frames, |f| eth_type(f) == 0x0800 && ip_proto(f) == 1);

	// Identifier, sequence, and payload come back unchanged; source is the
	// unicast that was pinged.
	assert_eq!(ip_src(&reply), HOST_IP);
	assert_eq!(ip_dst(&reply), PEER_IP);

	let msg = transport(&reply);
	assert_eq!(msg[0], 0);
	assert_eq!(Checksum::of(msg).end(), [0, 0]);
	assert_eq!(&msg[4..6], &7u16.to_be_bytes());
	assert_eq!(&msg[6..8], &3u16.to_be_bytes());
	assert_eq!(&msg[8..], b"payload");
}

#[test]
fn unknown_protocol_gets_icmp_unreachable() {
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

	stack.arp_add_static(id, PEER_IP.into(), stack::MacAddr(PEER_MAC)).unwrap();

	// Protocol 200 has no handler and no raw tap.
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 200, 64, &[1, 2, 3, 4, 5, 6, 7, 8]))).unwrap();

	let err = wait_frame(&frames, |f| eth_type(f) == 0x0800 && ip_proto(f) == 1);
	let msg = transport(&err);

	// Destination unreachable, protocol unreachable, invoking header included.
	assert_eq!(msg[0], 3);
	assert_eq!(msg[1], 2);
	assert_eq!(msg[8], 0x45);
	assert_eq!(&msg[8 + 12..8 + 16], &PEER_IP);
}
