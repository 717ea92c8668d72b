//! Address lifecycle and link transitions.

mod common;

use std::time::Duration;

use common::*;
use stack::{Ipv4Config, LinkChange, LinkSpeed, SocketAddr};

const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x33];
const HOST_IP: [u8; 4] = [192, 168, 1, 10];
const PEER_IP: [u8; 4] = [192, 168, 1, 20];

#[test]
fn tentative_address_accepts_nothing() {
	let clock = now_clock();
	let stack = stack_on(clock.clone(), Default::default());

	let (driver, frames) = TestDriver::new(1500);
	let id = stack.add_interface("eth0", HOST_MAC, driver, None).unwrap();
	stack.link_change(id, link_up()).unwrap();
	stack.configure_ipv4(
		id,
		Ipv4Config {
			addr: HOST_IP.into(),
			mask: [255, 255, 255, 0].into(),
			gateway: None,
		},
	)
	.unwrap();

	// Probing has begun but the address is still tentative.
	stack.tick();
	drain(&frames);

	let sock = stack.udp_bind(7).unwrap();

	let dgram = udp(PEER_IP, HOST_IP, 9, 7, b"early");
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0800, &ipv4(PEER_IP, HOST_IP, 17, 64, &dgram))).unwrap();

	// Silently dropped: no delivery, not even a port-unreachable.
	let mut buf = [0u8; 16];
	assert!(sock.recv_from(&mut buf, Some(Duration::ZERO)).is_err());
	assert!(drain(&frames).is_empty());
}

#[test]
fn conflicting_claim_blocks_the_address() {
	let clock = now_clock();
	let stack = stack_on(clock.clone(), Default::default());

	let (driver, frames) = TestDriver::new(1500);
	let id = stack.add_interface("eth0", HOST_MAC, driver, None).unwrap();
	stack.link_change(id, link_up()).unwrap();
	stack.configure_ipv4(
		id,
		Ipv4Config {
			addr: HOST_IP.into(),
			mask: [255, 255, 255, 0].into(),
			gateway: None,
		},
	)
	.unwrap();

	stack.tick();

	// Another station defends the address we are probing for.
	let mut claim = Vec::new();
	claim.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4, 0, 2]);
	claim.extend_from_slice(&PEER_MAC);
	claim.extend_from_slice(&HOST_IP);
	claim.extend_from_slice(&HOST_MAC.0);
	claim.extend_from_slice(&HOST_IP);

	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0806, &claim)).unwrap();

	settle(&stack, &clock, &[&frames]);

	// The address never becomes usable: sourcing from it fails.
	assert!(stack.ping(PEER_IP.into(), 1, 1, b"x", Some(Duration::ZERO)).is_err());
}

#[test]
fn link_down_flushes_resolution_state() {
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

	// Park a datagram behind a resolution.
	let sock = stack.udp_bind(0).unwrap();
	sock.send_to(SocketAddr::new(PEER_IP.into(), 7), b"parked").unwrap();
	drain(&frames);

	stack.link_change(
		id,
		LinkChange {
			up: false,
			speed: LinkSpeed::Unknown,
			duplex: stack::Duplex::Unknown,
		},
	)
	.unwrap();

	// The queue died with the cache: a late reply releases nothing.
	stack.link_change(id, link_up()).unwrap();

	let reply = arp_reply(PEER_MAC, PEER_IP, HOST_MAC.0, HOST_IP);
	stack.input(id, &eth(HOST_MAC.0, PEER_MAC, 0x0806, &reply)).unwrap();

	assert!(drain(&frames).iter().all(|f| eth_type(f) != 0x0800));
}

#[test]
fn link_change_hook_fires() {
	let clock = now_clock();
	let stack = stack_on(clock.clone(), Default::default());

	let (driver, _frames) = TestDriver::new(1500);
	let id = stack.add_interface("eth0", HOST_MAC, driver, None).unwrap();

	let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
	let log = seen.clone();

	stack.on_link_change(move |iface, up| log.lock().unwrap().push((iface, up)));

	stack.link_change(id, link_up()).unwrap();
	stack.link_change(
		id,
		LinkChange {
			up: false,
			speed: LinkSpeed::Unknown,
			duplex: stack::Duplex::Unknown,
		},
	)
	.unwrap();

	assert_eq!(*seen.lock().unwrap(), [(id, true), (id, false)]);
}
