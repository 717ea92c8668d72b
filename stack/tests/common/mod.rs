//! Shared fixtures: a frame-capturing driver, wire builders, and parsers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stack::ip::Checksum;
use stack::{IfaceId, Ipv4Config, LinkChange, LinkDriver, LinkSpeed, MacAddr, Protocol, Stack, TestClock, TxAncillary};

pub type FrameLog = Arc<Mutex<Vec<Vec<u8>>>>;

/// A driver that records every outgoing frame.
pub struct TestDriver {
	pub frames: FrameLog,
	pub mtu: usize,
}

impl TestDriver {
	pub fn new(mtu: usize) -> (Box<Self>, FrameLog) {
		let frames: FrameLog = Arc::new(Mutex::new(Vec::new()));
		(Box::new(Self { frames: frames.clone(), mtu }), frames)
	}
}

impl LinkDriver for TestDriver {
	fn send(&mut self, frame: &[u8], _tx: &TxAncillary) -> stack::Result {
		self.frames.lock().unwrap().push(frame.to_vec());
		Ok(())
	}

	fn mtu(&self) -> usize {
		self.mtu
	}
}

pub const HOST_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x10]);

pub fn link_up() -> LinkChange {
	LinkChange {
		up: true,
		speed: LinkSpeed::Mbps100,
		duplex: stack::Duplex::Full,
	}
}

/// Brings one configured interface up and waits out address-conflict detection.
pub fn add_ready_iface(stack: &Stack, clock: &TestClock, name: &str, mac: MacAddr, mtu: usize, cfg: Ipv4Config) -> (IfaceId, FrameLog) {
	let (driver, frames) = TestDriver::new(mtu);

	let id = stack.add_interface(name, mac, driver, None).unwrap();
	stack.link_change(id, link_up()).unwrap();
	stack.configure_ipv4(id, cfg).unwrap();

	settle(stack, clock, &[&frames]);

	(id, frames)
}

/// Runs the probe/claim schedule to completion and clears the captured frames.
pub fn settle(stack: &Stack, clock: &TestClock, logs: &[&FrameLog]) {
	for _ in 0..6 {
		stack.tick();
		clock.advance(Duration::from_millis(600));
	}

	stack.tick();

	for log in logs {
		log.lock().unwrap().clear();
	}
}

pub fn drain(log: &FrameLog) -> Vec<Vec<u8>> {
	std::mem::take(&mut *log.lock().unwrap())
}

/// Polls the capture log until a frame matches; for frames another thread emits.
pub fn wait_frame(log: &FrameLog, pred: impl Fn(&[u8]) -> bool) -> Vec<u8> {
	for _ in 0..500 {
		if let Some(f) = log.lock().unwrap().iter().find(|f| pred(f)) {
			return f.clone();
		}

		std::thread::sleep(Duration::from_millis(5));
	}

	panic!("expected frame never appeared");
}

// ── Builders ──

pub fn eth(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
	let mut f = Vec::with_capacity(14 + payload.len());
	f.extend_from_slice(&dst);
	f.extend_from_slice(&src);
	f.extend_from_slice(&ethertype.to_be_bytes());
	f.extend_from_slice(payload);
	f
}

pub fn arp_reply(sender_mac: [u8; 6], sender_ip: [u8; 4], target_mac: [u8; 6], target_ip: [u8; 4]) -> Vec<u8> {
	let mut p = Vec::with_capacity(28);
	p.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4, 0, 2]);
	p.extend_from_slice(&sender_mac);
	p.extend_from_slice(&sender_ip);
	p.extend_from_slice(&target_mac);
	p.extend_from_slice(&target_ip);
	p
}

/// An IPv4 datagram with a correct header checksum and default fragment fields.
pub fn ipv4(src: [u8; 4], dst: [u8; 4], proto: u8, ttl: u8, transport: &[u8]) -> Vec<u8> {
	ipv4_frag(src, dst, proto, ttl, 0, 0, false, transport)
}

#[allow(clippy::too_many_arguments)]
pub fn ipv4_frag(src: [u8; 4], dst: [u8; 4], proto: u8, ttl: u8, ident: u16, offset_units: u16, more: bool, transport: &[u8]) -> Vec<u8> {
	let mut p = vec![0u8; 20];
	p[0] = 0x45;
	p[2..4].copy_from_slice(&((20 + transport.len()) as u16).to_be_bytes());
	p[4..6].copy_from_slice(&ident.to_be_bytes());

	let frag = offset_units | if more { 0x2000 } else { 0 };
	p[6..8].copy_from_slice(&frag.to_be_bytes());

	p[8] = ttl;
	p[9] = proto;
	p[12..16].copy_from_slice(&src);
	p[16..20].copy_from_slice(&dst);

	let csum = Checksum::of(&p).end();
	p[10..12].copy_from_slice(&csum);

	p.extend_from_slice(transport);
	p
}

pub fn udp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, data: &[u8]) -> Vec<u8> {
	let len = (8 + data.len()) as u16;

	let mut p = Vec::with_capacity(len as usize);
	p.extend_from_slice(&sport.to_be_bytes());
	p.extend_from_slice(&dport.to_be_bytes());
	p.extend_from_slice(&len.to_be_bytes());
	p.extend_from_slice(&[0, 0]);
	p.extend_from_slice(data);

	let mut csum = Checksum::pseudo(src.into(), dst.into(), Protocol::Udp, len);
	csum.push(&p);
	let sum = csum.end();
	p[6..8].copy_from_slice(&if sum == [0, 0] { [0xff, 0xff] } else { sum });

	p
}

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

/// A TCP segment without options, checksummed.
pub fn tcp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, seq: u32, ack: u32, flags: u8, win: u16, data: &[u8]) -> Vec<u8> {
	let mut p = vec![0u8; 20];
	p[0..2].copy_from_slice(&sport.to_be_bytes());
	p[2..4].copy_from_slice(&dport.to_be_bytes());
	p[4..8].copy_from_slice(&seq.to_be_bytes());
	p[8..12].copy_from_slice(&ack.to_be_bytes());
	p[12] = 5 << 4;
	p[13] = flags;
	p[14..16].copy_from_slice(&win.to_be_bytes());
	p.extend_from_slice(data);

	let mut csum = Checksum::pseudo(src.into(), dst.into(), Protocol::Tcp, p.len() as u16);
	csum.push(&p);
	let sum = csum.end();
	p[16..18].copy_from_slice(&sum);

	p
}

pub fn icmp_echo(kind: u8, id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
	let mut p = vec![0u8; 8];
	p[0] = kind;
	p[4..6].copy_from_slice(&id.to_be_bytes());
	p[6..8].copy_from_slice(&seq.to_be_bytes());
	p.extend_from_slice(data);

	let sum = Checksum::of(&p).end();
	p[2..4].copy_from_slice(&sum);

	p
}

// ── Parsers (offsets into a captured Ethernet frame) ──

pub fn eth_type(f: &[u8]) -> u16 {
	u16::from_be_bytes([f[12], f[13]])
}

pub fn eth_dst(f: &[u8]) -> [u8; 6] {
	f[0..6].try_into().unwrap()
}

pub fn ip(f: &[u8]) -> &[u8] {
	&f[14..]
}

pub fn ip_proto(f: &[u8]) -> u8 {
	ip(f)[9]
}

pub fn ip_src(f: &[u8]) -> [u8; 4] {
	ip(f)[12..16].try_into().unwrap()
}

pub fn ip_dst(f: &[u8]) -> [u8; 4] {
	ip(f)[16..20].try_into().unwrap()
}

pub fn ip_total(f: &[u8]) -> u16 {
	u16::from_be_bytes([ip(f)[2], ip(f)[3]])
}

pub fn ip_ident(f: &[u8]) -> u16 {
	u16::from_be_bytes([ip(f)[4], ip(f)[5]])
}

/// (more-fragments, offset in 8-byte units)
pub fn ip_frag(f: &[u8]) -> (bool, u16) {
	let w = u16::from_be_bytes([ip(f)[6], ip(f)[7]]);
	(w & 0x2000 != 0, w & 0x1fff)
}

pub fn ip_header_valid(f: &[u8]) -> bool {
	Checksum::of(&ip(f)[..20]).end() == [0, 0]
}

/// The transport bytes of a captured frame (assumes a 20-byte IP header).
pub fn transport(f: &[u8]) -> &[u8] {
	let total = ip_total(f) as usize;
	&ip(f)[20..total]
}

pub fn tcp_sport(f: &[u8]) -> u16 {
	u16::from_be_bytes([transport(f)[0], transport(f)[1]])
}

pub fn tcp_dport(f: &[u8]) -> u16 {
	u16::from_be_bytes([transport(f)[2], transport(f)[3]])
}

pub fn tcp_seq(f: &[u8]) -> u32 {
	u32::from_be_bytes(transport(f)[4..8].try_into().unwrap())
}

pub fn tcp_ack(f: &[u8]) -> u32 {
	u32::from_be_bytes(transport(f)[8..12].try_into().unwrap())
}

pub fn tcp_flags(f: &[u8]) -> u8 {
	transport(f)[13] & 0x3f
}

pub fn tcp_data(f: &[u8]) -> &[u8] {
	let t = transport(f);
	let off = (t[12] >> 4) as usize * 4;
	&t[off..]
}

/// A stack on a virtual clock with a deterministic sequence-number source.
pub fn stack_on(clock: Arc<TestClock>, tcp: stack::TcpPolicy) -> Stack {
	Stack::builder().clock(clock).seed(0xfeed).tcp_policy(tcp).build()
}

pub fn now_clock() -> Arc<TestClock> {
	Arc::new(TestClock::new())
}
