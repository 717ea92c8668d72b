//! UDP: header handling, the bounded per-socket receive queues, and datagram
//! egress on behalf of the socket handles.

use core::mem::size_of;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use collections::bytes::NetBuf;
use hashbrown::HashMap;
use log::{debug, trace};
use slab::Slab;
use utils::bytes::Cast;
use utils::endian::u16be;
use utils::error::{Error, Result};

use crate::icmp;
use crate::ip::v4::{self, DestClass, Info, SendParams};
use crate::ip::{Checksum, Protocol, SocketAddr};
use crate::{Net, Shared};

/// First port of the ephemeral range.
const EPHEMERAL: u16 = 49152;
/// Datagrams parked per socket before the oldest is dropped.
const RX_QUEUE: usize = 16;

#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub src: u16be,
	pub dst: u16be,
	pub len: u16be,
	pub csum: [u8; 2],
}

pub(crate) struct Sock {
	pub port: u16,
	pub rx: VecDeque<(SocketAddr, Vec<u8>)>,
	/// Guards stale handles after the slot is reused.
	pub gen: u32,
}

pub(crate) struct Udp {
	pub socks: Slab<Sock>,
	pub ports: HashMap<u16, usize>,
	/// The port number of the last created ephemeral socket.
	pub next_eph: u16,
	next_gen: u32,
}

impl Default for Udp {
	fn default() -> Self {
		Self {
			socks: Slab::new(),
			ports: HashMap::new(),
			next_eph: EPHEMERAL,
			next_gen: 0,
		}
	}
}

impl Udp {
	/// Binds `port`, or an ephemeral one when `port` is zero.
	pub fn bind(&mut self, mut port: u16) -> Result<(usize, u32)> {
		if port == 0 {
			port = self.alloc_ephemeral()?;
		} else if self.ports.contains_key(&port) {
			return Err(Error::AlreadyConfigured);
		}

		self.next_gen += 1;
		let gen = self.next_gen;

		let idx = self.socks.insert(Sock { port, rx: VecDeque::new(), gen });
		self.ports.insert(port, idx);

		Ok((idx, gen))
	}

	fn alloc_ephemeral(&mut self) -> Result<u16> {
		for _ in 0..u16::MAX - EPHEMERAL {
			self.next_eph = self.next_eph.checked_add(1).unwrap_or(EPHEMERAL);

			if !self.ports.contains_key(&self.next_eph) {
				return Ok(self.next_eph);
			}
		}

		Err(Error::OutOfMemory)
	}

	pub fn get(&mut self, idx: usize, gen: u32) -> Result<&mut Sock> {
		match self.socks.get_mut(idx) {
			Some(sock) if sock.gen == gen => Ok(sock),
			_ => Err(Error::ConnectionClosed),
		}
	}

	pub fn close(&mut self, idx: usize, gen: u32) {
		if self.socks.get(idx).is_some_and(|s| s.gen == gen) {
			let sock = self.socks.remove(idx);
			self.ports.remove(&sock.port);
		}
	}
}

/// Handles one received datagram.
pub(crate) fn input(net: &mut Net, iface: usize, info: &Info, pkt: NetBuf, now: Instant) {
	let len = pkt.len() - info.hlen;

	if len < size_of::<Header>() {
		return debug!("udp: truncated header");
	}

	let mut head = [0u8; size_of::<Header>()];
	pkt.read(info.hlen, &mut head);
	let header = utils::bytes::cast::<Header, _>(&head[..]);

	if header.len.get() as usize != len {
		return debug!("udp: length field does not match datagram");
	}

	// An all-zero checksum means the sender did not compute one.
	if header.csum != [0, 0] {
		let mut csum = Checksum::pseudo(info.src, info.dst, Protocol::Udp, len as u16);
		csum.push_buf(&pkt, info.hlen, len);

		if csum.end() != [0, 0] {
			return debug!("udp: bad checksum");
		}
	}

	let dst = header.dst.get();

	let Some(&idx) = net.udp.ports.get(&dst) else {
		trace!("udp: no socket on port {dst}");

		if info.class == DestClass::Unicast {
			icmp::emit_port_unreachable(&mut net.ifaces[iface], info, &pkt, now);
		}

		return;
	};

	let mut data = vec![0; len - size_of::<Header>()];
	pkt.read(info.hlen + size_of::<Header>(), &mut data);

	let from = SocketAddr::new(info.src, header.src.get());

	let rx = &mut net.udp.socks[idx].rx;

	if rx.len() == RX_QUEUE {
		rx.pop_front();
	}

	rx.push_back((from, data));
}

/// A bound UDP endpoint.
pub struct UdpSocket {
	shared: Arc<Shared>,
	idx: usize,
	gen: u32,
}

impl UdpSocket {
	pub(crate) fn new(shared: Arc<Shared>, idx: usize, gen: u32) -> Self {
		Self { shared, idx, gen }
	}

	pub fn local_port(&self) -> Result<u16> {
		let mut net = self.shared.net.lock().unwrap();
		net.udp.get(self.idx, self.gen).map(|s| s.port)
	}

	pub fn send_to(&self, dst: SocketAddr, data: &[u8]) -> Result {
		let now = self.shared.clock.now();
		let mut net = self.shared.net.lock().unwrap();

		let result = send(&mut net, self.idx, self.gen, dst, data, now);

		drop(net);
		self.shared.wake.notify_all();
		result
	}

	/// Receives one datagram, blocking up to `timeout`.
	pub fn recv_from(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<(usize, SocketAddr)> {
		self.shared.block_on(timeout, |net: &mut Net, _now| {
			let sock = match net.udp.get(self.idx, self.gen) {
				Ok(sock) => sock,
				Err(err) => return Some(Err(err)),
			};

			let (from, data) = sock.rx.pop_front()?;

			let n = data.len().min(buf.len());
			buf[..n].copy_from_slice(&data[..n]);

			Some(Ok((n, from)))
		})
	}

	pub fn close(&self) {
		let mut net = self.shared.net.lock().unwrap();
		net.udp.close(self.idx, self.gen);
	}
}

impl Drop for UdpSocket {
	fn drop(&mut self) {
		if let Ok(mut net) = self.shared.net.lock() {
			net.udp.close(self.idx, self.gen);
		}
	}
}

/// Sends one datagram from a bound socket.
pub(crate) fn send(net: &mut Net, idx: usize, gen: u32, dst: SocketAddr, data: &[u8], now: Instant) -> Result {
	let sport = net.udp.get(idx, gen)?.port;

	let ifidx = v4::route(&net.ifaces, dst.addr)?;
	let ifc = &mut net.ifaces[ifidx];

	let src = ifc.source_for(dst.addr).ok_or(Error::NoRoute)?;

	let len = (size_of::<Header>() + data.len()) as u16;

	let mut buf = NetBuf::alloc(crate::HEADROOM);
	buf.extend_from_slice(data);

	let header: &mut Header = buf.prepend_obj()?;
	header.src = sport.into();
	header.dst = dst.port.into();
	header.len = len.into();

	let mut csum = Checksum::pseudo(src, dst.addr, Protocol::Udp, len);
	csum.push_buf(&buf, 0, buf.len());
	let sum = csum.end();

	if let Some(header) = buf.obj_mut::<Header>(0) {
		// A computed zero is transmitted as all-ones; zero means "no checksum".
		header.csum = if sum == [0, 0] { [0xff, 0xff] } else { sum };
	}

	let params = SendParams::new(src, dst.addr, Protocol::Udp);

	match v4::output(ifc, &params, buf, now) {
		Ok(()) | Err(Error::InProgress) => Ok(()),
		Err(err) => Err(err),
	}
}
