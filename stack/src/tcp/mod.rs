//! TCP: segment format, demultiplexing, and the socket table.
//!
//! The connection machinery is split across the submodules: `tcb` holds the
//! per-connection state, `input` the segment-arrival processing, `output` the
//! transmission engine, `socket` the blocking user API.

use core::mem::size_of;
use core::net::Ipv4Addr;
use std::time::Instant;

use bilge::prelude::*;
use collections::bytes::NetBuf;
use hashbrown::HashMap;
use log::{debug, trace};
use slab::Slab;
use utils::bytes::Cast;
use utils::endian::{b, u16be, u32be};
use utils::error::{Error, Result};

use crate::ip::v4::{DestClass, Info};
use crate::ip::{Checksum, Protocol};
use crate::Net;

pub(crate) mod input;
pub(crate) mod output;
pub(crate) mod socket;
pub(crate) mod tcb;

pub use socket::{TcpListener, TcpSocket};
pub use tcb::{State, TcpPolicy};

use tcb::Tcb;

/// First port of the ephemeral range.
const EPHEMERAL: u16 = 49152;

#[bitsize(16)]
#[derive(Clone, Copy, FromBits)]
pub struct Control {
	/// No more data from sender.
	pub fin: bool,
	/// Synchronize sequence numbers.
	pub syn: bool,
	/// Reset the connection.
	pub rst: bool,
	/// Push function.
	pub psh: bool,
	/// Acknowledgment field is significant.
	pub ack: bool,
	/// Urgent pointer field is significant.
	pub urg: bool,
	/// ECN-Echo.
	pub ece: bool,
	/// Congestion Window Reduced.
	pub cwr: bool,
	/// Reserved for future use; zero in generated segments, ignored on receive.
	pub reserved: u4,
	/// The number of 32-bit words in the TCP header, options included.
	pub off: u4,
}

#[derive(Cast)]
#[repr(C)]
pub struct Header {
	/// The source port number.
	pub src: u16be,
	/// The destination port number.
	pub dst: u16be,
	/// The sequence number of the first data octet in this segment (except when
	/// the SYN flag is set, in which case it is the initial sequence number).
	pub seq: u32be,
	/// If the ACK control bit is set, the next sequence number the sender of the
	/// segment is expecting to receive.
	pub ack: u32be,
	/// The control bits, also known as "flags".
	pub ctl: b<Control>,
	/// The number of data octets the sender of this segment is willing to
	/// accept, counted from the acknowledgment field. Shifted when window
	/// scaling is in effect.
	pub win: u16be,
	/// The 16-bit ones' complement of the ones' complement sum of pseudo-header,
	/// header, and text.
	pub csm: [u8; 2],
	/// The current urgent pointer as a positive offset from the sequence number
	/// of this segment; only meaningful with the URG control bit.
	pub urg: u16be,
}

pub const HEADER_LEN: usize = size_of::<Header>();

/// TCP option kinds recognized on receive.
mod opt {
	pub const EOL: u8 = 0;
	pub const NOP: u8 = 1;
	pub const MSS: u8 = 2;
	pub const WSCALE: u8 = 3;
	pub const SACK_PERMITTED: u8 = 4;
	pub const TIMESTAMPS: u8 = 8;
}

/// One parsed incoming segment.
pub(crate) struct Segment {
	pub src_port: u16,
	pub dst_port: u16,
	pub seq: u32,
	pub ack: u32,
	pub ctl: Control,
	pub wnd: u16,
	pub urg: u16,
	/// MSS option, present only in SYN segments.
	pub mss: Option<u16>,
	/// Window-scale option, present only in SYN segments.
	pub wscale: Option<u8>,
	pub sack_permitted: bool,
	/// Timestamp value and echo reply.
	pub ts: Option<(u32, u32)>,
	pub data: Vec<u8>,
}

impl Segment {
	/// Sequence space this segment occupies (data plus SYN and FIN).
	pub fn seq_len(&self) -> u32 {
		self.data.len() as u32 + self.ctl.syn() as u32 + self.ctl.fin() as u32
	}
}

/// Parses and checksums one segment out of a datagram.
pub(crate) fn parse(info: &Info, pkt: &NetBuf) -> Option<Segment> {
	let len = pkt.len() - info.hlen;

	if len < HEADER_LEN {
		debug!("tcp: truncated segment");
		return None;
	}

	let mut csum = Checksum::pseudo(info.src, info.dst, Protocol::Tcp, len as u16);
	csum.push_buf(pkt, info.hlen, len);

	if csum.end() != [0, 0] {
		debug!("tcp: bad checksum");
		return None;
	}

	let mut head = [0u8; HEADER_LEN];
	pkt.read(info.hlen, &mut head);
	let header = utils::bytes::cast::<Header, _>(&head[..]);

	let ctl = header.ctl.get();
	let off = ctl.off().value() as usize * 4;

	if off < HEADER_LEN || off > len {
		debug!("tcp: bad data offset");
		return None;
	}

	let mut seg = Segment {
		src_port: header.src.get(),
		dst_port: header.dst.get(),
		seq: header.seq.get(),
		ack: header.ack.get(),
		ctl,
		wnd: header.win.get(),
		urg: header.urg.get(),
		mss: None,
		wscale: None,
		sack_permitted: false,
		ts: None,
		data: vec![0; len - off],
	};

	pkt.read(info.hlen + off, &mut seg.data);

	// Walk the options between the fixed header and the payload.
	let mut opts = vec![0; off - HEADER_LEN];
	pkt.read(info.hlen + HEADER_LEN, &mut opts);

	let mut i = 0;

	while i < opts.len() {
		match opts[i] {
			opt::EOL => break,
			opt::NOP => i += 1,
			kind => {
				let Some(&olen) = opts.get(i + 1) else { break };
				let olen = olen as usize;

				if olen < 2 || i + olen > opts.len() {
					break;
				}

				let body = &opts[i + 2..i + olen];

				match kind {
					opt::MSS if body.len() == 2 => seg.mss = Some(u16::from_be_bytes([body[0], body[1]])),
					// RFC 7323 caps the shift at 14.
					opt::WSCALE if body.len() == 1 => seg.wscale = Some(body[0].min(14)),
					opt::SACK_PERMITTED if body.is_empty() => seg.sack_permitted = true,
					opt::TIMESTAMPS if body.len() == 8 => {
						let val = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
						let ecr = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
						seg.ts = Some((val, ecr));
					}
					_ => trace!("tcp: ignoring option {kind}"),
				}

				i += olen;
			}
		}
	}

	Some(seg)
}

/// The process-wide connection table.
pub(crate) struct Tcp {
	pub socks: Slab<Tcb>,
	/// Fully-qualified connections: (local, lport, remote, rport).
	pub conns: HashMap<(Ipv4Addr, u16, Ipv4Addr, u16), usize>,
	/// Listen endpoints: (local or unspecified, port).
	pub listens: HashMap<(Ipv4Addr, u16), usize>,
	/// The port number of the last created ephemeral socket.
	pub next_eph: u16,
	next_gen: u32,
}

impl Default for Tcp {
	fn default() -> Self {
		Self {
			socks: Slab::new(),
			conns: HashMap::new(),
			listens: HashMap::new(),
			next_eph: EPHEMERAL,
			next_gen: 0,
		}
	}
}

impl Tcp {
	/// Demultiplexes: connected sockets by exact 4-tuple, then listeners.
	pub fn lookup(&self, local: Ipv4Addr, lport: u16, remote: Ipv4Addr, rport: u16) -> Option<usize> {
		self.conns
			.get(&(local, lport, remote, rport))
			.or_else(|| self.listens.get(&(local, lport)))
			.or_else(|| self.listens.get(&(Ipv4Addr::UNSPECIFIED, lport)))
			.copied()
	}

	pub fn insert(&mut self, mut tcb: Tcb) -> usize {
		self.next_gen += 1;
		tcb.gen = self.next_gen;
		self.socks.insert(tcb)
	}

	pub fn get(&mut self, idx: usize, gen: u32) -> Result<&mut Tcb> {
		match self.socks.get_mut(idx) {
			Some(tcb) if tcb.gen == gen => Ok(tcb),
			_ => Err(Error::ConnectionClosed),
		}
	}

	/// Registers a connected socket in the demux map.
	pub fn register(&mut self, idx: usize) {
		let tcb = &self.socks[idx];
		self.conns.insert((tcb.local.addr, tcb.local.port, tcb.remote.addr, tcb.remote.port), idx);
	}

	/// Tears one socket out of every table it appears in.
	pub fn destroy(&mut self, idx: usize) {
		if !self.socks.contains(idx) {
			return;
		}

		let tcb = self.socks.remove(idx);

		self.conns.remove(&(tcb.local.addr, tcb.local.port, tcb.remote.addr, tcb.remote.port));

		if tcb.state == State::Listen {
			self.listens.remove(&(tcb.local.addr, tcb.local.port));

			// Half-open children die with their listener.
			for child in tcb.backlog {
				self.destroy(child);
			}
		}

		if let Some(parent) = tcb.parent {
			if let Some(listener) = self.socks.get_mut(parent) {
				listener.backlog.retain(|&c| c != idx);
			}
		}
	}

	/// Finds a free local port for an outgoing connection.
	pub fn alloc_ephemeral(&mut self) -> Result<u16> {
		for _ in 0..u16::MAX - EPHEMERAL {
			self.next_eph = self.next_eph.checked_add(1).unwrap_or(EPHEMERAL);
			let port = self.next_eph;

			let used = self.conns.keys().any(|k| k.1 == port) || self.listens.keys().any(|k| k.1 == port);

			if !used {
				return Ok(port);
			}
		}

		Err(Error::OutOfMemory)
	}
}

/// Handles one received segment.
pub(crate) fn input(net: &mut Net, iface: usize, info: &Info, pkt: NetBuf, now: Instant) {
	// Segments aimed at a broadcast or group address are never for a connection.
	if info.class != DestClass::Unicast {
		return;
	}

	let Some(seg) = parse(info, &pkt) else { return };

	match net.tcp.lookup(info.dst, seg.dst_port, info.src, seg.src_port) {
		Some(idx) => input::segment(net, iface, idx, seg, info, now),
		// No match: answer with a reset, unless the segment itself is one.
		None => output::reset_unknown(&mut net.ifaces[iface], info, &seg, now),
	}
}

/// Advisory ICMP feedback for a connection; latches a soft error only.
pub(crate) fn soft_error(net: &mut Net, local: Ipv4Addr, lport: u16, remote: Ipv4Addr, rport: u16, kind: crate::icmp::Kind) {
	let Some(&idx) = net.tcp.conns.get(&(local, lport, remote, rport)) else {
		return;
	};

	let err = match kind {
		crate::icmp::Kind::DestUnreachable => Error::NoRoute,
		crate::icmp::Kind::TimeExceeded => Error::Timeout,
		_ => return,
	};

	trace!("tcp: advisory {err} for {local}:{lport}");
	net.tcp.socks[idx].soft_err = Some(err);
}

/// Dispatches every per-connection timer that has come due.
pub(crate) fn tick(net: &mut Net, now: Instant) {
	let keys: Vec<usize> = net.tcp.socks.iter().map(|(k, _)| k).collect();

	for idx in keys {
		output::timers(net, idx, now);
	}
}
