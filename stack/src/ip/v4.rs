//! The IPv4 pipeline: ingress validation and classification, local delivery,
//! egress with fragmentation and next-hop resolution.

use core::mem::size_of;
use core::net::Ipv4Addr;
use std::time::Instant;

use bilge::prelude::*;
use collections::bytes::NetBuf;
use log::{debug, trace};
use utils::bytes::{self, Cast};
use utils::endian::{b, u16be};
use utils::error::{Error, Result};

use crate::arp;
use crate::driver::RxAncillary;
use crate::eth::{self, EtherType, MacAddr};
use crate::iface::Interface;
use crate::icmp;
use crate::ip::Version::V4;
use crate::ip::{fragment, Checksum, Protocol, ToS, Version};
use crate::Net;

pub const DEFAULT_TTL: u8 = 64;

#[bitsize(8)]
#[derive(Clone, Copy, FromBits, Cast)]
#[repr(C)]
pub struct Meta {
	pub ihl: u4,
	pub ver: Version,
}

#[bitsize(32)]
#[derive(Clone, Copy, FromBits)]
pub struct Fragment {
	pub ofst: u13,
	pub more: bool,
	pub dont: bool,
	pub reserved: bool,
	pub idnt: u16,
}

#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub ver: Meta,
	pub tos: ToS,
	pub len: u16be,
	pub frg: b<Fragment>,
	pub ttl: u8,
	pub proto: b<Protocol>,
	pub csm: [u8; 2],
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
}

pub const HEADER_LEN: usize = size_of::<Header>();

/// What ingress classification decided about the destination.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum DestClass {
	Unicast,
	Broadcast,
	Multicast,
}

/// Parsed facts about one datagram, handed down to the transport layers.
///
/// The accompanying buffer always holds the whole datagram; the transport
/// payload starts at `hlen`.
#[derive(Clone, Copy)]
pub(crate) struct Info {
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
	pub proto: Protocol,
	pub class: DestClass,
	pub hlen: usize,
}

/// Handles one received datagram.
pub(crate) fn input(net: &mut Net, iface: usize, mut pkt: NetBuf, _rx: RxAncillary, now: Instant) {
	let Some(header) = pkt.obj::<Header>(0) else {
		return debug!("ipv4: truncated header");
	};

	let meta = header.ver;
	let hlen = meta.ihl().value() as usize * 4;
	let total = header.len.get() as usize;
	let frag = header.frg.get();
	let (src, dst) = (header.src, header.dst);
	let proto = header.proto.get();

	if meta.ver() != V4 {
		return debug!("ipv4: bad version");
	}

	if hlen < HEADER_LEN {
		return debug!("ipv4: header length below five words");
	}

	if total < hlen || total > pkt.len() {
		return debug!("ipv4: length field does not match received bytes");
	}

	// The checksum of the received header area must come out as zero.
	let Some(area) = pkt.at(0, hlen) else {
		return debug!("ipv4: fragmented header");
	};

	if Checksum::of(area).end() != [0, 0] {
		return debug!("ipv4: bad header checksum");
	}

	// Source filtering: these must never appear as a source on the wire.
	if src.is_broadcast() || src.is_multicast() || src.is_link_local() || src.is_loopback() {
		return debug!("ipv4: illegal source {src}");
	}

	// Drop padding the link layer may have added.
	pkt.truncate(total);

	let ifc = &net.ifaces[iface];

	let class = if dst.is_broadcast() || ifc.is_directed_broadcast(dst) {
		DestClass::Broadcast
	} else if dst.is_multicast() {
		if !ifc.joined(dst) {
			return trace!("ipv4: multicast {dst} not joined");
		}
		DestClass::Multicast
	} else if ifc.is_local_unicast(dst) {
		DestClass::Unicast
	} else if ifc.is_tentative(dst) {
		// A tentative address accepts nothing until it is proven unique.
		return;
	} else {
		// For someone else: the translator's business, if it is running.
		return crate::nat::forward(net, iface, pkt, now);
	};

	// Unicasts to our public side may belong to the translator, not to us.
	if class == DestClass::Unicast {
		match crate::nat::intercept(net, iface, pkt, now) {
			Some(returned) => pkt = returned,
			None => return,
		}
	}

	let info = Info { src, dst, proto, class, hlen };

	if frag.more() || frag.ofst().value() != 0 {
		let key = fragment::Key { src, dst, proto, ident: frag.idnt() };

		let mut data = vec![0; total - hlen].into_boxed_slice();
		pkt.read(hlen, &mut data);

		let start = frag.ofst().value() * 8;

		let header = (start == 0).then(|| {
			let mut h = vec![0; hlen];
			pkt.read(0, &mut h);
			h
		});

		let piece = fragment::Fragment { more: frag.more(), start, data };

		match net.ifaces[iface].frags.insert(key, piece, header, now) {
			fragment::Insert::Done(whole) => deliver(net, iface, info, whole, now),
			fragment::Insert::Pending | fragment::Insert::Rejected => {}
		}

		return;
	}

	deliver(net, iface, info, pkt, now);
}

/// Dispatches a complete datagram to its transport.
pub(crate) fn deliver(net: &mut Net, iface: usize, info: Info, pkt: NetBuf, now: Instant) {
	match info.proto {
		Protocol::Icmp => icmp::input(net, iface, &info, pkt, now),
		Protocol::Tcp => crate::tcp::input(net, iface, &info, pkt, now),
		Protocol::Udp => crate::udp::input(net, iface, &info, pkt, now),
		Protocol::Unknown(number) => {
			if let Some(tap) = net.raw.get_mut(&number) {
				let payload = pkt.to_vec().split_off(info.hlen);
				return tap(info.src, &payload);
			}

			trace!("ipv4: unhandled protocol {number}");

			// A broadcast or multicast never provokes an error reply.
			if info.class == DestClass::Unicast {
				icmp::emit_protocol_unreachable(&mut net.ifaces[iface], &info, &pkt, now);
			}
		}
	}
}

/// Egress ancillary: what the caller decides about the datagram it is sending.
#[derive(Clone, Copy)]
pub(crate) struct SendParams {
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
	pub proto: Protocol,
	pub ttl: u8,
	pub tos: ToS,
	pub dont_frag: bool,
}

impl SendParams {
	pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: Protocol) -> Self {
		Self {
			src,
			dst,
			proto,
			ttl: DEFAULT_TTL,
			tos: ToS::new(super::ECN::NotECT, super::DiffServ::Default),
			dont_frag: false,
		}
	}
}

/// Sends one datagram, fragmenting to the interface MTU when it must.
///
/// `Err(InProgress)` means the packet waits on an address resolution; callers
/// treat it as success.
pub(crate) fn output(ifc: &mut Interface, p: &SendParams, mut payload: NetBuf, now: Instant) -> Result {
	if !ifc.link_up {
		return Err(Error::NoRoute);
	}

	// The source must be one of our valid unicasts, never a broadcast or group.
	if !ifc.is_local_unicast(p.src) {
		return Err(Error::InvalidAddress);
	}

	if HEADER_LEN + payload.len() <= ifc.mtu {
		let ident = ifc.next_ident();
		push_header(&mut payload, p, ident, 0, false)?;
		return resolve_and_send(ifc, p.dst, payload, now);
	}

	if p.dont_frag {
		return Err(Error::MessageTooLong);
	}

	// Fragment: MTU-sized slices aligned to eight-byte units, one shared ident.
	let ident = ifc.next_ident();
	let chunk = (ifc.mtu - HEADER_LEN) & !7;

	if chunk == 0 {
		return Err(Error::MessageTooLong);
	}

	let mut off = 0;

	while off < payload.len() {
		let n = chunk.min(payload.len() - off);
		let last = off + n == payload.len();

		let mut piece = NetBuf::alloc(crate::HEADROOM);
		piece.concat(&payload, off, n)?;
		push_header(&mut piece, p, ident, (off / 8) as u16, !last)?;

		match resolve_and_send(ifc, p.dst, piece, now) {
			Ok(()) | Err(Error::InProgress) => {}
			Err(err) => return Err(err),
		}

		off += n;
	}

	Ok(())
}

/// Transmits an already-built datagram (the translator's forwarding path).
pub(crate) fn forward_transmit(ifc: &mut Interface, pkt: NetBuf, now: Instant) -> Result {
	if !ifc.link_up {
		return Err(Error::NoRoute);
	}

	let mut head = [0u8; HEADER_LEN];

	if pkt.read(0, &mut head) != HEADER_LEN {
		return Err(Error::InvalidPacket);
	}

	let dst = bytes::cast::<Header, _>(&head[..]).dst;

	resolve_and_send(ifc, dst, pkt, now)
}

fn push_header(buf: &mut NetBuf, p: &SendParams, ident: u16, ofst: u16, more: bool) -> Result {
	let total = (HEADER_LEN + buf.len()) as u16;

	let header: &mut Header = buf.prepend_obj()?;

	header.ver = Meta::new(u4::new(5), V4);
	header.tos = p.tos;
	header.len = total.into();
	header.frg = Fragment::new(u13::new(ofst), more, p.dont_frag, ident).into();
	header.ttl = p.ttl;
	header.proto = p.proto.into();
	header.src = p.src;
	header.dst = p.dst;
	header.csm = Checksum::of(bytes::as_slice(header)).end();

	Ok(())
}

/// Picks the destination MAC and hands the datagram to the link layer.
fn resolve_and_send(ifc: &mut Interface, dst: Ipv4Addr, pkt: NetBuf, now: Instant) -> Result {
	if dst.is_broadcast() || ifc.is_directed_broadcast(dst) {
		let tx = ifc.tx_ancillary();
		return eth::transmit(ifc, MacAddr::BROADCAST, EtherType::Ipv4, pkt, tx);
	}

	if dst.is_multicast() {
		let tx = ifc.tx_ancillary();
		return eth::transmit(ifc, MacAddr::for_multicast(dst), EtherType::Ipv4, pkt, tx);
	}

	let next_hop = if ifc.on_link(dst) {
		dst
	} else {
		ifc.gateway().ok_or(Error::NoRoute)?
	};

	arp::resolve(ifc, next_hop, pkt, now)
}

/// Chooses the egress interface for `dst`: on-link subnets first, then a gateway.
pub(crate) fn route(ifaces: &[Interface], dst: Ipv4Addr) -> Result<usize> {
	if let Some(i) = ifaces.iter().position(|f| f.link_up && f.on_link(dst)) {
		return Ok(i);
	}

	if dst.is_broadcast() || dst.is_multicast() {
		return ifaces
			.iter()
			.position(|f| f.link_up && f.source_for(dst).is_some())
			.ok_or(Error::NoRoute);
	}

	ifaces
		.iter()
		.position(|f| f.link_up && f.gateway().is_some())
		.ok_or(Error::NoRoute)
}
