//! Ethernet framing: header build/parse, tail-tag handling, ethertype dispatch.

use core::fmt::{self, Debug, Display};
use core::net::Ipv4Addr;
use std::time::Instant;

use bilge::prelude::*;
use collections::bytes::NetBuf;
use log::{debug, trace};
use utils::bytes::Cast;
use utils::endian::b;
use utils::error::Result;

use crate::driver::{RxAncillary, TailTag, TxAncillary};
use crate::iface::Interface;
use crate::Net;

/// Minimum frame length (without CRC) a tail-tagged port pads to.
const MIN_FRAME: usize = 60;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Cast)]
#[repr(transparent)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
	pub const BROADCAST: Self = Self([0xff; 6]);
	pub const ZERO: Self = Self([0; 6]);

	pub fn is_broadcast(&self) -> bool {
		*self == Self::BROADCAST
	}

	/// Group bit of the first octet.
	pub fn is_multicast(&self) -> bool {
		self.0[0] & 0x01 != 0
	}

	pub fn is_zero(&self) -> bool {
		*self == Self::ZERO
	}

	/// The deterministic IPv4-multicast mapping into the 01-00-5E-00-00-00/23 block.
	pub fn for_multicast(group: Ipv4Addr) -> Self {
		let o = group.octets();
		Self([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
	}
}

impl Display for MacAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let o = &self.0;
		write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3], o[4], o[5])
	}
}

impl Debug for MacAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		<Self as Display>::fmt(self, f)
	}
}

#[bitsize(16)]
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, FromBits)]
pub enum EtherType {
	Ipv4 = 0x0800,
	Arp = 0x0806,
	#[fallback]
	Unknown(u16),
}

#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub dst: MacAddr,
	pub src: MacAddr,
	pub ethertype: b<EtherType>,
}

pub const HEADER_LEN: usize = core::mem::size_of::<Header>();

/// Entry point for one received frame.
pub(crate) fn input(net: &mut Net, iface: usize, frame: &[u8], now: Instant) {
	let ifc = &mut net.ifaces[iface];

	if !ifc.link_up {
		return;
	}

	// Strip the managed-switch tail tag before the frame is parsed.
	let (frame, rx) = strip_tail_tag(frame, ifc.driver.tail_tag());

	let Some(header) = frame.get(..HEADER_LEN).map(utils::bytes::cast::<Header, _>) else {
		return debug!("{}: runt frame ({} bytes)", ifc.name, frame.len());
	};

	// Unicast frames for somebody else are not ours to look at.
	if !header.dst.is_broadcast() && !header.dst.is_multicast() && header.dst != ifc.mac {
		return trace!("{}: frame for {}", ifc.name, header.dst);
	}

	let ethertype = header.ethertype.get();
	let payload = &frame[HEADER_LEN..];

	match ethertype {
		EtherType::Arp => crate::arp::input(&mut net.ifaces[iface], payload, now),
		EtherType::Ipv4 => {
			let buf = NetBuf::from_slice(payload, crate::HEADROOM);
			crate::ip::v4::input(net, iface, buf, rx, now);
		}
		EtherType::Unknown(tag) => trace!("unhandled ethertype {tag:#06x}"),
	}
}

/// Frames `pkt` and hands it to the driver, tail-tagging when the port needs it.
pub(crate) fn transmit(ifc: &mut Interface, dst: MacAddr, ethertype: EtherType, mut pkt: NetBuf, tx: TxAncillary) -> Result {
	let header: &mut Header = pkt.prepend_obj()?;

	header.dst = dst;
	header.src = ifc.mac;
	header.ethertype = ethertype.into();

	let mut frame = pkt.to_vec();

	match (ifc.driver.tail_tag(), tx.port) {
		(TailTag::One, Some(port)) => {
			frame.resize(frame.len().max(MIN_FRAME), 0);
			frame.push(port);
		}
		(TailTag::Two, Some(port)) => {
			frame.resize(frame.len().max(MIN_FRAME), 0);
			frame.extend_from_slice(&[0, port]);
		}
		_ => {}
	}

	ifc.driver.send(&frame, &tx)
}

/// Splits the tail tag off a received frame, recovering the ingress port.
fn strip_tail_tag(frame: &[u8], tag: TailTag) -> (&[u8], RxAncillary) {
	match tag {
		TailTag::None => (frame, RxAncillary::default()),
		TailTag::One if !frame.is_empty() => {
			let (rest, tag) = frame.split_at(frame.len() - 1);
			(rest, RxAncillary { port: Some(tag[0] & 0x07) })
		}
		TailTag::Two if frame.len() >= 2 => {
			let (rest, tag) = frame.split_at(frame.len() - 2);
			(rest, RxAncillary { port: Some(tag[1] & 0x07) })
		}
		_ => (frame, RxAncillary::default()),
	}
}
