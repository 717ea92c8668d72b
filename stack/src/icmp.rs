//! ICMP: the echo responder, the error-message generator with its recursion
//! guard, and the pending table behind the blocking `ping` call.

use core::mem::size_of;
use core::net::Ipv4Addr;
use std::time::Instant;

use bilge::prelude::*;
use collections::bytes::NetBuf;
use log::{debug, trace};
use utils::bytes::Cast;
use utils::endian::{b, u16be};
use utils::error::{Error, Result};

use crate::iface::Interface;
use crate::ip::v4::{self, DestClass, Info, SendParams};
use crate::ip::{Checksum, Protocol};
use crate::Net;

#[bitsize(8)]
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, FromBits)]
pub enum Kind {
	EchoReply = 0,
	DestUnreachable = 3,
	SourceQuench = 4,
	Redirect = 5,
	Echo = 8,
	TimeExceeded = 11,
	ParamProblem = 12,
	Timestamp = 13,
	TimestampReply = 14,
	AddrMask = 17,
	AddrMaskReply = 18,
	#[fallback]
	Unknown(u8),
}

impl Kind {
	/// Queries and their replies; everything an error may be generated about.
	pub fn is_query(self) -> bool {
		matches!(
			self,
			Self::Echo | Self::EchoReply | Self::Timestamp | Self::TimestampReply | Self::AddrMask | Self::AddrMaskReply
		)
	}
}

/// Codes for `Kind::DestUnreachable`.
pub const CODE_PROTO_UNREACHABLE: u8 = 2;
pub const CODE_PORT_UNREACHABLE: u8 = 3;
/// Codes for `Kind::TimeExceeded`.
pub const CODE_TTL_EXCEEDED: u8 = 0;
pub const CODE_REASSEMBLY_EXCEEDED: u8 = 1;

#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub kind: b<Kind>,
	pub code: u8,
	pub csm: [u8; 2],
}

/// The identifier/sequence pair queries carry after the common header.
#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct Echo {
	pub id: u16be,
	pub seq: u16be,
}

/// The unused word error messages carry after the common header.
#[derive(Cast)]
#[repr(C)]
pub struct ErrorWord {
	pub unused: [u8; 4],
}

/// One blocked `ping` caller.
pub(crate) struct PingWaiter {
	pub id: u16,
	pub seq: u16,
	/// Payload length of the matching reply, once it arrives.
	pub done: Option<usize>,
}

/// Handles one received ICMP message.
pub(crate) fn input(net: &mut Net, iface: usize, info: &Info, pkt: NetBuf, now: Instant) {
	let len = pkt.len() - info.hlen;

	if len < size_of::<Header>() {
		return debug!("icmp: truncated message");
	}

	// The whole message checksums to zero.
	let mut csum = Checksum::default();
	csum.push_buf(&pkt, info.hlen, len);

	if csum.end() != [0, 0] {
		return debug!("icmp: bad checksum");
	}

	let mut head = [0u8; 8];

	if pkt.read(info.hlen, &mut head) < size_of::<Header>() {
		return;
	}

	let header = utils::bytes::cast::<Header, _>(&head[..4]);
	let kind = header.kind.get();

	match kind {
		Kind::Echo => {
			if len < size_of::<Header>() + size_of::<Echo>() {
				return;
			}

			// Broadcast pings are only answered when the embedder opted in.
			if info.class != DestClass::Unicast && !net.policy.broadcast_echo {
				return trace!("icmp: ignoring broadcast echo");
			}

			let echo = *utils::bytes::cast::<Echo, _>(&head[4..8]);
			send_echo_reply(&mut net.ifaces[iface], info, echo, &pkt, now);
		}
		Kind::EchoReply => {
			if len < size_of::<Header>() + size_of::<Echo>() {
				return;
			}

			let echo = utils::bytes::cast::<Echo, _>(&head[4..8]);
			let (id, seq) = (echo.id.get(), echo.seq.get());
			let payload = len - size_of::<Header>() - size_of::<Echo>();

			for waiter in &mut net.pings {
				if waiter.id == id && waiter.seq == seq && waiter.done.is_none() {
					waiter.done = Some(payload);
					break;
				}
			}
		}
		Kind::DestUnreachable | Kind::TimeExceeded | Kind::ParamProblem | Kind::SourceQuench => {
			advise(net, info, &pkt, kind);
		}
		other => trace!("icmp: unhandled type {:?}", u8::from(other)),
	}
}

/// Builds the reply to an echo request, reusing identifier, sequence, and payload.
fn send_echo_reply(ifc: &mut Interface, info: &Info, echo: Echo, request: &NetBuf, now: Instant) {
	let data_off = info.hlen + size_of::<Header>() + size_of::<Echo>();

	let mut reply = NetBuf::alloc(crate::HEADROOM);

	if reply.concat(request, data_off, request.len() - data_off).is_err() {
		return;
	}

	let Ok(e) = reply.prepend_obj::<Echo>() else { return };
	*e = echo;

	let Ok(header) = reply.prepend_obj::<Header>() else { return };
	header.kind = Kind::EchoReply.into();

	let mut csum = Checksum::default();
	csum.push_buf(&reply, 0, reply.len());

	if let Some(header) = reply.obj_mut::<Header>(0) {
		header.csm = csum.end();
	}

	// The reply source is the unicast that was pinged, or any suitable unicast
	// when the request came in as a broadcast.
	let src = match info.class {
		DestClass::Unicast => info.dst,
		_ => match ifc.source_for(info.src) {
			Some(addr) => addr,
			None => return,
		},
	};

	let params = SendParams::new(src, info.src, Protocol::Icmp);

	match v4::output(ifc, &params, reply, now) {
		Ok(()) | Err(Error::InProgress) => {}
		Err(err) => debug!("icmp: echo reply failed: {err}"),
	}
}

/// A received error message: advisory for transports, never fatal.
fn advise(net: &mut Net, info: &Info, pkt: &NetBuf, kind: Kind) {
	// The invoking datagram's header sits after the unused word.
	let off = info.hlen + size_of::<Header>() + size_of::<ErrorWord>();

	let mut head = [0u8; v4::HEADER_LEN];

	if pkt.read(off, &mut head) < head.len() {
		return;
	}

	let inner = utils::bytes::cast::<v4::Header, _>(&head[..]);
	let ihl = inner.ver.ihl().value() as usize * 4;
	let proto = inner.proto.get();
	let (src, dst) = (inner.src, inner.dst);

	if proto != Protocol::Tcp {
		return trace!("icmp: type {} about a protocol-{} flow", u8::from(kind), proto.number());
	}

	let mut ports = [0u8; 4];

	if pkt.read(off + ihl, &mut ports) < 4 {
		return;
	}

	let local = u16::from_be_bytes([ports[0], ports[1]]);
	let remote = u16::from_be_bytes([ports[2], ports[3]]);

	// The invoking datagram was ours, so its source is the local endpoint.
	crate::tcp::soft_error(net, src, local, dst, remote, kind);
}

/// Destination-unreachable (protocol) for a datagram nobody claimed.
pub(crate) fn emit_protocol_unreachable(ifc: &mut Interface, info: &Info, pkt: &NetBuf, now: Instant) {
	emit_error(ifc, info, pkt, Kind::DestUnreachable, CODE_PROTO_UNREACHABLE, now);
}

pub(crate) fn emit_port_unreachable(ifc: &mut Interface, info: &Info, pkt: &NetBuf, now: Instant) {
	emit_error(ifc, info, pkt, Kind::DestUnreachable, CODE_PORT_UNREACHABLE, now);
}

/// Emits an error about the datagram in `pkt`, honoring the recursion guard.
pub(crate) fn emit_error(ifc: &mut Interface, info: &Info, pkt: &NetBuf, kind: Kind, code: u8, now: Instant) {
	// Never answer a broadcast or multicast with an error.
	if info.class != DestClass::Unicast {
		return;
	}

	let n = pkt.len().min(info.hlen + 8);
	let mut invoking = vec![0; n];
	pkt.read(0, &mut invoking);

	emit_error_bytes(ifc, &invoking, kind, code, now);
}

/// Emits an error from a saved copy of the invoking header and leading payload.
pub(crate) fn emit_error_bytes(ifc: &mut Interface, invoking: &[u8], kind: Kind, code: u8, now: Instant) {
	if invoking.len() < v4::HEADER_LEN {
		return;
	}

	let inner = utils::bytes::cast::<v4::Header, _>(&invoking[..v4::HEADER_LEN]);
	let ihl = inner.ver.ihl().value() as usize * 4;
	let (src, dst) = (inner.src, inner.dst);

	// The recursion guard: no errors about errors or redirects, and none about
	// datagrams that were not plain unicast to begin with.
	if src.is_unspecified() || src.is_multicast() || src.is_broadcast() || src.is_loopback() {
		return;
	}

	if dst.is_multicast() || dst.is_broadcast() || ifc.is_directed_broadcast(dst) {
		return;
	}

	if inner.proto.get() == Protocol::Icmp {
		match invoking.get(ihl).copied().map(Kind::from) {
			Some(k) if k.is_query() => {}
			_ => return trace!("icmp: suppressing error about an error"),
		}
	}

	let Some(reply_src) = ifc.source_for(src) else { return };

	let mut msg = NetBuf::alloc(crate::HEADROOM);
	msg.extend_from_slice(invoking);

	let Ok(_word) = msg.prepend_obj::<ErrorWord>() else { return };

	let Ok(header) = msg.prepend_obj::<Header>() else { return };
	header.kind = kind.into();
	header.code = code;

	let mut csum = Checksum::default();
	csum.push_buf(&msg, 0, msg.len());

	if let Some(header) = msg.obj_mut::<Header>(0) {
		header.csm = csum.end();
	}

	let params = SendParams::new(reply_src, src, Protocol::Icmp);

	match v4::output(ifc, &params, msg, now) {
		Ok(()) | Err(Error::InProgress) => {}
		Err(err) => debug!("icmp: error message failed: {err}"),
	}
}

/// Sends one echo request on behalf of the blocking `ping` API.
pub(crate) fn send_echo(ifc: &mut Interface, src: Ipv4Addr, dst: Ipv4Addr, id: u16, seq: u16, payload: &[u8], now: Instant) -> Result {
	let mut msg = NetBuf::alloc(crate::HEADROOM);
	msg.extend_from_slice(payload);

	let echo: &mut Echo = msg.prepend_obj()?;
	echo.id = id.into();
	echo.seq = seq.into();

	let header: &mut Header = msg.prepend_obj()?;
	header.kind = Kind::Echo.into();

	let mut csum = Checksum::default();
	csum.push_buf(&msg, 0, msg.len());

	if let Some(header) = msg.obj_mut::<Header>(0) {
		header.csm = csum.end();
	}

	let params = SendParams::new(src, dst, Protocol::Icmp);

	match v4::output(ifc, &params, msg, now) {
		Ok(()) | Err(Error::InProgress) => Ok(()),
		Err(err) => Err(err),
	}
}
