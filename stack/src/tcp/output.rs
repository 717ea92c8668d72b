//! The TCP transmission engine: segment building, the send pump with Nagle and
//! sender-side silly-window avoidance, retransmission, probes, and resets.

use std::time::Instant;

use bilge::prelude::*;
use collections::bytes::NetBuf;
use log::{debug, trace};
use utils::error::{Error, Result};

use crate::iface::Interface;
use crate::ip::v4::{self, Info, SendParams};
use crate::ip::{Checksum, Protocol, SocketAddr};
use crate::Net;

use super::tcb::{seq_lt, State, Tcb, TcpPolicy};
use super::{opt, Control, Header, Segment, HEADER_LEN};

#[derive(Clone, Copy, Default)]
pub(crate) struct SegFlags {
	pub syn: bool,
	pub ack: bool,
	pub fin: bool,
	pub rst: bool,
	pub psh: bool,
}

impl SegFlags {
	pub fn ack() -> Self {
		Self { ack: true, ..Self::default() }
	}
}

/// Milliseconds on this connection's timestamp clock.
fn ts_val(tcb: &Tcb, now: Instant) -> u32 {
	(now - tcb.epoch).as_millis() as u32
}

/// The options block for a SYN or SYN+ACK.
fn syn_options(tcb: &Tcb, now: Instant) -> Vec<u8> {
	let mut opts = Vec::with_capacity(20);

	opts.extend_from_slice(&[opt::MSS, 4]);
	opts.extend_from_slice(&tcb.adv_mss.to_be_bytes());

	if tcb.offer_wscale {
		opts.extend_from_slice(&[opt::NOP, opt::WSCALE, 3, tcb.rcv_wscale]);
	}

	if tcb.offer_sack {
		opts.extend_from_slice(&[opt::NOP, opt::NOP, opt::SACK_PERMITTED, 2]);
	}

	if tcb.offer_ts {
		opts.extend_from_slice(&[opt::NOP, opt::NOP, opt::TIMESTAMPS, 10]);
		opts.extend_from_slice(&ts_val(tcb, now).to_be_bytes());
		opts.extend_from_slice(&tcb.ts_recent.to_be_bytes());
	}

	opts
}

/// The options block for an ordinary segment.
fn seg_options(tcb: &Tcb, now: Instant) -> Vec<u8> {
	let mut opts = Vec::new();

	if tcb.ts_ok {
		opts.extend_from_slice(&[opt::NOP, opt::NOP, opt::TIMESTAMPS, 10]);
		opts.extend_from_slice(&ts_val(tcb, now).to_be_bytes());
		opts.extend_from_slice(&tcb.ts_recent.to_be_bytes());
	}

	opts
}

/// Builds and transmits one segment for a connection.
pub(crate) fn send(ifaces: &mut [Interface], tcb: &Tcb, seq: u32, flags: SegFlags, data: &[u8], now: Instant) -> Result {
	let opts = if flags.syn { syn_options(tcb, now) } else { seg_options(tcb, now) };

	// A pending urgent mark rides on every data segment it is ahead of.
	let urg = (tcb.urg_pending && !data.is_empty() && seq_lt(seq, tcb.snd.up))
		.then(|| tcb.snd.up.wrapping_sub(seq))
		.filter(|off| *off <= u16::MAX as u32)
		.map(|off| off as u16);

	send_raw(
		ifaces,
		tcb.local,
		tcb.remote,
		seq,
		flags.ack.then_some(tcb.rcv.nxt),
		flags,
		tcb.advertised_window(),
		urg,
		&opts,
		data,
		now,
	)
}

/// The segment builder underneath both the connection path and raw resets.
#[allow(clippy::too_many_arguments)]
fn send_raw(
	ifaces: &mut [Interface],
	local: SocketAddr,
	remote: SocketAddr,
	seq: u32,
	ack: Option<u32>,
	flags: SegFlags,
	window: u16,
	urg: Option<u16>,
	opts: &[u8],
	data: &[u8],
	now: Instant,
) -> Result {
	// Options are padded out to a word boundary.
	let off_words = (HEADER_LEN + opts.len() + 3) / 4;
	let opts_len = off_words * 4 - HEADER_LEN;

	let mut buf = NetBuf::alloc(crate::HEADROOM);
	buf.extend_from_slice(data);

	if opts_len > 0 {
		buf.prepend(opts_len)?[..opts.len()].copy_from_slice(opts);
	}

	let header: &mut Header = buf.prepend_obj()?;

	header.src = local.port.into();
	header.dst = remote.port.into();
	header.seq = seq.into();
	header.ack = ack.unwrap_or(0).into();
	header.ctl = Control::new(
		flags.fin,
		flags.syn,
		flags.rst,
		flags.psh,
		ack.is_some(),
		urg.is_some(),
		false,
		false,
		u4::new(off_words as u8),
	)
	.into();
	header.win = window.into();
	header.urg = urg.unwrap_or(0).into();

	let len = buf.len() as u16;

	let mut csum = Checksum::pseudo(local.addr, remote.addr, Protocol::Tcp, len);
	csum.push_buf(&buf, 0, buf.len());
	let sum = csum.end();

	if let Some(header) = buf.obj_mut::<Header>(0) {
		header.csm = sum;
	}

	let idx = v4::route(ifaces, remote.addr)?;
	let params = SendParams::new(local.addr, remote.addr, Protocol::Tcp);

	match v4::output(&mut ifaces[idx], &params, buf, now) {
		Ok(()) | Err(Error::InProgress) => Ok(()),
		Err(err) => Err(err),
	}
}

/// Arms the retransmission timer if something is outstanding and it is idle.
pub(crate) fn arm_rtx(tcb: &mut Tcb, now: Instant) {
	if tcb.rtx_deadline.is_none() && tcb.needs_rtx_timer() {
		tcb.rtx_deadline = Some(now + tcb.rto);
	}
}

/// Sends whatever the window, Nagle, and the send ring currently allow.
pub(crate) fn pump(ifaces: &mut [Interface], tcb: &mut Tcb, now: Instant) {
	if !matches!(
		tcb.state,
		State::Established | State::CloseWait | State::FinWait1 | State::Closing | State::LastAck
	) {
		return;
	}

	loop {
		let in_flight = tcb.in_flight();
		let unsent = tcb.unsent();
		let usable = (tcb.snd.wnd as usize).saturating_sub(in_flight);
		let mss = tcb.mss as usize;

		// A closed peer window with data waiting engages the persist timer.
		if tcb.snd.wnd == 0 && unsent > 0 {
			if tcb.persist_deadline.is_none() {
				tcb.persist_deadline = Some(now + tcb.persist_backoff);
			}
			break;
		}

		let n = unsent.min(usable).min(mss);

		if n == 0 {
			break;
		}

		// Nagle: hold sub-MSS segments while anything is in flight.
		if n < mss && in_flight > 0 && tcb.nagle {
			break;
		}

		// Sender-side SWS avoidance: a small segment goes out only when it is
		// everything we have.
		if n < mss && n < unsent {
			break;
		}

		let mut data = vec![0; n];
		tcb.snd_ring.peek(in_flight, &mut data);

		let last = n == unsent;
		let fin = last && tcb.fin_pending;

		let seq = tcb.snd.nxt;
		let flags = SegFlags { ack: true, psh: last, fin, ..SegFlags::default() };

		if send(ifaces, tcb, seq, flags, &data, now).is_err() {
			break;
		}

		tcb.snd.nxt = tcb.snd.nxt.wrapping_add(n as u32);

		if fin {
			tcb.fin_seq = Some(tcb.snd.nxt);
			tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
			tcb.fin_pending = false;
		}

		// Time one segment per flight, per Karn's rule.
		if tcb.rtt_sample.is_none() {
			tcb.rtt_sample = Some((tcb.snd.nxt, now));
		}

		tcb.idle_since = now;
		arm_rtx(tcb, now);

		if fin || last {
			break;
		}
	}

	// A FIN with nothing left to carry it goes out on its own.
	if tcb.fin_pending && tcb.unsent() == 0 {
		let seq = tcb.snd.nxt;

		if send(ifaces, tcb, seq, SegFlags { ack: true, fin: true, ..SegFlags::default() }, &[], now).is_ok() {
			tcb.fin_seq = Some(seq);
			tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
			tcb.fin_pending = false;
			arm_rtx(tcb, now);
		}
	}
}

/// Retransmits the head of the outstanding range.
pub(crate) fn retransmit(ifaces: &mut [Interface], tcb: &mut Tcb, now: Instant) {
	// Karn: a retransmitted flight never produces an RTT sample.
	tcb.rtt_sample = None;

	match tcb.state {
		State::SynSent => {
			let _ = send(ifaces, tcb, tcb.iss, SegFlags { syn: true, ..SegFlags::default() }, &[], now);
		}
		State::SynReceived => {
			let _ = send(ifaces, tcb, tcb.iss, SegFlags { syn: true, ack: true, ..SegFlags::default() }, &[], now);
		}
		_ => {
			let in_flight = tcb.in_flight();

			if in_flight > 0 {
				let n = in_flight.min(tcb.mss as usize);

				let mut data = vec![0; n];
				tcb.snd_ring.peek(0, &mut data);

				// The FIN rides along when it directly follows this range.
				let end = tcb.snd.una.wrapping_add(n as u32);
				let fin = tcb.fin_seq == Some(end);

				let flags = SegFlags { ack: true, psh: true, fin, ..SegFlags::default() };
				let _ = send(ifaces, tcb, tcb.snd.una, flags, &data, now);
			} else if let Some(fin) = tcb.fin_seq.filter(|_| !tcb.fin_acked()) {
				let _ = send(ifaces, tcb, fin, SegFlags { ack: true, fin: true, ..SegFlags::default() }, &[], now);
			}
		}
	}
}

/// An empty acknowledgment of the current receive state.
pub(crate) fn send_ack(ifaces: &mut [Interface], tcb: &Tcb, now: Instant) {
	let _ = send(ifaces, tcb, tcb.snd.nxt, SegFlags::ack(), &[], now);
}

/// One-byte zero-window probe.
pub(crate) fn probe(ifaces: &mut [Interface], tcb: &mut Tcb, now: Instant) {
	if tcb.unsent() > 0 {
		let in_flight = tcb.in_flight();

		let mut byte = [0u8; 1];
		tcb.snd_ring.peek(in_flight, &mut byte);

		let seq = tcb.snd.nxt;

		if send(ifaces, tcb, seq, SegFlags::ack(), &byte, now).is_ok() {
			tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
			arm_rtx(tcb, now);
		}
	} else {
		// Nothing new to offer: probe below the window edge instead.
		let _ = send(ifaces, tcb, tcb.snd.nxt.wrapping_sub(1), SegFlags::ack(), &[], now);
	}
}

/// Keepalive: a bare ACK one byte below SND.NXT that the peer must answer.
pub(crate) fn keepalive_probe(ifaces: &mut [Interface], tcb: &Tcb, now: Instant) {
	let _ = send(ifaces, tcb, tcb.snd.nxt.wrapping_sub(1), SegFlags::ack(), &[], now);
}

/// Abortive close: RST at the current send point.
pub(crate) fn send_rst(ifaces: &mut [Interface], tcb: &Tcb, now: Instant) {
	let flags = SegFlags { rst: true, ack: true, ..SegFlags::default() };
	let _ = send(ifaces, tcb, tcb.snd.nxt, flags, &[], now);
}

/// The RFC 793 reset for a segment that matched no connection at all.
pub(crate) fn reset_unknown(ifc: &mut Interface, info: &Info, seg: &Segment, now: Instant) {
	if seg.ctl.rst() {
		return;
	}

	trace!("tcp: no socket for {}:{}, resetting", info.dst, seg.dst_port);

	let local = SocketAddr::new(info.dst, seg.dst_port);
	let remote = SocketAddr::new(info.src, seg.src_port);

	let (seq, ack) = if seg.ctl.ack() {
		(seg.ack, None)
	} else {
		(0, Some(seg.seq.wrapping_add(seg.seq_len())))
	};

	let flags = SegFlags { rst: true, ..SegFlags::default() };

	let _ = send_raw(core::slice::from_mut(ifc), local, remote, seq, ack, flags, 0, None, &[], &[], now);
}

/// Runs every timer of one socket that has come due.
pub(crate) fn timers(net: &mut Net, idx: usize, now: Instant) {
	let policy = net.policy.tcp.clone();

	let Net { tcp, ifaces, .. } = net;

	let mut destroy = false;
	let mut fatal = None;

	{
		let Some(tcb) = tcp.socks.get_mut(idx) else { return };

		// TimeWait expiry destroys the socket outright.
		if tcb.timewait_deadline.is_some_and(|d| now >= d) {
			destroy = true;
		}

		if !destroy {
			if tcb.rtx_deadline.is_some_and(|d| now >= d) {
				tcb.rtx_deadline = None;

				if !tcb.needs_rtx_timer() {
					// Everything got acknowledged in the meantime.
				} else if tcb.rtx_count >= policy.r2 {
					debug!("tcp: {} retransmissions exhausted", tcb.remote);
					fatal = Some(Error::Timeout);
				} else {
					tcb.rtx_count += 1;

					if tcb.rtx_count == policy.r1 {
						trace!("tcp: {} is struggling", tcb.remote);
					}

					// Exponential backoff, capped.
					tcb.rto = (tcb.rto * 2).min(policy.rto_max);
					retransmit(ifaces, tcb, now);
					tcb.rtx_deadline = Some(now + tcb.rto);
				}
			}

			if fatal.is_none() && tcb.persist_deadline.is_some_and(|d| now >= d) {
				tcb.persist_deadline = None;

				if tcb.snd.wnd == 0 && tcb.unsent() > 0 {
					probe(ifaces, tcb, now);
					tcb.persist_backoff = (tcb.persist_backoff * 2).min(policy.persist_max);
					tcb.persist_deadline = Some(now + tcb.persist_backoff);
				}
			}

			if fatal.is_none() && tcb.keepalive && tcb.state == State::Established {
				let idle = now - tcb.idle_since;
				let due = policy.keepalive_idle + policy.keepalive_interval * tcb.keepalive_probes;

				if idle >= due {
					if tcb.keepalive_probes >= policy.keepalive_count {
						debug!("tcp: {} unresponsive to keepalive", tcb.remote);
						send_rst(ifaces, tcb, now);
						fatal = Some(Error::ResetByPeer);
					} else {
						keepalive_probe(ifaces, tcb, now);
						tcb.keepalive_probes += 1;
					}
				}
			}

			if let Some(err) = fatal {
				tcb.err = Some(err);
				tcb.state = State::Closed;
				tcb.rtx_deadline = None;
				tcb.persist_deadline = None;

				if !tcb.has_handle {
					destroy = true;
				}
			}
		}
	}

	if destroy {
		tcp.destroy(idx);
	} else if fatal.is_some() {
		// Stray segments for a dead connection should meet a reset, not us.
		if let Some(tcb) = tcp.socks.get(idx) {
			let key = (tcb.local.addr, tcb.local.port, tcb.remote.addr, tcb.remote.port);
			tcp.conns.remove(&key);
		}
	}
}

/// Clamp of the announced MSS to what the path can carry.
pub(crate) fn path_mss(ifaces: &[Interface], remote: core::net::Ipv4Addr) -> u16 {
	let mtu = v4::route(ifaces, remote)
		.ok()
		.map(|i| ifaces[i].mtu)
		.unwrap_or(576);

	(mtu - v4::HEADER_LEN - HEADER_LEN) as u16
}

/// Clamp of the send MSS to the peer's announcement.
pub(crate) fn effective_mss(announced: Option<u16>, path: u16) -> u16 {
	announced.unwrap_or(536).min(path).max(1)
}

/// Picks the receive-window scale for a buffer size, when scaling is offered.
pub(crate) fn pick_wscale(policy: &TcpPolicy) -> u8 {
	if !policy.window_scale {
		return 0;
	}

	let mut shift = 0u8;

	while shift < 14 && (policy.recv_buf >> shift) > u16::MAX as usize {
		shift += 1;
	}

	shift
}

/// Whether an acknowledgment is a true duplicate: same point, same window,
/// nothing else aboard, while data is outstanding.
pub(crate) fn is_dup_ack(tcb: &Tcb, seg: &Segment) -> bool {
	seg.ctl.ack()
		&& seg.ack == tcb.snd.una
		&& (seg.wnd as u32) << tcb.snd_wscale == tcb.snd.wnd
		&& seg.data.is_empty()
		&& !seg.ctl.syn()
		&& !seg.ctl.fin()
		&& tcb.in_flight() > 0
}

/// Fast retransmit on the duplicate-ACK threshold.
pub(crate) const DUP_ACK_THRESHOLD: u32 = 3;

/// Whether `ack` acknowledges anything new.
pub(crate) fn ack_advances(tcb: &Tcb, ack: u32) -> bool {
	seq_lt(tcb.snd.una, ack) && super::tcb::seq_le(ack, tcb.snd.nxt)
}
