//! Segment-arrival processing: the RFC 793 event machine.

use std::time::Instant;

use log::{debug, trace};
use rand::Rng;
use utils::error::Error;

use crate::ip::v4::Info;
use crate::ip::SocketAddr;
use crate::Net;

use super::output::{self, SegFlags};
use super::tcb::{seq_le, seq_lt, seq_within, State, Tcb};
use super::Segment;

/// What must happen once the control-block borrow is released.
enum After {
	Nothing,
	/// The socket is gone entirely (unaccepted child, TimeWait completion).
	Destroy,
	/// The connection died but a user handle still needs to read the error.
	Deregister,
}

/// Handles one segment already demultiplexed to socket `idx`.
pub(crate) fn segment(net: &mut Net, iface: usize, idx: usize, seg: Segment, info: &Info, now: Instant) {
	let state = net.tcp.socks[idx].state;

	let after = match state {
		State::Listen => handle_listen(net, iface, idx, seg, info, now),
		State::SynSent => handle_syn_sent(net, idx, seg, now),
		State::Closed => {
			output::reset_unknown(&mut net.ifaces[iface], info, &seg, now);
			After::Nothing
		}
		_ => handle_general(net, idx, seg, now),
	};

	match after {
		After::Nothing => {}
		After::Destroy => net.tcp.destroy(idx),
		After::Deregister => {
			if let Some(tcb) = net.tcp.socks.get(idx) {
				let key = (tcb.local.addr, tcb.local.port, tcb.remote.addr, tcb.remote.port);
				net.tcp.conns.remove(&key);
			}
		}
	}
}

/// A segment for a listening socket: only a clean SYN opens a child.
fn handle_listen(net: &mut Net, iface: usize, idx: usize, seg: Segment, info: &Info, now: Instant) -> After {
	if seg.ctl.rst() {
		return After::Nothing;
	}

	if seg.ctl.ack() {
		// An ACK at a listener belongs to no connection: reset it.
		output::reset_unknown(&mut net.ifaces[iface], info, &seg, now);
		return After::Nothing;
	}

	if !seg.ctl.syn() {
		return After::Nothing;
	}

	let listener = &net.tcp.socks[idx];

	if listener.backlog.len() >= listener.backlog_max {
		debug!("tcp: backlog full on port {}, SYN dropped", listener.local.port);
		return After::Nothing;
	}

	let policy = net.policy.tcp.clone();
	let iss: u32 = net.rng.gen();

	let local = SocketAddr::new(info.dst, seg.dst_port);
	let remote = SocketAddr::new(info.src, seg.src_port);

	let mut child = Tcb::new(local, remote, iss, &policy, now);

	child.state = State::SynReceived;
	child.parent = Some(idx);
	child.has_handle = false;

	child.irs = seg.seq;
	child.rcv.nxt = seg.seq.wrapping_add(1);
	child.snd.nxt = iss.wrapping_add(1);
	child.snd_base = iss.wrapping_add(1);

	// The window field of a SYN is never scaled.
	child.snd.wnd = seg.wnd as u32;
	child.snd.wl1 = seg.seq;
	child.snd.wl2 = iss;

	// Option negotiation: each extension is on only when both ends asked.
	child.adv_mss = output::path_mss(&net.ifaces, remote.addr);
	child.mss = output::effective_mss(seg.mss, child.adv_mss);

	child.offer_wscale = policy.window_scale && seg.wscale.is_some();
	if let Some(ws) = seg.wscale.filter(|_| child.offer_wscale) {
		child.snd_wscale = ws;
		child.rcv_wscale = output::pick_wscale(&policy);
	}

	child.offer_sack = policy.sack_permitted && seg.sack_permitted;
	child.sack_ok = child.offer_sack;

	child.offer_ts = policy.timestamps && seg.ts.is_some();
	if let Some((val, _)) = seg.ts.filter(|_| child.offer_ts) {
		child.ts_ok = true;
		child.ts_recent = val;
	}

	let cidx = net.tcp.insert(child);
	net.tcp.register(cidx);
	net.tcp.socks[idx].backlog.push_back(cidx);

	trace!("tcp: {} -> {} entering SynReceived", remote, local);

	let Net { tcp, ifaces, .. } = net;
	let child = &mut tcp.socks[cidx];

	let flags = SegFlags { syn: true, ack: true, ..SegFlags::default() };
	let _ = output::send(ifaces, child, child.iss, flags, &[], now);
	output::arm_rtx(child, now);

	After::Nothing
}

/// Active open: waiting for the SYN+ACK (or a crossing SYN).
fn handle_syn_sent(net: &mut Net, idx: usize, seg: Segment, now: Instant) -> After {
	let policy = net.policy.tcp.clone();
	let Net { tcp, ifaces, .. } = net;
	let tcb = &mut tcp.socks[idx];

	if seg.ctl.ack() && (seq_le(seg.ack, tcb.iss) || seq_lt(tcb.snd.nxt, seg.ack)) {
		// An ACK for something we never sent.
		if !seg.ctl.rst() {
			let _ = output::send(ifaces, tcb, seg.ack, SegFlags { rst: true, ..SegFlags::default() }, &[], now);
		}
		return After::Nothing;
	}

	if seg.ctl.rst() {
		if seg.ctl.ack() {
			tcb.err = Some(Error::ResetByPeer);
			tcb.state = State::Closed;
			tcb.rtx_deadline = None;
			return After::Deregister;
		}
		return After::Nothing;
	}

	if !seg.ctl.syn() {
		return After::Nothing;
	}

	tcb.irs = seg.seq;
	tcb.rcv.nxt = seg.seq.wrapping_add(1);

	// Option negotiation against what we offered.
	tcb.mss = output::effective_mss(seg.mss, tcb.adv_mss);

	match seg.wscale {
		Some(ws) if tcb.offer_wscale => tcb.snd_wscale = ws,
		_ => {
			tcb.snd_wscale = 0;
			tcb.rcv_wscale = 0;
		}
	}

	tcb.sack_ok = tcb.offer_sack && seg.sack_permitted;

	match seg.ts {
		Some((val, _)) if tcb.offer_ts => {
			tcb.ts_ok = true;
			tcb.ts_recent = val;
		}
		_ => tcb.ts_ok = false,
	}

	if seg.ctl.ack() {
		tcb.snd.una = seg.ack;
	}

	tcb.snd.wnd = seg.wnd as u32;
	tcb.snd.wl1 = seg.seq;
	tcb.snd.wl2 = seg.ack;

	if seq_lt(tcb.iss, tcb.snd.una) {
		// Our SYN is acknowledged: the handshake is complete.
		tcb.state = State::Established;
		tcb.rtx_deadline = None;
		tcb.rtx_count = 0;

		trace!("tcp: {} established", tcb.remote);

		output::send_ack(ifaces, tcb, now);
		output::pump(ifaces, tcb, now);
	} else {
		// Simultaneous open: both SYNs crossed.
		tcb.state = State::SynReceived;

		let flags = SegFlags { syn: true, ack: true, ..SegFlags::default() };
		let _ = output::send(ifaces, tcb, tcb.iss, flags, &[], now);
		output::arm_rtx(tcb, now);
	}

	After::Nothing
}

/// Every synchronized state: acceptability, RST, ACK, data, FIN — in that order.
fn handle_general(net: &mut Net, idx: usize, seg: Segment, now: Instant) -> After {
	let policy = net.policy.tcp.clone();
	let msl2 = policy.msl * 2;

	let Net { tcp, ifaces, .. } = net;
	let tcb = &mut tcp.socks[idx];

	// Where the peer's FIN would sit, before any trimming below.
	let fin_at = seg.seq.wrapping_add(seg.data.len() as u32);

	// PAWS: a timestamp from the past condemns the segment.
	if tcb.ts_ok {
		if let Some((val, _)) = seg.ts {
			if seq_lt(val, tcb.ts_recent) && !seg.ctl.rst() {
				output::send_ack(ifaces, tcb, now);
				return After::Nothing;
			}
		}
	}

	// The RFC 793 four-case acceptability test.
	let rwnd = tcb.recv_window();
	let slen = seg.seq_len();
	let right = tcb.rcv.nxt.wrapping_add(rwnd);

	let acceptable = match (slen, rwnd) {
		(0, 0) => seg.seq == tcb.rcv.nxt,
		(0, _) => seq_within(seg.seq, tcb.rcv.nxt, right),
		(_, 0) => false,
		(_, _) => {
			seq_within(seg.seq, tcb.rcv.nxt, right)
				|| seq_within(seg.seq.wrapping_add(slen).wrapping_sub(1), tcb.rcv.nxt, right)
		}
	};

	if !acceptable {
		// Out-of-window segments are answered with a duplicate ACK.
		if !seg.ctl.rst() {
			output::send_ack(ifaces, tcb, now);
		}
		return After::Nothing;
	}

	if tcb.ts_ok {
		if let Some((val, _)) = seg.ts {
			if seq_le(seg.seq, tcb.rcv.nxt) {
				tcb.ts_recent = val;
			}
		}
	}

	if seg.ctl.rst() {
		return match tcb.state {
			// A reset child of a listener silently returns to nothing.
			State::SynReceived if tcb.parent.is_some() => After::Destroy,
			State::TimeWait => After::Nothing,
			_ => {
				trace!("tcp: {} reset by peer", tcb.remote);
				tcb.err = Some(Error::ResetByPeer);
				tcb.state = State::Closed;
				tcb.rtx_deadline = None;
				tcb.persist_deadline = None;
				After::Deregister
			}
		};
	}

	// A SYN inside the window is a protocol violation both sides abandon.
	if seg.ctl.syn() {
		output::send_rst(ifaces, tcb, now);
		tcb.err = Some(Error::ResetByPeer);
		tcb.state = State::Closed;
		tcb.rtx_deadline = None;
		return After::Deregister;
	}

	if !seg.ctl.ack() {
		return After::Nothing;
	}

	if tcb.state == State::SynReceived {
		if seq_lt(tcb.snd.una, seg.ack) && seq_le(seg.ack, tcb.snd.nxt) {
			tcb.state = State::Established;
			tcb.snd.wnd = (seg.wnd as u32) << tcb.snd_wscale;
			tcb.snd.wl1 = seg.seq;
			tcb.snd.wl2 = seg.ack;
			tcb.rtx_deadline = None;
			tcb.rtx_count = 0;

			trace!("tcp: {} established", tcb.remote);
		} else {
			let _ = output::send(ifaces, tcb, seg.ack, SegFlags { rst: true, ..SegFlags::default() }, &[], now);
			return After::Nothing;
		}
	}

	let mut after = After::Nothing;

	if output::ack_advances(tcb, seg.ack) {
		// Trim acknowledged bytes off the retransmission range.
		let adv = seg.ack.wrapping_sub(tcb.snd_base) as usize;
		let acked_data = adv.min(tcb.snd_ring.len());

		tcb.snd_ring.skip(acked_data);
		tcb.snd_base = tcb.snd_base.wrapping_add(acked_data as u32);
		tcb.snd.una = seg.ack;
		tcb.rtx_count = 0;
		tcb.dup_acks = 0;

		if tcb.urg_pending && seq_le(tcb.snd.up, tcb.snd.una) {
			tcb.urg_pending = false;
		}

		// Karn: only a never-retransmitted flight feeds the estimator.
		if let Some((timed, sent_at)) = tcb.rtt_sample {
			if seq_le(timed, seg.ack) {
				tcb.rtt_update(now - sent_at, &policy);
				tcb.rtt_sample = None;
			}
		}

		tcb.rtx_deadline = tcb.needs_rtx_timer().then(|| now + tcb.rto);

		if tcb.fin_acked() {
			match tcb.state {
				State::FinWait1 => tcb.state = State::FinWait2,
				State::Closing => {
					tcb.state = State::TimeWait;
					tcb.timewait_deadline = Some(now + msl2);
					tcb.rtx_deadline = None;
				}
				State::LastAck => {
					tcb.state = State::Closed;
					after = After::Destroy;
				}
				_ => {}
			}
		}
	} else if output::is_dup_ack(tcb, &seg) {
		tcb.dup_acks += 1;

		if tcb.dup_acks == output::DUP_ACK_THRESHOLD {
			trace!("tcp: {} fast retransmit", tcb.remote);
			output::retransmit(ifaces, tcb, now);
		}
	} else if seq_lt(tcb.snd.nxt, seg.ack) {
		// An acknowledgment of data we have not sent yet.
		output::send_ack(ifaces, tcb, now);
		return After::Nothing;
	}

	if matches!(after, After::Destroy) {
		return after;
	}

	// Window update per the WL1/WL2 rule.
	if seq_lt(tcb.snd.wl1, seg.seq) || (tcb.snd.wl1 == seg.seq && seq_le(tcb.snd.wl2, seg.ack)) {
		tcb.snd.wnd = (seg.wnd as u32) << tcb.snd_wscale;
		tcb.snd.wl1 = seg.seq;
		tcb.snd.wl2 = seg.ack;

		if tcb.snd.wnd > 0 {
			tcb.persist_deadline = None;
			tcb.persist_backoff = policy.persist_min;
		}
	}

	// A single urgent mark; the furthest pointer wins.
	if seg.ctl.urg() && matches!(tcb.state, State::Established | State::FinWait1 | State::FinWait2) {
		let up = seg.seq.wrapping_add(seg.urg as u32);

		tcb.rcv.up = Some(match tcb.rcv.up {
			Some(cur) if seq_lt(up, cur) => cur,
			_ => up,
		});
	}

	let mut should_ack = false;

	if !seg.data.is_empty() && matches!(tcb.state, State::Established | State::FinWait1 | State::FinWait2) {
		let mut data = seg.data;
		let mut seq = seg.seq;

		// Drop the part we already hold.
		if seq_lt(seq, tcb.rcv.nxt) {
			let skip = tcb.rcv.nxt.wrapping_sub(seq) as usize;

			if skip >= data.len() {
				data.clear();
			} else {
				data.drain(..skip);
			}

			seq = tcb.rcv.nxt;
		}

		if !data.is_empty() {
			if seq == tcb.rcv.nxt {
				let n = tcb.rcv_ring.write(&data);
				tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(n as u32);
				coalesce(tcb);
			} else {
				// A hole precedes this data: park it for later.
				insert_ooo(tcb, seq, data);
			}

			should_ack = true;
		}

		tcb.idle_since = now;
	}

	if seg.ctl.fin() {
		if fin_at == tcb.rcv.nxt {
			// The FIN is exactly next in sequence: consume it.
			tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
			tcb.rx_closed = true;
			should_ack = true;

			match tcb.state {
				State::Established => tcb.state = State::CloseWait,
				State::FinWait1 => {
					if tcb.fin_acked() {
						tcb.state = State::TimeWait;
						tcb.timewait_deadline = Some(now + msl2);
						tcb.rtx_deadline = None;
					} else {
						tcb.state = State::Closing;
					}
				}
				State::FinWait2 => {
					tcb.state = State::TimeWait;
					tcb.timewait_deadline = Some(now + msl2);
					tcb.rtx_deadline = None;
				}
				_ => {}
			}

			trace!("tcp: {} sent FIN, now {:?}", tcb.remote, tcb.state);
		} else {
			// FIN past a gap: show the peer where we are.
			should_ack = true;
		}
	}

	// A retransmission reaching TimeWait restarts the linger.
	if tcb.state == State::TimeWait {
		tcb.timewait_deadline = Some(now + msl2);
		should_ack = true;
	}

	if should_ack {
		output::send_ack(ifaces, tcb, now);
	}

	output::pump(ifaces, tcb, now);

	after
}

/// Pulls parked segments that became contiguous into the receive ring.
fn coalesce(tcb: &mut Tcb) {
	while let Some(pos) = tcb.ooo.iter().position(|(seq, _)| seq_le(*seq, tcb.rcv.nxt)) {
		let (seq, data) = tcb.ooo.remove(pos);
		let end = seq.wrapping_add(data.len() as u32);

		// Entirely old data dissolves.
		if seq_le(end, tcb.rcv.nxt) {
			continue;
		}

		let skip = tcb.rcv.nxt.wrapping_sub(seq) as usize;
		let n = tcb.rcv_ring.write(&data[skip..]);
		tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(n as u32);

		if n < data.len() - skip {
			// The ring filled up; the rest stays lost until retransmitted.
			break;
		}
	}
}

/// Parks an out-of-order segment, keeping the list ordered and bounded.
fn insert_ooo(tcb: &mut Tcb, seq: u32, data: Vec<u8>) {
	use super::tcb::MAX_OOO;

	// Duplicates of a parked segment are not worth keeping.
	if tcb.ooo.iter().any(|(s, d)| *s == seq && d.len() >= data.len()) {
		return;
	}

	if tcb.ooo.len() >= MAX_OOO {
		return;
	}

	let pos = tcb.ooo.partition_point(|(s, _)| seq_lt(*s, seq));
	tcb.ooo.insert(pos, (seq, data));
}
