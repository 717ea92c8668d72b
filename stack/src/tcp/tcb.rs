//! The transmission control block: per-connection state, sequence variables,
//! and the round-trip estimator.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use collections::ring::Ring;
use utils::error::Error;

use crate::ip::SocketAddr;

/// Out-of-order segments parked per connection.
pub(crate) const MAX_OOO: usize = 16;

/// Sequence-space comparison: is `a` strictly before `b`?
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
	!seq_lt(b, a)
}

/// Whether `lo <= x < hi` in sequence space.
pub(crate) fn seq_within(x: u32, lo: u32, hi: u32) -> bool {
	seq_le(lo, x) && seq_lt(x, hi)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
	/// Represents no connection state at all.
	Closed,
	/// Waiting for a connection request from any remote TCP peer and port.
	Listen,
	/// Waiting for a matching connection request after having sent one.
	SynSent,
	/// Waiting for a confirming acknowledgment after having both received and sent a connection request.
	SynReceived,
	/// An open connection; the normal state for the data transfer phase.
	Established,
	/// Waiting for a termination request from the remote peer, or an acknowledgment of the one sent.
	FinWait1,
	/// Waiting for a termination request from the remote peer.
	FinWait2,
	/// Waiting for a termination request from the local user.
	CloseWait,
	/// Waiting for a termination acknowledgment from the remote peer, both sides having requested it.
	Closing,
	/// Waiting for the acknowledgment of the termination request previously sent.
	LastAck,
	/// Waiting out the quiet time so old segments cannot hit a new incarnation.
	TimeWait,
}

/// The send sequence variables.
///
/// ```text
///          1         2          3          4
///     ----------|----------|----------|----------
///            SND.UNA    SND.NXT    SND.UNA
///                                 +SND.WND
/// ```
///
/// 1. old sequence numbers that have been acknowledged
/// 2. sequence numbers of unacknowledged data
/// 3. sequence numbers allowed for new data transmission
/// 4. future sequence numbers that are not yet allowed
pub(crate) struct SendSeq {
	/// unacknowledged
	pub una: u32,
	/// next
	pub nxt: u32,
	/// window
	pub wnd: u32,
	/// urgent pointer
	pub up: u32,
	/// segment sequence number used for last window update
	pub wl1: u32,
	/// segment acknowledgment number used for last window update
	pub wl2: u32,
}

/// The receive sequence variables.
///
/// ```text
///         1          2          3
///     ----------|----------|----------
///            RCV.NXT    RCV.NXT
///                      +RCV.WND
/// ```
///
/// 1. old sequence numbers that have been acknowledged
/// 2. sequence numbers allowed for new reception
/// 3. future sequence numbers that are not yet allowed
pub(crate) struct RecvSeq {
	/// next
	pub nxt: u32,
	/// urgent pointer, when an urgent mark is outstanding
	pub up: Option<u32>,
}

/// Timer and policy constants, all overridable through the builder.
#[derive(Clone)]
pub struct TcpPolicy {
	/// Offer the window-scale option on SYN.
	pub window_scale: bool,
	/// Offer SACK-permitted on SYN.
	pub sack_permitted: bool,
	/// Offer the timestamps option on SYN.
	pub timestamps: bool,
	/// Coalesce sub-MSS writes while data is in flight.
	pub nagle: bool,
	pub send_buf: usize,
	pub recv_buf: usize,
	pub rto_initial: Duration,
	pub rto_min: Duration,
	pub rto_max: Duration,
	/// Maximum segment lifetime; TimeWait lingers twice this.
	pub msl: Duration,
	/// Retransmissions before the connection is considered in trouble (advisory).
	pub r1: u32,
	/// Retransmissions before the connection is abandoned.
	pub r2: u32,
	pub persist_min: Duration,
	pub persist_max: Duration,
	pub keepalive_idle: Duration,
	pub keepalive_interval: Duration,
	pub keepalive_count: u32,
	pub backlog_max: usize,
}

impl Default for TcpPolicy {
	fn default() -> Self {
		Self {
			window_scale: true,
			sack_permitted: true,
			timestamps: false,
			nagle: true,
			send_buf: 8192,
			recv_buf: 8192,
			rto_initial: Duration::from_secs(1),
			rto_min: Duration::from_millis(200),
			rto_max: Duration::from_secs(60),
			msl: Duration::from_secs(30),
			r1: 3,
			r2: 8,
			persist_min: Duration::from_millis(500),
			persist_max: Duration::from_secs(60),
			keepalive_idle: Duration::from_secs(7200),
			keepalive_interval: Duration::from_secs(75),
			keepalive_count: 9,
			backlog_max: 16,
		}
	}
}

pub(crate) struct Tcb {
	pub state: State,
	pub local: SocketAddr,
	pub remote: SocketAddr,

	/// initial send sequence number
	pub iss: u32,
	/// initial receive sequence number
	pub irs: u32,

	pub snd: SendSeq,
	pub rcv: RecvSeq,

	/// Effective send segment size (peer MSS clamped to the path).
	pub mss: u16,

	/// Unacknowledged and unsent stream bytes. The range `[snd.una, snd.nxt)`
	/// of this ring is the retransmission queue, ordered by sequence.
	pub snd_ring: Ring,
	/// Sequence number of the first byte held in `snd_ring`.
	pub snd_base: u32,
	pub rcv_ring: Ring,

	/// Out-of-order segments keyed by sequence, ascending.
	pub ooo: Vec<(u32, Vec<u8>)>,

	// Retransmission state.
	pub rto: Duration,
	pub srtt: Option<Duration>,
	pub rttvar: Duration,
	pub rtx_deadline: Option<Instant>,
	pub rtx_count: u32,
	/// In-flight range end and send time of the segment being timed.
	/// Cleared on retransmission, per Karn's rule.
	pub rtt_sample: Option<(u32, Instant)>,
	pub dup_acks: u32,

	// Zero-window persistence.
	pub persist_deadline: Option<Instant>,
	pub persist_backoff: Duration,

	// Keepalive.
	pub keepalive: bool,
	pub keepalive_probes: u32,
	pub idle_since: Instant,

	pub timewait_deadline: Option<Instant>,

	// Options offered on our SYN, from policy.
	pub offer_wscale: bool,
	pub offer_sack: bool,
	pub offer_ts: bool,
	/// The MSS we announce, derived from the path MTU.
	pub adv_mss: u16,

	// Negotiated options.
	pub snd_wscale: u8,
	pub rcv_wscale: u8,
	pub sack_ok: bool,
	pub ts_ok: bool,
	pub ts_recent: u32,
	pub nagle: bool,

	/// Zero point of this connection's timestamp clock.
	pub epoch: Instant,

	/// An urgent mark at SND.UP is still ahead of the acknowledged data.
	pub urg_pending: bool,

	/// Sequence number our FIN occupies, once sent.
	pub fin_seq: Option<u32>,
	/// A FIN is owed to the peer as soon as the send ring drains.
	pub fin_pending: bool,
	/// The peer's FIN has been received and sequenced.
	pub rx_closed: bool,

	// Listener bookkeeping.
	pub backlog: VecDeque<usize>,
	pub backlog_max: usize,
	pub parent: Option<usize>,

	/// Latched fatal error, reported by every subsequent operation.
	pub err: Option<Error>,
	/// Advisory error from received ICMP; never fatal.
	pub soft_err: Option<Error>,

	/// Whether a user handle refers to this socket. Unaccepted children have none.
	pub has_handle: bool,

	/// Guards stale handles once the slot is reused.
	pub gen: u32,
}

impl Tcb {
	pub fn new(local: SocketAddr, remote: SocketAddr, iss: u32, policy: &TcpPolicy, now: Instant) -> Self {
		Self {
			state: State::Closed,
			local,
			remote,
			iss,
			irs: 0,
			snd: SendSeq { una: iss, nxt: iss, wnd: 0, up: 0, wl1: 0, wl2: 0 },
			rcv: RecvSeq { nxt: 0, up: None },
			mss: 536,
			snd_ring: Ring::with_capacity(policy.send_buf),
			snd_base: iss.wrapping_add(1),
			rcv_ring: Ring::with_capacity(policy.recv_buf),
			ooo: Vec::new(),
			rto: policy.rto_initial,
			srtt: None,
			rttvar: Duration::ZERO,
			rtx_deadline: None,
			rtx_count: 0,
			rtt_sample: None,
			dup_acks: 0,
			persist_deadline: None,
			persist_backoff: policy.persist_min,
			keepalive: false,
			keepalive_probes: 0,
			idle_since: now,
			timewait_deadline: None,
			offer_wscale: policy.window_scale,
			offer_sack: policy.sack_permitted,
			offer_ts: policy.timestamps,
			adv_mss: 536,
			snd_wscale: 0,
			rcv_wscale: 0,
			sack_ok: false,
			ts_ok: false,
			ts_recent: 0,
			nagle: policy.nagle,
			epoch: now,
			urg_pending: false,
			fin_seq: None,
			fin_pending: false,
			rx_closed: false,
			backlog: VecDeque::new(),
			backlog_max: policy.backlog_max,
			parent: None,
			err: None,
			soft_err: None,
			has_handle: true,
			gen: 0,
		}
	}

	/// Stream bytes sent but not yet acknowledged.
	pub fn in_flight(&self) -> usize {
		let sent = self.snd.nxt.wrapping_sub(self.snd_base) as usize;
		sent.min(self.snd_ring.len())
	}

	/// Stream bytes accepted from the user but not yet sent.
	pub fn unsent(&self) -> usize {
		self.snd_ring.len() - self.in_flight()
	}

	/// The receive window to advertise, silly-window avoidance applied.
	pub fn recv_window(&self) -> u32 {
		let free = self.rcv_ring.free() as u32;

		// Never open the window by less than one segment.
		if free < self.mss as u32 {
			0
		} else {
			free
		}
	}

	/// The window field for an outgoing segment, scaled down.
	pub fn advertised_window(&self) -> u16 {
		(self.recv_window() >> self.rcv_wscale).min(u16::MAX as u32) as u16
	}

	/// Feeds one round-trip measurement into the RFC 6298 estimator.
	pub fn rtt_update(&mut self, sample: Duration, policy: &TcpPolicy) {
		match self.srtt {
			None => {
				self.srtt = Some(sample);
				self.rttvar = sample / 2;
			}
			Some(srtt) => {
				let delta = if srtt > sample { srtt - sample } else { sample - srtt };
				self.rttvar = self.rttvar * 3 / 4 + delta / 4;
				self.srtt = Some(srtt * 7 / 8 + sample / 8);
			}
		}

		let srtt = self.srtt.unwrap();
		self.rto = (srtt + (self.rttvar * 4).max(Duration::from_millis(10))).clamp(policy.rto_min, policy.rto_max);
	}

	/// Whether `close()` has run; no more user data will be queued.
	pub fn send_closed(&self) -> bool {
		self.fin_pending || self.fin_seq.is_some()
	}

	/// Whether the retransmission timer should be running.
	pub fn needs_rtx_timer(&self) -> bool {
		self.in_flight() > 0 || (self.fin_seq.is_some() && !self.fin_acked()) || matches!(self.state, State::SynSent | State::SynReceived)
	}

	pub fn fin_acked(&self) -> bool {
		self.fin_seq.is_some_and(|fin| seq_lt(fin, self.snd.una))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sequence_comparison_wraps() {
		assert!(seq_lt(0xffff_fff0, 0x10));
		assert!(!seq_lt(0x10, 0xffff_fff0));
		assert!(seq_within(0, 0xffff_fff0, 0x10));
		assert!(!seq_within(0x10, 0xffff_fff0, 0x10));
	}

	#[test]
	fn rtt_estimator_converges() {
		let policy = TcpPolicy::default();
		let mut tcb = Tcb::new(
			SocketAddr::new([10, 0, 0, 1].into(), 1),
			SocketAddr::new([10, 0, 0, 2].into(), 2),
			0,
			&policy,
			Instant::now(),
		);

		for _ in 0..16 {
			tcb.rtt_update(Duration::from_millis(100), &policy);
		}

		let srtt = tcb.srtt.unwrap();
		assert!(srtt > Duration::from_millis(80) && srtt < Duration::from_millis(120));
		assert!(tcb.rto >= policy.rto_min);
	}
}
