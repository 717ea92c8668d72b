//! Address resolution: the per-interface cache, the wait queue for frames
//! pending a resolution, and the probe/announce side of conflict detection.

use core::net::Ipv4Addr;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bilge::prelude::*;
use collections::bytes::NetBuf;
use log::{debug, trace, warn};
use utils::bytes::Cast;
use utils::endian::{b, u16be};
use utils::error::{Error, Result};

use crate::driver::TxAncillary;
use crate::eth::{self, EtherType, MacAddr};
use crate::iface::Interface;

/// Spacing of address-conflict-detection probes.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on cache entries per interface.
const MAX_ENTRIES: usize = 16;
/// Upper bound on frames parked behind one unresolved entry.
const MAX_QUEUE: usize = 4;
/// Requests sent for one resolution before giving up.
const MAX_REQUESTS: u8 = 3;
/// Base retransmission interval; doubles per attempt.
const REQUEST_INTERVAL: Duration = Duration::from_millis(500);
/// Idle time after which a reachable entry must be confirmed again.
const REACHABLE_LIFETIME: Duration = Duration::from_secs(60);
/// Minimum spacing of the re-probes a stale entry triggers while in use.
const STALE_PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[bitsize(16)]
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, FromBits)]
pub enum Op {
	Request = 1,
	Reply = 2,
	#[fallback]
	Unknown(u16),
}

#[derive(Cast)]
#[repr(C)]
pub struct Packet {
	pub htype: u16be,
	pub ptype: b<EtherType>,
	pub hlen: u8,
	pub plen: u8,
	pub op: b<Op>,
	pub sha: MacAddr,
	pub spa: Ipv4Addr,
	pub tha: MacAddr,
	pub tpa: Ipv4Addr,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum State {
	/// Resolution outstanding; the queue may hold frames.
	Incomplete,
	Reachable,
	/// Usable, but re-probed on next use.
	Stale,
	/// Configured by hand; never expires or updates.
	Permanent,
}

/// One frame parked until its next hop resolves.
pub(crate) struct Pending {
	pub pkt: NetBuf,
	pub tx: TxAncillary,
}

pub(crate) struct Entry {
	pub ip: Ipv4Addr,
	pub mac: MacAddr,
	pub state: State,
	/// Requests sent for the current resolution or re-probe.
	pub attempts: u8,
	/// Timestamp of the last state transition or confirmation.
	pub since: Instant,
	pub queue: VecDeque<Pending>,
}

#[derive(Default)]
pub(crate) struct Cache {
	entries: Vec<Entry>,
}

impl Cache {
	pub fn lookup(&self, ip: Ipv4Addr) -> Option<&Entry> {
		self.entries.iter().find(|e| e.ip == ip)
	}

	fn position(&self, ip: Ipv4Addr) -> Option<usize> {
		self.entries.iter().position(|e| e.ip == ip)
	}

	/// Inserts a fresh entry, evicting the oldest non-permanent one on overflow.
	fn insert(&mut self, entry: Entry) -> Option<&mut Entry> {
		if self.entries.len() == MAX_ENTRIES {
			let victim = self
				.entries
				.iter()
				.enumerate()
				.filter(|(_, e)| e.state != State::Permanent)
				.min_by_key(|(_, e)| e.since)
				.map(|(i, _)| i)?;

			self.entries.swap_remove(victim);
		}

		self.entries.push(entry);
		self.entries.last_mut()
	}

	pub fn add_permanent(&mut self, ip: Ipv4Addr, mac: MacAddr, now: Instant) -> Result {
		if let Some(i) = self.position(ip) {
			self.entries.swap_remove(i);
		}

		self.insert(Entry {
			ip,
			mac,
			state: State::Permanent,
			attempts: 0,
			since: now,
			queue: VecDeque::new(),
		})
		.map(|_| ())
		.ok_or(Error::OutOfMemory)
	}

	/// Drops every entry along with its queued frames.
	pub fn flush(&mut self) {
		self.entries.retain(|e| e.state == State::Permanent);
	}
}

/// What `resolve` decided to do once the cache borrow is released.
enum Action {
	Transmit(MacAddr, NetBuf, TxAncillary),
	TransmitAndProbe(MacAddr, Ipv4Addr, NetBuf, TxAncillary),
	Queued,
	Request(Ipv4Addr),
}

/// Sends `pkt` toward the on-link `next_hop`, resolving its MAC first.
///
/// `Err(InProgress)` means the packet was queued behind an outstanding
/// resolution; callers treat that as success.
pub(crate) fn resolve(ifc: &mut Interface, next_hop: Ipv4Addr, pkt: NetBuf, now: Instant) -> Result {
	let tx = ifc.tx_ancillary();

	let action = match ifc.arp.position(next_hop) {
		Some(i) => {
			let entry = &mut ifc.arp.entries[i];

			match entry.state {
				State::Permanent => Action::Transmit(entry.mac, pkt, tx),
				State::Reachable => {
					if now - entry.since >= REACHABLE_LIFETIME {
						trace!("arp: {next_hop} became stale");
						entry.state = State::Stale;
						entry.since = now;
					}
					Action::Transmit(entry.mac, pkt, tx)
				}
				// Still usable, but confirm the mapping in the background.
				State::Stale => {
					if now - entry.since >= STALE_PROBE_INTERVAL {
						entry.since = now;
						Action::TransmitAndProbe(entry.mac, entry.ip, pkt, tx)
					} else {
						Action::Transmit(entry.mac, pkt, tx)
					}
				}
				State::Incomplete => {
					if entry.queue.len() == MAX_QUEUE {
						debug!("arp: queue full for {next_hop}, dropping oldest");
						entry.queue.pop_front();
					}
					entry.queue.push_back(Pending { pkt, tx });
					Action::Queued
				}
			}
		}
		None => {
			let mut queue = VecDeque::new();
			queue.push_back(Pending { pkt, tx });

			match ifc.arp.insert(Entry {
				ip: next_hop,
				mac: MacAddr::ZERO,
				state: State::Incomplete,
				attempts: 1,
				since: now,
				queue,
			}) {
				Some(_) => Action::Request(next_hop),
				None => return Err(Error::OutOfMemory),
			}
		}
	};

	match action {
		Action::Transmit(mac, pkt, tx) => eth::transmit(ifc, mac, EtherType::Ipv4, pkt, tx),
		Action::TransmitAndProbe(mac, ip, pkt, tx) => {
			send_request(ifc, ip);
			eth::transmit(ifc, mac, EtherType::Ipv4, pkt, tx)
		}
		Action::Queued => Err(Error::InProgress),
		Action::Request(ip) => {
			send_request(ifc, ip);
			Err(Error::InProgress)
		}
	}
}

/// Handles one received ARP packet.
pub(crate) fn input(ifc: &mut Interface, payload: &[u8], now: Instant) {
	let Some(pkt) = payload.get(..core::mem::size_of::<Packet>()).map(utils::bytes::cast::<Packet, _>) else {
		return debug!("arp: truncated packet");
	};

	if pkt.htype.get() != 1 || pkt.ptype.get() != EtherType::Ipv4 || pkt.hlen != 6 || pkt.plen != 4 {
		return debug!("arp: unsupported packet");
	}

	let (op, sha, spa, tpa) = (pkt.op.get(), pkt.sha, pkt.spa, pkt.tpa);

	if sha.is_multicast() || sha.is_zero() || sha == ifc.mac {
		return;
	}

	// A sender claiming one of our addresses is a conflict; an all-zero sender
	// probing for a tentative address of ours is another station's ACD.
	for entry in &mut ifc.addrs {
		let claimed = spa == entry.addr;
		let probed = spa.is_unspecified() && tpa == entry.addr && entry.state == crate::iface::AddrState::Tentative;

		if claimed || probed {
			warn!("{}: {} defends {}", ifc.name, sha, entry.addr);
			entry.conflict = true;
			return;
		}
	}

	let target_is_us = ifc.is_local_unicast(tpa) || ifc.is_tentative(tpa);

	// Learn or refresh the sender mapping.
	let mut drain = Vec::new();

	if !spa.is_unspecified() {
		match ifc.arp.position(spa) {
			Some(i) => {
				let entry = &mut ifc.arp.entries[i];

				if entry.state != State::Permanent {
					let was_incomplete = entry.state == State::Incomplete;
					entry.mac = sha;
					entry.state = State::Reachable;
					entry.since = now;
					entry.attempts = 0;

					if was_incomplete {
						drain = entry.queue.drain(..).collect();
					}
				}
			}
			// Only the target of the packet grows new entries.
			None if target_is_us => {
				ifc.arp.insert(Entry {
					ip: spa,
					mac: sha,
					state: State::Reachable,
					attempts: 0,
					since: now,
					queue: VecDeque::new(),
				});
			}
			None => {}
		}
	}

	// Flush frames that waited on this resolution, in their arrival order.
	for pending in drain {
		let _ = eth::transmit(ifc, sha, EtherType::Ipv4, pending.pkt, pending.tx);
	}

	if op == Op::Request && ifc.is_local_unicast(tpa) {
		send_reply(ifc, tpa, sha, spa);
	}
}

/// Retransmits outstanding requests and expires idle entries.
pub(crate) fn tick(ifc: &mut Interface, now: Instant) {
	let mut requests = Vec::new();

	ifc.arp.entries.retain_mut(|entry| match entry.state {
		State::Incomplete => {
			let interval = REQUEST_INTERVAL * 2u32.saturating_pow(entry.attempts.saturating_sub(1) as u32);

			if now - entry.since < interval {
				return true;
			}

			if entry.attempts >= MAX_REQUESTS {
				debug!("arp: giving up on {}, dropping {} queued", entry.ip, entry.queue.len());
				return false;
			}

			entry.attempts += 1;
			entry.since = now;
			requests.push(entry.ip);
			true
		}
		State::Reachable => {
			if now - entry.since >= REACHABLE_LIFETIME {
				entry.state = State::Stale;
				entry.since = now;
			}
			true
		}
		_ => true,
	});

	for ip in requests {
		send_request(ifc, ip);
	}
}

fn send(ifc: &mut Interface, dst: MacAddr, op: Op, sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) {
	let mut buf = NetBuf::alloc(crate::HEADROOM);

	let Ok(pkt) = buf.prepend_obj::<Packet>() else { return };

	pkt.htype = 1u16.into();
	pkt.ptype = EtherType::Ipv4.into();
	pkt.hlen = 6;
	pkt.plen = 4;
	pkt.op = op.into();
	pkt.sha = sha;
	pkt.spa = spa;
	pkt.tha = tha;
	pkt.tpa = tpa;

	let tx = ifc.tx_ancillary();

	if let Err(err) = eth::transmit(ifc, dst, EtherType::Arp, buf, tx) {
		debug!("arp: transmit failed: {err}");
	}
}

pub(crate) fn send_request(ifc: &mut Interface, target: Ipv4Addr) {
	let spa = ifc.source_for(target).unwrap_or(Ipv4Addr::UNSPECIFIED);
	let mac = ifc.mac;
	send(ifc, MacAddr::BROADCAST, Op::Request, mac, spa, MacAddr::ZERO, target);
}

/// Conflict-detection probe: all-zero sender address, per RFC 5227.
pub(crate) fn send_probe(ifc: &mut Interface, addr: Ipv4Addr) {
	let mac = ifc.mac;
	send(ifc, MacAddr::BROADCAST, Op::Request, mac, Ipv4Addr::UNSPECIFIED, MacAddr::ZERO, addr);
}

/// Gratuitous announcement once an address has been claimed.
pub(crate) fn send_announce(ifc: &mut Interface, addr: Ipv4Addr) {
	let mac = ifc.mac;
	send(ifc, MacAddr::BROADCAST, Op::Request, mac, addr, MacAddr::ZERO, addr);
}

fn send_reply(ifc: &mut Interface, our: Ipv4Addr, to_mac: MacAddr, to_ip: Ipv4Addr) {
	let mac = ifc.mac;
	send(ifc, to_mac, Op::Reply, mac, our, to_mac, to_ip);
}
