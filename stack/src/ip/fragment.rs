//! Datagram fragmentation state: the per-interface reassembly store.

use core::net::Ipv4Addr;
use std::time::{Duration, Instant};

use collections::bytes::NetBuf;
use log::debug;

use super::{Checksum, Protocol};

/// Datagrams being reassembled at once, per interface.
const MAX_PENDING: usize = 4;
/// How long an unfinished datagram may sit before it is dropped.
const LIFETIME: Duration = Duration::from_secs(15);
/// Reassembly never produces a datagram longer than the IP length field allows.
const MAX_DATAGRAM: u32 = 65_535;

/// The identifying attributes of a fragmented datagram.
#[derive(PartialEq, Eq, Clone, Copy)]
pub(crate) struct Key {
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
	pub proto: Protocol,
	pub ident: u16,
}

/// A single received fragment.
pub(crate) struct Fragment {
	/// Whether more fragments follow this one.
	pub more: bool,
	/// The byte offset of the fragment within the payload.
	pub start: u16,
	/// The payload bytes of the fragment.
	pub data: Box<[u8]>,
}

impl Fragment {
	/// The end offset of this fragment (non-inclusive).
	fn end(&self) -> u32 {
		self.start as u32 + self.data.len() as u32
	}
}

/// A partially-reassembled datagram.
struct Pending {
	key: Key,
	/// Fragments held so far, ordered by offset, overlap-free.
	fragments: Vec<Fragment>,
	/// Total payload length, once the tail fragment has arrived.
	total: Option<u32>,
	/// The IP header of the offset-zero fragment.
	header: Option<Vec<u8>>,
	expires: Instant,
}

impl Pending {
	/// Attempts to insert a fragment. Overlapping or duplicate fragments are refused.
	fn try_insert(&mut self, fragment: Fragment) -> Result<(), Fragment> {
		// Get the insert index of the new fragment.
		let idx = match self.fragments.binary_search_by_key(&fragment.start, |x| x.start) {
			Err(idx) => idx,
			// If the search finds a match for the fragment, then there is an overlap.
			Ok(_) => return Err(fragment),
		};

		// Check for overlap with the preceding fragment.
		if let Some(f) = idx.checked_sub(1).and_then(|i| self.fragments.get(i)) {
			if (fragment.start as u32) < f.end() {
				return Err(fragment);
			}
		}

		// Check for overlap with the following fragment.
		if let Some(f) = self.fragments.get(idx) {
			// A tail fragment with another fragment after it cannot be right.
			if !fragment.more {
				return Err(fragment);
			}

			if (f.start as u32) < fragment.end() {
				return Err(fragment);
			}
		}

		self.fragments.insert(idx, fragment);

		Ok(())
	}

	/// Whether the fragments now cover `[0, total)` without holes.
	fn complete(&self) -> bool {
		let Some(total) = self.total else { return false };

		let mut expected = 0u32;

		for f in &self.fragments {
			if f.start as u32 != expected {
				return false;
			}
			expected = f.end();
		}

		expected == total
	}

	/// Builds the full datagram, adopting the fragment allocations as chunks.
	fn assemble(mut self) -> Option<NetBuf> {
		let mut header = self.header?;
		let hlen = header.len();
		let total = hlen + self.total? as usize;

		// The reassembled header describes the whole datagram: full length, no
		// fragment fields, checksum redone.
		header[2..4].copy_from_slice(&(total as u16).to_be_bytes());
		header[6..8].fill(0);
		header[10..12].fill(0);
		let csum = Checksum::of(&header).end();
		header[10..12].copy_from_slice(&csum);

		let mut buf = NetBuf::new();
		buf.append_chunk(header.into_boxed_slice());

		for f in self.fragments.drain(..) {
			buf.append_chunk(f.data);
		}

		Some(buf)
	}
}

/// A datagram whose reassembly timer expired before it completed.
pub(crate) struct Expired {
	/// The first-fragment header plus leading payload bytes, for the ICMP notice.
	pub invoking: Vec<u8>,
}

pub(crate) enum Insert {
	/// The datagram completed; here it is, header included.
	Done(NetBuf),
	/// More fragments are still outstanding.
	Pending,
	/// The fragment was dropped.
	Rejected,
}

/// Stores datagram fragments for reassembly.
#[derive(Default)]
pub(crate) struct Store {
	slots: Vec<Pending>,
}

impl Store {
	/// Consumes one fragment; `header` accompanies the offset-zero fragment.
	pub fn insert(&mut self, key: Key, fragment: Fragment, header: Option<Vec<u8>>, now: Instant) -> Insert {
		// A fragment reaching past the maximum datagram size can never complete.
		if fragment.end() > MAX_DATAGRAM {
			debug!("reassembly: fragment beyond 65535, dropped");
			return Insert::Rejected;
		}

		let idx = match self.slots.iter().position(|p| p.key == key) {
			Some(idx) => idx,
			None => {
				// Make room by evicting the datagram closest to its deadline.
				if self.slots.len() == MAX_PENDING {
					let oldest = self.slots.iter().enumerate().min_by_key(|(_, p)| p.expires).map(|(i, _)| i).unwrap();
					self.slots.swap_remove(oldest);
				}

				self.slots.push(Pending {
					key,
					fragments: Vec::new(),
					total: None,
					header: None,
					expires: now + LIFETIME,
				});

				self.slots.len() - 1
			}
		};

		let slot = &mut self.slots[idx];

		if !fragment.more {
			match slot.total {
				Some(total) if total != fragment.end() => return Insert::Rejected,
				_ => slot.total = Some(fragment.end()),
			}
		}

		if fragment.start == 0 {
			slot.header = header;
		}

		if slot.try_insert(fragment).is_err() {
			debug!("reassembly: overlapping fragment, dropped");
			return Insert::Rejected;
		}

		if slot.complete() {
			let slot = self.slots.swap_remove(idx);

			return match slot.assemble() {
				Some(buf) => Insert::Done(buf),
				None => Insert::Rejected,
			};
		}

		Insert::Pending
	}

	/// Drops timed-out datagrams, reporting the ones whose first fragment had arrived.
	pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
		let mut expired = Vec::new();

		self.slots.retain_mut(|slot| {
			if now < slot.expires {
				return true;
			}

			debug!("reassembly: datagram from {} timed out", slot.key.src);

			// The sender is only told when the offset-zero fragment was seen.
			if let Some(header) = slot.header.take() {
				if let Some(first) = slot.fragments.first().filter(|f| f.start == 0) {
					let mut invoking = header;
					let n = first.data.len().min(8);
					invoking.extend_from_slice(&first.data[..n]);

					expired.push(Expired { invoking });
				}
			}

			false
		});

		expired
	}

	/// Empties the store, e.g. on link loss.
	pub fn flush(&mut self) {
		self.slots.clear();
	}
}
