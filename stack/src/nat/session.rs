//! The translator's session table: one row per private flow, keyed on the
//! public side by the allocated port or ICMP query identifier.

use core::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::debug;
use rand::rngs::SmallRng;
use rand::Rng;
use utils::error::{Error, Result};

use crate::ip::Protocol;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NatProto {
	Tcp,
	Udp,
	Icmp,
}

impl NatProto {
	pub(crate) fn of(proto: Protocol) -> Option<Self> {
		match proto {
			Protocol::Tcp => Some(Self::Tcp),
			Protocol::Udp => Some(Self::Udp),
			Protocol::Icmp => Some(Self::Icmp),
			Protocol::Unknown(_) => None,
		}
	}
}

/// One binding between a private flow and its public identity.
pub(crate) struct Session {
	pub proto: NatProto,
	pub private_iface: usize,
	pub private_addr: Ipv4Addr,
	/// Source port, or ICMP query identifier, on the private side.
	pub private_id: u16,
	/// Allocated port, or ICMP query identifier, on the public side.
	pub public_id: u16,
	pub remote_addr: Ipv4Addr,
	/// Remote port; zero for ICMP sessions.
	pub remote_port: u16,
	pub last_active: Instant,
	pub in_use: bool,
}

/// Idle timeouts, per protocol.
#[derive(Clone, Copy)]
pub struct Timeouts {
	pub tcp: Duration,
	pub udp: Duration,
	pub icmp: Duration,
}

impl Timeouts {
	fn for_proto(&self, proto: NatProto) -> Duration {
		match proto {
			NatProto::Tcp => self.tcp,
			NatProto::Udp => self.udp,
			NatProto::Icmp => self.icmp,
		}
	}
}

pub(crate) struct Table {
	slots: Vec<Session>,
	cap: usize,
}

impl Table {
	pub fn new(cap: usize) -> Self {
		Self { slots: Vec::new(), cap }
	}

	fn live(&mut self) -> impl Iterator<Item = &mut Session> {
		self.slots.iter_mut().filter(|s| s.in_use)
	}

	/// The session a private-side packet belongs to.
	pub fn find_outbound(
		&mut self,
		proto: NatProto,
		iface: usize,
		addr: Ipv4Addr,
		id: u16,
		remote: Ipv4Addr,
		rport: u16,
	) -> Option<&mut Session> {
		self.live().find(move |s| {
			s.proto == proto
				&& s.private_iface == iface
				&& s.private_addr == addr
				&& s.private_id == id
				&& s.remote_addr == remote
				&& (s.proto == NatProto::Icmp || s.remote_port == rport)
		})
	}

	/// The session a public-side packet belongs to, by remote endpoint and public id.
	pub fn find_inbound(&mut self, proto: NatProto, remote: Ipv4Addr, rport: u16, public_id: u16) -> Option<&mut Session> {
		self.live().find(move |s| {
			s.proto == proto
				&& s.public_id == public_id
				&& s.remote_addr == remote
				&& (s.proto == NatProto::Icmp || s.remote_port == rport)
		})
	}

	fn id_in_use(&self, proto: NatProto, id: u16) -> bool {
		// ICMP identifiers and transport ports live in separate spaces.
		let icmp = proto == NatProto::Icmp;
		self.slots
			.iter()
			.any(|s| s.in_use && s.public_id == id && (s.proto == NatProto::Icmp) == icmp)
	}

	/// Allocates a public port or query identifier, unique across live sessions.
	pub fn alloc_id(&self, proto: NatProto, range: (u16, u16), rng: &mut SmallRng) -> Result<u16> {
		let (min, max) = range;
		let span = (max - min) as u32 + 1;
		let start: u32 = rng.gen_range(0..span);

		for i in 0..span {
			let id = min + ((start + i) % span) as u16;

			if !self.id_in_use(proto, id) {
				return Ok(id);
			}
		}

		Err(Error::OutOfMemory)
	}

	/// Adds a session, evicting the oldest by last activity when the table is full.
	pub fn insert(&mut self, session: Session) {
		if let Some(free) = self.slots.iter_mut().find(|s| !s.in_use) {
			*free = session;
			return;
		}

		if self.slots.len() < self.cap {
			self.slots.push(session);
			return;
		}

		let oldest = self
			.slots
			.iter_mut()
			.min_by_key(|s| s.last_active)
			.expect("table capacity is never zero");

		debug!("nat: session table full, evicting {}:{}", oldest.private_addr, oldest.private_id);
		*oldest = session;
	}

	/// Retires sessions idle beyond their protocol's timeout.
	pub fn expire(&mut self, timeouts: &Timeouts, now: Instant) {
		for s in self.slots.iter_mut().filter(|s| s.in_use) {
			if now - s.last_active >= timeouts.for_proto(s.proto) {
				debug!("nat: session {}:{} expired", s.private_addr, s.private_id);
				s.in_use = false;
			}
		}
	}

	pub fn clear(&mut self) {
		self.slots.clear();
	}

	#[cfg(test)]
	pub fn live_count(&self) -> usize {
		self.slots.iter().filter(|s| s.in_use).count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;

	fn session(proto: NatProto, public_id: u16, at: Instant) -> Session {
		Session {
			proto,
			private_iface: 1,
			private_addr: Ipv4Addr::new(192, 168, 1, 10),
			private_id: 40_000,
			public_id,
			remote_addr: Ipv4Addr::new(198, 51, 100, 7),
			remote_port: 80,
			last_active: at,
			in_use: true,
		}
	}

	#[test]
	fn alloc_is_unique_across_live_sessions() {
		let mut rng = SmallRng::seed_from_u64(1);
		let mut table = Table::new(8);
		let now = Instant::now();

		let a = table.alloc_id(NatProto::Udp, (6000, 6002), &mut rng).unwrap();
		table.insert(session(NatProto::Udp, a, now));
		let b = table.alloc_id(NatProto::Udp, (6000, 6002), &mut rng).unwrap();
		table.insert(session(NatProto::Udp, b, now));
		let c = table.alloc_id(NatProto::Udp, (6000, 6002), &mut rng).unwrap();
		table.insert(session(NatProto::Udp, c, now));

		let mut ids = [a, b, c];
		ids.sort();
		assert_eq!(ids, [6000, 6001, 6002]);

		// Exhausted range.
		assert!(table.alloc_id(NatProto::Udp, (6000, 6002), &mut rng).is_err());

		// ICMP identifiers do not collide with ports.
		assert!(table.alloc_id(NatProto::Icmp, (6000, 6002), &mut rng).is_ok());
	}

	#[test]
	fn overflow_evicts_oldest() {
		let mut table = Table::new(2);
		let base = Instant::now();

		table.insert(session(NatProto::Udp, 1, base + Duration::from_secs(5)));
		table.insert(session(NatProto::Udp, 2, base));
		table.insert(session(NatProto::Udp, 3, base + Duration::from_secs(9)));

		// The oldest by timestamp (public id 2) is the one replaced.
		assert!(table.find_inbound(NatProto::Udp, Ipv4Addr::new(198, 51, 100, 7), 80, 1).is_some());
		assert!(table.find_inbound(NatProto::Udp, Ipv4Addr::new(198, 51, 100, 7), 80, 2).is_none());
		assert!(table.find_inbound(NatProto::Udp, Ipv4Addr::new(198, 51, 100, 7), 80, 3).is_some());
	}

	#[test]
	fn expiry_is_per_protocol() {
		let mut table = Table::new(4);
		let now = Instant::now();

		table.insert(session(NatProto::Udp, 1, now));
		table.insert(session(NatProto::Tcp, 2, now));

		let timeouts = Timeouts {
			tcp: Duration::from_secs(7200),
			udp: Duration::from_secs(120),
			icmp: Duration::from_secs(60),
		};

		table.expire(&timeouts, now + Duration::from_secs(300));

		assert_eq!(table.live_count(), 1);
		assert!(table.find_inbound(NatProto::Tcp, Ipv4Addr::new(198, 51, 100, 7), 80, 2).is_some());
	}
}
