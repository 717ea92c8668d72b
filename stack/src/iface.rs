//! Per-link state: addresses, MTU, link flag, the driver, and the tables that
//! live per interface (ARP cache, fragment store, multicast filter).

use core::net::Ipv4Addr;
use std::time::Instant;

use hashbrown::HashMap;
use log::{info, warn};
use utils::error::{Error, Result};

use crate::arp;
use crate::driver::{LinkChange, LinkDriver};
use crate::eth::MacAddr;
use crate::ip::fragment;

/// Stable handle to one interface, valid for the life of the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IfaceId(pub(crate) usize);

/// Most devices carry one address; a small fixed bound keeps the array cheap.
pub(crate) const MAX_ADDRS: usize = 4;

/// Probes sent before a tentative address is claimed.
const ACD_PROBES: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrState {
	/// Uniqueness on the link is still being verified; traffic to it is dropped.
	Tentative,
	Valid,
}

pub(crate) struct AddrEntry {
	pub addr: Ipv4Addr,
	pub state: AddrState,
	pub conflict: bool,
	pub mask: Ipv4Addr,
	pub gateway: Option<Ipv4Addr>,
	/// Conflict-detection probes sent so far.
	pub probes: u8,
	/// When the next probe fires, or the claim completes.
	pub probe_at: Option<Instant>,
}

impl AddrEntry {
	pub fn prefix(&self) -> u32 {
		u32::from(self.addr) & u32::from(self.mask)
	}

	pub fn contains(&self, ip: Ipv4Addr) -> bool {
		u32::from(self.mask) != 0 && u32::from(ip) & u32::from(self.mask) == self.prefix()
	}

	pub fn directed_broadcast(&self) -> Ipv4Addr {
		Ipv4Addr::from(self.prefix() | !u32::from(self.mask))
	}
}

/// One IPv4 address assignment.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Config {
	pub addr: Ipv4Addr,
	pub mask: Ipv4Addr,
	pub gateway: Option<Ipv4Addr>,
}

pub(crate) struct Interface {
	pub name: String,
	pub mac: MacAddr,
	pub mtu: usize,
	pub link_up: bool,
	pub driver: Box<dyn LinkDriver>,
	pub addrs: Vec<AddrEntry>,
	/// Resolver addresses handed to us by configuration; consumed by the
	/// name-service layers living above this crate.
	pub dns: Vec<Ipv4Addr>,
	pub arp: arp::Cache,
	pub frags: fragment::Store,
	/// Multicast group membership, reference counted per joiner.
	pub multicast: HashMap<Ipv4Addr, u32>,
	/// Source of the shared identification field for egress fragments.
	pub ident: u16,
	/// Managed-switch port this interface maps to, when tail-tagged.
	pub switch_port: Option<u8>,
}

impl Interface {
	pub fn new(name: String, mac: MacAddr, driver: Box<dyn LinkDriver>, switch_port: Option<u8>) -> Self {
		let mtu = driver.mtu();

		Self {
			name,
			mac,
			mtu,
			link_up: false,
			driver,
			addrs: Vec::new(),
			dns: Vec::new(),
			arp: arp::Cache::default(),
			frags: fragment::Store::default(),
			multicast: HashMap::new(),
			ident: 0,
			switch_port,
		}
	}

	pub fn add_addr(&mut self, cfg: Ipv4Config, now: Instant) -> Result {
		if !is_assignable(cfg.addr) {
			return Err(Error::InvalidAddress);
		}

		if self.addrs.iter().any(|e| e.addr == cfg.addr) {
			return Err(Error::AlreadyConfigured);
		}

		if self.addrs.len() == MAX_ADDRS {
			return Err(Error::OutOfMemory);
		}

		self.addrs.push(AddrEntry {
			addr: cfg.addr,
			state: AddrState::Tentative,
			conflict: false,
			mask: cfg.mask,
			gateway: cfg.gateway,
			probes: 0,
			probe_at: Some(now),
		});

		Ok(())
	}

	pub fn remove_addr(&mut self, addr: Ipv4Addr) -> Result {
		let before = self.addrs.len();
		self.addrs.retain(|e| e.addr != addr);

		(self.addrs.len() != before).then_some(()).ok_or(Error::AddressNotFound)
	}

	/// Whether `ip` is one of our Valid unicasts.
	pub fn is_local_unicast(&self, ip: Ipv4Addr) -> bool {
		self.addrs.iter().any(|e| e.state == AddrState::Valid && e.addr == ip)
	}

	pub fn is_tentative(&self, ip: Ipv4Addr) -> bool {
		self.addrs.iter().any(|e| e.state == AddrState::Tentative && e.addr == ip)
	}

	pub fn is_directed_broadcast(&self, ip: Ipv4Addr) -> bool {
		self.addrs
			.iter()
			.any(|e| e.state == AddrState::Valid && e.contains(ip) && e.directed_broadcast() == ip)
	}

	/// Whether `ip` sits on one of our subnets (reachable without a gateway).
	pub fn on_link(&self, ip: Ipv4Addr) -> bool {
		self.addrs.iter().any(|e| e.state == AddrState::Valid && e.contains(ip))
	}

	pub fn gateway(&self) -> Option<Ipv4Addr> {
		self.addrs.iter().find_map(|e| (e.state == AddrState::Valid).then_some(e.gateway)?)
	}

	/// Picks the source address for traffic toward `dst`: same-subnet first.
	pub fn source_for(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
		let valid = || self.addrs.iter().filter(|e| e.state == AddrState::Valid);

		valid()
			.find(|e| e.contains(dst))
			.or_else(|| valid().next())
			.map(|e| e.addr)
	}

	pub fn joined(&self, group: Ipv4Addr) -> bool {
		self.multicast.contains_key(&group)
	}

	pub fn join_multicast(&mut self, group: Ipv4Addr) -> Result {
		if !group.is_multicast() {
			return Err(Error::InvalidAddress);
		}

		let count = self.multicast.entry(group).or_insert(0);
		*count += 1;

		// First joiner opens the hardware filter.
		if *count == 1 {
			self.sync_mac_filter()?;
		}

		Ok(())
	}

	pub fn leave_multicast(&mut self, group: Ipv4Addr) -> Result {
		let Some(count) = self.multicast.get_mut(&group) else {
			return Err(Error::AddressNotFound);
		};

		*count -= 1;

		if *count == 0 {
			self.multicast.remove(&group);
			self.sync_mac_filter()?;
		}

		Ok(())
	}

	fn sync_mac_filter(&mut self) -> Result {
		let macs: Vec<MacAddr> = self.multicast.keys().map(|g| MacAddr::for_multicast(*g)).collect();
		self.driver.set_mac_filter(&macs)
	}

	/// The transmit ancillary every egress frame on this interface carries.
	pub fn tx_ancillary(&self) -> crate::driver::TxAncillary {
		crate::driver::TxAncillary { port: self.switch_port }
	}

	pub fn next_ident(&mut self) -> u16 {
		self.ident = self.ident.wrapping_add(1);
		self.ident
	}

	/// Applies a link transition reported by the driver.
	pub fn link_change(&mut self, change: LinkChange, now: Instant) {
		if change.up == self.link_up {
			return;
		}

		self.link_up = change.up;

		if change.up {
			info!("{}: link up", self.name);
			self.mtu = self.driver.mtu();
			let _ = self.driver.update_mac_config(&change);

			// Re-verify every address on the new segment.
			for entry in &mut self.addrs {
				entry.state = AddrState::Tentative;
				entry.conflict = false;
				entry.probes = 0;
				entry.probe_at = Some(now);
			}
		} else {
			info!("{}: link down", self.name);
			self.arp.flush();
			self.frags.flush();
		}
	}

	/// Drives address-conflict detection; claims addresses whose probes went unanswered.
	pub fn tick(&mut self, now: Instant) {
		if !self.link_up {
			return;
		}

		let mut announce = None;

		for entry in &mut self.addrs {
			let Some(at) = entry.probe_at else { continue };

			if now < at {
				continue;
			}

			if entry.conflict {
				warn!("{}: address {} is in use on the link", self.name, entry.addr);
				entry.probe_at = None;
				continue;
			}

			if entry.probes < ACD_PROBES {
				entry.probes += 1;
				entry.probe_at = Some(now + arp::PROBE_INTERVAL);
				announce = Some((entry.addr, true));
			} else {
				entry.state = AddrState::Valid;
				entry.probe_at = None;
				info!("{}: address {} is now valid", self.name, entry.addr);
				announce = Some((entry.addr, false));
			}
		}

		// The frames go out after the scan so the entry borrow is released.
		if let Some((addr, probe)) = announce {
			if probe {
				arp::send_probe(self, addr);
			} else {
				arp::send_announce(self, addr);
			}
		}
	}
}

/// Loopback, multicast, broadcast, and unspecified addresses cannot be assigned.
fn is_assignable(addr: Ipv4Addr) -> bool {
	!(addr.is_loopback() || addr.is_multicast() || addr.is_broadcast() || addr.is_unspecified())
}
