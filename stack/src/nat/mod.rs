//! NAPT: classification of traffic between the public and private sides,
//! port-forward rules, session binding, rewriting, and hairpinning.

use core::net::Ipv4Addr;
use std::time::{Duration, Instant};

use collections::bytes::NetBuf;
use log::{debug, trace};
use rand::rngs::SmallRng;
use utils::error::{Error, Result};

use crate::iface::{IfaceId, Interface};
use crate::icmp;
use crate::ip::v4::{self, DestClass, Info};
use crate::ip::{Checksum, Protocol};
use crate::Net;

mod session;

pub use session::{NatProto, Timeouts};

use session::{Session, Table};

/// One static mapping from a public port range onto a private host.
#[derive(Clone, Copy)]
pub struct PortForward {
	/// TCP or UDP; ICMP queries are never statically forwarded.
	pub proto: NatProto,
	pub public_min: u16,
	pub public_max: u16,
	pub private_iface: IfaceId,
	pub private_addr: Ipv4Addr,
	/// The private port the bottom of the public range maps onto.
	pub private_port_min: u16,
}

impl PortForward {
	fn private_max(&self) -> u16 {
		self.private_port_min + (self.public_max - self.public_min)
	}
}

#[derive(Clone)]
pub struct NatConfig {
	pub public_iface: IfaceId,
	/// Which of the public interface's addresses is the translation address.
	pub public_addr_index: usize,
	pub private_ifaces: Vec<IfaceId>,
	pub rules: Vec<PortForward>,
	/// Dynamic port pool for TCP and UDP sessions.
	pub port_range: (u16, u16),
	/// Query-identifier pool for ICMP sessions.
	pub icmp_id_range: (u16, u16),
	pub max_sessions: usize,
	pub timeouts: Timeouts,
}

impl NatConfig {
	pub fn new(public_iface: IfaceId) -> Self {
		Self {
			public_iface,
			public_addr_index: 0,
			private_ifaces: Vec::new(),
			rules: Vec::new(),
			port_range: (49152, 65535),
			icmp_id_range: (0x8000, 0xffff),
			max_sessions: 64,
			timeouts: Timeouts {
				tcp: Duration::from_secs(7200),
				udp: Duration::from_secs(120),
				icmp: Duration::from_secs(60),
			},
		}
	}
}

pub(crate) struct Nat {
	pub cfg: NatConfig,
	pub running: bool,
	pub table: Table,
}

impl Nat {
	pub fn new(cfg: NatConfig) -> Self {
		let table = Table::new(cfg.max_sessions);
		Self { cfg, running: false, table }
	}
}

/// What the rewriter needs to know about the datagram in hand.
struct Parsed {
	hlen: usize,
	total: usize,
	proto: Protocol,
	nat_proto: NatProto,
	src: Ipv4Addr,
	dst: Ipv4Addr,
	sport: u16,
	dport: u16,
	/// ICMP message type, when the datagram is ICMP.
	icmp_kind: u8,
	/// ICMP query identifier, when the datagram is ICMP.
	icmp_id: u16,
}

fn parse(pkt: &NetBuf) -> Option<Parsed> {
	let mut head = [0u8; v4::HEADER_LEN];

	if pkt.read(0, &mut head) < head.len() {
		return None;
	}

	let header = utils::bytes::cast::<v4::Header, _>(&head[..]);

	let hlen = header.ver.ihl().value() as usize * 4;
	let total = header.len.get() as usize;
	let frag = header.frg.get();
	let proto = header.proto.get();

	// Translating a non-first fragment is impossible; the ports are not there.
	if frag.more() || frag.ofst().value() != 0 {
		debug!("nat: fragmented datagram not translated");
		return None;
	}

	if total > pkt.len() || hlen + 8 > total {
		return None;
	}

	let nat_proto = NatProto::of(proto)?;

	let mut transport = [0u8; 8];
	pkt.read(hlen, &mut transport);

	let (sport, dport, icmp_kind, icmp_id) = match nat_proto {
		NatProto::Icmp => {
			let id = u16::from_be_bytes([transport[4], transport[5]]);
			(0, 0, transport[0], id)
		}
		_ => {
			let sport = u16::from_be_bytes([transport[0], transport[1]]);
			let dport = u16::from_be_bytes([transport[2], transport[3]]);
			(sport, dport, 0, 0)
		}
	};

	Some(Parsed {
		hlen,
		total,
		proto,
		nat_proto,
		src: header.src,
		dst: header.dst,
		sport,
		dport,
		icmp_kind,
		icmp_id,
	})
}

/// Entry point for datagrams addressed to someone else.
pub(crate) fn forward(net: &mut Net, iface: usize, mut pkt: NetBuf, now: Instant) {
	let Net { nat, ifaces, rng, .. } = net;

	let Some(nat) = nat.as_mut() else {
		return trace!("nat: not configured, datagram dropped");
	};

	if !nat.running {
		return;
	}

	let public = nat.cfg.public_iface.0;
	let is_public = iface == public;
	let is_private = nat.cfg.private_ifaces.iter().any(|i| i.0 == iface);

	if !is_public && !is_private {
		return trace!("nat: arrival interface is on neither side");
	}

	let Some(p) = parse(&pkt) else { return };

	// Never forwarded, in any direction.
	if p.dst.is_broadcast() || p.dst.is_multicast() || p.dst.is_link_local() || p.src.is_link_local() {
		return;
	}

	// A hop is a hop: TTL goes down, and zero means the packet dies here.
	let mut ttl = [0u8; 1];
	pkt.read(8, &mut ttl);

	if ttl[0] <= 1 {
		let info = Info {
			src: p.src,
			dst: p.dst,
			proto: p.proto,
			class: DestClass::Unicast,
			hlen: p.hlen,
		};

		icmp::emit_error(&mut ifaces[iface], &info, &pkt, icmp::Kind::TimeExceeded, icmp::CODE_TTL_EXCEEDED, now);
		return;
	}

	let _ = pkt.write_at(8, &[ttl[0] - 1]);

	let result = if is_public {
		inbound(nat, ifaces, pkt, p, now)
	} else {
		outbound(nat, ifaces, rng, iface, pkt, p, now)
	};

	if let Err(err) = result {
		trace!("nat: datagram dropped: {err}");
	}
}

/// Offers a datagram addressed to one of our own unicasts to the translator.
///
/// Inbound NAT traffic is addressed to the public address itself, so it
/// classifies as unicast-to-self; it belongs to the translator whenever a
/// port-forward rule or a live session claims it. An unclaimed datagram is
/// handed back for ordinary local delivery.
pub(crate) fn intercept(net: &mut Net, iface: usize, mut pkt: NetBuf, now: Instant) -> Option<NetBuf> {
	let Net { nat, ifaces, .. } = net;

	let Some(nat) = nat.as_mut() else { return Some(pkt) };

	if !nat.running || iface != nat.cfg.public_iface.0 {
		return Some(pkt);
	}

	let Ok(public) = public_addr(nat, ifaces) else { return Some(pkt) };

	let Some(p) = parse(&pkt) else { return Some(pkt) };

	if p.dst != public {
		return Some(pkt);
	}

	let claimed_by_rule = nat
		.cfg
		.rules
		.iter()
		.any(|r| r.proto == p.nat_proto && (r.public_min..=r.public_max).contains(&p.dport));

	let claimed_by_session = match p.nat_proto {
		NatProto::Icmp => {
			matches!(p.icmp_kind, 0 | 14 | 18) && nat.table.find_inbound(p.nat_proto, p.src, p.sport, p.icmp_id).is_some()
		}
		_ => nat.table.find_inbound(p.nat_proto, p.src, p.sport, p.dport).is_some(),
	};

	if !claimed_by_rule && !claimed_by_session {
		return Some(pkt);
	}

	// The datagram is being forwarded after all, so the hop rules apply.
	let mut ttl = [0u8; 1];
	pkt.read(8, &mut ttl);

	if ttl[0] <= 1 {
		let info = Info {
			src: p.src,
			dst: p.dst,
			proto: p.proto,
			class: DestClass::Unicast,
			hlen: p.hlen,
		};

		icmp::emit_error(&mut ifaces[iface], &info, &pkt, icmp::Kind::TimeExceeded, icmp::CODE_TTL_EXCEEDED, now);
		return None;
	}

	let _ = pkt.write_at(8, &[ttl[0] - 1]);

	if let Err(err) = inbound(nat, ifaces, pkt, p, now) {
		trace!("nat: inbound datagram dropped: {err}");
	}

	None
}

/// The public unicast the translator speaks as.
fn public_addr(nat: &Nat, ifaces: &[Interface]) -> Result<Ipv4Addr> {
	let ifc = &ifaces[nat.cfg.public_iface.0];

	ifc.addrs
		.get(nat.cfg.public_addr_index)
		.filter(|e| e.state == crate::iface::AddrState::Valid)
		.map(|e| e.addr)
		.ok_or(Error::NotConfigured)
}

/// Private-to-public translation.
fn outbound(
	nat: &mut Nat,
	ifaces: &mut [Interface],
	rng: &mut SmallRng,
	iface: usize,
	mut pkt: NetBuf,
	p: Parsed,
	now: Instant,
) -> Result {
	let public = public_addr(nat, ifaces)?;

	// Traffic to the router itself is not ours to forward. The public address
	// is the exception: that is the hairpin path.
	if p.dst != public && ifaces.iter().any(|f| f.is_local_unicast(p.dst)) {
		return Err(Error::InvalidAddress);
	}

	let private_id = match p.nat_proto {
		NatProto::Icmp => p.icmp_id,
		_ => p.sport,
	};

	// Static rules own their port ranges; dynamic sessions fill in the rest.
	let rule = nat.cfg.rules.iter().find(|r| {
		r.proto == p.nat_proto
			&& r.private_iface.0 == iface
			&& r.private_addr == p.src
			&& (r.private_port_min..=r.private_max()).contains(&p.sport)
	});

	let public_id = match rule {
		Some(r) => r.public_min + (p.sport - r.private_port_min),
		None => match nat.table.find_outbound(p.nat_proto, iface, p.src, private_id, p.dst, p.dport) {
			Some(s) => {
				s.last_active = now;
				s.public_id
			}
			None => {
				// Only query messages may open an ICMP session.
				if p.nat_proto == NatProto::Icmp && !matches!(p.icmp_kind, 8 | 13 | 17) {
					return Err(Error::InvalidSession);
				}

				let range = match p.nat_proto {
					NatProto::Icmp => nat.cfg.icmp_id_range,
					_ => nat.cfg.port_range,
				};

				let id = nat.table.alloc_id(p.nat_proto, range, rng)?;

				nat.table.insert(Session {
					proto: p.nat_proto,
					private_iface: iface,
					private_addr: p.src,
					private_id,
					public_id: id,
					remote_addr: p.dst,
					remote_port: p.dport,
					last_active: now,
					in_use: true,
				});

				trace!("nat: session {}:{} -> {}:{}", p.src, private_id, public, id);
				id
			}
		},
	};

	// Rewrite the source to our public identity.
	pkt.write_at(12, &public.octets())?;

	match p.nat_proto {
		NatProto::Icmp => pkt.write_at(p.hlen + 4, &public_id.to_be_bytes())?,
		_ => pkt.write_at(p.hlen, &public_id.to_be_bytes())?,
	}

	refresh_checksums(&mut pkt, &p)?;

	// Hairpinning: a private host reaching the public address of another
	// private host turns straight around through the inbound path.
	if p.dst == public {
		let Some(p) = parse(&pkt) else { return Err(Error::InvalidPacket) };
		return inbound(nat, ifaces, pkt, p, now);
	}

	transmit(&mut ifaces[nat.cfg.public_iface.0], pkt, now)
}

/// Public-to-private translation.
fn inbound(nat: &mut Nat, ifaces: &mut [Interface], mut pkt: NetBuf, p: Parsed, now: Instant) -> Result {
	let public = public_addr(nat, ifaces)?;

	if p.dst != public {
		return Err(Error::InvalidAddress);
	}

	// Port-forward rules match first.
	let rule = nat.cfg.rules.iter().find(|r| {
		r.proto == p.nat_proto && (r.public_min..=r.public_max).contains(&p.dport)
	});

	let (out_iface, new_dst, new_id) = match rule {
		Some(r) => (
			r.private_iface.0,
			r.private_addr,
			r.private_port_min + (p.dport - r.public_min),
		),
		None => {
			let public_id = match p.nat_proto {
				NatProto::Icmp => {
					// Only the reply half of a query can come back inbound.
					if !matches!(p.icmp_kind, 0 | 14 | 18) {
						return Err(Error::InvalidSession);
					}
					p.icmp_id
				}
				_ => p.dport,
			};

			let Some(s) = nat.table.find_inbound(p.nat_proto, p.src, p.sport, public_id) else {
				debug!("nat: no session for inbound {}:{}", p.src, p.sport);
				return Err(Error::InvalidSession);
			};

			s.last_active = now;
			(s.private_iface, s.private_addr, s.private_id)
		}
	};

	// Rewrite the destination back to the private side.
	pkt.write_at(16, &new_dst.octets())?;

	match p.nat_proto {
		NatProto::Icmp => pkt.write_at(p.hlen + 4, &new_id.to_be_bytes())?,
		_ => pkt.write_at(p.hlen + 2, &new_id.to_be_bytes())?,
	}

	refresh_checksums(&mut pkt, &p)?;

	transmit(&mut ifaces[out_iface], pkt, now)
}

/// Recomputes the header and transport checksums after a rewrite.
fn refresh_checksums(pkt: &mut NetBuf, p: &Parsed) -> Result {
	// IP header: zero the field, sum the header area, write it back.
	let mut head = vec![0u8; p.hlen];
	pkt.read(0, &mut head);
	head[10..12].fill(0);

	let sum = Checksum::of(&head).end();
	head[10..12].copy_from_slice(&sum);
	pkt.write_at(0, &head)?;

	let header = utils::bytes::cast::<v4::Header, _>(&head[..v4::HEADER_LEN]);
	let (src, dst) = (header.src, header.dst);

	let tlen = p.total - p.hlen;

	match p.nat_proto {
		NatProto::Tcp => {
			pkt.write_at(p.hlen + 16, &[0, 0])?;

			let mut csum = Checksum::pseudo(src, dst, Protocol::Tcp, tlen as u16);
			csum.push_buf(pkt, p.hlen, tlen);
			pkt.write_at(p.hlen + 16, &csum.end())?;
		}
		NatProto::Udp => {
			let mut field = [0u8; 2];
			pkt.read(p.hlen + 6, &mut field);

			// A datagram sent without a checksum keeps none.
			if field != [0, 0] {
				pkt.write_at(p.hlen + 6, &[0, 0])?;

				let mut csum = Checksum::pseudo(src, dst, Protocol::Udp, tlen as u16);
				csum.push_buf(pkt, p.hlen, tlen);
				let sum = csum.end();

				pkt.write_at(p.hlen + 6, &if sum == [0, 0] { [0xff, 0xff] } else { sum })?;
			}
		}
		NatProto::Icmp => {
			// The ICMP checksum covers the message only, no pseudo-header.
			pkt.write_at(p.hlen + 2, &[0, 0])?;

			let mut csum = Checksum::default();
			csum.push_buf(pkt, p.hlen, tlen);
			pkt.write_at(p.hlen + 2, &csum.end())?;
		}
	}

	Ok(())
}

fn transmit(ifc: &mut Interface, pkt: NetBuf, now: Instant) -> Result {
	match v4::forward_transmit(ifc, pkt, now) {
		Ok(()) | Err(Error::InProgress) => Ok(()),
		Err(err) => Err(err),
	}
}

/// Retires idle sessions.
pub(crate) fn tick(net: &mut Net, now: Instant) {
	if let Some(nat) = net.nat.as_mut() {
		if nat.running {
			let timeouts = nat.cfg.timeouts;
			nat.table.expire(&timeouts, now);
		}
	}
}
