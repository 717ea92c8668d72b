//! Shared IP-layer types: version/protocol discriminators, type-of-service,
//! socket addresses, and the checksum engine.

use core::fmt::{self, Debug, Display};
use core::net::Ipv4Addr;

use bilge::prelude::*;
use utils::bytes::Cast;

mod checksum;

pub mod fragment;
pub mod v4;

pub use checksum::Checksum;

#[bitsize(4)]
#[derive(FromBits, PartialEq)]
pub enum Version {
	V4 = 4,
	V6 = 6,
	#[fallback]
	Unknown,
}

#[bitsize(8)]
#[derive(Clone, Copy, FromBits, Cast)]
#[repr(C)]
pub struct ToS {
	ecn: ECN,
	ds: DiffServ,
}

#[bitsize(6)]
#[derive(FromBits)]
pub enum DiffServ {
	Default = 0,
	#[fallback]
	Unknown,
}

#[bitsize(2)]
#[derive(FromBits)]
pub enum ECN {
	NotECT = 0b00,
	ECT1 = 0b01,
	ECT0 = 0b10,
	CE = 0b11,
}

#[repr(u8)]
#[bitsize(8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBits)]
pub enum Protocol {
	Icmp = 1,
	Tcp = 6,
	Udp = 17,
	#[fallback]
	Unknown(u8),
}

impl Protocol {
	pub fn number(self) -> u8 {
		self.into()
	}
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct SocketAddr {
	pub addr: Ipv4Addr,
	pub port: u16,
}

impl SocketAddr {
	pub fn new(addr: Ipv4Addr, port: u16) -> Self {
		Self { addr, port }
	}
}

impl From<core::net::SocketAddrV4> for SocketAddr {
	fn from(sock: core::net::SocketAddrV4) -> Self {
		Self { addr: *sock.ip(), port: sock.port() }
	}
}

impl Debug for SocketAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		<Self as Display>::fmt(self, f)
	}
}

impl Display for SocketAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.addr, self.port)
	}
}
