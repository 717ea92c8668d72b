//! The capability bundle a link driver hands to the stack.
//!
//! The stack owns the driver; drivers never retain a reference back into the
//! stack. Everything a driver call could need is passed in as an argument.

use utils::error::Result;

use crate::eth::MacAddr;

/// Reported by the porting layer when the PHY notices a state change.
#[derive(Clone, Copy, Debug)]
pub struct LinkChange {
	pub up: bool,
	pub speed: LinkSpeed,
	pub duplex: Duplex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkSpeed {
	Mbps10,
	Mbps100,
	Mbps1000,
	Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Duplex {
	Half,
	Full,
	Unknown,
}

/// The tail-tag framing a managed switch expects on this port, if any.
///
/// The tag encodes the egress port and is appended after padding, just before
/// the CRC; on receive the trailing byte(s) name the ingress port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailTag {
	None,
	One,
	Two,
}

/// Per-frame transmit metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct TxAncillary {
	/// Egress switch port for tail-tag insertion.
	pub port: Option<u8>,
}

/// Per-frame receive metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct RxAncillary {
	/// Ingress switch port recovered from the tail tag.
	pub port: Option<u8>,
}

/// Register-level PHY access, for drivers that expose one.
pub trait Mdio {
	fn write_phy_reg(&mut self, phy: u8, reg: u8, value: u16) -> Result;
	fn read_phy_reg(&mut self, phy: u8, reg: u8) -> Result<u16>;
}

/// The operations the stack requires of a link driver.
///
/// `send` and the MTU are mandatory; the rest are optional capabilities with
/// inert defaults so simple MAC drivers stay simple.
pub trait LinkDriver: Send {
	/// One-time hardware bring-up.
	fn init(&mut self) -> Result {
		Ok(())
	}

	/// Hands one fully framed Ethernet packet (tail tag included) to the hardware.
	fn send(&mut self, frame: &[u8], tx: &TxAncillary) -> Result;

	/// Installs the set of multicast MAC addresses the hardware should accept.
	fn set_mac_filter(&mut self, groups: &[MacAddr]) -> Result {
		let _ = groups;
		Ok(())
	}

	/// Reprograms the MAC for a new speed/duplex pairing.
	fn update_mac_config(&mut self, change: &LinkChange) -> Result {
		let _ = change;
		Ok(())
	}

	/// Largest IP datagram this link carries. Resampled on every link-up.
	fn mtu(&self) -> usize {
		1500
	}

	fn tail_tag(&self) -> TailTag {
		TailTag::None
	}

	fn mdio(&mut self) -> Option<&mut dyn Mdio> {
		None
	}
}
