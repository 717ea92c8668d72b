use core::fmt;
use core::result;

/// The error kinds surfaced by the stack.
///
/// Ingress-path errors are swallowed after logging; egress and socket-facing
/// errors propagate to the caller unchanged. `InProgress` is special: it means
/// the packet was queued behind an address resolution and the caller should
/// treat the operation as having succeeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
	InvalidParameter,
	InvalidAddress,
	InvalidLength,
	InvalidPacket,
	InvalidProtocol,
	InvalidSession,
	InvalidIdentifier,
	OutOfMemory,
	NoRoute,
	AddressNotFound,
	ProtocolUnreachable,
	PortUnreachable,
	MessageTooLong,
	Timeout,
	InProgress,
	ResetByPeer,
	ConnectionClosed,
	AlreadyConfigured,
	NotConfigured,
	AlreadyRunning,
}

pub type Result<T = (), E = Error> = result::Result<T, E>;

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::InvalidParameter => "invalid parameter",
			Self::InvalidAddress => "invalid address",
			Self::InvalidLength => "invalid length",
			Self::InvalidPacket => "invalid packet",
			Self::InvalidProtocol => "invalid protocol",
			Self::InvalidSession => "invalid session",
			Self::InvalidIdentifier => "invalid identifier",
			Self::OutOfMemory => "out of memory",
			Self::NoRoute => "no route to destination",
			Self::AddressNotFound => "address not found",
			Self::ProtocolUnreachable => "protocol unreachable",
			Self::PortUnreachable => "port unreachable",
			Self::MessageTooLong => "message too long",
			Self::Timeout => "operation timed out",
			Self::InProgress => "resolution in progress",
			Self::ResetByPeer => "connection reset by peer",
			Self::ConnectionClosed => "connection closed",
			Self::AlreadyConfigured => "already configured",
			Self::NotConfigured => "not configured",
			Self::AlreadyRunning => "already running",
		})
	}
}

impl std::error::Error for Error {}
