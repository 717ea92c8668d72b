//! An embedded IPv4 stack: Ethernet, ARP, IPv4 with fragmentation and
//! reassembly, ICMP, UDP, TCP, and a NAPT translator, all behind one context.
//!
//! The whole stack is serialized by a single mutex. The embedder feeds frames
//! in through [`Stack::input`], drives timers through [`Stack::tick`], and uses
//! the socket handles from any thread; blocking calls release the lock and wait
//! on the shared condition with a deadline.

use core::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub mod arp;
pub mod driver;
pub mod eth;
pub mod icmp;
pub mod iface;
pub mod ip;
pub mod nat;
pub mod tcp;
pub mod time;
pub mod udp;

pub use driver::{Duplex, LinkChange, LinkDriver, LinkSpeed, Mdio, RxAncillary, TailTag, TxAncillary};
pub use eth::MacAddr;
pub use iface::{AddrState, IfaceId, Ipv4Config};
pub use ip::{Protocol, SocketAddr};
pub use nat::{NatConfig, NatProto, PortForward, Timeouts as NatTimeouts};
pub use tcp::{State as TcpState, TcpListener, TcpPolicy, TcpSocket};
pub use time::{Clock, Monotonic, TestClock};
pub use udp::UdpSocket;
pub use utils::error::{Error, Result};

use iface::Interface;
use ip::v4;
use tcp::output::{self, SegFlags};
use tcp::tcb::{State, Tcb};

/// Headroom reserved in front of every locally built packet: enough for the
/// transport header with options, the IP header, and the link header.
pub(crate) const HEADROOM: usize = 128;

/// Interfaces a stack instance will carry.
const MAX_IFACES: usize = 4;

/// An ingress tap for IP protocols the stack has no handler for.
pub(crate) type RawTap = Box<dyn FnMut(Ipv4Addr, &[u8]) + Send>;

/// Called on every link transition; the seam DHCP/Auto-IP style services hang off.
pub(crate) type LinkHook = Box<dyn Fn(IfaceId, bool) + Send>;

/// Tunables that apply stack-wide.
pub(crate) struct Policy {
	pub tcp: TcpPolicy,
	/// Answer echo requests addressed to a broadcast.
	pub broadcast_echo: bool,
}

/// Everything behind the lock.
pub(crate) struct Net {
	pub ifaces: Vec<Interface>,
	pub tcp: tcp::Tcp,
	pub udp: udp::Udp,
	pub nat: Option<nat::Nat>,
	pub pings: Vec<icmp::PingWaiter>,
	pub raw: HashMap<u8, RawTap>,
	pub hooks: Vec<LinkHook>,
	pub rng: SmallRng,
	pub policy: Policy,
}

pub(crate) struct Shared {
	pub net: Mutex<Net>,
	pub wake: Condvar,
	pub clock: Arc<dyn Clock>,
}

impl Shared {
	/// Runs `f` under the lock until it produces a result or the deadline hits.
	///
	/// `timeout` of `None` blocks indefinitely; `Some(Duration::ZERO)` polls
	/// exactly once. Expiry reports `Timeout` without touching protocol state.
	pub(crate) fn block_on<T>(
		&self,
		timeout: Option<Duration>,
		mut f: impl FnMut(&mut Net, Instant) -> Option<Result<T>>,
	) -> Result<T> {
		let deadline = timeout.map(|t| Instant::now() + t);
		let mut net = self.net.lock().unwrap();

		loop {
			let now = self.clock.now();

			if let Some(result) = f(&mut net, now) {
				drop(net);
				self.wake.notify_all();
				return result;
			}

			match deadline {
				None => net = self.wake.wait(net).unwrap(),
				Some(deadline) => {
					let real = Instant::now();

					if real >= deadline {
						return Err(Error::Timeout);
					}

					let (guard, _) = self.wake.wait_timeout(net, deadline - real).unwrap();
					net = guard;
				}
			}
		}
	}
}

/// The stack context. Clones share the same instance.
#[derive(Clone)]
pub struct Stack {
	shared: Arc<Shared>,
}

/// Configures and creates a [`Stack`].
pub struct Builder {
	clock: Arc<dyn Clock>,
	seed: Option<u64>,
	tcp: TcpPolicy,
	broadcast_echo: bool,
}

impl Builder {
	pub fn new() -> Self {
		Self {
			clock: Arc::new(Monotonic),
			seed: None,
			tcp: TcpPolicy::default(),
			broadcast_echo: false,
		}
	}

	/// Swaps the time source; tests install a settable clock here.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	/// Fixes the random seed for reproducible sequence numbers and ports.
	pub fn seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}

	pub fn tcp_policy(mut self, policy: TcpPolicy) -> Self {
		self.tcp = policy;
		self
	}

	/// Answer echo requests that arrive on a broadcast address.
	pub fn broadcast_echo(mut self, enabled: bool) -> Self {
		self.broadcast_echo = enabled;
		self
	}

	pub fn build(self) -> Stack {
		let rng = match self.seed {
			Some(seed) => SmallRng::seed_from_u64(seed),
			None => SmallRng::from_entropy(),
		};

		let net = Net {
			ifaces: Vec::new(),
			tcp: tcp::Tcp::default(),
			udp: udp::Udp::default(),
			nat: None,
			pings: Vec::new(),
			raw: HashMap::new(),
			hooks: Vec::new(),
			rng,
			policy: Policy {
				tcp: self.tcp,
				broadcast_echo: self.broadcast_echo,
			},
		};

		Stack {
			shared: Arc::new(Shared {
				net: Mutex::new(net),
				wake: Condvar::new(),
				clock: self.clock,
			}),
		}
	}
}

impl Default for Builder {
	fn default() -> Self {
		Self::new()
	}
}

impl Stack {
	pub fn builder() -> Builder {
		Builder::new()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Net> {
		self.shared.net.lock().unwrap()
	}

	fn iface_check(net: &Net, id: IfaceId) -> Result {
		(id.0 < net.ifaces.len()).then_some(()).ok_or(Error::InvalidParameter)
	}

	// ── Interfaces ──

	/// Registers a link. `switch_port` binds the interface to a managed-switch
	/// port for tail-tag framing.
	pub fn add_interface(&self, name: &str, mac: MacAddr, driver: Box<dyn LinkDriver>, switch_port: Option<u8>) -> Result<IfaceId> {
		let mut net = self.lock();

		if net.ifaces.len() == MAX_IFACES {
			return Err(Error::OutOfMemory);
		}

		let mut ifc = Interface::new(name.to_string(), mac, driver, switch_port);
		ifc.driver.init()?;

		net.ifaces.push(ifc);
		Ok(IfaceId(net.ifaces.len() - 1))
	}

	/// Assigns an IPv4 address. It starts out tentative and becomes valid once
	/// conflict detection has run its probes without an objection.
	pub fn configure_ipv4(&self, id: IfaceId, cfg: Ipv4Config) -> Result {
		let now = self.shared.clock.now();
		let mut net = self.lock();

		Self::iface_check(&net, id)?;
		net.ifaces[id.0].add_addr(cfg, now)?;

		drop(net);
		self.shared.wake.notify_all();
		Ok(())
	}

	pub fn deconfigure_ipv4(&self, id: IfaceId, addr: Ipv4Addr) -> Result {
		let mut net = self.lock();
		Self::iface_check(&net, id)?;
		net.ifaces[id.0].remove_addr(addr)
	}

	/// Replaces the resolver list for an interface; upper layers read it back.
	pub fn set_dns(&self, id: IfaceId, servers: &[Ipv4Addr]) -> Result {
		let mut net = self.lock();
		Self::iface_check(&net, id)?;
		net.ifaces[id.0].dns = servers.to_vec();
		Ok(())
	}

	pub fn dns_servers(&self, id: IfaceId) -> Result<Vec<Ipv4Addr>> {
		let net = self.lock();
		Self::iface_check(&net, id)?;
		Ok(net.ifaces[id.0].dns.clone())
	}

	/// Entry point for the driver's link-state notifications.
	pub fn link_change(&self, id: IfaceId, change: LinkChange) -> Result {
		let now = self.shared.clock.now();
		let mut net = self.lock();

		Self::iface_check(&net, id)?;
		net.ifaces[id.0].link_change(change, now);

		if !change.up {
			// The transport learns about the outage as an advisory condition.
			for (_, tcb) in net.tcp.socks.iter_mut() {
				if !matches!(tcb.state, State::Closed | State::Listen) {
					tcb.soft_err = Some(Error::NoRoute);
				}
			}
		}

		for hook in &net.hooks {
			hook(id, change.up);
		}

		drop(net);
		self.shared.wake.notify_all();
		Ok(())
	}

	/// Registers a link-change hook (the DHCP/Auto-IP notification seam).
	pub fn on_link_change(&self, hook: impl Fn(IfaceId, bool) + Send + 'static) {
		self.lock().hooks.push(Box::new(hook));
	}

	pub fn join_multicast(&self, id: IfaceId, group: Ipv4Addr) -> Result {
		let mut net = self.lock();
		Self::iface_check(&net, id)?;
		net.ifaces[id.0].join_multicast(group)
	}

	pub fn leave_multicast(&self, id: IfaceId, group: Ipv4Addr) -> Result {
		let mut net = self.lock();
		Self::iface_check(&net, id)?;
		net.ifaces[id.0].leave_multicast(group)
	}

	/// Installs a permanent ARP entry; it never expires or updates.
	pub fn arp_add_static(&self, id: IfaceId, ip: Ipv4Addr, mac: MacAddr) -> Result {
		let now = self.shared.clock.now();
		let mut net = self.lock();

		Self::iface_check(&net, id)?;
		net.ifaces[id.0].arp.add_permanent(ip, mac, now)
	}

	// ── Dispatch ──

	/// Feeds one received frame into the stack.
	pub fn input(&self, id: IfaceId, frame: &[u8]) -> Result {
		let now = self.shared.clock.now();
		let mut net = self.lock();

		Self::iface_check(&net, id)?;
		eth::input(&mut net, id.0, frame, now);

		drop(net);
		self.shared.wake.notify_all();
		Ok(())
	}

	/// Runs every timer that has come due. Call this periodically.
	pub fn tick(&self) {
		let now = self.shared.clock.now();
		let mut net = self.lock();

		for i in 0..net.ifaces.len() {
			net.ifaces[i].tick(now);
			arp::tick(&mut net.ifaces[i], now);

			// Reassembly expiry may owe the sender a time-exceeded notice.
			let expired = net.ifaces[i].frags.expire(now);

			for e in expired {
				icmp::emit_error_bytes(&mut net.ifaces[i], &e.invoking, icmp::Kind::TimeExceeded, icmp::CODE_REASSEMBLY_EXCEEDED, now);
			}
		}

		tcp::tick(&mut net, now);
		nat::tick(&mut net, now);

		drop(net);
		self.shared.wake.notify_all();
	}

	// ── ICMP ──

	/// Sends an echo request and waits for the matching reply, returning its
	/// payload length.
	pub fn ping(&self, dst: Ipv4Addr, id: u16, seq: u16, payload: &[u8], timeout: Option<Duration>) -> Result<usize> {
		{
			let now = self.shared.clock.now();
			let mut net = self.lock();

			let i = v4::route(&net.ifaces, dst)?;
			let src = net.ifaces[i].source_for(dst).ok_or(Error::NoRoute)?;

			icmp::send_echo(&mut net.ifaces[i], src, dst, id, seq, payload, now)?;
			net.pings.push(icmp::PingWaiter { id, seq, done: None });
		}

		self.shared.wake.notify_all();

		let result = self.shared.block_on(timeout, |net, _| {
			net.pings
				.iter()
				.find(|w| w.id == id && w.seq == seq)
				.and_then(|w| w.done)
				.map(Ok)
		});

		self.lock().pings.retain(|w| !(w.id == id && w.seq == seq));

		result
	}

	/// Registers an ingress tap for an IP protocol the stack does not handle.
	pub fn raw_tap(&self, proto: u8, tap: impl FnMut(Ipv4Addr, &[u8]) + Send + 'static) -> Result {
		if matches!(Protocol::from(proto), Protocol::Icmp | Protocol::Tcp | Protocol::Udp) {
			return Err(Error::InvalidProtocol);
		}

		self.lock().raw.insert(proto, Box::new(tap));
		Ok(())
	}

	// ── UDP ──

	/// Binds a UDP socket; a zero port picks an ephemeral one.
	pub fn udp_bind(&self, port: u16) -> Result<UdpSocket> {
		let (idx, gen) = self.lock().udp.bind(port)?;
		Ok(UdpSocket::new(self.shared.clone(), idx, gen))
	}

	// ── TCP ──

	/// Opens a listen endpoint on `addr:port`; an unspecified address listens
	/// on every interface.
	pub fn tcp_listen(&self, addr: Ipv4Addr, port: u16, backlog: usize) -> Result<TcpListener> {
		if port == 0 {
			return Err(Error::InvalidParameter);
		}

		let now = self.shared.clock.now();
		let mut net = self.lock();

		if net.tcp.listens.contains_key(&(addr, port)) {
			return Err(Error::AlreadyConfigured);
		}

		let policy = net.policy.tcp.clone();
		let iss: u32 = net.rng.gen();

		let mut tcb = Tcb::new(SocketAddr::new(addr, port), SocketAddr::new(Ipv4Addr::UNSPECIFIED, 0), iss, &policy, now);
		tcb.state = State::Listen;

		if backlog > 0 {
			tcb.backlog_max = backlog;
		}

		let idx = net.tcp.insert(tcb);
		net.tcp.listens.insert((addr, port), idx);
		let gen = net.tcp.socks[idx].gen;

		Ok(TcpListener::new(self.shared.clone(), idx, gen))
	}

	/// Opens a connection and waits for the handshake to complete.
	pub fn tcp_connect(&self, remote: SocketAddr, timeout: Option<Duration>) -> Result<TcpSocket> {
		let (idx, gen) = {
			let now = self.shared.clock.now();
			let mut net = self.lock();

			let i = v4::route(&net.ifaces, remote.addr)?;
			let src = net.ifaces[i].source_for(remote.addr).ok_or(Error::NoRoute)?;
			let port = net.tcp.alloc_ephemeral()?;

			let policy = net.policy.tcp.clone();
			let iss: u32 = net.rng.gen();

			let mut tcb = Tcb::new(SocketAddr::new(src, port), remote, iss, &policy, now);
			tcb.state = State::SynSent;
			tcb.snd.nxt = iss.wrapping_add(1);
			tcb.adv_mss = output::path_mss(&net.ifaces, remote.addr);
			tcb.rcv_wscale = output::pick_wscale(&policy);

			let idx = net.tcp.insert(tcb);
			net.tcp.register(idx);
			let gen = net.tcp.socks[idx].gen;

			let Net { tcp, ifaces, .. } = &mut *net;
			let tcb = &mut tcp.socks[idx];

			let flags = SegFlags { syn: true, ..SegFlags::default() };

			if let Err(err) = output::send(ifaces, tcb, iss, flags, &[], now) {
				net.tcp.destroy(idx);
				return Err(err);
			}

			output::arm_rtx(net.tcp.socks.get_mut(idx).unwrap(), now);

			(idx, gen)
		};

		self.shared.wake.notify_all();

		let sock = TcpSocket::new(self.shared.clone(), idx, gen);

		let waited = self.shared.block_on(timeout, |net, _| match net.tcp.get(idx, gen) {
			Err(err) => Some(Err(err)),
			Ok(tcb) => {
				if let Some(err) = tcb.err {
					Some(Err(err))
				} else if matches!(tcb.state, State::Established | State::CloseWait) {
					Some(Ok(()))
				} else {
					None
				}
			}
		});

		match waited {
			Ok(()) => Ok(sock),
			Err(err) => {
				sock.abort();
				Err(err)
			}
		}
	}

	// ── NAT ──

	/// Installs the translator configuration. It stays inert until started.
	pub fn nat_configure(&self, cfg: NatConfig) -> Result {
		let mut net = self.lock();

		Self::iface_check(&net, cfg.public_iface)?;

		if cfg.private_ifaces.is_empty() {
			return Err(Error::InvalidParameter);
		}

		for id in &cfg.private_ifaces {
			Self::iface_check(&net, *id)?;

			if *id == cfg.public_iface {
				return Err(Error::InvalidParameter);
			}
		}

		if cfg.port_range.0 > cfg.port_range.1 || cfg.icmp_id_range.0 > cfg.icmp_id_range.1 || cfg.max_sessions == 0 {
			return Err(Error::InvalidParameter);
		}

		for rule in &cfg.rules {
			if rule.proto == NatProto::Icmp || rule.public_min > rule.public_max {
				return Err(Error::InvalidParameter);
			}
		}

		if net.nat.as_ref().is_some_and(|n| n.running) {
			return Err(Error::AlreadyRunning);
		}

		net.nat = Some(nat::Nat::new(cfg));
		Ok(())
	}

	pub fn nat_start(&self) -> Result {
		let mut net = self.lock();

		let nat = net.nat.as_mut().ok_or(Error::NotConfigured)?;

		if nat.running {
			return Err(Error::AlreadyRunning);
		}

		nat.running = true;
		Ok(())
	}

	pub fn nat_stop(&self) -> Result {
		let mut net = self.lock();

		let nat = net.nat.as_mut().ok_or(Error::NotConfigured)?;

		if !nat.running {
			return Err(Error::NotConfigured);
		}

		nat.running = false;
		nat.table.clear();
		Ok(())
	}
}
