//! The user-facing connection handles. Every call takes the one stack lock;
//! blocking calls release it and wait on the shared condition with a deadline.

use std::sync::Arc;
use std::time::Duration;

use utils::error::{Error, Result};

use crate::ip::SocketAddr;
use crate::{Net, Shared};

use super::output;
use super::tcb::State;

/// A listen endpoint. Dropping it tears down the backlog.
pub struct TcpListener {
	shared: Arc<Shared>,
	idx: usize,
	gen: u32,
}

/// One TCP connection.
pub struct TcpSocket {
	shared: Arc<Shared>,
	idx: usize,
	gen: u32,
}

impl std::fmt::Debug for TcpSocket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TcpSocket").field("idx", &self.idx).field("gen", &self.gen).finish()
	}
}

impl TcpListener {
	pub(crate) fn new(shared: Arc<Shared>, idx: usize, gen: u32) -> Self {
		Self { shared, idx, gen }
	}

	/// Waits for a completed connection on the backlog.
	///
	/// `timeout` of `None` blocks indefinitely; `Some(Duration::ZERO)` polls.
	pub fn accept(&self, timeout: Option<Duration>) -> Result<TcpSocket> {
		let (idx, gen) = self.shared.block_on(timeout, |net: &mut Net, _now| {
			let children: Vec<usize> = match net.tcp.get(self.idx, self.gen) {
				Ok(listener) => listener.backlog.iter().copied().collect(),
				Err(err) => return Some(Err(err)),
			};

			for child in children {
				// A child is ready once its handshake completed; the peer may
				// even have sent data or closed again already.
				let ready = net.tcp.socks.get(child).is_some_and(|t| {
					matches!(
						t.state,
						State::Established | State::CloseWait | State::FinWait1 | State::FinWait2 | State::Closing | State::TimeWait
					)
				});

				if !ready {
					continue;
				}

				let tcb = &mut net.tcp.socks[child];
				tcb.has_handle = true;
				tcb.parent = None;
				let gen = tcb.gen;

				if let Ok(listener) = net.tcp.get(self.idx, self.gen) {
					listener.backlog.retain(|&c| c != child);
				}

				return Some(Ok((child, gen)));
			}

			None
		})?;

		Ok(TcpSocket { shared: self.shared.clone(), idx, gen })
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		let net = self.shared.net.lock().unwrap();
		net.tcp.socks.get(self.idx).filter(|t| t.gen == self.gen).map(|t| t.local).ok_or(Error::ConnectionClosed)
	}

	/// Stops listening; pending half-open connections are discarded.
	pub fn close(&self) {
		let mut net = self.shared.net.lock().unwrap();

		if net.tcp.socks.get(self.idx).is_some_and(|t| t.gen == self.gen) {
			net.tcp.destroy(self.idx);
		}

		drop(net);
		self.shared.wake.notify_all();
	}
}

impl Drop for TcpListener {
	fn drop(&mut self) {
		if let Ok(mut net) = self.shared.net.lock() {
			if net.tcp.socks.get(self.idx).is_some_and(|t| t.gen == self.gen) {
				net.tcp.destroy(self.idx);
			}
		}

		self.shared.wake.notify_all();
	}
}

impl TcpSocket {
	pub(crate) fn new(shared: Arc<Shared>, idx: usize, gen: u32) -> Self {
		Self { shared, idx, gen }
	}

	/// Queues `data` for transmission, waiting for buffer space as needed.
	///
	/// Everything is queued before this returns `Ok`; a timeout may leave a
	/// prefix of the data on its way to the peer.
	pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
		if data.is_empty() {
			return Ok(0);
		}

		let mut written = 0;

		self.shared.block_on(timeout, |net: &mut Net, now| {
			match net.tcp.get(self.idx, self.gen) {
				Err(err) => return Some(Err(err)),
				Ok(tcb) => {
					if let Some(err) = tcb.err {
						return Some(Err(err));
					}

					if tcb.send_closed() || tcb.state == State::Closed {
						return Some(Err(Error::ConnectionClosed));
					}

					if !matches!(
						tcb.state,
						State::SynSent | State::SynReceived | State::Established | State::CloseWait
					) {
						return Some(Err(Error::ConnectionClosed));
					}
				}
			}

			let Net { tcp, ifaces, .. } = net;
			let tcb = &mut tcp.socks[self.idx];

			written += tcb.snd_ring.write(&data[written..]);

			output::pump(ifaces, tcb, now);

			(written == data.len()).then_some(Ok(written))
		})
	}

	/// Reads available bytes; blocks while the connection is open and empty.
	///
	/// `Ok(0)` is the orderly end of the stream.
	pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
		self.shared.block_on(timeout, |net: &mut Net, now| {
			let was_zero;

			match net.tcp.get(self.idx, self.gen) {
				Err(err) => return Some(Err(err)),
				Ok(tcb) => {
					was_zero = tcb.recv_window() == 0;

					if !tcb.rcv_ring.is_empty() {
						// Fall through to read below.
					} else if let Some(err) = tcb.err {
						return Some(Err(err));
					} else if tcb.rx_closed {
						return Some(Ok(0));
					} else if tcb.state == State::Closed {
						return Some(Err(Error::ConnectionClosed));
					} else if !matches!(
						tcb.state,
						State::SynSent | State::SynReceived | State::Established | State::FinWait1 | State::FinWait2
					) {
						return Some(Err(Error::ConnectionClosed));
					} else {
						return None;
					}
				}
			}

			let Net { tcp, ifaces, .. } = net;
			let tcb = &mut tcp.socks[self.idx];

			let n = tcb.rcv_ring.read(buf);

			// Reopening a window the peer saw as closed deserves an update.
			if was_zero && tcb.recv_window() > 0 {
				output::send_ack(ifaces, tcb, now);
			}

			Some(Ok(n))
		})
	}

	/// Like `send`, but the end of `data` becomes the connection's urgent mark.
	pub fn send_urgent(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
		let n = self.send(data, timeout)?;

		let mut net = self.shared.net.lock().unwrap();

		if let Ok(tcb) = net.tcp.get(self.idx, self.gen) {
			tcb.snd.up = tcb.snd_base.wrapping_add(tcb.snd_ring.len() as u32);
			tcb.urg_pending = true;
		}

		Ok(n)
	}

	/// Bytes of normal data ahead of the peer's urgent mark, when one is pending.
	pub fn urgent_mark(&self) -> Option<usize> {
		let mut net = self.shared.net.lock().unwrap();
		let tcb = net.tcp.get(self.idx, self.gen).ok()?;

		let up = tcb.rcv.up?;
		let read_seq = tcb.rcv.nxt.wrapping_sub(tcb.rcv_ring.len() as u32);
		let ahead = up.wrapping_sub(read_seq);

		(ahead as usize <= tcb.rcv_ring.len()).then_some(ahead as usize)
	}

	/// Orderly close: a FIN follows the queued data; reads stay possible.
	pub fn close(&self) -> Result {
		let mut net = self.shared.net.lock().unwrap();
		let now = self.shared.clock.now();

		let state = match net.tcp.get(self.idx, self.gen) {
			Ok(tcb) => tcb.state,
			// Already gone is already closed.
			Err(_) => return Ok(()),
		};

		match state {
			State::Closed | State::SynSent => {
				net.tcp.destroy(self.idx);
			}
			State::SynReceived | State::Established => {
				let Net { tcp, ifaces, .. } = &mut *net;
				let tcb = &mut tcp.socks[self.idx];

				tcb.state = State::FinWait1;
				tcb.fin_pending = true;
				output::pump(ifaces, tcb, now);
			}
			State::CloseWait => {
				let Net { tcp, ifaces, .. } = &mut *net;
				let tcb = &mut tcp.socks[self.idx];

				tcb.state = State::LastAck;
				tcb.fin_pending = true;
				output::pump(ifaces, tcb, now);
			}
			// Closing already.
			_ => {}
		}

		drop(net);
		self.shared.wake.notify_all();

		Ok(())
	}

	/// Abortive close: RST now, all state discarded.
	pub fn abort(&self) {
		let mut net = self.shared.net.lock().unwrap();
		let now = self.shared.clock.now();

		if let Ok(tcb) = net.tcp.get(self.idx, self.gen) {
			let synchronized = !matches!(tcb.state, State::Closed | State::SynSent | State::Listen);

			if synchronized {
				let Net { tcp, ifaces, .. } = &mut *net;
				output::send_rst(ifaces, &tcp.socks[self.idx], now);
			}

			net.tcp.destroy(self.idx);
		}

		drop(net);
		self.shared.wake.notify_all();
	}

	pub fn state(&self) -> Result<State> {
		let net = self.shared.net.lock().unwrap();
		net.tcp.socks.get(self.idx).filter(|t| t.gen == self.gen).map(|t| t.state).ok_or(Error::ConnectionClosed)
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		let net = self.shared.net.lock().unwrap();
		net.tcp.socks.get(self.idx).filter(|t| t.gen == self.gen).map(|t| t.local).ok_or(Error::ConnectionClosed)
	}

	pub fn peer_addr(&self) -> Result<SocketAddr> {
		let net = self.shared.net.lock().unwrap();
		net.tcp.socks.get(self.idx).filter(|t| t.gen == self.gen).map(|t| t.remote).ok_or(Error::ConnectionClosed)
	}

	/// Disables or enables Nagle coalescing.
	pub fn set_nodelay(&self, nodelay: bool) -> Result {
		let mut net = self.shared.net.lock().unwrap();
		net.tcp.get(self.idx, self.gen)?.nagle = !nodelay;
		Ok(())
	}

	pub fn set_keepalive(&self, enabled: bool) -> Result {
		let mut net = self.shared.net.lock().unwrap();
		net.tcp.get(self.idx, self.gen)?.keepalive = enabled;
		Ok(())
	}

	/// The latest advisory (ICMP-sourced) error, if any. Never fatal.
	pub fn take_soft_error(&self) -> Option<Error> {
		let mut net = self.shared.net.lock().unwrap();
		net.tcp.get(self.idx, self.gen).ok().and_then(|tcb| tcb.soft_err.take())
	}
}

impl Drop for TcpSocket {
	fn drop(&mut self) {
		let _ = self.close();
	}
}
