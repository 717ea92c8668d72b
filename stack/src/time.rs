//! The time source consumed by every timer in the stack.
//!
//! The porting layer supplies the clock; protocol code only ever sees the
//! `Instant`s handed down from the dispatch entry points, so tests can run the
//! whole stack on a virtual clock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A monotonic time source.
pub trait Clock: Send + Sync {
	fn now(&self) -> Instant;
}

/// The default clock, backed by the OS monotonic clock.
pub struct Monotonic;

impl Clock for Monotonic {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// A settable clock for driving timer behavior from tests.
pub struct TestClock {
	base: Instant,
	offset: Mutex<Duration>,
}

impl TestClock {
	pub fn new() -> Self {
		Self {
			base: Instant::now(),
			offset: Mutex::new(Duration::ZERO),
		}
	}

	/// Moves the clock forward by `d`.
	pub fn advance(&self, d: Duration) {
		*self.offset.lock().unwrap() += d;
	}
}

impl Default for TestClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for TestClock {
	fn now(&self) -> Instant {
		self.base + *self.offset.lock().unwrap()
	}
}
