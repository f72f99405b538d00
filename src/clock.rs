// Injected time source. The core never calls `SystemTime::now()` directly
// (see spec's "global/process-wide clock" redesign note); callers that want
// wall-clock timestamps pass a `Clock` implementation at table construction,
// and tests can substitute a deterministic one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of millisecond timestamps for records that don't carry an
/// explicit `ts` from the caller.
pub trait Clock: Send + Sync {
	fn now_millis(&self) -> u64;
}

/// Wall-clock time via `SystemTime`.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_millis(&self) -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.expect("system clock before unix epoch")
			.as_millis() as u64
	}
}

/// A clock that only advances when told to; lets tests drive filter/trigger
/// windowing deterministically.
#[derive(Default)]
pub struct ManualClock {
	now: AtomicU64,
}

impl ManualClock {
	pub fn new(start_millis: u64) -> Self {
		ManualClock { now: AtomicU64::new(start_millis) }
	}

	pub fn set(&self, millis: u64) {
		self.now.store(millis, Ordering::SeqCst);
	}

	pub fn advance(&self, delta_millis: u64) -> u64 {
		self.now.fetch_add(delta_millis, Ordering::SeqCst) + delta_millis
	}
}

impl Clock for ManualClock {
	fn now_millis(&self) -> u64 {
		self.now.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn manual_clock_advances() {
		let c = ManualClock::new(1000);
		assert_eq!(c.now_millis(), 1000);
		c.advance(500);
		assert_eq!(c.now_millis(), 1500);
		c.set(0);
		assert_eq!(c.now_millis(), 0);
	}
}
