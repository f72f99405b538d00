// Strict, reservation-ordered monotonic counter. Shared by the read tail
// (byte offsets) and the reflog (element indices): both need "reserve a
// range, do side-effecting work, then publish" with the rule that publish
// never uncovers a range whose owning writer hasn't finished.
//
// `reserve` is a plain fetch-add (wait-free). `publish` spin-waits only when
// a writer finishes out of reservation order relative to its predecessor —
// bounded by how far ahead of the slowest in-flight writer the fastest one
// gets, which in practice is tiny. This is the single spin point the design
// allows (see the concurrency model's suspension-point list).

use std::sync::atomic::{AtomicU64, Ordering};

pub struct StrictSeq {
	reserved: AtomicU64,
	published: AtomicU64,
}

impl StrictSeq {
	pub const fn new() -> Self {
		StrictSeq { reserved: AtomicU64::new(0), published: AtomicU64::new(0) }
	}

	pub fn starting_at(start: u64) -> Self {
		StrictSeq { reserved: AtomicU64::new(start), published: AtomicU64::new(start) }
	}

	/// Reserve `n` units, returning the start of the reserved range.
	/// Wait-free.
	pub fn reserve(&self, n: u64) -> u64 {
		self.reserved.fetch_add(n, Ordering::Relaxed)
	}

	/// Publish the range `[start, start + n)`. Must be called only after
	/// every side effect of the corresponding reservation is globally
	/// visible. Blocks (spin-waits) until `start` is the next unpublished
	/// position, so publication always happens in reservation order.
	pub fn publish(&self, start: u64, n: u64) {
		loop {
			let cur = self.published.load(Ordering::Acquire);
			if cur == start {
				break;
			}
			debug_assert!(cur < start, "publish called with a value behind the current tail");
			std::hint::spin_loop();
		}
		self.published.store(start + n, Ordering::Release);
	}

	/// The current published bound (acquire load).
	pub fn get(&self) -> u64 {
		self.published.load(Ordering::Acquire)
	}

	/// The current reservation bound, i.e. the next offset that will be
	/// handed out. Not synchronized with publication; informational only.
	pub fn reserved(&self) -> u64 {
		self.reserved.load(Ordering::Relaxed)
	}
}

impl Default for StrictSeq {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn sequential_reserve_publish() {
		let seq = StrictSeq::new();
		let a = seq.reserve(4);
		assert_eq!(a, 0);
		let b = seq.reserve(8);
		assert_eq!(b, 4);
		seq.publish(a, 4);
		assert_eq!(seq.get(), 4);
		seq.publish(b, 8);
		assert_eq!(seq.get(), 12);
	}

	#[test]
	fn out_of_order_completion_still_publishes_in_reservation_order() {
		let seq = Arc::new(StrictSeq::new());
		let a = seq.reserve(1);
		let b = seq.reserve(1);
		assert_eq!((a, b), (0, 1));

		let seq2 = seq.clone();
		let late = thread::spawn(move || {
			// Finishes its "work" first but must wait to publish until `a`
			// has published.
			thread::sleep(std::time::Duration::from_millis(5));
			seq2.publish(b, 1);
		});
		thread::sleep(std::time::Duration::from_millis(20));
		assert_eq!(seq.get(), 0, "tail must not advance past an unpublished predecessor");
		seq.publish(a, 1);
		late.join().unwrap();
		assert_eq!(seq.get(), 2);
	}
}
