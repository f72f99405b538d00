// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

//! The published read tail: the only boundary readers consult. `get` is an
//! acquire-load; `advance` is a release-store that must only be called once
//! every side effect of the corresponding append is globally visible.
//! Monotonic: advancing to a value behind the current tail is a contract
//! violation (an `Invariant` error, not a panic — callers in this crate
//! never trigger it, but it's surfaced rather than silently ignored).

use crate::error::{Error, Result};
use crate::seq::StrictSeq;

#[derive(Default)]
pub struct ReadTail {
	seq: StrictSeq,
}

impl ReadTail {
	pub fn new() -> Self {
		ReadTail { seq: StrictSeq::new() }
	}

	/// Acquire-load of the current published tail.
	pub fn get(&self) -> u64 {
		self.seq.get()
	}

	/// Reserve `n` bytes starting at the next contiguous, not-yet-reserved
	/// offset. Wait-free.
	pub fn reserve(&self, n: u64) -> u64 {
		self.seq.reserve(n)
	}

	/// Publish `[offset, offset + n)` as durable and side-effect-complete.
	/// Spin-waits if an earlier-reserved extent hasn't published yet, so the
	/// tail only ever advances in reservation order.
	pub fn advance(&self, offset: u64, n: u64) -> Result<()> {
		if offset < self.seq.get() {
			return Err(Error::invariant(format!(
				"tail advance to {} is behind current tail {}",
				offset,
				self.seq.get()
			)));
		}
		self.seq.publish(offset, n);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monotonic_advance() {
		let tail = ReadTail::new();
		assert_eq!(tail.get(), 0);
		let o1 = tail.reserve(10);
		tail.advance(o1, 10).unwrap();
		assert_eq!(tail.get(), 10);
		let o2 = tail.reserve(5);
		tail.advance(o2, 5).unwrap();
		assert_eq!(tail.get(), 15);
	}
}
