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

//! The byte-addressed data log: a `Linear` monolog with a monotonic write
//! cursor. `reserve` is a fetch-and-add that never lets a record straddle a
//! bucket boundary — when the remaining space in the current bucket is too
//! small, the cursor jumps to the next boundary and the skipped bytes are
//! simply never addressed again.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::monolog::Linear;
use crate::storage::StorageMode;

/// Reference sizing from the data model: 1 MiB buckets, 1 GiB total.
pub const DEFAULT_BUCKET_STRIDE: u64 = 1 << 20;
pub const DEFAULT_CAPACITY: u64 = 1 << 30;

/// The result of a successful `reserve`. `offset` is the record's id and the
/// start of its bytes. `publish_from`/`publish_len` describe the full range
/// this reservation consumed, including any skipped padding, for the
/// caller to hand to `ReadTail::advance` so the tail only ever advances in
/// reservation order.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
	pub offset: u64,
	pub publish_from: u64,
	pub publish_len: u64,
}

pub struct DataLog {
	linear: Linear,
	cursor: AtomicU64,
	capacity: u64,
}

impl DataLog {
	pub fn new(storage: Box<dyn StorageMode>, bucket_stride: u64, capacity: u64) -> Self {
		DataLog { linear: Linear::new(storage, bucket_stride), cursor: AtomicU64::new(0), capacity }
	}

	pub fn with_defaults(storage: Box<dyn StorageMode>) -> Self {
		Self::new(storage, DEFAULT_BUCKET_STRIDE, DEFAULT_CAPACITY)
	}

	pub fn bucket_stride(&self) -> u64 {
		self.linear.bucket_stride()
	}

	/// Reserve `n` contiguous bytes. Concurrent reservers never overlap.
	pub fn reserve(&self, n: u64) -> Result<Reservation> {
		if n == 0 {
			return Err(Error::management("cannot reserve a zero-length record"));
		}
		if n > self.linear.bucket_stride() {
			return Err(Error::management(format!(
				"record of {} bytes exceeds the data log's bucket stride of {} bytes",
				n,
				self.linear.bucket_stride()
			)));
		}
		loop {
			let cur = self.cursor.load(Ordering::Relaxed);
			let remaining = self.linear.remaining_in_bucket(cur);
			let (offset, next) =
				if n <= remaining { (cur, cur + n) } else { let padded = cur + remaining; (padded, padded + n) };
			if next > self.capacity {
				return Err(Error::Io(std::io::Error::new(
					std::io::ErrorKind::Other,
					format!("data log exhausted: {} bytes requested past capacity {}", next, self.capacity),
				)));
			}
			if self
				.cursor
				.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
				.is_ok()
			{
				self.linear.ensure_bucket_for(offset)?;
				return Ok(Reservation { offset, publish_from: cur, publish_len: next - cur });
			}
		}
	}

	pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
		self.linear.write_at(offset, bytes)
	}

	pub fn flush(&self, offset: u64, n: u64) -> Result<()> {
		self.linear.flush(offset, n)
	}

	/// Read `dst.len()` bytes starting at `offset`. The caller must have
	/// already observed a published tail covering `offset + dst.len()`.
	pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
		self.linear.read_at(offset, dst)
	}

	pub fn ptr(&self, offset: u64) -> Result<*const u8> {
		self.linear.ptr(offset)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::InMemoryStorage;

	fn small_log() -> DataLog {
		DataLog::new(Box::new(InMemoryStorage::new()), 64, 1024)
	}

	#[test]
	fn reserve_write_read_round_trip() {
		let log = small_log();
		let r = log.reserve(10).unwrap();
		assert_eq!(r.offset, 0);
		log.write_at(r.offset, b"0123456789").unwrap();
		log.flush(r.offset, 10).unwrap();
		let mut buf = [0u8; 10];
		log.read(r.offset, &mut buf).unwrap();
		assert_eq!(&buf, b"0123456789");
	}

	#[test]
	fn never_straddles_a_bucket_boundary() {
		let log = small_log(); // bucket stride 64
		let r1 = log.reserve(60).unwrap();
		assert_eq!(r1.offset, 0);
		// only 4 bytes left in the first bucket; a 10-byte record must skip
		// ahead to the next bucket boundary rather than straddle.
		let r2 = log.reserve(10).unwrap();
		assert_eq!(r2.offset, 64);
		assert_eq!(r2.publish_from, 60);
		assert_eq!(r2.publish_len, 64 - 60 + 10);
	}

	#[test]
	fn oversized_record_rejected() {
		let log = small_log();
		assert!(log.reserve(100).is_err());
	}

	#[test]
	fn zero_length_rejected() {
		let log = small_log();
		assert!(log.reserve(0).is_err());
	}

	#[test]
	fn exhausted_capacity_errors() {
		let log = small_log(); // capacity 1024, stride 64 => 16 buckets
		for _ in 0..16 {
			log.reserve(64).unwrap();
		}
		assert!(log.reserve(1).is_err());
	}

	#[test]
	fn concurrent_reservations_never_overlap() {
		use std::collections::HashSet;
		use std::sync::Arc;
		use std::thread;
		let log = Arc::new(DataLog::new(Box::new(InMemoryStorage::new()), 1 << 16, 1 << 24));
		let mut handles = Vec::new();
		for _ in 0..8 {
			let log = log.clone();
			handles.push(thread::spawn(move || {
				let mut offsets = Vec::new();
				for _ in 0..500 {
					offsets.push(log.reserve(16).unwrap().offset);
				}
				offsets
			}));
		}
		let mut all = HashSet::new();
		for h in handles {
			for o in h.join().unwrap() {
				assert!(all.insert(o), "duplicate offset {}", o);
			}
		}
		assert_eq!(all.len(), 4000);
	}
}
