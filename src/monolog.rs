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

//! Two monolog layouts: `Linear`, a fixed-stride append-only byte region used
//! by the data log, and `Exp2`, an exponentially-bucketed append-only array
//! of `u64` offsets used by reflogs (index posting lists).

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::Result;
use crate::seq::StrictSeq;
use crate::storage::StorageMode;

/// A fixed-stride linear byte monolog: `bucket_stride` bytes per bucket,
/// buckets allocated lazily through a `StorageMode`. Writes never straddle a
/// bucket boundary — that's enforced by the caller (the data log rounds a
/// reservation up to the next boundary first).
pub struct Linear {
	storage: Box<dyn StorageMode>,
	bucket_stride: u64,
}

impl Linear {
	pub fn new(storage: Box<dyn StorageMode>, bucket_stride: u64) -> Self {
		Linear { storage, bucket_stride }
	}

	pub fn bucket_stride(&self) -> u64 {
		self.bucket_stride
	}

	fn locate(&self, offset: u64) -> (usize, u64) {
		let bucket = (offset / self.bucket_stride) as usize;
		let local = offset % self.bucket_stride;
		(bucket, local)
	}

	/// Remaining bytes in the bucket that owns `offset`.
	pub fn remaining_in_bucket(&self, offset: u64) -> u64 {
		let (_, local) = self.locate(offset);
		self.bucket_stride - local
	}

	pub fn ensure_bucket_for(&self, offset: u64) -> Result<()> {
		let (bucket, _) = self.locate(offset);
		self.storage.allocate(bucket, self.bucket_stride)
	}

	pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
		let (bucket, local) = self.locate(offset);
		debug_assert!(local + bytes.len() as u64 <= self.bucket_stride, "write straddles a bucket boundary");
		self.storage.write(bucket, local, bytes)
	}

	pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
		let (bucket, local) = self.locate(offset);
		self.storage.read(bucket, local, dst)
	}

	pub fn flush(&self, offset: u64, n: u64) -> Result<()> {
		let (bucket, local) = self.locate(offset);
		self.storage.flush(bucket, local, n)
	}

	pub fn ptr(&self, offset: u64) -> Result<*const u8> {
		let (bucket, local) = self.locate(offset);
		self.storage.pointer(bucket, local)
	}
}

const BASE_BITS: u32 = 24;

fn locate_exp2(index: u64) -> (usize, usize, usize) {
	let shifted = index + (1u64 << BASE_BITS);
	let bucket = (63 - shifted.leading_zeros()) - BASE_BITS;
	let bucket_base = 1u64 << (BASE_BITS + bucket);
	let offset = (shifted - bucket_base) as usize;
	let capacity = 1usize << (BASE_BITS + bucket);
	(bucket as usize, offset, capacity)
}

/// A lock-free, exponentially-bucketed append-only array of `u64`. Bucket
/// `i` holds `2^(i+24)` elements. Used for reflogs: index posting lists that
/// grow without bound as records accumulate.
pub struct Exp2 {
	buckets: RwLock<Vec<Option<Box<[AtomicU64]>>>>,
	len: StrictSeq,
}

const EMPTY: u64 = u64::MAX;

impl Default for Exp2 {
	fn default() -> Self {
		Exp2 { buckets: RwLock::new(Vec::new()), len: StrictSeq::new() }
	}
}

impl Exp2 {
	pub fn new() -> Self {
		Self::default()
	}

	fn ensure_bucket(&self, bucket: usize, capacity: usize) {
		{
			let guard = self.buckets.read();
			if guard.len() > bucket && guard[bucket].is_some() {
				return;
			}
		}
		let mut guard = self.buckets.write();
		if guard.len() <= bucket {
			guard.resize_with(bucket + 1, || None);
		}
		if guard[bucket].is_none() {
			let slots: Vec<AtomicU64> = (0..capacity).map(|_| AtomicU64::new(EMPTY)).collect();
			guard[bucket] = Some(slots.into_boxed_slice());
		}
	}

	/// Append `value`, returning its dense index. Lock-free on the fast
	/// path; only spin-waits if a concurrent pusher reserved an earlier
	/// index and hasn't finished writing yet (see `StrictSeq`).
	pub fn push(&self, value: u64) -> u64 {
		let idx = self.len.reserve(1);
		let (bucket, offset, capacity) = locate_exp2(idx);
		self.ensure_bucket(bucket, capacity);
		{
			let guard = self.buckets.read();
			guard[bucket].as_ref().unwrap()[offset].store(value, Ordering::Release);
		}
		self.len.publish(idx, 1);
		idx
	}

	/// Number of published elements.
	pub fn len(&self) -> u64 {
		self.len.get()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn get(&self, idx: u64) -> Option<u64> {
		if idx >= self.len() {
			return None;
		}
		let (bucket, offset, _) = locate_exp2(idx);
		let guard = self.buckets.read();
		guard[bucket].as_ref().map(|b| b[offset].load(Ordering::Acquire))
	}

	/// Snapshot all published offsets, in insertion order.
	pub fn to_vec(&self) -> Vec<u64> {
		(0..self.len()).filter_map(|i| self.get(i)).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exp2_bucket_math_matches_spec_capacities() {
		assert_eq!(locate_exp2(0), (0, 0, 1 << 24));
		assert_eq!(locate_exp2((1 << 24) - 1), (0, (1 << 24) - 1, 1 << 24));
		assert_eq!(locate_exp2(1 << 24), (1, 0, 1 << 25));
	}

	#[test]
	fn push_and_get() {
		let log = Exp2::new();
		let a = log.push(100);
		let b = log.push(200);
		assert_eq!((a, b), (0, 1));
		assert_eq!(log.get(0), Some(100));
		assert_eq!(log.get(1), Some(200));
		assert_eq!(log.get(2), None);
		assert_eq!(log.to_vec(), vec![100, 200]);
	}

	#[test]
	fn concurrent_push_all_visible() {
		use std::sync::Arc;
		use std::thread;
		let log = Arc::new(Exp2::new());
		let mut handles = Vec::new();
		for t in 0..8u64 {
			let log = log.clone();
			handles.push(thread::spawn(move || {
				for i in 0..1000u64 {
					log.push(t * 1000 + i);
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		assert_eq!(log.len(), 8000);
		let mut v = log.to_vec();
		v.sort_unstable();
		let expected: Vec<u64> = (0..8000).collect();
		assert_eq!(v, expected);
	}
}
