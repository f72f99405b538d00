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

//! A multi-level byte-indexed map from a fixed-width key to a reflog
//! (offset set). Interior nodes are created lazily on first write via
//! compare-and-swap and are never freed while the tree is live; each slot is
//! published with release semantics and read with acquire.
//!
//! Tiered variants `idx1`..`idx8` and `idx_bool` are this tree parameterized
//! by (depth, radix) to match a column's key width: depth in bytes for
//! 1/2/4/8-byte keys, radix 256 for byte-at-a-time digits or 2 for a
//! boolean's single {0,1} digit.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{Error, Result};
use crate::monolog::Exp2;
use crate::schema::ColumnType;

struct Slot(AtomicPtr<NodeKind>);

impl Default for Slot {
	fn default() -> Self {
		Slot(AtomicPtr::new(std::ptr::null_mut()))
	}
}

enum NodeKind {
	Interior(Vec<Slot>),
	Leaf(Exp2),
}

pub struct RadixTree {
	depth: usize,
	radix: usize,
	root: Vec<Slot>,
}

impl RadixTree {
	pub fn new(depth: usize, radix: usize) -> Self {
		assert!(depth >= 1, "radix tree depth must be at least 1");
		assert!(radix >= 2, "radix must be at least 2");
		RadixTree { depth, radix, root: (0..radix).map(|_| Slot::default()).collect() }
	}

	pub fn idx1() -> Self {
		Self::new(1, 256)
	}
	pub fn idx2() -> Self {
		Self::new(2, 256)
	}
	pub fn idx4() -> Self {
		Self::new(4, 256)
	}
	pub fn idx8() -> Self {
		Self::new(8, 256)
	}
	pub fn idx_bool() -> Self {
		Self::new(1, 2)
	}

	/// Pick the tiered variant matching a column's type, per the supported
	/// indexing set (string columns are never indexable).
	pub fn for_column_type(ty: ColumnType) -> Result<Self> {
		Ok(match ty {
			ColumnType::Boolean => Self::idx_bool(),
			ColumnType::Char => Self::idx1(),
			ColumnType::Short => Self::idx2(),
			ColumnType::Int | ColumnType::Float => Self::idx4(),
			ColumnType::Long | ColumnType::Double => Self::idx8(),
			ColumnType::String(_) => {
				return Err(Error::management("string columns have no supported index width"))
			}
		})
	}

	pub fn depth(&self) -> usize {
		self.depth
	}

	pub fn radix(&self) -> usize {
		self.radix
	}

	fn digit(&self, key: &[u8], level: usize) -> usize {
		key[level] as usize % self.radix
	}

	fn get_or_create(&self, slot: &Slot, level: usize) -> *mut NodeKind {
		let existing = slot.0.load(Ordering::Acquire);
		if !existing.is_null() {
			return existing;
		}
		let boxed = if level + 1 == self.depth {
			Box::new(NodeKind::Leaf(Exp2::new()))
		} else {
			Box::new(NodeKind::Interior((0..self.radix).map(|_| Slot::default()).collect()))
		};
		let raw = Box::into_raw(boxed);
		match slot.0.compare_exchange(std::ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
			Ok(_) => raw,
			Err(winner) => {
				// Lost the race to create this node; drop our allocation
				// and use the winner's instead.
				unsafe { drop(Box::from_raw(raw)) };
				winner
			}
		}
	}

	/// Walk/create nodes top-down for `key` (exactly `depth` bytes) and
	/// append `offset` to the leaf's reflog.
	pub fn insert(&self, key: &[u8], offset: u64) {
		debug_assert_eq!(key.len(), self.depth, "key length must match tree depth");
		let mut slots: &Vec<Slot> = &self.root;
		for level in 0..self.depth {
			let digit = self.digit(key, level);
			let slot = &slots[digit];
			let node = self.get_or_create(slot, level);
			// SAFETY: nodes are never freed while the tree is alive; see
			// `Drop` for the only place pointers are reclaimed.
			match unsafe { &*node } {
				NodeKind::Leaf(reflog) => {
					reflog.push(offset);
					return;
				}
				NodeKind::Interior(children) => {
					slots = children;
				}
			}
		}
		unreachable!("depth-bounded loop always terminates at a leaf");
	}

	/// Snapshot the reflog reachable under `key`, if any node has been
	/// created along that path yet. Not used by the append path but kept
	/// for callers that need point lookups over the index.
	pub fn lookup(&self, key: &[u8]) -> Option<Vec<u64>> {
		debug_assert_eq!(key.len(), self.depth);
		let mut slots: &Vec<Slot> = &self.root;
		for level in 0..self.depth {
			let digit = self.digit(key, level);
			let ptr = slots[digit].0.load(Ordering::Acquire);
			if ptr.is_null() {
				return None;
			}
			match unsafe { &*ptr } {
				NodeKind::Leaf(reflog) => return Some(reflog.to_vec()),
				NodeKind::Interior(children) => slots = children,
			}
		}
		unreachable!("depth-bounded loop always terminates at a leaf");
	}
}

fn free_node(ptr: *mut NodeKind) {
	if ptr.is_null() {
		return;
	}
	// SAFETY: called only from `Drop`, when no other reference to the tree
	// can exist.
	let boxed = unsafe { Box::from_raw(ptr) };
	if let NodeKind::Interior(children) = boxed.as_ref() {
		for slot in children {
			free_node(slot.0.load(Ordering::Relaxed));
		}
	}
}

impl Drop for RadixTree {
	fn drop(&mut self) {
		for slot in &self.root {
			free_node(slot.0.load(Ordering::Relaxed));
		}
	}
}

// The tree is built entirely from atomics and leaked-then-reclaimed raw
// pointers guarded by CAS; concurrent `insert`/`lookup` from many threads is
// the whole point.
unsafe impl Sync for RadixTree {}
unsafe impl Send for RadixTree {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insert_and_lookup_single_key() {
		let t = RadixTree::idx4();
		t.insert(&[0, 0, 0, 7], 100);
		t.insert(&[0, 0, 0, 7], 200);
		assert_eq!(t.lookup(&[0, 0, 0, 7]), Some(vec![100, 200]));
		assert_eq!(t.lookup(&[0, 0, 0, 8]), None);
	}

	#[test]
	fn distinct_keys_do_not_share_reflogs() {
		let t = RadixTree::idx1();
		t.insert(&[3], 1);
		t.insert(&[4], 2);
		assert_eq!(t.lookup(&[3]), Some(vec![1]));
		assert_eq!(t.lookup(&[4]), Some(vec![2]));
	}

	#[test]
	fn bool_tree_has_two_slots() {
		let t = RadixTree::idx_bool();
		t.insert(&[0], 1);
		t.insert(&[1], 2);
		assert_eq!(t.lookup(&[0]), Some(vec![1]));
		assert_eq!(t.lookup(&[1]), Some(vec![2]));
	}

	#[test]
	fn concurrent_inserts_under_shared_prefix() {
		use std::sync::Arc;
		use std::thread;
		let t = Arc::new(RadixTree::idx2());
		let key = [0x12, 0x34];
		let mut handles = Vec::new();
		for i in 0..16u64 {
			let t = t.clone();
			handles.push(thread::spawn(move || {
				for j in 0..200u64 {
					t.insert(&key, i * 200 + j);
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		let mut offsets = t.lookup(&key).unwrap();
		offsets.sort_unstable();
		assert_eq!(offsets, (0..3200).collect::<Vec<_>>());
	}

	#[test]
	fn for_column_type_rejects_strings() {
		use crate::schema::ColumnType;
		assert!(RadixTree::for_column_type(ColumnType::String(8)).is_err());
		assert!(RadixTree::for_column_type(ColumnType::Long).is_ok());
	}
}
