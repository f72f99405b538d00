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

//! Storage mode: the capability governing how the monolog's bucket regions
//! are allocated, flushed, and read. Two variants ship: `InMemory` (flush is
//! a no-op) and `Mapped` (flush is a durability barrier over an mmap'd file).
//!
//! A "region" is one bucket of the monolog's bucket array, identified by its
//! index. Regions are allocated once, at a fixed size, and never resized —
//! growth happens by allocating additional regions, never by growing an
//! existing one, so a region's backing address is stable for its lifetime.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::Result;

/// A byte region that grows: one fixed-size bucket, backed by memory or a
/// memory-mapped file, allocated lazily on first touch.
pub trait StorageMode: Send + Sync {
	/// Allocate (or reuse, if already allocated) the region at `region`
	/// with exactly `size` bytes. Idempotent: a second call with the same
	/// size is a no-op.
	fn allocate(&self, region: usize, size: u64) -> Result<()>;

	/// Durability barrier for `len` bytes starting at `offset` within
	/// `region`. A no-op for in-memory mode.
	fn flush(&self, region: usize, offset: u64, len: u64) -> Result<()>;

	/// Copy `dst.len()` bytes starting at `offset` within `region` into
	/// `dst`. The caller guarantees `region` was allocated and the range is
	/// in bounds; this never faults for an in-range offset.
	fn read(&self, region: usize, offset: u64, dst: &mut [u8]) -> Result<()>;

	/// Copy `src` into `region` at `offset`. The caller guarantees disjoint
	/// writers never overlap ranges within the same region.
	fn write(&self, region: usize, offset: u64, src: &[u8]) -> Result<()>;

	/// Raw pointer to byte `offset` within `region`, valid for the lifetime
	/// of the storage mode. Used by zero-copy record views.
	fn pointer(&self, region: usize, offset: u64) -> Result<*const u8>;
}

/// In-memory storage mode: each region is a boxed byte slice behind an
/// `UnsafeCell`. Concurrent writers are sound because the table never hands
/// out overlapping write ranges (data log extents are reserved disjointly).
pub struct InMemoryStorage {
	regions: RwLock<Vec<Option<Box<UnsafeCell<Box<[u8]>>>>>>,
}

// SAFETY: disjoint-range writes are the caller's contract; reads never race
// with writes to the same bytes because a reader only observes offsets the
// read tail has already published.
unsafe impl Sync for InMemoryStorage {}

impl Default for InMemoryStorage {
	fn default() -> Self {
		InMemoryStorage { regions: RwLock::new(Vec::new()) }
	}
}

impl InMemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	fn with_region<R>(&self, region: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
		let guard = self.regions.read();
		let slot = guard
			.get(region)
			.and_then(|o| o.as_ref())
			.ok_or_else(|| crate::error::Error::invariant(format!("region {} not allocated", region)))?;
		// SAFETY: the slice is never resized once allocated; see module docs.
		let bytes: &[u8] = unsafe { &*slot.get() };
		Ok(f(bytes))
	}
}

impl StorageMode for InMemoryStorage {
	fn allocate(&self, region: usize, size: u64) -> Result<()> {
		let mut guard = self.regions.write();
		if guard.len() <= region {
			guard.resize_with(region + 1, || None);
		}
		if guard[region].is_none() {
			let buf = vec![0u8; size as usize].into_boxed_slice();
			guard[region] = Some(Box::new(UnsafeCell::new(buf)));
		}
		Ok(())
	}

	fn flush(&self, _region: usize, _offset: u64, _len: u64) -> Result<()> {
		Ok(())
	}

	fn read(&self, region: usize, offset: u64, dst: &mut [u8]) -> Result<()> {
		self.with_region(region, |bytes| {
			let start = offset as usize;
			dst.copy_from_slice(&bytes[start..start + dst.len()]);
		})
	}

	fn write(&self, region: usize, offset: u64, src: &[u8]) -> Result<()> {
		let guard = self.regions.read();
		let slot = guard
			.get(region)
			.and_then(|o| o.as_ref())
			.ok_or_else(|| crate::error::Error::invariant(format!("region {} not allocated", region)))?;
		// SAFETY: writers reserve disjoint byte ranges; see module docs.
		let bytes: &mut [u8] = unsafe { &mut *slot.get() };
		let start = offset as usize;
		bytes[start..start + src.len()].copy_from_slice(src);
		Ok(())
	}

	fn pointer(&self, region: usize, offset: u64) -> Result<*const u8> {
		self.with_region(region, |bytes| unsafe { bytes.as_ptr().add(offset as usize) })
	}
}

/// File-backed, memory-mapped storage mode. Each region is its own file
/// under `base_dir`, preallocated to `size` bytes and mapped with
/// `memmap2::MmapMut`. `flush` calls `MmapMut::flush_range`, a real
/// durability barrier.
pub struct MappedStorage {
	base_dir: PathBuf,
	regions: RwLock<Vec<Option<MappedRegion>>>,
}

struct MappedRegion {
	#[allow(dead_code)]
	file: File,
	map: UnsafeCell<MmapMut>,
}

// SAFETY: same disjoint-write contract as `InMemoryStorage`.
unsafe impl Sync for MappedRegion {}

impl MappedStorage {
	pub fn new(base_dir: impl Into<PathBuf>) -> Self {
		MappedStorage { base_dir: base_dir.into(), regions: RwLock::new(Vec::new()) }
	}

	fn region_path(&self, region: usize) -> PathBuf {
		self.base_dir.join(format!("bucket_{:06}.dat", region))
	}

	fn with_map<R>(&self, region: usize, f: impl FnOnce(&MmapMut) -> R) -> Result<R> {
		let guard = self.regions.read();
		let slot = guard
			.get(region)
			.and_then(|o| o.as_ref())
			.ok_or_else(|| crate::error::Error::invariant(format!("region {} not allocated", region)))?;
		// SAFETY: the map is never remapped once allocated.
		let map: &MmapMut = unsafe { &*slot.map.get() };
		Ok(f(map))
	}
}

impl StorageMode for MappedStorage {
	fn allocate(&self, region: usize, size: u64) -> Result<()> {
		let mut guard = self.regions.write();
		if guard.len() <= region {
			guard.resize_with(region + 1, || None);
		}
		if guard[region].is_none() {
			std::fs::create_dir_all(&self.base_dir)?;
			let path = self.region_path(region);
			let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
			file.set_len(size)?;
			let map = unsafe { MmapMut::map_mut(&file)? };
			guard[region] = Some(MappedRegion { file, map: UnsafeCell::new(map) });
		}
		Ok(())
	}

	fn flush(&self, region: usize, offset: u64, len: u64) -> Result<()> {
		self.with_map(region, |map| map.flush_range(offset as usize, len as usize))?
			.map_err(Into::into)
	}

	fn read(&self, region: usize, offset: u64, dst: &mut [u8]) -> Result<()> {
		self.with_map(region, |map| {
			let start = offset as usize;
			dst.copy_from_slice(&map[start..start + dst.len()]);
		})
	}

	fn write(&self, region: usize, offset: u64, src: &[u8]) -> Result<()> {
		let guard = self.regions.read();
		let slot = guard
			.get(region)
			.and_then(|o| o.as_ref())
			.ok_or_else(|| crate::error::Error::invariant(format!("region {} not allocated", region)))?;
		// SAFETY: writers reserve disjoint byte ranges; see module docs.
		let map: &mut MmapMut = unsafe { &mut *slot.map.get() };
		let start = offset as usize;
		map[start..start + src.len()].copy_from_slice(src);
		Ok(())
	}

	fn pointer(&self, region: usize, offset: u64) -> Result<*const u8> {
		self.with_map(region, |map| unsafe { map.as_ptr().add(offset as usize) })
	}
}

/// Convenience: open a mapped storage mode and preallocate its base
/// directory, mirroring the teacher's `ValueTable::open` preallocation of
/// the metadata entry on first touch.
pub fn open_mapped(base_dir: impl AsRef<Path>) -> Result<MappedStorage> {
	std::fs::create_dir_all(base_dir.as_ref())?;
	Ok(MappedStorage::new(base_dir.as_ref()))
}
