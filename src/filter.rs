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

//! A compiled predicate plus a ring of per-window aggregates keyed by the
//! record timestamp quantized to the filter's monitor window. `update` is
//! safe to call concurrently from any number of appending threads; bucket
//! merges are commutative/associative atomic CAS loops, not locks, on the
//! hot path — only bucket creation and eviction take the coarse map lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::expr::Predicate;
use crate::schema::RecordView;

/// Buckets older than this many windows behind the newest seen bucket are
/// dropped lazily on insert.
pub const DEFAULT_RETENTION_BUCKETS: u64 = 1024;

struct Aggregate {
	count: AtomicU64,
	sum_bits: AtomicU64,
	min_bits: AtomicU64,
	max_bits: AtomicU64,
}

impl Aggregate {
	fn new() -> Self {
		Aggregate {
			count: AtomicU64::new(0),
			sum_bits: AtomicU64::new(0f64.to_bits()),
			min_bits: AtomicU64::new(f64::INFINITY.to_bits()),
			max_bits: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
		}
	}

	fn merge(&self, value: f64) {
		self.count.fetch_add(1, Ordering::Relaxed);
		atomic_f64_update(&self.sum_bits, |s| s + value);
		atomic_f64_update(&self.min_bits, |m| m.min(value));
		atomic_f64_update(&self.max_bits, |m| m.max(value));
	}

	fn snapshot(&self) -> AggregateSnapshot {
		AggregateSnapshot {
			count: self.count.load(Ordering::Acquire),
			sum: f64::from_bits(self.sum_bits.load(Ordering::Acquire)),
			min: f64::from_bits(self.min_bits.load(Ordering::Acquire)),
			max: f64::from_bits(self.max_bits.load(Ordering::Acquire)),
		}
	}
}

fn atomic_f64_update(cell: &AtomicU64, f: impl Fn(f64) -> f64) {
	let mut cur = cell.load(Ordering::Relaxed);
	loop {
		let next = f(f64::from_bits(cur)).to_bits();
		match cell.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
			Ok(_) => return,
			Err(actual) => cur = actual,
		}
	}
}

/// A read-only snapshot of one window bucket's aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSnapshot {
	pub count: u64,
	pub sum: f64,
	pub min: f64,
	pub max: f64,
}

impl AggregateSnapshot {
	pub fn mean(&self) -> f64 {
		if self.count == 0 {
			0.0
		} else {
			self.sum / self.count as f64
		}
	}
}

pub struct Filter {
	id: u32,
	expression: String,
	predicate: Box<dyn Predicate>,
	window_ms: u64,
	retention_buckets: u64,
	buckets: RwLock<HashMap<u64, Aggregate>>,
	newest_bucket: AtomicU64,
}

impl Filter {
	pub fn new(id: u32, expression: impl Into<String>, predicate: Box<dyn Predicate>, window_ms: u64) -> Self {
		Filter {
			id,
			expression: expression.into(),
			predicate,
			window_ms: window_ms.max(1),
			retention_buckets: DEFAULT_RETENTION_BUCKETS,
			buckets: RwLock::new(HashMap::new()),
			newest_bucket: AtomicU64::new(0),
		}
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn expression(&self) -> &str {
		&self.expression
	}

	pub fn window_ms(&self) -> u64 {
		self.window_ms
	}

	fn bucket_of(&self, ts: u64) -> u64 {
		ts / self.window_ms
	}

	fn evict_older_than(&self, bucket: u64) {
		if bucket <= self.retention_buckets {
			return;
		}
		let floor = bucket - self.retention_buckets;
		let mut guard = self.buckets.write();
		guard.retain(|&k, _| k >= floor);
	}

	/// Evaluate the compiled predicate against `record`; if it passes and
	/// yields a numeric projection, merge that value into the bucket for
	/// `record`'s timestamp.
	pub fn update(&self, record: &RecordView) {
		if !self.predicate.evaluate(record) {
			return;
		}
		let value = match self.predicate.project(record) {
			Some(v) => v,
			None => return,
		};
		let bucket = self.bucket_of(record.ts());
		let prev_newest = self.newest_bucket.fetch_max(bucket, Ordering::AcqRel);
		if bucket > prev_newest {
			self.evict_older_than(bucket);
		}
		{
			let guard = self.buckets.read();
			if let Some(agg) = guard.get(&bucket) {
				agg.merge(value);
				return;
			}
		}
		let mut guard = self.buckets.write();
		guard.entry(bucket).or_insert_with(Aggregate::new).merge(value);
	}

	/// Snapshot of the aggregate for the window bucket containing `ts`, if
	/// any record has landed there (and it hasn't since been evicted).
	pub fn aggregate_at(&self, ts: u64) -> Option<AggregateSnapshot> {
		let bucket = self.bucket_of(ts);
		self.buckets.read().get(&bucket).map(Aggregate::snapshot)
	}

	pub fn aggregate_bucket(&self, bucket: u64) -> Option<AggregateSnapshot> {
		self.buckets.read().get(&bucket).map(Aggregate::snapshot)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::expr::SimpleCompiler;
	use crate::expr::ExpressionCompiler;
	use crate::schema::{ColumnType, Schema, Value};

	#[test]
	fn windowed_aggregate_matches_spec_scenario_3() {
		let schema = Schema::new(vec![("val", ColumnType::Double)]);
		let predicate = SimpleCompiler.compile("val > 3.0", &schema).unwrap();
		let filter = Filter::new(0, "val > 3.0", predicate, 1000);

		let records = [(0u64, 2.0), (500, 3.5), (1500, 4.0)];
		for (ts, val) in records {
			let bytes = schema.encode_row(&[Value::Double(val)]).unwrap();
			let view = schema.apply(0, ts, &bytes).unwrap();
			filter.update(&view);
		}

		assert_eq!(filter.aggregate_bucket(0).unwrap().count, 1);
		assert_eq!(filter.aggregate_bucket(1).unwrap().count, 1);
		assert!(filter.aggregate_bucket(2).is_none());
	}

	#[test]
	fn mean_and_min_max_accumulate() {
		let schema = Schema::new(vec![("val", ColumnType::Double)]);
		let predicate = SimpleCompiler.compile("val >= 0.0", &schema).unwrap();
		let filter = Filter::new(0, "val >= 0.0", predicate, 1000);
		for v in [1.0, 2.0, 3.0] {
			let bytes = schema.encode_row(&[Value::Double(v)]).unwrap();
			let view = schema.apply(0, 0, &bytes).unwrap();
			filter.update(&view);
		}
		let snap = filter.aggregate_bucket(0).unwrap();
		assert_eq!(snap.count, 3);
		assert_eq!(snap.sum, 6.0);
		assert_eq!(snap.min, 1.0);
		assert_eq!(snap.max, 3.0);
		assert_eq!(snap.mean(), 2.0);
	}

	#[test]
	fn concurrent_updates_merge_correctly() {
		use std::sync::Arc;
		use std::thread;
		let schema = Arc::new(Schema::new(vec![("val", ColumnType::Double)]));
		let predicate = SimpleCompiler.compile("val >= 0.0", &schema).unwrap();
		let filter = Arc::new(Filter::new(0, "val >= 0.0", predicate, 1_000_000));
		let mut handles = Vec::new();
		for _ in 0..8 {
			let schema = schema.clone();
			let filter = filter.clone();
			handles.push(thread::spawn(move || {
				for _ in 0..1000 {
					let bytes = schema.encode_row(&[Value::Double(1.0)]).unwrap();
					let view = schema.apply(0, 0, &bytes).unwrap();
					filter.update(&view);
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		let snap = filter.aggregate_bucket(0).unwrap();
		assert_eq!(snap.count, 8000);
		assert_eq!(snap.sum, 8000.0);
	}
}
