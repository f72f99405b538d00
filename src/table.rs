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

//! The orchestrator. `append` drives: log-write -> schema-apply ->
//! filter-update -> index-insert -> flush -> tail-publish. Steps 3 and 4
//! may run in either order but both must complete before the tail advances;
//! the flush always precedes the advance.
//!
//! Registration (`add_index`/`add_filter`/`add_trigger`) assigns each new
//! descriptor a dense id equal to its position in an append-only registry,
//! then persists it to the metadata log. Registries are snapshotted
//! (cloned, under a read lock) at the start of each `append` so
//! registration can proceed concurrently with ingest without the hot path
//! holding a lock across filter/index work.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::datalog::{DataLog, Reservation, DEFAULT_BUCKET_STRIDE, DEFAULT_CAPACITY};
use crate::error::{Error, Result};
use crate::expr::{ExpressionCompiler, SimpleCompiler};
use crate::filter::Filter;
use crate::metadata::{Descriptor, MetadataWriter};
use crate::radix::RadixTree;
use crate::schema::{IndexState, Schema, Value};
use crate::storage::{open_mapped, InMemoryStorage, StorageMode};
use crate::tail::ReadTail;
use crate::trigger::{AggregateKind, RelOp, Trigger};

/// Where a table's data log and metadata log live.
pub enum StorageChoice {
	InMemory,
	Mapped(PathBuf),
}

pub struct TableOptions {
	pub storage: StorageChoice,
	pub bucket_stride: u64,
	pub capacity: u64,
	pub clock: Arc<dyn Clock>,
	pub compiler: Box<dyn ExpressionCompiler>,
}

impl Default for TableOptions {
	fn default() -> Self {
		TableOptions {
			storage: StorageChoice::InMemory,
			bucket_stride: DEFAULT_BUCKET_STRIDE,
			capacity: DEFAULT_CAPACITY,
			clock: Arc::new(SystemClock),
			compiler: Box::new(SimpleCompiler),
		}
	}
}

pub struct Table {
	schema: Schema,
	data_log: DataLog,
	tail: ReadTail,
	clock: Arc<dyn Clock>,
	indexes: RwLock<Vec<Arc<RadixTree>>>,
	filters: RwLock<Vec<Arc<Filter>>>,
	triggers: RwLock<Vec<Arc<Trigger>>>,
	metadata: MetadataWriter,
	compiler: Box<dyn ExpressionCompiler>,
	record_count: AtomicU64,
}

impl Table {
	pub fn open(schema: Schema, options: TableOptions) -> Result<Self> {
		let storage: Box<dyn StorageMode> = match &options.storage {
			StorageChoice::InMemory => Box::new(InMemoryStorage::new()),
			StorageChoice::Mapped(path) => Box::new(open_mapped(path)?),
		};
		let metadata = match &options.storage {
			StorageChoice::InMemory => MetadataWriter::in_memory(),
			StorageChoice::Mapped(path) => MetadataWriter::file(path.join("metadata.log"))?,
		};
		Ok(Table {
			schema,
			data_log: DataLog::new(storage, options.bucket_stride, options.capacity),
			tail: ReadTail::new(),
			clock: options.clock,
			indexes: RwLock::new(Vec::new()),
			filters: RwLock::new(Vec::new()),
			triggers: RwLock::new(Vec::new()),
			metadata,
			compiler: options.compiler,
			record_count: AtomicU64::new(0),
		})
	}

	pub fn schema(&self) -> &Schema {
		&self.schema
	}

	pub fn tail(&self) -> u64 {
		self.tail.get()
	}

	/// Count of records whose `complete_append` has finished, maintained by
	/// a dedicated counter rather than derived from the tail: the tail also
	/// advances over padding bytes `DataLog::reserve` inserts when a record
	/// would otherwise straddle a bucket boundary, so `tail / stride` would
	/// over-count once accumulated padding reaches a full stride.
	pub fn num_records(&self) -> u64 {
		self.record_count.load(Ordering::Acquire)
	}

	/// Encode `values` per the schema and append them, stamping the record
	/// with `ts` or, if `None`, the injected clock's current time.
	/// Returns the record's offset.
	pub fn append(&self, values: &[Value], ts: Option<u64>) -> Result<u64> {
		let ts = ts.unwrap_or_else(|| self.clock.now_millis());
		let column_bytes = self.schema.encode_row(values)?;
		self.append_encoded(&column_bytes, ts)
	}

	/// The `append(bytes, n, ts) -> offset` primitive: `column_bytes` must be
	/// exactly the schema's column payload length. The on-disk header
	/// (timestamp + offset) is written by the table itself, since the
	/// offset isn't known until after reservation.
	pub fn append_encoded(&self, column_bytes: &[u8], ts: u64) -> Result<u64> {
		if column_bytes.len() as u64 != self.schema.column_payload_len() {
			return Err(Error::management(format!(
				"expected {} bytes of column payload, got {}",
				self.schema.column_payload_len(),
				column_bytes.len()
			)));
		}
		let stride = self.schema.record_stride();
		let reservation = self.data_log.reserve(stride)?;
		let offset = reservation.offset;
		if let Err(e) = self.complete_append(&reservation, column_bytes, ts) {
			// The extent is already numbered and can't be retracted: a
			// failure past this point is fatal, since the strict read tail
			// would spin forever waiting for this reservation to publish.
			log::error!(
				target: "recordstore",
				"append at offset {} failed after its extent was reserved ({}); \
				 the read tail can never advance past it",
				offset,
				e,
			);
			return Err(e);
		}
		Ok(offset)
	}

	fn complete_append(&self, reservation: &Reservation, column_bytes: &[u8], ts: u64) -> Result<()> {
		let offset = reservation.offset;
		let stride = self.schema.record_stride();

		let mut record_bytes = Vec::with_capacity(stride as usize);
		record_bytes.extend_from_slice(&ts.to_le_bytes());
		record_bytes.extend_from_slice(&offset.to_le_bytes());
		record_bytes.extend_from_slice(column_bytes);
		self.data_log.write_at(offset, &record_bytes)?;

		let view = self.schema.apply(offset, ts, column_bytes)?;

		// Steps 3/4 may run in either order; both must finish before the
		// tail advances.
		let filters = self.filters.read().clone();
		for f in filters.iter() {
			f.update(&view);
		}
		let indexes = self.indexes.read().clone();
		for field in view.fields() {
			if let Some(index_id) = field.index_id() {
				// `index_id` reads the column's *live* state, which a
				// concurrent `add_index` may have just advanced past the
				// length of the `indexes` snapshot already taken above.
				// Such an index was created after this append started, so
				// this record predates it and has nothing to contribute;
				// skip rather than index into a snapshot that doesn't
				// contain it.
				if index_id as usize >= indexes.len() {
					continue;
				}
				if let Some(key) = field.key_bytes()? {
					indexes[index_id as usize].insert(&key, offset);
				}
			}
		}

		self.data_log.flush(offset, stride)?;
		self.tail.advance(reservation.publish_from, reservation.publish_len)?;
		self.record_count.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	/// Read the raw record bytes (timestamp + offset header + columns) at
	/// `offset`, or `None` if `offset` is not yet covered by the published
	/// tail.
	pub fn get(&self, offset: u64) -> Result<Option<Vec<u8>>> {
		let stride = self.schema.record_stride();
		if offset + stride > self.tail.get() {
			return Ok(None);
		}
		let mut buf = vec![0u8; stride as usize];
		self.data_log.read(offset, &mut buf)?;
		Ok(Some(buf))
	}

	/// Like `get`, but decodes the header and column values.
	pub fn get_record(&self, offset: u64) -> Result<Option<(u64, Vec<Value>)>> {
		match self.get(offset)? {
			None => Ok(None),
			Some(bytes) => {
				let ts = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
				let values = self.schema.decode_row(&bytes[16..])?;
				Ok(Some((ts, values)))
			}
		}
	}

	/// Zero-copy pointer to the record at `offset`, or `None` if not yet
	/// published.
	pub fn ptr(&self, offset: u64) -> Result<Option<*const u8>> {
		let stride = self.schema.record_stride();
		if offset + stride > self.tail.get() {
			return Ok(None);
		}
		Ok(Some(self.data_log.ptr(offset)?))
	}

	/// Register a secondary index on `field`, coarsening numeric keys by
	/// `bucket_size` before insertion. Fails if the field doesn't exist, is
	/// already indexed/indexing, or its type has no supported key width.
	pub fn add_index(&self, field: &str, bucket_size: f64) -> Result<u32> {
		let ordinal = self
			.schema
			.ordinal_of(field)
			.ok_or_else(|| Error::management(format!("unknown field '{}'", field)))?;
		let column = self.schema.column(ordinal)?;
		if !column.ty().indexable() {
			return Err(Error::management(format!(
				"column '{}' has type {:?}, which has no supported index width",
				field,
				column.ty()
			)));
		}
		column.set_indexing()?;
		let tree = RadixTree::for_column_type(column.ty())?;
		let index_id = {
			let mut guard = self.indexes.write();
			let id = guard.len() as u32;
			guard.push(Arc::new(tree));
			id
		};
		column.set_indexed(index_id, bucket_size)?;
		self.metadata.append(&Descriptor::Index { id: index_id as u16, field: field.to_string(), bucket_size })?;
		log::info!(
			target: "recordstore",
			"index {} created on column '{}' with bucket_size {}",
			index_id,
			field,
			bucket_size,
		);
		Ok(index_id)
	}

	/// Disable the index on `field`. The underlying radix tree (and its
	/// entries) is retained; a later `add_index` on the same field
	/// allocates a fresh tree with a new id.
	pub fn remove_index(&self, field: &str) -> Result<()> {
		let ordinal = self
			.schema
			.ordinal_of(field)
			.ok_or_else(|| Error::management(format!("unknown field '{}'", field)))?;
		self.schema.column(ordinal)?.disable_indexing()
	}

	/// Compile `expression` against the schema, register the resulting
	/// filter with its monitor window, and persist the descriptor.
	pub fn add_filter(&self, expression: &str, monitor_ms: u64) -> Result<u32> {
		let predicate = self.compiler.compile(expression, &self.schema)?;
		let id = {
			let mut guard = self.filters.write();
			let id = guard.len() as u32;
			guard.push(Arc::new(Filter::new(id, expression, predicate, monitor_ms)));
			id
		};
		self.metadata.append(&Descriptor::Filter { id, expression: expression.to_string() })?;
		log::info!(target: "recordstore", "filter {} registered: '{}'", id, expression);
		Ok(id)
	}

	/// Register a threshold trigger over `filter_id`'s aggregate.
	pub fn add_trigger(
		&self,
		filter_id: u32,
		field: &str,
		aggregate: AggregateKind,
		op: RelOp,
		threshold: f64,
	) -> Result<u32> {
		{
			let guard = self.filters.read();
			if filter_id as usize >= guard.len() {
				return Err(Error::management(format!("unknown filter id {}", filter_id)));
			}
		}
		let id = {
			let mut guard = self.triggers.write();
			let id = guard.len() as u32;
			guard.push(Arc::new(Trigger::new(id, filter_id, field, aggregate, op, threshold)));
			id
		};
		self.metadata.append(&Descriptor::Trigger {
			id,
			filter_id,
			field: field.to_string(),
			aggregate,
			op,
			threshold,
		})?;
		Ok(id)
	}

	/// Snapshot the reflog reachable under `field`'s index for `value`, or
	/// `None` if the field isn't indexed or no record has taken that key
	/// yet. A convenience point-lookup; scan APIs are out of scope.
	pub fn index_lookup(&self, field: &str, value: &Value) -> Result<Option<Vec<u64>>> {
		let ordinal = self
			.schema
			.ordinal_of(field)
			.ok_or_else(|| Error::management(format!("unknown field '{}'", field)))?;
		let column = self.schema.column(ordinal)?;
		let (index_id, bucket_size) = match column.indexing_state() {
			IndexState::Indexed { index_id, bucket_size } => (index_id, bucket_size),
			_ => return Ok(None),
		};
		let key = crate::schema::encode_key(column.ty(), value, bucket_size)?;
		let guard = self.indexes.read();
		Ok(guard[index_id as usize].lookup(&key))
	}

	pub fn filter(&self, id: u32) -> Option<Arc<Filter>> {
		self.filters.read().get(id as usize).cloned()
	}

	pub fn trigger(&self, id: u32) -> Option<Arc<Trigger>> {
		self.triggers.read().get(id as usize).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::ColumnType;

	fn schema() -> Schema {
		Schema::new(vec![("id", ColumnType::Int), ("val", ColumnType::Double)])
	}

	fn table() -> Table {
		Table::open(schema(), TableOptions::default()).unwrap()
	}

	#[test]
	fn append_and_get_round_trip_scenario_1() {
		let t = table();
		let o1 = t.append(&[Value::Int(1), Value::Double(3.14)], Some(1000)).unwrap();
		let o2 = t.append(&[Value::Int(2), Value::Double(2.71)], Some(2000)).unwrap();
		assert_eq!(o1, 0);
		assert_eq!(o2, 28); // stride = 16 + 4 + 8
		assert_eq!(t.num_records(), 2);

		let (ts, values) = t.get_record(o1).unwrap().unwrap();
		assert_eq!(ts, 1000);
		assert_eq!(values, vec![Value::Int(1), Value::Double(3.14)]);
	}

	#[test]
	fn get_at_tail_is_not_found() {
		let t = table();
		t.append(&[Value::Int(1), Value::Double(1.0)], Some(0)).unwrap();
		assert!(t.get(t.tail()).unwrap().is_none());
	}

	#[test]
	fn indexing_scenario_2() {
		let t = table();
		t.add_index("val", 1.0).unwrap();
		t.append(&[Value::Int(1), Value::Double(3.14)], Some(0)).unwrap();
		t.append(&[Value::Int(2), Value::Double(3.9)], Some(0)).unwrap();
		t.append(&[Value::Int(3), Value::Double(4.1)], Some(0)).unwrap();

		let bucket3 = t.index_lookup("val", &Value::Double(3.14)).unwrap().unwrap();
		assert_eq!(bucket3.len(), 2);
		let bucket4 = t.index_lookup("val", &Value::Double(4.1)).unwrap().unwrap();
		assert_eq!(bucket4.len(), 1);
	}

	#[test]
	fn add_index_on_missing_field_errors_scenario_5() {
		let t = table();
		assert!(matches!(t.add_index("MISSING", 1.0), Err(Error::Management(_))));
	}

	#[test]
	fn add_index_twice_errors_scenario_6() {
		let t = table();
		t.add_index("val", 1.0).unwrap();
		assert!(t.add_index("val", 1.0).is_err());
	}

	#[test]
	fn remove_then_add_index_succeeds() {
		let t = table();
		t.add_index("val", 1.0).unwrap();
		t.remove_index("val").unwrap();
		let id = t.add_index("val", 2.0).unwrap();
		assert_eq!(id, 1, "a fresh tree gets a new dense id even on the same column");
	}

	#[test]
	fn remove_without_index_errors() {
		let t = table();
		assert!(t.remove_index("val").is_err());
	}

	#[test]
	fn filter_and_trigger_registration_scenario_3() {
		let t = table();
		let filter_id = t.add_filter("val > 3.0", 1000).unwrap();
		let trigger_id = t.add_trigger(filter_id, "val", AggregateKind::Count, RelOp::Ge, 1.0).unwrap();
		assert_eq!(filter_id, 0);
		assert_eq!(trigger_id, 0);

		t.append(&[Value::Int(1), Value::Double(2.0)], Some(0)).unwrap();
		t.append(&[Value::Int(2), Value::Double(3.5)], Some(500)).unwrap();
		t.append(&[Value::Int(3), Value::Double(4.0)], Some(1500)).unwrap();

		let filter = t.filter(filter_id).unwrap();
		assert_eq!(filter.aggregate_bucket(0).unwrap().count, 1);
		assert_eq!(filter.aggregate_bucket(1).unwrap().count, 1);

		let trigger = t.trigger(trigger_id).unwrap();
		assert!(trigger.check(&filter.aggregate_bucket(0).unwrap()));
	}

	#[test]
	fn add_trigger_on_unknown_filter_errors() {
		let t = table();
		assert!(t.add_trigger(0, "val", AggregateKind::Count, RelOp::Ge, 1.0).is_err());
	}

	#[test]
	fn concurrent_append_scenario_4() {
		use std::collections::HashSet;
		use std::sync::Arc as StdArc;
		use std::thread;

		let t = StdArc::new(table());
		let threads = 8;
		let per_thread = 10_000;
		let mut handles = Vec::with_capacity(threads);
		for i in 0..threads {
			let t = t.clone();
			handles.push(thread::spawn(move || {
				let mut offsets = Vec::with_capacity(per_thread);
				for j in 0..per_thread {
					let offset =
						t.append(&[Value::Int(i as i32), Value::Double(j as f64)], Some(0)).unwrap();
					offsets.push(offset);
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
		assert_eq!(all.len(), threads * per_thread);
		assert_eq!(t.num_records(), (threads * per_thread) as u64);
		for &offset in &all {
			assert!(t.get(offset).unwrap().is_some());
		}
	}
}
