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

//! Column metadata, name lookup, and tuple decoding into iterable typed
//! field views. A schema is immutable after construction except for each
//! column's indexing state, which transitions `unindexed -> indexing ->
//! indexed -> unindexed` under atomic per-column guards.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::error::{Error, Result};

pub const HEADER_LEN: u64 = 16; // u64 timestamp + u64 original offset

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
	Boolean,
	Char,
	Short,
	Int,
	Long,
	Float,
	Double,
	/// Fixed-width string, right-padded with `0x00`.
	String(u16),
}

impl ColumnType {
	pub fn width(&self) -> u16 {
		match self {
			ColumnType::Boolean => 1,
			ColumnType::Char => 1,
			ColumnType::Short => 2,
			ColumnType::Int => 4,
			ColumnType::Long => 8,
			ColumnType::Float => 4,
			ColumnType::Double => 8,
			ColumnType::String(w) => *w,
		}
	}

	/// Whether this type can back a secondary index: the radix tree's
	/// tiered variants only exist for 1/2/4/8-byte keys and booleans.
	pub fn indexable(&self) -> bool {
		!matches!(self, ColumnType::String(_))
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Bool(bool),
	Char(i8),
	Short(i16),
	Int(i32),
	Long(i64),
	Float(f32),
	Double(f64),
	String(Vec<u8>),
}

/// Snapshot of a column's indexing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexState {
	Unindexed,
	Indexing,
	Indexed { index_id: u32, bucket_size: f64 },
}

const STATE_UNINDEXED: u8 = 0;
const STATE_INDEXING: u8 = 1;
const STATE_INDEXED: u8 = 2;

pub struct Column {
	name: String,
	ordinal: usize,
	ty: ColumnType,
	state: AtomicU8,
	index_id: AtomicU32,
	bucket_size_bits: AtomicU64,
}

impl Column {
	fn new(name: impl Into<String>, ordinal: usize, ty: ColumnType) -> Self {
		Column {
			name: name.into(),
			ordinal,
			ty,
			state: AtomicU8::new(STATE_UNINDEXED),
			index_id: AtomicU32::new(0),
			bucket_size_bits: AtomicU64::new(0),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn ordinal(&self) -> usize {
		self.ordinal
	}

	pub fn ty(&self) -> ColumnType {
		self.ty
	}

	pub fn is_indexed(&self) -> bool {
		self.state.load(Ordering::Acquire) == STATE_INDEXED
	}

	pub fn indexing_state(&self) -> IndexState {
		match self.state.load(Ordering::Acquire) {
			STATE_UNINDEXED => IndexState::Unindexed,
			STATE_INDEXING => IndexState::Indexing,
			STATE_INDEXED => IndexState::Indexed {
				index_id: self.index_id.load(Ordering::Acquire),
				bucket_size: f64::from_bits(self.bucket_size_bits.load(Ordering::Acquire)),
			},
			other => unreachable!("invalid column index state {}", other),
		}
	}

	/// `unindexed -> indexing`. Idempotent rejection if already
	/// indexing/indexed.
	pub fn set_indexing(&self) -> Result<()> {
		self.state
			.compare_exchange(STATE_UNINDEXED, STATE_INDEXING, Ordering::AcqRel, Ordering::Acquire)
			.map(|_| ())
			.map_err(|_| Error::management(format!("column '{}' is already indexed or indexing", self.name)))
	}

	/// `indexing -> indexed`, recording the index id and the bucket size
	/// used to coarsen keys before insertion.
	pub fn set_indexed(&self, index_id: u32, bucket_size: f64) -> Result<()> {
		self.index_id.store(index_id, Ordering::Relaxed);
		self.bucket_size_bits.store(bucket_size.to_bits(), Ordering::Relaxed);
		self.state
			.compare_exchange(STATE_INDEXING, STATE_INDEXED, Ordering::AcqRel, Ordering::Acquire)
			.map(|_| ())
			.map_err(|_| Error::invariant(format!("column '{}' was not in the indexing state", self.name)))
	}

	/// `indexed -> unindexed`. The underlying radix tree is retained by the
	/// caller; this only flips the column's visible state.
	pub fn disable_indexing(&self) -> Result<()> {
		self.state
			.compare_exchange(STATE_INDEXED, STATE_UNINDEXED, Ordering::AcqRel, Ordering::Acquire)
			.map(|_| ())
			.map_err(|_| Error::management(format!("column '{}' has no index to remove", self.name)))
	}
}

pub struct Schema {
	columns: Vec<Column>,
	name_map: HashMap<String, usize>,
	column_payload_len: u64,
}

impl Schema {
	pub fn new(columns: Vec<(impl Into<String>, ColumnType)>) -> Self {
		let mut cols = Vec::with_capacity(columns.len());
		let mut name_map = HashMap::with_capacity(columns.len());
		let mut payload_len = 0u64;
		for (ordinal, (name, ty)) in columns.into_iter().enumerate() {
			let name = name.into();
			name_map.insert(name.to_uppercase(), ordinal);
			payload_len += ty.width() as u64;
			cols.push(Column::new(name, ordinal, ty));
		}
		Schema { columns: cols, name_map, column_payload_len: payload_len }
	}

	pub fn columns(&self) -> &[Column] {
		&self.columns
	}

	pub fn column(&self, ordinal: usize) -> Result<&Column> {
		self.columns.get(ordinal).ok_or_else(|| Error::invariant(format!("ordinal {} out of range", ordinal)))
	}

	/// Case-insensitive name lookup.
	pub fn ordinal_of(&self, name: &str) -> Option<usize> {
		self.name_map.get(&name.to_uppercase()).copied()
	}

	/// Total bytes of column payload (excludes the 16-byte timestamp/offset
	/// header).
	pub fn column_payload_len(&self) -> u64 {
		self.column_payload_len
	}

	/// Total on-disk record size, per the §6 layout: header + columns.
	pub fn record_stride(&self) -> u64 {
		HEADER_LEN + self.column_payload_len
	}

	fn column_offset(&self, ordinal: usize) -> u64 {
		self.columns[..ordinal].iter().map(|c| c.ty.width() as u64).sum()
	}

	/// Encode column values into their packed, little-endian on-disk form
	/// (§6). Does not include the timestamp/offset header.
	pub fn encode_row(&self, values: &[Value]) -> Result<Vec<u8>> {
		if values.len() != self.columns.len() {
			return Err(Error::management(format!(
				"expected {} column values, got {}",
				self.columns.len(),
				values.len()
			)));
		}
		let mut out = Vec::with_capacity(self.column_payload_len as usize);
		for (col, value) in self.columns.iter().zip(values) {
			encode_value_le(col.ty(), value, &mut out)?;
		}
		Ok(out)
	}

	pub fn decode_row(&self, bytes: &[u8]) -> Result<Vec<Value>> {
		if bytes.len() as u64 != self.column_payload_len {
			return Err(Error::invariant(format!(
				"expected {} bytes of column payload, got {}",
				self.column_payload_len,
				bytes.len()
			)));
		}
		let mut out = Vec::with_capacity(self.columns.len());
		let mut pos = 0usize;
		for col in &self.columns {
			let w = col.ty().width() as usize;
			out.push(decode_value_le(col.ty(), &bytes[pos..pos + w])?);
			pos += w;
		}
		Ok(out)
	}

	/// Construct a decoding view over `column_bytes` (exactly
	/// `column_payload_len()` bytes), attaching the record's offset and
	/// timestamp.
	pub fn apply<'a>(&'a self, offset: u64, ts: u64, column_bytes: &'a [u8]) -> Result<RecordView<'a>> {
		if column_bytes.len() as u64 != self.column_payload_len {
			return Err(Error::invariant(format!(
				"record at {} has {} bytes of column payload, schema expects {}",
				offset,
				column_bytes.len(),
				self.column_payload_len
			)));
		}
		Ok(RecordView { schema: self, offset, ts, bytes: column_bytes })
	}
}

pub struct RecordView<'a> {
	schema: &'a Schema,
	offset: u64,
	ts: u64,
	bytes: &'a [u8],
}

impl<'a> RecordView<'a> {
	pub fn offset(&self) -> u64 {
		self.offset
	}

	pub fn ts(&self) -> u64 {
		self.ts
	}

	/// Field views in column order.
	pub fn fields(&self) -> impl Iterator<Item = FieldView<'a>> + 'a {
		let schema = self.schema;
		let bytes = self.bytes;
		schema.columns.iter().map(move |col| {
			let start = schema.column_offset(col.ordinal()) as usize;
			let end = start + col.ty().width() as usize;
			FieldView { column: col, raw: &bytes[start..end] }
		})
	}

	pub fn field(&self, ordinal: usize) -> Result<FieldView<'a>> {
		self.fields().nth(ordinal).ok_or_else(|| Error::invariant(format!("ordinal {} out of range", ordinal)))
	}
}

pub struct FieldView<'a> {
	column: &'a Column,
	raw: &'a [u8],
}

impl<'a> FieldView<'a> {
	pub fn ordinal(&self) -> usize {
		self.column.ordinal()
	}

	pub fn ty(&self) -> ColumnType {
		self.column.ty()
	}

	pub fn is_indexed(&self) -> bool {
		self.column.is_indexed()
	}

	pub fn index_id(&self) -> Option<u32> {
		match self.column.indexing_state() {
			IndexState::Indexed { index_id, .. } => Some(index_id),
			_ => None,
		}
	}

	pub fn value(&self) -> Result<Value> {
		decode_value_le(self.column.ty(), self.raw)
	}

	/// The big-endian, order-preserving key bytes this field would insert
	/// into its column's radix tree, or `None` if the column isn't
	/// currently indexed.
	pub fn key_bytes(&self) -> Result<Option<Vec<u8>>> {
		match self.column.indexing_state() {
			IndexState::Indexed { bucket_size, .. } => {
				let value = self.value()?;
				Ok(Some(encode_key(self.column.ty(), &value, bucket_size)?))
			}
			_ => Ok(None),
		}
	}
}

fn encode_value_le(ty: ColumnType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
	match (ty, value) {
		(ColumnType::Boolean, Value::Bool(b)) => out.push(*b as u8),
		(ColumnType::Char, Value::Char(v)) => out.push(*v as u8),
		(ColumnType::Short, Value::Short(v)) => out.extend_from_slice(&v.to_le_bytes()),
		(ColumnType::Int, Value::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
		(ColumnType::Long, Value::Long(v)) => out.extend_from_slice(&v.to_le_bytes()),
		(ColumnType::Float, Value::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
		(ColumnType::Double, Value::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),
		(ColumnType::String(width), Value::String(bytes)) => {
			if bytes.len() > width as usize {
				return Err(Error::management(format!(
					"string value of {} bytes exceeds column width {}",
					bytes.len(),
					width
				)));
			}
			out.extend_from_slice(bytes);
			out.resize(out.len() + (width as usize - bytes.len()), 0u8);
		}
		_ => return Err(Error::management("value type does not match column type")),
	}
	Ok(())
}

fn decode_value_le(ty: ColumnType, bytes: &[u8]) -> Result<Value> {
	Ok(match ty {
		ColumnType::Boolean => Value::Bool(bytes[0] != 0),
		ColumnType::Char => Value::Char(bytes[0] as i8),
		ColumnType::Short => Value::Short(i16::from_le_bytes(bytes.try_into().unwrap())),
		ColumnType::Int => Value::Int(i32::from_le_bytes(bytes.try_into().unwrap())),
		ColumnType::Long => Value::Long(i64::from_le_bytes(bytes.try_into().unwrap())),
		ColumnType::Float => Value::Float(f32::from_le_bytes(bytes.try_into().unwrap())),
		ColumnType::Double => Value::Double(f64::from_le_bytes(bytes.try_into().unwrap())),
		ColumnType::String(_) => Value::String(bytes.to_vec()),
	})
}

/// Divide by `bucket_size` and round toward negative infinity, per §4.3.
fn quantize(value: f64, bucket_size: f64) -> Result<i64> {
	if !(bucket_size > 0.0) {
		return Err(Error::management("bucket_size must be a positive real"));
	}
	let bucket = (value / bucket_size).floor();
	if !bucket.is_finite() || bucket < i64::MIN as f64 || bucket > i64::MAX as f64 {
		return Err(Error::invariant("quantized bucket index out of range"));
	}
	Ok(bucket as i64)
}

/// Big-endian, order-preserving key bytes for `value`, coarsened by
/// `bucket_size` for floating columns. See §4.3.
pub fn encode_key(ty: ColumnType, value: &Value, bucket_size: f64) -> Result<Vec<u8>> {
	match (ty, value) {
		(ColumnType::Boolean, Value::Bool(b)) => Ok(vec![*b as u8]),
		(ColumnType::Char, Value::Char(v)) => Ok(vec![(*v as u8) ^ 0x80]),
		(ColumnType::Short, Value::Short(v)) => Ok((((*v as u16) ^ 0x8000u16).to_be_bytes()).to_vec()),
		(ColumnType::Int, Value::Int(v)) => Ok((((*v as u32) ^ 0x8000_0000u32).to_be_bytes()).to_vec()),
		(ColumnType::Long, Value::Long(v)) => {
			Ok((((*v as u64) ^ 0x8000_0000_0000_0000u64).to_be_bytes()).to_vec())
		}
		(ColumnType::Float, Value::Float(v)) => {
			let bucket = quantize(*v as f64, bucket_size)?;
			let b = i32::try_from(bucket).map_err(|_| Error::invariant("float bucket index overflow"))?;
			Ok((((b as u32) ^ 0x8000_0000u32).to_be_bytes()).to_vec())
		}
		(ColumnType::Double, Value::Double(v)) => {
			let bucket = quantize(*v, bucket_size)?;
			Ok((((bucket as u64) ^ 0x8000_0000_0000_0000u64).to_be_bytes()).to_vec())
		}
		(ColumnType::String(_), _) => Err(Error::management("string columns cannot be indexed")),
		_ => Err(Error::invariant("value type does not match column type")),
	}
}

/// Fixed key width a column's index would use: matches the teacher's
/// `idx1_t..idx8_t`/`idx_bool_t` tiers.
pub fn key_width(ty: ColumnType) -> Option<u16> {
	match ty {
		ColumnType::Boolean => Some(1),
		ColumnType::Char => Some(1),
		ColumnType::Short => Some(2),
		ColumnType::Int | ColumnType::Float => Some(4),
		ColumnType::Long | ColumnType::Double => Some(8),
		ColumnType::String(_) => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema() -> Schema {
		Schema::new(vec![("id", ColumnType::Int), ("val", ColumnType::Double)])
	}

	#[test]
	fn name_lookup_is_case_insensitive() {
		let s = schema();
		assert_eq!(s.ordinal_of("val"), Some(1));
		assert_eq!(s.ordinal_of("VAL"), Some(1));
		assert_eq!(s.ordinal_of("missing"), None);
	}

	#[test]
	fn stride_matches_scenario_1() {
		let s = schema();
		// 16 (header) + 4 (int) + 8 (double) = 28
		assert_eq!(s.record_stride(), 28);
	}

	#[test]
	fn round_trip_encode_decode() {
		let s = schema();
		let values = vec![Value::Int(1), Value::Double(3.14)];
		let bytes = s.encode_row(&values).unwrap();
		assert_eq!(bytes.len() as u64, s.column_payload_len());
		let decoded = s.decode_row(&bytes).unwrap();
		assert_eq!(decoded, values);
	}

	#[test]
	fn record_view_iterates_in_column_order() {
		let s = schema();
		let bytes = s.encode_row(&[Value::Int(7), Value::Double(9.5)]).unwrap();
		let view = s.apply(0, 1000, &bytes).unwrap();
		let ords: Vec<usize> = view.fields().map(|f| f.ordinal()).collect();
		assert_eq!(ords, vec![0, 1]);
	}

	#[test]
	fn index_state_machine() {
		let s = schema();
		let col = s.column(1).unwrap();
		assert_eq!(col.indexing_state(), IndexState::Unindexed);
		col.set_indexing().unwrap();
		assert!(col.set_indexing().is_err());
		col.set_indexed(0, 1.0).unwrap();
		assert!(col.is_indexed());
		assert_eq!(col.indexing_state(), IndexState::Indexed { index_id: 0, bucket_size: 1.0 });
		col.disable_indexing().unwrap();
		assert_eq!(col.indexing_state(), IndexState::Unindexed);
		assert!(col.disable_indexing().is_err());
	}

	#[test]
	fn float_key_quantization_matches_spec_scenario_2() {
		let bucket_size = 1.0;
		let k = |v: f64| encode_key(ColumnType::Double, &Value::Double(v), bucket_size).unwrap();
		assert_eq!(k(3.14), k(3.9));
		assert_ne!(k(3.9), k(4.1));
	}

	#[test]
	fn integer_key_encoding_preserves_order() {
		// values ascending; their encoded keys must sort lexicographically
		// in the same order for the radix tree to preserve numeric order.
		let values = [-100i32, -1, 0, 1, 100];
		let keys_in_value_order: Vec<Vec<u8>> =
			values.iter().map(|v| encode_key(ColumnType::Int, &Value::Int(*v), 1.0).unwrap()).collect();
		let mut keys_sorted = keys_in_value_order.clone();
		keys_sorted.sort();
		assert_eq!(keys_sorted, keys_in_value_order);
	}

	#[test]
	fn string_columns_reject_indexing_key_encoding() {
		let v = Value::String(b"abc".to_vec());
		assert!(encode_key(ColumnType::String(8), &v, 1.0).is_err());
	}
}
