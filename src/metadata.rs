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

//! Durable, append-only record of registrations: every `add_index`,
//! `add_filter`, and `add_trigger` call writes one descriptor here before
//! it is considered complete. Unlike the data log, this isn't a hot path —
//! registration is rare and short, so a single coarse lock around the
//! append is the same tradeoff the teacher makes for its own header
//! updates (`ValueTable`'s `dirty_header` flag guarded writes).
//!
//! On-disk shape, one record per registration (§6):
//! `[kind: u8][len: u32][payload]`
//! - `0x01` Index:   u16 id, u16 name_len, name bytes, f64 bucket_size
//! - `0x02` Filter:  u32 id, u32 expr_len, expr bytes
//! - `0x03` Trigger: u32 id, u32 filter_id, u8 aggregate_kind, u16 name_len,
//!   name bytes, u8 relop_kind, 16 bytes numeric threshold (tagged union;
//!   this implementation's threshold is always `f64`, stored in the first
//!   8 bytes with the remaining 8 reserved).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::trigger::{AggregateKind, RelOp};

#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
	Index { id: u16, field: String, bucket_size: f64 },
	Filter { id: u32, expression: String },
	Trigger { id: u32, filter_id: u32, field: String, aggregate: AggregateKind, op: RelOp, threshold: f64 },
}

const KIND_INDEX: u8 = 0x01;
const KIND_FILTER: u8 = 0x02;
const KIND_TRIGGER: u8 = 0x03;

fn aggregate_tag(a: AggregateKind) -> u8 {
	match a {
		AggregateKind::Sum => 0,
		AggregateKind::Count => 1,
		AggregateKind::Min => 2,
		AggregateKind::Max => 3,
		AggregateKind::Mean => 4,
	}
}

fn aggregate_from_tag(tag: u8) -> Result<AggregateKind> {
	Ok(match tag {
		0 => AggregateKind::Sum,
		1 => AggregateKind::Count,
		2 => AggregateKind::Min,
		3 => AggregateKind::Max,
		4 => AggregateKind::Mean,
		other => return Err(Error::invariant(format!("unknown aggregate kind tag {}", other))),
	})
}

fn relop_tag(op: RelOp) -> u8 {
	match op {
		RelOp::Gt => 0,
		RelOp::Ge => 1,
		RelOp::Lt => 2,
		RelOp::Le => 3,
		RelOp::Eq => 4,
	}
}

fn relop_from_tag(tag: u8) -> Result<RelOp> {
	Ok(match tag {
		0 => RelOp::Gt,
		1 => RelOp::Ge,
		2 => RelOp::Lt,
		3 => RelOp::Le,
		4 => RelOp::Eq,
		other => return Err(Error::invariant(format!("unknown relop tag {}", other))),
	})
}

pub fn encode(d: &Descriptor) -> Vec<u8> {
	let mut payload = Vec::new();
	let kind = match d {
		Descriptor::Index { id, field, bucket_size } => {
			payload.extend_from_slice(&id.to_le_bytes());
			payload.extend_from_slice(&(field.len() as u16).to_le_bytes());
			payload.extend_from_slice(field.as_bytes());
			payload.extend_from_slice(&bucket_size.to_le_bytes());
			KIND_INDEX
		}
		Descriptor::Filter { id, expression } => {
			payload.extend_from_slice(&id.to_le_bytes());
			payload.extend_from_slice(&(expression.len() as u32).to_le_bytes());
			payload.extend_from_slice(expression.as_bytes());
			KIND_FILTER
		}
		Descriptor::Trigger { id, filter_id, field, aggregate, op, threshold } => {
			payload.extend_from_slice(&id.to_le_bytes());
			payload.extend_from_slice(&filter_id.to_le_bytes());
			payload.push(aggregate_tag(*aggregate));
			payload.extend_from_slice(&(field.len() as u16).to_le_bytes());
			payload.extend_from_slice(field.as_bytes());
			payload.push(relop_tag(*op));
			let mut threshold_bytes = [0u8; 16];
			threshold_bytes[0..8].copy_from_slice(&threshold.to_le_bytes());
			payload.extend_from_slice(&threshold_bytes);
			KIND_TRIGGER
		}
	};
	let mut out = Vec::with_capacity(5 + payload.len());
	out.push(kind);
	out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
	out.extend_from_slice(&payload);
	out
}

fn read_u16(bytes: &[u8], pos: &mut usize) -> Result<u16> {
	let v = u16::from_le_bytes(bytes.get(*pos..*pos + 2).ok_or_else(truncated)?.try_into().unwrap());
	*pos += 2;
	Ok(v)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
	let v = u32::from_le_bytes(bytes.get(*pos..*pos + 4).ok_or_else(truncated)?.try_into().unwrap());
	*pos += 4;
	Ok(v)
}

fn read_f64(bytes: &[u8], pos: &mut usize) -> Result<f64> {
	let v = f64::from_le_bytes(bytes.get(*pos..*pos + 8).ok_or_else(truncated)?.try_into().unwrap());
	*pos += 8;
	Ok(v)
}

fn read_string(bytes: &[u8], pos: &mut usize, len: usize) -> Result<String> {
	let s = String::from_utf8(bytes.get(*pos..*pos + len).ok_or_else(truncated)?.to_vec())
		.map_err(|_| Error::invariant("metadata field name/expression is not valid utf-8"))?;
	*pos += len;
	Ok(s)
}

fn truncated() -> Error {
	Error::invariant("truncated metadata record")
}

/// Decode every descriptor in `bytes`, in append order.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Descriptor>> {
	let mut out = Vec::new();
	let mut pos = 0usize;
	while pos < bytes.len() {
		let kind = *bytes.get(pos).ok_or_else(truncated)?;
		pos += 1;
		let len = read_u32(bytes, &mut pos)? as usize;
		let payload = bytes.get(pos..pos + len).ok_or_else(truncated)?;
		pos += len;
		let mut p = 0usize;
		out.push(match kind {
			KIND_INDEX => {
				let id = read_u16(payload, &mut p)?;
				let name_len = read_u16(payload, &mut p)? as usize;
				let field = read_string(payload, &mut p, name_len)?;
				let bucket_size = read_f64(payload, &mut p)?;
				Descriptor::Index { id, field, bucket_size }
			}
			KIND_FILTER => {
				let id = read_u32(payload, &mut p)?;
				let expr_len = read_u32(payload, &mut p)? as usize;
				let expression = read_string(payload, &mut p, expr_len)?;
				Descriptor::Filter { id, expression }
			}
			KIND_TRIGGER => {
				let id = read_u32(payload, &mut p)?;
				let filter_id = read_u32(payload, &mut p)?;
				let aggregate = aggregate_from_tag(*payload.get(p).ok_or_else(truncated)?)?;
				p += 1;
				let name_len = read_u16(payload, &mut p)? as usize;
				let field = read_string(payload, &mut p, name_len)?;
				let op = relop_from_tag(*payload.get(p).ok_or_else(truncated)?)?;
				p += 1;
				let threshold = read_f64(payload, &mut p)?;
				Descriptor::Trigger { id, filter_id, field, aggregate, op, threshold }
			}
			other => return Err(Error::invariant(format!("unknown metadata descriptor kind {}", other))),
		});
	}
	Ok(out)
}

enum Sink {
	Memory(Vec<u8>),
	File(File),
}

impl Sink {
	fn append(&mut self, bytes: &[u8]) -> Result<()> {
		match self {
			Sink::Memory(buf) => {
				buf.extend_from_slice(bytes);
				Ok(())
			}
			Sink::File(file) => {
				file.write_all(bytes)?;
				file.sync_data()?;
				Ok(())
			}
		}
	}

	fn snapshot(&self) -> Vec<u8> {
		match self {
			Sink::Memory(buf) => buf.clone(),
			Sink::File(_) => Vec::new(),
		}
	}
}

/// Append-only metadata writer. One instance per table.
pub struct MetadataWriter {
	sink: Mutex<Sink>,
}

impl MetadataWriter {
	pub fn in_memory() -> Self {
		MetadataWriter { sink: Mutex::new(Sink::Memory(Vec::new())) }
	}

	pub fn file(path: impl AsRef<Path>) -> Result<Self> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		Ok(MetadataWriter { sink: Mutex::new(Sink::File(file)) })
	}

	pub fn append(&self, descriptor: &Descriptor) -> Result<()> {
		let bytes = encode(descriptor);
		self.sink.lock().append(&bytes)
	}

	/// Snapshot of everything written so far, for `Memory` sinks (tests and
	/// in-process recovery); file-backed sinks should be read back from
	/// disk instead.
	pub fn snapshot(&self) -> Vec<u8> {
		self.sink.lock().snapshot()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn index_descriptor_round_trips() {
		let d = Descriptor::Index { id: 3, field: "val".into(), bucket_size: 1.5 };
		let bytes = encode(&d);
		let decoded = decode_all(&bytes).unwrap();
		assert_eq!(decoded, vec![d]);
	}

	#[test]
	fn trigger_descriptor_round_trips() {
		let d = Descriptor::Trigger {
			id: 1,
			filter_id: 0,
			field: "val".into(),
			aggregate: AggregateKind::Mean,
			op: RelOp::Ge,
			threshold: 10.5,
		};
		let bytes = encode(&d);
		assert_eq!(decode_all(&bytes).unwrap(), vec![d]);
	}

	#[test]
	fn multiple_descriptors_append_and_replay() {
		let writer = MetadataWriter::in_memory();
		writer.append(&Descriptor::Index { id: 0, field: "val".into(), bucket_size: 1.0 }).unwrap();
		writer.append(&Descriptor::Filter { id: 0, expression: "val > 3.0".into() }).unwrap();
		let all = decode_all(&writer.snapshot()).unwrap();
		assert_eq!(all.len(), 2);
	}
}
