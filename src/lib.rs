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

//! A concurrent, append-only record store: fixed-schema rows land in a
//! byte-addressed data log behind a strictly ordered read tail, with
//! optional per-column secondary indexes (a lock-free radix tree keyed on
//! an order-preserving encoding of the column's value) and streaming
//! filters/triggers evaluated inline as each record is appended.
//!
//! [`Table`] is the entry point: open one over a [`Schema`], `append` rows,
//! `get` them back by offset, and register indexes, filters, and triggers
//! against it.

mod clock;
mod datalog;
mod error;
mod expr;
mod filter;
mod metadata;
mod monolog;
mod radix;
mod schema;
mod seq;
mod storage;
mod table;
mod tail;
mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use expr::{ExpressionCompiler, Predicate, SimpleCompiler};
pub use filter::{AggregateSnapshot, Filter};
pub use metadata::{Descriptor, MetadataWriter};
pub use schema::{Column, ColumnType, FieldView, IndexState, RecordView, Schema, Value};
pub use storage::{InMemoryStorage, MappedStorage, StorageMode};
pub use table::{StorageChoice, Table, TableOptions};
pub use trigger::{AggregateKind, RelOp, Trigger};
