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

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the record store.
#[derive(Debug)]
pub enum Error {
	/// Registration or lookup failure: unknown field, unsupported type for
	/// indexing, duplicate index, remove without index, malformed expression.
	/// The string carries the offending field/expression text verbatim.
	Management(String),
	/// Backing storage failure.
	Io(std::io::Error),
	/// Contract violation: non-monotonic tail advance, out-of-range ordinal,
	/// and similar conditions that should never occur outside of a bug.
	Invariant(String),
}

impl Error {
	pub fn management(msg: impl Into<String>) -> Error {
		Error::Management(msg.into())
	}

	pub fn invariant(msg: impl Into<String>) -> Error {
		Error::Invariant(msg.into())
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Management(msg) => write!(f, "management error: {}", msg),
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::Invariant(msg) => write!(f, "invariant violation: {}", msg),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}
