// The compiled expression contract this core consumes. Parsing an
// expression source string is explicitly out of scope (§1): any external
// expression-language compiler that can produce a `Predicate` plugs in
// here. `SimpleCompiler` below is a minimal reference implementation
// covering the single-comparison expressions used in this crate's own
// tests; it is not the production expression language.

use crate::error::{Error, Result};
use crate::schema::{Schema, Value};
use crate::schema::RecordView;

/// An opaque, deterministic predicate over a record view, plus the numeric
/// projection a filter uses to feed its windowed aggregate.
pub trait Predicate: Send + Sync {
	fn evaluate(&self, record: &RecordView) -> bool;

	/// The numeric value a filter folds into its aggregate for records that
	/// pass `evaluate`. `None` means this record contributes nothing
	/// numeric (evaluate-only filters).
	fn project(&self, record: &RecordView) -> Option<f64>;
}

/// Compiles expression source against a schema into a `Predicate`. Errors:
/// parse, type-mismatch, unknown-field (§6).
pub trait ExpressionCompiler {
	fn compile(&self, source: &str, schema: &Schema) -> Result<Box<dyn Predicate>>;
}

#[derive(Clone, Copy, PartialEq)]
enum Op {
	Gt,
	Ge,
	Lt,
	Le,
	Eq,
}

/// A single `field OP literal` comparison, with the compared field also
/// used as the aggregate projection. Supports the numeric column types;
/// covers exactly the expressions this crate's own test scenarios need.
struct Comparison {
	ordinal: usize,
	op: Op,
	literal: f64,
}

fn field_as_f64(value: &Value) -> Option<f64> {
	match value {
		Value::Bool(b) => Some(*b as u8 as f64),
		Value::Char(v) => Some(*v as f64),
		Value::Short(v) => Some(*v as f64),
		Value::Int(v) => Some(*v as f64),
		Value::Long(v) => Some(*v as f64),
		Value::Float(v) => Some(*v as f64),
		Value::Double(v) => Some(*v),
		Value::String(_) => None,
	}
}

impl Predicate for Comparison {
	fn evaluate(&self, record: &RecordView) -> bool {
		let Ok(field) = record.field(self.ordinal) else { return false };
		let Ok(value) = field.value() else { return false };
		let Some(lhs) = field_as_f64(&value) else { return false };
		match self.op {
			Op::Gt => lhs > self.literal,
			Op::Ge => lhs >= self.literal,
			Op::Lt => lhs < self.literal,
			Op::Le => lhs <= self.literal,
			Op::Eq => lhs == self.literal,
		}
	}

	fn project(&self, record: &RecordView) -> Option<f64> {
		record.field(self.ordinal).ok().and_then(|f| f.value().ok()).and_then(|v| field_as_f64(&v))
	}
}

/// Reference compiler for `"<field> <op> <literal>"`, ops in
/// `{>, >=, <, <=, ==}`. Not the production expression language — see
/// module docs.
pub struct SimpleCompiler;

impl ExpressionCompiler for SimpleCompiler {
	fn compile(&self, source: &str, schema: &Schema) -> Result<Box<dyn Predicate>> {
		let trimmed = source.trim();
		let (op, split_at) = [(">=", Op::Ge), ("<=", Op::Le), ("==", Op::Eq), (">", Op::Gt), ("<", Op::Lt)]
			.into_iter()
			.find_map(|(tok, op)| trimmed.find(tok).map(|i| (op, (i, tok.len()))))
			.ok_or_else(|| Error::management(format!("malformed expression: '{}'", source)))?;
		let (idx, tok_len) = split_at;
		let field_name = trimmed[..idx].trim();
		let literal_str = trimmed[idx + tok_len..].trim();
		let ordinal = schema
			.ordinal_of(field_name)
			.ok_or_else(|| Error::management(format!("unknown field '{}' in expression '{}'", field_name, source)))?;
		let literal: f64 = literal_str
			.parse()
			.map_err(|_| Error::management(format!("expected numeric literal in expression '{}'", source)))?;
		Ok(Box::new(Comparison { ordinal, op, literal }))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::ColumnType;

	#[test]
	fn compiles_and_evaluates_simple_comparison() {
		let schema = Schema::new(vec![("id", ColumnType::Int), ("val", ColumnType::Double)]);
		let pred = SimpleCompiler.compile("val > 3.0", &schema).unwrap();
		let bytes = schema.encode_row(&[Value::Int(1), Value::Double(4.0)]).unwrap();
		let view = schema.apply(0, 0, &bytes).unwrap();
		assert!(pred.evaluate(&view));
		assert_eq!(pred.project(&view), Some(4.0));

		let bytes2 = schema.encode_row(&[Value::Int(2), Value::Double(2.0)]).unwrap();
		let view2 = schema.apply(28, 0, &bytes2).unwrap();
		assert!(!pred.evaluate(&view2));
	}

	#[test]
	fn unknown_field_is_a_management_error() {
		let schema = Schema::new(vec![("id", ColumnType::Int)]);
		assert!(SimpleCompiler.compile("nope > 1", &schema).is_err());
	}
}
