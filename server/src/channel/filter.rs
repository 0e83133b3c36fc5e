//! Row filters for change subscriptions.
//!
//! Clients subscribe to changes as `{event, schema, table, filter}` where
//! `filter` is `column=op.literal` with op one of eq, neq, lt, lte, gt, gte,
//! in. A subscription matches a change when schema, table and operation all
//! match and the filter (if any) evaluates true against the new record (old
//! record for deletes).

use serde_json::Value;

use crate::cdc::decoder::{Change, ChangeOp};
use crate::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
	Eq,
	Neq,
	Lt,
	Lte,
	Gt,
	Gte,
	In,
}

impl FilterOp {
	fn parse(s: &str) -> Option<FilterOp> {
		match s {
			"eq" => Some(FilterOp::Eq),
			"neq" => Some(FilterOp::Neq),
			"lt" => Some(FilterOp::Lt),
			"lte" => Some(FilterOp::Lte),
			"gt" => Some(FilterOp::Gt),
			"gte" => Some(FilterOp::Gte),
			"in" => Some(FilterOp::In),
			_ => None,
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
	pub column: Box<str>,
	pub op: FilterOp,
	/// Raw literal; `in` keeps the list unsplit until eval
	pub literal: Box<str>,
}

impl Filter {
	/// Parse `column=op.literal`.
	pub fn parse(s: &str) -> RmResult<Filter> {
		let (column, rest) = s
			.split_once('=')
			.ok_or_else(|| Error::ValidationError(format!("filter missing '=': {}", s)))?;
		let (op, literal) = rest
			.split_once('.')
			.ok_or_else(|| Error::ValidationError(format!("filter missing operator: {}", s)))?;
		if column.is_empty() {
			return Err(Error::ValidationError(format!("filter missing column: {}", s)));
		}
		let op = FilterOp::parse(op)
			.ok_or_else(|| Error::ValidationError(format!("unknown filter operator: {}", op)))?;
		Ok(Filter { column: column.into(), op, literal: literal.into() })
	}

	/// Evaluate against a decoded record. Missing columns never match.
	pub fn matches(&self, record: &Value) -> bool {
		let Some(actual) = record.get(&*self.column) else {
			return false;
		};
		match self.op {
			FilterOp::Eq => compare(actual, &self.literal) == Some(std::cmp::Ordering::Equal),
			FilterOp::Neq => {
				compare(actual, &self.literal).is_some_and(|o| o != std::cmp::Ordering::Equal)
			}
			FilterOp::Lt => compare(actual, &self.literal) == Some(std::cmp::Ordering::Less),
			FilterOp::Lte => compare(actual, &self.literal)
				.is_some_and(|o| o != std::cmp::Ordering::Greater),
			FilterOp::Gt => compare(actual, &self.literal) == Some(std::cmp::Ordering::Greater),
			FilterOp::Gte => {
				compare(actual, &self.literal).is_some_and(|o| o != std::cmp::Ordering::Less)
			}
			FilterOp::In => self
				.literal
				.trim_start_matches('(')
				.trim_end_matches(')')
				.split(',')
				.any(|item| compare(actual, item.trim()) == Some(std::cmp::Ordering::Equal)),
		}
	}
}

/// Compare a JSON value against a textual literal. Numbers compare
/// numerically, booleans as booleans, everything else as strings.
fn compare(actual: &Value, literal: &str) -> Option<std::cmp::Ordering> {
	match actual {
		Value::Number(n) => {
			let actual = n.as_f64()?;
			let expected: f64 = literal.parse().ok()?;
			actual.partial_cmp(&expected)
		}
		Value::Bool(b) => {
			let expected: bool = literal.parse().ok()?;
			Some(b.cmp(&expected))
		}
		Value::String(s) => Some(s.as_str().cmp(literal)),
		Value::Null => None,
		_ => None,
	}
}

/// A compiled change subscription of one subscriber.
#[derive(Clone, Debug)]
pub struct ChangeSelector {
	pub schema: Box<str>,
	/// None = all tables in the schema
	pub table: Option<Box<str>>,
	/// None = all operations
	pub operation: Option<ChangeOp>,
	pub filter: Option<Filter>,
}

impl ChangeSelector {
	/// Build from a join payload entry `{event, schema, table, filter}`.
	pub fn from_config(
		event: &str,
		schema: &str,
		table: Option<&str>,
		filter: Option<&str>,
	) -> RmResult<ChangeSelector> {
		let operation = match event {
			"*" => None,
			event => Some(
				ChangeOp::parse(event)
					.ok_or_else(|| Error::ValidationError(format!("unknown event: {}", event)))?,
			),
		};
		if schema.is_empty() {
			return Err(Error::ValidationError("postgres_changes entry missing schema".into()));
		}
		let table = table.filter(|t| !t.is_empty() && *t != "*");
		Ok(ChangeSelector {
			schema: schema.into(),
			table: table.map(Into::into),
			operation,
			filter: filter.map(Filter::parse).transpose()?,
		})
	}

	pub fn matches(&self, change: &Change) -> bool {
		if *self.schema != *change.schema {
			return false;
		}
		if let Some(table) = &self.table {
			if **table != *change.table {
				return false;
			}
		}
		if let Some(operation) = self.operation {
			if operation != change.operation {
				return false;
			}
		}
		match &self.filter {
			Some(filter) => {
				let record = match change.operation {
					ChangeOp::Delete => &change.old_record,
					_ => &change.record,
				};
				filter.matches(record)
			}
			None => true,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Lsn;
	use serde_json::json;

	fn change(op: ChangeOp, record: Value) -> Change {
		Change {
			schema: "public".into(),
			table: "pg_changes".into(),
			operation: op,
			columns: Vec::new(),
			old_record: if op == ChangeOp::Delete { record.clone() } else { json!({}) },
			record: if op == ChangeOp::Delete { json!({}) } else { record },
			commit_timestamp: None,
			lsn: Lsn(1),
		}
	}

	#[test]
	fn test_parse_eq() {
		let f = Filter::parse("id=eq.42").unwrap();
		assert_eq!(&*f.column, "id");
		assert_eq!(f.op, FilterOp::Eq);
		assert_eq!(&*f.literal, "42");
	}

	#[test]
	fn test_parse_rejects_malformed() {
		assert!(Filter::parse("id").is_err());
		assert!(Filter::parse("id=42").is_err());
		assert!(Filter::parse("id=almost.42").is_err());
		assert!(Filter::parse("=eq.42").is_err());
	}

	#[test]
	fn test_numeric_comparisons() {
		let record = json!({ "id": 42 });
		assert!(Filter::parse("id=eq.42").unwrap().matches(&record));
		assert!(!Filter::parse("id=eq.41").unwrap().matches(&record));
		assert!(Filter::parse("id=neq.41").unwrap().matches(&record));
		assert!(Filter::parse("id=lt.43").unwrap().matches(&record));
		assert!(Filter::parse("id=lte.42").unwrap().matches(&record));
		assert!(Filter::parse("id=gt.41").unwrap().matches(&record));
		assert!(Filter::parse("id=gte.42").unwrap().matches(&record));
		assert!(!Filter::parse("id=gt.42").unwrap().matches(&record));
	}

	#[test]
	fn test_string_and_bool_comparisons() {
		let record = json!({ "status": "open", "done": false });
		assert!(Filter::parse("status=eq.open").unwrap().matches(&record));
		assert!(!Filter::parse("status=eq.closed").unwrap().matches(&record));
		assert!(Filter::parse("done=eq.false").unwrap().matches(&record));
		assert!(!Filter::parse("done=eq.true").unwrap().matches(&record));
	}

	#[test]
	fn test_in_list() {
		let record = json!({ "id": 2 });
		assert!(Filter::parse("id=in.(1,2,3)").unwrap().matches(&record));
		assert!(!Filter::parse("id=in.(4,5)").unwrap().matches(&record));
	}

	#[test]
	fn test_missing_column_never_matches() {
		let record = json!({ "id": 1 });
		assert!(!Filter::parse("other=eq.1").unwrap().matches(&record));
		assert!(!Filter::parse("other=neq.1").unwrap().matches(&record));
	}

	#[test]
	fn test_selector_matching() {
		let selector =
			ChangeSelector::from_config("INSERT", "public", Some("pg_changes"), Some("id=eq.42"))
				.unwrap();
		assert!(selector.matches(&change(ChangeOp::Insert, json!({ "id": 42 }))));
		assert!(!selector.matches(&change(ChangeOp::Insert, json!({ "id": 41 }))));
		assert!(!selector.matches(&change(ChangeOp::Update, json!({ "id": 42 }))));
	}

	#[test]
	fn test_selector_wildcards() {
		let selector = ChangeSelector::from_config("*", "public", None, None).unwrap();
		assert!(selector.matches(&change(ChangeOp::Insert, json!({ "id": 1 }))));
		assert!(selector.matches(&change(ChangeOp::Delete, json!({ "id": 1 }))));
	}

	#[test]
	fn test_delete_filters_against_old_record() {
		let selector =
			ChangeSelector::from_config("DELETE", "public", Some("pg_changes"), Some("id=eq.7"))
				.unwrap();
		assert!(selector.matches(&change(ChangeOp::Delete, json!({ "id": 7 }))));
		assert!(!selector.matches(&change(ChangeOp::Delete, json!({ "id": 8 }))));
	}

	#[test]
	fn test_selector_rejects_unknown_event() {
		assert!(ChangeSelector::from_config("UPSERT", "public", None, None).is_err());
	}
}

// vim: ts=4
