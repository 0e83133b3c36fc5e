//! wal2json decode.
//!
//! The replicator polls the logical slot with `format-version 2`, which emits
//! one JSON document per action: `I`/`U`/`D` rows with `columns` (new tuple)
//! and `identity` (old tuple / replica identity). This module turns those
//! documents into typed changes; everything downstream works on `Change`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::prelude::*;
use crate::types::Lsn;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
	Insert,
	Update,
	Delete,
}

impl ChangeOp {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChangeOp::Insert => "INSERT",
			ChangeOp::Update => "UPDATE",
			ChangeOp::Delete => "DELETE",
		}
	}

	pub fn parse(s: &str) -> Option<ChangeOp> {
		match s {
			"INSERT" => Some(ChangeOp::Insert),
			"UPDATE" => Some(ChangeOp::Update),
			"DELETE" => Some(ChangeOp::Delete),
			_ => None,
		}
	}
}

/// One column of a decoded tuple.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Column {
	pub name: Box<str>,
	#[serde(rename = "type")]
	pub typ: Box<str>,
}

/// A decoded row change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Change {
	pub schema: Box<str>,
	pub table: Box<str>,
	pub operation: ChangeOp,
	pub columns: Vec<Column>,
	/// New tuple for INSERT/UPDATE, empty object for DELETE
	pub record: Value,
	/// Replica identity for UPDATE/DELETE, empty object for INSERT
	pub old_record: Value,
	pub commit_timestamp: Option<DateTime<Utc>>,
	pub lsn: Lsn,
}

#[derive(Deserialize)]
struct RawColumn {
	name: String,
	#[serde(rename = "type")]
	typ: String,
	#[serde(default)]
	value: Value,
}

#[derive(Deserialize)]
struct RawAction {
	action: String,
	#[serde(default)]
	schema: String,
	#[serde(default)]
	table: String,
	#[serde(default)]
	columns: Vec<RawColumn>,
	#[serde(default)]
	identity: Vec<RawColumn>,
	#[serde(default)]
	timestamp: Option<String>,
}

/// Decode one wal2json v2 document at `lsn`.
///
/// Returns `Ok(None)` for non-row actions (`B`egin, `C`ommit, truncate,
/// messages) which the pipeline skips without error.
pub fn decode(lsn: Lsn, raw: &str) -> RmResult<Option<Change>> {
	let action: RawAction = serde_json::from_str(raw).map_err(|err| {
		warn!("undecodable wal2json document at {}: {}", lsn, err);
		Error::Parse
	})?;

	let operation = match action.action.as_str() {
		"I" => ChangeOp::Insert,
		"U" => ChangeOp::Update,
		"D" => ChangeOp::Delete,
		_ => return Ok(None),
	};

	let commit_timestamp = action
		.timestamp
		.as_deref()
		.and_then(|ts| DateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f%#z").ok())
		.map(|dt| dt.with_timezone(&Utc));

	let columns = action
		.columns
		.iter()
		.map(|c| Column { name: c.name.as_str().into(), typ: c.typ.as_str().into() })
		.collect();

	Ok(Some(Change {
		schema: action.schema.into(),
		table: action.table.into(),
		operation,
		columns,
		record: tuple_to_object(action.columns),
		old_record: tuple_to_object(action.identity),
		commit_timestamp,
		lsn,
	}))
}

fn tuple_to_object(columns: Vec<RawColumn>) -> Value {
	let mut map = serde_json::Map::with_capacity(columns.len());
	for column in columns {
		map.insert(column.name, column.value);
	}
	Value::Object(map)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lsn() -> Lsn {
		Lsn::parse("0/1A2B3C").unwrap()
	}

	#[test]
	fn test_decode_insert() {
		let raw = r#"{
			"action": "I",
			"schema": "public",
			"table": "pg_changes",
			"columns": [
				{"name": "id", "type": "integer", "value": 42},
				{"name": "body", "type": "text", "value": "hello"}
			],
			"timestamp": "2026-03-01 12:00:00.000000+00"
		}"#;
		let change = decode(lsn(), raw).unwrap().unwrap();
		assert_eq!(change.operation, ChangeOp::Insert);
		assert_eq!(&*change.schema, "public");
		assert_eq!(&*change.table, "pg_changes");
		assert_eq!(change.record["id"], 42);
		assert_eq!(change.record["body"], "hello");
		assert_eq!(change.old_record, serde_json::json!({}));
		assert!(change.commit_timestamp.is_some());
	}

	#[test]
	fn test_decode_update_carries_identity() {
		let raw = r#"{
			"action": "U",
			"schema": "public",
			"table": "users",
			"columns": [{"name": "id", "type": "integer", "value": 7},
						{"name": "name", "type": "text", "value": "after"}],
			"identity": [{"name": "id", "type": "integer", "value": 7},
						 {"name": "name", "type": "text", "value": "before"}]
		}"#;
		let change = decode(lsn(), raw).unwrap().unwrap();
		assert_eq!(change.operation, ChangeOp::Update);
		assert_eq!(change.record["name"], "after");
		assert_eq!(change.old_record["name"], "before");
	}

	#[test]
	fn test_decode_delete() {
		let raw = r#"{
			"action": "D",
			"schema": "public",
			"table": "users",
			"identity": [{"name": "id", "type": "integer", "value": 7}]
		}"#;
		let change = decode(lsn(), raw).unwrap().unwrap();
		assert_eq!(change.operation, ChangeOp::Delete);
		assert_eq!(change.record, serde_json::json!({}));
		assert_eq!(change.old_record["id"], 7);
	}

	#[test]
	fn test_decode_skips_transaction_markers() {
		assert!(decode(lsn(), r#"{"action": "B"}"#).unwrap().is_none());
		assert!(decode(lsn(), r#"{"action": "C"}"#).unwrap().is_none());
		assert!(decode(lsn(), r#"{"action": "T", "schema": "s", "table": "t"}"#)
			.unwrap()
			.is_none());
	}

	#[test]
	fn test_decode_garbage_is_parse_error() {
		assert!(decode(lsn(), "nope").is_err());
	}
}

// vim: ts=4
