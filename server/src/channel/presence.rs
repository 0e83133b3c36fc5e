//! Per-topic presence state.
//!
//! An OR-set keyed by a client-chosen string. Each tracked session
//! contributes one meta tagged with a globally unique `phx_ref`; an entry
//! disappears only when its last meta does. Merges are unions over
//! `phx_ref`, which makes cluster sync idempotent.

use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::SubRef;

#[derive(Clone, Debug)]
pub struct Meta {
	pub phx_ref: Box<str>,
	pub sub_ref: SubRef,
	pub payload: Value,
}

impl Meta {
	fn to_json(&self) -> Value {
		let mut obj = match &self.payload {
			Value::Object(map) => map.clone(),
			Value::Null => serde_json::Map::new(),
			other => {
				let mut map = serde_json::Map::new();
				map.insert("payload".into(), other.clone());
				map
			}
		};
		obj.insert("phx_ref".into(), Value::String(self.phx_ref.to_string()));
		Value::Object(obj)
	}
}

/// A presence delta: key -> metas that joined / left.
#[derive(Clone, Debug, Default)]
pub struct PresenceDiff {
	pub joins: HashMap<Box<str>, Vec<Meta>>,
	pub leaves: HashMap<Box<str>, Vec<Meta>>,
}

impl PresenceDiff {
	pub fn is_empty(&self) -> bool {
		self.joins.is_empty() && self.leaves.is_empty()
	}

	pub fn to_json(&self) -> Value {
		json!({
			"joins": entries_json(&self.joins),
			"leaves": entries_json(&self.leaves),
		})
	}
}

fn entries_json(entries: &HashMap<Box<str>, Vec<Meta>>) -> Value {
	let mut out = serde_json::Map::with_capacity(entries.len());
	for (key, metas) in entries {
		out.insert(
			key.to_string(),
			json!({ "metas": metas.iter().map(Meta::to_json).collect::<Vec<_>>() }),
		);
	}
	Value::Object(out)
}

#[derive(Debug, Default)]
pub struct PresenceState {
	entries: HashMap<Box<str>, Vec<Meta>>,
}

impl PresenceState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Track `sub_ref` under `key`. Re-tracking the same subscription
	/// replaces its meta: the diff then carries both the leave and the join.
	pub fn track(&mut self, key: &str, sub_ref: SubRef, payload: Value) -> PresenceDiff {
		let mut diff = self.untrack(sub_ref);
		let meta = Meta {
			phx_ref: Uuid::new_v4().to_string().into(),
			sub_ref,
			payload,
		};
		diff.joins.entry(key.into()).or_default().push(meta.clone());
		self.entries.entry(key.into()).or_default().push(meta);
		diff
	}

	/// Remove every meta contributed by `sub_ref`.
	pub fn untrack(&mut self, sub_ref: SubRef) -> PresenceDiff {
		let mut diff = PresenceDiff::default();
		self.entries.retain(|key, metas| {
			let removed: Vec<Meta> =
				metas.iter().filter(|m| m.sub_ref == sub_ref).cloned().collect();
			if !removed.is_empty() {
				metas.retain(|m| m.sub_ref != sub_ref);
				diff.leaves.insert(key.clone(), removed);
			}
			!metas.is_empty()
		});
		diff
	}

	/// Merge metas received from another node. Unknown `phx_ref`s join;
	/// already-known refs are ignored, so replayed syncs are harmless.
	pub fn merge(&mut self, key: &str, metas: Vec<Meta>) -> PresenceDiff {
		let mut diff = PresenceDiff::default();
		let entry = self.entries.entry(key.into()).or_default();
		for meta in metas {
			if entry.iter().any(|m| m.phx_ref == meta.phx_ref) {
				continue;
			}
			entry.push(meta.clone());
			diff.joins.entry(key.into()).or_default().push(meta);
		}
		if entry.is_empty() {
			self.entries.remove(key);
		}
		diff
	}

	/// Remove remote metas by `phx_ref` (cross-node leaves).
	pub fn remove_refs(&mut self, key: &str, phx_refs: &[Box<str>]) -> PresenceDiff {
		let mut diff = PresenceDiff::default();
		if let Some(metas) = self.entries.get_mut(key) {
			let removed: Vec<Meta> = metas
				.iter()
				.filter(|m| phx_refs.contains(&m.phx_ref))
				.cloned()
				.collect();
			if !removed.is_empty() {
				metas.retain(|m| !phx_refs.contains(&m.phx_ref));
				diff.leaves.insert(key.into(), removed);
			}
			if metas.is_empty() {
				self.entries.remove(key);
			}
		}
		diff
	}

	/// Full state, as sent on subscribe.
	pub fn to_json(&self) -> Value {
		entries_json(&self.entries)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Box<str>, &Vec<Meta>)> {
		self.entries.iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_track_and_untrack() {
		let mut state = PresenceState::new();
		let sub = SubRef::generate();

		let diff = state.track("alice", sub, json!({ "status": "online" }));
		assert_eq!(diff.joins.len(), 1);
		assert!(diff.leaves.is_empty());
		assert_eq!(state.len(), 1);

		let diff = state.untrack(sub);
		assert_eq!(diff.leaves.len(), 1);
		assert!(state.is_empty());
	}

	#[test]
	fn test_shared_key_survives_partial_untrack() {
		let mut state = PresenceState::new();
		let a = SubRef::generate();
		let b = SubRef::generate();

		state.track("alice", a, json!({}));
		state.track("alice", b, json!({}));
		assert_eq!(state.entries["alice"].len(), 2);

		state.untrack(a);
		// Entry remains while any meta remains
		assert_eq!(state.len(), 1);
		assert_eq!(state.entries["alice"].len(), 1);

		state.untrack(b);
		assert!(state.is_empty());
	}

	#[test]
	fn test_retrack_replaces_meta() {
		let mut state = PresenceState::new();
		let sub = SubRef::generate();

		state.track("alice", sub, json!({ "status": "online" }));
		let diff = state.track("alice", sub, json!({ "status": "away" }));

		assert_eq!(diff.leaves.len(), 1);
		assert_eq!(diff.joins.len(), 1);
		assert_eq!(state.entries["alice"].len(), 1);
		assert_eq!(state.entries["alice"][0].payload["status"], "away");
	}

	#[test]
	fn test_merge_is_idempotent() {
		let mut state = PresenceState::new();
		let remote = Meta {
			phx_ref: "remote-ref-1".into(),
			sub_ref: SubRef::generate(),
			payload: json!({}),
		};

		let diff = state.merge("bob", vec![remote.clone()]);
		assert_eq!(diff.joins["bob"].len(), 1);

		let diff = state.merge("bob", vec![remote]);
		assert!(diff.is_empty());
		assert_eq!(state.entries["bob"].len(), 1);
	}

	#[test]
	fn test_remove_refs() {
		let mut state = PresenceState::new();
		let remote = Meta {
			phx_ref: "remote-ref-1".into(),
			sub_ref: SubRef::generate(),
			payload: json!({}),
		};
		state.merge("bob", vec![remote]);

		let diff = state.remove_refs("bob", &["remote-ref-1".into()]);
		assert_eq!(diff.leaves["bob"].len(), 1);
		assert!(state.is_empty());
	}

	#[test]
	fn test_state_json_shape() {
		let mut state = PresenceState::new();
		state.track("alice", SubRef::generate(), json!({ "status": "online" }));

		let value = state.to_json();
		let metas = value["alice"]["metas"].as_array().unwrap();
		assert_eq!(metas.len(), 1);
		assert_eq!(metas[0]["status"], "online");
		assert!(metas[0]["phx_ref"].is_string());
	}
}

// vim: ts=4
