//! Cross-node message envelopes and gossip payloads.
//!
//! Forwarding is best-effort unicast over in-mesh HTTP. Envelopes are tagged
//! `(origin_node, origin_seq)`; receivers keep a short window of seen tags
//! and drop duplicates, which makes replays during rebalance harmless.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::ring::NodeId;
use crate::types::TenantId;

/// Envelope event kinds carried between nodes.
pub const FWD_BROADCAST: &str = "broadcast";
pub const FWD_PRESENCE_DIFF: &str = "presence_diff";
pub const FWD_PRESENCE_STATE: &str = "presence_state";
pub const FWD_POSTGRES_CHANGES: &str = "postgres_changes";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
	pub tenant: TenantId,
	pub topic: String,
	pub event: String,
	pub payload: Value,
	pub origin_node: NodeId,
	pub origin_seq: u64,
}

/// A presence meta on the wire. `sub_ref` stays attached so a node can
/// rebuild leave sets for sessions it never saw.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMeta {
	pub phx_ref: Box<str>,
	pub sub_ref: crate::types::SubRef,
	pub payload: Value,
}

impl From<crate::channel::presence::Meta> for WireMeta {
	fn from(meta: crate::channel::presence::Meta) -> Self {
		Self { phx_ref: meta.phx_ref, sub_ref: meta.sub_ref, payload: meta.payload }
	}
}

impl From<WireMeta> for crate::channel::presence::Meta {
	fn from(meta: WireMeta) -> Self {
		Self { phx_ref: meta.phx_ref, sub_ref: meta.sub_ref, payload: meta.payload }
	}
}

/// Presence payload inside `presence_diff` / `presence_state` envelopes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WirePresence {
	#[serde(default)]
	pub joins: Vec<(Box<str>, Vec<WireMeta>)>,
	#[serde(default)]
	pub leaves: Vec<(Box<str>, Vec<Box<str>>)>,
}

impl WirePresence {
	pub fn from_diff(diff: &crate::channel::presence::PresenceDiff) -> Self {
		Self {
			joins: diff
				.joins
				.iter()
				.map(|(key, metas)| {
					(key.clone(), metas.iter().cloned().map(WireMeta::from).collect())
				})
				.collect(),
			leaves: diff
				.leaves
				.iter()
				.map(|(key, metas)| {
					(key.clone(), metas.iter().map(|m| m.phx_ref.clone()).collect())
				})
				.collect(),
		}
	}
}

/// One (tenant, topic) a node has local subscribers for.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Interest {
	pub tenant: TenantId,
	pub topic: Box<str>,
}

/// Gossip exchanged between peers. A full `interest` set replaces whatever
/// the receiver knew; a `delta` adjusts one entry between rounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipMsg {
	pub node: NodeId,
	pub advertise: Box<str>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub interest: Option<Vec<Interest>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delta: Option<InterestDelta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterestDelta {
	pub tenant: TenantId,
	pub topic: Box<str>,
	pub active: bool,
}

/// CDC ownership handover signal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicatorReady {
	pub tenant: TenantId,
	pub node: NodeId,
}

/// Tenant cache invalidation fan-out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Invalidate {
	pub tenant: TenantId,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_envelope_roundtrip() {
		let envelope = Envelope {
			tenant: TenantId::new("acme"),
			topic: "topic:X".into(),
			event: FWD_BROADCAST.into(),
			payload: json!({ "event": "E", "payload": { "m": "v" } }),
			origin_node: NodeId::new("relaymesh@10.0.0.1:4000"),
			origin_seq: 9,
		};
		let raw = serde_json::to_string(&envelope).unwrap();
		let parsed: Envelope = serde_json::from_str(&raw).unwrap();
		assert_eq!(parsed.tenant, envelope.tenant);
		assert_eq!(parsed.origin_seq, 9);
		assert_eq!(parsed.payload["event"], "E");
	}

	#[test]
	fn test_wire_presence_from_diff() {
		use crate::channel::presence::PresenceState;
		use crate::types::SubRef;

		let mut state = PresenceState::new();
		let sub = SubRef::generate();
		let diff = state.track("alice", sub, json!({ "s": 1 }));
		let wire = WirePresence::from_diff(&diff);
		assert_eq!(wire.joins.len(), 1);
		assert_eq!(&*wire.joins[0].0, "alice");
		assert!(wire.leaves.is_empty());

		let diff = state.untrack(sub);
		let wire = WirePresence::from_diff(&diff);
		assert_eq!(wire.leaves.len(), 1);
		assert_eq!(wire.leaves[0].1.len(), 1);
	}
}

// vim: ts=4
