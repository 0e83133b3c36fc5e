//! Integration tests for topic fan-out
//!
//! Drives the hub with real bounded queues: fan-out completeness, presence
//! monotonicity, tenant isolation, per-topic ordering and change filtering.

mod common;

#[cfg(test)]
mod tests {
	use crate::common::fixtures;
	use relaymesh::cdc::decoder;
	use relaymesh::channel::hub::ChannelHub;
	use relaymesh::channel::message::{JoinConfig, OutboundQueue};
	use relaymesh::session::protocol::Frame;
	use relaymesh::types::{Lsn, TenantId};
	use serde_json::json;
	use std::collections::{HashMap, HashSet};
	use uuid::Uuid;

	fn tenant() -> TenantId {
		TenantId::new("acme")
	}

	fn queue() -> (OutboundQueue, flume::Receiver<Frame>) {
		OutboundQueue::with_limits(Uuid::new_v4(), 256, 256 * 1024)
	}

	fn drain(rx: &flume::Receiver<Frame>) -> Vec<Frame> {
		let mut out = Vec::new();
		while let Ok(frame) = rx.try_recv() {
			out.push(frame);
		}
		out
	}

	/// Every subscriber receives exactly one delivery per broadcast
	#[test]
	fn test_fanout_completeness() {
		let hub = ChannelHub::with_shards(8);
		let mut receivers = Vec::new();
		for _ in 0..5 {
			let (q, rx) = queue();
			hub.subscribe(&tenant(), "topic:X", q, &JoinConfig::default(), "anon");
			receivers.push(rx);
		}

		let delivered = hub.broadcast_local(&tenant(), "topic:X", "E", &json!({ "m": "v" }), None);
		assert_eq!(delivered, 5);

		for rx in &receivers {
			let frames = drain(rx);
			assert_eq!(frames.len(), 1);
			assert_eq!(frames[0].payload["payload"]["m"], "v");
		}
	}

	/// A sender with broadcast.self receives its own message (S1)
	#[test]
	fn test_self_broadcast() {
		let hub = ChannelHub::with_shards(8);
		let config = JoinConfig::parse(&fixtures::join_payload_self()).unwrap();
		let (q, rx) = queue();
		let sub = hub.subscribe(&tenant(), "topic:X", q, &config, "anon");

		hub.broadcast_local(&tenant(), "topic:X", "E", &json!({ "m": "v" }), Some(sub.sub_ref));
		let frames = drain(&rx);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].payload["event"], "E");
		assert_eq!(frames[0].payload["payload"]["m"], "v");
	}

	/// No event originating in tenant A reaches a subscriber of tenant B
	#[test]
	fn test_tenant_isolation() {
		let hub = ChannelHub::with_shards(8);
		let other = TenantId::new("intruder");
		let (qa, rxa) = queue();
		let (qb, rxb) = queue();
		hub.subscribe(&tenant(), "topic:X", qa, &JoinConfig::default(), "anon");
		hub.subscribe(&other, "topic:X", qb, &JoinConfig::default(), "anon");

		hub.broadcast_local(&tenant(), "topic:X", "E", &json!({}), None);
		assert_eq!(drain(&rxa).len(), 1);
		assert!(drain(&rxb).is_empty());
	}

	/// Delivery order equals dispatch order for one topic on one node
	#[test]
	fn test_per_topic_ordering() {
		let hub = ChannelHub::with_shards(8);
		let (q, rx) = queue();
		hub.subscribe(&tenant(), "topic:X", q, &JoinConfig::default(), "anon");

		for i in 0..20 {
			hub.broadcast_local(&tenant(), "topic:X", "E", &json!({ "i": i }), None);
		}
		let frames = drain(&rx);
		assert_eq!(frames.len(), 20);
		for (i, frame) in frames.iter().enumerate() {
			assert_eq!(frame.payload["payload"]["i"], i as i64);
		}
	}

	/// After track without untrack, every subscriber's last observed state
	/// for the key contains the meta
	#[test]
	fn test_presence_monotonicity() {
		let hub = ChannelHub::with_shards(8);
		let config = JoinConfig::parse(&fixtures::join_payload_presence("alice")).unwrap();
		let (qa, rxa) = queue();
		hub.subscribe(&tenant(), "topic:X", qa, &config, "anon");

		// A later subscriber sees alice in the full sync
		let (qb, _rxb) = queue();
		let sub_b = hub.subscribe(&tenant(), "topic:X", qb, &JoinConfig::default(), "anon");
		assert!(sub_b.presence_state["alice"]["metas"].is_array());

		// The first subscriber saw its own join diff
		let frames = drain(&rxa);
		assert!(frames
			.iter()
			.any(|f| f.event == "presence_diff" && f.payload["joins"]["alice"].is_object()));
	}

	/// Presence entries survive until the last meta is gone
	#[test]
	fn test_presence_shared_key() {
		let hub = ChannelHub::with_shards(8);
		let config = JoinConfig::parse(&fixtures::join_payload_presence("shared")).unwrap();
		let (qa, _rxa) = queue();
		let (qb, _rxb) = queue();
		let sub_a = hub.subscribe(&tenant(), "topic:X", qa, &config, "anon");
		let sub_b = hub.subscribe(&tenant(), "topic:X", qb, &config, "anon");

		hub.unsubscribe(&tenant(), "topic:X", sub_a.sub_ref);
		let (qc, _rxc) = queue();
		let sub_c = hub.subscribe(&tenant(), "topic:X", qc, &JoinConfig::default(), "anon");
		// One meta left, entry still present
		assert!(sub_c.presence_state["shared"]["metas"].is_array());

		hub.unsubscribe(&tenant(), "topic:X", sub_b.sub_ref);
		let (qd, _rxd) = queue();
		let sub_d = hub.subscribe(&tenant(), "topic:X", qd, &JoinConfig::default(), "anon");
		assert!(sub_d.presence_state.get("shared").is_none());
	}

	/// S3: subscriber with filter id=eq.42 sees exactly the row with id 42
	#[test]
	fn test_cdc_filter_delivery() {
		let hub = ChannelHub::with_shards(8);
		let config = JoinConfig::parse(&fixtures::join_payload_changes("id=eq.42")).unwrap();
		let (q, rx) = queue();
		hub.subscribe(&tenant(), "topic:X", q, &config, "authenticated");

		let mut visible = HashMap::new();
		visible.insert(
			Box::from("authenticated"),
			HashSet::from([Box::from("id"), Box::from("body")]),
		);

		let mut delivered = 0;
		for id in [41, 42, 43] {
			let raw = fixtures::wal2json_insert(id);
			let change = decoder::decode(Lsn(id as u64), &raw).unwrap().unwrap();
			delivered += hub.emit_cdc(&tenant(), &change, &visible);
		}
		assert_eq!(delivered, 1);

		let frames = drain(&rx);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].event, "postgres_changes");
		assert_eq!(frames[0].payload["data"]["record"]["id"], 42);
		assert_eq!(frames[0].payload["data"]["type"], "INSERT");
	}

	/// A subscriber that stops draining is closed and evicted, topic intact
	#[test]
	fn test_slow_consumer_eviction() {
		let hub = ChannelHub::with_shards(8);
		let (slow, _slow_rx) = OutboundQueue::with_limits(Uuid::new_v4(), 2, 256 * 1024);
		let (fast, fast_rx) = queue();
		hub.subscribe(&tenant(), "topic:X", slow.clone(), &JoinConfig::default(), "anon");
		hub.subscribe(&tenant(), "topic:X", fast, &JoinConfig::default(), "anon");

		for i in 0..5 {
			hub.broadcast_local(&tenant(), "topic:X", "E", &json!({ "i": i }), None);
		}
		// The fast consumer got everything, the slow one was closed
		assert_eq!(drain(&fast_rx).len(), 5);
		assert!(slow.kill_token().is_cancelled());
		assert!(hub.has_subscribers(&tenant(), "topic:X"));
	}
}

// vim: ts=4
