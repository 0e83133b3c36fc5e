//! Topic registry and fan-out engine.
//!
//! Topic state lives in shards keyed by (tenant, topic) hash; a shard mutex
//! is only ever held for in-memory work. Authorization and any database I/O
//! happen before the caller enters the hub. Dispatch is a non-blocking
//! `try_send` into each subscriber's bounded queue; a full queue marks that
//! subscriber for a `SLOW_CONSUMER` close and drops it from the topic on the
//! spot.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::cdc::decoder::Change;
use crate::channel::filter::ChangeSelector;
use crate::channel::message::{JoinConfig, OutboundQueue, PushError};
use crate::channel::presence::{Meta, PresenceDiff, PresenceState};
use crate::prelude::*;
use crate::session::protocol::{
	Frame, EVT_BROADCAST, EVT_POSTGRES_CHANGES, EVT_PRESENCE_DIFF,
};

type TopicKey = (TenantId, Box<str>);

struct Subscriber {
	sub_ref: SubRef,
	queue: OutboundQueue,
	broadcast_self: bool,
	presence_key: Box<str>,
}

struct TopicState {
	private: bool,
	last_seq: u64,
	subs: Vec<Subscriber>,
	presence: PresenceState,
}

impl TopicState {
	fn new(private: bool) -> Self {
		Self { private, last_seq: 0, subs: Vec::new(), presence: PresenceState::new() }
	}

	fn is_empty(&self) -> bool {
		self.subs.is_empty() && self.presence.is_empty()
	}
}

#[derive(Default)]
struct Shard {
	topics: HashMap<TopicKey, TopicState>,
}

/// A change-dispatch route, resolved under the index lock and pushed to
/// outside it.
#[derive(Clone)]
pub struct CdcRoute {
	pub sub_ref: SubRef,
	pub topic: Box<str>,
	pub queue: OutboundQueue,
	pub selector: ChangeSelector,
	pub role: Box<str>,
}

type CdcIndexKey = (Box<str>, Box<str>); // (schema, table or "*")

pub struct ChannelHub {
	shards: Box<[parking_lot::Mutex<Shard>]>,
	cdc_index: parking_lot::RwLock<HashMap<TenantId, HashMap<CdcIndexKey, Vec<CdcRoute>>>>,
}

/// What `subscribe` hands back to the session.
pub struct Subscribed {
	pub sub_ref: SubRef,
	pub seq: u64,
	/// Full presence snapshot for the `presence_state` frame
	pub presence_state: Value,
	/// Diff to forward to peers when the join began tracking presence
	pub presence_diff: Option<PresenceDiff>,
	/// True when this join created the topic on this node
	pub created: bool,
}

pub struct Unsubscribed {
	pub presence_diff: Option<PresenceDiff>,
	/// True when the topic is now gone from this node
	pub deleted: bool,
}

impl ChannelHub {
	pub fn new() -> Self {
		let parallelism =
			std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
		Self::with_shards(parallelism * 2)
	}

	pub fn with_shards(count: usize) -> Self {
		let shards = (0..count.max(1)).map(|_| parking_lot::Mutex::new(Shard::default())).collect();
		Self { shards, cdc_index: parking_lot::RwLock::new(HashMap::new()) }
	}

	fn shard(&self, tenant: &TenantId, topic: &str) -> &parking_lot::Mutex<Shard> {
		let mut hasher = Sha256::new();
		hasher.update(tenant.as_str().as_bytes());
		hasher.update(b"\0");
		hasher.update(topic.as_bytes());
		let digest = hasher.finalize();
		let n = u64::from_be_bytes([
			digest[0], digest[1], digest[2], digest[3],
			digest[4], digest[5], digest[6], digest[7],
		]);
		&self.shards[(n % self.shards.len() as u64) as usize]
	}

	// Subscriptions //
	//***************//

	/// Register a subscription. Access must already be authorized; `role` is
	/// the JWT role at join time, kept for change column visibility.
	pub fn subscribe(
		&self,
		tenant: &TenantId,
		topic: &str,
		queue: OutboundQueue,
		config: &JoinConfig,
		role: &str,
	) -> Subscribed {
		let sub_ref = SubRef::generate();
		let presence_key: Box<str> = config
			.presence_key
			.clone()
			.unwrap_or_else(|| Uuid::new_v4().to_string().into());

		let mut shard = self.shard(tenant, topic).lock();
		let created = !shard.topics.contains_key(&(tenant.clone(), topic.into()));
		let state = shard
			.topics
			.entry((tenant.clone(), topic.into()))
			.or_insert_with(|| TopicState::new(config.private));

		// The first private join pins the topic private for its lifetime
		state.private = state.private || config.private;

		let tracked = config.presence_key.is_some();
		state.subs.push(Subscriber {
			sub_ref,
			queue: queue.clone(),
			broadcast_self: config.broadcast_self,
			presence_key: presence_key.clone(),
		});

		let presence_diff = if tracked {
			let diff = state.presence.track(&presence_key, sub_ref, json!({}));
			Self::fanout_presence_diff(topic, state, &diff);
			Some(diff)
		} else {
			None
		};

		let subscribed = Subscribed {
			sub_ref,
			seq: state.last_seq,
			presence_state: state.presence.to_json(),
			presence_diff,
			created,
		};
		drop(shard);

		if !config.postgres_changes.is_empty() {
			self.index_routes(tenant, topic, sub_ref, &queue, config, role);
		}

		subscribed
	}

	fn index_routes(
		&self,
		tenant: &TenantId,
		topic: &str,
		sub_ref: SubRef,
		queue: &OutboundQueue,
		config: &JoinConfig,
		role: &str,
	) {
		let mut index = self.cdc_index.write();
		let tenant_index = index.entry(tenant.clone()).or_default();
		for selector in &config.postgres_changes {
			let table: Box<str> = selector.table.clone().unwrap_or_else(|| "*".into());
			tenant_index
				.entry((selector.schema.clone(), table))
				.or_default()
				.push(CdcRoute {
					sub_ref,
					topic: topic.into(),
					queue: queue.clone(),
					selector: selector.clone(),
					role: role.into(),
				});
		}
	}

	/// Remove one subscription; emits presence leaves and deletes the topic
	/// when nothing is left.
	pub fn unsubscribe(&self, tenant: &TenantId, topic: &str, sub_ref: SubRef) -> Unsubscribed {
		let mut shard = self.shard(tenant, topic).lock();
		let key = (tenant.clone(), Box::from(topic));
		let Some(state) = shard.topics.get_mut(&key) else {
			return Unsubscribed { presence_diff: None, deleted: false };
		};

		state.subs.retain(|s| s.sub_ref != sub_ref);
		let diff = state.presence.untrack(sub_ref);
		let presence_diff = if diff.is_empty() {
			None
		} else {
			Self::fanout_presence_diff(topic, state, &diff);
			Some(diff)
		};

		let deleted = state.is_empty();
		if deleted {
			shard.topics.remove(&key);
		}
		drop(shard);

		self.unindex_routes(tenant, sub_ref);
		Unsubscribed { presence_diff, deleted }
	}

	fn unindex_routes(&self, tenant: &TenantId, sub_ref: SubRef) {
		let mut index = self.cdc_index.write();
		if let Some(tenant_index) = index.get_mut(tenant) {
			for routes in tenant_index.values_mut() {
				routes.retain(|r| r.sub_ref != sub_ref);
			}
			tenant_index.retain(|_, routes| !routes.is_empty());
			if tenant_index.is_empty() {
				index.remove(tenant);
			}
		}
	}

	// Broadcast //
	//***********//

	/// Dispatch a broadcast to local subscribers. Returns the number of
	/// deliveries. A topic nobody subscribed to is a silent no-op.
	pub fn broadcast_local(
		&self,
		tenant: &TenantId,
		topic: &str,
		event: &str,
		payload: &Value,
		sender: Option<SubRef>,
	) -> usize {
		let frame = Frame::new(topic, EVT_BROADCAST, json!({
			"event": event,
			"payload": payload,
			"type": "broadcast",
		}));

		let mut shard = self.shard(tenant, topic).lock();
		let key = (tenant.clone(), Box::from(topic));
		let Some(state) = shard.topics.get_mut(&key) else {
			return 0;
		};
		state.last_seq += 1;

		let mut delivered = 0;
		let mut dead: Vec<SubRef> = Vec::new();
		for sub in &state.subs {
			if Some(sub.sub_ref) == sender && !sub.broadcast_self {
				continue;
			}
			match sub.queue.push(frame.clone()) {
				Ok(()) => delivered += 1,
				Err(PushError::Overflow) | Err(PushError::Closed) => dead.push(sub.sub_ref),
			}
		}
		Self::drop_dead(topic, state, &dead);
		let deleted = state.is_empty();
		if deleted {
			shard.topics.remove(&key);
		}
		drop(shard);

		for sub_ref in dead {
			self.unindex_routes(tenant, sub_ref);
		}
		delivered
	}

	// Presence //
	//**********//

	/// Track (or re-track) a subscription's presence meta.
	pub fn track(
		&self,
		tenant: &TenantId,
		topic: &str,
		sub_ref: SubRef,
		payload: Value,
	) -> Option<PresenceDiff> {
		let mut shard = self.shard(tenant, topic).lock();
		let state = shard.topics.get_mut(&(tenant.clone(), Box::from(topic)))?;
		let key =
			state.subs.iter().find(|s| s.sub_ref == sub_ref).map(|s| s.presence_key.clone())?;
		let diff = state.presence.track(&key, sub_ref, payload);
		Self::fanout_presence_diff(topic, state, &diff);
		Some(diff)
	}

	/// Remove a subscription's presence meta without unsubscribing.
	pub fn untrack(&self, tenant: &TenantId, topic: &str, sub_ref: SubRef) -> Option<PresenceDiff> {
		let mut shard = self.shard(tenant, topic).lock();
		let state = shard.topics.get_mut(&(tenant.clone(), Box::from(topic)))?;
		let diff = state.presence.untrack(sub_ref);
		if diff.is_empty() {
			return None;
		}
		Self::fanout_presence_diff(topic, state, &diff);
		Some(diff)
	}

	/// Merge presence metas received from a peer and fan the diff out.
	pub fn merge_remote_presence(
		&self,
		tenant: &TenantId,
		topic: &str,
		key: &str,
		metas: Vec<Meta>,
	) -> Option<PresenceDiff> {
		let mut shard = self.shard(tenant, topic).lock();
		let state = shard.topics.get_mut(&(tenant.clone(), Box::from(topic)))?;
		let diff = state.presence.merge(key, metas);
		if diff.is_empty() {
			return None;
		}
		Self::fanout_presence_diff(topic, state, &diff);
		Some(diff)
	}

	/// Apply remote presence leaves by phx_ref and fan the diff out.
	pub fn remove_remote_presence(
		&self,
		tenant: &TenantId,
		topic: &str,
		key: &str,
		phx_refs: &[Box<str>],
	) -> Option<PresenceDiff> {
		let mut shard = self.shard(tenant, topic).lock();
		let key_owned = (tenant.clone(), Box::from(topic));
		let state = shard.topics.get_mut(&key_owned)?;
		let diff = state.presence.remove_refs(key, phx_refs);
		if diff.is_empty() {
			return None;
		}
		Self::fanout_presence_diff(topic, state, &diff);
		if state.is_empty() {
			shard.topics.remove(&key_owned);
		}
		Some(diff)
	}

	/// Locally tracked presence of a topic, for syncing a joining peer.
	pub fn local_presence(&self, tenant: &TenantId, topic: &str) -> Vec<(Box<str>, Vec<Meta>)> {
		let shard = self.shard(tenant, topic).lock();
		let Some(state) = shard.topics.get(&(tenant.clone(), Box::from(topic))) else {
			return Vec::new();
		};
		state
			.presence
			.iter()
			.map(|(key, metas)| (key.clone(), metas.clone()))
			.collect()
	}

	fn fanout_presence_diff(topic: &str, state: &TopicState, diff: &PresenceDiff) {
		let frame = Frame::new(topic, EVT_PRESENCE_DIFF, diff.to_json());
		for sub in &state.subs {
			// Dead queues are collected by the next broadcast touching them
			let _ = sub.queue.push(frame.clone());
		}
	}

	fn drop_dead(topic: &str, state: &mut TopicState, dead: &[SubRef]) {
		if dead.is_empty() {
			return;
		}
		state.subs.retain(|s| !dead.contains(&s.sub_ref));
		for &sub_ref in dead {
			let diff = state.presence.untrack(sub_ref);
			if !diff.is_empty() {
				Self::fanout_presence_diff(topic, state, &diff);
			}
		}
	}

	// CDC //
	//*****//

	/// Roles with change subscriptions matching (schema, table), so the
	/// caller can resolve column visibility before dispatch.
	pub fn cdc_roles(&self, tenant: &TenantId, schema: &str, table: &str) -> HashSet<Box<str>> {
		let index = self.cdc_index.read();
		let mut roles = HashSet::new();
		if let Some(tenant_index) = index.get(tenant) {
			for key in [(Box::from(schema), Box::from(table)), (Box::from(schema), Box::from("*"))]
			{
				if let Some(routes) = tenant_index.get(&key) {
					roles.extend(routes.iter().map(|r| r.role.clone()));
				}
			}
		}
		roles
	}

	/// Deliver a decoded change to every matching subscriber. `visible`
	/// gives the per-role column allow-list; roles missing from it see
	/// nothing. Returns the number of deliveries.
	pub fn emit_cdc(
		&self,
		tenant: &TenantId,
		change: &Change,
		visible: &HashMap<Box<str>, HashSet<Box<str>>>,
	) -> usize {
		let routes: Vec<CdcRoute> = {
			let index = self.cdc_index.read();
			let Some(tenant_index) = index.get(tenant) else {
				return 0;
			};
			let mut routes = Vec::new();
			for key in [
				(change.schema.clone(), change.table.clone()),
				(change.schema.clone(), Box::from("*")),
			] {
				if let Some(found) = tenant_index.get(&key) {
					routes.extend(found.iter().cloned());
				}
			}
			routes
		};

		let mut delivered = 0;
		for route in routes {
			if !route.selector.matches(change) {
				continue;
			}
			let Some(columns) = visible.get(&route.role) else {
				// Role cannot see the table at all; silently drop
				continue;
			};
			let payload = cdc_payload(change, &route, columns);
			let frame = Frame::new(&*route.topic, EVT_POSTGRES_CHANGES, payload);
			if route.queue.push(frame).is_ok() {
				delivered += 1;
			}
		}
		delivered
	}

	// Introspection //
	//***************//

	/// Whether the live topic was pinned private by any join. Publishers
	/// must not be able to skip the write check by claiming public.
	pub fn is_private(&self, tenant: &TenantId, topic: &str) -> bool {
		let shard = self.shard(tenant, topic).lock();
		shard
			.topics
			.get(&(tenant.clone(), Box::from(topic)))
			.is_some_and(|s| s.private)
	}

	pub fn has_subscribers(&self, tenant: &TenantId, topic: &str) -> bool {
		let shard = self.shard(tenant, topic).lock();
		shard
			.topics
			.get(&(tenant.clone(), Box::from(topic)))
			.is_some_and(|s| !s.subs.is_empty())
	}

	/// Every (tenant, topic) with local subscribers, for gossip.
	pub fn interest(&self) -> Vec<(TenantId, Box<str>)> {
		let mut out = Vec::new();
		for shard in &self.shards {
			let shard = shard.lock();
			for (key, state) in shard.topics.iter() {
				if !state.subs.is_empty() {
					out.push((key.0.clone(), key.1.clone()));
				}
			}
		}
		out
	}

	/// Every topic of a tenant live on this node.
	pub fn tenant_topics(&self, tenant: &TenantId) -> Vec<Box<str>> {
		let mut topics = Vec::new();
		for shard in &self.shards {
			let shard = shard.lock();
			for (key, _) in shard.topics.iter() {
				if &key.0 == tenant {
					topics.push(key.1.clone());
				}
			}
		}
		topics
	}

	/// Drop all in-memory state of a tenant (drain path).
	pub fn drop_tenant(&self, tenant: &TenantId) {
		for shard in &self.shards {
			shard.lock().topics.retain(|key, _| &key.0 != tenant);
		}
		self.cdc_index.write().remove(tenant);
	}
}

impl Default for ChannelHub {
	fn default() -> Self {
		Self::new()
	}
}

fn strip_record(record: &Value, columns: &HashSet<Box<str>>) -> Value {
	match record {
		Value::Object(map) => {
			let mut out = serde_json::Map::new();
			for (name, value) in map {
				if columns.contains(name.as_str()) {
					out.insert(name.clone(), value.clone());
				}
			}
			Value::Object(out)
		}
		other => other.clone(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cdc::decoder::{ChangeOp, Column};
	use crate::types::Lsn;
	use uuid::Uuid;

	fn tenant() -> TenantId {
		TenantId::new("acme")
	}

	fn queue() -> (OutboundQueue, flume::Receiver<Frame>) {
		OutboundQueue::with_limits(Uuid::new_v4(), 64, 64 * 1024)
	}

	fn join_config() -> JoinConfig {
		JoinConfig::default()
	}

	#[test]
	fn test_broadcast_reaches_all_subscribers() {
		let hub = ChannelHub::with_shards(4);
		let (qa, rxa) = queue();
		let (qb, rxb) = queue();
		hub.subscribe(&tenant(), "topic:X", qa, &join_config(), "anon");
		hub.subscribe(&tenant(), "topic:X", qb, &join_config(), "anon");

		let n = hub.broadcast_local(&tenant(), "topic:X", "E", &json!({ "m": "v" }), None);
		assert_eq!(n, 2);

		for rx in [rxa, rxb] {
			let frame = rx.try_recv().unwrap();
			assert_eq!(frame.event, EVT_BROADCAST);
			assert_eq!(frame.payload["event"], "E");
			assert_eq!(frame.payload["payload"]["m"], "v");
		}
	}

	#[test]
	fn test_sender_excluded_without_self() {
		let hub = ChannelHub::with_shards(4);
		let (q, rx) = queue();
		let sub = hub.subscribe(&tenant(), "topic:X", q, &join_config(), "anon");

		let n =
			hub.broadcast_local(&tenant(), "topic:X", "E", &json!({}), Some(sub.sub_ref));
		assert_eq!(n, 0);
		assert!(rx.try_recv().is_err());

		let mut config = join_config();
		config.broadcast_self = true;
		let (q2, rx2) = queue();
		let sub2 = hub.subscribe(&tenant(), "topic:Y", q2, &config, "anon");
		let n =
			hub.broadcast_local(&tenant(), "topic:Y", "E", &json!({}), Some(sub2.sub_ref));
		assert_eq!(n, 1);
		assert!(rx2.try_recv().is_ok());
	}

	#[test]
	fn test_broadcast_to_empty_topic_is_noop() {
		let hub = ChannelHub::with_shards(4);
		assert_eq!(hub.broadcast_local(&tenant(), "nobody", "E", &json!({}), None), 0);
	}

	#[test]
	fn test_tenant_isolation() {
		let hub = ChannelHub::with_shards(4);
		let other = TenantId::new("other");
		let (q, rx) = queue();
		hub.subscribe(&other, "topic:X", q, &join_config(), "anon");

		hub.broadcast_local(&tenant(), "topic:X", "E", &json!({}), None);
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn test_topic_deleted_when_last_subscriber_leaves() {
		let hub = ChannelHub::with_shards(4);
		let (q, _rx) = queue();
		let sub = hub.subscribe(&tenant(), "topic:X", q, &join_config(), "anon");
		assert!(hub.has_subscribers(&tenant(), "topic:X"));

		let out = hub.unsubscribe(&tenant(), "topic:X", sub.sub_ref);
		assert!(out.deleted);
		assert!(!hub.has_subscribers(&tenant(), "topic:X"));
	}

	#[test]
	fn test_presence_tracked_on_join_with_key() {
		let hub = ChannelHub::with_shards(4);
		let mut config = join_config();
		config.presence_key = Some("alice".into());
		let (q, rx) = queue();
		let sub = hub.subscribe(&tenant(), "topic:X", q, &config, "anon");

		assert!(sub.presence_diff.is_some());
		// The tracking join produced a presence_diff frame for subscribers
		let frame = rx.try_recv().unwrap();
		assert_eq!(frame.event, EVT_PRESENCE_DIFF);
		assert!(frame.payload["joins"]["alice"].is_object());

		// Leaving emits the leave diff and deletes the topic
		let out = hub.unsubscribe(&tenant(), "topic:X", sub.sub_ref);
		assert!(out.presence_diff.is_some());
		assert!(out.deleted);
	}

	#[test]
	fn test_track_untrack_cycle() {
		let hub = ChannelHub::with_shards(4);
		let (q, rx) = queue();
		let sub = hub.subscribe(&tenant(), "topic:X", q, &join_config(), "anon");

		let diff = hub.track(&tenant(), "topic:X", sub.sub_ref, json!({ "s": 1 })).unwrap();
		assert_eq!(diff.joins.len(), 1);
		let frame = rx.try_recv().unwrap();
		assert_eq!(frame.event, EVT_PRESENCE_DIFF);

		let diff = hub.untrack(&tenant(), "topic:X", sub.sub_ref).unwrap();
		assert_eq!(diff.leaves.len(), 1);
	}

	#[test]
	fn test_slow_consumer_dropped_from_topic() {
		let hub = ChannelHub::with_shards(4);
		let (q, _rx) = OutboundQueue::with_limits(Uuid::new_v4(), 1, 64 * 1024);
		hub.subscribe(&tenant(), "topic:X", q.clone(), &join_config(), "anon");

		assert_eq!(hub.broadcast_local(&tenant(), "topic:X", "E", &json!({}), None), 1);
		// Queue full now; the next dispatch overflows and evicts the subscriber
		assert_eq!(hub.broadcast_local(&tenant(), "topic:X", "E", &json!({}), None), 0);
		assert_eq!(q.close_code(), Some(crate::session::protocol::CloseCode::SlowConsumer));
		assert!(!hub.has_subscribers(&tenant(), "topic:X"));
	}

	fn change(record: Value) -> Change {
		Change {
			schema: "public".into(),
			table: "pg_changes".into(),
			operation: ChangeOp::Insert,
			columns: vec![Column { name: "id".into(), typ: "integer".into() }],
			record,
			old_record: json!({}),
			commit_timestamp: None,
			lsn: Lsn(7),
		}
	}

	#[test]
	fn test_emit_cdc_respects_filter_and_visibility() {
		let hub = ChannelHub::with_shards(4);
		let mut config = join_config();
		config.postgres_changes = vec![ChangeSelector::from_config(
			"INSERT",
			"public",
			Some("pg_changes"),
			Some("id=eq.42"),
		)
		.unwrap()];
		let (q, rx) = queue();
		hub.subscribe(&tenant(), "topic:X", q, &config, "authenticated");

		let mut visible = HashMap::new();
		visible.insert(
			Box::from("authenticated"),
			HashSet::from([Box::from("id")]),
		);

		assert_eq!(hub.emit_cdc(&tenant(), &change(json!({ "id": 41 })), &visible), 0);
		assert_eq!(hub.emit_cdc(&tenant(), &change(json!({ "id": 42, "hidden": "x" })), &visible), 1);

		let frame = rx.try_recv().unwrap();
		assert_eq!(frame.event, EVT_POSTGRES_CHANGES);
		assert_eq!(frame.payload["data"]["record"]["id"], 42);
		// Column the role cannot see is stripped
		assert!(frame.payload["data"]["record"].get("hidden").is_none());

		// A role with no visibility entry receives nothing
		assert_eq!(hub.emit_cdc(&tenant(), &change(json!({ "id": 42 })), &HashMap::new()), 0);
	}

	#[test]
	fn test_cdc_roles_collects_interested_roles() {
		let hub = ChannelHub::with_shards(4);
		let mut config = join_config();
		config.postgres_changes =
			vec![ChangeSelector::from_config("*", "public", None, None).unwrap()];
		let (q, _rx) = queue();
		let sub = hub.subscribe(&tenant(), "topic:X", q, &config, "service_role");

		let roles = hub.cdc_roles(&tenant(), "public", "anything");
		assert!(roles.contains("service_role"));

		hub.unsubscribe(&tenant(), "topic:X", sub.sub_ref);
		assert!(hub.cdc_roles(&tenant(), "public", "anything").is_empty());
	}
}

fn cdc_payload(change: &Change, route: &CdcRoute, columns: &HashSet<Box<str>>) -> Value {
	json!({
		"ids": [route.sub_ref],
		"data": {
			"schema": change.schema,
			"table": change.table,
			"type": change.operation.as_str(),
			"commit_timestamp": change.commit_timestamp,
			"columns": change.columns.iter()
				.filter(|c| columns.contains(&c.name))
				.collect::<Vec<_>>(),
			"record": strip_record(&change.record, columns),
			"old_record": strip_record(&change.old_record, columns),
		},
	})
}

// vim: ts=4
