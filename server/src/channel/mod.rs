//! Channel subsystem: topics, presence, filters and fan-out.

pub mod filter;
pub mod hub;
pub mod message;
pub mod presence;

pub use hub::ChannelHub;

use serde_json::json;

use crate::cdc::decoder::Change;
use crate::cluster::forward::{
	Envelope, WirePresence, FWD_BROADCAST, FWD_POSTGRES_CHANGES, FWD_PRESENCE_DIFF,
	FWD_PRESENCE_STATE,
};
use crate::core::metrics;
use crate::prelude::*;
use crate::tenant::model::TenantRef;
use message::BroadcastMessage;

/// Dispatch a locally originated broadcast: local subscribers, interested
/// peers, and the optional audit insert. Write authorization is the
/// caller's responsibility.
pub fn publish(
	app: &App,
	tenant: &TenantRef,
	msg: &BroadcastMessage,
	sender: Option<SubRef>,
) -> usize {
	let delivered =
		app.hub.broadcast_local(&tenant.external_id, &msg.topic, &msg.event, &msg.payload, sender);

	let envelope = app.cluster.envelope(
		&tenant.external_id,
		&msg.topic,
		FWD_BROADCAST,
		json!({ "event": msg.event, "payload": msg.payload }),
	);
	let forwarded = app.cluster.forward(envelope);
	metrics::add(&app.metrics.forwarded, forwarded as u64);

	if tenant.persist_broadcasts {
		persist(app, tenant, msg);
	}

	delivered
}

/// Forward a presence diff produced locally to interested peers.
pub fn forward_presence(app: &App, tenant: &TenantId, topic: &str, diff: &presence::PresenceDiff) {
	let payload = WirePresence::from_diff(diff);
	let envelope = app.cluster.envelope(
		tenant,
		topic,
		FWD_PRESENCE_DIFF,
		serde_json::to_value(&payload).unwrap_or_default(),
	);
	let forwarded = app.cluster.forward(envelope);
	metrics::add(&app.metrics.forwarded, forwarded as u64);
}

/// Apply an envelope received from a peer.
pub async fn apply_remote(app: &App, envelope: Envelope) {
	if !app.cluster.accept(&envelope) {
		metrics::inc(&app.metrics.forward_deduped);
		return;
	}
	metrics::inc(&app.metrics.forward_received);

	match envelope.event.as_str() {
		FWD_BROADCAST => {
			let event = envelope.payload["event"].as_str().unwrap_or("broadcast").to_string();
			let payload = envelope.payload.get("payload").cloned().unwrap_or_default();
			app.hub.broadcast_local(&envelope.tenant, &envelope.topic, &event, &payload, None);
		}
		FWD_PRESENCE_DIFF | FWD_PRESENCE_STATE => {
			let Ok(wire) = serde_json::from_value::<WirePresence>(envelope.payload) else {
				warn!("undecodable presence payload from {}", envelope.origin_node);
				return;
			};
			for (key, metas) in wire.joins {
				app.hub.merge_remote_presence(
					&envelope.tenant,
					&envelope.topic,
					&key,
					metas.into_iter().map(Into::into).collect(),
				);
			}
			for (key, refs) in wire.leaves {
				app.hub.remove_remote_presence(&envelope.tenant, &envelope.topic, &key, &refs);
			}
			metrics::inc(&app.metrics.presence_events);
		}
		FWD_POSTGRES_CHANGES => {
			let Ok(change) = serde_json::from_value::<Change>(envelope.payload) else {
				warn!("undecodable change payload from {}", envelope.origin_node);
				return;
			};
			apply_remote_change(app, &envelope.tenant, &change).await;
		}
		other => {
			debug!("unknown envelope event from {}: {}", envelope.origin_node, other);
		}
	}
}

async fn apply_remote_change(app: &App, tenant: &TenantId, change: &Change) {
	let roles = app.hub.cdc_roles(tenant, &change.schema, &change.table);
	if roles.is_empty() {
		return;
	}
	let Some(pool) = (match app.supervisors.get(tenant).await {
		Some(supervisor) => supervisor.pool(),
		None => None,
	}) else {
		debug!("change for {} without a local tenant pool", tenant);
		return;
	};
	let visible =
		app.visibility.for_roles(&pool, tenant, &roles, &change.schema, &change.table).await;
	let delivered = app.hub.emit_cdc(tenant, change, &visible);
	metrics::add(&app.metrics.cdc_dispatched, delivered as u64);
}

/// Best-effort audit insert, off the dispatch path.
fn persist(app: &App, tenant: &TenantRef, msg: &BroadcastMessage) {
	let app = app.clone();
	let tenant_id = tenant.external_id.clone();
	let msg = msg.clone();
	tokio::spawn(async move {
		let Some(pool) = (match app.supervisors.get(&tenant_id).await {
			Some(supervisor) => supervisor.pool(),
			None => None,
		}) else {
			return;
		};
		let res = sqlx::query(
			"INSERT INTO realtime.messages (topic, extension, event, payload, private) \
			 VALUES ($1, 'broadcast', $2, $3, $4)",
		)
		.bind(&msg.topic)
		.bind(&msg.event)
		.bind(&msg.payload)
		.bind(msg.private)
		.execute(&pool)
		.await;
		if let Err(err) = res {
			warn!("broadcast persistence for {} failed: {}", tenant_id, err);
		}
	});
}

// vim: ts=4
