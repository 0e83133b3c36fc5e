//! API routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::channel;
use crate::cluster::forward::{Envelope, GossipMsg, Interest, Invalidate, ReplicatorReady};
use crate::core::extract::ApiKey;
use crate::http;
use crate::prelude::*;
use crate::session::socket;

async fn api_not_found() -> Error {
	Error::NotFound
}

// ============================================================================
// PUBLIC SURFACE - client WebSocket + HTTP fan-in + observability
// ============================================================================

async fn get_health(State(app): State<App>) -> Json<serde_json::Value> {
	Json(json!({
		"status": "ok",
		"node": app.cluster.node_id,
		"cluster_size": app.cluster.members().len(),
	}))
}

async fn get_metrics(State(app): State<App>) -> Json<serde_json::Value> {
	Json(json!(app.metrics.snapshot()))
}

/// Drop every cache the tenant is in, here and on every peer. Authenticated
/// by the tenant's own API key; the control plane calls this after writes.
async fn post_tenant_reload(
	State(app): State<App>,
	Path(tenant_id): Path<String>,
	ApiKey(apikey): ApiKey,
) -> RmResult<StatusCode> {
	let tenant_id = TenantId::new(tenant_id);
	let tenant = app.tenants.lookup(&tenant_id).await?;
	app.verifier.verify(&tenant, &apikey)?;

	invalidate_local(&app, &tenant_id);
	app.cluster.broadcast_invalidate(&tenant_id);
	Ok(StatusCode::NO_CONTENT)
}

fn invalidate_local(app: &App, tenant: &TenantId) {
	app.tenants.invalidate(tenant);
	app.verifier.invalidate(tenant);
	app.authz.invalidate(tenant);
	app.visibility.invalidate(tenant);
}

// ============================================================================
// CLUSTER SURFACE - in-mesh only; deploys keep these off the public edge
// ============================================================================

async fn post_forward(State(app): State<App>, Json(envelope): Json<Envelope>) -> StatusCode {
	channel::apply_remote(&app, envelope).await;
	StatusCode::OK
}

async fn post_gossip(State(app): State<App>, Json(msg): Json<GossipMsg>) -> Json<GossipMsg> {
	app.cluster.peer_seen(&msg.node, &msg.advertise, msg.interest, msg.delta);
	let interest: Vec<Interest> = app
		.hub
		.interest()
		.into_iter()
		.map(|(tenant, topic)| Interest { tenant, topic })
		.collect();
	Json(app.cluster.gossip_msg(interest))
}

async fn post_replicator_ready(
	State(app): State<App>,
	Json(msg): Json<ReplicatorReady>,
) -> StatusCode {
	debug!("replicator ready for {} on {}", msg.tenant, msg.node);
	app.cluster.signal_replicator_ready(&msg.tenant);
	StatusCode::OK
}

async fn post_invalidate(State(app): State<App>, Json(msg): Json<Invalidate>) -> StatusCode {
	invalidate_local(&app, &msg.tenant);
	StatusCode::OK
}

pub fn init(app: App) -> Router {
	let cors_layer = tower_http::cors::CorsLayer::very_permissive();

	Router::new()
		.route("/ws/channel", any(socket::get_ws_channel))
		.route("/api/broadcast", post(http::broadcast::post_broadcast))
		.route("/api/health", get(get_health))
		.route("/api/metrics", get(get_metrics))
		.route("/api/tenants/{tenant_id}/reload", post(post_tenant_reload))
		.route("/cluster/forward", post(post_forward))
		.route("/cluster/gossip", post(post_gossip))
		.route("/cluster/replicator-ready", post(post_replicator_ready))
		.route("/cluster/invalidate", post(post_invalidate))
		.fallback(api_not_found)
		.layer(cors_layer)
		.layer(TraceLayer::new_for_http())
		.with_state(app)
}

// vim: ts=4
