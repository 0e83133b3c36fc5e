//! Client WebSocket sessions.
//!
//! One task reads inbound frames and handles them serially in arrival
//! order; a writer task drains the session's bounded outbound queue.
//! Everything else (heartbeat watchdog, force closes from the hub or the
//! supervisor) funnels through the queue's cancellation token, so there is
//! exactly one teardown path.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::auth::jwt::ClaimsRef;
use crate::channel::message::{BroadcastMessage, JoinConfig, OutboundQueue};
use crate::channel::{self, forward_presence};
use crate::core::extract::TenantSelector;
use crate::core::metrics;
use crate::core::settings::HEARTBEAT_INTERVAL;
use crate::prelude::*;
use crate::rate_limit::Resource;
use crate::session::protocol::{self, error_reason, CloseCode, Frame};
use crate::tenant::model::TenantRef;
use crate::tenant::supervisor::TenantSupervisor;

#[derive(Debug, Deserialize, Default)]
pub struct ConnectQuery {
	/// JWT; `apikey` is accepted as an alias
	pub token: Option<String>,
	pub apikey: Option<String>,
}

/// Close an upgraded socket with a code, shared by all reject paths.
async fn close_with_error(mut socket: WebSocket, code: u16, reason: &'static str) {
	let _ = socket
		.send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
		.await;
	let _ = socket.close().await;
}

fn ws_reject(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
	ws.on_upgrade(move |socket| close_with_error(socket, code, reason))
}

/// WebSocket upgrade handler for the channel protocol.
pub async fn get_ws_channel(
	ws: WebSocketUpgrade,
	State(app): State<App>,
	TenantSelector(tenant_id): TenantSelector,
	Query(query): Query<ConnectQuery>,
) -> Response {
	let Some(tenant_id) = tenant_id else {
		return ws_reject(ws, 4404, "Tenant not found");
	};
	let tenant = match app.tenants.lookup(&tenant_id).await {
		Ok(tenant) => tenant,
		Err(Error::TenantNotFound(_)) => return ws_reject(ws, 4404, "Tenant not found"),
		Err(Error::TenantSuspended(_)) => {
			return ws_reject(ws, CloseCode::TenantSuspended.code(), "Tenant suspended")
		}
		Err(_) => return ws_reject(ws, 4503, "Service unavailable"),
	};

	let Some(token) = query.token.or(query.apikey) else {
		return ws_reject(ws, 4401, "Authentication required");
	};
	let claims = match app.verifier.verify(&tenant, &token) {
		Ok(claims) => claims,
		Err(err) => {
			metrics::inc(&app.metrics.auth_failures);
			debug!("connect rejected for {}: {}", tenant_id, err);
			return ws_reject(ws, 4401, "Invalid token");
		}
	};

	let supervisor = match app.supervisors.start_if_needed(&app, &tenant).await {
		Ok(supervisor) => supervisor,
		Err(err) => {
			warn!("tenant {} unavailable: {}", tenant_id, err);
			return ws_reject(ws, 4503, "Tenant unavailable");
		}
	};

	ws.on_upgrade(move |socket| handle_session(socket, app, tenant, supervisor, claims, token))
}

struct JoinState {
	sub_ref: SubRef,
	config: JoinConfig,
}

struct Session {
	id: Uuid,
	tenant: TenantRef,
	claims: ClaimsRef,
	queue: OutboundQueue,
	joins: HashMap<String, JoinState>,
	/// Start of the current run of rate-limited operations
	limited_since: Option<Instant>,
}

async fn handle_session(
	ws: WebSocket,
	app: App,
	tenant: TenantRef,
	supervisor: Arc<TenantSupervisor>,
	claims: ClaimsRef,
	_token: String,
) {
	let session_id = Uuid::new_v4();
	let (queue, outbound_rx) = OutboundQueue::bounded(session_id);

	if let Err(err) = supervisor.register_session(&tenant, session_id, queue.clone()) {
		debug!("session rejected for {}: {}", tenant.external_id, err);
		close_with_error(ws, 4429, "Too many connections").await;
		return;
	}
	metrics::inc(&app.metrics.connections_opened);
	info!("session {} connected (tenant {})", session_id, tenant.external_id);

	let (mut ws_tx, mut ws_rx) = ws.split();
	let kill = queue.kill_token();

	// Writer: drain the bounded queue onto the socket. Outbound volume is
	// charged against the tenant's bytes_out bucket; an exhausted bucket
	// stalls the drain, the bounded queue fills, and sustained overage ends
	// in the usual slow-consumer close.
	let writer_queue = queue.clone();
	let writer_kill = kill.clone();
	let writer_app = app.clone();
	let writer_tenant = tenant.clone();
	let writer = tokio::spawn(async move {
		loop {
			tokio::select! {
				frame = outbound_rx.recv_async() => {
					let Ok(frame) = frame else { return };
					let len = frame.encoded_len();
					while writer_app
						.limiter
						.check(&writer_tenant, Resource::BytesOut, len as u32)
						.is_err()
					{
						metrics::inc(&writer_app.metrics.rate_limited);
						if writer_kill.is_cancelled() {
							break;
						}
						tokio::time::sleep(std::time::Duration::from_millis(100)).await;
					}
					let Ok(msg) = frame.to_ws_message() else { continue };
					if ws_tx.send(msg).await.is_err() {
						return;
					}
					writer_queue.debit(len);
					metrics::inc(&writer_app.metrics.messages_out);
					metrics::add(&writer_app.metrics.bytes_out, len as u64);
				}
				_ = writer_kill.cancelled() => {
					let code = writer_queue.close_code().unwrap_or(CloseCode::GoingAway);
					let _ = ws_tx
						.send(Message::Close(Some(CloseFrame {
							code: code.code(),
							reason: code.reason().into(),
						})))
						.await;
					let _ = ws_tx.close().await;
					return;
				}
			}
		}
	});

	// Heartbeat watchdog: no heartbeat for two intervals closes the session
	let last_heartbeat = Arc::new(parking_lot::Mutex::new(Instant::now()));
	let watchdog_queue = queue.clone();
	let watchdog_beat = last_heartbeat.clone();
	let watchdog = tokio::spawn(async move {
		let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			interval.tick().await;
			if watchdog_beat.lock().elapsed() > HEARTBEAT_INTERVAL * 2 {
				watchdog_queue.force_close(CloseCode::HeartbeatTimeout);
				return;
			}
		}
	});

	let mut session = Session {
		id: session_id,
		tenant,
		claims,
		queue: queue.clone(),
		joins: HashMap::new(),
		limited_since: None,
	};

	// Reader: frames are handled serially, in arrival order
	loop {
		let msg = tokio::select! {
			msg = ws_rx.next() => msg,
			_ = kill.cancelled() => break,
		};
		let Some(Ok(msg)) = msg else { break };
		if matches!(msg, Message::Close(_)) {
			break;
		}
		let frame = match Frame::from_ws_message(&msg) {
			Ok(Some(frame)) => frame,
			Ok(None) => continue,
			Err(_) => {
				debug!("session {}: malformed frame", session_id);
				continue;
			}
		};
		metrics::inc(&app.metrics.messages_in);
		metrics::add(&app.metrics.bytes_in, frame.encoded_len() as u64);
		if frame.event == protocol::EVT_HEARTBEAT {
			*last_heartbeat.lock() = Instant::now();
		}
		handle_frame(&app, &supervisor, &mut session, frame).await;
		if kill.is_cancelled() {
			break;
		}
	}

	// Teardown: one path for every close reason
	watchdog.abort();
	queue.force_close(CloseCode::GoingAway);
	let _ = writer.await;

	let topics: Vec<String> = session.joins.keys().cloned().collect();
	for topic in topics {
		leave_topic(&app, &mut session, &topic);
	}
	supervisor.unregister_session(session_id);
	metrics::inc(&app.metrics.connections_closed);
	info!("session {} closed (tenant {})", session_id, session.tenant.external_id);
}

async fn handle_frame(
	app: &App,
	supervisor: &Arc<TenantSupervisor>,
	session: &mut Session,
	frame: Frame,
) {
	supervisor.touch();
	match frame.event.as_str() {
		protocol::EVT_HEARTBEAT => {
			let reply = Frame::reply_ok("phoenix", frame.msg_ref, json!({}));
			let _ = session.queue.push(reply);
		}
		protocol::EVT_JOIN => {
			let result = join_topic(app, supervisor, session, &frame).await;
			match result {
				Ok(()) => {}
				Err(err) => {
					rate_strike(app, session, &err);
					if matches!(err, Error::PermissionDenied(_) | Error::Unauthorized) {
						metrics::inc(&app.metrics.auth_failures);
					}
					let reply = Frame::reply_error(
						&frame.topic,
						frame.msg_ref,
						error_reason(&frame.topic, &err),
					);
					let _ = session.queue.push(reply);
				}
			}
		}
		protocol::EVT_LEAVE => {
			leave_topic(app, session, &frame.topic);
			metrics::inc(&app.metrics.leaves);
			let reply = Frame::reply_ok(&frame.topic, frame.msg_ref, json!({}));
			let _ = session.queue.push(reply);
		}
		protocol::EVT_ACCESS_TOKEN => {
			rotate_token(app, session, &frame).await;
		}
		protocol::EVT_PRESENCE | "presence_track" | "presence_untrack" => {
			if let Err(err) = handle_presence(app, session, &frame) {
				rate_strike(app, session, &err);
				let reply = Frame::reply_error(
					&frame.topic,
					frame.msg_ref,
					error_reason(&frame.topic, &err),
				);
				let _ = session.queue.push(reply);
			} else {
				let reply = Frame::reply_ok(&frame.topic, frame.msg_ref, json!({}));
				let _ = session.queue.push(reply);
			}
		}
		// `broadcast` and any custom event name fan out as a broadcast
		_ => {
			if let Err(err) = handle_broadcast(app, session, &frame).await {
				rate_strike(app, session, &err);
				let reply = Frame::reply_error(
					&frame.topic,
					frame.msg_ref,
					error_reason(&frame.topic, &err),
				);
				let _ = session.queue.push(reply);
			}
		}
	}
}

async fn join_topic(
	app: &App,
	supervisor: &Arc<TenantSupervisor>,
	session: &mut Session,
	frame: &Frame,
) -> RmResult<()> {
	let topic = frame.topic.clone();
	app.limiter.check(&session.tenant, Resource::Joins, 1)?;
	if session.joins.len() >= session.tenant.max_channels_per_client as usize
		&& !session.joins.contains_key(&topic)
	{
		return Err(Error::RateLimited("channels_open".into()));
	}

	let mut config = JoinConfig::parse(&frame.payload)?;
	if app.settings.secure_channels {
		config.private = true;
	}

	if config.private {
		let pool = supervisor
			.pool()
			.ok_or_else(|| Error::PermissionDenied("no authorization database".into()))?;
		let allowed = app
			.authz
			.can_read(&pool, &session.tenant.external_id, &topic, &session.claims)
			.await?;
		if !allowed {
			return Err(Error::PermissionDenied(String::new()));
		}
	}

	// A re-join replaces the previous subscription
	if session.joins.contains_key(&topic) {
		leave_topic(app, session, &topic);
	}

	let subscribed = app.hub.subscribe(
		&session.tenant.external_id,
		&topic,
		session.queue.clone(),
		&config,
		session.claims.role(),
	);
	metrics::inc(&app.metrics.joins);

	if subscribed.created {
		app.cluster.announce_interest(&session.tenant.external_id, &topic, true);
	}
	if let Some(diff) = &subscribed.presence_diff {
		forward_presence(app, &session.tenant.external_id, &topic, diff);
		metrics::inc(&app.metrics.presence_events);
	}

	let reply = Frame::reply_ok(
		&topic,
		frame.msg_ref.clone(),
		json!({ "postgres_changes": config.postgres_changes.len() }),
	);
	let _ = session.queue.push(reply);
	let _ = session.queue.push(Frame::system(
		&topic,
		"ok",
		format!("Subscribed to {}", topic),
	));
	let _ = session
		.queue
		.push(Frame::new(&topic, protocol::EVT_PRESENCE_STATE, subscribed.presence_state));

	session.joins.insert(topic, JoinState { sub_ref: subscribed.sub_ref, config });
	Ok(())
}

fn leave_topic(app: &App, session: &mut Session, topic: &str) {
	let Some(join) = session.joins.remove(topic) else { return };
	let out = app.hub.unsubscribe(&session.tenant.external_id, topic, join.sub_ref);
	if let Some(diff) = &out.presence_diff {
		forward_presence(app, &session.tenant.external_id, topic, diff);
	}
	if out.deleted {
		app.cluster.announce_interest(&session.tenant.external_id, topic, false);
	}
}

async fn handle_broadcast(app: &App, session: &mut Session, frame: &Frame) -> RmResult<()> {
	let bytes = frame.encoded_len() as u32;
	app.limiter.check(&session.tenant, Resource::Events, 1)?;
	app.limiter.check(&session.tenant, Resource::BytesIn, bytes)?;

	let Some(join) = session.joins.get(&frame.topic) else {
		return Err(Error::ChannelError(format!("not joined to topic: {}", frame.topic)));
	};

	// Broadcast frames wrap the user event; custom events are the event
	let (event, payload) = if frame.event == protocol::EVT_BROADCAST {
		let event =
			frame.payload.get("event").and_then(Value::as_str).unwrap_or("broadcast").to_string();
		let payload = frame.payload.get("payload").cloned().unwrap_or(frame.payload.clone());
		(event, payload)
	} else {
		(frame.event.clone(), frame.payload.clone())
	};

	let private =
		join.config.private || app.hub.is_private(&session.tenant.external_id, &frame.topic);
	if private {
		let pool = (match app.supervisors.get(&session.tenant.external_id).await {
			Some(supervisor) => supervisor.pool(),
			None => None,
		})
		.ok_or_else(|| Error::PermissionDenied("no authorization database".into()))?;
		// Re-authorized on every send so a rotated token takes effect here
		let allowed = app
			.authz
			.can_write(&pool, &session.tenant.external_id, &frame.topic, &session.claims)
			.await?;
		if !allowed {
			return Err(Error::PermissionDenied(String::new()));
		}
	}

	let msg = BroadcastMessage { topic: frame.topic.clone(), event, payload, private };
	msg.validate()?;
	channel::publish(app, &session.tenant, &msg, Some(join.sub_ref));

	if join.config.broadcast_ack {
		let reply = Frame::reply_ok(&frame.topic, frame.msg_ref.clone(), json!({}));
		let _ = session.queue.push(reply);
	}
	session.limited_since = None;
	Ok(())
}

fn handle_presence(app: &App, session: &mut Session, frame: &Frame) -> RmResult<()> {
	app.limiter.check(&session.tenant, Resource::Events, 1)?;
	let Some(join) = session.joins.get(&frame.topic) else {
		return Err(Error::ChannelError(format!("not joined to topic: {}", frame.topic)));
	};

	let kind = match frame.event.as_str() {
		"presence_track" => "track",
		"presence_untrack" => "untrack",
		_ => frame
			.payload
			.get("event")
			.or_else(|| frame.payload.get("type"))
			.and_then(Value::as_str)
			.unwrap_or("track"),
	};
	let diff = match kind {
		"track" => {
			let payload = frame.payload.get("payload").cloned().unwrap_or(json!({}));
			app.hub.track(&session.tenant.external_id, &frame.topic, join.sub_ref, payload)
		}
		"untrack" => app.hub.untrack(&session.tenant.external_id, &frame.topic, join.sub_ref),
		other => {
			return Err(Error::ValidationError(format!("unknown presence event: {}", other)))
		}
	};
	if let Some(diff) = diff {
		forward_presence(app, &session.tenant.external_id, &frame.topic, &diff);
		metrics::inc(&app.metrics.presence_events);
	}
	session.limited_since = None;
	Ok(())
}

/// `access_token` rotates the JWT in place. Private subscriptions
/// re-validate immediately; ones that fail are force-left.
async fn rotate_token(app: &App, session: &mut Session, frame: &Frame) {
	let Some(token) = frame.payload.get("access_token").and_then(Value::as_str) else {
		let reply = Frame::reply_error(&frame.topic, frame.msg_ref.clone(), "missing access_token");
		let _ = session.queue.push(reply);
		return;
	};

	match app.verifier.verify(&session.tenant, token) {
		Ok(claims) => {
			session.claims = claims;
			let reply = Frame::reply_ok(&frame.topic, frame.msg_ref.clone(), json!({}));
			let _ = session.queue.push(reply);
			revalidate_private_joins(app, session).await;
		}
		Err(err) => {
			metrics::inc(&app.metrics.auth_failures);
			debug!("token rotation failed for session {}: {}", session.id, err);
			session.queue.force_close(CloseCode::TokenExpired);
		}
	}
}

async fn revalidate_private_joins(app: &App, session: &mut Session) {
	let pool = match app.supervisors.get(&session.tenant.external_id).await {
		Some(supervisor) => supervisor.pool(),
		None => None,
	};
	let private_topics: Vec<String> = session
		.joins
		.iter()
		.filter(|(_, join)| join.config.private)
		.map(|(topic, _)| topic.clone())
		.collect();
	for topic in private_topics {
		let allowed = match &pool {
			Some(pool) => app
				.authz
				.can_read(pool, &session.tenant.external_id, &topic, &session.claims)
				.await
				.unwrap_or(false),
			None => false,
		};
		if !allowed {
			leave_topic(app, session, &topic);
			let _ = session.queue.push(Frame::system(
				&topic,
				"error",
				format!("{}: re-authorization failed", CloseCode::TokenExpired.reason()),
			));
			let _ = session.queue.push(Frame::phx_error(&topic));
		}
	}
}

/// Persistent overage closes the session after a cool-down window of
/// back-to-back rate-limit rejections.
fn rate_strike(app: &App, session: &mut Session, err: &Error) {
	if !matches!(err, Error::RateLimited(_)) {
		return;
	}
	metrics::inc(&app.metrics.rate_limited);
	let since = *session.limited_since.get_or_insert_with(Instant::now);
	if since.elapsed().as_secs() >= app.settings.rate_cooldown_secs as u64 {
		warn!("session {} closed for sustained overage", session.id);
		session.queue.force_close(CloseCode::RateCooldown);
	}
}

// vim: ts=4
