//! Channel wire protocol.
//!
//! Text frames, JSON objects: `{topic, event, payload, ref}`. The inbound
//! event names follow the Phoenix channel convention (`phx_join`,
//! `phx_leave`, `heartbeat`, `access_token`, `broadcast`, `presence`); any
//! other event name is treated as a custom broadcast.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::prelude::*;

pub const EVT_JOIN: &str = "phx_join";
pub const EVT_LEAVE: &str = "phx_leave";
pub const EVT_REPLY: &str = "phx_reply";
pub const EVT_ERROR: &str = "phx_error";
pub const EVT_CLOSE: &str = "phx_close";
pub const EVT_HEARTBEAT: &str = "heartbeat";
pub const EVT_ACCESS_TOKEN: &str = "access_token";
pub const EVT_BROADCAST: &str = "broadcast";
pub const EVT_PRESENCE: &str = "presence";
pub const EVT_PRESENCE_STATE: &str = "presence_state";
pub const EVT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVT_SYSTEM: &str = "system";

/// WebSocket close codes used by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCode {
	GoingAway,
	HeartbeatTimeout,
	TokenExpired,
	SlowConsumer,
	TenantSuspended,
	RateCooldown,
}

impl CloseCode {
	pub fn code(&self) -> u16 {
		match self {
			CloseCode::GoingAway => 1001,
			CloseCode::HeartbeatTimeout => 4000,
			CloseCode::TokenExpired => 4001,
			CloseCode::SlowConsumer => 4002,
			CloseCode::TenantSuspended => 4010,
			CloseCode::RateCooldown => 4029,
		}
	}

	pub fn reason(&self) -> &'static str {
		match self {
			CloseCode::GoingAway => "GOING_AWAY",
			CloseCode::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
			CloseCode::TokenExpired => "TOKEN_EXPIRED",
			CloseCode::SlowConsumer => "SLOW_CONSUMER",
			CloseCode::TenantSuspended => "TENANT_SUSPENDED",
			CloseCode::RateCooldown => "RATE_COOLDOWN",
		}
	}
}

/// One protocol frame, inbound or outbound.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
	pub topic: String,
	pub event: String,
	#[serde(default)]
	pub payload: Value,
	#[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
	pub msg_ref: Option<Value>,
}

impl Frame {
	pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
		Self { topic: topic.into(), event: event.into(), payload, msg_ref: None }
	}

	/// Parse a text WebSocket message. Control frames yield `None`.
	pub fn from_ws_message(msg: &Message) -> RmResult<Option<Frame>> {
		match msg {
			Message::Text(text) => {
				let frame = serde_json::from_str::<Frame>(text)
					.map_err(|_| Error::ValidationError("malformed frame".into()))?;
				Ok(Some(frame))
			}
			Message::Close(_) | Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => Ok(None),
		}
	}

	pub fn to_ws_message(&self) -> RmResult<Message> {
		let json = serde_json::to_string(self)?;
		Ok(Message::Text(json.into()))
	}

	/// Serialized frame size, used for outbound byte accounting.
	pub fn encoded_len(&self) -> usize {
		serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
	}

	// Outbound builders //
	//*******************//

	pub fn reply_ok(topic: &str, msg_ref: Option<Value>, response: Value) -> Frame {
		Frame {
			topic: topic.into(),
			event: EVT_REPLY.into(),
			payload: json!({ "status": "ok", "response": response }),
			msg_ref,
		}
	}

	pub fn reply_error(topic: &str, msg_ref: Option<Value>, reason: impl Into<String>) -> Frame {
		Frame {
			topic: topic.into(),
			event: EVT_REPLY.into(),
			payload: json!({ "status": "error", "response": { "reason": reason.into() } }),
			msg_ref,
		}
	}

	pub fn system(topic: &str, status: &str, message: impl Into<String>) -> Frame {
		Frame {
			topic: topic.into(),
			event: EVT_SYSTEM.into(),
			payload: json!({
				"status": status,
				"extension": "system",
				"message": message.into(),
			}),
			msg_ref: None,
		}
	}

	pub fn phx_error(topic: &str) -> Frame {
		Frame { topic: topic.into(), event: EVT_ERROR.into(), payload: json!({}), msg_ref: None }
	}
}

/// Map an error to the reason string sent in a `phx_reply`.
pub fn error_reason(topic: &str, err: &Error) -> String {
	match err {
		Error::Unauthorized | Error::PermissionDenied(_) => format!(
			"You do not have permissions to read from this Channel topic: {}",
			topic
		),
		Error::TokenExpired => "Token has expired".into(),
		Error::RateLimited(what) => format!("Rate limit exceeded: {}", what),
		Error::TenantSuspended(_) => "Tenant is suspended".into(),
		Error::TenantNotFound(_) => "Tenant not found".into(),
		Error::TenantUnavailable(reason) => format!("Tenant unavailable: {}", reason),
		Error::ChannelError(reason) => reason.clone(),
		Error::ValidationError(msg) => msg.clone(),
		_ => "Unable to process the request".into(),
	}
}


// vim: ts=4
