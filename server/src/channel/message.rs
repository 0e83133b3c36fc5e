//! Messages and subscriber-side delivery plumbing.
//!
//! Every session owns one bounded outbound queue; the hub only ever
//! `try_send`s into it. A queue that hits its message or byte bound marks the
//! session for a `SLOW_CONSUMER` close instead of ever blocking a producer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::filter::ChangeSelector;
use crate::core::settings::{OUTBOUND_QUEUE_BYTES, OUTBOUND_QUEUE_MSGS};
use crate::prelude::*;
use crate::session::protocol::{CloseCode, Frame};

/// A broadcast entering the hub, from a socket or `POST /api/broadcast`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastMessage {
	pub topic: String,
	pub event: String,
	#[serde(default)]
	pub payload: Value,
	#[serde(default)]
	pub private: bool,
}

impl BroadcastMessage {
	pub fn validate(&self) -> RmResult<()> {
		if self.topic.is_empty() || self.topic.len() > 255 {
			return Err(Error::ValidationError("topic length".into()));
		}
		if self.event.is_empty() || self.event.len() > 255 {
			return Err(Error::ValidationError("event length".into()));
		}
		Ok(())
	}
}

/// Options recognized in a join payload.
#[derive(Clone, Debug, Default)]
pub struct JoinConfig {
	pub broadcast_self: bool,
	pub broadcast_ack: bool,
	pub presence_key: Option<Box<str>>,
	pub private: bool,
	pub postgres_changes: Vec<ChangeSelector>,
}

impl JoinConfig {
	pub fn parse(payload: &Value) -> RmResult<JoinConfig> {
		let config = payload.get("config").unwrap_or(&Value::Null);

		let broadcast = config.get("broadcast");
		let broadcast_self = broadcast
			.and_then(|b| b.get("self"))
			.and_then(Value::as_bool)
			.unwrap_or(false);
		let broadcast_ack = broadcast
			.and_then(|b| b.get("ack"))
			.and_then(Value::as_bool)
			.unwrap_or(false);

		let presence_key = config
			.get("presence")
			.and_then(|p| p.get("key"))
			.and_then(Value::as_str)
			.filter(|k| !k.is_empty())
			.map(Into::into);

		let private = config.get("private").and_then(Value::as_bool).unwrap_or(false);

		let mut postgres_changes = Vec::new();
		if let Some(entries) = config.get("postgres_changes").and_then(Value::as_array) {
			for entry in entries {
				let event = entry.get("event").and_then(Value::as_str).unwrap_or("*");
				let schema = entry.get("schema").and_then(Value::as_str).unwrap_or("public");
				let table = entry.get("table").and_then(Value::as_str);
				let filter = entry.get("filter").and_then(Value::as_str);
				postgres_changes.push(ChangeSelector::from_config(event, schema, table, filter)?);
			}
		}

		Ok(JoinConfig { broadcast_self, broadcast_ack, presence_key, private, postgres_changes })
	}
}

/// Why an outbound push failed.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
	/// Queue full (messages or bytes); the session is being force-closed
	Overflow,
	/// Session already gone
	Closed,
}

/// Sending half of a session's bounded outbound queue. Cheap to clone; one
/// per session, shared by every subscription of that session.
#[derive(Clone)]
pub struct OutboundQueue {
	session: Uuid,
	tx: flume::Sender<Frame>,
	queued_bytes: Arc<AtomicUsize>,
	max_bytes: usize,
	kill: CancellationToken,
	kill_code: Arc<parking_lot::Mutex<Option<CloseCode>>>,
}

impl OutboundQueue {
	pub fn bounded(session: Uuid) -> (OutboundQueue, flume::Receiver<Frame>) {
		Self::with_limits(session, OUTBOUND_QUEUE_MSGS, OUTBOUND_QUEUE_BYTES)
	}

	pub fn with_limits(
		session: Uuid,
		max_msgs: usize,
		max_bytes: usize,
	) -> (OutboundQueue, flume::Receiver<Frame>) {
		let (tx, rx) = flume::bounded(max_msgs);
		(
			OutboundQueue {
				session,
				tx,
				queued_bytes: Arc::new(AtomicUsize::new(0)),
				max_bytes,
				kill: CancellationToken::new(),
				kill_code: Arc::new(parking_lot::Mutex::new(None)),
			},
			rx,
		)
	}

	pub fn session(&self) -> Uuid {
		self.session
	}

	/// Enqueue without blocking. Overflow force-closes the session.
	pub fn push(&self, frame: Frame) -> Result<(), PushError> {
		if self.kill.is_cancelled() {
			return Err(PushError::Closed);
		}
		let len = frame.encoded_len();
		if self.queued_bytes.fetch_add(len, Ordering::AcqRel) + len > self.max_bytes {
			self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
			self.force_close(CloseCode::SlowConsumer);
			return Err(PushError::Overflow);
		}
		match self.tx.try_send(frame) {
			Ok(()) => Ok(()),
			Err(flume::TrySendError::Full(_)) => {
				self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
				self.force_close(CloseCode::SlowConsumer);
				Err(PushError::Overflow)
			}
			Err(flume::TrySendError::Disconnected(_)) => {
				self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
				Err(PushError::Closed)
			}
		}
	}

	/// Called by the session writer after a frame has been flushed.
	pub fn debit(&self, len: usize) {
		self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
	}

	/// Mark the session for closure with `code` and wake its writer.
	pub fn force_close(&self, code: CloseCode) {
		let mut slot = self.kill_code.lock();
		if slot.is_none() {
			*slot = Some(code);
		}
		drop(slot);
		self.kill.cancel();
	}

	pub fn close_code(&self) -> Option<CloseCode> {
		*self.kill_code.lock()
	}

	pub fn kill_token(&self) -> CancellationToken {
		self.kill.clone()
	}
}

impl std::fmt::Debug for OutboundQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OutboundQueue")
			.field("session", &self.session)
			.field("queued_bytes", &self.queued_bytes.load(Ordering::Relaxed))
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn frame() -> Frame {
		Frame::new("topic:X", "broadcast", json!({ "m": "v" }))
	}

	#[test]
	fn test_push_and_debit() {
		let (queue, rx) = OutboundQueue::with_limits(Uuid::new_v4(), 10, 10_000);
		queue.push(frame()).unwrap();
		let received = rx.try_recv().unwrap();
		queue.debit(received.encoded_len());
		assert_eq!(queue.queued_bytes.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn test_message_overflow_closes_slow_consumer() {
		let (queue, _rx) = OutboundQueue::with_limits(Uuid::new_v4(), 2, 10_000);
		queue.push(frame()).unwrap();
		queue.push(frame()).unwrap();
		assert_eq!(queue.push(frame()), Err(PushError::Overflow));
		assert_eq!(queue.close_code(), Some(CloseCode::SlowConsumer));
		assert!(queue.kill_token().is_cancelled());
		// Once closed, further pushes are rejected as closed
		assert_eq!(queue.push(frame()), Err(PushError::Closed));
	}

	#[test]
	fn test_byte_overflow_closes_slow_consumer() {
		let (queue, _rx) = OutboundQueue::with_limits(Uuid::new_v4(), 1000, 64);
		queue.push(frame()).unwrap();
		assert_eq!(queue.push(frame()), Err(PushError::Overflow));
		assert_eq!(queue.close_code(), Some(CloseCode::SlowConsumer));
	}

	#[test]
	fn test_first_close_code_wins() {
		let (queue, _rx) = OutboundQueue::with_limits(Uuid::new_v4(), 2, 10_000);
		queue.force_close(CloseCode::GoingAway);
		queue.force_close(CloseCode::SlowConsumer);
		assert_eq!(queue.close_code(), Some(CloseCode::GoingAway));
	}

	#[test]
	fn test_broadcast_message_validation() {
		let ok = BroadcastMessage {
			topic: "topic:X".into(),
			event: "E".into(),
			payload: json!({}),
			private: false,
		};
		assert!(ok.validate().is_ok());

		let bad = BroadcastMessage { topic: "".into(), ..ok.clone() };
		assert!(bad.validate().is_err());

		let bad = BroadcastMessage { event: "x".repeat(300), ..ok };
		assert!(bad.validate().is_err());
	}
}

// vim: ts=4
