//! Process-wide counters exposed for observability.
//!
//! Counters only; no histograms, no transport. `GET /api/metrics` serves the
//! snapshot as JSON.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
	pub connections_opened: AtomicU64,
	pub connections_closed: AtomicU64,
	pub joins: AtomicU64,
	pub leaves: AtomicU64,
	pub messages_in: AtomicU64,
	pub messages_out: AtomicU64,
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
	pub cdc_changes: AtomicU64,
	pub cdc_dispatched: AtomicU64,
	pub cdc_gaps: AtomicU64,
	pub replicator_restarts: AtomicU64,
	pub rate_limited: AtomicU64,
	pub slow_consumers: AtomicU64,
	pub forwarded: AtomicU64,
	pub forward_received: AtomicU64,
	pub forward_deduped: AtomicU64,
	pub presence_events: AtomicU64,
	pub auth_failures: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
	pub connections_opened: u64,
	pub connections_closed: u64,
	pub joins: u64,
	pub leaves: u64,
	pub messages_in: u64,
	pub messages_out: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub cdc_changes: u64,
	pub cdc_dispatched: u64,
	pub cdc_gaps: u64,
	pub replicator_restarts: u64,
	pub rate_limited: u64,
	pub slow_consumers: u64,
	pub forwarded: u64,
	pub forward_received: u64,
	pub forward_deduped: u64,
	pub presence_events: u64,
	pub auth_failures: u64,
}

impl Metrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			connections_opened: self.connections_opened.load(Ordering::Relaxed),
			connections_closed: self.connections_closed.load(Ordering::Relaxed),
			joins: self.joins.load(Ordering::Relaxed),
			leaves: self.leaves.load(Ordering::Relaxed),
			messages_in: self.messages_in.load(Ordering::Relaxed),
			messages_out: self.messages_out.load(Ordering::Relaxed),
			bytes_in: self.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.bytes_out.load(Ordering::Relaxed),
			cdc_changes: self.cdc_changes.load(Ordering::Relaxed),
			cdc_dispatched: self.cdc_dispatched.load(Ordering::Relaxed),
			cdc_gaps: self.cdc_gaps.load(Ordering::Relaxed),
			replicator_restarts: self.replicator_restarts.load(Ordering::Relaxed),
			rate_limited: self.rate_limited.load(Ordering::Relaxed),
			slow_consumers: self.slow_consumers.load(Ordering::Relaxed),
			forwarded: self.forwarded.load(Ordering::Relaxed),
			forward_received: self.forward_received.load(Ordering::Relaxed),
			forward_deduped: self.forward_deduped.load(Ordering::Relaxed),
			presence_events: self.presence_events.load(Ordering::Relaxed),
			auth_failures: self.auth_failures.load(Ordering::Relaxed),
		}
	}
}

/// Relaxed increment; all counters are monotonic.
pub fn inc(counter: &AtomicU64) {
	counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
	counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_snapshot_reflects_increments() {
		let metrics = Metrics::new();
		inc(&metrics.joins);
		inc(&metrics.joins);
		add(&metrics.bytes_in, 42);

		let snap = metrics.snapshot();
		assert_eq!(snap.joins, 2);
		assert_eq!(snap.bytes_in, 42);
		assert_eq!(snap.leaves, 0);
	}
}

// vim: ts=4
