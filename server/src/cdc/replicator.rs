//! Change-data-capture replication for one tenant.
//!
//! Runs on the tenant's owner node only. Consumes a wal2json logical slot by
//! polling: peek a batch, decode, resolve column visibility, hand every
//! change to the hub and interested peers, then advance the slot. Advancing
//! only after enqueue gives at-least-once delivery above the checkpoint;
//! the bounded subscriber queues are the durability boundary.

use rand::RngExt;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cdc::decoder::{self, Change};
use crate::cluster::forward::FWD_POSTGRES_CHANGES;
use crate::core::metrics;
use crate::prelude::*;
use crate::tenant::model::CdcSettings;
use crate::types::Lsn;

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Upper bound on rows peeked per poll
const BATCH_ROWS: i32 = 512;

/// Jittered exponential backoff for replication reconnects.
struct Backoff {
	current: Duration,
}

impl Backoff {
	fn new() -> Self {
		Self { current: BACKOFF_MIN }
	}

	fn reset(&mut self) {
		self.current = BACKOFF_MIN;
	}

	fn next(&mut self) -> Duration {
		let base = self.current;
		self.current = (self.current * 2).min(BACKOFF_MAX);
		let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
		base + Duration::from_millis(jitter_ms)
	}
}

/// Is this a "slot gone / WAL recycled" failure, i.e. we lost our place?
fn is_lagged(err: &sqlx::Error) -> bool {
	let msg = err.to_string();
	msg.contains("does not exist")
		|| msg.contains("has already been removed")
		|| msg.contains("can no longer get changes")
}

/// Run the replicator until cancelled. Spawned by the tenant supervisor on
/// the owner node; the supervisor owns the cancellation token.
pub async fn run(
	app: App,
	tenant: TenantId,
	settings: CdcSettings,
	pool: PgPool,
	cancel: CancellationToken,
) {
	let slot = settings.slot_for(&tenant);
	let publication = settings.publication.clone();
	let poll_interval = settings
		.poll_interval_ms
		.map(Duration::from_millis)
		.unwrap_or(app.settings.poll_interval);
	let max_batch_bytes =
		settings.poll_max_record_bytes.unwrap_or(app.settings.poll_max_record_bytes);

	let mut backoff = Backoff::new();
	info!("replicator starting for {} (slot {})", tenant, slot);

	loop {
		if cancel.is_cancelled() {
			break;
		}
		match setup(&pool, &publication, &slot).await {
			Ok(()) => {
				backoff.reset();
				// The old owner may stop draining now
				app.cluster.announce_replicator_ready(&tenant);
				match poll_loop(&app, &tenant, &pool, &slot, poll_interval, max_batch_bytes, &cancel)
					.await
				{
					Ok(()) => break, // cancelled
					Err(err) if is_lagged_rm(&err) => {
						error!("replication lagged for {}: recreating slot {}", tenant, slot);
						metrics::inc(&app.metrics.cdc_gaps);
						if let Err(err) = drop_slot(&pool, &slot).await {
							warn!("dropping slot {} failed: {}", slot, err);
						}
						// Recreated on the next setup; the gap is logged above
					}
					Err(err) => {
						warn!("replication for {} failed: {}", tenant, err);
					}
				}
			}
			Err(err) => {
				warn!("replication setup for {} failed: {}", tenant, err);
			}
		}

		metrics::inc(&app.metrics.replicator_restarts);
		let wait = backoff.next();
		tokio::select! {
			_ = tokio::time::sleep(wait) => {}
			_ = cancel.cancelled() => break,
		}
	}
	info!("replicator stopped for {}", tenant);
}

fn is_lagged_rm(err: &Error) -> bool {
	matches!(err, Error::ServiceUnavailable(msg) if msg.starts_with("replication lagged"))
}

/// Idempotently ensure the publication and the logical slot exist.
async fn setup(pool: &PgPool, publication: &str, slot: &str) -> RmResult<()> {
	let has_publication: bool =
		sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)")
			.bind(publication)
			.fetch_one(pool)
			.await?;
	if !has_publication {
		// Identifier, not bindable; pubname charset was validated upstream
		sqlx::query(&format!("CREATE PUBLICATION {} FOR ALL TABLES", quote_ident(publication)))
			.execute(pool)
			.await?;
		info!("created publication {}", publication);
	}

	let has_slot: bool = sqlx::query_scalar(
		"SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
	)
	.bind(slot)
	.fetch_one(pool)
	.await?;
	if !has_slot {
		sqlx::query("SELECT pg_create_logical_replication_slot($1, 'wal2json')")
			.bind(slot)
			.execute(pool)
			.await?;
		info!("created replication slot {}", slot);
	}
	Ok(())
}

async fn drop_slot(pool: &PgPool, slot: &str) -> RmResult<()> {
	sqlx::query(
		"SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
		 WHERE slot_name = $1",
	)
	.bind(slot)
	.execute(pool)
	.await?;
	Ok(())
}

async fn poll_loop(
	app: &App,
	tenant: &TenantId,
	pool: &PgPool,
	slot: &str,
	poll_interval: Duration,
	max_batch_bytes: usize,
	cancel: &CancellationToken,
) -> RmResult<()> {
	loop {
		if cancel.is_cancelled() {
			return Ok(());
		}

		let rows = sqlx::query(
			"SELECT lsn::text AS lsn, data FROM pg_logical_slot_peek_changes($1, NULL, $2, \
			 'format-version', '2', 'include-timestamp', 'on', \
			 'actions', 'insert,update,delete')",
		)
		.bind(slot)
		.bind(BATCH_ROWS)
		.fetch_all(pool)
		.await
		.map_err(classify)?;

		if rows.is_empty() {
			tokio::select! {
				_ = tokio::time::sleep(poll_interval) => {}
				_ = cancel.cancelled() => return Ok(()),
			}
			continue;
		}

		let mut acked: Option<Lsn> = None;
		let mut batch_bytes = 0usize;
		for row in &rows {
			let lsn_text: &str = row.try_get("lsn").or(Err(Error::DbError))?;
			let data: &str = row.try_get("data").or(Err(Error::DbError))?;
			let lsn = Lsn::parse(lsn_text)
				.ok_or_else(|| Error::Internal(format!("bad lsn from slot: {}", lsn_text)))?;

			if let Some(change) = decoder::decode(lsn, data).unwrap_or(None) {
				dispatch(app, tenant, pool, &change).await;
			}
			// Only advance past fully enqueued changes
			acked = Some(lsn);

			batch_bytes += data.len();
			if batch_bytes >= max_batch_bytes {
				break;
			}
		}

		if let Some(lsn) = acked {
			sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
				.bind(slot)
				.bind(lsn.to_string())
				.execute(pool)
				.await
				.map_err(classify)?;
		}
	}
}

/// Deliver one change locally and to interested peers.
async fn dispatch(app: &App, tenant: &TenantId, pool: &PgPool, change: &Change) {
	metrics::inc(&app.metrics.cdc_changes);

	let roles = app.hub.cdc_roles(tenant, &change.schema, &change.table);
	if !roles.is_empty() {
		let visible = app
			.visibility
			.for_roles(pool, tenant, &roles, &change.schema, &change.table)
			.await;
		let delivered = app.hub.emit_cdc(tenant, change, &visible);
		metrics::add(&app.metrics.cdc_dispatched, delivered as u64);
	}

	// Peers with any subscribers for this tenant get the raw change and run
	// their own visibility + filter pass
	let payload = match serde_json::to_value(change) {
		Ok(payload) => payload,
		Err(err) => {
			warn!("change serialization failed: {}", err);
			return;
		}
	};
	let envelope = app.cluster.envelope(tenant, "", FWD_POSTGRES_CHANGES, payload);
	app.cluster.forward_tenant(tenant, envelope);
}

fn classify(err: sqlx::Error) -> Error {
	if is_lagged(&err) {
		Error::ServiceUnavailable(format!("replication lagged: {}", err))
	} else {
		Error::from(err)
	}
}

fn quote_ident(ident: &str) -> String {
	format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_backoff_grows_and_caps() {
		let mut backoff = Backoff::new();
		let first = backoff.next();
		assert!(first >= BACKOFF_MIN);
		let mut last = first;
		for _ in 0..12 {
			last = backoff.next();
		}
		// Jitter adds at most half the base on top of the cap
		assert!(last >= BACKOFF_MAX);
		assert!(last <= BACKOFF_MAX + BACKOFF_MAX / 2);

		backoff.reset();
		assert!(backoff.next() < Duration::from_millis(200));
	}

	#[test]
	fn test_quote_ident() {
		assert_eq!(quote_ident("supabase_realtime"), "\"supabase_realtime\"");
		assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
	}

	#[test]
	fn test_lagged_classification() {
		let err = Error::ServiceUnavailable("replication lagged: slot gone".into());
		assert!(is_lagged_rm(&err));
		assert!(!is_lagged_rm(&Error::DbError));
	}
}

// vim: ts=4
