//! In-process tenant cache over the control database.
//!
//! Fetch-through with TTL; concurrent misses for the same id are coalesced
//! into a single control-DB read. Cross-node invalidation is best-effort, the
//! TTL is the safety net.

use lru::LruCache;
use sqlx::PgPool;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::core::settings::TENANT_CACHE_TTL;
use crate::prelude::*;
use crate::tenant::model::TenantRef;
use crate::tenant::store;

const CACHE_CAPACITY: usize = 10_000;

/// Cached lookup outcome. Negative outcomes are cached too, so a storm of
/// connects for a deleted tenant does not hammer the control DB.
#[derive(Clone, Debug)]
enum Outcome {
	Found(TenantRef),
	NotFound,
	Suspended,
	Unavailable,
}

struct CachedEntry {
	outcome: Outcome,
	fetched_at: Instant,
}

type Inflight = watch::Receiver<Option<Outcome>>;

pub struct TenantRegistry {
	db: PgPool,
	ttl: Duration,
	cache: parking_lot::Mutex<LruCache<TenantId, CachedEntry>>,
	pending: tokio::sync::Mutex<HashMap<TenantId, Inflight>>,
}

impl TenantRegistry {
	pub fn new(db: PgPool) -> Self {
		Self::with_ttl(db, TENANT_CACHE_TTL)
	}

	pub fn with_ttl(db: PgPool, ttl: Duration) -> Self {
		let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
		Self {
			db,
			ttl,
			cache: parking_lot::Mutex::new(LruCache::new(capacity)),
			pending: tokio::sync::Mutex::new(HashMap::new()),
		}
	}

	/// Look up a tenant, hitting the control DB at most once per TTL.
	pub async fn lookup(&self, id: &TenantId) -> RmResult<TenantRef> {
		if let Some(outcome) = self.cached(id) {
			return Self::unwrap_outcome(id, outcome);
		}
		let outcome = self.fetch_coalesced(id).await;
		Self::unwrap_outcome(id, outcome)
	}

	/// Drop a cached tenant; the next lookup re-reads the control DB.
	pub fn invalidate(&self, id: &TenantId) {
		self.cache.lock().pop(id);
		debug!("tenant cache invalidated: {}", id);
	}

	/// Re-read every tenant the control DB knows about. Best effort.
	pub async fn refresh_all(&self) -> RmResult<usize> {
		let ids = store::list_ids(&self.db).await?;
		let count = ids.len();
		for id in ids {
			self.invalidate(&id);
			let outcome = self.fetch_coalesced(&id).await;
			if matches!(outcome, Outcome::Unavailable) {
				warn!("refresh_all: control db unavailable at {}", id);
			}
		}
		Ok(count)
	}

	fn cached(&self, id: &TenantId) -> Option<Outcome> {
		let mut cache = self.cache.lock();
		let entry = cache.get(id)?;
		if entry.fetched_at.elapsed() > self.ttl {
			cache.pop(id);
			return None;
		}
		Some(entry.outcome.clone())
	}

	async fn fetch_coalesced(&self, id: &TenantId) -> Outcome {
		// Re-check under the pending lock so only one task becomes the loader
		let mut rx: Inflight;
		{
			let mut pending = self.pending.lock().await;
			if let Some(outcome) = self.cached(id) {
				return outcome;
			}
			if let Some(existing) = pending.get(id) {
				rx = existing.clone();
			} else {
				let (tx, new_rx) = watch::channel(None);
				pending.insert(id.clone(), new_rx);
				drop(pending);

				let outcome = self.fetch(id).await;
				self.cache.lock().put(
					id.clone(),
					CachedEntry { outcome: outcome.clone(), fetched_at: Instant::now() },
				);
				let _ = tx.send(Some(outcome.clone()));
				self.pending.lock().await.remove(id);
				return outcome;
			}
		}

		// Follower: wait for the loader's result
		loop {
			if let Some(outcome) = rx.borrow().clone() {
				return outcome;
			}
			if rx.changed().await.is_err() {
				// Loader died before publishing; fall back to a direct fetch
				return self.fetch(id).await;
			}
		}
	}

	async fn fetch(&self, id: &TenantId) -> Outcome {
		match store::read(&self.db, id).await {
			Ok(tenant) if tenant.suspended => Outcome::Suspended,
			Ok(tenant) => Outcome::Found(Arc::new(tenant)),
			Err(Error::TenantNotFound(_)) | Err(Error::NotFound) => Outcome::NotFound,
			Err(Error::ValidationError(msg)) => {
				warn!("tenant {} failed validation: {}", id, msg);
				Outcome::NotFound
			}
			Err(err) => {
				warn!("tenant fetch failed for {}: {}", id, err);
				Outcome::Unavailable
			}
		}
	}

	fn unwrap_outcome(id: &TenantId, outcome: Outcome) -> RmResult<TenantRef> {
		match outcome {
			Outcome::Found(tenant) => Ok(tenant),
			Outcome::NotFound => Err(Error::TenantNotFound(id.to_string())),
			Outcome::Suspended => Err(Error::TenantSuspended(id.to_string())),
			Outcome::Unavailable => {
				Err(Error::ServiceUnavailable("control database unavailable".into()))
			}
		}
	}
}

// vim: ts=4
