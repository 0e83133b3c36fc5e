//! Topic authorization against the tenant's own database.
//!
//! Access to a private topic is whatever the tenant's row-level security says
//! it is: we open a transaction on the tenant pool, assume the JWT's role,
//! expose the claims as `request.jwt.claims`, and probe the `realtime.messages`
//! table for the topic. SELECT succeeding means the role may read; INSERT
//! succeeding (always rolled back) means it may write.

use lru::LruCache;
use sqlx::PgPool;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::auth::jwt::Claims;
use crate::core::settings::AUTHZ_CACHE_TTL;
use crate::prelude::*;

const DECISIONS_PER_TENANT: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
	pub read: bool,
	pub write: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DecisionKey {
	topic: Box<str>,
	role: Box<str>,
	claims: [u8; 32],
}

struct CachedDecision {
	decision: Decision,
	at: Instant,
}

/// Process-wide authorization cache, sharded by tenant.
pub struct PolicyStore {
	ttl: Duration,
	cache: parking_lot::Mutex<HashMap<TenantId, LruCache<DecisionKey, CachedDecision>>>,
}

impl PolicyStore {
	pub fn new() -> Self {
		Self::with_ttl(AUTHZ_CACHE_TTL)
	}

	pub fn with_ttl(ttl: Duration) -> Self {
		Self { ttl, cache: parking_lot::Mutex::new(HashMap::new()) }
	}

	pub async fn can_read(
		&self,
		pool: &PgPool,
		tenant: &TenantId,
		topic: &str,
		claims: &Claims,
	) -> RmResult<bool> {
		Ok(self.decision(pool, tenant, topic, claims).await?.read)
	}

	pub async fn can_write(
		&self,
		pool: &PgPool,
		tenant: &TenantId,
		topic: &str,
		claims: &Claims,
	) -> RmResult<bool> {
		Ok(self.decision(pool, tenant, topic, claims).await?.write)
	}

	pub fn invalidate(&self, tenant: &TenantId) {
		self.cache.lock().remove(tenant);
	}

	/// Sanity check run while a tenant starts: the probe table must exist.
	pub async fn warm(&self, pool: &PgPool, tenant: &TenantId) -> RmResult<()> {
		let exists: Option<String> =
			sqlx::query_scalar("SELECT to_regclass('realtime.messages')::text")
				.fetch_one(pool)
				.await?;
		if exists.is_none() {
			warn!("tenant {}: realtime.messages missing, private topics will deny", tenant);
		}
		Ok(())
	}

	async fn decision(
		&self,
		pool: &PgPool,
		tenant: &TenantId,
		topic: &str,
		claims: &Claims,
	) -> RmResult<Decision> {
		let key = DecisionKey {
			topic: topic.into(),
			role: claims.role().into(),
			claims: claims.digest(),
		};

		if let Some(decision) = self.cached(tenant, &key) {
			return Ok(decision);
		}

		let read = probe_read(pool, topic, claims).await?;
		// No point probing a write when the role cannot even see the topic
		let write = if read { probe_write(pool, topic, claims).await? } else { false };
		let decision = Decision { read, write };

		let mut cache = self.cache.lock();
		let per_tenant = cache.entry(tenant.clone()).or_insert_with(|| {
			LruCache::new(NonZeroUsize::new(DECISIONS_PER_TENANT).unwrap_or(NonZeroUsize::MIN))
		});
		per_tenant.put(key, CachedDecision { decision, at: Instant::now() });

		Ok(decision)
	}

	fn cached(&self, tenant: &TenantId, key: &DecisionKey) -> Option<Decision> {
		let mut cache = self.cache.lock();
		let per_tenant = cache.get_mut(tenant)?;
		match per_tenant.get(key) {
			Some(entry) if entry.at.elapsed() <= self.ttl => Some(entry.decision),
			Some(_) => {
				per_tenant.pop(key);
				None
			}
			None => None,
		}
	}
}

impl Default for PolicyStore {
	fn default() -> Self {
		Self::new()
	}
}

async fn assume_role(
	tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
	claims: &Claims,
) -> RmResult<()> {
	sqlx::query("SELECT set_config('role', $1, true)")
		.bind(claims.role())
		.execute(&mut **tx)
		.await?;
	sqlx::query("SELECT set_config('request.jwt.claims', $1, true)")
		.bind(claims.as_json().to_string())
		.execute(&mut **tx)
		.await?;
	Ok(())
}

/// RLS hides rows instead of erroring, so an empty probe SELECT is
/// indistinguishable from a denial. Seed a row with the pool's privileged
/// role first, then check whether the assumed role can see it. The
/// transaction is always rolled back; nothing persists.
async fn probe_read(pool: &PgPool, topic: &str, claims: &Claims) -> RmResult<bool> {
	let mut tx = pool.begin().await?;
	sqlx::query(
		"INSERT INTO realtime.messages (topic, extension, event, payload, private) \
		 VALUES ($1, 'broadcast', 'authorization-probe', '{}'::jsonb, true)",
	)
	.bind(topic)
	.execute(&mut *tx)
	.await?;
	assume_role(&mut tx, claims).await?;

	let res: Result<bool, sqlx::Error> = sqlx::query_scalar(
		"SELECT EXISTS(SELECT 1 FROM realtime.messages WHERE topic = $1 AND private)",
	)
	.bind(topic)
	.fetch_one(&mut *tx)
	.await;
	let allowed = match res {
		Ok(visible) => visible,
		Err(err) => {
			debug!("read probe denied for {}: {}", topic, err);
			false
		}
	};
	tx.rollback().await?;
	Ok(allowed)
}

async fn probe_write(pool: &PgPool, topic: &str, claims: &Claims) -> RmResult<bool> {
	let mut tx = pool.begin().await?;
	assume_role(&mut tx, claims).await?;

	let res = sqlx::query(
		"INSERT INTO realtime.messages (topic, extension, event, payload, private) \
		 VALUES ($1, 'broadcast', 'authorization-probe', '{}'::jsonb, true)",
	)
	.bind(topic)
	.execute(&mut *tx)
	.await;
	let allowed = match res {
		Ok(_) => true,
		Err(err) => {
			debug!("write probe denied for {}: {}", topic, err);
			false
		}
	};
	// Never keep the probe row
	tx.rollback().await?;
	Ok(allowed)
}

// vim: ts=4
