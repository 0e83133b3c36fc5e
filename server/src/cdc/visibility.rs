//! Column visibility for change payloads.
//!
//! A subscriber only ever sees the columns its JWT role holds SELECT on.
//! Grants change rarely, so the per (role, relation) answer is cached with a
//! short TTL and dropped on tenant invalidation.

use lru::LruCache;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::prelude::*;

const RELATIONS_PER_TENANT: usize = 1024;
const VISIBILITY_TTL: Duration = Duration::from_secs(120);

type ColumnSet = HashSet<Box<str>>;
type CacheKey = (Box<str>, Box<str>); // (role, schema.table)

struct CachedColumns {
	columns: ColumnSet,
	at: Instant,
}

pub struct VisibilityCache {
	ttl: Duration,
	cache: parking_lot::Mutex<HashMap<TenantId, LruCache<CacheKey, CachedColumns>>>,
}

impl VisibilityCache {
	pub fn new() -> Self {
		Self::with_ttl(VISIBILITY_TTL)
	}

	pub fn with_ttl(ttl: Duration) -> Self {
		Self { ttl, cache: parking_lot::Mutex::new(HashMap::new()) }
	}

	pub fn invalidate(&self, tenant: &TenantId) {
		self.cache.lock().remove(tenant);
	}

	/// Columns of `schema.table` the `role` may SELECT. A failing lookup
	/// (unknown role, dropped table) yields the empty set: deny, not error.
	pub async fn visible_columns(
		&self,
		pool: &PgPool,
		tenant: &TenantId,
		role: &str,
		schema: &str,
		table: &str,
	) -> ColumnSet {
		let key: CacheKey = (role.into(), format!("{}.{}", schema, table).into());
		if let Some(columns) = self.cached(tenant, &key) {
			return columns;
		}

		let columns = match query_columns(pool, role, schema, table).await {
			Ok(columns) => columns,
			Err(err) => {
				debug!("column visibility for {} as {} failed: {}", key.1, role, err);
				HashSet::new()
			}
		};

		let mut cache = self.cache.lock();
		let per_tenant = cache.entry(tenant.clone()).or_insert_with(|| {
			LruCache::new(NonZeroUsize::new(RELATIONS_PER_TENANT).unwrap_or(NonZeroUsize::MIN))
		});
		per_tenant.put(key, CachedColumns { columns: columns.clone(), at: Instant::now() });
		columns
	}

	/// Resolve visibility for a whole set of roles at once (one map handed
	/// to the hub per change batch).
	pub async fn for_roles(
		&self,
		pool: &PgPool,
		tenant: &TenantId,
		roles: &HashSet<Box<str>>,
		schema: &str,
		table: &str,
	) -> HashMap<Box<str>, ColumnSet> {
		let mut out = HashMap::with_capacity(roles.len());
		for role in roles {
			let columns = self.visible_columns(pool, tenant, role, schema, table).await;
			if !columns.is_empty() {
				out.insert(role.clone(), columns);
			}
		}
		out
	}

	fn cached(&self, tenant: &TenantId, key: &CacheKey) -> Option<ColumnSet> {
		let mut cache = self.cache.lock();
		let per_tenant = cache.get_mut(tenant)?;
		match per_tenant.get(key) {
			Some(entry) if entry.at.elapsed() <= self.ttl => Some(entry.columns.clone()),
			Some(_) => {
				per_tenant.pop(key);
				None
			}
			None => None,
		}
	}
}

impl Default for VisibilityCache {
	fn default() -> Self {
		Self::new()
	}
}

async fn query_columns(
	pool: &PgPool,
	role: &str,
	schema: &str,
	table: &str,
) -> RmResult<ColumnSet> {
	let rows: Vec<String> = sqlx::query_scalar(
		"SELECT column_name::text FROM information_schema.columns \
		 WHERE table_schema = $1 AND table_name = $2 \
		 AND has_column_privilege($3, \
			 (quote_ident($1) || '.' || quote_ident($2))::regclass, \
			 column_name, 'SELECT')",
	)
	.bind(schema)
	.bind(table)
	.bind(role)
	.fetch_all(pool)
	.await?;

	Ok(rows.into_iter().map(Into::into).collect())
}

// vim: ts=4
