//! Per-tenant rate limiting.
//!
//! GCRA buckets (governor), one set per tenant, sized from the tenant
//! record's quotas: joins/s, events/s and bytes/s in each direction.
//! Concurrency caps (clients per tenant, channels per client) are plain
//! counters enforced at connect/join time by their owners.

use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::prelude::*;
use crate::tenant::model::Tenant;

type DirectLimiter = RateLimiter<
	governor::state::NotKeyed,
	governor::state::InMemoryState,
	governor::clock::DefaultClock,
>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
	Joins,
	Events,
	BytesIn,
	BytesOut,
}

impl Resource {
	pub fn as_str(&self) -> &'static str {
		match self {
			Resource::Joins => "joins",
			Resource::Events => "events",
			Resource::BytesIn => "bytes_in",
			Resource::BytesOut => "bytes_out",
		}
	}
}

struct Buckets {
	joins: DirectLimiter,
	events: DirectLimiter,
	bytes_in: DirectLimiter,
	bytes_out: DirectLimiter,
	/// Quotas the buckets were built from, to notice tenant updates
	built_from: (u32, u32, u32),
}

fn nz(n: u32) -> NonZeroU32 {
	NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

fn bucket(per_sec: u32) -> DirectLimiter {
	RateLimiter::direct(Quota::per_second(nz(per_sec)).allow_burst(nz(per_sec)))
}

impl Buckets {
	fn new(tenant: &Tenant) -> Self {
		Self {
			joins: bucket(tenant.max_joins_per_sec),
			events: bucket(tenant.max_events_per_sec),
			bytes_in: bucket(tenant.max_bytes_per_sec),
			// Outbound fan-out legitimately multiplies inbound volume
			bytes_out: bucket(tenant.max_bytes_per_sec.saturating_mul(50)),
			built_from: (
				tenant.max_joins_per_sec,
				tenant.max_events_per_sec,
				tenant.max_bytes_per_sec,
			),
		}
	}

	fn stale(&self, tenant: &Tenant) -> bool {
		self.built_from
			!= (tenant.max_joins_per_sec, tenant.max_events_per_sec, tenant.max_bytes_per_sec)
	}

	fn limiter(&self, resource: Resource) -> &DirectLimiter {
		match resource {
			Resource::Joins => &self.joins,
			Resource::Events => &self.events,
			Resource::BytesIn => &self.bytes_in,
			Resource::BytesOut => &self.bytes_out,
		}
	}
}

#[derive(Default)]
pub struct TenantRateLimiter {
	buckets: parking_lot::RwLock<HashMap<TenantId, Arc<Buckets>>>,
}

impl TenantRateLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Charge `n` units of `resource` against the tenant's bucket.
	pub fn check(&self, tenant: &Tenant, resource: Resource, n: u32) -> RmResult<()> {
		let buckets = self.buckets_for(tenant);
		let limiter = buckets.limiter(resource);
		let allowed = match NonZeroU32::new(n) {
			None => true,
			Some(n) => match limiter.check_n(n) {
				Ok(Ok(())) => true,
				Ok(Err(_)) => false,
				// A single charge larger than the whole bucket can never pass
				Err(_) => false,
			},
		};
		if allowed {
			Ok(())
		} else {
			Err(Error::RateLimited(resource.as_str().into()))
		}
	}

	pub fn drop_tenant(&self, tenant: &TenantId) {
		self.buckets.write().remove(tenant);
	}

	fn buckets_for(&self, tenant: &Tenant) -> Arc<Buckets> {
		{
			let buckets = self.buckets.read();
			if let Some(found) = buckets.get(&tenant.external_id) {
				if !found.stale(tenant) {
					return found.clone();
				}
			}
		}
		let mut buckets = self.buckets.write();
		let entry = buckets
			.entry(tenant.external_id.clone())
			.or_insert_with(|| Arc::new(Buckets::new(tenant)));
		if entry.stale(tenant) {
			*entry = Arc::new(Buckets::new(tenant));
		}
		entry.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn tenant(joins: u32, events: u32, bytes: u32) -> Tenant {
		Tenant {
			external_id: TenantId::new("acme"),
			jwt_secret: "secret".into(),
			jwt_jwks: None,
			jwt_claim_validators: HashMap::new(),
			max_concurrent_clients: 200,
			max_events_per_sec: events,
			max_joins_per_sec: joins,
			max_bytes_per_sec: bytes,
			max_channels_per_client: 100,
			suspended: false,
			persist_broadcasts: false,
			extensions: Vec::new(),
		}
	}

	#[test]
	fn test_joins_within_quota_pass() {
		let limiter = TenantRateLimiter::new();
		let tenant = tenant(10, 100, 1024);
		for _ in 0..10 {
			assert!(limiter.check(&tenant, Resource::Joins, 1).is_ok());
		}
		assert!(matches!(
			limiter.check(&tenant, Resource::Joins, 1),
			Err(Error::RateLimited(_))
		));
	}

	#[test]
	fn test_byte_charge_larger_than_bucket_rejected() {
		let limiter = TenantRateLimiter::new();
		let tenant = tenant(10, 100, 1024);
		assert!(limiter.check(&tenant, Resource::BytesIn, 100_000).is_err());
		// Small charges still pass afterwards
		assert!(limiter.check(&tenant, Resource::BytesIn, 10).is_ok());
	}

	#[test]
	fn test_bytes_out_quota_enforced() {
		let limiter = TenantRateLimiter::new();
		// bytes_out bucket holds 50x the inbound byte quota
		let tenant = tenant(10, 100, 10);
		assert!(limiter.check(&tenant, Resource::BytesOut, 400).is_ok());
		assert!(matches!(
			limiter.check(&tenant, Resource::BytesOut, 400),
			Err(Error::RateLimited(_))
		));
	}

	#[test]
	fn test_buckets_rebuilt_on_quota_change() {
		let limiter = TenantRateLimiter::new();
		let small = tenant(1, 100, 1024);
		assert!(limiter.check(&small, Resource::Joins, 1).is_ok());
		assert!(limiter.check(&small, Resource::Joins, 1).is_err());

		// Raising the quota takes effect immediately
		let bigger = tenant(100, 100, 1024);
		assert!(limiter.check(&bigger, Resource::Joins, 1).is_ok());
	}

	#[test]
	fn test_zero_charge_always_passes() {
		let limiter = TenantRateLimiter::new();
		let tenant = tenant(1, 1, 1);
		assert!(limiter.check(&tenant, Resource::Events, 0).is_ok());
	}
}

// vim: ts=4
