//! Process-wide configuration, read from the environment at boot.
//!
//! Anything invalid here is a fatal config error: the process must not come
//! up half-configured. Per-tenant quotas live on the tenant record instead.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{Error, RmResult};

/// Registry cache TTL
pub const TENANT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Authorization decision cache TTL
pub const AUTHZ_CACHE_TTL: Duration = Duration::from_secs(120);
/// Per-tenant database pool size
pub const TENANT_POOL_SIZE: u32 = 3;
/// Tenant node is drained after this long without sessions
pub const IDLE_SHUTDOWN_AFTER: Duration = Duration::from_secs(300);
/// Client heartbeat interval; absence for twice this closes the socket
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Outbound queue bounds per subscriber
pub const OUTBOUND_QUEUE_MSGS: usize = 1000;
pub const OUTBOUND_QUEUE_BYTES: usize = 1024 * 1024;
/// Old CDC owner waits this long for the new owner before stopping
pub const REBALANCE_GRACE: Duration = Duration::from_secs(10);
/// Tenant drain waits this long before forcing termination
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Cross-node duplicate suppression window
pub const DEDUP_WINDOW: Duration = Duration::from_secs(10);
/// Peer discovery poll cadence
pub const DNS_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct Settings {
	/// WebSocket / API listen address
	pub listen: Box<str>,
	/// Node basename used in cluster node ids
	pub app_name: Box<str>,
	/// DNS name resolved periodically to discover peers; empty = single node
	pub dns_nodes: Option<Box<str>>,
	/// Address peers use to reach this node; defaults to `http://<listen>`
	pub advertise: Box<str>,

	// Control database
	pub db_host: Box<str>,
	pub db_port: u16,
	pub db_user: Box<str>,
	pub db_password: Box<str>,
	pub db_name: Box<str>,

	/// Signed-cookie / fallback signing secret
	pub secret_key_base: Box<str>,
	/// Force `private` authorization on every topic
	pub secure_channels: bool,
	/// Process-wide claim validators, merged under each tenant's own
	pub jwt_claim_validators: HashMap<Box<str>, serde_json::Value>,

	// CDC defaults (per-tenant settings override)
	pub poll_interval: Duration,
	pub poll_max_record_bytes: usize,

	/// Consecutive limited seconds before a cool-down close
	pub rate_cooldown_secs: u32,
}

fn required(name: &str) -> RmResult<Box<str>> {
	env::var(name)
		.map(Into::into)
		.map_err(|_| Error::ConfigError(format!("missing environment variable {}", name)))
}

fn optional(name: &str) -> Option<Box<str>> {
	env::var(name).ok().filter(|v| !v.is_empty()).map(Into::into)
}

fn parse_num<T: std::str::FromStr>(name: &str, default: T) -> RmResult<T> {
	match env::var(name) {
		Ok(v) => v
			.parse()
			.map_err(|_| Error::ConfigError(format!("invalid value for {}: {}", name, v))),
		Err(_) => Ok(default),
	}
}

impl Settings {
	pub fn from_env() -> RmResult<Settings> {
		let listen: Box<str> = optional("LISTEN").unwrap_or_else(|| "0.0.0.0:4000".into());
		let advertise =
			optional("ADVERTISE_ADDR").unwrap_or_else(|| format!("http://{}", listen).into());

		// JWT_CLAIM_VALIDATORS is a JSON object of claim -> expected literal.
		// Invalid JSON here is fatal.
		let jwt_claim_validators = match optional("JWT_CLAIM_VALIDATORS") {
			Some(raw) => serde_json::from_str::<HashMap<Box<str>, serde_json::Value>>(&raw)
				.map_err(|err| {
					Error::ConfigError(format!("invalid JWT_CLAIM_VALIDATORS: {}", err))
				})?,
			None => HashMap::new(),
		};

		Ok(Settings {
			listen,
			app_name: optional("APP_NAME").unwrap_or_else(|| "relaymesh".into()),
			dns_nodes: optional("DNS_NODES"),
			advertise,
			db_host: required("DB_HOST")?,
			db_port: parse_num("DB_PORT", 5432u16)?,
			db_user: required("DB_USER")?,
			db_password: required("DB_PASSWORD")?,
			db_name: required("DB_NAME")?,
			secret_key_base: required("SECRET_KEY_BASE")?,
			secure_channels: optional("SECURE_CHANNELS").is_some_and(|v| &*v == "true" || &*v == "1"),
			jwt_claim_validators,
			poll_interval: Duration::from_millis(parse_num("POLL_INTERVAL_MS", 100u64)?),
			poll_max_record_bytes: parse_num("POLL_MAX_RECORD_BYTES", 1024 * 1024usize)?,
			rate_cooldown_secs: parse_num("RATE_COOLDOWN_SECS", 3u32)?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_claim_validator_parsing() {
		let raw = r#"{"iss": "relaymesh", "aud": "clients"}"#;
		let parsed: HashMap<Box<str>, serde_json::Value> = serde_json::from_str(raw).unwrap();
		assert_eq!(parsed.get("iss").and_then(|v| v.as_str()), Some("relaymesh"));
		assert_eq!(parsed.len(), 2);
	}

	#[test]
	fn test_invalid_claim_validators_is_error() {
		let raw = "{not json";
		let parsed = serde_json::from_str::<HashMap<Box<str>, serde_json::Value>>(raw);
		assert!(parsed.is_err());
	}
}

// vim: ts=4
