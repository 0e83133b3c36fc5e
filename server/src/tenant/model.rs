//! Tenant entities and their validation.
//!
//! Tenants are created and mutated by an external control plane; this server
//! only reads them. Validation still runs on every row we load so a corrupt
//! control row degrades one tenant instead of the process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, RmResult};
use crate::types::TenantId;

pub const CDC_EXTENSION: &str = "postgres_cdc_rls";
pub const DEFAULT_PUBLICATION: &str = "supabase_realtime";

/// Connection settings for a tenant's CDC extension.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdcSettings {
	pub db_host: Box<str>,
	#[serde(default = "default_db_port")]
	pub db_port: u16,
	pub db_name: Box<str>,
	pub db_user: Box<str>,
	pub db_password: Box<str>,
	#[serde(default)]
	pub slot_name: Option<Box<str>>,
	#[serde(default = "default_publication")]
	pub publication: Box<str>,
	#[serde(default)]
	pub poll_interval_ms: Option<u64>,
	#[serde(default)]
	pub poll_max_record_bytes: Option<usize>,
}

fn default_db_port() -> u16 {
	5432
}

fn default_publication() -> Box<str> {
	DEFAULT_PUBLICATION.into()
}

impl CdcSettings {
	/// Slot names default to the tenant id with non-identifier chars folded.
	pub fn slot_for(&self, tenant: &TenantId) -> Box<str> {
		match &self.slot_name {
			Some(name) => name.clone(),
			None => {
				let folded: String = tenant
					.as_str()
					.chars()
					.map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
					.collect();
				format!("realtime_{}", folded).into()
			}
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Extension {
	pub kind: Box<str>,
	pub settings: serde_json::Value,
}

/// A tenant record as cached in process.
#[derive(Clone, Debug)]
pub struct Tenant {
	pub external_id: TenantId,
	pub jwt_secret: Box<str>,
	pub jwt_jwks: Option<Box<str>>,
	pub jwt_claim_validators: HashMap<Box<str>, serde_json::Value>,
	pub max_concurrent_clients: u32,
	pub max_events_per_sec: u32,
	pub max_joins_per_sec: u32,
	pub max_bytes_per_sec: u32,
	pub max_channels_per_client: u32,
	pub suspended: bool,
	pub persist_broadcasts: bool,
	pub extensions: Vec<Extension>,
}

pub type TenantRef = Arc<Tenant>;

impl Tenant {
	/// The tenant's CDC settings, if the extension is configured.
	pub fn cdc_settings(&self) -> RmResult<Option<CdcSettings>> {
		let Some(ext) = self.extensions.iter().find(|e| &*e.kind == CDC_EXTENSION) else {
			return Ok(None);
		};
		let settings: CdcSettings = serde_json::from_value(ext.settings.clone())
			.map_err(|err| Error::ValidationError(format!("cdc settings: {}", err)))?;
		Ok(Some(settings))
	}

	pub fn validate(&self) -> RmResult<()> {
		let id = self.external_id.as_str();
		if id.is_empty() || id.len() > 255 {
			return Err(Error::ValidationError("external_id length".into()));
		}
		if !id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
			return Err(Error::ValidationError(format!("external_id charset: {}", id)));
		}
		if self.jwt_secret.is_empty() && self.jwt_jwks.is_none() {
			return Err(Error::ValidationError("tenant has neither jwt_secret nor jwks".into()));
		}
		if self.max_concurrent_clients == 0
			|| self.max_events_per_sec == 0
			|| self.max_joins_per_sec == 0
		{
			return Err(Error::ValidationError("tenant quotas must be positive".into()));
		}
		let cdc_count = self.extensions.iter().filter(|e| &*e.kind == CDC_EXTENSION).count();
		if cdc_count > 1 {
			return Err(Error::ValidationError("more than one postgres_cdc_rls extension".into()));
		}
		// Parse eagerly so a broken extension fails the row, not the replicator
		self.cdc_settings()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn tenant(id: &str) -> Tenant {
		Tenant {
			external_id: TenantId::new(id),
			jwt_secret: "secret".into(),
			jwt_jwks: None,
			jwt_claim_validators: HashMap::new(),
			max_concurrent_clients: 200,
			max_events_per_sec: 100,
			max_joins_per_sec: 100,
			max_bytes_per_sec: 100 * 1024,
			max_channels_per_client: 100,
			suspended: false,
			persist_broadcasts: false,
			extensions: Vec::new(),
		}
	}

	#[test]
	fn test_valid_tenant() {
		assert!(tenant("acme-1").validate().is_ok());
	}

	#[test]
	fn test_invalid_external_id() {
		assert!(tenant("").validate().is_err());
		assert!(tenant("Upper").validate().is_err());
		assert!(tenant("with space").validate().is_err());
	}

	#[test]
	fn test_missing_signing_material() {
		let mut t = tenant("acme");
		t.jwt_secret = "".into();
		assert!(t.validate().is_err());
		t.jwt_jwks = Some("{\"keys\":[]}".into());
		assert!(t.validate().is_ok());
	}

	#[test]
	fn test_single_cdc_extension() {
		let ext = Extension {
			kind: CDC_EXTENSION.into(),
			settings: json!({
				"db_host": "db", "db_name": "app", "db_user": "rt", "db_password": "pw"
			}),
		};
		let mut t = tenant("acme");
		t.extensions.push(ext.clone());
		assert!(t.validate().is_ok());
		t.extensions.push(ext);
		assert!(t.validate().is_err());
	}

	#[test]
	fn test_slot_name_folding() {
		let t = tenant("acme-prod");
		let settings: CdcSettings = serde_json::from_value(json!({
			"db_host": "db", "db_name": "app", "db_user": "rt", "db_password": "pw"
		}))
		.unwrap();
		assert_eq!(&*settings.slot_for(&t.external_id), "realtime_acme_prod");
	}
}

// vim: ts=4
