//! Reusable test fixtures and test data
//!
//! Shared sample payloads used across the integration tests, so every test
//! speaks the same wire shapes.

use serde_json::{json, Value};

use relaymesh::tenant::model::Tenant;
use relaymesh::types::TenantId;

/// A tenant with relaxed quotas, HS256 signing and no extensions.
pub fn sample_tenant(id: &str) -> Tenant {
	Tenant {
		external_id: TenantId::new(id),
		jwt_secret: "super-secret-signing-key".into(),
		jwt_jwks: None,
		jwt_claim_validators: Default::default(),
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

/// A join payload subscribing to broadcasts with self-delivery.
pub fn join_payload_self() -> Value {
	json!({
		"config": {
			"broadcast": { "self": true, "ack": true },
			"private": false
		}
	})
}

/// A join payload tracking presence under `key`.
pub fn join_payload_presence(key: &str) -> Value {
	json!({
		"config": {
			"presence": { "key": key }
		}
	})
}

/// A join payload subscribing to filtered INSERTs on public.pg_changes.
pub fn join_payload_changes(filter: &str) -> Value {
	json!({
		"config": {
			"postgres_changes": [
				{ "event": "INSERT", "schema": "public", "table": "pg_changes", "filter": filter }
			]
		}
	})
}

/// A wal2json v2 INSERT document for public.pg_changes with the given id.
pub fn wal2json_insert(id: i64) -> String {
	json!({
		"action": "I",
		"schema": "public",
		"table": "pg_changes",
		"columns": [
			{ "name": "id", "type": "integer", "value": id },
			{ "name": "body", "type": "text", "value": format!("row {}", id) }
		],
		"timestamp": "2026-03-01 12:00:00.000000+00"
	})
	.to_string()
}

// vim: ts=4
