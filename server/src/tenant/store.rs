//! Control-database reads for tenant records.
//!
//! Schema: `tenants` holds one row per tenant, `extensions` one row per
//! configured extension with JSON settings.

use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::prelude::*;
use crate::tenant::model::{Extension, Tenant};

/// Read a single tenant with its extensions by external id.
pub(crate) async fn read(db: &PgPool, id: &TenantId) -> RmResult<Tenant> {
	let res = sqlx::query(
		"SELECT external_id, jwt_secret, jwt_jwks, jwt_claim_validators, \
		 max_concurrent_clients, max_events_per_sec, max_joins_per_sec, \
		 max_bytes_per_sec, max_channels_per_client, suspended, persist_broadcasts \
		 FROM tenants WHERE external_id = $1",
	)
	.bind(id.as_str())
	.fetch_one(db)
	.await;

	let row = match res {
		Err(sqlx::Error::RowNotFound) => return Err(Error::TenantNotFound(id.to_string())),
		Err(err) => {
			warn!("control db: {:#?}", err);
			return Err(Error::DbError);
		}
		Ok(row) => row,
	};

	let validators: Option<serde_json::Value> =
		row.try_get("jwt_claim_validators").or(Err(Error::DbError))?;
	let jwt_claim_validators: HashMap<Box<str>, serde_json::Value> = match validators {
		Some(value) => serde_json::from_value(value)
			.map_err(|_| Error::ValidationError(format!("claim validators for {}", id)))?,
		None => HashMap::new(),
	};

	let mut tenant = Tenant {
		external_id: id.clone(),
		jwt_secret: row
			.try_get::<String, _>("jwt_secret")
			.map(Into::into)
			.or(Err(Error::DbError))?,
		jwt_jwks: row
			.try_get::<Option<String>, _>("jwt_jwks")
			.or(Err(Error::DbError))?
			.map(Into::into),
		jwt_claim_validators,
		max_concurrent_clients: row.try_get::<i32, _>("max_concurrent_clients").or(Err(Error::DbError))? as u32,
		max_events_per_sec: row.try_get::<i32, _>("max_events_per_sec").or(Err(Error::DbError))? as u32,
		max_joins_per_sec: row.try_get::<i32, _>("max_joins_per_sec").or(Err(Error::DbError))? as u32,
		max_bytes_per_sec: row.try_get::<i32, _>("max_bytes_per_sec").or(Err(Error::DbError))? as u32,
		max_channels_per_client: row.try_get::<i32, _>("max_channels_per_client").or(Err(Error::DbError))? as u32,
		suspended: row.try_get("suspended").or(Err(Error::DbError))?,
		persist_broadcasts: row.try_get("persist_broadcasts").or(Err(Error::DbError))?,
		extensions: Vec::new(),
	};

	tenant.extensions = read_extensions(db, id).await?;
	tenant.validate()?;
	Ok(tenant)
}

async fn read_extensions(db: &PgPool, id: &TenantId) -> RmResult<Vec<Extension>> {
	let rows = sqlx::query(
		"SELECT type, settings FROM extensions WHERE tenant_external_id = $1 ORDER BY type",
	)
	.bind(id.as_str())
	.fetch_all(db)
	.await
	.inspect_err(|err| warn!("control db: {:#?}", err))
	.map_err(|_| Error::DbError)?;

	rows.into_iter()
		.map(|row| {
			Ok(Extension {
				kind: row
					.try_get::<String, _>("type")
					.map(Into::into)
					.or(Err(Error::DbError))?,
				settings: row.try_get("settings").or(Err(Error::DbError))?,
			})
		})
		.collect()
}

/// List every known external id. Used by refresh_all.
pub(crate) async fn list_ids(db: &PgPool) -> RmResult<Vec<TenantId>> {
	let rows = sqlx::query("SELECT external_id FROM tenants ORDER BY external_id")
		.fetch_all(db)
		.await
		.inspect_err(|err| warn!("control db: {:#?}", err))
		.map_err(|_| Error::DbError)?;

	rows.into_iter()
		.map(|row| {
			let id: String = row.try_get("external_id").or(Err(Error::DbError))?;
			Ok(TenantId::new(id))
		})
		.collect()
}

// vim: ts=4
