//! Relaymesh: a multi-tenant realtime broadcast server.
//!
//! Clients hold long-lived WebSocket connections and subscribe to
//! tenant-scoped topics; the server fans out broadcasts, presence and
//! Postgres row changes. Tenants are isolated end to end: configuration,
//! database pools, signing material, policies and in-memory topic state are
//! all keyed by tenant. Nodes discover each other over DNS; each tenant's
//! replication runs on exactly one node while clients connect anywhere.

pub mod auth;
pub mod cdc;
pub mod channel;
pub mod cluster;
pub mod core;
pub mod error;
pub mod http;
pub mod prelude;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod tenant;
pub mod types;

use crate::core::app::AppBuilder;
use crate::core::settings::Settings;
use crate::prelude::*;

/// Exit codes: 0 normal, 1 configuration, 2 control DB unreachable at boot,
/// 64+signo on signal termination.
pub async fn run_from_env() -> i32 {
	let mut builder = AppBuilder::new();

	let settings = match Settings::from_env() {
		Ok(settings) => settings,
		Err(err) => {
			error!("FATAL: {}", err);
			return 1;
		}
	};
	builder.settings(settings);

	match builder.run().await {
		Ok(code) => code,
		Err(Error::ServiceUnavailable(_)) | Err(Error::DbError) => 2,
		Err(err) => {
			error!("FATAL: {}", err);
			1
		}
	}
}

// vim: ts=4
