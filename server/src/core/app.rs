//! App state type and process lifecycle.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::jwt::JwtVerifier;
use crate::auth::policy::PolicyStore;
use crate::cdc::visibility::VisibilityCache;
use crate::channel::ChannelHub;
use crate::cluster::{discovery, Cluster};
use crate::core::metrics::Metrics;
use crate::core::settings::Settings;
use crate::prelude::*;
use crate::rate_limit::TenantRateLimiter;
use crate::routes;
use crate::session::protocol::CloseCode;
use crate::tenant::registry::TenantRegistry;
use crate::tenant::supervisor::{self, SupervisorMap};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
	pub settings: Settings,
	pub control_db: PgPool,
	pub tenants: TenantRegistry,
	pub supervisors: SupervisorMap,
	pub hub: ChannelHub,
	pub cluster: Arc<Cluster>,
	pub verifier: JwtVerifier,
	pub authz: PolicyStore,
	pub visibility: VisibilityCache,
	pub limiter: TenantRateLimiter,
	pub metrics: Metrics,
	pub shutdown: CancellationToken,
}

pub type App = Arc<AppState>;

pub struct AppBuilder {
	settings: Option<Settings>,
}

impl AppBuilder {
	pub fn new() -> Self {
		tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_target(false)
			.init();
		AppBuilder { settings: None }
	}

	pub fn settings(&mut self, settings: Settings) -> &mut Self {
		self.settings = Some(settings);
		self
	}

	/// Boot the node and serve until a shutdown signal. Returns the process
	/// exit code.
	pub async fn run(self) -> RmResult<i32> {
		let Some(settings) = self.settings else {
			return Err(Error::ConfigError("no settings provided".into()));
		};
		info!("relaymesh v{} starting on {}", VERSION, settings.listen);

		let control_db = connect_control_db(&settings).await.map_err(|err| {
			error!("FATAL: control database unreachable: {}", err);
			Error::ServiceUnavailable("control database unreachable".into())
		})?;

		let shutdown = CancellationToken::new();
		let app: App = Arc::new(AppState {
			tenants: TenantRegistry::new(control_db.clone()),
			supervisors: SupervisorMap::new(),
			hub: ChannelHub::new(),
			cluster: Arc::new(Cluster::new(&settings)),
			verifier: JwtVerifier::new(settings.jwt_claim_validators.clone()),
			authz: PolicyStore::new(),
			visibility: VisibilityCache::new(),
			limiter: TenantRateLimiter::new(),
			metrics: Metrics::new(),
			shutdown: shutdown.clone(),
			control_db,
			settings,
		});

		// Background machinery
		discovery::spawn(app.clone());
		supervisor::spawn_rebalancer(app.clone());

		// Signal handling: remember which signal asked us to stop
		let signal_code = Arc::new(AtomicI32::new(0));
		spawn_signal_handler(shutdown.clone(), signal_code.clone());

		let router = routes::init(app.clone());
		let listener =
			tokio::net::TcpListener::bind(app.settings.listen.as_ref()).await.map_err(|err| {
				error!("FATAL: cannot bind {}: {}", app.settings.listen, err);
				Error::ConfigError(format!("cannot bind {}", app.settings.listen))
			})?;
		info!("listening on {}", app.settings.listen);

		let serve_shutdown = shutdown.clone();
		axum::serve(listener, router)
			.with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
			.await?;

		info!("draining {} tenants", app.supervisors.all().await.len());
		app.supervisors.drain_all(&app, CloseCode::GoingAway).await;

		match signal_code.load(Ordering::Relaxed) {
			0 => Ok(0),
			sig => Ok(64 + sig),
		}
	}
}

impl Default for AppBuilder {
	fn default() -> Self {
		Self::new()
	}
}

async fn connect_control_db(settings: &Settings) -> Result<PgPool, sqlx::Error> {
	let options = PgConnectOptions::new()
		.host(&settings.db_host)
		.port(settings.db_port)
		.username(&settings.db_user)
		.password(&settings.db_password)
		.database(&settings.db_name);
	PgPoolOptions::new()
		.max_connections(5)
		.acquire_timeout(std::time::Duration::from_secs(10))
		.connect_with(options)
		.await
}

fn spawn_signal_handler(shutdown: CancellationToken, signal_code: Arc<AtomicI32>) {
	tokio::spawn(async move {
		let sig = wait_for_signal().await;
		info!("received signal {}, shutting down", sig);
		signal_code.store(sig, Ordering::Relaxed);
		shutdown.cancel();
	});
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
	use tokio::signal::unix::{signal, SignalKind};
	let mut term = match signal(SignalKind::terminate()) {
		Ok(term) => term,
		Err(err) => {
			error!("cannot install SIGTERM handler: {}", err);
			std::future::pending::<()>().await;
			unreachable!()
		}
	};
	let mut int = match signal(SignalKind::interrupt()) {
		Ok(int) => int,
		Err(err) => {
			error!("cannot install SIGINT handler: {}", err);
			std::future::pending::<()>().await;
			unreachable!()
		}
	};
	tokio::select! {
		_ = term.recv() => libc_signal::SIGTERM,
		_ = int.recv() => libc_signal::SIGINT,
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
	let _ = tokio::signal::ctrl_c().await;
	libc_signal::SIGINT
}

/// Signal numbers we report in the exit code; kept local to avoid a libc
/// dependency for two constants.
mod libc_signal {
	pub const SIGINT: i32 = 2;
	pub const SIGTERM: i32 = 15;
}

// vim: ts=4
