//! Per-tenant lifecycle.
//!
//! One supervisor per tenant per node, created lazily on first use. Starting
//! acquires the tenant database pool, runs pending schema migrations, starts
//! the CDC replicator when this node owns the tenant, and warms the
//! authorization store. Idle tenants drain after a timeout; ownership moves
//! drain just the replicator. Children hang off a cancellation token so
//! every exit path releases them.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cdc;
use crate::channel::message::OutboundQueue;
use crate::core::settings::{
	DRAIN_TIMEOUT, IDLE_SHUTDOWN_AFTER, REBALANCE_GRACE, TENANT_POOL_SIZE,
};
use crate::prelude::*;
use crate::session::protocol::CloseCode;
use crate::tenant::model::{CdcSettings, TenantRef};

const JANITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
	Idle,
	Starting,
	Ready,
	Draining,
	Stopped,
}

pub struct TenantSupervisor {
	pub tenant_id: TenantId,
	state: tokio::sync::Mutex<Phase>,
	phase: watch::Sender<Phase>,
	cancel: CancellationToken,
	pool: parking_lot::Mutex<Option<PgPool>>,
	replicator: parking_lot::Mutex<Option<CancellationToken>>,
	sessions: parking_lot::Mutex<HashMap<Uuid, OutboundQueue>>,
	last_activity: parking_lot::Mutex<Instant>,
	last_error: parking_lot::Mutex<Option<String>>,
}

impl TenantSupervisor {
	fn new(tenant_id: TenantId) -> Self {
		let (phase, _) = watch::channel(Phase::Idle);
		Self {
			tenant_id,
			state: tokio::sync::Mutex::new(Phase::Idle),
			phase,
			cancel: CancellationToken::new(),
			pool: parking_lot::Mutex::new(None),
			replicator: parking_lot::Mutex::new(None),
			sessions: parking_lot::Mutex::new(HashMap::new()),
			last_activity: parking_lot::Mutex::new(Instant::now()),
			last_error: parking_lot::Mutex::new(None),
		}
	}

	pub fn phase(&self) -> Phase {
		*self.phase.borrow()
	}

	pub fn pool(&self) -> Option<PgPool> {
		self.pool.lock().clone()
	}

	fn set_phase(&self, next: Phase) {
		let _ = self.phase.send_replace(next);
	}

	/// Wait for the supervisor to be Ready, starting it if necessary.
	/// Exactly one caller runs the start sequence; the rest wait on it.
	pub async fn ensure_started(self: &Arc<Self>, app: &App, tenant: &TenantRef) -> RmResult<()> {
		let mut phase_rx = self.phase.subscribe();
		loop {
			let mut state = self.state.lock().await;
			match *state {
				Phase::Ready => return Ok(()),
				Phase::Idle | Phase::Stopped => {
					// A drained supervisor's token tree is dead; the caller
					// gets a fresh instance from the map instead
					if self.cancel.is_cancelled() {
						return Err(Error::TenantUnavailable("tenant is restarting".into()));
					}
					*state = Phase::Starting;
					self.set_phase(Phase::Starting);
					drop(state);

					match self.start(app, tenant).await {
						Ok(()) => {
							*self.state.lock().await = Phase::Ready;
							self.set_phase(Phase::Ready);
							self.touch();
							info!("tenant {} ready", self.tenant_id);
							return Ok(());
						}
						Err(err) => {
							let reason = err.to_string();
							warn!("tenant {} failed to start: {}", self.tenant_id, reason);
							*self.last_error.lock() = Some(reason.clone());
							// No children are running yet, just let the pool go
							let pool = self.pool.lock().take();
							if let Some(pool) = pool {
								pool.close().await;
							}
							*self.state.lock().await = Phase::Stopped;
							self.set_phase(Phase::Stopped);
							return Err(Error::TenantUnavailable(reason));
						}
					}
				}
				Phase::Starting | Phase::Draining => {
					drop(state);
					if phase_rx.changed().await.is_err() {
						return Err(Error::TenantUnavailable("supervisor gone".into()));
					}
					let now = *phase_rx.borrow_and_update();
					if now == Phase::Stopped {
						if let Some(reason) = self.last_error.lock().clone() {
							return Err(Error::TenantUnavailable(reason));
						}
					}
					// Ready / Stopped without error: loop re-examines
				}
			}
		}
	}

	async fn start(self: &Arc<Self>, app: &App, tenant: &TenantRef) -> RmResult<()> {
		let cdc_settings = tenant.cdc_settings()?;

		if let Some(settings) = &cdc_settings {
			let pool = connect_tenant_db(settings)?;
			migrate(&pool).await?;
			app.authz.warm(&pool, &self.tenant_id).await?;
			*self.pool.lock() = Some(pool);

			if app.cluster.owns(&self.tenant_id) {
				self.start_replicator(app, settings.clone());
			}
		} else {
			debug!("tenant {} has no database extension", self.tenant_id);
		}

		self.spawn_janitor(app.clone());
		Ok(())
	}

	/// Start the CDC replicator child. No-op when one is already running or
	/// the tenant has no database.
	pub fn start_replicator(self: &Arc<Self>, app: &App, settings: CdcSettings) {
		let Some(pool) = self.pool() else { return };
		let mut replicator = self.replicator.lock();
		if replicator.is_some() {
			return;
		}
		let token = self.cancel.child_token();
		*replicator = Some(token.clone());
		drop(replicator);

		let app = app.clone();
		let tenant_id = self.tenant_id.clone();
		tokio::spawn(async move {
			cdc::replicator::run(app, tenant_id, settings, pool, token).await;
		});
	}

	/// Stop the replicator after the new owner reports ready (bounded by the
	/// rebalance grace period). Called when ownership moves away.
	pub fn stop_replicator_after_handover(self: &Arc<Self>, app: &App) {
		let Some(token) = self.replicator.lock().take() else { return };
		let supervisor = self.clone();
		let app = app.clone();
		tokio::spawn(async move {
			let ready = app
				.cluster
				.wait_replicator_ready(&supervisor.tenant_id, REBALANCE_GRACE)
				.await;
			if !ready {
				warn!(
					"no replicator-ready from new owner of {} within grace, stopping anyway",
					supervisor.tenant_id
				);
			}
			token.cancel();
		});
	}

	pub fn has_replicator(&self) -> bool {
		self.replicator.lock().is_some()
	}

	// Sessions //
	//**********//

	/// Register a live session, enforcing the tenant's concurrency cap.
	pub fn register_session(
		&self,
		tenant: &TenantRef,
		session: Uuid,
		queue: OutboundQueue,
	) -> RmResult<()> {
		let mut sessions = self.sessions.lock();
		if sessions.len() >= tenant.max_concurrent_clients as usize {
			return Err(Error::RateLimited("too many concurrent clients".into()));
		}
		sessions.insert(session, queue);
		drop(sessions);
		self.touch();
		Ok(())
	}

	pub fn unregister_session(&self, session: Uuid) {
		self.sessions.lock().remove(&session);
		self.touch();
	}

	pub fn session_count(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn touch(&self) {
		*self.last_activity.lock() = Instant::now();
	}

	// Drain //
	//*******//

	/// Close every session, stop children, release the pool.
	pub async fn drain(self: &Arc<Self>, app: &App, code: CloseCode) {
		{
			let mut state = self.state.lock().await;
			if matches!(*state, Phase::Draining | Phase::Stopped) {
				return;
			}
			*state = Phase::Draining;
		}
		self.set_phase(Phase::Draining);
		info!("draining tenant {}", self.tenant_id);

		if let Some(token) = self.replicator.lock().take() {
			token.cancel();
		}

		let queues: Vec<OutboundQueue> =
			self.sessions.lock().values().cloned().collect();
		for queue in queues {
			queue.force_close(code);
		}

		// Give sessions a bounded window to unwind themselves
		let deadline = Instant::now() + DRAIN_TIMEOUT;
		while self.session_count() > 0 && Instant::now() < deadline {
			tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		}
		if self.session_count() > 0 {
			warn!(
				"tenant {}: {} sessions survived the drain window",
				self.tenant_id,
				self.session_count()
			);
			self.sessions.lock().clear();
		}

		self.release_resources(app).await;
		*self.state.lock().await = Phase::Stopped;
		self.set_phase(Phase::Stopped);
		info!("tenant {} stopped", self.tenant_id);
	}

	async fn release_resources(&self, app: &App) {
		self.cancel.cancel();
		app.hub.drop_tenant(&self.tenant_id);
		app.limiter.drop_tenant(&self.tenant_id);
		let pool = self.pool.lock().take();
		if let Some(pool) = pool {
			pool.close().await;
		}
	}

	fn spawn_janitor(self: &Arc<Self>, app: App) {
		let supervisor = self.clone();
		let token = self.cancel.child_token();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(JANITOR_INTERVAL);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = interval.tick() => {}
					_ = token.cancelled() => return,
				}
				if supervisor.phase() != Phase::Ready {
					continue;
				}
				let idle = supervisor.session_count() == 0
					&& supervisor.last_activity.lock().elapsed() > IDLE_SHUTDOWN_AFTER;
				// Keep serving CDC for subscribers living on other nodes
				let needed_remotely = supervisor.has_replicator()
					&& app.cluster.has_tenant_interest(&supervisor.tenant_id);
				if idle && !needed_remotely {
					info!("tenant {} idle, shutting down", supervisor.tenant_id);
					supervisor.drain(&app, CloseCode::GoingAway).await;
					app.supervisors.remove(&supervisor.tenant_id).await;
					return;
				}
			}
		});
	}
}

/// All supervisors on this node. `start_if_needed` hands concurrent callers
/// the same instance.
#[derive(Default)]
pub struct SupervisorMap {
	map: tokio::sync::Mutex<HashMap<TenantId, Arc<TenantSupervisor>>>,
}

impl SupervisorMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn start_if_needed(
		&self,
		app: &App,
		tenant: &TenantRef,
	) -> RmResult<Arc<TenantSupervisor>> {
		let supervisor = {
			let mut map = self.map.lock().await;
			map.entry(tenant.external_id.clone())
				.or_insert_with(|| Arc::new(TenantSupervisor::new(tenant.external_id.clone())))
				.clone()
		};
		if let Err(err) = supervisor.ensure_started(app, tenant).await {
			// A stopped supervisor may hold a cancelled token tree; drop it
			// so the next attempt starts from a clean slate
			let mut map = self.map.lock().await;
			if let Some(current) = map.get(&tenant.external_id) {
				if Arc::ptr_eq(current, &supervisor) && supervisor.phase() == Phase::Stopped {
					map.remove(&tenant.external_id);
				}
			}
			return Err(err);
		}
		Ok(supervisor)
	}

	pub async fn get(&self, tenant: &TenantId) -> Option<Arc<TenantSupervisor>> {
		self.map.lock().await.get(tenant).cloned()
	}

	pub async fn remove(&self, tenant: &TenantId) {
		self.map.lock().await.remove(tenant);
	}

	pub async fn all(&self) -> Vec<Arc<TenantSupervisor>> {
		self.map.lock().await.values().cloned().collect()
	}

	/// Drain every tenant (process shutdown).
	pub async fn drain_all(&self, app: &App, code: CloseCode) {
		let supervisors = self.all().await;
		let mut tasks = Vec::with_capacity(supervisors.len());
		for supervisor in supervisors {
			let app = app.clone();
			tasks.push(tokio::spawn(async move {
				supervisor.drain(&app, code).await;
			}));
		}
		for task in tasks {
			let _ = task.await;
		}
		self.map.lock().await.clear();
	}
}

/// React to ring changes: start replicators we now own, hand over the ones
/// we lost. Spawned once at boot.
pub fn spawn_rebalancer(app: App) {
	let mut ring_rx = app.cluster.subscribe_ring();
	tokio::spawn(async move {
		loop {
			tokio::select! {
				changed = ring_rx.changed() => {
					if changed.is_err() {
						return;
					}
				}
				_ = app.shutdown.cancelled() => return,
			}
			for supervisor in app.supervisors.all().await {
				if supervisor.phase() != Phase::Ready {
					continue;
				}
				let owns = app.cluster.owns(&supervisor.tenant_id);
				if owns && !supervisor.has_replicator() {
					match app.tenants.lookup(&supervisor.tenant_id).await {
						Ok(tenant) => match tenant.cdc_settings() {
							Ok(Some(settings)) => {
								info!("gained ownership of {}", supervisor.tenant_id);
								supervisor.start_replicator(&app, settings);
							}
							Ok(None) => {}
							Err(err) => {
								warn!("cdc settings for {}: {}", supervisor.tenant_id, err)
							}
						},
						Err(err) => {
							warn!("rebalance lookup for {}: {}", supervisor.tenant_id, err)
						}
					}
				} else if !owns && supervisor.has_replicator() {
					info!("lost ownership of {}", supervisor.tenant_id);
					supervisor.stop_replicator_after_handover(&app);
				}
			}
		}
	});
}

fn connect_tenant_db(settings: &CdcSettings) -> RmResult<PgPool> {
	let options = PgConnectOptions::new()
		.host(&settings.db_host)
		.port(settings.db_port)
		.username(&settings.db_user)
		.password(&settings.db_password)
		.database(&settings.db_name);
	Ok(PgPoolOptions::new()
		.max_connections(TENANT_POOL_SIZE)
		.acquire_timeout(std::time::Duration::from_secs(10))
		.connect_lazy_with(options))
}

/// Idempotent tenant-side schema. The audit table doubles as the
/// authorization probe target; RLS stays enabled so tenant policies govern.
async fn migrate(pool: &PgPool) -> RmResult<()> {
	sqlx::query("CREATE SCHEMA IF NOT EXISTS realtime").execute(pool).await?;
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS realtime.messages ( \
			id bigint GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, \
			topic text NOT NULL, \
			extension text NOT NULL, \
			event text, \
			payload jsonb, \
			private boolean NOT NULL DEFAULT false, \
			inserted_at timestamptz NOT NULL DEFAULT now() \
		)",
	)
	.execute(pool)
	.await?;
	sqlx::query("ALTER TABLE realtime.messages ENABLE ROW LEVEL SECURITY")
		.execute(pool)
		.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS messages_topic_idx ON realtime.messages (topic)")
		.execute(pool)
		.await?;
	Ok(())
}

// vim: ts=4
