//! Peer discovery: periodic DNS resolution plus gossip exchange.
//!
//! `DNS_NODES` names the cluster (e.g. a headless service); every poll
//! resolves it, gossips with each address, and rebuilds the ring from
//! whoever answered. Without `DNS_NODES` the node runs standalone.

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;

use crate::cluster::forward::{self, Interest};
use crate::core::settings::DNS_POLL_INTERVAL;
use crate::prelude::*;

fn create_resolver() -> TokioResolver {
	match TokioResolver::builder_tokio() {
		Ok(builder) => builder.build(),
		Err(err) => {
			warn!("system resolver unavailable ({}), falling back to defaults", err);
			TokioResolver::builder_with_config(
				ResolverConfig::default(),
				TokioConnectionProvider::default(),
			)
			.build()
		}
	}
}

/// Port peers are assumed to listen on: the same one we do.
fn listen_port(app: &App) -> u16 {
	app.settings
		.listen
		.rsplit_once(':')
		.and_then(|(_, port)| port.parse().ok())
		.unwrap_or(4000)
}

/// Spawn the discovery loop. Returns immediately; the loop runs until
/// process shutdown.
pub fn spawn(app: App) {
	let Some(dns_nodes) = app.settings.dns_nodes.clone() else {
		info!("DNS_NODES not set, running standalone");
		return;
	};
	let resolver = create_resolver();
	let port = listen_port(&app);

	tokio::spawn(async move {
		let mut interval = tokio::time::interval(DNS_POLL_INTERVAL);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = interval.tick() => {}
				_ = app.shutdown.cancelled() => return,
			}
			let epoch_before = *app.cluster.subscribe_ring().borrow();
			poll_once(&app, &resolver, &dns_nodes, port).await;
			app.cluster.prune_peers();
			let epoch_after = *app.cluster.subscribe_ring().borrow();
			if epoch_after != epoch_before {
				sync_presence(&app);
			}
		}
	});
}

async fn poll_once(app: &App, resolver: &TokioResolver, dns_nodes: &str, port: u16) {
	let addresses = match resolver.lookup_ip(dns_nodes).await {
		Ok(lookup) => lookup
			.iter()
			.map(|ip| match ip {
				std::net::IpAddr::V4(v4) => format!("http://{}:{}", v4, port),
				std::net::IpAddr::V6(v6) => format!("http://[{}]:{}", v6, port),
			})
			.collect::<Vec<_>>(),
		Err(err) => {
			warn!("peer discovery lookup failed for {}: {}", dns_nodes, err);
			return;
		}
	};

	let interest: Vec<Interest> = app
		.hub
		.interest()
		.into_iter()
		.map(|(tenant, topic)| Interest { tenant, topic })
		.collect();
	let msg = app.cluster.gossip_msg(interest);

	for address in addresses {
		if address.as_str() == &*app.settings.advertise {
			continue;
		}
		match app
			.cluster
			.exchange_json::<_, forward::GossipMsg>(&address, "/cluster/gossip", &msg)
			.await
		{
			Ok(reply) => {
				app.cluster.peer_seen(&reply.node, &reply.advertise, reply.interest, reply.delta);
			}
			Err(err) => {
				debug!("gossip with {} failed: {}", address, err);
			}
		}
	}
}

/// Push our presence state for every live topic to all peers. Run on
/// membership changes; merges are idempotent so over-sending is safe.
fn sync_presence(app: &App) {
	for (tenant, topic) in app.hub.interest() {
		let entries = app.hub.local_presence(&tenant, &topic);
		if entries.is_empty() {
			continue;
		}
		let joins: Vec<(Box<str>, Vec<forward::WireMeta>)> = entries
			.into_iter()
			.map(|(key, metas)| {
				(key, metas.into_iter().map(forward::WireMeta::from).collect())
			})
			.collect();
		let payload = forward::WirePresence { joins, leaves: Vec::new() };
		let envelope = app.cluster.envelope(
			&tenant,
			&topic,
			forward::FWD_PRESENCE_STATE,
			serde_json::to_value(&payload).unwrap_or_default(),
		);
		app.cluster.forward_all(envelope);
	}
}

// vim: ts=4
