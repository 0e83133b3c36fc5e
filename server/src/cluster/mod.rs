//! Cluster membership, tenant ownership and cross-node messaging.
//!
//! Clients may connect to any node; CDC replication for a tenant runs only
//! on its owner node (ring successor of the tenant hash). Peers are found by
//! resolving `DNS_NODES` and kept fresh by gossip.

pub mod discovery;
pub mod forward;
pub mod ring;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use crate::core::settings::{DEDUP_WINDOW, Settings};
use crate::prelude::*;
use forward::{Envelope, GossipMsg, Interest, InterestDelta};
use ring::{NodeId, Ring};

/// In-mesh request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// A peer missing from gossip for this long is dropped
const PEER_TTL: Duration = Duration::from_secs(15);

type HttpClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Clone, Debug)]
struct Peer {
	advertise: Box<str>,
	last_seen: Instant,
	interest: HashSet<Interest>,
}

pub struct Cluster {
	pub node_id: NodeId,
	advertise: Box<str>,
	client: HttpClient,
	ring: parking_lot::RwLock<Ring>,
	peers: parking_lot::RwLock<HashMap<NodeId, Peer>>,
	seq: AtomicU64,
	dedup: parking_lot::Mutex<HashMap<(NodeId, u64), Instant>>,
	ring_epoch: watch::Sender<u64>,
	ready: parking_lot::Mutex<HashMap<TenantId, Arc<Notify>>>,
}

impl Cluster {
	pub fn new(settings: &Settings) -> Self {
		let node_id = NodeId::new(format!("{}@{}", settings.app_name, settings.advertise));
		let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
		let (ring_epoch, _) = watch::channel(0);
		Self {
			node_id: node_id.clone(),
			advertise: settings.advertise.clone(),
			client,
			ring: parking_lot::RwLock::new(Ring::new(vec![node_id])),
			peers: parking_lot::RwLock::new(HashMap::new()),
			seq: AtomicU64::new(0),
			dedup: parking_lot::Mutex::new(HashMap::new()),
			ring_epoch,
			ready: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	// Ownership //
	//***********//

	pub fn owner(&self, tenant: &TenantId) -> Option<NodeId> {
		self.ring.read().owner(tenant).cloned()
	}

	/// Does this node own the tenant's singleton work (CDC)?
	pub fn owns(&self, tenant: &TenantId) -> bool {
		match self.owner(tenant) {
			Some(owner) => owner == self.node_id,
			None => true,
		}
	}

	/// Watch for membership changes; the value is an opaque epoch.
	pub fn subscribe_ring(&self) -> watch::Receiver<u64> {
		self.ring_epoch.subscribe()
	}

	pub fn members(&self) -> Vec<NodeId> {
		self.ring.read().members().to_vec()
	}

	// Peers //
	//*******//

	/// Record a peer heard from (gossip request or reply).
	pub fn peer_seen(
		&self,
		node: &NodeId,
		advertise: &str,
		interest: Option<Vec<Interest>>,
		delta: Option<InterestDelta>,
	) {
		if *node == self.node_id {
			return;
		}
		let mut peers = self.peers.write();
		let peer = peers.entry(node.clone()).or_insert_with(|| Peer {
			advertise: advertise.into(),
			last_seen: Instant::now(),
			interest: HashSet::new(),
		});
		peer.advertise = advertise.into();
		peer.last_seen = Instant::now();
		if let Some(interest) = interest {
			peer.interest = interest.into_iter().collect();
		}
		if let Some(delta) = delta {
			let entry = Interest { tenant: delta.tenant, topic: delta.topic };
			if delta.active {
				peer.interest.insert(entry);
			} else {
				peer.interest.remove(&entry);
			}
		}
		drop(peers);
		self.rebuild_ring();
	}

	/// Drop peers not heard from within the TTL. Returns true when
	/// membership changed.
	pub fn prune_peers(&self) -> bool {
		let mut peers = self.peers.write();
		let before = peers.len();
		peers.retain(|_, peer| peer.last_seen.elapsed() < PEER_TTL);
		let changed = peers.len() != before;
		drop(peers);
		if changed {
			self.rebuild_ring();
		}
		changed
	}

	fn rebuild_ring(&self) {
		let mut members: Vec<NodeId> = {
			let peers = self.peers.read();
			peers.keys().cloned().collect()
		};
		members.push(self.node_id.clone());
		members.sort();
		let current: Vec<NodeId> = self.ring.read().members().to_vec();
		if members != current {
			info!("cluster membership changed: {} nodes", members.len());
			*self.ring.write() = Ring::new(members);
			self.ring_epoch.send_modify(|epoch| *epoch += 1);
		}
	}

	fn peer_addresses(&self) -> Vec<(NodeId, Box<str>)> {
		self.peers
			.read()
			.iter()
			.map(|(node, peer)| (node.clone(), peer.advertise.clone()))
			.collect()
	}

	/// Does any peer have subscribers for this tenant?
	pub fn has_tenant_interest(&self, tenant: &TenantId) -> bool {
		self.peers
			.read()
			.values()
			.any(|peer| peer.interest.iter().any(|i| &i.tenant == tenant))
	}

	fn interested_peers(&self, tenant: &TenantId, topic: &str) -> Vec<(NodeId, Box<str>)> {
		let probe = Interest { tenant: tenant.clone(), topic: topic.into() };
		self.peers
			.read()
			.iter()
			.filter(|(_, peer)| peer.interest.contains(&probe))
			.map(|(node, peer)| (node.clone(), peer.advertise.clone()))
			.collect()
	}

	// Forwarding //
	//************//

	pub fn next_seq(&self) -> u64 {
		self.seq.fetch_add(1, Ordering::Relaxed) + 1
	}

	pub fn envelope(&self, tenant: &TenantId, topic: &str, event: &str, payload: serde_json::Value) -> Envelope {
		Envelope {
			tenant: tenant.clone(),
			topic: topic.into(),
			event: event.into(),
			payload,
			origin_node: self.node_id.clone(),
			origin_seq: self.next_seq(),
		}
	}

	/// Unicast an envelope to every peer with subscribers for its topic.
	/// Best effort: failures are logged and dropped.
	pub fn forward(self: &Arc<Self>, envelope: Envelope) -> usize {
		let targets = self.interested_peers(&envelope.tenant, &envelope.topic);
		let count = targets.len();
		for (node, advertise) in targets {
			let cluster = self.clone();
			let envelope = envelope.clone();
			tokio::spawn(async move {
				if let Err(err) =
					cluster.post_json(&advertise, "/cluster/forward", &envelope).await
				{
					debug!("forward to {} failed: {}", node, err);
				}
			});
		}
		count
	}

	/// Unicast an envelope to every peer with subscribers for any topic of
	/// the tenant (CDC fan-out: table-to-topic routing happens over there).
	pub fn forward_tenant(self: &Arc<Self>, tenant: &TenantId, envelope: Envelope) {
		let targets: Vec<(NodeId, Box<str>)> = self
			.peers
			.read()
			.iter()
			.filter(|(_, peer)| peer.interest.iter().any(|i| &i.tenant == tenant))
			.map(|(node, peer)| (node.clone(), peer.advertise.clone()))
			.collect();
		for (node, advertise) in targets {
			let cluster = self.clone();
			let envelope = envelope.clone();
			tokio::spawn(async move {
				if let Err(err) =
					cluster.post_json(&advertise, "/cluster/forward", &envelope).await
				{
					debug!("forward to {} failed: {}", node, err);
				}
			});
		}
	}

	/// Send an envelope to every peer regardless of interest (presence sync
	/// on membership change).
	pub fn forward_all(self: &Arc<Self>, envelope: Envelope) {
		for (node, advertise) in self.peer_addresses() {
			let cluster = self.clone();
			let envelope = envelope.clone();
			tokio::spawn(async move {
				if let Err(err) =
					cluster.post_json(&advertise, "/cluster/forward", &envelope).await
				{
					debug!("forward to {} failed: {}", node, err);
				}
			});
		}
	}

	/// Duplicate suppression for received envelopes. True = fresh.
	pub fn accept(&self, envelope: &Envelope) -> bool {
		if envelope.origin_node == self.node_id {
			return false;
		}
		let mut dedup = self.dedup.lock();
		let now = Instant::now();
		dedup.retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
		match dedup.insert((envelope.origin_node.clone(), envelope.origin_seq), now) {
			Some(_) => false,
			None => true,
		}
	}

	// Interest + lifecycle fan-out //
	//******************************//

	/// Tell every peer this node gained or lost subscribers for a topic.
	pub fn announce_interest(self: &Arc<Self>, tenant: &TenantId, topic: &str, active: bool) {
		let msg = GossipMsg {
			node: self.node_id.clone(),
			advertise: self.advertise.clone(),
			interest: None,
			delta: Some(InterestDelta { tenant: tenant.clone(), topic: topic.into(), active }),
		};
		for (node, advertise) in self.peer_addresses() {
			let cluster = self.clone();
			let msg = msg.clone();
			tokio::spawn(async move {
				if let Err(err) = cluster.post_json(&advertise, "/cluster/gossip", &msg).await {
					debug!("interest update to {} failed: {}", node, err);
				}
			});
		}
	}

	/// Broadcast a tenant cache invalidation. Best effort; TTL is the net.
	pub fn broadcast_invalidate(self: &Arc<Self>, tenant: &TenantId) {
		let msg = forward::Invalidate { tenant: tenant.clone() };
		for (node, advertise) in self.peer_addresses() {
			let cluster = self.clone();
			let msg = msg.clone();
			tokio::spawn(async move {
				if let Err(err) =
					cluster.post_json(&advertise, "/cluster/invalidate", &msg).await
				{
					debug!("invalidate fan-out to {} failed: {}", node, err);
				}
			});
		}
	}

	/// Announce that this node's replicator for `tenant` is consuming.
	pub fn announce_replicator_ready(self: &Arc<Self>, tenant: &TenantId) {
		let msg = forward::ReplicatorReady { tenant: tenant.clone(), node: self.node_id.clone() };
		for (node, advertise) in self.peer_addresses() {
			let cluster = self.clone();
			let msg = msg.clone();
			tokio::spawn(async move {
				if let Err(err) =
					cluster.post_json(&advertise, "/cluster/replicator-ready", &msg).await
				{
					debug!("replicator-ready to {} failed: {}", node, err);
				}
			});
		}
	}

	/// Block until a peer reports its replicator ready for `tenant`, or the
	/// grace period elapses.
	pub async fn wait_replicator_ready(&self, tenant: &TenantId, grace: Duration) -> bool {
		let notify = {
			let mut ready = self.ready.lock();
			ready.entry(tenant.clone()).or_insert_with(|| Arc::new(Notify::new())).clone()
		};
		let ok = timeout(grace, notify.notified()).await.is_ok();
		self.ready.lock().remove(tenant);
		ok
	}

	pub fn signal_replicator_ready(&self, tenant: &TenantId) {
		if let Some(notify) = self.ready.lock().get(tenant) {
			notify.notify_waiters();
		}
	}

	// HTTP plumbing //
	//***************//

	/// Execute an in-mesh POST with timeout, ignoring the response body.
	pub async fn post_json<T: Serialize>(
		&self,
		advertise: &str,
		path: &str,
		body: &T,
	) -> RmResult<()> {
		let req = hyper::Request::builder()
			.method(hyper::Method::POST)
			.uri(format!("{}{}", advertise, path))
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(serde_json::to_vec(body)?)))?;
		let res = timeout(REQUEST_TIMEOUT, self.client.request(req))
			.await
			.map_err(|_| Error::Timeout)??;
		if !res.status().is_success() {
			return Err(Error::NetworkError(format!("peer returned {}", res.status())));
		}
		Ok(())
	}

	/// Execute an in-mesh POST and decode the JSON reply.
	pub async fn exchange_json<T: Serialize, R: DeserializeOwned>(
		&self,
		advertise: &str,
		path: &str,
		body: &T,
	) -> RmResult<R> {
		let req = hyper::Request::builder()
			.method(hyper::Method::POST)
			.uri(format!("{}{}", advertise, path))
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(serde_json::to_vec(body)?)))?;
		let res = timeout(REQUEST_TIMEOUT, self.client.request(req))
			.await
			.map_err(|_| Error::Timeout)??;
		if !res.status().is_success() {
			return Err(Error::NetworkError(format!("peer returned {}", res.status())));
		}
		let bytes = timeout(REQUEST_TIMEOUT, res.into_body().collect())
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|_| Error::NetworkError("body collection error".into()))?
			.to_bytes();
		Ok(serde_json::from_slice(&bytes)?)
	}

	/// Full local gossip message (the interest list comes from the hub).
	pub fn gossip_msg(&self, interest: Vec<Interest>) -> GossipMsg {
		GossipMsg {
			node: self.node_id.clone(),
			advertise: self.advertise.clone(),
			interest: Some(interest),
			delta: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn settings() -> Settings {
		Settings {
			listen: "127.0.0.1:4000".into(),
			app_name: "relaymesh".into(),
			dns_nodes: None,
			advertise: "http://127.0.0.1:4000".into(),
			db_host: "localhost".into(),
			db_port: 5432,
			db_user: "postgres".into(),
			db_password: "postgres".into(),
			db_name: "relaymesh".into(),
			secret_key_base: "secret".into(),
			secure_channels: false,
			jwt_claim_validators: Default::default(),
			poll_interval: Duration::from_millis(100),
			poll_max_record_bytes: 1024 * 1024,
			rate_cooldown_secs: 3,
		}
	}

	#[test]
	fn test_single_node_owns_all() {
		let cluster = Cluster::new(&settings());
		assert!(cluster.owns(&TenantId::new("acme")));
	}

	#[test]
	fn test_peer_seen_changes_membership() {
		let cluster = Cluster::new(&settings());
		let mut rx = cluster.subscribe_ring();
		assert_eq!(*rx.borrow_and_update(), 0);

		cluster.peer_seen(
			&NodeId::new("relaymesh@http://10.0.0.2:4000"),
			"http://10.0.0.2:4000",
			Some(Vec::new()),
			None,
		);
		assert_eq!(cluster.members().len(), 2);
		assert!(rx.has_changed().unwrap());
	}

	#[test]
	fn test_self_gossip_ignored() {
		let cluster = Cluster::new(&settings());
		let self_id = cluster.node_id.clone();
		cluster.peer_seen(&self_id, "http://127.0.0.1:4000", None, None);
		assert_eq!(cluster.members().len(), 1);
	}

	#[test]
	fn test_interest_delta_tracking() {
		let cluster = Cluster::new(&settings());
		let peer = NodeId::new("relaymesh@http://10.0.0.2:4000");
		let tenant = TenantId::new("acme");
		cluster.peer_seen(&peer, "http://10.0.0.2:4000", Some(Vec::new()), None);
		assert!(cluster.interested_peers(&tenant, "topic:X").is_empty());

		cluster.peer_seen(
			&peer,
			"http://10.0.0.2:4000",
			None,
			Some(InterestDelta { tenant: tenant.clone(), topic: "topic:X".into(), active: true }),
		);
		assert_eq!(cluster.interested_peers(&tenant, "topic:X").len(), 1);

		cluster.peer_seen(
			&peer,
			"http://10.0.0.2:4000",
			None,
			Some(InterestDelta { tenant: tenant.clone(), topic: "topic:X".into(), active: false }),
		);
		assert!(cluster.interested_peers(&tenant, "topic:X").is_empty());
	}

	#[test]
	fn test_duplicate_envelopes_rejected() {
		let cluster = Cluster::new(&settings());
		let envelope = Envelope {
			tenant: TenantId::new("acme"),
			topic: "topic:X".into(),
			event: forward::FWD_BROADCAST.into(),
			payload: json!({}),
			origin_node: NodeId::new("relaymesh@http://10.0.0.2:4000"),
			origin_seq: 1,
		};
		assert!(cluster.accept(&envelope));
		assert!(!cluster.accept(&envelope));
	}

	#[test]
	fn test_own_envelopes_rejected() {
		let cluster = Cluster::new(&settings());
		let envelope = Envelope {
			tenant: TenantId::new("acme"),
			topic: "topic:X".into(),
			event: forward::FWD_BROADCAST.into(),
			payload: json!({}),
			origin_node: cluster.node_id.clone(),
			origin_seq: 1,
		};
		assert!(!cluster.accept(&envelope));
	}
}

// vim: ts=4
