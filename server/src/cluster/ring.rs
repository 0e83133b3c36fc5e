//! Consistent-hash ring mapping tenants to owner nodes.
//!
//! Each member contributes a fixed number of virtual points; a tenant's
//! owner is the successor of its hash on the ring. Membership changes move
//! only the tenants whose arc changed hands.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::types::TenantId;

pub const VNODES_PER_NODE: usize = 64;

/// Cluster node identity: `<app_name>@<advertised address>`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct NodeId(pub Box<str>);

impl NodeId {
	pub fn new(id: impl AsRef<str>) -> Self {
		NodeId(id.as_ref().into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for NodeId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl serde::Serialize for NodeId {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0)
	}
}

impl<'de> serde::Deserialize<'de> for NodeId {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		Ok(NodeId(String::deserialize(deserializer)?.into()))
	}
}

fn hash_point(data: &str) -> u64 {
	let digest = Sha256::digest(data.as_bytes());
	u64::from_be_bytes([
		digest[0], digest[1], digest[2], digest[3],
		digest[4], digest[5], digest[6], digest[7],
	])
}

#[derive(Clone, Debug, Default)]
pub struct Ring {
	points: BTreeMap<u64, NodeId>,
	members: Vec<NodeId>,
}

impl Ring {
	pub fn new(mut members: Vec<NodeId>) -> Self {
		members.sort();
		members.dedup();
		let mut points = BTreeMap::new();
		for member in &members {
			for i in 0..VNODES_PER_NODE {
				points.insert(hash_point(&format!("{}#{}", member, i)), member.clone());
			}
		}
		Self { points, members }
	}

	pub fn members(&self) -> &[NodeId] {
		&self.members
	}

	pub fn is_empty(&self) -> bool {
		self.points.is_empty()
	}

	/// The node owning `tenant`: successor of its hash, wrapping around.
	pub fn owner(&self, tenant: &TenantId) -> Option<&NodeId> {
		if self.points.is_empty() {
			return None;
		}
		let point = hash_point(tenant.as_str());
		self.points
			.range(point..)
			.next()
			.or_else(|| self.points.iter().next())
			.map(|(_, node)| node)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn nodes(n: usize) -> Vec<NodeId> {
		(0..n).map(|i| NodeId::new(format!("relaymesh@10.0.0.{}:4000", i))).collect()
	}

	#[test]
	fn test_empty_ring_owns_nothing() {
		let ring = Ring::new(Vec::new());
		assert!(ring.owner(&TenantId::new("acme")).is_none());
	}

	#[test]
	fn test_single_node_owns_everything() {
		let ring = Ring::new(nodes(1));
		for i in 0..50 {
			let tenant = TenantId::new(format!("tenant-{}", i));
			assert_eq!(ring.owner(&tenant), Some(&nodes(1)[0]));
		}
	}

	#[test]
	fn test_ownership_is_deterministic() {
		let a = Ring::new(nodes(3));
		let b = Ring::new(nodes(3));
		for i in 0..50 {
			let tenant = TenantId::new(format!("tenant-{}", i));
			assert_eq!(a.owner(&tenant), b.owner(&tenant));
		}
	}

	#[test]
	fn test_membership_order_does_not_matter() {
		let mut shuffled = nodes(5);
		shuffled.reverse();
		let a = Ring::new(nodes(5));
		let b = Ring::new(shuffled);
		for i in 0..50 {
			let tenant = TenantId::new(format!("tenant-{}", i));
			assert_eq!(a.owner(&tenant), b.owner(&tenant));
		}
	}

	#[test]
	fn test_node_removal_moves_only_its_tenants() {
		let before = Ring::new(nodes(4));
		let survivors: Vec<NodeId> = nodes(4).into_iter().take(3).collect();
		let after = Ring::new(survivors.clone());
		let removed = &nodes(4)[3];

		for i in 0..200 {
			let tenant = TenantId::new(format!("tenant-{}", i));
			let owner_before = before.owner(&tenant).unwrap().clone();
			let owner_after = after.owner(&tenant).unwrap().clone();
			if owner_before != *removed {
				assert_eq!(owner_before, owner_after, "tenant-{} moved needlessly", i);
			} else {
				assert!(survivors.contains(&owner_after));
			}
		}
	}

	#[test]
	fn test_distribution_is_roughly_even() {
		let ring = Ring::new(nodes(4));
		let mut counts = std::collections::HashMap::new();
		for i in 0..1000 {
			let tenant = TenantId::new(format!("tenant-{}", i));
			*counts.entry(ring.owner(&tenant).unwrap().clone()).or_insert(0usize) += 1;
		}
		for (_, count) in counts {
			assert!(count > 100, "distribution badly skewed: {}", count);
		}
	}
}

// vim: ts=4
