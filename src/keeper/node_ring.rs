use crate::cluster::MembershipSnapshot;
use crate::core::NodeAddress;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use wyhash::{wyrng, WyHash};

/// Consistent hash table over the current membership.
///
/// Each node occupies `vnodes` points on a `u64` ring; a routing key hashes
/// to a point and is owned by the next `width` distinct nodes clockwise from
/// it. For a fixed snapshot the mapping is fully deterministic, and a
/// membership change only moves the keys whose ownership arc the changed
/// node actually crosses.
pub struct NodeRing {
  ring: BTreeMap<u64, Arc<NodeAddress>>,
  vnodes: u32,
}
impl NodeRing {
  /// An empty ring placing each node on `vnodes` points.
  pub fn new(vnodes: u32) -> NodeRing {
    NodeRing {
      ring: BTreeMap::new(),
      vnodes: std::cmp::max(1, vnodes),
    }
  }

  /// Build a ring from a membership snapshot.
  pub fn from_snapshot(snap: &MembershipSnapshot, vnodes: u32) -> NodeRing {
    let mut ring = NodeRing::new(vnodes);
    for node in snap.nodes.iter() {
      ring.insert(node.clone());
    }
    ring
  }

  /// The ordered replica set for `key`: the first `width` distinct nodes
  /// clockwise from the key's point, primary first.
  pub fn route(&self, key: &str, width: usize) -> Vec<Arc<NodeAddress>> {
    let point = hash_code(&key);
    self
      .ring
      .range(point..)
      .chain(self.ring.range(..point))
      .map(|(_, n)| n.clone())
      .unique()
      .take(width)
      .collect()
  }

  /// Place `node` on the ring. The first point is the hash of the address,
  /// each further vnode point is chained from the previous one.
  pub fn insert(&mut self, node: Arc<NodeAddress>) {
    let mut point = hash_code(&node);
    for _ in 0..self.vnodes {
      self.ring.insert(point, node.clone());
      point = wyrng(&mut point);
    }
  }

  /// Take `node` off the ring. Returns how many of its points were present.
  pub fn remove(&mut self, node: &NodeAddress) -> u32 {
    let mut point = hash_code(&node);
    let mut removed = 0u32;
    for _ in 0..self.vnodes {
      removed += self.ring.remove(&point).is_some() as u32;
      point = wyrng(&mut point);
    }
    removed
  }

  /// True when no node occupies the ring.
  pub fn is_empty(&self) -> bool {
    self.ring.is_empty()
  }
}

fn hash_code<H: Hash>(item: &H) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  item.hash(&mut hasher);
  hasher.finish()
}

#[cfg(test)]
use crate::core::Host;

#[cfg(test)]
fn ring_of(ports: std::ops::Range<u16>, vnodes: u32) -> (NodeRing, Vec<Arc<NodeAddress>>) {
  let members = ports
    .map(|p| {
      Arc::new(NodeAddress::new(
        Host::DNS("localhost".to_string()),
        p,
        "ring".to_string(),
      ))
    })
    .collect::<Vec<_>>();
  let mut ring = NodeRing::new(vnodes);
  for m in members.iter() {
    ring.insert(m.clone());
  }
  (ring, members)
}

#[test]
fn test_ring_deterministic() {
  let (ring, _) = ring_of(6000..6005, 3);
  for key in ["a", "entity-17", "🦀", ""].iter() {
    let first = ring.route(key, 2);
    let second = ring.route(key, 2);
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_ne!(first[0], first[1]);
  }
}

#[test]
fn test_ring_width_capped_by_membership() {
  let (ring, members) = ring_of(6000..6002, 4);
  let routed = ring.route("row", 5);
  assert_eq!(routed.len(), 2);
  assert!(members.contains(&routed[0]));
  assert!(members.contains(&routed[1]));
}

#[test]
fn test_ring_minimal_disruption() {
  let (mut ring, members) = ring_of(6000..6008, 4);
  let keys = (0..200).map(|i| format!("row-{}", i)).collect::<Vec<_>>();
  let before = keys.iter().map(|k| ring.route(k, 1)).collect::<Vec<_>>();
  let gone = members[3].clone();
  assert_eq!(ring.remove(&gone), 4);
  for (key, old) in keys.iter().zip(before) {
    let new = ring.route(key, 1);
    if old[0] != gone {
      // only keys owned by the removed node may move
      assert_eq!(old, new);
    } else {
      assert_ne!(new[0], gone);
    }
  }
}

#[test]
fn test_ring_insert_remove_round_trip() {
  let (mut ring, members) = ring_of(6000..6004, 2);
  for m in members.iter() {
    assert_eq!(ring.remove(m), 2);
  }
  assert!(ring.is_empty());
  assert!(ring.route("anything", 2).is_empty());
}
