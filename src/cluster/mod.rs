//! The membership directory seam. A [`Directory`] is a watched, shared
//! registry mapping cluster names to live node addresses; the keeper refreshes
//! its routing targets from it and the mixer picks peers from it. Running
//! without one ([`Membership::Standalone`]) degrades to a single-node
//! deployment: every routing strategy targets the local node and mixing is
//! disabled.

use crate::core::NodeAddress;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Failures raised by the membership collaborator.
#[derive(Clone, Debug, Error)]
pub enum DirectoryError {
  /// The directory itself could not be reached.
  #[error("membership directory unavailable: {0}")]
  Unavailable(String),
  /// The directory has no entry for the requested cluster.
  #[error("unknown cluster {0}")]
  UnknownCluster(String),
}

/// One observation of a cluster's live membership.
///
/// Nodes are held in sorted order so that broadcast folds and ring builds
/// are deterministic for a fixed snapshot. The version ticks on every
/// membership change and lets consumers skip rebuilding derived state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MembershipSnapshot {
  /// Live nodes, sorted by address.
  pub nodes: im::Vector<Arc<NodeAddress>>,
  /// Monotone change counter, directory-assigned.
  pub version: u64,
}
impl MembershipSnapshot {
  /// A snapshot over `nodes`, sorted into canonical order.
  pub fn new<I>(nodes: I, version: u64) -> MembershipSnapshot
  where
    I: IntoIterator<Item = Arc<NodeAddress>>,
  {
    let mut v = nodes.into_iter().collect::<Vec<_>>();
    v.sort();
    v.dedup();
    MembershipSnapshot {
      nodes: v.into_iter().collect(),
      version: version,
    }
  }

  /// An empty snapshot at version zero.
  pub fn empty() -> MembershipSnapshot {
    MembershipSnapshot {
      nodes: im::Vector::new(),
      version: 0,
    }
  }

  /// The snapshot without `addr`, for peer selection.
  pub fn without(&self, addr: &NodeAddress) -> MembershipSnapshot {
    MembershipSnapshot {
      nodes: self.nodes.iter().filter(|n| ***n != *addr).cloned().collect(),
      version: self.version,
    }
  }
}

/// The shared membership store collaborator.
///
/// Implementations are expected to refresh asynchronously; `list_nodes`
/// should answer from a local view, not a blocking remote lookup.
#[async_trait]
pub trait Directory: Send + Sync {
  /// The current live membership of `cluster`.
  async fn list_nodes(
    &self,
    cluster: &str,
  ) -> Result<MembershipSnapshot, DirectoryError>;

  /// A change-notification channel for `cluster`. The receiver always holds
  /// the latest snapshot.
  fn watch(&self, cluster: &str) -> watch::Receiver<MembershipSnapshot>;
}

/// How a keeper or server finds the rest of the cluster.
#[derive(Clone)]
pub enum Membership {
  /// Normal operation: targets come from a shared directory.
  Clustered(Arc<dyn Directory>),
  /// No directory. The single named node is every strategy's target.
  Standalone(Arc<NodeAddress>),
}
impl Membership {
  /// The change-notification channel for `cluster`. Standalone membership
  /// yields a one-node snapshot that never changes.
  pub fn watch(&self, cluster: &str) -> watch::Receiver<MembershipSnapshot> {
    match self {
      Membership::Clustered(dir) => dir.watch(cluster),
      Membership::Standalone(addr) => {
        let snap = MembershipSnapshot::new(vec![addr.clone()], 0);
        let (_tx, rx) = watch::channel(snap);
        rx
      }
    }
  }

  /// True when no directory is attached.
  pub fn is_standalone(&self) -> bool {
    matches!(self, Membership::Standalone(_))
  }
}

#[cfg(test)]
use crate::core::Host;

#[test]
fn test_snapshot_ordering() {
  let mk = |port| {
    Arc::new(NodeAddress::new(
      Host::DNS("localhost".to_string()),
      port,
      "tell".to_string(),
    ))
  };
  let snap = MembershipSnapshot::new(vec![mk(7002), mk(7000), mk(7001)], 3);
  let ports = snap.nodes.iter().map(|n| n.port).collect::<Vec<_>>();
  assert_eq!(ports, vec![7000, 7001, 7002]);
  let rest = snap.without(&mk(7001));
  let ports = rest.nodes.iter().map(|n| n.port).collect::<Vec<_>>();
  assert_eq!(ports, vec![7000, 7002]);
  assert_eq!(rest.version, 3);
}

#[test]
fn test_standalone_watch() {
  let addr = Arc::new(NodeAddress::new(
    Host::DNS("localhost".to_string()),
    7000,
    "solo".to_string(),
  ));
  let membership = Membership::Standalone(addr.clone());
  assert!(membership.is_standalone());
  let rx = membership.watch("solo");
  // the sender is gone, the snapshot stays readable
  let snap = rx.borrow().clone();
  assert_eq!(snap.nodes.len(), 1);
  assert_eq!(snap.nodes[0], addr);
}
