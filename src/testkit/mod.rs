//! In-memory stand-ins for every collaborator seam: a process-local
//! transport with failure injection ([`LocalNet`]), a hand-driven membership
//! directory ([`StaticDirectory`]), an in-memory blob store
//! ([`MemBlobStore`]), and a small row-tally model ([`TallyModel`]) whose
//! diffs merge by max-union. Everything here is meant for tests and local
//! experiments, not production serving.

use crate::cluster::{Directory, DirectoryError, MembershipSnapshot};
use crate::core::{
  BlobError, BlobStore, NodeAddress, RpcClient, RpcServer, RpcService,
  TransportError,
};
use crate::model::{Model, ModelError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Drop and delay behavior for calls to one node.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailureConfig {
  /// Probability that a call fails as unreachable before delivery.
  pub drop_prob: f64,
  /// Uniformly sampled delivery delay range.
  pub delay: Option<(Duration, Duration)>,
}

/// Per-node failure overrides on top of a cluster-wide default.
#[derive(Clone, Default)]
pub struct FailureConfigMap {
  /// Applied to every node without an override.
  pub cluster_wide: FailureConfig,
  /// Per-node overrides.
  pub node_wide: im::HashMap<Arc<NodeAddress>, FailureConfig>,
}
impl FailureConfigMap {
  /// The config governing calls to `addr`.
  pub fn get(&self, addr: &NodeAddress) -> &FailureConfig {
    self.node_wide.get(addr).unwrap_or(&self.cluster_wide)
  }
}

/// A process-local transport: services bind under their address and calls
/// are dispatched in memory, subject to the failure map. Implements both
/// halves of the transport seam.
pub struct LocalNet {
  services: RwLock<HashMap<Arc<NodeAddress>, Arc<dyn RpcService>>>,
  fail_map: RwLock<FailureConfigMap>,
  rng: Mutex<SmallRng>,
}
impl LocalNet {
  /// An empty net delivering every call immediately.
  pub fn new() -> Arc<LocalNet> {
    Arc::new(LocalNet {
      services: RwLock::new(HashMap::new()),
      fail_map: RwLock::new(FailureConfigMap::default()),
      rng: Mutex::new(SmallRng::from_entropy()),
    })
  }

  /// Bind `service` under `addr`, replacing any previous binding.
  pub fn bind(&self, addr: Arc<NodeAddress>, service: Arc<dyn RpcService>) {
    self.services.write().insert(addr, service);
  }

  /// Remove the binding for `addr`, simulating a crash-stop failure.
  pub fn unbind(&self, addr: &NodeAddress) {
    self.services.write().remove(addr);
  }

  /// Replace the failure map.
  pub fn set_failures(&self, map: FailureConfigMap) {
    *self.fail_map.write() = map;
  }
}
#[async_trait]
impl RpcClient for LocalNet {
  async fn call(
    &self,
    addr: &NodeAddress,
    method: &str,
    args: Value,
  ) -> Result<Value, TransportError> {
    let fail = *self.fail_map.read().get(addr);
    if fail.drop_prob > 0.0 {
      let roll = self.rng.lock().gen::<f64>();
      if roll < fail.drop_prob {
        return Err(TransportError::Unreachable(addr.to_string()));
      }
    }
    if let Some((min, max)) = fail.delay {
      let millis = {
        let range = min.as_millis()..=max.as_millis();
        self.rng.lock().gen_range(range) as u64
      };
      tokio::time::sleep(Duration::from_millis(millis)).await;
    }
    let service = self.services.read().get(addr).cloned();
    match service {
      Some(s) => s
        .handle(method, args)
        .await
        .map_err(|e| TransportError::Remote(e.to_string())),
      None => Err(TransportError::Unreachable(addr.to_string())),
    }
  }
}
#[async_trait]
impl RpcServer for LocalNet {
  async fn serve(
    &self,
    _service: Arc<dyn RpcService>,
  ) -> Result<(), TransportError> {
    // bindings already route calls; serving in-memory just parks
    std::future::pending::<()>().await;
    Ok(())
  }
}

/// A membership directory driven by hand from tests. `set_nodes` bumps the
/// snapshot version and wakes watchers.
pub struct StaticDirectory {
  clusters: RwLock<HashMap<String, watch::Sender<MembershipSnapshot>>>,
}
impl StaticDirectory {
  /// An empty directory.
  pub fn new() -> Arc<StaticDirectory> {
    Arc::new(StaticDirectory {
      clusters: RwLock::new(HashMap::new()),
    })
  }

  /// Replace `cluster`'s membership.
  pub fn set_nodes(&self, cluster: &str, nodes: Vec<Arc<NodeAddress>>) {
    use std::collections::hash_map::Entry;
    let mut clusters = self.clusters.write();
    match clusters.entry(cluster.to_string()) {
      Entry::Occupied(o) => {
        let version = o.get().borrow().version + 1;
        let _ = o.get().send(MembershipSnapshot::new(nodes, version));
      }
      Entry::Vacant(v) => {
        let (tx, _rx) = watch::channel(MembershipSnapshot::new(nodes, 1));
        v.insert(tx);
      }
    }
  }
}
#[async_trait]
impl Directory for StaticDirectory {
  async fn list_nodes(
    &self,
    cluster: &str,
  ) -> Result<MembershipSnapshot, DirectoryError> {
    let clusters = self.clusters.read();
    match clusters.get(cluster) {
      Some(tx) => Ok(tx.borrow().clone()),
      None => Err(DirectoryError::UnknownCluster(cluster.to_string())),
    }
  }

  fn watch(&self, cluster: &str) -> watch::Receiver<MembershipSnapshot> {
    use std::collections::hash_map::Entry;
    let mut clusters = self.clusters.write();
    match clusters.entry(cluster.to_string()) {
      Entry::Occupied(o) => o.get().subscribe(),
      Entry::Vacant(v) => {
        let (tx, rx) = watch::channel(MembershipSnapshot::empty());
        v.insert(tx);
        rx
      }
    }
  }
}

/// Blob persistence in a map.
pub struct MemBlobStore {
  blobs: Mutex<HashMap<String, Vec<u8>>>,
}
impl MemBlobStore {
  /// An empty store.
  pub fn new() -> Arc<MemBlobStore> {
    Arc::new(MemBlobStore {
      blobs: Mutex::new(HashMap::new()),
    })
  }

  /// The ids of every stored blob.
  pub fn ids(&self) -> Vec<String> {
    let mut ids = self.blobs.lock().keys().cloned().collect::<Vec<_>>();
    ids.sort();
    ids
  }
}
#[async_trait]
impl BlobStore for MemBlobStore {
  async fn save(&self, id: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
    self.blobs.lock().insert(id.to_string(), bytes);
    Ok(())
  }

  async fn load(&self, id: &str) -> Result<Vec<u8>, BlobError> {
    self
      .blobs
      .lock()
      .get(id)
      .cloned()
      .ok_or_else(|| BlobError::NotFound(id.to_string()))
  }
}

/// One observation for a [`TallyModel`] row. Zero hits is rejected, which
/// gives tests a way to plant failing items inside a batch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TallyUpdate {
  /// The row to count into.
  pub row: String,
  /// How many hits to add; must be positive.
  pub hits: u64,
}

/// Asks a [`TallyModel`] for one row's tally.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TallyQuery {
  /// The row to score.
  pub row: String,
}

/// A minimal served model: a per-row hit tally whose diff is its whole
/// state and whose merge is max-union, so mixer rounds converge in any
/// peer order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TallyModel {
  rows: im::OrdMap<String, u64>,
}
impl TallyModel {
  /// An empty model.
  pub fn new() -> TallyModel {
    TallyModel {
      rows: im::OrdMap::new(),
    }
  }

  /// The tally for `row`, zero when absent.
  pub fn tally(&self, row: &str) -> u64 {
    self.rows.get(row).copied().unwrap_or(0)
  }
}
impl Model for TallyModel {
  type Update = TallyUpdate;
  type Query = TallyQuery;
  type Output = f64;
  type Diff = im::OrdMap<String, u64>;

  fn apply(&mut self, update: TallyUpdate) -> Result<(), ModelError> {
    if update.hits == 0 {
      return Err(ModelError::Malformed("zero-hit update".to_string()));
    }
    let tally = self.rows.entry(update.row).or_insert(0);
    *tally += update.hits;
    Ok(())
  }

  fn query(&self, query: TallyQuery) -> Result<f64, ModelError> {
    self
      .rows
      .get(&query.row)
      .map(|t| *t as f64)
      .ok_or(ModelError::UnknownRow(query.row))
  }

  fn snapshot_diff(&self) -> Self::Diff {
    self.rows.clone()
  }

  fn merge(
    &self,
    ours: Self::Diff,
    theirs: Self::Diff,
  ) -> Result<Self::Diff, ModelError> {
    Ok(ours.union_with(theirs, std::cmp::max))
  }

  fn apply_diff(&mut self, diff: Self::Diff) -> Result<(), ModelError> {
    self.rows = self.rows.clone().union_with(diff, std::cmp::max);
    Ok(())
  }

  fn clear(&mut self) {
    self.rows = im::OrdMap::new();
  }

  fn clear_row(&mut self, key: &str) -> Result<(), ModelError> {
    match self.rows.remove(key) {
      Some(_) => Ok(()),
      None => Err(ModelError::UnknownRow(key.to_string())),
    }
  }

  fn rows(&self) -> Vec<String> {
    self.rows.keys().cloned().collect()
  }

  fn serialize(&self) -> Result<Vec<u8>, ModelError> {
    serde_cbor::to_vec(&self.rows).map_err(|e| ModelError::Other(e.to_string()))
  }

  fn deserialize(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
    self.rows = serde_cbor::from_slice(bytes)
      .map_err(|e| ModelError::Malformed(e.to_string()))?;
    Ok(())
  }
}

#[test]
fn test_tally_model_merge_is_commutative() {
  let mut a = TallyModel::new();
  let mut b = TallyModel::new();
  a.apply(TallyUpdate { row: "x".to_string(), hits: 3 }).unwrap();
  a.apply(TallyUpdate { row: "y".to_string(), hits: 1 }).unwrap();
  b.apply(TallyUpdate { row: "x".to_string(), hits: 2 }).unwrap();
  b.apply(TallyUpdate { row: "z".to_string(), hits: 5 }).unwrap();
  let ab = a.merge(a.snapshot_diff(), b.snapshot_diff()).unwrap();
  let ba = b.merge(b.snapshot_diff(), a.snapshot_diff()).unwrap();
  assert_eq!(ab, ba);
  a.apply_diff(ab).unwrap();
  b.apply_diff(ba).unwrap();
  assert_eq!(a, b);
  assert_eq!(a.tally("x"), 3);
  assert_eq!(a.tally("z"), 5);
}
