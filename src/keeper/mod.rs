//! The front-end dispatcher. A [`Keeper`] holds a write-once table mapping
//! each RPC method to one of three distribution strategies (broadcast to
//! every live node, forward to one random node, or route to a
//! consistent-hash-selected subset), plus the aggregator that folds per-node
//! replies for the fan-out strategies. Registration happens once at startup;
//! the table never changes at runtime. Routing targets follow the membership
//! directory's change-notification channel.

pub mod aggregators;
pub mod node_ring;
mod surface;

pub use surface::register_standard_surface;

use crate::cluster::{Membership, MembershipSnapshot};
use crate::core::{
  NodeAddress, RpcClient, RpcServer, RpcService, ServiceError, TransportError,
};
use aggregators::Aggregator;
use async_trait::async_trait;
use node_ring::NodeRing;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_cbor::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Configures a [`Keeper`].
#[derive(Clone, Debug)]
pub struct KeeperConfig {
  /// The logical cluster whose nodes this keeper routes to.
  ///
  /// default: `"local"`
  pub cluster: String,
  /// How many ring points each node occupies in the consistent hash table.
  /// Must match across keepers routing for the same cluster.
  ///
  /// default: `2`
  pub vnodes: u32,
}
impl Default for KeeperConfig {
  fn default() -> Self {
    KeeperConfig {
      cluster: "local".to_string(),
      vnodes: 2,
    }
  }
}

/// How calls to a method are distributed over the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Routing {
  /// Send to every live node and fold the successful replies.
  Broadcast,
  /// Forward verbatim to one uniformly random node.
  Random,
  /// Send to the `width` nodes the hash ring assigns the routing key.
  ConsistentHash {
    /// Replication width: primary plus replicas.
    width: usize,
  },
}

/// Whether a method mutates worker state. Recorded for status and
/// monitoring; dispatch behavior never depends on it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MethodClass {
  /// The method mutates the model.
  Update,
  /// The method only reads.
  Analysis,
}

/// Routing failures surfaced to the client as the call's outcome.
#[derive(Debug, Error)]
pub enum KeeperError {
  /// No handler is registered under this name.
  #[error("unknown method {0}")]
  UnknownMethod(String),
  /// A method was registered twice; the table is write-once.
  #[error("method {0} is already registered")]
  DuplicateMethod(String),
  /// A random route found no live node to forward to.
  #[error("no replica available for {0}")]
  NoReplicaAvailable(String),
  /// A fan-out route got no successful reply from any node.
  #[error("all replicas unavailable for {0}")]
  AllReplicasUnavailable(String),
  /// A consistent-hash call without a string routing key in first position.
  #[error("{0} carries no routing key")]
  BadRoutingKey(String),
  /// The transport failed on a single-target route.
  #[error(transparent)]
  Transport(#[from] TransportError),
}

struct RouteEntry {
  routing: Routing,
  class: MethodClass,
  aggregator: Option<Aggregator>,
}

struct Targets {
  snapshot: MembershipSnapshot,
  ring: NodeRing,
}

/// The front-end RPC dispatcher.
pub struct Keeper {
  config: KeeperConfig,
  membership: Membership,
  members: watch::Receiver<MembershipSnapshot>,
  client: Arc<dyn RpcClient>,
  table: HashMap<String, RouteEntry>,
  targets: RwLock<Targets>,
  rng: Mutex<SmallRng>,
  started: Instant,
}
impl Keeper {
  /// A keeper routing `config.cluster` calls through `client`, with an
  /// empty method table. Subscribes to the membership channel up front and
  /// tracks it for the rest of its life.
  pub fn new(
    config: KeeperConfig,
    membership: Membership,
    client: Arc<dyn RpcClient>,
  ) -> Keeper {
    let vnodes = config.vnodes;
    let members = membership.watch(&config.cluster);
    Keeper {
      config: config,
      membership: membership,
      members: members,
      client: client,
      table: HashMap::new(),
      targets: RwLock::new(Targets {
        snapshot: MembershipSnapshot::empty(),
        ring: NodeRing::new(vnodes),
      }),
      rng: Mutex::new(SmallRng::from_entropy()),
      started: Instant::now(),
    }
  }

  /// Register a method sent to every live node, folding replies with
  /// `aggregator`.
  pub fn register_broadcast(
    &mut self,
    name: &str,
    class: MethodClass,
    aggregator: Aggregator,
  ) -> Result<(), KeeperError> {
    self.register(name, Routing::Broadcast, class, Some(aggregator))
  }

  /// Register a method forwarded verbatim to one random node.
  pub fn register_random(
    &mut self,
    name: &str,
    class: MethodClass,
  ) -> Result<(), KeeperError> {
    self.register(name, Routing::Random, class, None)
  }

  /// Register a method routed by consistent hash of its first argument to
  /// `width` nodes, folding replies with `aggregator`.
  pub fn register_cht(
    &mut self,
    name: &str,
    width: usize,
    class: MethodClass,
    aggregator: Aggregator,
  ) -> Result<(), KeeperError> {
    self.register(
      name,
      Routing::ConsistentHash { width: width },
      class,
      Some(aggregator),
    )
  }

  fn register(
    &mut self,
    name: &str,
    routing: Routing,
    class: MethodClass,
    aggregator: Option<Aggregator>,
  ) -> Result<(), KeeperError> {
    if self.table.contains_key(name) {
      return Err(KeeperError::DuplicateMethod(name.to_string()));
    }
    let entry = RouteEntry {
      routing: routing,
      class: class,
      aggregator: aggregator,
    };
    self.table.insert(name.to_string(), entry);
    Ok(())
  }

  /// The registered routing strategy for `method`, if any.
  pub fn routing_of(&self, method: &str) -> Option<Routing> {
    self.table.get(method).map(|e| e.routing)
  }

  /// The registered side-effect class for `method`, if any.
  pub fn class_of(&self, method: &str) -> Option<MethodClass> {
    self.table.get(method).map(|e| e.class)
  }

  /// Route one call per the table and fold the replies.
  pub async fn dispatch(
    &self,
    method: &str,
    args: Value,
  ) -> Result<Value, KeeperError> {
    let entry = self
      .table
      .get(method)
      .ok_or_else(|| KeeperError::UnknownMethod(method.to_string()))?;
    self.refresh_targets();
    match entry.routing {
      Routing::Broadcast => {
        let nodes = {
          let targets = self.targets.read();
          targets.snapshot.nodes.iter().cloned().collect::<Vec<_>>()
        };
        self.fan_out(method, args, entry, nodes).await
      }
      Routing::Random => {
        let node = {
          let targets = self.targets.read();
          let nodes =
            targets.snapshot.nodes.iter().cloned().collect::<Vec<_>>();
          nodes.choose(&mut *self.rng.lock()).cloned()
        };
        let node = node
          .ok_or_else(|| KeeperError::NoReplicaAvailable(method.to_string()))?;
        Ok(self.client.call(&node, method, args).await?)
      }
      Routing::ConsistentHash { width } => {
        let key = routing_key(method, &args)?;
        let nodes = {
          let targets = self.targets.read();
          targets.ring.route(&key, width)
        };
        if nodes.is_empty() {
          return Err(KeeperError::NoReplicaAvailable(method.to_string()));
        }
        self.fan_out(method, args, entry, nodes).await
      }
    }
  }

  /// Serve dispatched calls until the transport shuts down.
  pub async fn run(
    self: Arc<Self>,
    server: Arc<dyn RpcServer>,
  ) -> Result<(), TransportError> {
    debug!(
      "keeper for cluster {} serving {} methods",
      self.config.cluster,
      self.table.len()
    );
    server.serve(self).await
  }

  async fn fan_out(
    &self,
    method: &str,
    args: Value,
    entry: &RouteEntry,
    nodes: Vec<Arc<NodeAddress>>,
  ) -> Result<Value, KeeperError> {
    let mut acc: Option<Value> = None;
    for node in nodes {
      match self.client.call(&node, method, args.clone()).await {
        Ok(reply) => {
          acc = Some(match (acc, entry.aggregator) {
            (Some(a), Some(fold)) => fold(a, reply),
            (Some(a), None) => a,
            (None, _) => reply,
          });
        }
        Err(e) => warn!("{} on {} dropped from fold: {}", method, node, e),
      }
    }
    let acc = match (acc, method) {
      // the keeper adds its own status row, but only to a fold that got at
      // least one worker reply; an all-fail broadcast still fails
      (Some(a), "get_status") => Some(aggregators::merge(a, self.status())),
      (acc, _) => acc,
    };
    acc.ok_or_else(|| KeeperError::AllReplicasUnavailable(method.to_string()))
  }

  fn refresh_targets(&self) {
    let latest = self.members.borrow().clone();
    {
      let targets = self.targets.read();
      if targets.snapshot == latest {
        return;
      }
    }
    let ring = NodeRing::from_snapshot(&latest, self.config.vnodes);
    let mut targets = self.targets.write();
    targets.snapshot = latest;
    targets.ring = ring;
  }

  fn status(&self) -> Value {
    let text = |s: String| Value::Text(s);
    let mut row = BTreeMap::new();
    row.insert(
      text("uptime_secs".to_string()),
      text(self.started.elapsed().as_secs().to_string()),
    );
    row.insert(
      text("methods".to_string()),
      text(self.table.len().to_string()),
    );
    row.insert(
      text("known_nodes".to_string()),
      text(self.targets.read().snapshot.nodes.len().to_string()),
    );
    row.insert(
      text("standalone".to_string()),
      text(self.membership.is_standalone().to_string()),
    );
    let mut outer = BTreeMap::new();
    outer.insert(
      text(format!("keeper/{}", self.config.cluster)),
      Value::Map(row),
    );
    Value::Map(outer)
  }
}

#[async_trait]
impl RpcService for Keeper {
  async fn handle(
    &self,
    method: &str,
    args: Value,
  ) -> Result<Value, ServiceError> {
    self.dispatch(method, args).await.map_err(|e| match e {
      KeeperError::UnknownMethod(m) => ServiceError::UnknownMethod(m),
      e => ServiceError::Failed(e.to_string()),
    })
  }
}

fn routing_key(method: &str, args: &Value) -> Result<String, KeeperError> {
  match args {
    Value::Array(v) => match v.first() {
      Some(Value::Text(s)) => Ok(s.clone()),
      _ => Err(KeeperError::BadRoutingKey(method.to_string())),
    },
    _ => Err(KeeperError::BadRoutingKey(method.to_string())),
  }
}
