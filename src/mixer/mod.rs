//! Diff-based anti-entropy replication. One [`Mixer`] runs per node as a
//! background task. On a timer or an update-count trigger it asks the
//! membership directory for a live peer, pulls that peer's diff, merges it
//! with a diff of the local model, applies the merged diff locally under the
//! model's exclusion mechanism, and ships the merged diff back so both sides
//! converge from one round. Any failing step abandons the round; the next
//! trigger retries from scratch with no retained state.

use crate::cluster::{Directory, DirectoryError};
use crate::core::{decode, encode, NodeAddress, RpcClient, TransportError};
use crate::model::{Model, ModelError};
use crate::server::{GET_DIFF, PUT_DIFF};
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_cbor::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Configures a [`Mixer`].
#[derive(Clone, Debug)]
pub struct MixerConfig {
  /// How long the mixer waits between rounds when no update-count trigger
  /// fires first.
  ///
  /// default: `16 seconds`
  pub interval: std::time::Duration,
  /// The number of applied updates since the last round that triggers a
  /// round early.
  ///
  /// default: `512`
  pub count_threshold: u64,
}
impl Default for MixerConfig {
  fn default() -> Self {
    MixerConfig {
      interval: std::time::Duration::from_secs(16),
      count_threshold: 512,
    }
  }
}

/// Startup-order errors. Starting the mixer twice on one node is a
/// programming error, reported immediately rather than retried.
#[derive(Clone, Debug, Error)]
pub enum MixerError {
  /// A mixer is already running on this node.
  #[error("can't start mixer twice")]
  AlreadyStarted,
}

/// Where the mixer currently is in its round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MixerPhase {
  /// Waiting for a trigger.
  Idle,
  /// A trigger fired, a round is starting.
  Triggered,
  /// Exchanging diffs with the chosen peer.
  Exchanging,
  /// Applying the merged diff to the local model.
  Applying,
}

/// The dirty signal between a model server and its mixer. Updates tally
/// into it; once the count crosses the configured threshold the mixer is
/// woken without waiting for its timer.
pub struct MixSignal {
  counter: AtomicU64,
  threshold: AtomicU64,
  notify: Notify,
}
impl MixSignal {
  /// A signal that never fires until a threshold is set.
  pub fn new() -> MixSignal {
    MixSignal {
      counter: AtomicU64::new(0),
      threshold: AtomicU64::new(u64::MAX),
      notify: Notify::new(),
    }
  }

  /// Record `n` applied updates, waking the mixer if the threshold is
  /// crossed.
  pub fn updated(&self, n: u64) {
    let total = self.counter.fetch_add(n, Ordering::SeqCst) + n;
    if total >= self.threshold.load(Ordering::SeqCst) {
      self.notify.notify_one();
    }
  }

  /// Updates recorded since the last completed round.
  pub fn count(&self) -> u64 {
    self.counter.load(Ordering::SeqCst)
  }

  pub(crate) fn set_threshold(&self, threshold: u64) {
    self.threshold.store(threshold, Ordering::SeqCst);
  }

  pub(crate) fn reset(&self) {
    self.counter.store(0, Ordering::SeqCst);
  }

  pub(crate) async fn triggered(&self) {
    self.notify.notified().await;
  }
}
impl Default for MixSignal {
  fn default() -> Self {
    MixSignal::new()
  }
}

#[derive(Debug, Error)]
enum RoundError {
  #[error(transparent)]
  Directory(#[from] DirectoryError),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error(transparent)]
  Model(#[from] ModelError),
}

/// The per-node anti-entropy loop. Constructed and spawned through
/// [`ModelServer::start_mixer`](crate::server::ModelServer::start_mixer).
pub struct Mixer<M: Model> {
  address: Arc<NodeAddress>,
  model: Arc<RwLock<M>>,
  directory: Arc<dyn Directory>,
  client: Arc<dyn RpcClient>,
  signal: Arc<MixSignal>,
  config: MixerConfig,
  phase: watch::Sender<MixerPhase>,
  phase_rx: watch::Receiver<MixerPhase>,
  rounds: Arc<AtomicU64>,
  rng: SmallRng,
}
impl<M: Model> Mixer<M> {
  pub(crate) fn new(
    address: Arc<NodeAddress>,
    model: Arc<RwLock<M>>,
    directory: Arc<dyn Directory>,
    client: Arc<dyn RpcClient>,
    signal: Arc<MixSignal>,
    config: MixerConfig,
  ) -> Mixer<M> {
    signal.set_threshold(config.count_threshold);
    let (tx, rx) = watch::channel(MixerPhase::Idle);
    Mixer {
      address: address,
      model: model,
      directory: directory,
      client: client,
      signal: signal,
      config: config,
      phase: tx,
      phase_rx: rx,
      rounds: Arc::new(AtomicU64::new(0)),
      rng: SmallRng::from_entropy(),
    }
  }

  pub(crate) fn spawn(self) -> MixerHandle {
    let shutdown = Arc::new(Notify::new());
    let rounds = self.rounds.clone();
    let phase = self.phase_rx.clone();
    let join = tokio::spawn(self.run(shutdown.clone()));
    MixerHandle {
      phase: phase,
      shutdown: shutdown,
      rounds: rounds,
      join: join,
    }
  }

  async fn run(mut self, shutdown: Arc<Notify>) {
    loop {
      let timer = tokio::time::sleep(self.config.interval);
      tokio::select! {
        _ = timer => trace!("interval trigger on {}", self.address),
        _ = self.signal.triggered() => {
          trace!("update-count trigger on {}", self.address)
        }
        _ = shutdown.notified() => break,
      }
      self.set_phase(MixerPhase::Triggered);
      match self.round().await {
        Ok(Some(peer)) => {
          debug!("{}: mixed with {}", self.address, peer);
          self.rounds.fetch_add(1, Ordering::SeqCst);
        }
        Ok(None) => trace!("{}: no peer to mix with", self.address),
        Err(e) => warn!("{}: mix round abandoned: {}", self.address, e),
      }
      // a fresh trigger restarts from scratch, nothing carries over
      self.signal.reset();
      self.set_phase(MixerPhase::Idle);
    }
    debug!("{}: mixer stopped", self.address);
  }

  async fn round(&mut self) -> Result<Option<Arc<NodeAddress>>, RoundError> {
    let snap = self.directory.list_nodes(&self.address.cluster).await?;
    let peers = snap.without(&self.address);
    let peers = peers.nodes.iter().cloned().collect::<Vec<_>>();
    let peer = match peers.choose(&mut self.rng) {
      Some(p) => p.clone(),
      None => return Ok(None),
    };
    self.set_phase(MixerPhase::Exchanging);
    let reply = self.client.call(&peer, GET_DIFF, Value::Null).await?;
    let peer_diff = decode::<M::Diff>(reply)?;
    let merged = {
      let model = self.model.read();
      let local_diff = model.snapshot_diff();
      model.merge(local_diff, peer_diff)?
    };
    self.set_phase(MixerPhase::Applying);
    {
      self.model.write().apply_diff(merged.clone())?;
    }
    self.client.call(&peer, PUT_DIFF, encode(&merged)?).await?;
    Ok(Some(peer))
  }

  fn set_phase(&self, phase: MixerPhase) {
    let _ = self.phase.send(phase);
  }
}

/// Control handle for a running [`Mixer`].
pub struct MixerHandle {
  phase: watch::Receiver<MixerPhase>,
  shutdown: Arc<Notify>,
  rounds: Arc<AtomicU64>,
  join: JoinHandle<()>,
}
impl MixerHandle {
  /// The mixer's current phase.
  pub fn phase(&self) -> MixerPhase {
    *self.phase.borrow()
  }

  /// Rounds that ran to completion since startup.
  pub fn completed_rounds(&self) -> u64 {
    self.rounds.load(Ordering::SeqCst)
  }

  /// Ask the loop to exit after its current round.
  pub fn stop(&self) {
    self.shutdown.notify_one();
  }

  /// True once the loop has exited.
  pub fn is_stopped(&self) -> bool {
    self.join.is_finished()
  }
}

#[test]
fn test_signal_threshold() {
  let signal = MixSignal::new();
  signal.updated(100);
  // no threshold yet, nothing fires
  assert_eq!(signal.count(), 100);
  signal.set_threshold(150);
  signal.updated(50);
  assert_eq!(signal.count(), 150);
  tokio_test::block_on(signal.triggered());
  signal.reset();
  assert_eq!(signal.count(), 0);
}
