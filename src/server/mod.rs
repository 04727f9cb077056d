//! The per-node model wrapper. A [`ModelServer`] owns the process's single
//! [`Model`] instance and serializes all access to it: client update batches
//! take the exclusive hold, client analysis batches the shared hold, and a
//! mixer-driven diff apply the exclusive hold. Batches never interleave at
//! the statement level, only at the batch level.
//!
//! Batch semantics are best effort with a visible tally: a failing item is
//! logged and skipped, it never rolls back earlier items or aborts the rest
//! of the batch. Updates return how many items applied cleanly; analyses
//! return only the answers that succeeded, so the output may be shorter than
//! the input.

use crate::cluster::Directory;
use crate::core::{
  decode, encode, BlobStore, NodeAddress, RpcClient, RpcService, ServiceError,
};
use crate::mixer::{MixSignal, Mixer, MixerConfig, MixerError, MixerHandle};
use crate::model::{Model, ModelError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_cbor::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Method name under which a node hands out its current diff.
pub const GET_DIFF: &str = "get_diff";
/// Method name under which a node accepts a merged diff.
pub const PUT_DIFF: &str = "put_diff";

type UpdateFn<M> =
  Box<dyn Fn(&mut M, Value) -> Result<(), ModelError> + Send + Sync>;
type AnalysisFn<M> =
  Box<dyn Fn(&M, Value) -> Result<Value, ModelError> + Send + Sync>;

/// Wraps one model instance behind generic update and analysis entry points
/// plus the builtin serving surface (config, id, clear, rows, status,
/// save/load, and the diff endpoints once the mixer runs).
pub struct ModelServer<M: Model> {
  address: Arc<NodeAddress>,
  model: Arc<RwLock<M>>,
  config_blob: RwLock<Option<Value>>,
  blobs: Option<Arc<dyn BlobStore>>,
  signal: Arc<MixSignal>,
  mixer_started: AtomicBool,
  started: Instant,
  update_count: AtomicU64,
  updates: HashMap<String, UpdateFn<M>>,
  analyses: HashMap<String, AnalysisFn<M>>,
}
impl<M: Model> ModelServer<M> {
  /// A server owning `model`, reachable at `address`. Without a blob store
  /// the `save`/`load` surface reports failure.
  pub fn new(
    address: Arc<NodeAddress>,
    model: M,
    blobs: Option<Arc<dyn BlobStore>>,
  ) -> ModelServer<M> {
    ModelServer {
      address: address,
      model: Arc::new(RwLock::new(model)),
      config_blob: RwLock::new(None),
      blobs: blobs,
      signal: Arc::new(MixSignal::new()),
      mixer_started: AtomicBool::new(false),
      started: Instant::now(),
      update_count: AtomicU64::new(0),
      updates: HashMap::new(),
      analyses: HashMap::new(),
    }
  }

  /// Register the model's own capability pair: `update` applying update
  /// records and `calc_score` answering query records.
  pub fn register_model_surface(&mut self) {
    self.register_update("update", |m: &mut M, d| m.apply(d));
    self.register_analysis("calc_score", |m: &M, q| m.query(q));
  }

  /// Register a mutating method. `f` is applied per item under the
  /// exclusive hold; the RPC reply is the clean-apply count.
  pub fn register_update<D, F>(&mut self, name: &str, f: F)
  where
    D: DeserializeOwned + Send + 'static,
    F: Fn(&mut M, D) -> Result<(), ModelError> + Send + Sync + 'static,
  {
    let item = move |m: &mut M, v: Value| -> Result<(), ModelError> {
      let d = decode::<D>(v).map_err(|e| ModelError::Malformed(e.to_string()))?;
      f(m, d)
    };
    self.updates.insert(name.to_string(), Box::new(item));
  }

  /// Register a read-only method. `f` runs per query under the shared hold;
  /// the RPC reply is the sequence of successful answers.
  pub fn register_analysis<Q, R, F>(&mut self, name: &str, f: F)
  where
    Q: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(&M, Q) -> Result<R, ModelError> + Send + Sync + 'static,
  {
    let item = move |m: &M, v: Value| -> Result<Value, ModelError> {
      let q = decode::<Q>(v).map_err(|e| ModelError::Malformed(e.to_string()))?;
      let r = f(m, q)?;
      encode(&r).map_err(|e| ModelError::Other(e.to_string()))
    };
    self.analyses.insert(name.to_string(), Box::new(item));
  }

  /// Apply a batch of update records in order under the exclusive hold.
  /// Per-item failures are logged and skipped; earlier items stay applied.
  /// Returns the clean-apply count and signals the mixer on success.
  pub fn update<D, F>(&self, f: F, name: &str, items: Vec<D>) -> usize
  where
    F: Fn(&mut M, D) -> Result<(), ModelError>,
  {
    let mut success = 0usize;
    {
      let mut model = self.model.write();
      for (i, item) in items.into_iter().enumerate() {
        match f(&mut model, item) {
          Ok(()) => success += 1,
          Err(e) => warn!("update {} item {} skipped: {}", name, i, e),
        }
      }
    }
    self.mark_dirty(success as u64);
    success
  }

  /// Evaluate a batch of queries under the shared hold. Failing queries are
  /// logged and skipped, so the output may be shorter than the input.
  pub fn analysis<Q, R, F>(&self, f: F, name: &str, queries: Vec<Q>) -> Vec<R>
  where
    F: Fn(&M, Q) -> Result<R, ModelError>,
  {
    let model = self.model.read();
    let mut results = Vec::new();
    for (i, query) in queries.into_iter().enumerate() {
      match f(&model, query) {
        Ok(r) => results.push(r),
        Err(e) => warn!("analysis {} query {} skipped: {}", name, i, e),
      }
    }
    results
  }

  /// Start the anti-entropy mixer for this node's model. Registers the diff
  /// endpoints and spawns the background loop. Calling this twice is a
  /// startup-order programming error: the second call fails immediately and
  /// the running mixer is untouched.
  pub fn start_mixer(
    &self,
    directory: Arc<dyn Directory>,
    client: Arc<dyn RpcClient>,
    config: MixerConfig,
  ) -> Result<MixerHandle, MixerError> {
    if self.mixer_started.swap(true, Ordering::SeqCst) {
      return Err(MixerError::AlreadyStarted);
    }
    let mixer = Mixer::new(
      self.address.clone(),
      self.model.clone(),
      directory,
      client,
      self.signal.clone(),
      config,
    );
    Ok(mixer.spawn())
  }

  /// This node's address.
  pub fn address(&self) -> &Arc<NodeAddress> {
    &self.address
  }

  /// Updates applied over the server's lifetime.
  pub fn update_count(&self) -> u64 {
    self.update_count.load(Ordering::SeqCst)
  }

  fn mark_dirty(&self, n: u64) {
    if n > 0 {
      self.update_count.fetch_add(n, Ordering::SeqCst);
      self.signal.updated(n);
    }
  }

  fn status(&self) -> Value {
    let text = |s: String| Value::Text(s);
    let mut row = BTreeMap::new();
    row.insert(
      text("uptime_secs".to_string()),
      text(self.started.elapsed().as_secs().to_string()),
    );
    row.insert(
      text("update_count".to_string()),
      text(self.update_count().to_string()),
    );
    row.insert(
      text("rows".to_string()),
      text(self.model.read().rows().len().to_string()),
    );
    row.insert(
      text("mixer_running".to_string()),
      text(self.mixer_started.load(Ordering::SeqCst).to_string()),
    );
    let mut outer = BTreeMap::new();
    outer.insert(text(self.address.host_port()), Value::Map(row));
    Value::Map(outer)
  }

  fn batch_args(
    method: &str,
    args: Value,
  ) -> Result<(String, Vec<Value>), ServiceError> {
    let mut parts = match args {
      Value::Array(v) => v.into_iter(),
      _ => {
        return Err(bad_args(method, "expected [name, items]"));
      }
    };
    let name = match parts.next() {
      Some(Value::Text(s)) => s,
      _ => return Err(bad_args(method, "first argument must be a string")),
    };
    let items = match parts.next() {
      Some(Value::Array(v)) => v,
      None => Vec::new(),
      _ => return Err(bad_args(method, "second argument must be a sequence")),
    };
    Ok((name, items))
  }

  fn key_arg(method: &str, args: Value) -> Result<String, ServiceError> {
    match args {
      Value::Array(v) => match v.into_iter().next() {
        Some(Value::Text(s)) => Ok(s),
        _ => Err(bad_args(method, "first argument must be a string")),
      },
      _ => Err(bad_args(method, "expected [key, ..]")),
    }
  }

  async fn save(&self, id: &str) -> Result<Value, ServiceError> {
    let blobs = self
      .blobs
      .as_ref()
      .ok_or_else(|| ServiceError::Failed("no blob store attached".to_string()))?;
    let bytes = {
      self
        .model
        .read()
        .serialize()
        .map_err(|e| ServiceError::Failed(e.to_string()))?
    };
    let key = format!("{}/{}", id, self.address.host_port());
    blobs
      .save(&key, bytes)
      .await
      .map_err(|e| ServiceError::Failed(e.to_string()))?;
    Ok(Value::Bool(true))
  }

  async fn load(&self, id: &str) -> Result<Value, ServiceError> {
    let blobs = self
      .blobs
      .as_ref()
      .ok_or_else(|| ServiceError::Failed("no blob store attached".to_string()))?;
    let key = format!("{}/{}", id, self.address.host_port());
    let bytes = blobs
      .load(&key)
      .await
      .map_err(|e| ServiceError::Failed(e.to_string()))?;
    self
      .model
      .write()
      .deserialize(&bytes)
      .map_err(|e| ServiceError::Failed(e.to_string()))?;
    Ok(Value::Bool(true))
  }

  fn get_diff(&self) -> Result<Value, ServiceError> {
    // the diff endpoints only exist once the mixer is running
    if !self.mixer_started.load(Ordering::SeqCst) {
      return Err(ServiceError::UnknownMethod(GET_DIFF.to_string()));
    }
    let diff = self.model.read().snapshot_diff();
    encode(&diff).map_err(|e| ServiceError::Failed(e.to_string()))
  }

  fn put_diff(&self, args: Value) -> Result<Value, ServiceError> {
    if !self.mixer_started.load(Ordering::SeqCst) {
      return Err(ServiceError::UnknownMethod(PUT_DIFF.to_string()));
    }
    let diff = decode::<M::Diff>(args)
      .map_err(|e| ServiceError::Failed(e.to_string()))?;
    self
      .model
      .write()
      .apply_diff(diff)
      .map_err(|e| ServiceError::Failed(e.to_string()))?;
    Ok(Value::Bool(true))
  }
}

#[async_trait]
impl<M: Model> RpcService for ModelServer<M> {
  async fn handle(
    &self,
    method: &str,
    args: Value,
  ) -> Result<Value, ServiceError> {
    match method {
      GET_DIFF => self.get_diff(),
      PUT_DIFF => self.put_diff(args),
      "set_config" => {
        // the config blob is the second argument, not a batch
        let mut parts = match args {
          Value::Array(v) => v.into_iter(),
          _ => return Err(bad_args(method, "expected [name, config]")),
        };
        let _name = parts.next();
        let config = parts
          .next()
          .ok_or_else(|| bad_args(method, "missing config value"))?;
        *self.config_blob.write() = Some(config);
        Ok(Value::Bool(true))
      }
      "get_config" => match self.config_blob.read().clone() {
        Some(c) => Ok(c),
        None => {
          Err(ServiceError::Failed("no config has been distributed".to_string()))
        }
      },
      "get_id" => Ok(Value::Text(self.address.host_port())),
      "clear" => {
        self.model.write().clear();
        Ok(Value::Bool(true))
      }
      "clear_row" => {
        let key = Self::key_arg(method, args)?;
        let cleared = {
          let mut model = self.model.write();
          match model.clear_row(&key) {
            Ok(()) => true,
            Err(e) => {
              warn!("clear_row {} failed: {}", key, e);
              false
            }
          }
        };
        if cleared {
          self.mark_dirty(1);
        }
        Ok(Value::Bool(cleared))
      }
      "get_all_rows" => {
        let rows = self.model.read().rows();
        Ok(Value::Array(rows.into_iter().map(Value::Text).collect()))
      }
      "get_status" => Ok(self.status()),
      "save" => {
        let id = Self::key_arg(method, args)?;
        self.save(&id).await
      }
      "load" => {
        let id = Self::key_arg(method, args)?;
        self.load(&id).await
      }
      _ => {
        if let Some(f) = self.updates.get(method) {
          let (name, items) = Self::batch_args(method, args)?;
          let count = self.update(|m, v| f(m, v), &name, items);
          Ok(Value::Integer(count as i128))
        } else if let Some(f) = self.analyses.get(method) {
          let (name, queries) = Self::batch_args(method, args)?;
          let results = self.analysis(|m, v| f(m, v), &name, queries);
          Ok(Value::Array(results))
        } else {
          Err(ServiceError::UnknownMethod(method.to_string()))
        }
      }
    }
  }
}

fn bad_args(method: &str, reason: &str) -> ServiceError {
  ServiceError::BadArgs {
    method: method.to_string(),
    reason: reason.to_string(),
  }
}
