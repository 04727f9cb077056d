//! The capability seam for the served model. The core never looks inside a
//! model: it applies update records, answers query records, and moves
//! [`Model::Diff`]s around for the mixer. The concrete learning or scoring
//! algorithm lives entirely behind this trait.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// A failure raised by the model for a single record.
///
/// These are caught and logged at batch boundaries and never abort the rest
/// of the batch; callers see reduced success counts or shortened result
/// sequences instead of a failed RPC.
#[derive(Clone, Debug, Error)]
pub enum ModelError {
  /// No row exists under the given key.
  #[error("row {0} does not exist")]
  UnknownRow(String),
  /// A record could not be interpreted by the model.
  #[error("malformed record: {0}")]
  Malformed(String),
  /// A diff could not be merged or applied to this model.
  #[error("incompatible diff: {0}")]
  IncompatibleDiff(String),
  /// Anything else the model wants to report.
  #[error("{0}")]
  Other(String),
}

/// One mutable in-memory model instance, owned exclusively by a single
/// [`ModelServer`](crate::server::ModelServer) process.
///
/// Exactly one instance is live per worker; mutation is always mediated by
/// the server's exclusion mechanism, so implementations need no internal
/// locking. Two diffs of the same model type must merge associatively and
/// commutatively enough that mixer rounds converge in any peer order; that
/// guarantee is the model's to keep, the core only invokes `merge`.
pub trait Model: Send + Sync + 'static {
  /// A mutating record, e.g. one observation for a row.
  type Update: DeserializeOwned + Send;
  /// A non-mutating query record.
  type Query: DeserializeOwned + Send;
  /// The answer to one query.
  type Output: Serialize + Send;
  /// A mergeable delta of the model's recent changes. Transient: created and
  /// consumed within one mixer round.
  type Diff: Serialize + DeserializeOwned + Clone + Send;

  /// Apply one update record.
  fn apply(&mut self, update: Self::Update) -> Result<(), ModelError>;

  /// Answer one query record against the current state.
  fn query(&self, query: Self::Query) -> Result<Self::Output, ModelError>;

  /// Produce a diff of this model's state for a mixer round.
  fn snapshot_diff(&self) -> Self::Diff;

  /// Combine two diffs into one without the full model state.
  fn merge(
    &self,
    ours: Self::Diff,
    theirs: Self::Diff,
  ) -> Result<Self::Diff, ModelError>;

  /// Fold a (possibly merged) diff back into this model.
  fn apply_diff(&mut self, diff: Self::Diff) -> Result<(), ModelError>;

  /// Drop all state.
  fn clear(&mut self);

  /// Drop one named row, unlike the whole-model [`clear`](Model::clear).
  fn clear_row(&mut self, key: &str) -> Result<(), ModelError>;

  /// The keys of all live rows.
  fn rows(&self) -> Vec<String>;

  /// Serialize the full state to a blob for persistence.
  fn serialize(&self) -> Result<Vec<u8>, ModelError>;

  /// Replace this model's state from a persisted blob.
  fn deserialize(&mut self, bytes: &[u8]) -> Result<(), ModelError>;
}
