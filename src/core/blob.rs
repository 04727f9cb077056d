use async_trait::async_trait;
use thiserror::Error;

/// Failures raised by the persistence collaborator.
#[derive(Clone, Debug, Error)]
pub enum BlobError {
  /// No blob is stored under the requested id.
  #[error("no blob stored under {0}")]
  NotFound(String),
  /// The store itself failed.
  #[error("blob store failure: {0}")]
  Store(String),
}

/// Persistence collaborator behind the broadcast `save`/`load` surface.
///
/// Layout and byte-level representation are the store's business; the core
/// hands it an opaque serialized model and a key.
#[async_trait]
pub trait BlobStore: Send + Sync {
  /// Store `bytes` under `id`, replacing any previous blob.
  async fn save(&self, id: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

  /// Fetch the blob stored under `id`.
  async fn load(&self, id: &str) -> Result<Vec<u8>, BlobError>;
}
