use crate::core::NodeAddress;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_cbor::Value;
use std::sync::Arc;
use thiserror::Error;

/// Failures raised by the transport collaborator on the calling side.
///
/// The core never retries on these; whether a call is retried is the
/// client's decision, not the dispatcher's.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
  /// The destination could not be reached at all.
  #[error("{0} is unreachable")]
  Unreachable(String),
  /// The call did not complete within the transport's timeout.
  #[error("call to {0} timed out")]
  Timeout(String),
  /// Arguments or results could not be (de)serialized.
  #[error("codec failure: {0}")]
  Codec(String),
  /// The remote service handled the call and reported an error.
  #[error("remote call failed: {0}")]
  Remote(String),
}

/// Failures a service reports back through the transport.
#[derive(Clone, Debug, Error)]
pub enum ServiceError {
  /// No handler is registered under the requested method name.
  #[error("unknown method {0}")]
  UnknownMethod(String),
  /// The arguments did not have the shape the method expects.
  #[error("bad arguments for {method}: {reason}")]
  BadArgs {
    /// The method whose arguments were rejected.
    method: String,
    /// Why they were rejected.
    reason: String,
  },
  /// The handler ran and failed.
  #[error("{0}")]
  Failed(String),
}

/// Outbound half of the RPC transport collaborator.
///
/// The core treats this as a black box: framing, encoding, connection
/// pooling and timeouts all live behind it.
#[async_trait]
pub trait RpcClient: Send + Sync {
  /// Call `method` on the node at `addr`. Blocks the calling task for the
  /// duration of the round trip; there is no cancellation primitive beyond
  /// the transport's own timeout.
  async fn call(
    &self,
    addr: &NodeAddress,
    method: &str,
    args: Value,
  ) -> Result<Value, TransportError>;
}

/// Something that answers RPCs: the keeper and every model server.
#[async_trait]
pub trait RpcService: Send + Sync {
  /// Handle one call. Batch semantics, locking and error swallowing are the
  /// implementor's business; whatever comes back here travels to the caller
  /// verbatim.
  async fn handle(
    &self,
    method: &str,
    args: Value,
  ) -> Result<Value, ServiceError>;
}

/// Inbound half of the transport collaborator: accepts connections and
/// drives a [`RpcService`] with decoded calls.
#[async_trait]
pub trait RpcServer: Send + Sync {
  /// Serve `service` until the transport shuts down.
  async fn serve(
    &self,
    service: Arc<dyn RpcService>,
  ) -> Result<(), TransportError>;
}

/// Encode a typed value into the dispatch boundary representation.
pub fn encode<T: Serialize>(v: &T) -> Result<Value, TransportError> {
  serde_cbor::value::to_value(v).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Decode a typed value out of the dispatch boundary representation.
pub fn decode<T: DeserializeOwned>(v: Value) -> Result<T, TransportError> {
  serde_cbor::value::from_value(v)
    .map_err(|e| TransportError::Codec(e.to_string()))
}
