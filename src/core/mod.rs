//! Node identity and the collaborator seams every other module builds on:
//! the RPC transport ([`RpcClient`], [`RpcServer`], [`RpcService`]) and blob
//! persistence ([`BlobStore`]).
//!
//! The dispatch boundary speaks [`serde_cbor::Value`]. Typed handlers decode
//! their arguments from it and encode their results back into it with
//! [`encode`] and [`decode`]; byte-level framing stays inside whatever
//! implements the transport traits.

mod address;
mod blob;
mod transport;

pub use {
  address::Host,
  address::NodeAddress,
  blob::BlobError,
  blob::BlobStore,
  transport::decode,
  transport::encode,
  transport::RpcClient,
  transport::RpcServer,
  transport::RpcService,
  transport::ServiceError,
  transport::TransportError,
};
