#![warn(missing_docs)]

//! `Confluo` is the serving core of a distributed online-model cluster. A
//! front-end [`Keeper`](crate::keeper::Keeper) routes client RPCs to worker
//! nodes by a per-method policy (broadcast, random, or consistent-hash) and
//! folds their replies with a per-method aggregator. Each worker wraps one
//! mutable [`Model`](crate::model::Model) in a
//! [`ModelServer`](crate::server::ModelServer), and an optional background
//! [`Mixer`](crate::mixer::Mixer) exchanges model diffs with peers so that
//! replicas converge without a single point of truth.
//!
//! The model algorithm, the wire transport, the membership store and blob
//! persistence are consumed through traits in [`core`], [`cluster`] and
//! [`model`]. [`testkit`] provides in-memory stand-ins for all of them.

pub mod cluster;
pub mod core;
pub mod keeper;
pub mod mixer;
pub mod model;
pub mod server;
pub mod testkit;
