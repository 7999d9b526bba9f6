#![deny(missing_docs)]
//! A client library for a consistent-hashing key-value cluster.
//!
//! The cluster spreads keys over its physical nodes with a hash ring. This crate keeps a local
//! copy of that ring, so every request goes straight to the node owning its key.
//!
//! ## RingClient
//! [`RingClient`] is the entry point. It is opened with one or more seed nodes, tries them in
//! order until one hands out the cluster's topology, and from then on:
//! - routes `get`, `put`, `append`, `prepend`, `add`, `cas`, `delete`, `incr`, `decr` and
//! `expire` to the owning node
//! - fetches many keys at once with [`RingClient::gets`], sending a single request per node
//! involved, either sequentially or in parallel on a [`ThreadPool`]
//! - refreshes its routing table in the background, swapping in a new ring only when the
//! topology's fingerprint changed
//!
//! ## Routing
//! The [`routing`] module holds the [`Ring`] (an ordered map from ring positions to nodes) and
//! the [`RoutingTable`], which publishes immutable ring snapshots to concurrent readers. A key is
//! owned by the first position at or after its hash, wrapping around to the lowest position.
//!
//! ## Protocol
//! Requests are line oriented text. Each operation is a [`Command`](protocol::Command) that
//! renders its request, exchanges it over a connection borrowed from the [`ConnectionPool`], and
//! parses the reply. See the [`protocol`] module for the wire format.
//!
//! ## ringkv-client
//! A small command line executable, `ringkv-client`, wraps the library to query a cluster from a
//! shell.

pub use client::{RingClient, COUNTER_NOT_FOUND};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use expiry::Expiry;
pub use hash::{HashAlgorithm, KeyHasher};
pub use node::Node;
pub use pool::{ConnectionPool, PoolSettings, PoolStats, PooledConnection, Transport};
pub use protocol::{CasResponse, CasValue, Executor};
pub use routing::{RefreshLoop, Ring, RoutingTable, TopologyDump, TopologySource};
pub use thread_pool::{RayonThreadPool, SharedQueueThreadPool, ThreadPool};

pub mod batch;
mod client;
mod config;
mod error;
mod expiry;
mod hash;
mod node;
mod pool;
pub mod protocol;
pub mod routing;
pub mod thread_pool;
