use std::io;
use thiserror::Error;

use crate::node::Node;

/// type alias for all operations of a [`RingClient`](crate::RingClient) that could fail with a
/// [`ClientError`]
pub type Result<T> = std::result::Result<T, ClientError>;

/// The Error variants surfaced by the client.
///
/// Transport level failures ([`ClientError::ConnectFailed`] and [`ClientError::Io`]) cause the
/// connection involved to be discarded instead of returned to the pool. They are never retried
/// within the same call.
#[derive(Debug, Error)]
pub enum ClientError {
    /// a required input was missing, empty or malformed
    #[error("invalid argument: {0}")]
    Argument(String),

    /// a transport connection to `node` could not be established
    #[error("could not connect to {node}: {source}")]
    ConnectFailed {
        /// the node being connected to
        node: Node,
        /// the underlying IO error
        source: io::Error,
    },

    /// a read or write on an established connection failed (timeouts included)
    #[error("transport error on {node}: {source}")]
    Io {
        /// the node the connection is bound to
        node: Node,
        /// the underlying IO error
        source: io::Error,
    },

    /// the topology dump returned by a node could not be parsed
    #[error("malformed topology: {0}")]
    MalformedTopology(String),

    /// a key lookup was attempted before the routing table was initialized
    #[error("routing table is empty")]
    EmptyRoutingTable,

    /// the server returned an error line, or a response that could not be parsed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// an operation was attempted while the client is closed
    #[error("client is not open")]
    NotOpen,

    /// every seed node failed during bootstrap
    #[error("bootstrap failed on every seed node: {}", .failures.join("; "))]
    Bootstrap {
        /// one entry per failed seed, in the order they were tried
        failures: Vec<String>,
    },

    /// one partition of a batch retrieval failed; `keys` are the keys requested from `node`
    #[error("batch retrieval of {} keys from {node} failed: {source}", .keys.len())]
    Batch {
        /// the node the partition was sent to
        node: Node,
        /// the keys of the failed partition
        keys: Vec<String>,
        /// the partition's error
        source: Box<ClientError>,
    },

    /// the batch worker pool is unavailable or lost a task
    #[error("worker pool error: {0}")]
    ThreadPool(String),

    /// the client configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// returns `true` for network level failures. A connection that observed one of these
    /// must not be reused.
    pub fn is_transport(&self) -> bool {
        match self {
            ClientError::ConnectFailed { .. } | ClientError::Io { .. } => true,
            ClientError::Batch { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    pub(crate) fn io(node: &Node, source: io::Error) -> Self {
        ClientError::Io {
            node: node.clone(),
            source,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Config(e.to_string())
    }
}
