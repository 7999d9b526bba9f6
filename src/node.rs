use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::vec;

use crate::{ClientError, Result};

/// The identity of a cluster member: a host name and a port.
///
/// A node's text form is `host_port` (e.g. `localhost_11211`), which is also how nodes are
/// identified inside a topology dump. `host:port` is accepted when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    host: String,
    port: u16,
}

impl Node {
    /// creates a node for the given `host` and `port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Node {
            host: host.into(),
            port,
        }
    }

    /// the host name or IP address of this node
    pub fn host(&self) -> &str {
        &self.host
    }

    /// the port this node listens on
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.host, self.port)
    }
}

impl FromStr for Node {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once('_')
            .or_else(|| s.rsplit_once(':'))
            .ok_or_else(|| ClientError::Argument(format!("node identity {:?} has no port", s)))?;
        if host.is_empty() {
            return Err(ClientError::Argument(format!("node identity {:?} has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClientError::Argument(format!("invalid port in node identity {:?}", s)))?;
        Ok(Node::new(host, port))
    }
}

impl From<SocketAddr> for Node {
    fn from(addr: SocketAddr) -> Self {
        Node::new(addr.ip().to_string(), addr.port())
    }
}

impl ToSocketAddrs for Node {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}
