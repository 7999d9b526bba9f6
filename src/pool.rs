//! Reusable transport connections, keyed by [`Node`].
//!
//! Every connection handed out by [`ConnectionPool::acquire`] is wrapped in a
//! [`PooledConnection`] guard. The guard is consumed by [`PooledConnection::release`], which
//! either puts the connection back into the node's idle list or closes it. A guard that is
//! dropped without being released (e.g. while unwinding) closes its connection, so a borrowed
//! connection is accounted for exactly once.
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::node::Node;
use crate::{ClientError, Result};

/// The byte-stream capability a command needs: line oriented reads, raw block reads, and
/// buffered writes that are pushed out by `flush`.
pub trait Transport {
    /// the node this transport is bound to
    fn node(&self) -> &Node;

    /// buffers `buf` for sending
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// sends everything buffered so far
    fn flush(&mut self) -> Result<()>;

    /// reads one line, without its trailing `\r\n`
    fn read_line(&mut self) -> Result<String>;

    /// reads a `len` byte data block followed by `\r\n`
    fn read_block(&mut self, len: usize) -> Result<Vec<u8>>;
}

/// Pool sizing and socket options.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// maximum number of idle connections kept per node
    pub max_idle_per_node: usize,
    /// timeout for establishing a connection
    pub connect_timeout: Duration,
    /// optional read timeout
    pub read_timeout: Option<Duration>,
    /// optional write timeout
    pub write_timeout: Option<Duration>,
}

impl From<&ClientConfig> for PoolSettings {
    fn from(config: &ClientConfig) -> Self {
        PoolSettings {
            max_idle_per_node: config.max_idle_per_node,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Counters describing the pool's activity since it was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// connections newly established
    pub opened: u64,
    /// acquisitions served from the idle list
    pub reused: u64,
    /// connections released as healthy
    pub returned: u64,
    /// connections closed because they were released as unhealthy (or never released)
    pub discarded: u64,
}

impl PoolStats {
    /// number of connections currently borrowed
    pub fn in_use(&self) -> u64 {
        (self.opened + self.reused).saturating_sub(self.returned + self.discarded)
    }
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

struct PoolInner {
    settings: PoolSettings,
    idle: DashMap<Node, Vec<Connection>>,
    counters: Counters,
}

/// A pool of idle connections per node. Cloning the pool is cheap and clones share the same
/// idle lists.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// creates an empty pool
    pub fn new(settings: PoolSettings) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                settings,
                idle: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// returns an idle connection to `node`, or establishes a new one
    ///
    /// # Errors
    /// [`ClientError::ConnectFailed`] if a new connection could not be established
    pub fn acquire(&self, node: &Node) -> Result<PooledConnection> {
        let idle = self.inner.idle.get_mut(node).and_then(|mut list| list.pop());
        if let Some(conn) = idle {
            self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
            trace!(%node, "reusing idle connection");
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        let conn = Connection::connect(node, &self.inner.settings)?;
        self.inner.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!(%node, "opened new connection");
        Ok(PooledConnection::new(self.inner.clone(), conn))
    }

    /// number of idle connections currently held for `node`
    pub fn idle_count(&self, node: &Node) -> usize {
        self.inner.idle.get(node).map(|list| list.len()).unwrap_or(0)
    }

    /// closes every idle connection
    pub fn clear(&self) {
        self.inner.idle.clear();
    }

    /// a snapshot of the pool's counters
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            opened: c.opened.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            returned: c.returned.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn check_in(&self, conn: Connection) {
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        let mut list = self.idle.entry(conn.node.clone()).or_default();
        if list.len() < self.settings.max_idle_per_node {
            list.push(conn);
        }
    }

    fn discard(&self, conn: Connection) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(node = %conn.node, "discarding connection");
    }
}

/// A connection borrowed from a [`ConnectionPool`].
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    node: Node,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            node: conn.node.clone(),
            conn: Some(conn),
        }
    }

    /// hands the connection back to its pool. A `healthy` connection is kept for reuse,
    /// any other is closed.
    pub fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            if healthy {
                self.pool.check_in(conn);
            } else {
                self.pool.discard(conn);
            }
        }
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("connection already released".into()))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl Transport for PooledConnection {
    fn node(&self) -> &Node {
        &self.node
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.conn()?.write_all(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.conn()?.flush()
    }

    fn read_line(&mut self) -> Result<String> {
        self.conn()?.read_line()
    }

    fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        self.conn()?.read_block(len)
    }
}

/// A single TCP connection to one node.
pub struct Connection {
    node: Node,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn connect(node: &Node, settings: &PoolSettings) -> Result<Self> {
        let connect_failed = |source: io::Error| ClientError::ConnectFailed {
            node: node.clone(),
            source,
        };

        let stream = connect_stream(node, settings.connect_timeout).map_err(connect_failed)?;
        stream.set_read_timeout(settings.read_timeout).map_err(connect_failed)?;
        stream.set_write_timeout(settings.write_timeout).map_err(connect_failed)?;
        stream.set_nodelay(true).map_err(connect_failed)?;
        let tcp_writer = stream.try_clone().map_err(connect_failed)?;

        Ok(Connection {
            node: node.clone(),
            reader: BufReader::new(stream),
            writer: BufWriter::new(tcp_writer),
        })
    }
}

impl Transport for Connection {
    fn node(&self) -> &Node {
        &self.node
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer
            .write_all(buf)
            .map_err(|e| ClientError::io(&self.node, e))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| ClientError::io(&self.node, e))
    }

    fn read_line(&mut self) -> Result<String> {
        read_crlf_line(&mut self.reader).map_err(|e| ClientError::io(&self.node, e))
    }

    fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        read_crlf_block(&mut self.reader, len).map_err(|e| ClientError::io(&self.node, e))
    }
}

/// tries every address the node resolves to, returning the first successful connection
fn connect_stream(node: &Node, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in node.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "node did not resolve to any address")
    }))
}

pub(crate) fn read_crlf_line<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut buf = Vec::with_capacity(64);
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ));
    }
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// largest buffer reserved up front for a data block; longer blocks grow as bytes arrive
const BLOCK_PREALLOC: usize = 64 * 1024;

/// reads a `len` byte block and its `\r\n` terminator. `len` comes from the peer, so the buffer
/// only grows with the bytes actually received.
pub(crate) fn read_crlf_block<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len.min(BLOCK_PREALLOC));
    let wanted = u64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "data block length too large"))?;
    reader.by_ref().take(wanted).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("data block truncated after {} of {} bytes", data.len(), len),
        ));
    }
    let mut terminator = [0u8; 2];
    reader.read_exact(&mut terminator)?;
    if &terminator != b"\r\n" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "data block is not terminated by \\r\\n",
        ));
    }
    Ok(data)
}
