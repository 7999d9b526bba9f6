//! The text protocol spoken with cluster nodes.
//!
//! Every operation is a [`Command`]. Running a command is always the same four steps:
//!
//! 1. [`Command::create`] renders the request line(s),
//! 2. [`Command::send_and_receive`] writes the request to a pooled connection and reads the
//!    raw response,
//! 3. [`Command::parse_result`] turns the raw response into a typed result,
//! 4. [`Executor::execute_on`] drives the three steps above, always hands the connection back to
//!    the pool, and logs any failure before returning it unchanged.
//!
//! ## Wire format
//! Keys are sent as `<key>\x1b<hash-name>`. Lines end with `\r\n`. Responses that carry values
//! are a sequence of `VALUE <key> <flags> <length> [<cas>]` headers, each followed by the data
//! block, and are terminated by an `END` line. A line starting with `SERVER_ERROR`,
//! `CLIENT_ERROR` or `ERROR` is an error reply.
use std::fmt;
use std::sync::Arc;

use tracing::{error, trace};

use crate::hash::KeyHasher;
use crate::node::Node;
use crate::pool::{ConnectionPool, Transport};
use crate::routing::{RoutingTable, TopologyDump, TopologySource};
use crate::{ClientError, Result};

mod commands;

pub use self::commands::{
    CasCommand, CasResponse, CasValue, CounterCommand, CounterOp, DeleteCommand, ExpireCommand,
    GetCommand, GetsCommand, GetsWithTokenCommand, RoutingDigestCommand, RoutingDumpCommand,
    StoreCommand, StoreVerb,
};

/// line terminator
pub const CRLF: &[u8] = b"\r\n";

/// separates a key from its hash-name on the wire
pub const KEY_SEPARATOR: char = '\x1b';

const END: &str = "END";
const VALUE: &str = "VALUE";

/// Identifies the kind of a command, for logging and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// single key retrieval
    Get,
    /// multi key retrieval
    Gets,
    /// multi key retrieval including cas tokens
    GetsWithToken,
    /// store unconditionally
    Set,
    /// store if absent
    Add,
    /// append to an existing value
    Append,
    /// prepend to an existing value
    Prepend,
    /// remove a key
    Delete,
    /// increment a counter
    Incr,
    /// decrement a counter
    Decr,
    /// compare-and-swap store
    Cas,
    /// change a key's expiry
    Expire,
    /// fetch the topology dump
    RoutingDump,
    /// fetch the topology digest
    RoutingDigest,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Get => "get",
            CommandKind::Gets => "gets",
            CommandKind::GetsWithToken => "gets-with-token",
            CommandKind::Set => "set",
            CommandKind::Add => "add",
            CommandKind::Append => "append",
            CommandKind::Prepend => "prepend",
            CommandKind::Delete => "delete",
            CommandKind::Incr => "incr",
            CommandKind::Decr => "decr",
            CommandKind::Cas => "cas",
            CommandKind::Expire => "expire",
            CommandKind::RoutingDump => "routingdump",
            CommandKind::RoutingDigest => "routing-digest",
        };
        f.write_str(name)
    }
}

/// Per invocation values a request is rendered with, besides the command's own fields.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    /// the hash-name appended to keys
    pub hash_name: &'a str,
    /// the ring hash of the command's key, `0` for commands without a key
    pub hash: u64,
}

/// One `VALUE` block of a retrieval response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueBlock {
    /// the key, without its hash-name
    pub key: String,
    /// opaque flags stored with the value
    pub flags: u32,
    /// the value bytes
    pub data: Vec<u8>,
    /// the cas token, present in `gets` responses
    pub cas: Option<u64>,
}

/// A response as read off the wire, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResponse {
    /// a single status line
    Line(String),
    /// value blocks of a retrieval response, `END` excluded
    Values(Vec<ValueBlock>),
    /// the lines of a listing response, `END` excluded
    Lines(Vec<String>),
}

impl RawResponse {
    /// the status line, or a protocol error naming the command if the response was not a line
    pub(crate) fn into_line(self, kind: CommandKind) -> Result<String> {
        match self {
            RawResponse::Line(line) => Ok(line),
            other => Err(unexpected(kind, &other)),
        }
    }
}

/// A unit of protocol behavior.
///
/// Implementations carry the typed parameters of one request. They are stateless with respect
/// to the connection: everything needed to talk to the node is passed into each step.
pub trait Command {
    /// the typed result of the command
    type Output;

    /// the kind of this command
    fn kind(&self) -> CommandKind;

    /// the key used to route this command, `None` for node-directed commands
    fn key(&self) -> Option<&str>;

    /// every key the command touches. Defaults to the routing key.
    fn keys(&self) -> Vec<&str> {
        self.key().into_iter().collect()
    }

    /// step 1: renders the request
    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>>;

    /// step 2: writes `request` and reads the raw response. The default reads one line.
    fn send_and_receive(&self, conn: &mut dyn Transport, request: &[u8]) -> Result<RawResponse> {
        conn.write_all(request)?;
        conn.flush()?;
        Ok(RawResponse::Line(conn.read_line()?))
    }

    /// step 3: interprets the raw response
    fn parse_result(&self, response: RawResponse) -> Result<Self::Output>;
}

/// returns the line unchanged unless it is an error reply, which becomes a
/// [`ClientError::Protocol`] carrying the raw message
pub fn check_error(line: &str) -> Result<&str> {
    const ERROR_PREFIXES: [&str; 3] = ["SERVER_ERROR", "CLIENT_ERROR", "ERROR"];
    if ERROR_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
        Err(ClientError::Protocol(line.to_string()))
    } else {
        Ok(line)
    }
}

/// renders `key` as it appears on the wire
pub fn wire_key(key: &str, hash_name: &str) -> String {
    format!("{}{}{}", key, KEY_SEPARATOR, hash_name)
}

fn strip_hash_name(key: &str) -> &str {
    key.split(KEY_SEPARATOR).next().unwrap_or(key)
}

pub(crate) fn unexpected(kind: CommandKind, response: &RawResponse) -> ClientError {
    ClientError::Protocol(format!("unexpected {} response: {:?}", kind, response))
}

/// reads `VALUE` blocks up to the `END` line.
///
/// Any other line ends the response early and is returned as [`RawResponse::Line`].
pub(crate) fn read_values(conn: &mut dyn Transport) -> Result<RawResponse> {
    let mut blocks = Vec::new();
    loop {
        let line = conn.read_line()?;
        if line == END {
            return Ok(RawResponse::Values(blocks));
        }
        let (key, flags, len, cas) = match parse_value_header(&line) {
            Some(header) => header,
            None if line.starts_with(VALUE) => {
                return Err(ClientError::Protocol(format!("malformed value header {:?}", line)))
            }
            None => return Ok(RawResponse::Line(line)),
        };
        let data = conn.read_block(len)?;
        trace!(key, len, "read value block");
        blocks.push(ValueBlock {
            key: strip_hash_name(key).to_string(),
            flags,
            data,
            cas,
        });
    }
}

/// reads lines up to the `END` line.
///
/// An error reply is a single line, so it is returned as [`RawResponse::Line`] for the command
/// to interpret.
pub(crate) fn read_listing(conn: &mut dyn Transport) -> Result<RawResponse> {
    let first = conn.read_line()?;
    if check_error(&first).is_err() {
        return Ok(RawResponse::Line(first));
    }
    let mut lines = Vec::new();
    let mut line = first;
    while line != END {
        lines.push(line);
        line = conn.read_line()?;
    }
    Ok(RawResponse::Lines(lines))
}

fn parse_value_header(line: &str) -> Option<(&str, u32, usize, Option<u64>)> {
    let mut fields = line.split(' ');
    if fields.next()? != VALUE {
        return None;
    }
    let key = fields.next()?;
    let flags = fields.next()?.parse().ok()?;
    let len = fields.next()?.parse().ok()?;
    let cas = match fields.next() {
        Some(cas) => Some(cas.parse().ok()?),
        None => None,
    };
    if fields.next().is_some() {
        return None;
    }
    Some((key, flags, len, cas))
}

/// Routes commands to nodes and runs them over pooled connections.
pub struct Executor {
    pool: ConnectionPool,
    routing: Arc<RoutingTable>,
    hasher: Arc<dyn KeyHasher>,
    hash_name: String,
}

impl Executor {
    /// creates an executor
    pub fn new(
        pool: ConnectionPool,
        routing: Arc<RoutingTable>,
        hasher: Arc<dyn KeyHasher>,
        hash_name: impl Into<String>,
    ) -> Self {
        Executor {
            pool,
            routing,
            hasher,
            hash_name: hash_name.into(),
        }
    }

    /// the connection pool commands run on
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// the routing table used to resolve keys
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// the ring hash of `key`
    pub fn hash_key(&self, key: &str) -> u64 {
        self.hasher.hash(key.as_bytes())
    }

    /// the node currently owning `key`
    pub fn node_for(&self, key: &str) -> Result<Node> {
        self.routing.resolve(self.hash_key(key))
    }

    /// runs `cmd` against the node owning its key
    pub fn execute<C: Command>(&self, cmd: &C) -> Result<C::Output> {
        let key = cmd.key().ok_or_else(|| {
            ClientError::Argument(format!("{} command has no key to route by", cmd.kind()))
        })?;
        let node = self.node_for(key).map_err(|e| {
            error!(command = %cmd.kind(), key, error = %e, "could not route command");
            e
        })?;
        self.execute_on(&node, cmd)
    }

    /// runs `cmd` against `node`.
    ///
    /// The connection is released whatever the outcome: it is returned to the pool unless the
    /// exchange itself failed, in which case it is closed. Errors are logged with the command's
    /// kind and key, then returned unchanged.
    pub fn execute_on<C: Command>(&self, node: &Node, cmd: &C) -> Result<C::Output> {
        let result = self.run(node, cmd);
        if let Err(e) = &result {
            error!(
                command = %cmd.kind(),
                keys = ?cmd.keys(),
                %node,
                error = %e,
                "command failed"
            );
        }
        result
    }

    fn run<C: Command>(&self, node: &Node, cmd: &C) -> Result<C::Output> {
        let target = Target {
            hash_name: &self.hash_name,
            hash: cmd.key().map(|k| self.hash_key(k)).unwrap_or(0),
        };
        let request = cmd.create(&target)?;

        let mut conn = self.pool.acquire(node)?;
        let response = match cmd.send_and_receive(&mut conn, &request) {
            Ok(response) => {
                conn.release(true);
                response
            }
            Err(e) => {
                conn.release(false);
                return Err(e);
            }
        };
        cmd.parse_result(response)
    }
}

impl TopologySource for Executor {
    fn fetch_topology(&self, node: &Node) -> Result<TopologyDump> {
        self.execute_on(node, &RoutingDumpCommand)
    }
}
