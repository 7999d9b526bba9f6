use std::collections::HashMap;
use std::str::FromStr;

use num_bigint::BigInt;

use super::{
    check_error, read_listing, read_values, unexpected, wire_key, Command, CommandKind,
    RawResponse, Target, CRLF,
};
use crate::expiry::Expiry;
use crate::pool::Transport;
use crate::routing::TopologyDump;
use crate::{ClientError, Result};

/// Retrieves the value of a single key.
#[derive(Debug, Clone)]
pub struct GetCommand<'a> {
    /// the key to fetch
    pub key: &'a str,
}

impl Command for GetCommand<'_> {
    type Output = Option<Vec<u8>>;

    fn kind(&self) -> CommandKind {
        CommandKind::Get
    }

    fn key(&self) -> Option<&str> {
        Some(self.key)
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        Ok(format!("get {}\r\n", wire_key(self.key, target.hash_name)).into_bytes())
    }

    fn send_and_receive(&self, conn: &mut dyn Transport, request: &[u8]) -> Result<RawResponse> {
        conn.write_all(request)?;
        conn.flush()?;
        read_values(conn)
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        match response {
            RawResponse::Values(blocks) => Ok(blocks
                .into_iter()
                .find(|block| block.key == self.key)
                .map(|block| block.data)),
            RawResponse::Line(line) => {
                check_error(&line)?;
                Err(unexpected(self.kind(), &RawResponse::Line(line)))
            }
            other => Err(unexpected(self.kind(), &other)),
        }
    }
}

/// A value together with its cas token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasValue {
    /// the stored bytes
    pub value: Vec<u8>,
    /// the version token to pass to a later `cas`
    pub token: u64,
}

fn multi_get_request(verb: &str, keys: &[String], target: &Target<'_>) -> Result<Vec<u8>> {
    if keys.is_empty() {
        return Err(ClientError::Argument("multi-key retrieval needs at least one key".into()));
    }
    let mut request = String::from(verb);
    for key in keys {
        request.push(' ');
        request.push_str(&wire_key(key, target.hash_name));
    }
    request.push_str("\r\n");
    Ok(request.into_bytes())
}

fn multi_get_blocks(kind: CommandKind, response: RawResponse) -> Result<Vec<super::ValueBlock>> {
    match response {
        RawResponse::Values(blocks) => Ok(blocks),
        RawResponse::Line(line) => {
            check_error(&line)?;
            Err(unexpected(kind, &RawResponse::Line(line)))
        }
        other => Err(unexpected(kind, &other)),
    }
}

/// Retrieves several keys held by one node in a single round trip.
#[derive(Debug, Clone)]
pub struct GetsCommand {
    /// the keys to fetch
    pub keys: Vec<String>,
}

impl Command for GetsCommand {
    type Output = HashMap<String, Vec<u8>>;

    fn kind(&self) -> CommandKind {
        CommandKind::Gets
    }

    fn key(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys.iter().map(String::as_str).collect()
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        multi_get_request("get", &self.keys, target)
    }

    fn send_and_receive(&self, conn: &mut dyn Transport, request: &[u8]) -> Result<RawResponse> {
        conn.write_all(request)?;
        conn.flush()?;
        read_values(conn)
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        Ok(multi_get_blocks(self.kind(), response)?
            .into_iter()
            .map(|block| (block.key, block.data))
            .collect())
    }
}

/// Retrieves several keys held by one node, with their cas tokens.
#[derive(Debug, Clone)]
pub struct GetsWithTokenCommand {
    /// the keys to fetch
    pub keys: Vec<String>,
}

impl Command for GetsWithTokenCommand {
    type Output = HashMap<String, CasValue>;

    fn kind(&self) -> CommandKind {
        CommandKind::GetsWithToken
    }

    fn key(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys.iter().map(String::as_str).collect()
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        multi_get_request("gets", &self.keys, target)
    }

    fn send_and_receive(&self, conn: &mut dyn Transport, request: &[u8]) -> Result<RawResponse> {
        conn.write_all(request)?;
        conn.flush()?;
        read_values(conn)
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        multi_get_blocks(self.kind(), response)?
            .into_iter()
            .map(|block| -> Result<(String, CasValue)> {
                let token = block.cas.ok_or_else(|| {
                    ClientError::Protocol(format!("value for {:?} carries no cas token", block.key))
                })?;
                Ok((
                    block.key,
                    CasValue {
                        value: block.data,
                        token,
                    },
                ))
            })
            .collect()
    }
}

/// The store family verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    /// store unconditionally
    Set,
    /// store only if the key is absent
    Add,
    /// append to an existing value
    Append,
    /// prepend to an existing value
    Prepend,
}

impl StoreVerb {
    fn as_str(&self) -> &'static str {
        match self {
            StoreVerb::Set => "set",
            StoreVerb::Add => "add",
            StoreVerb::Append => "append",
            StoreVerb::Prepend => "prepend",
        }
    }
}

/// write the request header, the payload and its terminator, then read the status line
fn send_payload(conn: &mut dyn Transport, request: &[u8], payload: &[u8]) -> Result<RawResponse> {
    conn.write_all(request)?;
    conn.write_all(payload)?;
    conn.write_all(CRLF)?;
    conn.flush()?;
    Ok(RawResponse::Line(conn.read_line()?))
}

/// Stores a value with one of the [`StoreVerb`]s.
#[derive(Debug, Clone)]
pub struct StoreCommand<'a> {
    /// which store operation to perform
    pub verb: StoreVerb,
    /// the key to store under
    pub key: &'a str,
    /// the payload
    pub value: &'a [u8],
    /// when the value expires
    pub expiry: Expiry,
}

impl Command for StoreCommand<'_> {
    type Output = bool;

    fn kind(&self) -> CommandKind {
        match self.verb {
            StoreVerb::Set => CommandKind::Set,
            StoreVerb::Add => CommandKind::Add,
            StoreVerb::Append => CommandKind::Append,
            StoreVerb::Prepend => CommandKind::Prepend,
        }
    }

    fn key(&self) -> Option<&str> {
        Some(self.key)
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        Ok(format!(
            "{} {} {} {} {}\r\n",
            self.verb.as_str(),
            wire_key(self.key, target.hash_name),
            target.hash,
            self.expiry,
            self.value.len()
        )
        .into_bytes())
    }

    fn send_and_receive(&self, conn: &mut dyn Transport, request: &[u8]) -> Result<RawResponse> {
        send_payload(conn, request, self.value)
    }

    /// `STORED` is `true`, an error line fails, anything else is `false`
    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        let line = response.into_line(self.kind())?;
        if line.starts_with("STORED") {
            return Ok(true);
        }
        check_error(&line)?;
        Ok(false)
    }
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResponse {
    /// the value was stored
    Stored,
    /// the value was not stored: the key's token no longer matches
    Superseded,
    /// the key does not exist
    NotFound,
}

/// Stores a value only if the key's cas token still matches.
#[derive(Debug, Clone)]
pub struct CasCommand<'a> {
    /// the key to store under
    pub key: &'a str,
    /// the token obtained by an earlier retrieval
    pub token: u64,
    /// the payload
    pub value: &'a [u8],
    /// when the value expires
    pub expiry: Expiry,
}

impl Command for CasCommand<'_> {
    type Output = CasResponse;

    fn kind(&self) -> CommandKind {
        CommandKind::Cas
    }

    fn key(&self) -> Option<&str> {
        Some(self.key)
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        Ok(format!(
            "cas {} {} {} {} {}\r\n",
            wire_key(self.key, target.hash_name),
            target.hash,
            self.expiry,
            self.value.len(),
            self.token
        )
        .into_bytes())
    }

    fn send_and_receive(&self, conn: &mut dyn Transport, request: &[u8]) -> Result<RawResponse> {
        send_payload(conn, request, self.value)
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        let line = response.into_line(self.kind())?;
        match check_error(&line)? {
            "STORED" => Ok(CasResponse::Stored),
            "EXISTS" => Ok(CasResponse::Superseded),
            "NOT_FOUND" => Ok(CasResponse::NotFound),
            other => Err(ClientError::Protocol(format!("unexpected cas response {:?}", other))),
        }
    }
}

/// Removes a key.
#[derive(Debug, Clone)]
pub struct DeleteCommand<'a> {
    /// the key to remove
    pub key: &'a str,
}

impl Command for DeleteCommand<'_> {
    type Output = bool;

    fn kind(&self) -> CommandKind {
        CommandKind::Delete
    }

    fn key(&self) -> Option<&str> {
        Some(self.key)
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        Ok(format!("delete {}\r\n", wire_key(self.key, target.hash_name)).into_bytes())
    }

    /// `DELETED` is `true`, an error line fails, anything else is `false`
    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        let line = response.into_line(self.kind())?;
        if line.starts_with("DELETED") {
            return Ok(true);
        }
        check_error(&line)?;
        Ok(false)
    }
}

/// Direction of a counter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    /// add to the counter
    Incr,
    /// subtract from the counter
    Decr,
}

/// Increments or decrements a numeric value.
///
/// The output is `None` when the key does not exist.
#[derive(Debug, Clone)]
pub struct CounterCommand<'a> {
    /// increment or decrement
    pub op: CounterOp,
    /// the counter's key
    pub key: &'a str,
    /// the amount to add or subtract
    pub count: u64,
}

impl Command for CounterCommand<'_> {
    type Output = Option<BigInt>;

    fn kind(&self) -> CommandKind {
        match self.op {
            CounterOp::Incr => CommandKind::Incr,
            CounterOp::Decr => CommandKind::Decr,
        }
    }

    fn key(&self) -> Option<&str> {
        Some(self.key)
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        let verb = match self.op {
            CounterOp::Incr => "incr",
            CounterOp::Decr => "decr",
        };
        let key = wire_key(self.key, target.hash_name);
        Ok(format!("{} {} {}\r\n", verb, key, self.count).into_bytes())
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        let line = response.into_line(self.kind())?;
        let line = check_error(&line)?.trim();
        if line == "NOT_FOUND" {
            return Ok(None);
        }
        BigInt::from_str(line)
            .map(Some)
            .map_err(|_| ClientError::Protocol(format!("invalid counter value {:?}", line)))
    }
}

/// Changes the expiry of an existing key.
#[derive(Debug, Clone)]
pub struct ExpireCommand<'a> {
    /// the key to update
    pub key: &'a str,
    /// the new expiry
    pub expiry: Expiry,
}

impl Command for ExpireCommand<'_> {
    type Output = bool;

    fn kind(&self) -> CommandKind {
        CommandKind::Expire
    }

    fn key(&self) -> Option<&str> {
        Some(self.key)
    }

    fn create(&self, target: &Target<'_>) -> Result<Vec<u8>> {
        let key = wire_key(self.key, target.hash_name);
        Ok(format!("set_expt {} {}\r\n", key, self.expiry).into_bytes())
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        let line = response.into_line(self.kind())?;
        if line.starts_with("STORED") {
            return Ok(true);
        }
        check_error(&line)?;
        Ok(false)
    }
}

/// Fetches a node's topology dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingDumpCommand;

impl Command for RoutingDumpCommand {
    type Output = TopologyDump;

    fn kind(&self) -> CommandKind {
        CommandKind::RoutingDump
    }

    fn key(&self) -> Option<&str> {
        None
    }

    fn create(&self, _target: &Target<'_>) -> Result<Vec<u8>> {
        Ok(b"routingdump\r\n".to_vec())
    }

    fn send_and_receive(&self, conn: &mut dyn Transport, request: &[u8]) -> Result<RawResponse> {
        conn.write_all(request)?;
        conn.flush()?;
        read_listing(conn)
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        match response {
            RawResponse::Lines(lines) => Ok(TopologyDump::new(lines)),
            RawResponse::Line(line) => {
                check_error(&line)?;
                Err(unexpected(self.kind(), &RawResponse::Line(line)))
            }
            other => Err(unexpected(self.kind(), &other)),
        }
    }
}

/// Fetches a node's topology digest. The output is `None` when the node has not computed one.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingDigestCommand;

impl Command for RoutingDigestCommand {
    type Output = Option<String>;

    fn kind(&self) -> CommandKind {
        CommandKind::RoutingDigest
    }

    fn key(&self) -> Option<&str> {
        None
    }

    fn create(&self, _target: &Target<'_>) -> Result<Vec<u8>> {
        Ok(b"mklhash 0\r\n".to_vec())
    }

    fn parse_result(&self, response: RawResponse) -> Result<Self::Output> {
        let line = response.into_line(self.kind())?;
        let digest = check_error(&line)?.trim();
        if digest.is_empty() {
            Ok(None)
        } else {
            Ok(Some(digest.to_string()))
        }
    }
}
