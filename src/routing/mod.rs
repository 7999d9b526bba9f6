//! The routing table: a consistent-hash ring mapping key hashes to the nodes that own them.
//!
//! A [`Ring`] is an immutable snapshot built from a [`TopologyDump`]. The [`RoutingTable`]
//! holds the current snapshot behind an atomically swapped pointer, so lookups never take a
//! lock and never observe a half-updated ring, while the [`RefreshLoop`] replaces the snapshot
//! in the background whenever the cluster's topology changes.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::node::Node;
use crate::{ClientError, Result};

mod refresh;

pub use self::refresh::{refresh_once, RefreshLoop, TopologySource};

/// The raw topology listing returned by a node: one `<position> <node>` entry per line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyDump {
    entries: Vec<String>,
}

impl TopologyDump {
    /// wraps the entry lines of a dump
    pub fn new(entries: Vec<String>) -> Self {
        TopologyDump { entries }
    }

    /// the entry lines, in the order the node sent them
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// `true` if the dump holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for TopologyDump {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        TopologyDump::new(iter.into_iter().map(Into::into).collect())
    }
}

/// An immutable consistent-hash ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    positions: BTreeMap<u64, Node>,
    nodes: BTreeSet<Node>,
    fingerprint: String,
}

impl Ring {
    /// parses a topology dump into a ring
    ///
    /// # Errors
    /// [`ClientError::MalformedTopology`] if the dump is empty, an entry is truncated, a position
    /// or node identity cannot be parsed, or one position is claimed by two different nodes
    pub fn parse(dump: &TopologyDump) -> Result<Ring> {
        if dump.is_empty() {
            return Err(ClientError::MalformedTopology("topology dump is empty".into()));
        }

        let mut positions = BTreeMap::new();
        for line in dump.entries() {
            let (position, node) = parse_entry(line)?;
            if let Some(prev) = positions.insert(position, node.clone()) {
                if prev != node {
                    return Err(ClientError::MalformedTopology(format!(
                        "position {} is claimed by both {} and {}",
                        position, prev, node
                    )));
                }
            }
        }

        let nodes = positions.values().cloned().collect();
        let fingerprint = fingerprint(&positions);
        Ok(Ring {
            positions,
            nodes,
            fingerprint,
        })
    }

    /// returns the node owning `hash`: the first ring position at or after `hash`, wrapping
    /// around to the lowest position.
    pub fn resolve(&self, hash: u64) -> Option<&Node> {
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node)
    }

    /// the deterministic fingerprint of this ring's contents
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// the distinct physical nodes on this ring, in sorted order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// number of ring positions
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// `false` for any ring produced by [`Ring::parse`]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn parse_entry(line: &str) -> Result<(u64, Node)> {
    let mut fields = line.split_whitespace();
    let (position, node) = match (fields.next(), fields.next(), fields.next()) {
        (Some(position), Some(node), None) => (position, node),
        _ => {
            return Err(ClientError::MalformedTopology(format!(
                "expected `<position> <node>`, got {:?}",
                line
            )))
        }
    };
    let position = position.parse::<u64>().map_err(|_| {
        ClientError::MalformedTopology(format!("invalid ring position {:?}", position))
    })?;
    let node = node
        .parse::<Node>()
        .map_err(|e| ClientError::MalformedTopology(e.to_string()))?;
    Ok((position, node))
}

/// hex encoded SHA-1 over the entries in ascending position order
fn fingerprint(positions: &BTreeMap<u64, Node>) -> String {
    let mut hasher = Sha1::new();
    for (position, node) in positions {
        hasher.update(format!("{} {}\n", position, node).as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(40), |mut hex, b| {
            let _ = write!(hex, "{:02x}", b);
            hex
        })
}

/// The shared routing table of a client.
#[derive(Debug, Default)]
pub struct RoutingTable {
    ring: ArcSwapOption<Ring>,
}

impl RoutingTable {
    /// creates an uninitialized table
    pub fn new() -> Self {
        RoutingTable {
            ring: ArcSwapOption::empty(),
        }
    }

    /// replaces the table's contents with the ring described by `dump`
    pub fn init(&self, dump: &TopologyDump) -> Result<()> {
        let ring = Ring::parse(dump)?;
        info!(
            positions = ring.len(),
            fingerprint = ring.fingerprint(),
            "routing table initialized"
        );
        self.ring.store(Some(Arc::new(ring)));
        Ok(())
    }

    /// swaps in the ring described by `dump` if its fingerprint differs from the current one.
    ///
    /// Returns `true` if the table changed.
    pub fn refresh(&self, dump: &TopologyDump) -> Result<bool> {
        let ring = Ring::parse(dump)?;
        if self.digest().as_deref() == Some(ring.fingerprint()) {
            debug!("routing table unchanged");
            return Ok(false);
        }
        info!(fingerprint = ring.fingerprint(), "routing table changed");
        self.ring.store(Some(Arc::new(ring)));
        Ok(true)
    }

    /// returns the node owning the key with the given `hash`
    ///
    /// # Errors
    /// [`ClientError::EmptyRoutingTable`] if the table was never initialized (or was cleared)
    pub fn resolve(&self, hash: u64) -> Result<Node> {
        let guard = self.ring.load();
        (*guard)
            .as_deref()
            .and_then(|ring| ring.resolve(hash))
            .cloned()
            .ok_or(ClientError::EmptyRoutingTable)
    }

    /// the current ring, for callers that need several consistent lookups
    pub fn snapshot(&self) -> Result<Arc<Ring>> {
        self.ring.load_full().ok_or(ClientError::EmptyRoutingTable)
    }

    /// the current fingerprint, `None` if the table is empty
    pub fn digest(&self) -> Option<String> {
        let guard = self.ring.load();
        (*guard).as_deref().map(|ring| ring.fingerprint().to_string())
    }

    /// the physical nodes of the current ring
    pub fn physical_nodes(&self) -> Vec<Node> {
        let guard = self.ring.load();
        (*guard)
            .as_deref()
            .map(|ring| ring.nodes().cloned().collect())
            .unwrap_or_default()
    }

    /// `true` once a ring has been installed
    pub fn is_initialized(&self) -> bool {
        self.ring.load().is_some()
    }

    /// drops the current ring
    pub fn clear(&self) {
        self.ring.store(None);
    }
}
