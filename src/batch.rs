//! Multi-key retrieval across the cluster.
//!
//! The keys are partitioned by owning node, then one multi-key request is sent per node:
//! a single round trip per node, never one per key. Partitions run either one after the other
//! or as one job per partition on a [`ThreadPool`]. Either way, the failure of any partition
//! fails the whole call.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam::channel;
use tracing::{debug, instrument};

use crate::node::Node;
use crate::protocol::{CasValue, Command, Executor, GetsCommand, GetsWithTokenCommand};
use crate::{ClientError, Result, ThreadPool};

/// A multi-key retrieval command whose output maps keys to values of type `V`.
pub trait BatchCommand<V>: Command<Output = HashMap<String, V>> + Send + 'static {
    /// builds the command fetching `keys` from a single node
    fn for_keys(keys: Vec<String>) -> Self;
}

impl BatchCommand<Vec<u8>> for GetsCommand {
    fn for_keys(keys: Vec<String>) -> Self {
        GetsCommand { keys }
    }
}

impl BatchCommand<CasValue> for GetsWithTokenCommand {
    fn for_keys(keys: Vec<String>) -> Self {
        GetsWithTokenCommand { keys }
    }
}

/// Groups `keys` by the node owning them. Duplicate keys are requested once.
///
/// All keys are resolved against the same ring snapshot.
pub fn partition(executor: &Executor, keys: &[String]) -> Result<HashMap<Node, Vec<String>>> {
    let ring = executor.routing().snapshot()?;
    let mut seen = HashSet::with_capacity(keys.len());
    let mut partitions: HashMap<Node, Vec<String>> = HashMap::new();
    for key in keys {
        if !seen.insert(key.as_str()) {
            continue;
        }
        let node = ring
            .resolve(executor.hash_key(key))
            .ok_or(ClientError::EmptyRoutingTable)?;
        partitions.entry(node.clone()).or_default().push(key.clone());
    }
    Ok(partitions)
}

/// fetches every partition in turn, stopping at the first failure.
///
/// A partition failure is returned as [`ClientError::Batch`], naming the node and its keys.
#[instrument(skip(executor, keys), fields(keys = keys.len()))]
pub fn get_sequential<C, V>(executor: &Executor, keys: &[String]) -> Result<HashMap<String, V>>
where
    C: BatchCommand<V>,
{
    let mut merged = HashMap::with_capacity(keys.len());
    for (node, node_keys) in partition(executor, keys)? {
        merged.extend(fetch_partition::<C, V>(executor, node, node_keys)?);
    }
    Ok(merged)
}

/// fetches one partition. A failure is wrapped with the node and the keys it was asked for.
fn fetch_partition<C, V>(
    executor: &Executor,
    node: Node,
    keys: Vec<String>,
) -> Result<HashMap<String, V>>
where
    C: BatchCommand<V>,
{
    debug!(%node, keys = keys.len(), "fetching partition");
    let cmd = C::for_keys(keys);
    executor
        .execute_on(&node, &cmd)
        .map_err(|source| ClientError::Batch {
            keys: cmd.keys().into_iter().map(String::from).collect(),
            node,
            source: Box::new(source),
        })
}

/// fetches every partition as a separate job on `pool` and merges the results.
///
/// All jobs are waited for. If any of them failed, the first failure received is returned and
/// the other partial results are dropped.
#[instrument(skip(executor, pool, keys), fields(keys = keys.len()))]
pub fn get_concurrent<C, V, P>(
    executor: &Arc<Executor>,
    pool: &P,
    keys: &[String],
) -> Result<HashMap<String, V>>
where
    C: BatchCommand<V>,
    V: Send + 'static,
    P: ThreadPool,
{
    let partitions = partition(executor, keys)?;
    let expected = partitions.len();
    let (tx, rx) = channel::bounded(expected);

    for (node, node_keys) in partitions {
        let tx = tx.clone();
        let executor = Arc::clone(executor);
        pool.spawn(move || {
            let result = fetch_partition::<C, V>(&executor, node, node_keys);
            // the receiver is gone only if the batch already failed
            let _ = tx.send(result);
        })?;
    }
    drop(tx);

    let mut merged = HashMap::with_capacity(keys.len());
    let mut first_err = None;
    let mut received = 0;
    for result in rx.iter() {
        received += 1;
        match result {
            Ok(part) if first_err.is_none() => merged.extend(part),
            Ok(_) => {}
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_err {
        return Err(e);
    }
    if received < expected {
        return Err(ClientError::ThreadPool(format!(
            "{} of {} batch jobs ended without a result",
            expected - received,
            expected
        )));
    }
    Ok(merged)
}
