use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use num_bigint::BigInt;
use tracing::{debug, info, instrument, warn};

use crate::batch;
use crate::config::ClientConfig;
use crate::expiry::Expiry;
use crate::hash::KeyHasher;
use crate::node::Node;
use crate::pool::{ConnectionPool, PoolSettings, PoolStats};
use crate::protocol::{
    CasCommand, CasResponse, CasValue, CounterCommand, CounterOp, DeleteCommand, ExpireCommand,
    Executor, GetCommand, GetsCommand, GetsWithTokenCommand, RoutingDigestCommand,
    RoutingDumpCommand, StoreCommand, StoreVerb, KEY_SEPARATOR,
};
use crate::routing::{RefreshLoop, RoutingTable, TopologyDump};
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};
use crate::{ClientError, Result};

/// The value returned by [`RingClient::incr`] and [`RingClient::decr`] when the counter does
/// not exist.
pub const COUNTER_NOT_FOUND: i64 = -1;

/// `RingClient` is the entry point for talking to a cluster.
///
/// It hides the cluster's topology: each operation is routed to the node owning the key, using
/// a routing table fetched from the cluster when the client is opened and refreshed in the
/// background while it stays open.
///
/// A client starts closed. [`RingClient::open`] bootstraps the routing table from a list of seed
/// nodes; every key-value operation fails with [`ClientError::NotOpen`] until then, and again
/// after [`RingClient::close`]. A client can be shared between threads; operations do not
/// serialize each other.
///
/// The worker pool `P` runs concurrent batch retrievals.
///
/// # Example
/// ```rust,no_run
/// use ringkv::{ClientConfig, Expiry, Node, RingClient};
/// # fn main() -> ringkv::Result<()> {
/// let client = RingClient::new(ClientConfig::default())?;
/// client.open(&[Node::new("10.0.0.1", 11211), Node::new("10.0.0.2", 11211)])?;
/// client.put("greeting", b"hello", Expiry::NEVER)?;
/// assert_eq!(client.get("greeting")?, Some(b"hello".to_vec()));
/// client.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct RingClient<P: ThreadPool = SharedQueueThreadPool> {
    config: ClientConfig,
    executor: Arc<Executor>,
    workers: P,
    refresher: Mutex<Option<RefreshLoop>>,
    opened: AtomicBool,
}

impl RingClient {
    /// creates a closed client using a [`SharedQueueThreadPool`] for batch retrieval
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_pool(config)
    }
}

impl<P: ThreadPool> RingClient<P> {
    /// creates a closed client using the worker pool `P` and the configured hash algorithm
    pub fn with_pool(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let hasher = Arc::new(config.hash_algorithm()?);
        Self::with_hasher(config, hasher)
    }

    /// creates a closed client that places keys on the ring with a custom `hasher`
    pub fn with_hasher(config: ClientConfig, hasher: Arc<dyn KeyHasher>) -> Result<Self> {
        config.validate()?;
        let workers = P::new(config.batch_threads)?;
        let executor = Executor::new(
            ConnectionPool::new(PoolSettings::from(&config)),
            Arc::new(RoutingTable::new()),
            hasher,
            config.hash_name.clone(),
        );
        Ok(RingClient {
            config,
            executor: Arc::new(executor),
            workers,
            refresher: Mutex::new(None),
            opened: AtomicBool::new(false),
        })
    }

    /// opens the client with a single seed node
    pub fn open_node(&self, node: Node) -> Result<()> {
        self.open(&[node])
    }

    /// opens the client: fetches the routing table from the first seed node able to provide
    /// one, then starts the background refresh loop. Opening an open client does nothing.
    ///
    /// # Errors
    /// [`ClientError::Argument`] if `nodes` is empty, [`ClientError::Bootstrap`] (listing every
    /// seed's failure) if no seed node returned a usable topology
    #[instrument(skip(self, nodes), fields(seeds = nodes.len()))]
    pub fn open(&self, nodes: &[Node]) -> Result<()> {
        if nodes.is_empty() {
            return Err(ClientError::Argument("at least one seed node is required".into()));
        }

        let mut refresher = self.lock_refresher();
        if refresher.is_some() {
            debug!("client already open");
            return Ok(());
        }

        self.bootstrap(nodes)?;
        let refresh_loop = RefreshLoop::start(
            Arc::clone(self.executor.routing()),
            Arc::clone(&self.executor),
            self.config.refresh_interval(),
        );
        match refresh_loop {
            Ok(refresh_loop) => *refresher = Some(refresh_loop),
            Err(e) => {
                self.executor.routing().clear();
                return Err(e);
            }
        }
        self.opened.store(true, Ordering::SeqCst);
        info!(nodes = ?self.executor.routing().physical_nodes(), "client opened");
        Ok(())
    }

    /// tries each seed in order until one returns a well formed topology
    fn bootstrap(&self, nodes: &[Node]) -> Result<()> {
        let mut failures = Vec::new();
        for node in nodes {
            let result = self
                .executor
                .execute_on(node, &RoutingDumpCommand)
                .and_then(|dump| self.executor.routing().init(&dump));
            match result {
                Ok(()) => {
                    debug!(%node, "routing table bootstrapped");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%node, error = %e, "seed node failed");
                    failures.push(format!("{}: {}", node, e));
                }
            }
        }
        Err(ClientError::Bootstrap { failures })
    }

    /// closes the client: stops the refresh loop, discards the routing table and the idle
    /// connections. Closing a closed client does nothing.
    #[instrument(skip(self))]
    pub fn close(&self) {
        let mut refresher = self.lock_refresher();
        let refresh_loop = match refresher.take() {
            Some(refresh_loop) => refresh_loop,
            None => return,
        };
        self.opened.store(false, Ordering::SeqCst);
        refresh_loop.stop();
        self.executor.routing().clear();
        self.executor.pool().clear();
        info!("client closed");
    }

    /// returns `true` between a successful [`RingClient::open`] and [`RingClient::close`]
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// closes the client and stops the batch worker pool. Meant for the owning process's
    /// termination path.
    pub fn shutdown(self) {
        self.close();
        self.workers.shutdown();
    }

    fn lock_refresher(&self) -> MutexGuard<'_, Option<RefreshLoop>> {
        self.refresher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClientError::NotOpen)
        }
    }

    /// gets the value stored under `key`
    /// ## Returns
    /// `Ok<Some<Vec<u8>>>` if the key holds a value, `Ok<None>` if it does not
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        check_key(key)?;
        self.executor.execute(&GetCommand { key })
    }

    /// gets the values of several keys. Keys without a value are absent from the result.
    ///
    /// With `concurrent`, the nodes involved are queried in parallel on the worker pool;
    /// otherwise one after the other. In both modes any failure fails the whole call.
    pub fn gets<K: AsRef<str>>(
        &self,
        keys: &[K],
        concurrent: bool,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let keys = self.batch_keys(keys)?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        if concurrent {
            batch::get_concurrent::<GetsCommand, _, _>(&self.executor, &self.workers, &keys)
        } else {
            batch::get_sequential::<GetsCommand, _>(&self.executor, &keys)
        }
    }

    /// like [`RingClient::gets`], also returning each value's cas token
    pub fn gets_with_token<K: AsRef<str>>(
        &self,
        keys: &[K],
        concurrent: bool,
    ) -> Result<HashMap<String, CasValue>> {
        let keys = self.batch_keys(keys)?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        if concurrent {
            let (executor, workers) = (&self.executor, &self.workers);
            batch::get_concurrent::<GetsWithTokenCommand, _, _>(executor, workers, &keys)
        } else {
            batch::get_sequential::<GetsWithTokenCommand, _>(&self.executor, &keys)
        }
    }

    fn batch_keys<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<String>> {
        self.ensure_open()?;
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                check_key(key)?;
                Ok(key.to_string())
            })
            .collect()
    }

    fn store(&self, verb: StoreVerb, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        self.ensure_open()?;
        check_key(key)?;
        self.executor.execute(&StoreCommand {
            verb,
            key,
            value,
            expiry,
        })
    }

    /// stores `value` under `key`, replacing any previous value
    /// # Returns
    /// `Ok(true)` if the value was stored, `Ok(false)` if the server declined to store it
    /// # Errors
    /// `Err<ClientError::Protocol>` if the server answered with an error
    pub fn put(&self, key: &str, value: &[u8], expiry: impl Into<Expiry>) -> Result<bool> {
        self.store(StoreVerb::Set, key, value, expiry.into())
    }

    /// stores `value` under `key` only if the key does not exist yet
    pub fn add(&self, key: &str, value: &[u8], expiry: impl Into<Expiry>) -> Result<bool> {
        self.store(StoreVerb::Add, key, value, expiry.into())
    }

    /// appends `value` to the value stored under `key`
    pub fn append(&self, key: &str, value: &[u8], expiry: impl Into<Expiry>) -> Result<bool> {
        self.store(StoreVerb::Append, key, value, expiry.into())
    }

    /// prepends `value` to the value stored under `key`
    pub fn prepend(&self, key: &str, value: &[u8], expiry: impl Into<Expiry>) -> Result<bool> {
        self.store(StoreVerb::Prepend, key, value, expiry.into())
    }

    /// stores `value` under `key` only if the key's cas token is still `token`
    pub fn cas(
        &self,
        key: &str,
        token: u64,
        value: &[u8],
        expiry: impl Into<Expiry>,
    ) -> Result<CasResponse> {
        self.ensure_open()?;
        check_key(key)?;
        self.executor.execute(&CasCommand {
            key,
            token,
            value,
            expiry: expiry.into(),
        })
    }

    /// removes `key`. Returns `true` if a value was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        check_key(key)?;
        self.executor.execute(&DeleteCommand { key })
    }

    /// sets a new expiry on `key`. Returns `false` if the key does not exist.
    pub fn expire(&self, key: &str, ttl: impl Into<Expiry>) -> Result<bool> {
        self.ensure_open()?;
        check_key(key)?;
        self.executor.execute(&ExpireCommand {
            key,
            expiry: ttl.into(),
        })
    }

    /// increments the counter stored under `key` by `count` and returns the new value.
    ///
    /// Returns [`COUNTER_NOT_FOUND`] if the counter does not exist.
    pub fn incr(&self, key: &str, count: u64) -> Result<BigInt> {
        self.counter(CounterOp::Incr, key, count)
    }

    /// decrements the counter stored under `key` by `count` and returns the new value.
    ///
    /// Returns [`COUNTER_NOT_FOUND`] if the counter does not exist.
    pub fn decr(&self, key: &str, count: u64) -> Result<BigInt> {
        self.counter(CounterOp::Decr, key, count)
    }

    fn counter(&self, op: CounterOp, key: &str, count: u64) -> Result<BigInt> {
        self.ensure_open()?;
        check_key(key)?;
        let value = self.executor.execute(&CounterCommand { op, key, count })?;
        Ok(value.unwrap_or_else(|| BigInt::from(COUNTER_NOT_FOUND)))
    }

    /// the identities (`host_port`) of the cluster's physical nodes
    pub fn nodelist(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let nodes = self.executor.routing().physical_nodes();
        if nodes.is_empty() {
            return Err(ClientError::EmptyRoutingTable);
        }
        Ok(nodes.iter().map(Node::to_string).collect())
    }

    /// fetches the topology dump served by `node`. Does not require the client to be open.
    pub fn routing_dump(&self, node: &Node) -> Result<TopologyDump> {
        self.executor.execute_on(node, &RoutingDumpCommand)
    }

    /// fetches the topology digest served by `node`, `None` if the node has not computed one.
    /// Does not require the client to be open.
    pub fn routing_digest(&self, node: &Node) -> Result<Option<String>> {
        self.executor.execute_on(node, &RoutingDigestCommand)
    }

    /// the fingerprint of the local routing table, `None` while closed
    pub fn routing_fingerprint(&self) -> Option<String> {
        self.executor.routing().digest()
    }

    /// activity counters of the connection pool
    pub fn pool_stats(&self) -> PoolStats {
        self.executor.pool().stats()
    }

    /// the configuration this client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// keys travel inside a space separated request line, so they must be non-empty and free of
/// whitespace and control characters (which includes the key separator)
fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ClientError::Argument("key must not be empty".into()));
    }
    if key
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == KEY_SEPARATOR)
    {
        return Err(ClientError::Argument(format!(
            "key {:?} contains whitespace or control characters",
            key
        )));
    }
    Ok(())
}
