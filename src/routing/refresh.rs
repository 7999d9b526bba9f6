use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use tracing::{debug, instrument, warn};

use super::{RoutingTable, TopologyDump};
use crate::node::Node;
use crate::{ClientError, Result};

/// Something that can fetch the current topology from a cluster node.
pub trait TopologySource: Send + Sync + 'static {
    /// fetches the topology dump served by `node`
    fn fetch_topology(&self, node: &Node) -> Result<TopologyDump>;
}

/// Asks the nodes of the current ring, in order, for the topology and swaps it into `table`
/// if it changed. The first node that answers with a well formed dump is used.
///
/// Returns `true` if the table changed.
pub fn refresh_once<S: TopologySource + ?Sized>(table: &RoutingTable, source: &S) -> Result<bool> {
    let nodes = table.physical_nodes();
    if nodes.is_empty() {
        return Err(ClientError::EmptyRoutingTable);
    }

    let mut last_err = None;
    for node in nodes {
        match source
            .fetch_topology(&node)
            .and_then(|dump| table.refresh(&dump))
        {
            Ok(changed) => return Ok(changed),
            Err(e) => {
                warn!(%node, error = %e, "routing refresh failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(ClientError::EmptyRoutingTable))
}

/// A background thread that periodically refreshes a [`RoutingTable`].
///
/// The loop is stopped by [`RefreshLoop::stop`], or when the handle is dropped.
pub struct RefreshLoop {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshLoop {
    /// starts refreshing `table` from `source` every `interval`
    #[instrument(skip(table, source))]
    pub fn start<S: TopologySource + ?Sized>(
        table: Arc<RoutingTable>,
        source: Arc<S>,
        interval: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("routing-refresh".into())
            .spawn(move || {
                let ticker = channel::tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Ok(true) = refresh_once(&table, source.as_ref()) {
                                debug!("routing table swapped by refresh loop");
                            }
                        }
                    }
                }
                debug!("routing refresh loop stopped");
            })
            .map_err(|e| ClientError::ThreadPool(format!("could not start refresh loop: {}", e)))?;

        Ok(RefreshLoop {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// stops the loop and waits for an in-progress refresh to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // dropping the sender disconnects the channel, which wakes the loop
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("routing refresh loop panicked");
            }
        }
    }
}

impl Drop for RefreshLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// serves a fixed answer per node and counts fetches
    #[derive(Default)]
    struct FakeSource {
        answers: Mutex<HashMap<Node, Result<TopologyDump>>>,
        fetches: AtomicUsize,
    }

    impl FakeSource {
        fn answer(&self, node: &str, answer: Result<TopologyDump>) {
            self.answers
                .lock()
                .unwrap()
                .insert(node.parse().unwrap(), answer);
        }
    }

    impl TopologySource for FakeSource {
        fn fetch_topology(&self, node: &Node) -> Result<TopologyDump> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.answers.lock().unwrap().get(node) {
                Some(Ok(dump)) => Ok(dump.clone()),
                Some(Err(e)) => Err(ClientError::Protocol(e.to_string())),
                None => Err(ClientError::Protocol(format!("{} is down", node))),
            }
        }
    }

    fn dump(entries: &[&str]) -> TopologyDump {
        entries.iter().copied().collect()
    }

    #[test]
    fn refresh_falls_through_to_next_node() {
        let table = RoutingTable::new();
        table.init(&dump(&["10 a_1", "50 b_2"])).unwrap();

        let source = FakeSource::default();
        source.answer("b_2", Ok(dump(&["10 a_1", "50 b_2", "90 c_3"])));

        assert!(refresh_once(&table, &source).unwrap());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(table.physical_nodes().len(), 3);

        // same topology again: nothing to swap
        source.answer("a_1", Ok(dump(&["90 c_3", "50 b_2", "10 a_1"])));
        assert!(!refresh_once(&table, &source).unwrap());
    }

    #[test]
    fn refresh_keeps_table_when_every_node_fails() {
        let table = RoutingTable::new();
        table.init(&dump(&["10 a_1"])).unwrap();
        let digest = table.digest();

        let source = FakeSource::default();
        assert!(refresh_once(&table, &source).is_err());
        assert_eq!(table.digest(), digest);
        assert!(matches!(
            refresh_once(&RoutingTable::new(), &source),
            Err(ClientError::EmptyRoutingTable)
        ));
    }

    #[test]
    fn loop_swaps_table_and_stops() {
        let table = Arc::new(RoutingTable::new());
        table.init(&dump(&["10 a_1"])).unwrap();
        let source = Arc::new(FakeSource::default());
        source.answer("a_1", Ok(dump(&["10 a_1", "20 b_2"])));

        let refresher =
            RefreshLoop::start(table.clone(), source.clone(), Duration::from_millis(10)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while table.physical_nodes().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(table.resolve(15).unwrap(), Node::new("b", 2));

        refresher.stop();
        let fetches = source.fetches.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(source.fetches.load(Ordering::SeqCst), fetches);
    }
}
