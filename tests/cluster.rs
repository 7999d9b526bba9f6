use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::thread as scoped;
use num_bigint::BigInt;
use ringkv::{
    CasResponse, ClientConfig, ClientError, KeyHasher, Node, RayonThreadPool, RingClient,
    SharedQueueThreadPool, ThreadPool, COUNTER_NOT_FOUND,
};

/// places keys starting with `a` or `b` at 5, `c` at 15 and anything else at 25
struct PinnedHasher;

impl KeyHasher for PinnedHasher {
    fn name(&self) -> &str {
        "pinned"
    }

    fn hash(&self, key: &[u8]) -> u64 {
        match key.first() {
            Some(b'a') | Some(b'b') => 5,
            Some(b'c') => 15,
            _ => 25,
        }
    }
}

#[derive(Default)]
struct NodeState {
    data: Mutex<HashMap<String, (Vec<u8>, u64)>>,
    topology: Mutex<Vec<String>>,
    digest: String,
    requests: Mutex<Vec<String>>,
    next_cas: AtomicU64,
}

impl NodeState {
    fn count(&self, verb: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|v| *v == verb).count()
    }

    fn store(&self, verb: &str, key: String, value: Vec<u8>, token: Option<u64>) -> &'static str {
        let mut data = self.data.lock().unwrap();
        let cas = self.next_cas.fetch_add(1, Ordering::SeqCst) + 1;
        let exists = data.contains_key(&key);
        match verb {
            "set" => {
                data.insert(key, (value, cas));
                "STORED"
            }
            "add" if exists => "NOT_STORED",
            "add" => {
                data.insert(key, (value, cas));
                "STORED"
            }
            "append" | "prepend" => match data.get_mut(&key) {
                Some(entry) => {
                    if verb == "append" {
                        entry.0.extend_from_slice(&value);
                    } else {
                        entry.0.splice(0..0, value);
                    }
                    entry.1 = cas;
                    "STORED"
                }
                None => "NOT_STORED",
            },
            "cas" => match data.get_mut(&key) {
                None => "NOT_FOUND",
                Some(entry) if Some(entry.1) != token => "EXISTS",
                Some(entry) => {
                    *entry = (value, cas);
                    "STORED"
                }
            },
            _ => "ERROR",
        }
    }

    fn values(&self, wire_keys: &[&str], with_cas: bool) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let mut reply = Vec::new();
        for wire_key in wire_keys {
            if let Some((value, cas)) = data.get(&plain(wire_key)) {
                let header = if with_cas {
                    format!("VALUE {} 0 {} {}\r\n", wire_key, value.len(), cas)
                } else {
                    format!("VALUE {} 0 {}\r\n", wire_key, value.len())
                };
                reply.extend_from_slice(header.as_bytes());
                reply.extend_from_slice(value);
                reply.extend_from_slice(b"\r\n");
            }
        }
        reply.extend_from_slice(b"END\r\n");
        reply
    }

    fn counter(&self, verb: &str, key: String, count: u64) -> String {
        let mut data = self.data.lock().unwrap();
        match data.get_mut(&key) {
            Some(entry) => {
                let current: u64 = String::from_utf8_lossy(&entry.0).parse().unwrap_or(0);
                let next = if verb == "incr" {
                    current + count
                } else {
                    current.saturating_sub(count)
                };
                entry.0 = next.to_string().into_bytes();
                next.to_string()
            }
            None => "NOT_FOUND".to_string(),
        }
    }
}

fn plain(wire_key: &str) -> String {
    wire_key.split('\x1b').next().unwrap().to_string()
}

/// answers requests from one client connection until it closes
fn serve(stream: TcpStream, state: Arc<NodeState>) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();
        let fields: Vec<&str> = line.split(' ').collect();
        state.requests.lock().unwrap().push(fields[0].to_string());

        let reply: Vec<u8> = match fields[0] {
            "set" | "add" | "append" | "prepend" | "cas" => {
                let len: usize = fields[4].parse().unwrap();
                let mut value = vec![0; len + 2];
                reader.read_exact(&mut value)?;
                value.truncate(len);
                let key = plain(fields[1]);
                if key == "broken" {
                    b"SERVER_ERROR oops\r\n".to_vec()
                } else {
                    let token = fields.get(5).map(|t| t.parse().unwrap());
                    format!("{}\r\n", state.store(fields[0], key, value, token)).into_bytes()
                }
            }
            "get" => state.values(&fields[1..], false),
            "gets" => state.values(&fields[1..], true),
            "delete" => match state.data.lock().unwrap().remove(&plain(fields[1])) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            "incr" | "decr" => {
                let count = fields[2].parse().unwrap();
                format!("{}\r\n", state.counter(fields[0], plain(fields[1]), count)).into_bytes()
            }
            "set_expt" => {
                if state.data.lock().unwrap().contains_key(&plain(fields[1])) {
                    b"STORED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            "routingdump" => {
                let mut reply = String::new();
                for entry in state.topology.lock().unwrap().iter() {
                    reply.push_str(entry);
                    reply.push_str("\r\n");
                }
                reply.push_str("END\r\n");
                reply.into_bytes()
            }
            "mklhash" => format!("{}\r\n", state.digest).into_bytes(),
            _ => b"ERROR\r\n".to_vec(),
        };
        writer.write_all(&reply)?;
        writer.flush()?;
    }
}

/// returns a node nothing listens on
fn dead_node() -> Node {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    Node::from(listener.local_addr().unwrap())
}

/// In-process cluster nodes. Node `i` sits at ring position `10 * (i + 1)`; dead nodes are
/// placed on the ring after the live ones.
struct Cluster {
    nodes: Vec<Node>,
    states: Vec<Arc<NodeState>>,
}

impl Cluster {
    fn start(live: usize, dead: usize) -> Cluster {
        let listeners: Vec<TcpListener> = (0..live)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let mut nodes: Vec<Node> = listeners
            .iter()
            .map(|l| Node::from(l.local_addr().unwrap()))
            .collect();
        nodes.extend((0..dead).map(|_| dead_node()));
        let topology: Vec<String> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| format!("{} {}", 10 * (i + 1), node))
            .collect();

        let mut states = Vec::new();
        for (listener, node) in listeners.into_iter().zip(&nodes) {
            let state = Arc::new(NodeState {
                topology: Mutex::new(topology.clone()),
                digest: format!("digest-{}", node.port()),
                ..NodeState::default()
            });
            let accept_state = Arc::clone(&state);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(_) => break,
                    };
                    let state = Arc::clone(&accept_state);
                    thread::spawn(move || serve(stream, state));
                }
            });
            states.push(state);
        }
        Cluster { nodes, states }
    }

    fn set_topology(&self, topology: &[String]) {
        for state in &self.states {
            *state.topology.lock().unwrap() = topology.to_vec();
        }
    }

    fn clear_requests(&self) {
        for state in &self.states {
            state.requests.lock().unwrap().clear();
        }
    }
}

fn open_client<P: ThreadPool>(cluster: &Cluster) -> RingClient<P> {
    let client =
        RingClient::<P>::with_hasher(ClientConfig::default(), Arc::new(PinnedHasher)).unwrap();
    client.open(&cluster.nodes[..1]).unwrap();
    client
}

#[test]
fn bootstrap_fails_over_to_the_next_seed() {
    let cluster = Cluster::start(2, 0);
    let client = RingClient::new(ClientConfig::default()).unwrap();
    client.open(&[dead_node(), cluster.nodes[1].clone()]).unwrap();

    assert!(client.is_open());
    let mut nodes = cluster.nodes.clone();
    nodes.sort();
    let expected: Vec<String> = nodes.iter().map(Node::to_string).collect();
    assert_eq!(client.nodelist().unwrap(), expected);
    assert!(client.routing_fingerprint().is_some());
    client.shutdown();
}

#[test]
fn bootstrap_reports_every_seed_failure() {
    let seeds = vec![dead_node(), dead_node()];
    let client = RingClient::new(ClientConfig::default()).unwrap();
    match client.open(&seeds) {
        Err(ClientError::Bootstrap { failures }) => {
            assert_eq!(failures.len(), 2);
            assert!(failures[0].starts_with(&seeds[0].to_string()));
            assert!(failures[1].starts_with(&seeds[1].to_string()));
        }
        other => panic!("expected a bootstrap error, got {:?}", other.map(|_| ())),
    }
    assert!(!client.is_open());
    assert!(matches!(client.get("a"), Err(ClientError::NotOpen)));
}

#[test]
fn store_operations_follow_server_replies() {
    let cluster = Cluster::start(2, 0);
    let client = open_client::<SharedQueueThreadPool>(&cluster);

    assert!(client.put("a1", b"v", 0u64).unwrap());
    assert!(!client.add("a1", b"other", 0u64).unwrap());
    assert!(client.append("a1", b"-post", 0u64).unwrap());
    assert!(client.prepend("a1", b"pre-", 0u64).unwrap());
    assert_eq!(client.get("a1").unwrap(), Some(b"pre-v-post".to_vec()));
    assert!(!client.append("missing", b"x", 0u64).unwrap());

    assert!(client.expire("a1", 60u64).unwrap());
    assert!(client.delete("a1").unwrap());
    assert!(!client.delete("a1").unwrap());
    assert!(!client.expire("a1", 60u64).unwrap());
    assert_eq!(client.get("a1").unwrap(), None);

    // a1 routes to the first node only
    assert_eq!(cluster.states[0].count("set"), 1);
    assert_eq!(cluster.states[1].count("set"), 0);
    client.shutdown();
}

#[test]
fn server_errors_are_surfaced_unchanged() {
    let cluster = Cluster::start(1, 0);
    let client = open_client::<SharedQueueThreadPool>(&cluster);

    match client.put("broken", b"v", 0u64) {
        Err(ClientError::Protocol(line)) => assert_eq!(line, "SERVER_ERROR oops"),
        other => panic!("expected a protocol error, got {:?}", other),
    }
    // the connection survives a server side error
    assert!(client.put("a", b"v", 0u64).unwrap());
    assert_eq!(client.pool_stats().discarded, 0);
    assert_eq!(client.pool_stats().in_use(), 0);
    client.shutdown();
}

#[test]
fn cas_reports_superseded_tokens() {
    let cluster = Cluster::start(2, 0);
    let client = open_client::<SharedQueueThreadPool>(&cluster);

    client.put("c1", b"first", 0u64).unwrap();
    let values = client.gets_with_token(&["c1"], false).unwrap();
    let token = values["c1"].token;
    assert_eq!(values["c1"].value, b"first".to_vec());

    assert_eq!(client.cas("c1", token + 1, b"lost", 0u64).unwrap(), CasResponse::Superseded);
    assert_eq!(client.cas("c1", token, b"second", 0u64).unwrap(), CasResponse::Stored);
    assert_eq!(client.cas("c1", token, b"third", 0u64).unwrap(), CasResponse::Superseded);
    assert_eq!(client.cas("c2", 1, b"x", 0u64).unwrap(), CasResponse::NotFound);
    assert_eq!(client.get("c1").unwrap(), Some(b"second".to_vec()));
    client.shutdown();
}

#[test]
fn counters_and_the_not_found_sentinel() {
    let cluster = Cluster::start(2, 0);
    let client = open_client::<SharedQueueThreadPool>(&cluster);

    client.put("c-hits", b"10", 0u64).unwrap();
    assert_eq!(client.incr("c-hits", 5).unwrap(), BigInt::from(15));
    assert_eq!(client.decr("c-hits", 20).unwrap(), BigInt::from(0));

    // a missing counter is not an error: it reads as -1
    assert_eq!(client.incr("c-missing", 1).unwrap(), BigInt::from(COUNTER_NOT_FOUND));
    assert_eq!(client.decr("c-missing", 1).unwrap(), BigInt::from(-1));
    client.shutdown();
}

fn batch_sends_one_request_per_node<P: ThreadPool>(concurrent: bool) {
    let cluster = Cluster::start(2, 0);
    let client = open_client::<P>(&cluster);
    for key in &["a1", "b1", "c1", "z1"] {
        client.put(key, key.as_bytes(), 0u64).unwrap();
    }
    cluster.clear_requests();

    let keys = ["a1", "b1", "c1", "z1", "a1", "nope"];
    let values = client.gets(&keys, concurrent).unwrap();

    assert_eq!(values.len(), 4);
    for key in &["a1", "b1", "c1", "z1"] {
        assert_eq!(values[*key], key.as_bytes().to_vec());
    }
    assert_eq!(cluster.states[0].count("get"), 1);
    assert_eq!(cluster.states[1].count("get"), 1);
    assert_eq!(client.pool_stats().in_use(), 0);
    client.shutdown();
}

#[test]
fn sequential_batch_sends_one_request_per_node() {
    batch_sends_one_request_per_node::<SharedQueueThreadPool>(false);
}

#[test]
fn concurrent_batch_sends_one_request_per_node() {
    batch_sends_one_request_per_node::<SharedQueueThreadPool>(true);
    batch_sends_one_request_per_node::<RayonThreadPool>(true);
}

#[test]
fn batch_fails_when_any_node_fails() {
    // the dead node sits at 30 and owns the keys hashed to 25
    let cluster = Cluster::start(2, 1);
    let client = open_client::<SharedQueueThreadPool>(&cluster);
    client.put("a1", b"v", 0u64).unwrap();

    for &concurrent in &[false, true] {
        match client.gets(&["a1", "c1", "z1", "zz"], concurrent) {
            Err(ClientError::Batch { node, mut keys, source }) => {
                assert_eq!(node, cluster.nodes[2]);
                keys.sort();
                assert_eq!(keys, vec!["z1".to_string(), "zz".to_string()]);
                assert!(matches!(*source, ClientError::ConnectFailed { .. }));
            }
            other => panic!("expected a batch failure, got {:?}", other),
        }
    }
    assert_eq!(client.pool_stats().in_use(), 0);

    // keys on live nodes are still served
    assert_eq!(client.gets(&["a1", "c1"], true).unwrap().len(), 1);
    client.shutdown();
}

#[test]
fn empty_batches_and_invalid_keys() {
    let cluster = Cluster::start(1, 0);
    let client = open_client::<SharedQueueThreadPool>(&cluster);
    let none: [&str; 0] = [];

    assert!(client.gets(&none, true).unwrap().is_empty());
    assert!(client.gets_with_token(&none, false).unwrap().is_empty());
    assert!(matches!(client.gets(&["ok", "not ok"], false), Err(ClientError::Argument(_))));
    assert!(matches!(client.put("", b"v", 0u64), Err(ClientError::Argument(_))));
    client.shutdown();
}

#[test]
fn connections_are_reused_and_always_released() {
    let cluster = Cluster::start(2, 1);
    let client = open_client::<SharedQueueThreadPool>(&cluster);

    for _ in 0..5 {
        client.put("a1", b"v", 0u64).unwrap();
    }
    assert!(client.get("z1").is_err());

    let stats = client.pool_stats();
    assert_eq!(stats.in_use(), 0);
    assert!(stats.reused >= 4, "{:?}", stats);
    client.shutdown();
}

#[test]
fn close_is_idempotent_and_reopen_works() {
    let cluster = Cluster::start(2, 0);
    let client = open_client::<SharedQueueThreadPool>(&cluster);
    client.put("a1", b"v", 0u64).unwrap();
    // opening again keeps the current state
    client.open(&cluster.nodes).unwrap();

    client.close();
    client.close();
    assert!(!client.is_open());
    assert_eq!(client.routing_fingerprint(), None);
    assert!(matches!(client.get("a1"), Err(ClientError::NotOpen)));
    assert!(matches!(client.gets(&["a1"], true), Err(ClientError::NotOpen)));

    client.open_node(cluster.nodes[1].clone()).unwrap();
    assert_eq!(client.get("a1").unwrap(), Some(b"v".to_vec()));
    client.shutdown();
}

#[test]
fn node_directed_commands_work_while_closed() {
    let cluster = Cluster::start(2, 0);
    let client = RingClient::new(ClientConfig::default()).unwrap();

    let dump = client.routing_dump(&cluster.nodes[0]).unwrap();
    assert_eq!(dump.entries().len(), 2);
    let digest = client.routing_digest(&cluster.nodes[1]).unwrap();
    assert_eq!(digest, Some(format!("digest-{}", cluster.nodes[1].port())));
}

#[test]
fn refresh_loop_follows_topology_changes() {
    let cluster = Cluster::start(2, 0);
    let config = ClientConfig {
        refresh_interval_ms: 20,
        ..ClientConfig::default()
    };
    let client: RingClient =
        RingClient::with_hasher(config, Arc::new(PinnedHasher)).unwrap();
    client.open(&cluster.nodes[..1]).unwrap();
    let before = client.routing_fingerprint();

    // the second node takes over the whole ring
    cluster.set_topology(&[format!("10 {}", cluster.nodes[1])]);
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.routing_fingerprint() == before && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_ne!(client.routing_fingerprint(), before);
    assert_eq!(client.nodelist().unwrap(), vec![cluster.nodes[1].to_string()]);

    cluster.clear_requests();
    client.put("a1", b"v", 0u64).unwrap();
    assert_eq!(cluster.states[0].count("set"), 0);
    assert_eq!(cluster.states[1].count("set"), 1);
    client.shutdown();
}

#[test]
fn concurrent_callers_share_one_client() {
    let cluster = Cluster::start(2, 0);
    let client = open_client::<SharedQueueThreadPool>(&cluster);

    scoped::scope(|s| {
        for t in 0..8 {
            let client = &client;
            s.spawn(move |_| {
                for i in 0..20 {
                    let key = if i % 2 == 0 {
                        format!("a{}-{}", t, i)
                    } else {
                        format!("c{}-{}", t, i)
                    };
                    assert!(client.put(&key, key.as_bytes(), 0u64).unwrap());
                    assert_eq!(client.get(&key).unwrap(), Some(key.clone().into_bytes()));
                }
                let keys: Vec<String> = (0..20).map(|i| format!("a{}-{}", t, i)).collect();
                assert_eq!(client.gets(&keys, true).unwrap().len(), 10);
            });
        }
    })
    .unwrap();

    assert_eq!(client.pool_stats().in_use(), 0);
    client.shutdown();
}
