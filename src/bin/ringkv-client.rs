//! The ringkv-client executable supports the following command line arguments:
//!
//! `ringkv-client get <KEY> [--nodes NODES]`
//!
//!     Print the value of a key, or "Key not found".
//!
//! `ringkv-client set <KEY> <VALUE> [--expiry SECONDS] [--nodes NODES]`
//!
//!     Store a value under a key. A value the cluster declines to store is an error.
//!
//! `ringkv-client rm <KEY> [--nodes NODES]`
//!
//!     Remove a key. A "key not found" is treated as an error.
//!
//! `ringkv-client nodes [--nodes NODES]`
//!
//!     Print the physical nodes of the cluster, one per line.
//!
//! `ringkv-client digest [--nodes NODES]`
//!
//!     Print the routing digest reported by every physical node.
//!
//! NODES is a comma separated list of seed nodes, each written `host_port` or `host:port`.
//! If --nodes is not specified then 127.0.0.1_11211 is used. `--config FILE` loads client
//! settings from a JSON file and `--verbose` logs at debug level to STDERR.
//! Any failure prints an error and returns a non-zero exit code.

use std::path::Path;

use clap::{crate_version, App, Arg, ArgMatches, SubCommand};
use ringkv::{ClientConfig, ClientError, Expiry, Node, Result, RingClient};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_NODES: &str = "127.0.0.1_11211";

/// the operation requested on the command line
#[derive(Debug)]
enum Request {
    Get { key: String },
    Set { key: String, value: String, expiry: Expiry },
    Remove { key: String },
    Nodes,
    Digest,
}

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    /// the seed nodes
    nodes: Vec<Node>,
    config: ClientConfig,
    req: Request,
}

impl Opt {
    /// validates the `nodes` and `config` parameters
    /// # Errors
    /// returns [`ClientError::Argument`] if a node does not parse, [`ClientError::Config`] if the
    /// config file is unreadable or invalid
    fn build(nodes: &str, config: Option<&str>, req: Request) -> Result<Opt> {
        let nodes = nodes
            .split(',')
            .filter(|node| !node.trim().is_empty())
            .map(|node| node.trim().parse())
            .collect::<Result<Vec<Node>>>()?;
        let config = match config {
            Some(path) => ClientConfig::from_json_file(Path::new(path))?,
            None => ClientConfig::default(),
        };
        Ok(Opt { nodes, config, req })
    }
}

fn main() -> Result<()> {
    let matches = App::new("ringkv-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("queries a consistent-hashing key-value cluster")
        .subcommands(vec![
            SubCommand::with_name("get")
                .about("Get the value of a given key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("set")
                .about("Set the value of a key")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(Arg::with_name("VALUE").required(true).index(2))
                .arg(
                    Arg::with_name("expiry")
                        .long("expiry")
                        .value_name("SECONDS")
                        .help("seconds until the value expires, 0 never expires")
                        .default_value("0"),
                ),
            SubCommand::with_name("rm")
                .about("Removes a given key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("nodes").about("Lists the physical nodes of the cluster"),
            SubCommand::with_name("digest").about("Prints the routing digest of every node"),
        ])
        .arg(
            Arg::with_name("nodes")
                .long("nodes")
                .value_name("NODES")
                .help("comma separated seed nodes, each host_port or host:port")
                .default_value(DEFAULT_NODES),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("reads client settings from a JSON file"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .help("logs debug output to STDERR"),
        )
        .get_matches();

    // configure a subscriber that will log messages to STDERR
    subscriber_config(matches.is_present("verbose"));

    let opt = parse_options(&matches)?;
    run(opt)
}

/// opens a [`RingClient`] on the seed nodes and runs the request
fn run(opt: Opt) -> Result<()> {
    let client = RingClient::new(opt.config)?;
    client.open(&opt.nodes)?;
    let result = execute(&client, opt.req);
    client.shutdown();
    result
}

fn execute(client: &RingClient, req: Request) -> Result<()> {
    match req {
        Request::Get { key } => match client.get(&key)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("Key not found"),
        },
        Request::Set { key, value, expiry } => {
            if !client.put(&key, value.as_bytes(), expiry)? {
                return Err(ClientError::Protocol(format!("{} was not stored", key)));
            }
        }
        Request::Remove { key } => {
            if !client.delete(&key)? {
                return Err(ClientError::Argument("Key not found".into()));
            }
        }
        Request::Nodes => {
            for node in client.nodelist()? {
                println!("{}", node);
            }
        }
        Request::Digest => {
            for node in client.nodelist()? {
                let digest = client.routing_digest(&node.parse()?)?;
                println!("{} {}", node, digest.as_deref().unwrap_or("-"));
            }
        }
    }
    Ok(())
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: &ArgMatches) -> Result<Opt> {
    let nodes = matches.value_of("nodes").unwrap_or(DEFAULT_NODES);
    let config = matches.value_of("config");
    let key = |args: &ArgMatches| args.value_of("KEY").unwrap_or_default().to_string();
    let req = match matches.subcommand() {
        ("get", Some(args)) => Request::Get { key: key(args) },
        ("set", Some(args)) => Request::Set {
            key: key(args),
            value: args.value_of("VALUE").unwrap_or_default().to_string(),
            expiry: args.value_of("expiry").unwrap_or("0").parse()?,
        },
        ("rm", Some(args)) => Request::Remove { key: key(args) },
        ("nodes", Some(_)) => Request::Nodes,
        ("digest", Some(_)) => Request::Digest,
        _ => return Err(ClientError::Argument("a subcommand is required".into())),
    };
    Opt::build(nodes, config, req)
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not set the tracing subscriber: {}", e);
    }
}
