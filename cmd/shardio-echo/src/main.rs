//! shardio echo server
//!
//! Echoes every payload back to its sender and prints it. Connections are
//! tracked in an online set; data from a connection that is not in the set
//! closes it.
//!
//! Usage:
//!     cargo build --release -p shardio-echo
//!     ./target/release/shardio-echo [-l addr]... [-n tcp|udp|unix] [-w workers]
//!
//! Anything not given on the command line comes from `SHARDIO_*` env vars.
//!
//! Test with:
//!     echo "hello" | nc localhost 9000
//!     echo "hello" | nc -u -q1 localhost 9000     # with -n udp
//!     echo "hello" | nc -U -q1 /tmp/echo.sock      # with -n unix -l /tmp/echo.sock

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::{info, warn};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{SigSet, Signal};

use shardio::{Conn, ConnId, Engine, EngineConfig, NetworkKind};

/// Connections the application considers live.
type Online = DashMap<ConnId, (Conn, Instant)>;

#[derive(Debug, Default, PartialEq)]
struct Args {
    addrs: Vec<String>,
    network: Option<NetworkKind>,
    workers: Option<usize>,
    help: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| format!("{} needs a value", flag));
        match arg.as_str() {
            "-l" | "--listen" => parsed.addrs.push(value("-l")?),
            "-n" | "--network" => {
                parsed.network = Some(value("-n")?.parse().map_err(|e| format!("-n: {}", e))?)
            }
            "-w" | "--workers" => {
                parsed.workers = Some(value("-w")?.parse().map_err(|e| format!("-w: {}", e))?)
            }
            "-h" | "--help" => parsed.help = true,
            other => return Err(format!("unknown argument {:?}", other)),
        }
    }
    Ok(parsed)
}

fn usage() {
    eprintln!("usage: shardio-echo [-l addr]... [-n tcp|udp|unix] [-w workers]");
}

fn init_logging() {
    // SHARDIO_LOG wins over RUST_LOG.
    let env = if std::env::var_os("SHARDIO_LOG").is_some() {
        env_logger::Env::new().filter("SHARDIO_LOG")
    } else {
        env_logger::Env::default().default_filter_or("info")
    };
    env_logger::Builder::from_env(env).format_timestamp_millis().init();
}

/// Raise the soft open-file limit to the hard limit.
fn raise_fd_limit() -> nix::Result<u64> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft < hard {
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
    }
    Ok(hard as u64)
}

fn build_engine(config: EngineConfig, online: Arc<Online>) -> Engine {
    let (on_open, on_close, on_data) = (online.clone(), online.clone(), online);

    Engine::builder(config)
        .on_open(move |conn| {
            info!("open {} from {}", conn.id(), conn.remote_addr());
            on_open.insert(conn.id(), (conn.clone(), Instant::now()));
        })
        .on_close(move |conn, reason| {
            match on_close.remove(&conn.id()) {
                Some((_, (_, since))) => {
                    info!("close {} after {:?}: {}", conn.id(), since.elapsed(), reason)
                }
                None => info!("close {}: {}", conn.id(), reason),
            }
        })
        .on_data(move |conn, data| {
            if !on_data.contains_key(&conn.id()) {
                warn!("data from unknown connection {}, closing", conn.id());
                let _ = conn.close();
                return;
            }
            println!("{} {}: {}", conn.id(), conn.remote_addr(), String::from_utf8_lossy(data).trim_end());
            if let Err(e) = conn.write(data) {
                warn!("echo to {}: {}", conn.id(), e);
            }
        })
        .build()
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        usage();
        return Ok(());
    }

    let mut config = EngineConfig::from_env();
    if !args.addrs.is_empty() {
        config = config.addrs(args.addrs);
    }
    if let Some(network) = args.network {
        config = config.network(network);
    }
    if let Some(workers) = args.workers {
        config = config.num_workers(workers);
    }

    match raise_fd_limit() {
        Ok(limit) => info!("open file limit {}", limit),
        Err(e) => warn!("could not raise open file limit: {}", e),
    }

    // Block before any thread exists so every thread inherits the mask.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;

    let online: Arc<Online> = Arc::new(DashMap::new());
    let deadline = config.shutdown_deadline;
    let engine = build_engine(config, online.clone());
    engine.start()?;
    for addr in engine.local_addrs() {
        info!("echo server on {} {}", engine.config().network, addr);
    }

    let signal = signals.wait()?;
    info!("{:?} received, {} online, shutting down", signal, online.len());

    if let Err(e) = engine.shutdown(deadline) {
        warn!("{}", e);
    }
    println!("safe exit");
    Ok(())
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("shardio-echo: {}", e);
        usage();
        std::process::exit(1);
    }
}
