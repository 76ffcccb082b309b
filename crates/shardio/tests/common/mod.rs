//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use shardio::{Engine, EngineConfig};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small, fast-ticking config on an ephemeral loopback port.
pub fn test_config() -> EngineConfig {
    EngineConfig::new()
        .addrs(["127.0.0.1:0"])
        .num_workers(2)
        .poll_interval(Duration::from_millis(10))
}

pub fn tcp_addr(engine: &Engine) -> SocketAddr {
    engine.local_addrs()[0].as_inet().expect("inet address")
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

pub fn round_trip(stream: &mut TcpStream, msg: &[u8]) -> Vec<u8> {
    stream.write_all(msg).unwrap();
    let mut buf = vec![0u8; msg.len()];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Poll `cond` until true or five seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Unique socket path under the temp dir.
pub fn socket_path(tag: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("shardio-{}-{}.sock", tag, std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}
