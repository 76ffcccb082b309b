//! End-to-end: binding, close semantics, buffer hooks and shutdown.

mod common;

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, UdpSocket};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use shardio::{
    Buffer, BufferPool, CloseReason, Conn, ConnError, ConnState, Engine, EngineError, EngineState,
    NetworkKind,
};

use common::*;

type Log = Arc<Mutex<Vec<String>>>;

fn reason_name(reason: &CloseReason) -> &'static str {
    match reason {
        CloseReason::PeerClosed => "peer",
        CloseReason::Local => "local",
        CloseReason::Io(_) => "io",
        CloseReason::Shutdown => "shutdown",
        CloseReason::ForcedShutdown => "forced",
        CloseReason::IdleTimeout => "idle",
    }
}

/// Read until EOF (or reset), returning how many bytes arrived.
fn read_to_close(stream: &mut impl Read) -> usize {
    let mut total = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return total,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return total,
        }
    }
}

// ── Start ───────────────────────────────────────────────────────────

#[test]
fn test_bind_conflict_fails_without_open() {
    init_logging();
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let opened = Arc::new(AtomicUsize::new(0));
    let o = opened.clone();
    let engine = Engine::builder(test_config().addrs([addr.to_string()]))
        .on_open(move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    let err = engine.start().unwrap_err();
    match &err {
        EngineError::Bind { addr: a, source } => {
            assert_eq!(a, &addr.to_string());
            assert_eq!(source.kind(), ErrorKind::AddrInUse);
        }
        other => panic!("expected bind error, got {:?}", other),
    }
    assert_eq!(engine.state(), EngineState::Created);
    assert_eq!(opened.load(Ordering::SeqCst), 0);
    assert_eq!(engine.open_connections(), 0);
}

#[test]
fn test_partial_bind_releases_earlier_listeners() {
    init_logging();
    let fresh = socket_path("fresh");
    let stale = socket_path("stale");
    let _holder = UnixListener::bind(&stale).unwrap();

    let engine = Engine::builder(
        test_config()
            .network(NetworkKind::Local)
            .addrs([fresh.to_string_lossy().into_owned(), stale.to_string_lossy().into_owned()]),
    )
    .build();

    assert!(engine.start().unwrap_err().is_bind());
    // The first listener was closed and its path removed; the stale one kept.
    assert!(!fresh.exists());
    assert!(stale.exists());
    let _ = std::fs::remove_file(&stale);
}

// ── Connection lifecycle ────────────────────────────────────────────

#[test]
fn test_zero_byte_disconnect() {
    init_logging();
    let log: Log = Arc::default();
    let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
    let engine = Engine::builder(test_config())
        .on_open(move |_| l1.lock().unwrap().push("open".into()))
        .on_data(move |_, _| l2.lock().unwrap().push("data".into()))
        .on_close(move |_, r| l3.lock().unwrap().push(format!("close {}", reason_name(r))))
        .build();
    engine.start().unwrap();

    drop(connect(tcp_addr(&engine)));

    assert!(wait_until(|| log.lock().unwrap().len() >= 2));
    assert_eq!(*log.lock().unwrap(), vec!["open".to_string(), "close peer".to_string()]);
    assert!(wait_until(|| engine.open_connections() == 0));
    engine.shutdown(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_close_twice_and_write_after_close() {
    init_logging();
    let results: Log = Arc::default();
    let (r1, r2) = (results.clone(), results.clone());
    let engine = Engine::builder(test_config())
        .on_data(move |conn, _| {
            let first = conn.close();
            let second = conn.close();
            let write = conn.write(b"late");
            let mut r = r1.lock().unwrap();
            r.push(format!("{:?}", first.is_ok()));
            r.push(format!("{}", matches!(second, Err(ConnError::AlreadyClosed))));
            r.push(format!("{}", matches!(write, Err(ConnError::ConnectionClosed))));
        })
        .on_close(move |conn, reason| {
            assert_eq!(conn.state(), ConnState::Closed);
            r2.lock().unwrap().push(reason_name(reason).to_string());
        })
        .build();
    engine.start().unwrap();

    let mut client = connect(tcp_addr(&engine));
    client.write_all(b"bye").unwrap();
    assert_eq!(read_to_close(&mut client), 0);

    assert!(wait_until(|| results.lock().unwrap().len() == 4));
    assert_eq!(*results.lock().unwrap(), vec!["true", "true", "true", "local"]);
    engine.shutdown(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_write_and_close_from_foreign_thread() {
    init_logging();
    let slot: Arc<Mutex<Option<Conn>>> = Arc::default();
    let closed: Log = Arc::default();
    let (s, c) = (slot.clone(), closed.clone());
    let engine = Engine::builder(test_config())
        .on_open(move |conn| *s.lock().unwrap() = Some(conn.clone()))
        .on_close(move |_, reason| c.lock().unwrap().push(reason_name(reason).to_string()))
        .build();
    engine.start().unwrap();

    let mut client = connect(tcp_addr(&engine));
    assert!(wait_until(|| slot.lock().unwrap().is_some()));
    let conn = slot.lock().unwrap().take().unwrap();

    assert_eq!(conn.write(b"from afar").unwrap(), 9);
    conn.close().unwrap();

    let mut buf = [0u8; 9];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"from afar");
    assert_eq!(read_to_close(&mut client), 0);

    assert!(wait_until(|| !closed.lock().unwrap().is_empty()));
    assert_eq!(*closed.lock().unwrap(), vec!["local"]);
    assert!(matches!(conn.write(b"x"), Err(ConnError::ConnectionClosed)));
    engine.shutdown(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_close_drains_queued_writes() {
    init_logging();
    const TOTAL: usize = 8 * 1024 * 1024;
    let engine = Engine::builder(test_config())
        .on_data(|conn, _| {
            let payload = vec![0x5au8; TOTAL];
            conn.write(&payload).unwrap();
            conn.close().unwrap();
        })
        .build();
    engine.start().unwrap();

    let mut client = connect(tcp_addr(&engine));
    client.write_all(b"go").unwrap();
    // Let the server back up before reading anything.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(read_to_close(&mut client), TOTAL);

    engine.shutdown(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_read_buffer_hooks_balance() {
    init_logging();
    let allocs = Arc::new(AtomicUsize::new(0));
    let frees = Arc::new(AtomicUsize::new(0));
    let (a, f) = (allocs.clone(), frees.clone());
    let pool = Arc::new(BufferPool::with_uniform_high_water(8));
    let (pa, pf) = (pool.clone(), pool.clone());

    let engine = Engine::builder(test_config())
        .on_read_buffer_alloc(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            pa.allocate(256)
        })
        .on_read_buffer_free(move |_, buf: Buffer| {
            f.fetch_add(1, Ordering::SeqCst);
            pf.release(buf);
        })
        .on_data(|conn, data| {
            let _ = conn.write(data);
        })
        .build();
    engine.start().unwrap();

    let mut client = connect(tcp_addr(&engine));
    for _ in 0..20 {
        assert_eq!(round_trip(&mut client, b"0123456789"), b"0123456789");
    }
    drop(client);
    assert!(wait_until(|| engine.open_connections() == 0));
    engine.shutdown(Duration::from_secs(1)).unwrap();

    let (n_alloc, n_free) = (allocs.load(Ordering::SeqCst), frees.load(Ordering::SeqCst));
    assert!(n_alloc >= 21, "one read per message plus the EOF read");
    assert_eq!(n_alloc, n_free);
    assert_eq!(pool.stats().outstanding, 0);
}

#[test]
fn test_datagram_idle_timeout() {
    init_logging();
    let closed: Log = Arc::default();
    let c = closed.clone();
    let engine = Engine::builder(
        test_config()
            .network(NetworkKind::Datagram)
            .datagram_idle_timeout(Some(Duration::from_millis(50))),
    )
    .on_close(move |_, reason| c.lock().unwrap().push(reason_name(reason).to_string()))
    .build();
    engine.start().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"hello", tcp_addr(&engine)).unwrap();

    assert!(wait_until(|| !closed.lock().unwrap().is_empty()));
    assert_eq!(*closed.lock().unwrap(), vec!["idle"]);
    assert_eq!(engine.open_connections(), 0);
    engine.shutdown(Duration::from_secs(1)).unwrap();
}

// ── Shutdown ────────────────────────────────────────────────────────

#[test]
fn test_shutdown_idle_engine_is_fast() {
    init_logging();
    let engine = Engine::builder(test_config().num_workers(4)).build();
    engine.start().unwrap();

    let start = Instant::now();
    engine.shutdown(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_millis(250), "took {:?}", start.elapsed());
    assert_eq!(engine.state(), EngineState::Stopped);

    // Listener closed.
    assert!(std::net::TcpStream::connect(engine.local_addrs()[0].as_inet().unwrap()).is_err());
}

#[test]
fn test_shutdown_closes_idle_connections() {
    init_logging();
    let closed: Log = Arc::default();
    let c = closed.clone();
    let engine = Engine::builder(test_config())
        .on_close(move |_, reason| c.lock().unwrap().push(reason_name(reason).to_string()))
        .build();
    engine.start().unwrap();

    let mut clients: Vec<_> = (0..3).map(|_| connect(tcp_addr(&engine))).collect();
    assert!(wait_until(|| engine.open_connections() == 3));

    engine.shutdown(Duration::from_secs(2)).unwrap();
    assert_eq!(*closed.lock().unwrap(), vec!["shutdown"; 3]);
    for client in &mut clients {
        assert_eq!(read_to_close(client), 0);
    }
}

#[test]
fn test_shutdown_waits_for_queued_writes() {
    init_logging();
    const TOTAL: usize = 16 * 1024 * 1024;
    let closed: Log = Arc::default();
    let c = closed.clone();
    let engine = Arc::new(
        Engine::builder(test_config())
            .on_open(|conn| {
                conn.write(&vec![1u8; TOTAL]).unwrap();
            })
            .on_close(move |_, reason| c.lock().unwrap().push(reason_name(reason).to_string()))
            .build(),
    );
    engine.start().unwrap();

    let mut client = connect(tcp_addr(&engine));
    assert!(wait_until(|| engine.open_connections() == 1));

    let e = engine.clone();
    let stopper = thread::spawn(move || e.shutdown(Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(20));

    assert_eq!(read_to_close(&mut client), TOTAL);
    stopper.join().unwrap().unwrap();
    assert_eq!(*closed.lock().unwrap(), vec!["shutdown"]);
}

#[test]
fn test_forced_shutdown_after_deadline() {
    init_logging();
    let loaded = Arc::new(AtomicUsize::new(0));
    let closed: Log = Arc::default();
    let (l, c) = (loaded.clone(), closed.clone());
    let engine = Engine::builder(test_config())
        .on_open(move |conn| {
            // Fill the socket until the engine has to queue.
            let chunk = vec![0u8; 1024 * 1024];
            for _ in 0..256 {
                if conn.queued() > 0 {
                    break;
                }
                conn.write(&chunk).unwrap();
            }
            l.fetch_add(1, Ordering::SeqCst);
        })
        .on_close(move |_, reason| c.lock().unwrap().push(reason_name(reason).to_string()))
        .build();
    engine.start().unwrap();

    // Peers that never read.
    let clients: Vec<_> = (0..3).map(|_| connect(tcp_addr(&engine))).collect();
    assert!(wait_until(|| loaded.load(Ordering::SeqCst) == 3));

    let deadline = Duration::from_millis(200);
    let start = Instant::now();
    let err = engine.shutdown(deadline).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, EngineError::DeadlineExceeded { remaining: 3 }), "{:?}", err);
    assert!(elapsed >= deadline);
    assert!(elapsed < deadline + Duration::from_secs(2), "took {:?}", elapsed);
    assert_eq!(*closed.lock().unwrap(), vec!["forced"; 3]);
    assert_eq!(engine.open_connections(), 0);
    assert_eq!(engine.state(), EngineState::Stopped);
    drop(clients);
}

#[test]
fn test_shutdown_bounded_while_hook_blocks() {
    init_logging();
    let entered = Arc::new(AtomicUsize::new(0));
    let closed: Log = Arc::default();
    let (e, c) = (entered.clone(), closed.clone());
    let engine = Engine::builder(test_config().num_workers(1))
        .on_data(move |_, _| {
            e.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_secs(2));
        })
        .on_close(move |_, reason| c.lock().unwrap().push(reason_name(reason).to_string()))
        .build();
    engine.start().unwrap();

    let mut client = connect(tcp_addr(&engine));
    client.write_all(b"x").unwrap();
    assert!(wait_until(|| entered.load(Ordering::SeqCst) == 1));

    let deadline = Duration::from_millis(200);
    let start = Instant::now();
    let err = engine.shutdown(deadline).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, EngineError::DeadlineExceeded { remaining: 1 }), "{:?}", err);
    assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    assert_eq!(engine.state(), EngineState::Stopped);

    // The worker finishes the hook, then closes without a graceful pass.
    assert!(wait_until(|| closed.lock().unwrap().len() == 1));
    assert_eq!(*closed.lock().unwrap(), vec!["forced"]);
    assert!(wait_until(|| engine.open_connections() == 0));
    assert_eq!(read_to_close(&mut client), 0);
}

#[test]
fn test_drop_running_engine_closes_connections() {
    init_logging();
    let engine = Engine::builder(test_config()).build();
    engine.start().unwrap();
    let mut client = connect(tcp_addr(&engine));
    assert!(wait_until(|| engine.open_connections() == 1));

    drop(engine);
    assert_eq!(read_to_close(&mut client), 0);
}
