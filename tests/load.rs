//! End-to-end runs against an in-process mock HTTP server.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pisk::script::{Script, StaticScript, Url};
use pisk::worker::Shared;
use pisk::Config;

/// Serves `HTTP/1.1 200` with a 2-byte body for every request terminator it
/// sees. With `keep_alive` off it appends `Connection: close` and drops the
/// socket after one response.
fn spawn_server(keep_alive: bool) -> (SocketAddr, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    listener.set_nonblocking(true).expect("nonblocking listener");
    let addr = listener.local_addr().expect("local addr");

    let done = Arc::new(AtomicBool::new(false));
    let stop = done.clone();

    thread::spawn(move || loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let stop = stop.clone();
                thread::spawn(move || serve(stream, keep_alive, stop));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    });

    (addr, done)
}

fn serve(mut stream: TcpStream, keep_alive: bool, stop: Arc<AtomicBool>) {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .expect("read timeout");

    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => return,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = find_terminator(&pending) {
            pending.drain(..pos + 4);
            let response: &[u8] = if keep_alive {
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
            } else {
                b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok"
            };
            if stream.write_all(response).is_err() {
                return;
            }
            if !keep_alive {
                return;
            }
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn config(addr: SocketAddr, threads: u64, connections: u64, duration_ms: u64, rate: u64) -> Config {
    Config {
        url: format!("http://{addr}/"),
        threads,
        connections,
        duration_ms,
        timeout_ms: 2_000,
        rate,
        latency: false,
        u_latency: false,
        record_all_responses: true,
        warmup: false,
        warmup_timeout_ms: 0,
        headers: Vec::new(),
        local_ips: Vec::new(),
    }
}

fn static_script(cfg: &Config) -> StaticScript {
    let url = Url::parse(&cfg.url).expect("mock url");
    StaticScript::new(&url, &cfg.headers)
}

#[test]
fn sustains_the_requested_rate() {
    let (addr, done) = spawn_server(true);
    let cfg = config(addr, 2, 4, 2_000, 200);
    let shared = Arc::new(Shared::new(cfg.threads));

    let summary = pisk::run(&cfg, static_script(&cfg), shared).expect("run");
    done.store(true, Ordering::Relaxed);

    assert!(
        summary.complete >= 300 && summary.complete <= 500,
        "complete = {}",
        summary.complete
    );
    assert_eq!(0, summary.errors.connect, "{:?}", summary.errors);
    assert_eq!(0, summary.errors.reconnect, "{:?}", summary.errors);
    assert_eq!(0, summary.errors.status, "{:?}", summary.errors);
    assert_eq!(4, summary.errors.established);
    // the response that trips the deadline is counted but not recorded
    assert!(
        summary.latency.len() >= summary.complete - 2 && summary.latency.len() <= summary.complete,
        "recorded = {}, complete = {}",
        summary.latency.len(),
        summary.complete
    );
    // an idle local server answers fast; corrected latencies stay small
    assert!(summary.latency.max() < 1_000_000, "{}", summary.latency.max());
    assert!(summary.bytes > 0);
}

#[test]
fn reconnects_when_the_server_closes_every_response() {
    let (addr, done) = spawn_server(false);
    let cfg = config(addr, 1, 1, 1_000, 50);
    let shared = Arc::new(Shared::new(cfg.threads));

    let summary = pisk::run(&cfg, static_script(&cfg), shared).expect("run");
    done.store(true, Ordering::Relaxed);

    assert!(
        summary.complete >= 20 && summary.complete <= 75,
        "complete = {}",
        summary.complete
    );
    // every completed response forced a reconnect
    assert!(
        summary.errors.reconnect >= summary.complete.saturating_sub(1),
        "reconnect = {}, complete = {}",
        summary.errors.reconnect,
        summary.complete
    );
    assert!(
        summary.errors.established + 1 >= summary.errors.reconnect
            && summary.errors.established <= summary.errors.reconnect + 1,
        "established = {}, reconnect = {}",
        summary.errors.established,
        summary.errors.reconnect
    );
}

#[test]
fn stop_flag_ends_the_run_early() {
    let (addr, done) = spawn_server(true);
    let cfg = config(addr, 1, 2, 10_000, 100);
    let shared = Arc::new(Shared::new(cfg.threads));

    let stopper = shared.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stopper.request_stop();
    });

    let summary = pisk::run(&cfg, static_script(&cfg), shared).expect("run");
    done.store(true, Ordering::Relaxed);

    // the stop check runs every 2s; the run must end well before the 10s
    // deadline
    assert!(
        summary.runtime_us < 5_000_000,
        "runtime_us = {}",
        summary.runtime_us
    );
    assert!(summary.complete < 500, "complete = {}", summary.complete);
}

#[test]
fn warmup_releases_into_normal_and_measures_from_there() {
    let (addr, done) = spawn_server(true);
    let mut cfg = config(addr, 4, 4, 1_000, 400);
    cfg.warmup = true;
    cfg.warmup_timeout_ms = 200;
    let shared = Arc::new(Shared::new(cfg.threads));

    let summary = pisk::run(&cfg, static_script(&cfg), shared).expect("run");
    done.store(true, Ordering::Relaxed);

    // runtime counts from the first NORMAL transition, not from startup
    assert!(
        summary.runtime_us < 1_300_000,
        "runtime_us = {}",
        summary.runtime_us
    );
    assert!(
        summary.complete >= 150 && summary.complete <= 550,
        "complete = {}",
        summary.complete
    );
    assert_eq!(4, summary.errors.established);
}

#[derive(Clone)]
struct PipelinedScript {
    request: Vec<u8>,
    depth: u64,
}

impl PipelinedScript {
    fn new(cfg: &Config, depth: u64) -> Self {
        let url = Url::parse(&cfg.url).expect("mock url");
        let one = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", url.path, url.host);
        PipelinedScript {
            request: one.repeat(depth as usize).into_bytes(),
            depth,
        }
    }
}

impl Script for PipelinedScript {
    fn verify_request(&self) -> u64 {
        self.depth
    }

    fn request(&mut self) -> Vec<u8> {
        self.request.clone()
    }
}

#[test]
fn batch_latency_records_once_per_pipelined_batch() {
    let (addr, done) = spawn_server(true);
    let mut cfg = config(addr, 1, 1, 1_000, 200);
    cfg.record_all_responses = false;
    let shared = Arc::new(Shared::new(cfg.threads));

    let script = PipelinedScript::new(&cfg, 4);
    let summary = pisk::run(&cfg, script, shared).expect("run");
    done.store(true, Ordering::Relaxed);

    assert!(
        summary.complete >= 120 && summary.complete <= 280,
        "complete = {}",
        summary.complete
    );
    // one record per batch of four
    let recorded = summary.latency.len();
    assert!(
        recorded >= summary.complete / 4 - 2 && recorded <= summary.complete / 4 + 2,
        "recorded = {recorded}, complete = {}",
        summary.complete
    );
}
