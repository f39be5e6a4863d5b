//! Worker engine: one event loop driving a fixed array of connections.
//!
//! Each worker thread is strictly single-threaded and cooperative — the only
//! suspension point is the reactor's wait call. State shared across workers
//! is limited to the stop flag, the warmup barrier and the rate-sample
//! container, all owned by [`Shared`].
//!
//! Phases run `INIT → WARMUP → NORMAL` (or straight to `NORMAL` without
//! warmup) and never go backwards. In WARMUP, connections are established
//! but held unsubscribed; the barrier releases all workers into NORMAL
//! within one sync interval of the slowest.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hdrhistogram::Histogram;
use mio::{Interest, Token};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tracing::{debug, error, info, warn};

use crate::clock::time_us;
use crate::connection::{Completed, Connection, RECVBUF};
use crate::event::{Reactor, TimerKind};
use crate::net::{Progress, Transport};
use crate::pacer::Decision;
use crate::script::Script;
use crate::stats::{new_histogram, Errors, SampleStats};
use crate::Config;

/// Delay before the one-shot sampling-interval calibration.
pub const CALIBRATE_DELAY_MS: u64 = 10_000;
/// Period of the stop-flag and deadline check.
pub const STOP_CHECK_INTERNAL_MS: u64 = 2_000;
/// Period of the warmup barrier poll.
pub const THREAD_SYNC_INTERVAL_MS: u64 = 1_000;

/// Worker lifecycle phase; monotonically non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Constructed, not yet running.
    Init,
    /// Connections are being established and held.
    Warmup,
    /// Requests flow.
    Normal,
}

/// The only state shared across worker threads.
#[derive(Debug)]
pub struct Shared {
    stop: Arc<AtomicBool>,
    ready_workers: AtomicU64,
    is_ready: AtomicBool,
    workers: u64,
    samples: Mutex<SampleStats>,
}

impl Shared {
    /// Creates the context for a run of `workers` worker threads.
    pub fn new(workers: u64) -> Self {
        Shared {
            stop: Arc::new(AtomicBool::new(false)),
            ready_workers: AtomicU64::new(0),
            is_ready: AtomicBool::new(false),
            workers,
            samples: Mutex::new(SampleStats::default()),
        }
    }

    /// Flag handle for the signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Asks every worker to wind down at its next stop check.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// A worker reports all of its connections established. Once every
    /// worker has, the barrier opens.
    fn worker_ready(&self) {
        let count = self.ready_workers.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.workers {
            self.is_ready.store(true, Ordering::SeqCst);
        }
    }

    /// Whether every worker has finished establishing its connections.
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    fn record_sample(&self, value: u64) {
        self.samples
            .lock()
            .expect("sample stats mutex poisoned")
            .record(value);
    }

    /// Snapshot of the collected rate samples.
    pub fn samples(&self) -> SampleStats {
        self.samples
            .lock()
            .expect("sample stats mutex poisoned")
            .clone()
    }
}

/// One benchmark worker: reactor, connections, histograms and counters.
pub struct Worker<S: Script> {
    id: u64,
    script: S,
    shared: Arc<Shared>,
    reactor: Reactor,
    connections: Vec<Connection>,
    recv_buf: Box<[u8]>,

    /// Current lifecycle phase.
    pub phase: Phase,
    start: u64,
    stop_at: u64,
    /// First entry into NORMAL; 0 if the worker never left WARMUP.
    pub phase_normal_start: u64,

    /// Responses completed over the whole run.
    pub complete: u64,
    requests: u64,
    /// Bytes read over the whole run.
    pub bytes: u64,
    /// Per-kind error tallies.
    pub errors: Errors,
    /// Latencies against expected start times.
    pub latency: Histogram<u64>,
    /// Latencies against actual send times.
    pub u_latency: Histogram<u64>,
    interval_ms: u64,
    mean_latency_us: u64,

    // resolved run parameters
    addr: SocketAddr,
    local_ip: Option<IpAddr>,
    tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    warmup: bool,
    warmup_timeout_ms: u64,
    pipeline: u64,
    want_response: bool,
    record_all: bool,
}

impl<S: Script> Worker<S> {
    /// Builds a worker with its share of the connection pool and rate.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        cfg: &Config,
        script: S,
        shared: Arc<Shared>,
        addr: SocketAddr,
        tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
        shared_request: Arc<Vec<u8>>,
        stop_at: u64,
    ) -> io::Result<Self> {
        let connections = (cfg.connections / cfg.threads) as usize;
        let throughput = (cfg.rate as f64 / cfg.threads as f64) / 1_000_000.0 / connections as f64;

        let dynamic = !script.is_static();
        let want_response = script.want_response();
        let pipeline = script.verify_request();

        let local_ip = if cfg.local_ips.is_empty() {
            None
        } else {
            Some(cfg.local_ips[id as usize % cfg.local_ips.len()])
        };

        let warmup_timeout_ms = match cfg.warmup_timeout_ms {
            0 => (cfg.connections * 600_000 / 350_000).max(1_000),
            timeout => timeout,
        };

        let connections = (0..connections)
            .map(|i| {
                Connection::new(
                    Token(i),
                    throughput,
                    shared_request.clone(),
                    dynamic,
                    want_response,
                )
            })
            .collect::<Vec<_>>();

        Ok(Worker {
            id,
            script,
            shared,
            reactor: Reactor::new(connections.len())?,
            connections,
            recv_buf: vec![0u8; RECVBUF].into_boxed_slice(),
            phase: Phase::Init,
            start: 0,
            stop_at,
            phase_normal_start: 0,
            complete: 0,
            requests: 0,
            bytes: 0,
            errors: Errors::default(),
            latency: new_histogram(),
            u_latency: new_histogram(),
            interval_ms: 0,
            mean_latency_us: 0,
            addr,
            local_ip,
            tls,
            warmup: cfg.warmup,
            warmup_timeout_ms,
            pipeline,
            want_response,
            record_all: cfg.record_all_responses,
        })
    }

    /// Runs the event loop until the deadline or the stop flag.
    pub fn run(&mut self) {
        for i in 0..self.connections.len() {
            // stagger connects 5 msec apart within the worker
            self.reactor
                .add_timer(5 * i as u64, TimerKind::InitialConnect(i));
        }

        self.reactor
            .add_timer(STOP_CHECK_INTERNAL_MS, TimerKind::CheckStop);

        if self.warmup {
            self.reactor
                .add_timer(self.warmup_timeout_ms, TimerKind::WarmupTimeout);
        } else {
            self.reactor
                .add_timer(CALIBRATE_DELAY_MS, TimerKind::Calibrate);
        }

        self.start = time_us();
        self.phase = if self.warmup {
            Phase::Warmup
        } else {
            Phase::Normal
        };

        let mut ready = Vec::new();
        let mut due = Vec::new();

        while !self.reactor.stopped() {
            ready.clear();
            due.clear();

            if let Err(err) = self.reactor.turn(&mut ready, &mut due) {
                error!(worker = self.id, %err, "event loop poll failed");
                break;
            }

            for event in &ready {
                self.socket_event(event.token, event.readable, event.writable);
            }

            for &kind in &due {
                if let Some(delay_ms) = self.timer_event(kind) {
                    self.reactor.add_timer(delay_ms, kind);
                }
            }
        }
    }

    fn socket_event(&mut self, token: Token, readable: bool, writable: bool) {
        let i = token.0;
        if i >= self.connections.len() {
            return;
        }

        if !self.connections[i].is_connected {
            self.socket_connected(i);
            return;
        }

        if readable {
            self.socket_readable(i);
        }
        // the read path may have torn the connection down
        if writable && self.connections[i].is_connected {
            self.socket_writeable(i);
        }
    }

    fn timer_event(&mut self, kind: TimerKind) -> Option<u64> {
        match kind {
            TimerKind::InitialConnect(i) => {
                self.connections[i].pacer.start(time_us());
                self.connect(i);
                None
            }
            TimerKind::DelaySend(i) => self.delay_send(i),
            TimerKind::CheckStop => self.check_stop(),
            TimerKind::WarmupTimeout => {
                // no-op if the barrier already moved us
                self.phase_move(Phase::Normal);
                None
            }
            TimerKind::WorkerSync => {
                if self.shared.is_ready() {
                    self.phase_move(Phase::Normal);
                }
                if self.phase == Phase::Normal {
                    None
                } else {
                    Some(THREAD_SYNC_INTERVAL_MS)
                }
            }
            TimerKind::Calibrate => self.calibrate(),
            TimerKind::SampleRate => self.sample_rate(),
        }
    }

    fn connect(&mut self, i: usize) {
        let now = time_us();
        let conn = &mut self.connections[i];
        conn.is_connected = false;

        match Transport::connect(self.addr, self.local_ip, self.tls.as_ref()) {
            Ok(transport) => {
                conn.attach(transport, now);
                conn.set_interest(
                    self.reactor.registry(),
                    Some(Interest::READABLE | Interest::WRITABLE),
                )
                .expect("register fresh socket");
            }
            Err(err) => {
                warn!(worker = self.id, connection = i, %err, "unable to open socket");
                self.errors.connect += 1;
            }
        }
    }

    fn reconnect(&mut self, i: usize) {
        self.connections[i].close(self.reactor.registry());
        self.errors.reconnect += 1;
        self.connect(i);
    }

    fn close_all(&mut self) {
        for conn in &mut self.connections {
            conn.close(self.reactor.registry());
        }
    }

    fn socket_connected(&mut self, i: usize) {
        let conn = &mut self.connections[i];
        let Some(transport) = conn.transport_mut() else {
            return;
        };

        match transport.poll_connect() {
            Err(err) => {
                debug!(worker = self.id, connection = i, %err, "connect failed");
                self.errors.connect += 1;
                self.reconnect(i);
            }
            Ok(Progress::Retry(want)) => {
                // re-subscribe to exactly the requested set; a superset here
                // spins the loop for the whole handshake
                conn.apply_retry_hint(self.reactor.registry(), want)
                    .expect("adjust handshake interest");
            }
            Ok(Progress::Ok(_)) => {
                conn.parser.reset();
                conn.written = 0;
                conn.is_connected = true;
                self.errors.established += 1;

                if self.phase == Phase::Normal {
                    conn.set_interest(
                        self.reactor.registry(),
                        Some(Interest::READABLE | Interest::WRITABLE),
                    )
                    .expect("subscribe connected socket");
                    // the readiness edge that completed the connect is spent;
                    // re-arm so the first send is driven immediately
                    conn.rearm(self.reactor.registry())
                        .expect("rearm connected socket");
                } else {
                    // held until the barrier releases the warmup phase
                    conn.set_interest(self.reactor.registry(), None)
                        .expect("hold connected socket");
                }

                if self.warmup && self.errors.established == self.connections.len() as u64 {
                    self.reactor
                        .add_timer(THREAD_SYNC_INTERVAL_MS, TimerKind::WorkerSync);
                    self.shared.worker_ready();
                }
            }
        }
    }

    fn socket_writeable(&mut self, i: usize) {
        let now = time_us();
        let conn = &mut self.connections[i];

        if conn.written == 0 {
            match conn.pacer.next_send(now) {
                Decision::Wait(us) => {
                    // not yet time to send; come back on a timer instead of
                    // spinning on writability
                    conn.remove_interest(self.reactor.registry(), Interest::WRITABLE)
                        .expect("pause writable interest");
                    self.reactor
                        .add_timer(us / 1_000 + 1, TimerKind::DelaySend(i));
                    return;
                }
                Decision::Send { expected_start } => {
                    conn.latest_should_send_time = now;
                    conn.latest_expected_start = expected_start;
                    conn.latest_write = now;
                }
            }

            if conn.dynamic() {
                conn.dynamic_request = self.script.request();
            }

            if !conn.has_pending {
                conn.actual_latency_start = now;
                conn.complete_at_last_batch_start = conn.pacer.complete();
                conn.has_pending = true;
            }
            conn.pending = self.pipeline;
        }

        let length = conn.request().len();

        match conn.write_request() {
            Err(err) => {
                debug!(worker = self.id, connection = i, %err, "write failed");
                self.errors.write += 1;
                self.reconnect(i);
            }
            Ok(Progress::Retry(_)) => {}
            Ok(Progress::Ok(n)) => {
                let conn = &mut self.connections[i];
                conn.written += n;
                if conn.written == length {
                    conn.written = 0;
                    conn.remove_interest(self.reactor.registry(), Interest::WRITABLE)
                        .expect("drop writable after send");
                }
            }
        }
    }

    fn socket_readable(&mut self, i: usize) {
        loop {
            let n = {
                let Some(transport) = self.connections[i].transport_mut() else {
                    return;
                };
                match transport.read(&mut self.recv_buf) {
                    Ok(Progress::Ok(n)) => n,
                    Ok(Progress::Retry(_)) => return,
                    Err(err) => {
                        debug!(worker = self.id, connection = i, %err, "read failed");
                        self.errors.read += 1;
                        self.reconnect(i);
                        return;
                    }
                }
            };

            let conn = &mut self.connections[i];
            if let Err(err) = conn.parser.advance(&self.recv_buf[..n], &mut conn.response) {
                debug!(worker = self.id, connection = i, %err, "parse failed");
                self.errors.read += 1;
                self.reconnect(i);
                return;
            }
            self.bytes += n as u64;

            for done in self.connections[i].response.take_completed() {
                if self.response_complete(i, done).is_break() {
                    return;
                }
            }

            // keep draining while the socket buffer was filled or the
            // transport still holds decrypted bytes
            if n < RECVBUF && self.connections[i].transport_buffered() == 0 {
                return;
            }
        }
    }

    fn response_complete(&mut self, i: usize, done: Completed) -> ControlFlow<()> {
        let now = time_us();

        self.complete += 1;
        self.requests += 1;

        if done.status > 399 {
            self.errors.status += 1;
        }

        if self.want_response {
            self.script.response(done.status, &done.headers, &done.body);
        }

        if now >= self.stop_at {
            self.reactor.stop();
            return ControlFlow::Break(());
        }

        let conn = &mut self.connections[i];
        conn.pacer.record_complete();

        // The expected start time is anchored to the completion count seen
        // when the current batch began. A batch may produce several pipelined
        // responses; anchoring to the live count would gift them time and
        // can produce negative latencies.
        let expected_start = conn.pacer.expected_start_at(conn.complete_at_last_batch_start);
        let corrected = now as i64 - expected_start as i64;

        if corrected < 0 {
            error!(
                worker = self.id,
                connection = i,
                corrected,
                now,
                expected_start,
                complete = conn.pacer.complete(),
                complete_at_last_batch_start = conn.complete_at_last_batch_start,
                latest_should_send_time = conn.latest_should_send_time,
                latest_expected_start = conn.latest_expected_start,
                latest_connect = conn.latest_connect,
                latest_write = conn.latest_write,
                recomputed_expected_start = conn.pacer.expected_start_at(conn.pacer.complete()),
                "corrected latency is negative; batch snapshot is inconsistent"
            );
        }

        conn.latest_should_send_time = 0;
        conn.latest_expected_start = 0;

        conn.pending = conn.pending.saturating_sub(1);
        if conn.pending == 0 {
            conn.has_pending = false;
            conn.add_interest(self.reactor.registry(), Interest::WRITABLE)
                .expect("arm writable after batch");
        }

        // record either every response or only the batch tail
        if self.record_all || !self.connections[i].has_pending {
            if corrected >= 0 {
                self.latency.saturating_record(corrected as u64);
            }
            let actual = now.saturating_sub(self.connections[i].actual_latency_start);
            self.u_latency.saturating_record(actual);
        }

        if !done.keep_alive {
            self.reconnect(i);
            return ControlFlow::Break(());
        }

        ControlFlow::Continue(())
    }

    fn delay_send(&mut self, i: usize) -> Option<u64> {
        let conn = &mut self.connections[i];
        if !conn.is_connected {
            return None;
        }

        match conn.pacer.next_send(time_us()) {
            Decision::Wait(us) => Some(us / 1_000 + 1),
            Decision::Send { .. } => {
                conn.add_interest(self.reactor.registry(), Interest::WRITABLE)
                    .expect("arm writable interest");
                None
            }
        }
    }

    fn check_stop(&mut self) -> Option<u64> {
        if self.shared.stop_requested() || time_us() >= self.stop_at {
            self.close_all();
            self.reactor.stop();
            return None;
        }
        Some(STOP_CHECK_INTERNAL_MS)
    }

    fn phase_move(&mut self, phase: Phase) {
        if self.phase == Phase::Warmup && phase == Phase::Normal {
            let now = time_us();
            info!(
                worker = self.id,
                duration_s = (now - self.start) / 1_000_000,
                "warmup phase ended"
            );

            for conn in &mut self.connections {
                if conn.is_connected {
                    conn.set_interest(
                        self.reactor.registry(),
                        Some(Interest::READABLE | Interest::WRITABLE),
                    )
                    .expect("subscribe after warmup");
                }
            }

            self.reactor
                .add_timer(CALIBRATE_DELAY_MS, TimerKind::Calibrate);
            self.start = now;
            self.phase_normal_start = now;
        }

        self.phase = phase;
    }

    fn calibrate(&mut self) -> Option<u64> {
        let mean = self.latency.mean();
        if mean == 0.0 {
            return Some(CALIBRATE_DELAY_MS);
        }

        let p90_ms = self.latency.value_at_quantile(0.9) as f64 / 1_000.0;
        let interval_ms = (p90_ms * 2.0).max(10.0) as u64;

        self.mean_latency_us = mean as u64;
        self.latency.reset();
        self.u_latency.reset();
        self.start = time_us();
        self.interval_ms = interval_ms;
        self.requests = 0;

        info!(
            worker = self.id,
            mean_latency_ms = self.mean_latency_us as f64 / 1_000.0,
            interval_ms,
            "calibrated rate sampling interval"
        );

        self.reactor.add_timer(interval_ms, TimerKind::SampleRate);
        None
    }

    fn sample_rate(&mut self) -> Option<u64> {
        let now = time_us();
        let elapsed_ms = (now - self.start) / 1_000;

        if elapsed_ms > 0 {
            self.shared.record_sample(self.requests * 1_000 / elapsed_ms);
        }

        self.requests = 0;
        self.start = now;
        Some(self.interval_ms)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{Phase, Shared, Worker};
    use crate::script::{StaticScript, Url};
    use crate::Config;

    fn config(connections: u64) -> Config {
        Config {
            url: "http://127.0.0.1/".to_string(),
            threads: 1,
            connections,
            duration_ms: 1_000,
            timeout_ms: 2_000,
            rate: 100,
            latency: false,
            u_latency: false,
            record_all_responses: true,
            warmup: true,
            warmup_timeout_ms: 0,
            headers: Vec::new(),
            local_ips: Vec::new(),
        }
    }

    fn worker(cfg: &Config) -> Worker<StaticScript> {
        let url = Url::parse(&cfg.url).unwrap();
        let script = StaticScript::new(&url, &cfg.headers);
        Worker::new(
            0,
            cfg,
            script,
            Arc::new(Shared::new(cfg.threads)),
            "127.0.0.1:80".parse().unwrap(),
            None,
            Arc::new(Vec::new()),
            0,
        )
        .unwrap()
    }

    #[test]
    fn warmup_timeout_is_floored_at_one_second() {
        let cfg = config(4);
        assert_eq!(1_000, worker(&cfg).warmup_timeout_ms);
    }

    #[test]
    fn warmup_timeout_scales_with_connection_count() {
        let cfg = config(700);
        assert_eq!(1_200, worker(&cfg).warmup_timeout_ms);
    }

    #[test]
    fn explicit_warmup_timeout_wins() {
        let mut cfg = config(4);
        cfg.warmup_timeout_ms = 200;
        assert_eq!(200, worker(&cfg).warmup_timeout_ms);
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Init < Phase::Warmup);
        assert!(Phase::Warmup < Phase::Normal);
    }

    #[test]
    fn barrier_opens_when_every_worker_reports() {
        let shared = Shared::new(3);
        assert!(!shared.is_ready());
        shared.worker_ready();
        shared.worker_ready();
        assert!(!shared.is_ready());
        shared.worker_ready();
        assert!(shared.is_ready());
    }

    #[test]
    fn stop_flag_round_trips() {
        let shared = Shared::new(1);
        assert!(!shared.stop_requested());
        shared.stop_handle().store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(shared.stop_requested());
    }

    #[test]
    fn samples_are_shared() {
        let shared = Shared::new(1);
        shared.record_sample(100);
        shared.record_sample(200);
        let samples = shared.samples();
        assert_eq!(200, samples.max());
    }
}
