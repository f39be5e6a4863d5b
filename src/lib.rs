// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coordinated-omission-free HTTP/1.1 load generation.
//!
//! A fixed pool of long-lived connections is spread across worker threads,
//! each running a single-threaded event loop. Requests are dispatched against
//! an absolute arrival schedule and every response's latency is measured from
//! its *expected* start time, so a stalled server cannot hide its stall by
//! back-pressuring the client. Results are recorded into per-worker HDR
//! histograms and merged bucketwise at the end of the run.

#![warn(
    missing_docs,
    rust_2018_idioms,
    unused_imports,
    // dead_code
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

pub mod args;
pub mod clock;
pub mod connection;
pub mod error;
pub mod event;
pub mod net;
pub mod pacer;
pub mod parser;
pub mod script;
pub mod stats;
pub mod worker;

use std::net::IpAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;

use crate::clock::time_us;
use crate::error::Error;
use crate::script::Script;
use crate::stats::{new_histogram, Errors, Summary};
use crate::worker::{Shared, Worker};

/// Validated run configuration, shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target URL; an `https` scheme enables TLS.
    pub url: String,
    /// Worker thread count.
    pub threads: u64,
    /// Total connections across all workers.
    pub connections: u64,
    /// Total run time in milliseconds.
    pub duration_ms: u64,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Total requests per second across all workers.
    pub rate: u64,
    /// Print the corrected percentile spectrum at the end.
    pub latency: bool,
    /// Also print the uncorrected spectrum.
    pub u_latency: bool,
    /// Record every response rather than only the last of each pipelined
    /// batch.
    pub record_all_responses: bool,
    /// Hold connections until every worker has established all of its own.
    pub warmup: bool,
    /// Warmup wait bound in milliseconds; 0 derives a bound from the
    /// connection count.
    pub warmup_timeout_ms: u64,
    /// Extra request header lines.
    pub headers: Vec<String>,
    /// Local source addresses; worker `i` binds to `local_ips[i % len]`.
    pub local_ips: Vec<IpAddr>,
}

/// Spawns the workers, runs the benchmark to completion and merges their
/// results.
///
/// The `shared` context carries the stop flag (hook it to a signal handler
/// to make interruption work) and collects rate samples; `script` is cloned
/// into every worker.
pub fn run<S>(cfg: &Config, script: S, shared: Arc<Shared>) -> Result<Summary, Error>
where
    S: Script + Clone + Send + 'static,
{
    let url = script.parse_url(&cfg.url)?;
    let addr = script
        .resolve(&url.host, url.port)
        .map_err(|source| Error::Resolve {
            host: url.host.clone(),
            port: url.port,
            source,
        })?;

    let tls = if url.scheme == "https" {
        let name = ServerName::try_from(url.host.clone())
            .map_err(|_| Error::InvalidUrl(cfg.url.clone()))?;
        Some((net::client_config(), name))
    } else {
        None
    };

    let shared_request = Arc::new({
        let mut script = script.clone();
        script.request()
    });

    let start = time_us();
    let stop_at = start + cfg.duration_ms * 1_000;

    let mut handles = Vec::with_capacity(cfg.threads as usize);
    for id in 0..cfg.threads {
        let mut worker = Worker::new(
            id,
            cfg,
            script.clone(),
            shared.clone(),
            addr,
            tls.clone(),
            shared_request.clone(),
            stop_at,
        )
        .map_err(|source| Error::Spawn { index: id, source })?;

        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                worker.run();
                worker
            })
            .map_err(|source| Error::Spawn { index: id, source })?;

        handles.push(handle);
    }

    let workers: Vec<Worker<S>> = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread panicked"))
        .collect();

    // With warmup enabled, runtime is measured from the first transition
    // into NORMAL.
    let phase_normal_start = workers
        .iter()
        .map(|worker| worker.phase_normal_start)
        .filter(|&at| at != 0)
        .min();
    let start = phase_normal_start.unwrap_or(start);
    let runtime_us = time_us() - start;

    let mut summary = Summary {
        complete: 0,
        bytes: 0,
        errors: Errors::default(),
        runtime_us,
        latency: new_histogram(),
        u_latency: new_histogram(),
    };

    for worker in &workers {
        summary.complete += worker.complete;
        summary.bytes += worker.bytes;
        summary.errors.add(&worker.errors);
        summary
            .latency
            .add(&worker.latency)
            .expect("histogram bounds are identical");
        summary
            .u_latency
            .add(&worker.u_latency)
            .expect("histogram bounds are identical");
    }

    Ok(summary)
}
