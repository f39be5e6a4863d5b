//! Command-line interface.
//!
//! Mirrors the classic load-generator option set. Numeric arguments accept SI
//! suffixes (`1k`, `2M`, `3G`) and time arguments accept a unit (`250ms`,
//! `2s`, `5m`, `1h`); a bare time is seconds.

use std::net::IpAddr;

use clap::Parser;

use crate::error::Error;
use crate::Config;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pisk",
    about = "Coordinated-omission-free HTTP/1.1 load generation"
)]
pub struct Args {
    /// Connections to keep open
    #[arg(short, long, value_parser = scan_metric, default_value = "10")]
    pub connections: u64,

    /// Number of worker threads to use
    #[arg(short, long, value_parser = scan_metric, default_value = "2")]
    pub threads: u64,

    /// Duration of test
    #[arg(short, long, value_parser = scan_time, default_value = "10s")]
    pub duration: u64,

    /// Load script file
    #[arg(short, long)]
    pub script: Option<String>,

    /// Add header to request
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Socket/request timeout
    #[arg(short = 'T', long, value_parser = scan_time, default_value = "2s")]
    pub timeout: u64,

    /// Work rate (throughput) in total requests/sec [required]
    #[arg(short = 'R', long, value_parser = scan_metric)]
    pub rate: Option<u64>,

    /// Print latency statistics
    #[arg(short = 'L', long)]
    pub latency: bool,

    /// Also print uncorrected latency statistics
    #[arg(short = 'U', long = "u_latency")]
    pub u_latency: bool,

    /// Measure latency of whole batches of pipelined ops (as opposed to each op)
    #[arg(short = 'B', long = "batch_latency")]
    pub batch_latency: bool,

    /// Establish connections before any requests are sent
    #[arg(short = 'W', long)]
    pub warmup: bool,

    /// Give up waiting for other workers' warmup after this long
    #[arg(long = "warmup_timeout", value_parser = scan_time)]
    pub warmup_timeout: Option<u64>,

    /// Bind to the specified local IP(s); comma separated list
    #[arg(short = 'i', long = "local_ip", value_delimiter = ',')]
    pub local_ip: Vec<String>,

    /// Print version details
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Target URL
    pub url: Option<String>,
}

impl Args {
    /// Validates the parsed flags into a run configuration.
    pub fn into_config(self) -> Result<Config, Error> {
        let Some(url) = self.url else {
            return Err(Error::Usage("a target URL is required".to_string()));
        };

        if self.script.is_some() {
            return Err(Error::Usage(
                "script support is not built in; only the static request generator is available"
                    .to_string(),
            ));
        }

        if self.threads == 0 || self.duration == 0 {
            return Err(Error::Usage(
                "threads and duration must be non-zero".to_string(),
            ));
        }

        if self.connections == 0 || self.connections < self.threads {
            return Err(Error::Usage(
                "number of connections must be >= threads".to_string(),
            ));
        }

        let rate = match self.rate {
            Some(rate) if rate > 0 => rate,
            _ => {
                return Err(Error::Usage(
                    "throughput MUST be specified with the --rate or -R option".to_string(),
                ))
            }
        };

        let mut local_ips = Vec::with_capacity(self.local_ip.len());
        for raw in &self.local_ip {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let ip = raw
                .parse::<IpAddr>()
                .map_err(|_| Error::Usage(format!("invalid local IP address: {raw}")))?;
            local_ips.push(ip);
        }

        Ok(Config {
            url,
            threads: self.threads,
            connections: self.connections,
            duration_ms: self.duration,
            timeout_ms: self.timeout,
            rate,
            latency: self.latency || self.u_latency,
            u_latency: self.u_latency,
            record_all_responses: !self.batch_latency,
            warmup: self.warmup,
            warmup_timeout_ms: self.warmup_timeout.unwrap_or(0),
            headers: self.headers,
            local_ips,
        })
    }
}

/// Parses a count with an optional SI suffix: `250`, `1k`, `2M`, `3G`.
pub fn scan_metric(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let (digits, scale) = match raw.as_bytes().last() {
        Some(b'k') => (&raw[..raw.len() - 1], 1_000),
        Some(b'M') => (&raw[..raw.len() - 1], 1_000_000),
        Some(b'G') => (&raw[..raw.len() - 1], 1_000_000_000),
        _ => (raw, 1),
    };

    digits
        .parse::<u64>()
        .map(|n| n * scale)
        .map_err(|_| format!("invalid numeric argument: {raw}"))
}

/// Parses a duration into milliseconds: `250ms`, `2s`, `5m`, `1h`, `1d`.
/// A bare number is seconds.
pub fn scan_time(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let error = || format!("invalid time argument: {raw}");

    let (digits, scale) = if let Some(digits) = raw.strip_suffix("ms") {
        (digits, 1)
    } else if let Some(digits) = raw.strip_suffix('s') {
        (digits, 1_000)
    } else if let Some(digits) = raw.strip_suffix('m') {
        (digits, 60 * 1_000)
    } else if let Some(digits) = raw.strip_suffix('h') {
        (digits, 60 * 60 * 1_000)
    } else if let Some(digits) = raw.strip_suffix('d') {
        (digits, 24 * 60 * 60 * 1_000)
    } else {
        (raw, 1_000)
    };

    digits.parse::<u64>().map(|n| n * scale).map_err(|_| error())
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::{scan_metric, scan_time, Args};

    #[test]
    fn scan_metric_accepts_si_suffixes() {
        assert_eq!(Ok(250), scan_metric("250"));
        assert_eq!(Ok(1_000), scan_metric("1k"));
        assert_eq!(Ok(2_000_000), scan_metric("2M"));
        assert_eq!(Ok(3_000_000_000), scan_metric("3G"));
        assert!(scan_metric("plenty").is_err());
        assert!(scan_metric("1x").is_err());
    }

    #[test]
    fn scan_time_accepts_units() {
        assert_eq!(Ok(250), scan_time("250ms"));
        assert_eq!(Ok(2_000), scan_time("2s"));
        assert_eq!(Ok(2_000), scan_time("2"));
        assert_eq!(Ok(300_000), scan_time("5m"));
        assert_eq!(Ok(3_600_000), scan_time("1h"));
        assert!(scan_time("soon").is_err());
    }

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn rate_is_required() {
        let args = parse(&["pisk", "http://localhost/"]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn url_is_required() {
        let args = parse(&["pisk", "-R", "100"]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn long_flags_use_underscores() {
        let args = parse(&[
            "pisk",
            "--rate",
            "100",
            "--u_latency",
            "--batch_latency",
            "--warmup",
            "--warmup_timeout",
            "200ms",
            "--local_ip",
            "127.0.0.1",
            "http://localhost/",
        ]);
        let cfg = args.into_config().unwrap();
        assert!(cfg.u_latency);
        assert!(!cfg.record_all_responses);
        assert!(cfg.warmup);
        assert_eq!(200, cfg.warmup_timeout_ms);
    }

    #[test]
    fn connections_must_cover_threads() {
        let args = parse(&[
            "pisk", "-t", "4", "-c", "2", "-R", "100", "http://localhost/",
        ]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn u_latency_implies_latency() {
        let args = parse(&["pisk", "-R", "100", "-U", "http://localhost/"]);
        let cfg = args.into_config().unwrap();
        assert!(cfg.latency);
        assert!(cfg.u_latency);
    }

    #[test]
    fn batch_latency_disables_per_response_recording() {
        let args = parse(&["pisk", "-R", "100", "-B", "http://localhost/"]);
        let cfg = args.into_config().unwrap();
        assert!(!cfg.record_all_responses);
    }

    #[test]
    fn full_invocation_round_trips() {
        let args = parse(&[
            "pisk",
            "-t",
            "2",
            "-c",
            "100",
            "-d",
            "30s",
            "-R",
            "10k",
            "-H",
            "X-Bench: 1",
            "-i",
            "127.0.0.1,127.0.0.2",
            "http://localhost:8080/index.html",
        ]);
        let cfg = args.into_config().unwrap();
        assert_eq!(2, cfg.threads);
        assert_eq!(100, cfg.connections);
        assert_eq!(30_000, cfg.duration_ms);
        assert_eq!(10_000, cfg.rate);
        assert_eq!(vec!["X-Bench: 1"], cfg.headers);
        assert_eq!(2, cfg.local_ips.len());
    }

    #[test]
    fn script_flag_is_rejected() {
        let args = parse(&["pisk", "-R", "100", "-s", "bench.lua", "http://localhost/"]);
        assert!(args.into_config().is_err());
    }
}
