//! Benchmark binary: parse flags, spawn workers, print the report.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use hdrhistogram::Histogram;
use tracing_subscriber::EnvFilter;

use pisk::args::Args;
use pisk::error::Error;
use pisk::script::{Script, StaticScript};
use pisk::stats::{
    format_binary, format_metric, format_time_s, format_time_us, hist_within_stdev, SampleStats,
    Summary,
};
use pisk::worker::Shared;
use pisk::Config;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // a peer close during write must surface as an error return, not kill us
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    if args.version {
        println!("pisk {}", env!("CARGO_PKG_VERSION"));
        if args.url.is_none() {
            return ExitCode::SUCCESS;
        }
    }

    let cfg = match args.into_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    match bench(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn bench(cfg: &Config) -> Result<(), Error> {
    let url = pisk::script::Url::parse(&cfg.url)?;
    let mut script = StaticScript::new(&url, &cfg.headers);

    let shared = Arc::new(Shared::new(cfg.threads));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shared.stop_handle())
        .expect("register SIGINT");

    println!(
        "Running {} test @ {}",
        format_time_s(cfg.duration_ms / 1_000),
        cfg.url
    );
    println!(
        "  {} threads and {} connections",
        cfg.threads, cfg.connections
    );

    let summary = pisk::run(cfg, script.clone(), shared.clone())?;
    let samples = shared.samples();

    print_report(cfg, &summary, &samples);

    script.summary(summary.runtime_us, summary.complete, summary.bytes);
    script.errors(&summary.errors);
    script.done();

    Ok(())
}

fn print_report(cfg: &Config, summary: &Summary, samples: &SampleStats) {
    println!(
        "  Thread Stats{:>6}{:>11}{:>8}{:>12}",
        "Avg", "Stdev", "Max", "+/- Stdev"
    );
    print_latency_stats(&summary.latency);
    print_sample_stats(samples);

    if cfg.latency {
        print_percentiles(&summary.latency, "Recorded Latency");
        println!("----------------------------------------------------------");
    }

    if cfg.u_latency {
        println!();
        print_percentiles(
            &summary.u_latency,
            "Uncorrected Latency (measured without taking delayed starts into account)",
        );
        println!("----------------------------------------------------------");
    }

    println!(
        "  {} requests in {}, {}B read",
        summary.complete,
        format_time_us(summary.runtime_us as f64),
        format_binary(summary.bytes as f64)
    );

    let errors = &summary.errors;
    if errors.any_socket() {
        println!(
            "  Socket errors: connect {}, read {}, write {}, timeout {}, reconnect {}",
            errors.connect, errors.read, errors.write, errors.timeout, errors.reconnect
        );
    }
    if errors.status > 0 {
        println!("  Non-2xx or 3xx responses: {}", errors.status);
    }

    println!("Established connections: {}", errors.established);
    println!("Requests/sec: {:9.2}", summary.requests_per_second());
    println!("Transfer/sec: {:>10}B", format_binary(summary.bytes_per_second()));
}

fn print_latency_stats(latency: &Histogram<u64>) {
    print!("    {:<10}", "Latency");
    print_units(latency.mean(), format_time_us, 8);
    print_units(latency.stdev(), format_time_us, 10);
    print_units(latency.max() as f64, format_time_us, 9);
    println!("{:7.2}%", hist_within_stdev(latency, 1.0));
}

fn print_sample_stats(samples: &SampleStats) {
    let mean = samples.mean();
    let stdev = samples.stdev(mean);

    print!("    {:<10}", "Req/Sec");
    print_units(mean, format_metric, 8);
    print_units(stdev, format_metric, 10);
    print_units(samples.max() as f64, format_metric, 9);
    println!("{:7.2}%", samples.within_stdev(mean, stdev, 1.0));
}

fn print_units(n: f64, fmt: fn(f64) -> String, width: usize) {
    let msg = fmt(n);
    let bytes = msg.as_bytes();

    // trailing unit letters eat into the two-column gap
    let mut pad = 2usize;
    if bytes.last().is_some_and(u8::is_ascii_alphabetic) {
        pad -= 1;
    }
    if bytes.len() >= 2 && bytes[bytes.len() - 2].is_ascii_alphabetic() {
        pad = pad.saturating_sub(1);
    }

    let width = width - pad;
    print!("{msg:>width$.width$}{:.pad$}", "  ");
}

fn print_percentiles(histogram: &Histogram<u64>, description: &str) {
    println!("  Latency Distribution (HdrHistogram - {description})");
    for percentile in [50.0, 75.0, 90.0, 99.0, 99.9, 99.99, 99.999, 100.0] {
        let value = histogram.value_at_percentile(percentile);
        print!("{percentile:7.3}%");
        print_units(value as f64, format_time_us, 10);
        println!();
    }

    println!("\n  Detailed Percentile spectrum:");
    println!(
        "{:>12} {:>14} {:>10} {:>14}",
        "Value", "Percentile", "TotalCount", "1/(1-Percentile)"
    );

    let mut total = 0u64;
    for step in histogram.iter_quantiles(5) {
        total += step.count_since_last_iteration();
        let quantile = step.quantile_iterated_to();
        let value_ms = step.value_iterated_to() as f64 / 1_000.0;

        if quantile < 1.0 {
            println!(
                "{value_ms:>12.3} {quantile:>14.6} {total:>10} {:>14.2}",
                1.0 / (1.0 - quantile)
            );
        } else {
            println!("{value_ms:>12.3} {quantile:>14.6} {total:>10} {:>14}", "inf");
        }
    }
    println!(
        "#[Mean = {:.3}, StdDeviation = {:.3}]",
        histogram.mean() / 1_000.0,
        histogram.stdev() / 1_000.0
    );
}
