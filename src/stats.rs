//! Run statistics: error counters, rate samples and the end-of-run summary.

use hdrhistogram::Histogram;

/// Highest recordable latency: one day, in microseconds.
pub const MAX_LATENCY_US: u64 = 24 * 60 * 60 * 1_000_000;

/// Creates a latency histogram with the fixed range and precision every
/// worker uses, so merges are bucket-compatible.
pub fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_LATENCY_US, 3).expect("histogram bounds are static")
}

/// Per-kind connection error tallies, plus the informational connection
/// establishment counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Errors {
    /// Failed connection attempts.
    pub connect: u64,
    /// Fatal read or parse failures.
    pub read: u64,
    /// Fatal write failures.
    pub write: u64,
    /// Requests that timed out.
    pub timeout: u64,
    /// Responses with a status of 400 or above.
    pub status: u64,
    /// Successful connection establishments, including re-establishments.
    pub established: u64,
    /// Connections torn down and re-established.
    pub reconnect: u64,
}

impl Errors {
    /// Accumulates another worker's tallies.
    pub fn add(&mut self, other: &Errors) {
        self.connect += other.connect;
        self.read += other.read;
        self.write += other.write;
        self.timeout += other.timeout;
        self.status += other.status;
        self.established += other.established;
        self.reconnect += other.reconnect;
    }

    /// True when any socket-level error occurred.
    pub fn any_socket(&self) -> bool {
        self.connect > 0 || self.read > 0 || self.write > 0 || self.timeout > 0 || self.reconnect > 0
    }
}

/// Requests/sec samples collected across all workers, one per sampling
/// interval per worker, under a single mutex.
#[derive(Debug, Default, Clone)]
pub struct SampleStats {
    samples: Vec<u64>,
}

impl SampleStats {
    /// Appends one requests/sec sample.
    pub fn record(&mut self, value: u64) {
        self.samples.push(value);
    }

    /// True when no samples were collected.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest sample, or 0.
    pub fn max(&self) -> u64 {
        self.samples.iter().copied().max().unwrap_or(0)
    }

    /// Arithmetic mean of the samples.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    /// Sample standard deviation around a precomputed mean.
    pub fn stdev(&self, mean: f64) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| (s as f64 - mean).powi(2))
            .sum();
        (sum / (self.samples.len() - 1) as f64).sqrt()
    }

    /// Percentage of samples within `n` standard deviations of the mean.
    pub fn within_stdev(&self, mean: f64, stdev: f64, n: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let low = mean - n * stdev;
        let high = mean + n * stdev;
        let within = self
            .samples
            .iter()
            .filter(|&&s| (s as f64) >= low && (s as f64) <= high)
            .count();
        within as f64 / self.samples.len() as f64 * 100.0
    }
}

/// Percentage of recorded histogram values within `n` standard deviations of
/// the mean.
pub fn hist_within_stdev(histogram: &Histogram<u64>, n: f64) -> f64 {
    if histogram.is_empty() {
        return 0.0;
    }
    let mean = histogram.mean();
    let stdev = histogram.stdev();
    let low = mean - n * stdev;
    let high = mean + n * stdev;

    let mut within = 0u64;
    for value in histogram.iter_recorded() {
        let v = value.value_iterated_to() as f64;
        if v >= low && v <= high {
            within += value.count_at_value();
        }
    }
    within as f64 / histogram.len() as f64 * 100.0
}

/// Aggregated outcome of a run, after all workers are joined.
#[derive(Debug)]
pub struct Summary {
    /// Total completed responses.
    pub complete: u64,
    /// Total bytes read.
    pub bytes: u64,
    /// Summed per-kind error tallies.
    pub errors: Errors,
    /// Measured runtime in microseconds.
    pub runtime_us: u64,
    /// Latencies against expected start times.
    pub latency: Histogram<u64>,
    /// Latencies against actual send times.
    pub u_latency: Histogram<u64>,
}

impl Summary {
    /// Completed responses per second over the measured runtime.
    pub fn requests_per_second(&self) -> f64 {
        self.complete as f64 / (self.runtime_us as f64 / 1_000_000.0)
    }

    /// Bytes read per second over the measured runtime.
    pub fn bytes_per_second(&self) -> f64 {
        self.bytes as f64 / (self.runtime_us as f64 / 1_000_000.0)
    }
}

/// `12.34us` / `1.23ms` / `4.00s` / `2.50m` / `1.00h`
pub fn format_time_us(us: f64) -> String {
    let (value, unit) = if us < 1_000.0 {
        (us, "us")
    } else if us < 1_000_000.0 {
        (us / 1_000.0, "ms")
    } else if us < 60_000_000.0 {
        (us / 1_000_000.0, "s")
    } else if us < 3_600_000_000.0 {
        (us / 60_000_000.0, "m")
    } else {
        (us / 3_600_000_000.0, "h")
    };
    format!("{value:.2}{unit}")
}

/// Whole-second durations for the run banner: `30s`, `2m`, `1h`.
pub fn format_time_s(s: u64) -> String {
    if s < 60 || s % 60 != 0 {
        format!("{s}s")
    } else if s < 3_600 || s % 3_600 != 0 {
        format!("{}m", s / 60)
    } else {
        format!("{}h", s / 3_600)
    }
}

/// SI units, base 1000: `999.00`, `1.50k`, `2.00M`.
pub fn format_metric(n: f64) -> String {
    let (value, unit) = if n < 1_000.0 {
        (n, "")
    } else if n < 1_000_000.0 {
        (n / 1_000.0, "k")
    } else if n < 1_000_000_000.0 {
        (n / 1_000_000.0, "M")
    } else {
        (n / 1_000_000_000.0, "G")
    };
    format!("{value:.2}{unit}")
}

/// Binary units, base 1024, without the trailing `B`: `512.00`, `1.50K`,
/// `2.00M`.
pub fn format_binary(n: f64) -> String {
    let (value, unit) = if n < 1024.0 {
        (n, "")
    } else if n < 1024.0 * 1024.0 {
        (n / 1024.0, "K")
    } else if n < 1024.0 * 1024.0 * 1024.0 {
        (n / (1024.0 * 1024.0), "M")
    } else {
        (n / (1024.0 * 1024.0 * 1024.0), "G")
    };
    format!("{value:.2}{unit}")
}
