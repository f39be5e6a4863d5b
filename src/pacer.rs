//! Per-connection send scheduler.
//!
//! The primary schedule is anchored to an absolute start time: the n-th
//! request is expected to start at `start + n/throughput` regardless of when
//! earlier requests actually went out. A connection that falls behind paces
//! its recovery at double throughput from the moment it fell behind, which
//! bounds burst size without detaching the primary schedule — a stalled
//! server still gets billed for the full stall.

/// Verdict for a send opportunity at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Start a request now; `expected_start` is the primary-schedule start
    /// time it is being measured against.
    Send { expected_start: u64 },
    /// Too early; check again after this many microseconds.
    Wait(u64),
}

/// Schedule state for one connection.
#[derive(Debug)]
pub struct Pacer {
    /// Target requests per microsecond.
    throughput: f64,
    /// Recovery rate while behind schedule.
    catch_up_throughput: f64,
    start_time: u64,
    complete: u64,
    caught_up: bool,
    catch_up_start_time: u64,
    complete_at_catch_up_start: u64,
}

impl Pacer {
    /// Creates a pacer targeting `throughput` requests per microsecond.
    pub fn new(throughput: f64) -> Self {
        Pacer {
            throughput,
            catch_up_throughput: throughput * 2.0,
            start_time: 0,
            complete: 0,
            caught_up: true,
            catch_up_start_time: 0,
            complete_at_catch_up_start: 0,
        }
    }

    /// Anchors the schedule. Called once, when the connection is first armed.
    pub fn start(&mut self, now: u64) {
        self.start_time = now;
    }

    /// Completed responses seen so far.
    pub fn complete(&self) -> u64 {
        self.complete
    }

    /// Counts a completed response against the schedule.
    pub fn record_complete(&mut self) {
        self.complete += 1;
    }

    /// Absolute expected start time of the request following `complete`
    /// completions, on the primary schedule.
    pub fn expected_start_at(&self, complete: u64) -> u64 {
        self.start_time + (complete as f64 / self.throughput) as u64
    }

    /// Decides whether a new request may start at `now`.
    pub fn next_send(&mut self, now: u64) -> Decision {
        let next_start = self.expected_start_at(self.complete);

        if next_start > now {
            // on pace
            self.caught_up = true;
            return Decision::Wait(next_start - now);
        }

        if self.caught_up {
            // first fall-behind since we were last caught up
            self.caught_up = false;
            self.catch_up_start_time = now;
            self.complete_at_catch_up_start = self.complete;
        }

        let complete_since = self.complete - self.complete_at_catch_up_start;
        let catch_up_next =
            self.catch_up_start_time + (complete_since as f64 / self.catch_up_throughput) as u64;

        if catch_up_next > now {
            // not yet time to send, even at catch-up throughput
            Decision::Wait(catch_up_next - now)
        } else {
            Decision::Send {
                expected_start: next_start,
            }
        }
    }
}
