//! Single-threaded readiness and time-event dispatcher.
//!
//! One reactor per worker: a mio `Poll` for file events plus a slab-backed
//! time-event table ordered by a deadline heap. The poll timeout is the
//! nearest timer deadline, rounded up so timers never fire early. There are
//! no priorities; every ready file event is dispatched before the loop
//! sleeps again.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token};
use slab::Slab;

use crate::clock::time_us;

/// Identity of a time event, dispatched by the worker loop.
///
/// A handler returning `Some(delay_ms)` re-arms the timer; `None` makes the
/// firing one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Staggered first connect of connection `i`.
    InitialConnect(usize),
    /// Connection `i` is paced out; re-check its send schedule.
    DelaySend(usize),
    /// Periodic stop-flag and deadline check.
    CheckStop,
    /// Warmup phase gave up waiting for the other workers.
    WarmupTimeout,
    /// Poll the cross-worker barrier.
    WorkerSync,
    /// One-shot sampling-interval calibration.
    Calibrate,
    /// Periodic requests/sec sample.
    SampleRate,
}

/// A file-descriptor readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    /// Token the source was registered under.
    pub token: Token,
    /// The source became readable.
    pub readable: bool,
    /// The source became writable.
    pub writable: bool,
}

struct TimeEvent {
    deadline_us: u64,
    kind: TimerKind,
}

/// Per-worker event loop.
pub struct Reactor {
    poll: Poll,
    events: Events,
    timers: Slab<TimeEvent>,
    deadlines: BinaryHeap<Reverse<(u64, usize)>>,
    stopped: bool,
}

impl Reactor {
    /// Creates a reactor sized for `connections` sockets.
    pub fn new(connections: usize) -> io::Result<Self> {
        let capacity = 10 + connections * 3;

        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            timers: Slab::with_capacity(capacity),
            deadlines: BinaryHeap::with_capacity(capacity),
            stopped: false,
        })
    }

    /// Registry for file-event (de)registration.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Arms a timer `delay_ms` from now.
    pub fn add_timer(&mut self, delay_ms: u64, kind: TimerKind) {
        let deadline_us = time_us() + delay_ms * 1000;
        let key = self.timers.insert(TimeEvent { deadline_us, kind });
        self.deadlines.push(Reverse((deadline_us, key)));
    }

    /// Makes the next loop iteration exit.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Whether [`Reactor::stop`] has been called.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Waits for the next batch of events, filling `ready` with file events
    /// and `due` with expired timers.
    pub fn turn(&mut self, ready: &mut Vec<Ready>, due: &mut Vec<TimerKind>) -> io::Result<()> {
        let timeout = self.deadlines.peek().map(|&Reverse((deadline, _))| {
            // round up: a timer must never be dispatched early
            let wait_us = deadline.saturating_sub(time_us());
            Duration::from_millis(wait_us.div_ceil(1000))
        });

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            ready.push(Ready {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }

        let now = time_us();
        while let Some(&Reverse((deadline, key))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            due.push(self.timers.remove(key).kind);
        }

        Ok(())
    }
}
