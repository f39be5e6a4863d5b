//! Per-connection request lifecycle state.
//!
//! A connection owns its transport, parser and pacing state. It does not
//! drive itself: the worker dispatches readiness and timer events into it
//! and decides what happens next. The one policy a connection does enforce
//! is its readiness subscription — the interest set registered with the
//! poller always matches exactly what the current state needs, so a TLS
//! handshake retry can never leave a spurious subscription spinning the
//! loop.

use std::io;
use std::sync::Arc;

use mio::{Interest, Registry, Token};

use crate::net::{Progress, Transport, Want};
use crate::pacer::Pacer;
use crate::parser::h1::ResponseParser;
use crate::parser::ResponseSink;

/// Socket read size; a full read means more data may be waiting.
pub const RECVBUF: usize = 8192;

/// Header capture cursor, toggled as field/value fragments arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Field,
    Value,
}

/// A finished response lifted out of the parser, with captured headers and
/// body when response delivery is enabled.
#[derive(Debug)]
pub struct Completed {
    /// HTTP status code.
    pub status: u16,
    /// Whether the connection may be reused for another request.
    pub keep_alive: bool,
    /// Captured header pairs; empty when capture is off.
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Captured body; empty when capture is off.
    pub body: Vec<u8>,
}

/// Parse-event accumulator for one connection.
#[derive(Debug)]
pub struct ResponseState {
    capture: bool,
    state: HeaderState,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    body: Vec<u8>,
    completed: Vec<Completed>,
}

impl ResponseState {
    fn new(capture: bool) -> Self {
        ResponseState {
            capture,
            state: HeaderState::Value,
            headers: Vec::new(),
            body: Vec::new(),
            completed: Vec::new(),
        }
    }

    /// Takes the responses completed by the last parser advance.
    pub fn take_completed(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.completed)
    }
}

impl ResponseSink for ResponseState {
    fn on_header_field(&mut self, data: &[u8]) {
        if !self.capture {
            return;
        }
        // a field fragment after a value closes the previous header
        if self.state == HeaderState::Value {
            self.state = HeaderState::Field;
            self.headers.push((Vec::new(), Vec::new()));
        }
        if let Some(last) = self.headers.last_mut() {
            last.0.extend_from_slice(data);
        }
    }

    fn on_header_value(&mut self, data: &[u8]) {
        if !self.capture {
            return;
        }
        self.state = HeaderState::Value;
        if let Some(last) = self.headers.last_mut() {
            last.1.extend_from_slice(data);
        }
    }

    fn on_body(&mut self, data: &[u8]) {
        if self.capture {
            self.body.extend_from_slice(data);
        }
    }

    fn on_message_complete(&mut self, status: u16, keep_alive: bool) {
        self.completed.push(Completed {
            status,
            keep_alive,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        });
        self.state = HeaderState::Value;
    }
}

/// One long-lived benchmark connection.
#[derive(Debug)]
pub struct Connection {
    token: Token,
    transport: Option<Transport>,
    /// Response parser, re-initialized on every (re)connect.
    pub parser: ResponseParser,
    /// Parse-event accumulator the parser pushes into.
    pub response: ResponseState,
    /// Send schedule.
    pub pacer: Pacer,
    /// Shared request payload, used while the script is static.
    shared_request: Arc<Vec<u8>>,
    /// Per-connection payload, refreshed on every send of a dynamic script.
    pub dynamic_request: Vec<u8>,
    dynamic: bool,
    /// Bytes of the current request already written; 0 when no send is in
    /// progress.
    pub written: usize,
    /// In-flight requests of the current pipelined batch.
    pub pending: u64,
    /// A batch is outstanding; cleared when `pending` drains to zero.
    pub has_pending: bool,
    /// Completion count snapshotted when the current batch began.
    pub complete_at_last_batch_start: u64,
    /// When the current batch's first byte actually went out.
    pub actual_latency_start: u64,
    /// The transport finished connecting (and handshaking).
    pub is_connected: bool,
    interest: Option<Interest>,
    /// Diagnostics for the negative-latency report.
    pub latest_should_send_time: u64,
    /// Diagnostics for the negative-latency report.
    pub latest_expected_start: u64,
    /// Diagnostics for the negative-latency report.
    pub latest_connect: u64,
    /// Diagnostics for the negative-latency report.
    pub latest_write: u64,
}

impl Connection {
    /// Creates a connection slot; no socket exists until the first connect.
    pub fn new(
        token: Token,
        throughput: f64,
        shared_request: Arc<Vec<u8>>,
        dynamic: bool,
        capture_responses: bool,
    ) -> Self {
        Connection {
            token,
            transport: None,
            parser: ResponseParser::new(),
            response: ResponseState::new(capture_responses),
            pacer: Pacer::new(throughput),
            shared_request,
            dynamic_request: Vec::new(),
            dynamic,
            written: 0,
            pending: 0,
            has_pending: false,
            complete_at_last_batch_start: 0,
            actual_latency_start: 0,
            is_connected: false,
            interest: None,
            latest_should_send_time: 0,
            latest_expected_start: 0,
            latest_connect: 0,
            latest_write: 0,
        }
    }

    /// The request payload for the send in progress.
    pub fn request(&self) -> &[u8] {
        if self.dynamic {
            &self.dynamic_request
        } else {
            &self.shared_request
        }
    }

    /// Writes the unsent tail of the current request payload.
    pub fn write_request(&mut self) -> io::Result<Progress> {
        let request: &[u8] = if self.dynamic {
            &self.dynamic_request
        } else {
            &self.shared_request
        };

        match self.transport.as_mut() {
            Some(transport) => transport.write(&request[self.written..]),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Whether request bytes are regenerated on every send.
    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    /// The transport, if a socket is open.
    pub fn transport_mut(&mut self) -> Option<&mut Transport> {
        self.transport.as_mut()
    }

    /// Decrypted-but-unread bytes inside the transport.
    pub fn transport_buffered(&self) -> usize {
        self.transport.as_ref().map_or(0, Transport::buffered)
    }

    /// Installs a freshly created transport; the socket is not yet
    /// registered with the poller.
    pub fn attach(&mut self, transport: Transport, now: u64) {
        self.transport = Some(transport);
        self.interest = None;
        self.is_connected = false;
        self.latest_connect = now;
    }

    /// Deregisters and drops the socket.
    pub fn close(&mut self, registry: &Registry) {
        if let (Some(transport), Some(_)) = (self.transport.as_mut(), self.interest) {
            let _ = registry.deregister(transport.socket_mut());
        }
        self.interest = None;
        self.transport = None;
        self.is_connected = false;
    }

    /// Re-subscribes to exactly `desired` — no supersets. Idempotent on an
    /// unchanged set.
    pub fn set_interest(
        &mut self,
        registry: &Registry,
        desired: Option<Interest>,
    ) -> io::Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };

        match (self.interest, desired) {
            (None, Some(want)) => registry.register(transport.socket_mut(), self.token, want)?,
            (Some(_), None) => registry.deregister(transport.socket_mut())?,
            (Some(have), Some(want)) if have != want => {
                registry.reregister(transport.socket_mut(), self.token, want)?
            }
            _ => {}
        }

        self.interest = desired;
        Ok(())
    }

    /// Re-registers the current subscription unchanged. With edge-triggered
    /// polling this makes an already-ready state notify again, which is
    /// needed when a state change (connect completion) consumes an edge
    /// without altering the interest set.
    pub fn rearm(&mut self, registry: &Registry) -> io::Result<()> {
        if let Some(interest) = self.interest {
            if let Some(transport) = self.transport.as_mut() {
                registry.reregister(transport.socket_mut(), self.token, interest)?;
            }
        }
        Ok(())
    }

    /// Adds `add` to the subscription.
    pub fn add_interest(&mut self, registry: &Registry, add: Interest) -> io::Result<()> {
        let desired = match self.interest {
            Some(have) => Some(have | add),
            None => Some(add),
        };
        self.set_interest(registry, desired)
    }

    /// Drops `remove` from the subscription, deregistering when nothing is
    /// left.
    pub fn remove_interest(&mut self, registry: &Registry, remove: Interest) -> io::Result<()> {
        let desired = self.interest.and_then(|have| have.remove(remove));
        self.set_interest(registry, desired)
    }

    /// The readiness set a connect retry asked for.
    pub fn apply_retry_hint(&mut self, registry: &Registry, want: Want) -> io::Result<()> {
        let desired = match (want.read, want.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        self.set_interest(registry, desired)
    }
}

#[cfg(test)]
mod test {
    use super::{Completed, ResponseState};
    use crate::parser::ResponseSink;

    fn feed(sink: &mut ResponseState, headers: &[(&[u8], &[u8])], body: &[u8], status: u16) {
        for (field, value) in headers {
            sink.on_header_field(field);
            sink.on_header_value(value);
        }
        if !body.is_empty() {
            sink.on_body(body);
        }
        sink.on_message_complete(status, true);
    }

    #[test]
    fn capture_collects_headers_and_body_per_message() {
        let mut sink = ResponseState::new(true);
        feed(
            &mut sink,
            &[(b"a" as &[u8], b"1" as &[u8]), (b"b", b"2")],
            b"body",
            200,
        );
        feed(&mut sink, &[(b"c" as &[u8], b"3" as &[u8])], b"", 204);

        let completed = sink.take_completed();
        assert_eq!(2, completed.len());
        assert_eq!(2, completed[0].headers.len());
        assert_eq!(b"body", &completed[0].body[..]);
        assert_eq!(1, completed[1].headers.len());
        assert!(completed[1].body.is_empty());
    }

    #[test]
    fn capture_joins_fragmented_fields_and_values() {
        let mut sink = ResponseState::new(true);
        sink.on_header_field(b"Con");
        sink.on_header_field(b"tent");
        sink.on_header_value(b"va");
        sink.on_header_value(b"lue");
        sink.on_message_complete(200, true);

        let completed = sink.take_completed();
        assert_eq!(b"Content", &completed[0].headers[0].0[..]);
        assert_eq!(b"value", &completed[0].headers[0].1[..]);
    }

    #[test]
    fn capture_disabled_records_only_completions() {
        let mut sink = ResponseState::new(false);
        feed(&mut sink, &[(b"a" as &[u8], b"1" as &[u8])], b"body", 500);

        let completed = sink.take_completed();
        let Completed {
            status,
            keep_alive,
            headers,
            body,
        } = &completed[0];
        assert_eq!(500, *status);
        assert!(*keep_alive);
        assert!(headers.is_empty());
        assert!(body.is_empty());
    }
}
