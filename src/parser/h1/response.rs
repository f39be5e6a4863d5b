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

//! HTTP/1.1 Response
//! [IETF RFC 9112 Section 4](https://www.rfc-editor.org/rfc/rfc9112#section-4)

use crate::parser::{HttpVersion, ParseError, ResponseSink};

/// Parser phase within the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Header,
    Body,
    BodyUntilClose,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    Trailer,
}

/// Incremental HTTP/1.x response parser.
///
/// Feed arbitrary byte slices via [`ResponseParser::advance`]; events are
/// pushed into a [`ResponseSink`]. Multiple pipelined responses in one slice
/// are handled, and a message may be split across any number of slices. After
/// each complete message the parser resets itself for the next one.
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    line: Vec<u8>,
    version: HttpVersion,
    status: u16,
    content_length: Option<u64>,
    chunked: bool,
    connection_close: bool,
    connection_keep_alive: bool,
    remaining: u64,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// Creates a parser positioned at the start of a status line.
    pub fn new() -> Self {
        ResponseParser {
            state: State::StatusLine,
            line: Vec::new(),
            version: HttpVersion::H1_1,
            status: 0,
            content_length: None,
            chunked: false,
            connection_close: false,
            connection_keep_alive: false,
            remaining: 0,
        }
    }

    /// Discards any partial message and positions at the start of a status
    /// line, as after a reconnect.
    pub fn reset(&mut self) {
        *self = ResponseParser::new();
    }

    /// Parses a response
    ///
    /// # Example
    /// ```
    /// # use pisk::parser::h1::ResponseParser;
    /// # use pisk::parser::{ParseError, ResponseSink};
    /// # struct Sink(Vec<(u16, bool)>);
    /// # impl ResponseSink for Sink {
    /// #     fn on_header_field(&mut self, _: &[u8]) {}
    /// #     fn on_header_value(&mut self, _: &[u8]) {}
    /// #     fn on_body(&mut self, _: &[u8]) {}
    /// #     fn on_message_complete(&mut self, status: u16, keep_alive: bool) {
    /// #         self.0.push((status, keep_alive));
    /// #     }
    /// # }
    /// # fn main() -> Result<(), ParseError> {
    /// let mut parser = ResponseParser::new();
    /// let mut sink = Sink(Vec::new());
    /// parser.advance(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", &mut sink)?;
    /// assert_eq!(vec![(200, true)], sink.0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn advance(
        &mut self,
        mut buf: &[u8],
        sink: &mut impl ResponseSink,
    ) -> Result<(), ParseError> {
        while !buf.is_empty() {
            match self.state {
                State::StatusLine
                | State::Header
                | State::ChunkSize
                | State::ChunkDataEnd
                | State::Trailer => match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        self.line.extend_from_slice(&buf[..pos]);
                        buf = &buf[pos + 1..];
                        if self.line.last() == Some(&b'\r') {
                            self.line.pop();
                        }
                        let line = std::mem::take(&mut self.line);
                        self.process_line(&line, sink)?;
                    }
                    None => {
                        self.line.extend_from_slice(buf);
                        return Ok(());
                    }
                },
                State::Body => {
                    let take = self.remaining.min(buf.len() as u64) as usize;
                    sink.on_body(&buf[..take]);
                    self.remaining -= take as u64;
                    buf = &buf[take..];
                    if self.remaining == 0 {
                        self.finish_message(sink);
                    }
                }
                State::BodyUntilClose => {
                    sink.on_body(buf);
                    buf = &[];
                }
                State::ChunkData => {
                    let take = self.remaining.min(buf.len() as u64) as usize;
                    sink.on_body(&buf[..take]);
                    self.remaining -= take as u64;
                    buf = &buf[take..];
                    if self.remaining == 0 {
                        self.state = State::ChunkDataEnd;
                    }
                }
            }
        }

        Ok(())
    }

    fn process_line(&mut self, line: &[u8], sink: &mut impl ResponseSink) -> Result<(), ParseError> {
        match self.state {
            State::StatusLine => self.process_status_line(line),
            State::Header => {
                if line.is_empty() {
                    self.process_headers_end(sink);
                    Ok(())
                } else {
                    self.process_header(line, sink)
                }
            }
            State::ChunkSize => {
                let size = parse_chunk_size(line)?;
                if size == 0 {
                    self.state = State::Trailer;
                } else {
                    self.remaining = size;
                    self.state = State::ChunkData;
                }
                Ok(())
            }
            State::ChunkDataEnd => {
                if !line.is_empty() {
                    return Err(ParseError::NewLine);
                }
                self.state = State::ChunkSize;
                Ok(())
            }
            State::Trailer => {
                if line.is_empty() {
                    self.finish_message(sink);
                }
                Ok(())
            }
            _ => unreachable!("process_line called in a body state"),
        }
    }

    fn process_status_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let rest = line.strip_prefix(b"HTTP/1.").ok_or(ParseError::Version)?;

        self.version = match rest.first() {
            Some(b'0') => HttpVersion::H1_0,
            Some(b'1') => HttpVersion::H1_1,
            _ => return Err(ParseError::Version),
        };

        let rest = rest.get(1..).ok_or(ParseError::Status)?;
        let rest = rest.strip_prefix(b" ").ok_or(ParseError::Status)?;
        if rest.len() < 3 || !rest[..3].iter().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Status);
        }
        if rest.get(3).is_some_and(|&b| b != b' ') {
            return Err(ParseError::Status);
        }

        self.status = (rest[0] - b'0') as u16 * 100
            + (rest[1] - b'0') as u16 * 10
            + (rest[2] - b'0') as u16;
        self.state = State::Header;

        Ok(())
    }

    fn process_header(&mut self, line: &[u8], sink: &mut impl ResponseSink) -> Result<(), ParseError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::HeaderName)?;
        if colon == 0 {
            return Err(ParseError::HeaderName);
        }

        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }

        if name.eq_ignore_ascii_case(b"content-length") {
            let text = std::str::from_utf8(value).map_err(|_| ParseError::HeaderValue)?;
            let length = text.parse::<u64>().map_err(|_| ParseError::HeaderValue)?;
            self.content_length = Some(length);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if contains_token(value, b"chunked") {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"connection") {
            if contains_token(value, b"close") {
                self.connection_close = true;
            }
            if contains_token(value, b"keep-alive") {
                self.connection_keep_alive = true;
            }
        }

        sink.on_header_field(name);
        sink.on_header_value(value);

        Ok(())
    }

    fn process_headers_end(&mut self, sink: &mut impl ResponseSink) {
        // 1xx, 204 and 304 never carry a body regardless of framing headers.
        let bodyless = (100..200).contains(&self.status) || self.status == 204 || self.status == 304;

        if bodyless {
            self.finish_message(sink);
        } else if self.chunked {
            self.state = State::ChunkSize;
        } else {
            match self.content_length {
                Some(0) => self.finish_message(sink),
                Some(length) => {
                    self.remaining = length;
                    self.state = State::Body;
                }
                None => self.state = State::BodyUntilClose,
            }
        }
    }

    fn finish_message(&mut self, sink: &mut impl ResponseSink) {
        let keep_alive = match self.state {
            State::BodyUntilClose => false,
            _ => match self.version {
                HttpVersion::H1_1 => !self.connection_close,
                HttpVersion::H1_0 => self.connection_keep_alive,
            },
        };

        sink.on_message_complete(self.status, keep_alive);
        self.reset();
    }
}

fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .map(|part| {
            let mut part = part;
            while part.first() == Some(&b' ') || part.first() == Some(&b'\t') {
                part = &part[1..];
            }
            while part.last() == Some(&b' ') || part.last() == Some(&b'\t') {
                part = &part[..part.len() - 1];
            }
            part
        })
        .any(|part| part.eq_ignore_ascii_case(token))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    // chunk extensions after ';' are ignored
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };

    if digits.is_empty() {
        return Err(ParseError::ChunkSize);
    }

    let mut size: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::ChunkSize),
        };
        size = size.checked_mul(16).ok_or(ParseError::ChunkSize)? + digit as u64;
    }

    Ok(size)
}

#[cfg(test)]
mod test {
    use super::ResponseParser;
    use crate::parser::{ParseError, ResponseSink};

    #[derive(Default)]
    struct Sink {
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        body: Vec<u8>,
        complete: Vec<(u16, bool)>,
        pending_field: Option<Vec<u8>>,
    }

    impl ResponseSink for Sink {
        fn on_header_field(&mut self, data: &[u8]) {
            self.pending_field = Some(data.to_vec());
        }

        fn on_header_value(&mut self, data: &[u8]) {
            let field = self.pending_field.take().unwrap();
            self.headers.push((field, data.to_vec()));
        }

        fn on_body(&mut self, data: &[u8]) {
            self.body.extend_from_slice(data);
        }

        fn on_message_complete(&mut self, status: u16, keep_alive: bool) {
            self.complete.push((status, keep_alive));
        }
    }

    #[test]
    fn parses_response_with_content_length() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(
                b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
                &mut sink,
            )
            .unwrap();
        assert_eq!(vec![(200, true)], sink.complete);
        assert_eq!(b"hello", &sink.body[..]);
        assert_eq!(1, sink.headers.len());
    }

    #[test]
    fn parses_response_split_across_reads() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        for chunk in raw.chunks(3) {
            parser.advance(chunk, &mut sink).unwrap();
        }
        assert_eq!(vec![(200, true)], sink.complete);
        assert_eq!(b"body", &sink.body[..]);
    }

    #[test]
    fn parses_pipelined_responses_in_one_buffer() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(
                b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nx\
                  HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\ny",
                &mut sink,
            )
            .unwrap();
        assert_eq!(2, sink.complete.len());
        assert_eq!(b"xy", &sink.body[..]);
    }

    #[test]
    fn parses_chunked_body() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
                &mut sink,
            )
            .unwrap();
        assert_eq!(vec![(200, true)], sink.complete);
        assert_eq!(b"wikipedia", &sink.body[..]);
    }

    #[test]
    fn http_1_1_connection_close_disables_keep_alive() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(
                b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
                &mut sink,
            )
            .unwrap();
        assert_eq!(vec![(200, false)], sink.complete);
    }

    #[test]
    fn http_1_0_defaults_to_close() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n", &mut sink)
            .unwrap();
        assert_eq!(vec![(200, false)], sink.complete);
    }

    #[test]
    fn http_1_0_keep_alive_header_enables_reuse() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(
                b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n",
                &mut sink,
            )
            .unwrap();
        assert_eq!(vec![(200, true)], sink.complete);
    }

    #[test]
    fn status_204_has_no_body() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(b"HTTP/1.1 204 No Content\r\n\r\n", &mut sink)
            .unwrap();
        assert_eq!(vec![(204, true)], sink.complete);
        assert!(sink.body.is_empty());
    }

    #[test]
    fn error_statuses_are_reported() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(
                b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
                &mut sink,
            )
            .unwrap();
        assert_eq!(vec![(503, true)], sink.complete);
    }

    #[test]
    fn rejects_invalid_version() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        assert_eq!(
            Err(ParseError::Version),
            parser.advance(b"HTTP/2 200\r\n", &mut sink)
        );
    }

    #[test]
    fn rejects_invalid_status() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        assert_eq!(
            Err(ParseError::Status),
            parser.advance(b"HTTP/1.1 OK\r\n", &mut sink)
        );
    }

    #[test]
    fn rejects_header_without_colon() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        assert_eq!(
            Err(ParseError::HeaderName),
            parser.advance(b"HTTP/1.1 200 OK\r\nbogus\r\n", &mut sink)
        );
    }

    #[test]
    fn chunk_size_accepts_extensions() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser
            .advance(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  2;name=value\r\nok\r\n0\r\n\r\n",
                &mut sink,
            )
            .unwrap();
        assert_eq!(b"ok", &sink.body[..]);
        assert_eq!(1, sink.complete.len());
    }

    #[test]
    fn reset_discards_partial_message() {
        let mut parser = ResponseParser::new();
        let mut sink = Sink::default();
        parser.advance(b"HTTP/1.1 200 OK\r\nConte", &mut sink).unwrap();
        parser.reset();
        parser
            .advance(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", &mut sink)
            .unwrap();
        assert_eq!(vec![(200, true)], sink.complete);
    }
}
