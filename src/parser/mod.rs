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

//! Parser implementations for HTTP

use std::fmt::Display;

pub mod h1;

/// Represents possible failures while parsing
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid HTTP version in the status line.
    Version,
    /// Invalid status code.
    Status,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid chunk-size line.
    ChunkSize,
    /// Invalid or missing new line.
    NewLine,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Version => "Invalid version",
            ParseError::Status => "Invalid status code",
            ParseError::HeaderName => "Invalid token in header name",
            ParseError::HeaderValue => "Invalid token in header value",
            ParseError::ChunkSize => "Invalid chunk size",
            ParseError::NewLine => "Invalid or missing new line",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Representation of the response HTTP version
/// [IETF RFC 9112 Section 2.3](https://www.rfc-editor.org/rfc/rfc9112#section-2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Receiver of parse events.
///
/// The parser pushes complete header names and values, body fragments, and a
/// message-complete notification carrying the status code and whether the
/// connection may be reused for another request.
pub trait ResponseSink {
    /// A complete header name.
    fn on_header_field(&mut self, data: &[u8]);
    /// A complete header value.
    fn on_header_value(&mut self, data: &[u8]);
    /// A fragment of the response body.
    fn on_body(&mut self, data: &[u8]);
    /// The current message is finished.
    fn on_message_complete(&mut self, status: u16, keep_alive: bool);
}
