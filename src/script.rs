//! Request-generation hook bridge.
//!
//! The engine is parameterized over a narrow [`Script`] capability: URL
//! parsing, host resolution, request production and response observation.
//! [`StaticScript`] is the built-in implementation — a fixed GET request
//! assembled once from the URL and any extra headers. Anything stateful
//! (request templating, response assertions) slots in behind the same trait.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::Error;
use crate::stats::Errors;

/// Decomposed target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    /// `http` or `https`.
    pub scheme: String,
    /// Host name or address literal.
    pub host: String,
    /// Explicit port, or the scheme default.
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Url {
    /// Parses an `http`/`https` URL of the form
    /// `scheme://host[:port][/path[?query]]`.
    pub fn parse(raw: &str) -> Result<Url, Error> {
        let invalid = || Error::InvalidUrl(raw.to_string());

        let (scheme, rest) = raw.split_once("://").ok_or_else(invalid)?;
        let default_port = match scheme {
            "http" => 80,
            "https" => 443,
            _ => return Err(invalid()),
        };

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // IPv6 literal
            let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match rest.strip_prefix(':') {
                Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
                None if rest.is_empty() => default_port,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
                None => (authority, default_port),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Url {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

/// The capability set the engine calls out to.
///
/// `parse_url` and `resolve` have default implementations; a minimal script
/// only has to produce request bytes.
pub trait Script {
    /// Validates and decomposes the target URL.
    fn parse_url(&self, raw: &str) -> Result<Url, Error> {
        Url::parse(raw)
    }

    /// Resolves the target host; the run aborts on failure.
    fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no addresses resolved"))
    }

    /// How many requests are packed into one pipelined batch.
    fn verify_request(&self) -> u64 {
        1
    }

    /// Whether the request bytes can be fetched once and shared; a dynamic
    /// script is asked for fresh bytes on every send.
    fn is_static(&self) -> bool {
        true
    }

    /// Whether completed responses should be delivered to [`Script::response`].
    fn want_response(&self) -> bool {
        false
    }

    /// Produces one request payload.
    fn request(&mut self) -> Vec<u8>;

    /// Observes a completed response. Called only when
    /// [`Script::want_response`] returned true.
    fn response(&mut self, _status: u16, _headers: &[(Vec<u8>, Vec<u8>)], _body: &[u8]) {}

    /// Final callback with the aggregated run totals.
    fn summary(&mut self, _runtime_us: u64, _complete: u64, _bytes: u64) {}

    /// Final callback with the aggregated error counters.
    fn errors(&mut self, _errors: &Errors) {}

    /// Last callback before exit.
    fn done(&mut self) {}
}

/// Fixed-request script: one GET, assembled up front.
#[derive(Debug, Clone)]
pub struct StaticScript {
    request: Vec<u8>,
}

impl StaticScript {
    pub fn new(url: &Url, headers: &[String]) -> Self {
        let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", url.path, url.host);
        for header in headers {
            request.push_str(header);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        StaticScript {
            request: request.into_bytes(),
        }
    }
}

impl Script for StaticScript {
    fn request(&mut self) -> Vec<u8> {
        self.request.clone()
    }
}
