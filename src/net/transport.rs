//! Plain-TCP and TLS transport variants.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use socket2::{Domain, Socket, Type};

use super::{Progress, Want};

/// A non-blocking client transport.
///
/// Both variants expose the same five operations; the TLS variant layers a
/// rustls session over the socket and reports handshake progress through
/// [`Progress::Retry`] hints.
#[derive(Debug)]
pub enum Transport {
    /// Cleartext TCP.
    Plain(Plain),
    /// TLS over TCP.
    Tls(Tls),
}

impl Transport {
    /// Starts a non-blocking connect, optionally binding the socket to a
    /// local source address first.
    pub fn connect(
        addr: SocketAddr,
        local_ip: Option<IpAddr>,
        tls: Option<&(Arc<ClientConfig>, ServerName<'static>)>,
    ) -> io::Result<Transport> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;

        if let Some(ip) = local_ip {
            if let Err(err) = socket.bind(&SocketAddr::new(ip, 0).into()) {
                tracing::warn!(%ip, %err, "couldn't bind socket, benchmark results may be invalid");
            }
        }

        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
        socket.set_nodelay(true)?;

        let stream = TcpStream::from_std(socket.into());

        Ok(match tls {
            None => Transport::Plain(Plain {
                stream,
                connected: false,
            }),
            Some((config, name)) => {
                let session = ClientConnection::new(config.clone(), name.clone())
                    .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
                Transport::Tls(Tls {
                    stream,
                    session: Box::new(session),
                    tcp_connected: false,
                    buffered: 0,
                    queued: 0,
                })
            }
        })
    }

    /// Drives the connect (and, for TLS, the handshake) forward.
    pub fn poll_connect(&mut self) -> io::Result<Progress> {
        match self {
            Transport::Plain(plain) => plain.poll_connect(),
            Transport::Tls(tls) => tls.poll_connect(),
        }
    }

    /// Reads decrypted application bytes into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        match self {
            Transport::Plain(plain) => plain.read(buf),
            Transport::Tls(tls) => tls.read(buf),
        }
    }

    /// Writes application bytes from `buf`.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<Progress> {
        match self {
            Transport::Plain(plain) => plain.write(buf),
            Transport::Tls(tls) => tls.write(buf),
        }
    }

    /// Bytes already decrypted inside the transport but not yet consumed.
    pub fn buffered(&self) -> usize {
        match self {
            Transport::Plain(_) => 0,
            Transport::Tls(tls) => tls.buffered,
        }
    }

    /// The underlying socket, for readiness registration.
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(plain) => &mut plain.stream,
            Transport::Tls(tls) => &mut tls.stream,
        }
    }
}

/// Cleartext TCP transport state.
#[derive(Debug)]
pub struct Plain {
    stream: TcpStream,
    connected: bool,
}

impl Plain {
    fn poll_connect(&mut self) -> io::Result<Progress> {
        if self.connected {
            return Ok(Progress::Ok(0));
        }

        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }

        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(Progress::Ok(0))
            }
            Err(err)
                if err.kind() == ErrorKind::NotConnected
                    || err.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                Ok(Progress::Retry(Want {
                    read: false,
                    write: true,
                }))
            }
            Err(err) => Err(err),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => return Ok(Progress::Ok(n)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Progress::Retry(Want {
                        read: true,
                        write: false,
                    }))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Progress> {
        loop {
            match self.stream.write(buf) {
                Ok(n) => return Ok(Progress::Ok(n)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Progress::Retry(Want {
                        read: false,
                        write: true,
                    }))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

/// TLS transport state: the socket plus the rustls session over it.
#[derive(Debug)]
pub struct Tls {
    stream: TcpStream,
    session: Box<ClientConnection>,
    tcp_connected: bool,
    /// Plaintext bytes decrypted but not yet handed to the caller.
    buffered: usize,
    /// Plaintext bytes accepted by the session but not yet acknowledged to
    /// the caller; acknowledged only once the records reach the socket.
    queued: usize,
}

impl Tls {
    fn want(&self) -> Want {
        Want {
            read: self.session.wants_read(),
            write: self.session.wants_write(),
        }
    }

    fn poll_connect(&mut self) -> io::Result<Progress> {
        if !self.tcp_connected {
            if let Some(err) = self.stream.take_error()? {
                return Err(err);
            }

            match self.stream.peer_addr() {
                Ok(_) => self.tcp_connected = true,
                Err(err)
                    if err.kind() == ErrorKind::NotConnected
                        || err.raw_os_error() == Some(libc::EINPROGRESS) =>
                {
                    return Ok(Progress::Retry(Want {
                        read: false,
                        write: true,
                    }))
                }
                Err(err) => return Err(err),
            }
        }

        while self.session.is_handshaking() {
            if self.session.wants_write() {
                match self.session.write_tls(&mut self.stream) {
                    Ok(_) => continue,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        return Ok(Progress::Retry(self.want()))
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }

            match self.session.read_tls(&mut self.stream) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(_) => {
                    self.session
                        .process_new_packets()
                        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Progress::Retry(self.want()))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        Ok(Progress::Ok(0))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        loop {
            if self.buffered > 0 {
                match self.session.reader().read(buf) {
                    Ok(n) => {
                        self.buffered -= n.min(self.buffered);
                        return Ok(Progress::Ok(n));
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => self.buffered = 0,
                    Err(err) => return Err(err),
                }
            }

            match self.session.read_tls(&mut self.stream) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(_) => {
                    let state = self
                        .session
                        .process_new_packets()
                        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
                    self.buffered = state.plaintext_bytes_to_read();

                    if self.buffered == 0 {
                        if state.peer_has_closed() {
                            return Err(ErrorKind::UnexpectedEof.into());
                        }
                        return Ok(Progress::Retry(Want {
                            read: true,
                            write: false,
                        }));
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Progress::Retry(Want {
                        read: true,
                        write: false,
                    }))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Progress> {
        if self.queued == 0 {
            self.queued = self.session.writer().write(buf)?;
        }

        loop {
            if !self.session.wants_write() {
                let n = self.queued;
                self.queued = 0;
                return Ok(Progress::Ok(n));
            }

            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Progress::Retry(Want {
                        read: false,
                        write: true,
                    }))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}
