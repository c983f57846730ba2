//! The TCP-tunnel backend: a length-prefixed frame transport over a TCP
//! stream, used to bridge containers in multi-node integration tests that
//! have no real CAN bus between them.
//!
//! Wire format: `[4-byte big-endian length][N-byte frame encoding]`. The
//! length is always [`ENCODED_FRAME_LEN`]; a peer that announces anything
//! else has desynchronized the stream and the connection is treated as
//! fatally corrupted.

use std::env;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};

use super::Backend;
use crate::error::{Error, TransportFault};
use crate::frame::Frame;

const TOKEN: Token = Token(0);

/// Fixed wire size of one encoded frame: extended flag (1) + id (4) +
/// dlc (1) + data (8, zero-padded beyond `dlc`).
pub const ENCODED_FRAME_LEN: usize = 14;

/// Where to connect/bind, and which role (client or server) to play.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    host: heapless::String<64>,
    port: u16,
    server: bool,
}

impl TcpConfig {
    /// Environment variable naming the tunnel host (client) or bind address
    /// (server). Default `localhost`.
    pub const ENV_HOST: &'static str = "ARTIE_CAN_MOCK_HOST";
    /// Environment variable naming the tunnel port. Default `5555`.
    pub const ENV_PORT: &'static str = "ARTIE_CAN_MOCK_PORT";
    /// Environment variable selecting server mode when set to `true`.
    pub const ENV_SERVER: &'static str = "ARTIE_CAN_MOCK_SERVER";

    const DEFAULT_HOST: &'static str = "localhost";
    const DEFAULT_PORT: u16 = 5555;

    /// Build a configuration explicitly; explicit configuration always
    /// overrides the environment.
    pub fn new(host: &str, port: u16, server: bool) -> Result<Self, Error> {
        let mut buf = heapless::String::new();
        buf.push_str(host)
            .map_err(|()| Error::InvalidArgument("host exceeds 64 bytes"))?;
        Ok(Self {
            host: buf,
            port,
            server,
        })
    }

    /// Build a configuration from `ARTIE_CAN_MOCK_HOST`/`_PORT`/`_SERVER`,
    /// falling back to `localhost:5555` client mode for anything unset or
    /// unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let host = env::var(Self::ENV_HOST).unwrap_or_else(|_| Self::DEFAULT_HOST.into());
        let port = env::var(Self::ENV_PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Self::DEFAULT_PORT);
        let server = env::var(Self::ENV_SERVER)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self::new(&host, port, server).unwrap_or_else(|_| {
            Self::new(Self::DEFAULT_HOST, Self::DEFAULT_PORT, false)
                .expect("default host fits in 64 bytes")
        })
    }

    fn socket_addr(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::TransportFault(TransportFault::NoRoute))?
            .next()
            .ok_or(Error::TransportFault(TransportFault::NoRoute))
    }
}

enum Endpoint {
    Server {
        listener: MioTcpListener,
        stream: Option<MioTcpStream>,
    },
    Client {
        stream: MioTcpStream,
        connected: bool,
    },
}

/// The TCP-tunnel backend (§4.4).
pub struct TcpTunnelBackend {
    config: TcpConfig,
    endpoint: Option<Endpoint>,
    poll: Option<Poll>,
    open: bool,
    /// Bytes of the in-flight inbound frame collected so far. A length-
    /// prefixed wire frame may arrive across several TCP segments; a short
    /// `read` mid-frame is not corruption, so partial progress is kept here
    /// across `receive` calls rather than discarded.
    rx_buf: [u8; 4 + ENCODED_FRAME_LEN],
    rx_filled: usize,
}

impl TcpTunnelBackend {
    /// Construct a backend from an explicit configuration. Call
    /// [`Backend::init`] before using it.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            endpoint: None,
            poll: None,
            open: false,
            rx_buf: [0u8; 4 + ENCODED_FRAME_LEN],
            rx_filled: 0,
        }
    }

    fn poll_ready(&mut self, token_interest_readable: bool, timeout_ms: u32) -> nb::Result<(), Error> {
        let poll = self.poll.as_mut().ok_or(nb::Error::Other(Error::NotOpen))?;
        let mut events = Events::with_capacity(1);
        let timeout = if timeout_ms == 0 {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis(u64::from(timeout_ms)))
        };
        poll.poll(&mut events, timeout)
            .map_err(|_| nb::Error::Other(Error::TransportFault(TransportFault::Io)))?;

        let ready = events.iter().any(|e| {
            e.token() == TOKEN && (if token_interest_readable { e.is_readable() } else { e.is_writable() })
        });

        if ready {
            Ok(())
        } else if timeout_ms == 0 {
            Err(nb::Error::WouldBlock)
        } else {
            Err(nb::Error::Other(Error::Timeout))
        }
    }

    /// Ensure the transport has an established stream, performing the
    /// deferred server-accept or client-connect-completion step.
    fn ensure_connected(&mut self, timeout_ms: u32) -> nb::Result<(), Error> {
        match self.endpoint.as_mut().ok_or(nb::Error::Other(Error::NotOpen))? {
            Endpoint::Server { stream: Some(_), .. } => Ok(()),
            Endpoint::Server { .. } => {
                self.poll_ready(true, timeout_ms)?;
                let Endpoint::Server { listener, stream } = self.endpoint.as_mut().unwrap() else {
                    unreachable!()
                };
                match listener.accept() {
                    Ok((accepted, _addr)) => {
                        let mut accepted = accepted;
                        self.poll
                            .as_mut()
                            .unwrap()
                            .registry()
                            .reregister(&mut accepted, TOKEN, Interest::READABLE | Interest::WRITABLE)
                            .map_err(|_| nb::Error::Other(Error::TransportFault(TransportFault::Io)))?;
                        *stream = Some(accepted);
                        Ok(())
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
                    Err(_) => Err(nb::Error::Other(Error::TransportFault(TransportFault::Io))),
                }
            }
            Endpoint::Client { connected: true, .. } => Ok(()),
            Endpoint::Client { stream, connected } => {
                self.poll_ready(false, timeout_ms)?;
                match stream.take_error() {
                    Ok(None) => {
                        *connected = true;
                        Ok(())
                    }
                    Ok(Some(_)) | Err(_) => {
                        Err(nb::Error::Other(Error::TransportFault(TransportFault::NoRoute)))
                    }
                }
            }
        }
    }

    /// Borrows only `endpoint`, not the whole backend, so callers that also
    /// need a disjoint field (e.g. `rx_buf`) live at the same time can take
    /// `&mut self.endpoint` explicitly instead of going through `&mut self`.
    fn active_stream(endpoint: &mut Option<Endpoint>) -> Result<&mut MioTcpStream, Error> {
        match endpoint.as_mut().ok_or(Error::NotOpen)? {
            Endpoint::Server { stream: Some(s), .. } => Ok(s),
            Endpoint::Client { stream, .. } => Ok(stream),
            Endpoint::Server { stream: None, .. } => Err(Error::NotOpen),
        }
    }
}

fn encode_frame(frame: &Frame) -> [u8; ENCODED_FRAME_LEN] {
    let mut buf = [0u8; ENCODED_FRAME_LEN];
    buf[0] = u8::from(frame.is_extended());
    buf[1..5].copy_from_slice(&frame.id().to_be_bytes());
    buf[5] = frame.dlc();
    buf[6..6 + frame.data().len()].copy_from_slice(frame.data());
    buf
}

fn decode_frame(buf: &[u8; ENCODED_FRAME_LEN]) -> Result<Frame, Error> {
    let extended = buf[0] != 0;
    let id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let dlc = buf[5];
    if dlc as usize > crate::frame::MAX_DATA_LEN {
        return Err(Error::InvalidFrame);
    }
    let frame = Frame::new(id, &buf[6..6 + dlc as usize])?;
    Ok(if extended { frame } else { frame.mark_base() })
}

impl Backend for TcpTunnelBackend {
    fn init(&mut self) -> Result<(), Error> {
        let addr = self.config.socket_addr()?;
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

        let poll = Poll::new().map_err(|_| Error::TransportFault(TransportFault::Io))?;

        if self.config.server {
            let socket = Socket::new(domain, Type::STREAM, None)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;
            socket
                .set_reuse_address(true)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;
            socket
                .bind(&addr.into())
                .map_err(|_| Error::TransportFault(TransportFault::NoRoute))?;
            socket
                .listen(1)
                .map_err(|_| Error::TransportFault(TransportFault::NoRoute))?;
            socket
                .set_nonblocking(true)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;

            let std_listener: StdTcpListener = socket.into();
            let mut listener = MioTcpListener::from_std(std_listener);
            poll.registry()
                .register(&mut listener, TOKEN, Interest::READABLE)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;

            self.endpoint = Some(Endpoint::Server { listener, stream: None });
        } else {
            let socket = Socket::new(domain, Type::STREAM, None)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;
            socket
                .set_nonblocking(true)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;
            match socket.connect(&addr.into()) {
                Ok(()) | Err(_) => {
                    // A non-blocking connect on a fresh socket always either
                    // completes immediately (loopback, same host) or reports
                    // EINPROGRESS/WouldBlock; either way completion is
                    // confirmed later via `ensure_connected`.
                }
            }

            let std_stream: StdTcpStream = socket.into();
            let mut stream = MioTcpStream::from_std(std_stream);
            poll.registry()
                .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;

            self.endpoint = Some(Endpoint::Client { stream, connected: false });
        }

        self.poll = Some(poll);
        self.open = true;
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> nb::Result<(), Error> {
        if !self.open {
            return Err(nb::Error::Other(Error::NotOpen));
        }
        self.ensure_connected(0)?;

        let frame_buf = encode_frame(frame);
        let mut wire = [0u8; 4 + ENCODED_FRAME_LEN];
        wire[..4].copy_from_slice(&(ENCODED_FRAME_LEN as u32).to_be_bytes());
        wire[4..].copy_from_slice(&frame_buf);

        let stream = Self::active_stream(&mut self.endpoint).map_err(nb::Error::Other)?;

        match stream.write(&wire) {
            Ok(n) if n == wire.len() => {
                log::trace!("tcp backend egress id={:#010x} dlc={}", frame.id(), frame.dlc());
                Ok(())
            }
            Ok(_) => {
                log::error!("tcp backend short write, stream desynchronized");
                Err(nb::Error::Other(Error::TransportFault(TransportFault::FramingDesync)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => {
                log::error!("tcp backend send failed: {e}");
                Err(nb::Error::Other(Error::TransportFault(TransportFault::Io)))
            }
        }
    }

    fn receive(&mut self, timeout_ms: u32) -> nb::Result<Frame, Error> {
        if !self.open {
            return Err(nb::Error::Other(Error::NotOpen));
        }
        self.ensure_connected(timeout_ms)?;

        let deadline = (timeout_ms != 0)
            .then(|| Instant::now() + Duration::from_millis(u64::from(timeout_ms)));
        let wire_len = self.rx_buf.len();

        loop {
            let window_ms = match deadline {
                None => 0,
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(nb::Error::Other(Error::Timeout));
                    }
                    remaining.as_millis().min(u128::from(u32::MAX)) as u32
                }
            };
            self.poll_ready(true, window_ms)?;

            let filled = self.rx_filled;
            let stream = Self::active_stream(&mut self.endpoint).map_err(nb::Error::Other)?;
            match stream.read(&mut self.rx_buf[filled..]) {
                Ok(0) => {
                    log::error!("tcp backend peer closed mid-frame, stream desynchronized");
                    self.rx_filled = 0;
                    return Err(nb::Error::Other(Error::TransportFault(TransportFault::FramingDesync)));
                }
                Ok(n) => {
                    self.rx_filled += n;
                    if self.rx_filled < wire_len {
                        // Partial segment; the rest is still on the way.
                        continue;
                    }

                    let wire = self.rx_buf;
                    self.rx_filled = 0;
                    let announced = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
                    if announced != ENCODED_FRAME_LEN {
                        log::error!("tcp backend length prefix {announced} != {ENCODED_FRAME_LEN}, stream desynchronized");
                        return Err(nb::Error::Other(Error::TransportFault(TransportFault::FramingDesync)));
                    }
                    let mut frame_buf = [0u8; ENCODED_FRAME_LEN];
                    frame_buf.copy_from_slice(&wire[4..]);
                    let frame = decode_frame(&frame_buf).map_err(nb::Error::Other)?;
                    log::trace!("tcp backend ingress id={:#010x} dlc={}", frame.id(), frame.dlc());
                    return Ok(frame);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if timeout_ms == 0 {
                        return Err(nb::Error::WouldBlock);
                    }
                    // Loop back around; `poll_ready` will wait out the
                    // remaining budget for the next readable event.
                }
                Err(e) => {
                    log::error!("tcp backend receive failed: {e}");
                    return Err(nb::Error::Other(Error::TransportFault(TransportFault::Io)));
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.endpoint = None;
        self.poll = None;
        self.open = false;
        self.rx_filled = 0;
        Ok(())
    }
}
