use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;
use crate::commands::HeaterCommand;
use crate::config::ServerConfig;
use crate::indicator::Indicator;
use crate::protocol::{ProtocolClient, SerialTransport};
use crate::types::{CommandReply, StatusPayload};

const READ_CHUNK: usize = 512;
const ACCEPT_POLL_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("connection closed before a request arrived")]
    Empty,
    #[error("malformed request line `{0}`")]
    MalformedRequestLine(String),
    #[error("request read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(io::Error),
    #[error("accept failed: {0}")]
    Accept(io::Error),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("response write failed: {0}")]
    Io(#[from] io::Error),
}

pub trait Listener {
    type Stream: Read + Write;

    /// Waits at most `timeout_ms` for a client. `Ok(None)` means the wait
    /// expired.
    fn accept(&mut self, timeout_ms: u64) -> io::Result<Option<(Self::Stream, String)>>;
}

pub trait Binder {
    type Listener: Listener;

    fn bind(&mut self, port: u16) -> io::Result<Self::Listener>;
}

/// `std::net` listener, usable on the host and on ESP-IDF.
pub struct TcpBinder<C> {
    clock: C,
    client_timeout_ms: u64,
}

impl<C: Clock + Clone> TcpBinder<C> {
    pub fn new(clock: C, client_timeout_ms: u64) -> Self {
        Self {
            clock,
            client_timeout_ms,
        }
    }
}

impl<C: Clock + Clone> Binder for TcpBinder<C> {
    type Listener = TcpAcceptor<C>;

    fn bind(&mut self, port: u16) -> io::Result<Self::Listener> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        listener.set_nonblocking(true)?;
        Ok(TcpAcceptor {
            listener,
            clock: self.clock.clone(),
            client_timeout: Duration::from_millis(self.client_timeout_ms),
        })
    }
}

pub struct TcpAcceptor<C> {
    listener: TcpListener,
    clock: C,
    client_timeout: Duration,
}

impl<C: Clock> Listener for TcpAcceptor<C> {
    type Stream = TcpStream;

    fn accept(&mut self, timeout_ms: u64) -> io::Result<Option<(TcpStream, String)>> {
        let started = self.clock.monotonic_ms();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(self.client_timeout))?;
                    stream.set_write_timeout(Some(self.client_timeout))?;
                    return Ok(Some((stream, peer.to_string())));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.clock.elapsed_since(started) >= timeout_ms {
                        return Ok(None);
                    }
                    self.clock.sleep_ms(ACCEPT_POLL_MS);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// `None` when the header block never terminated.
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Index,
    Status,
    Command,
    Unmatched,
}

pub fn route(method: &str, path: &str) -> Route {
    match (method, path) {
        ("GET", "/") => Route::Index,
        ("GET", "/status") => Route::Status,
        ("POST", "/cmd") => Route::Command,
        _ => Route::Unmatched,
    }
}

pub fn parse_request(raw: &[u8]) -> Result<Request, RequestError> {
    if raw.is_empty() {
        return Err(RequestError::Empty);
    }

    let text = String::from_utf8_lossy(raw);
    let (head, body) = match text.find("\r\n\r\n") {
        Some(idx) => (&text[..idx], Some(&text[idx + 4..])),
        None => match text.find("\n\n") {
            Some(idx) => (&text[..idx], Some(&text[idx + 2..])),
            None => (text.as_ref(), None),
        },
    };

    let request_line = head.lines().next().unwrap_or("").trim();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Err(RequestError::MalformedRequestLine(request_line.to_string()));
    };

    Ok(Request {
        method: method.to_string(),
        path: path.to_string(),
        body: body.map(str::to_string),
    })
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|idx| idx + 4)
}

fn content_length(head: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(head).lines().skip(1).find_map(|line| {
        let lower = line.trim().to_ascii_lowercase();
        lower
            .strip_prefix("content-length:")
            .and_then(|rest| rest.trim().parse().ok())
    })
}

/// Reads the header block and, when announced, the body. Never reads more
/// than `max_bytes`. Without `Content-Length` the body is whatever arrived
/// together with the headers.
pub fn read_request<S: Read>(stream: &mut S, max_bytes: usize) -> Result<Vec<u8>, RequestError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let wanted = match header_end(&buf) {
            Some(end) => end.saturating_add(content_length(&buf[..end]).unwrap_or(0)),
            None => max_bytes,
        };
        if buf.len() >= wanted.min(max_bytes) {
            break;
        }

        let room = (max_bytes - buf.len()).min(READ_CHUNK);
        let read = match stream.read(&mut chunk[..room]) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            // A client stalling before the header block ends gets what arrived so far.
            Err(err) if !buf.is_empty() && is_timeout(&err) => break,
            Err(err) => return Err(RequestError::Io(err)),
        };
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }

    buf.truncate(max_bytes);
    Ok(buf)
}

fn write_response<S: Write>(
    stream: &mut S,
    content_type: &str,
    allow_cors: bool,
    body: &[u8],
    chunk_size: usize,
) -> io::Result<()> {
    let cors = if allow_cors {
        "Access-Control-Allow-Origin: *\r\n"
    } else {
        ""
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\n{cors}Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    for chunk in body.chunks(chunk_size.max(1)) {
        stream.write_all(chunk)?;
    }
    stream.flush()
}

fn write_json<S: Write, T: Serialize>(stream: &mut S, value: &T, chunk_size: usize) -> Result<(), ServerError> {
    let body = serde_json::to_vec(value).map_err(io::Error::from)?;
    write_response(stream, "application/json", true, &body, chunk_size)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub connections: u32,
    pub faults: u32,
}

/// Single-client HTTP front end for the heater controller.
pub struct ControlServer<B> {
    binder: B,
    config: ServerConfig,
    index_html: &'static [u8],
}

impl<B: Binder> ControlServer<B> {
    pub fn new(binder: B, config: ServerConfig, index_html: &'static [u8]) -> Self {
        Self {
            binder,
            config,
            index_html,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves clients one at a time until `keep_serving` turns false, which
    /// is checked before every accept. Only bind and accept failures end the
    /// loop with an error.
    pub fn serve<T, C, I, F>(
        &mut self,
        client: &mut ProtocolClient<T, C>,
        indicator: &mut I,
        keep_serving: F,
    ) -> Result<ServeSummary, ServerError>
    where
        T: SerialTransport,
        C: Clock,
        I: Indicator + ?Sized,
        F: FnMut() -> bool,
    {
        let mut listener = self
            .binder
            .bind(self.config.port)
            .map_err(ServerError::Bind)?;
        info!("control server listening on port {}", self.config.port);

        indicator.start_pulse(self.config.pulse_period_ms);
        let result = self.accept_loop(&mut listener, client, keep_serving);
        indicator.stop_pulse();
        indicator.set(false);

        match &result {
            Ok(summary) => info!(
                "control server stopped after {} connections ({} faults)",
                summary.connections, summary.faults
            ),
            Err(err) => warn!("control server aborted: {err}"),
        }
        result
    }

    fn accept_loop<L, T, C, F>(
        &self,
        listener: &mut L,
        client: &mut ProtocolClient<T, C>,
        mut keep_serving: F,
    ) -> Result<ServeSummary, ServerError>
    where
        L: Listener,
        T: SerialTransport,
        C: Clock,
        F: FnMut() -> bool,
    {
        let mut summary = ServeSummary::default();

        while keep_serving() {
            match listener.accept(self.config.accept_timeout_ms) {
                Ok(Some((mut stream, peer))) => {
                    summary.connections += 1;
                    if let Err(err) = self.handle_connection(&mut stream, client) {
                        summary.faults += 1;
                        warn!("client {peer}: {err}");
                    }
                }
                Ok(None) => {}
                Err(err) if is_transient(&err) => debug!("accept interrupted: {err}"),
                Err(err) => return Err(ServerError::Accept(err)),
            }
        }

        Ok(summary)
    }

    /// Handles one request to completion. The stream closes when dropped.
    pub fn handle_connection<S, T, C>(
        &self,
        stream: &mut S,
        client: &mut ProtocolClient<T, C>,
    ) -> Result<Route, ServerError>
    where
        S: Read + Write,
        T: SerialTransport,
        C: Clock,
    {
        let raw = read_request(stream, self.config.max_request_bytes)?;
        let request = parse_request(&raw)?;
        let target = route(&request.method, &request.path);
        debug!("{} {} -> {target:?}", request.method, request.path);

        match target {
            Route::Index => write_response(
                stream,
                "text/html",
                false,
                self.index_html,
                self.config.chunk_size,
            )?,
            Route::Status => {
                let status = client.status();
                let payload = StatusPayload::from(status.as_ref());
                write_json(stream, &payload, self.config.chunk_size)?;
            }
            Route::Command => {
                // Commands travel in the body; without a header terminator there is none.
                let Some(body) = request.body.as_deref() else {
                    debug!("command request without a body, closing");
                    return Ok(Route::Unmatched);
                };
                let command = body.trim();
                match command.parse::<HeaterCommand>() {
                    Ok(parsed) => info!("web command: {parsed}"),
                    Err(err) => info!("web command `{command}` passed through ({err})"),
                }
                let reply = CommandReply::from(client.execute(command));
                write_json(stream, &reply, self.config.chunk_size)?;
            }
            Route::Unmatched => {}
        }

        Ok(target)
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
