use log::{debug, trace, warn};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::SerialConfig;
use crate::response::{parse_status, parse_temperature, StatusSnapshot};

pub const OK_TOKEN: &str = "<<OK";
pub const ERROR_TOKEN: &str = "<<ERROR";
pub const ACK_PREFIX: &str = "<<";
pub const ECHO_PREFIX: &str = ">>";

pub const NO_RESPONSE: &str = "No response received";
pub const INCOMPLETE_RESPONSE: &str = "Response incomplete (timeout)";

const POLL_INTERVAL_MS: u64 = 10;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial driver: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty command")]
    EmptyCommand,
    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },
    #[error("response is not valid utf-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Byte stream shared with the heater controller.
///
/// `read_line` returns one line without its terminator, or `None` when no
/// complete line arrived within the transport's own short read timeout.
pub trait SerialTransport {
    fn bytes_available(&mut self) -> Result<usize, TransportError>;
    fn discard_input(&mut self) -> Result<usize, TransportError>;
    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

impl<T: SerialTransport + ?Sized> SerialTransport for Box<T> {
    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        (**self).bytes_available()
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        (**self).discard_input()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        (**self).write(bytes)
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).read_line()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub timeout_ms: u64,
    pub settle_ms: u64,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            settle_ms: 50,
        }
    }
}

impl From<&SerialConfig> for ExchangeOptions {
    fn from(config: &SerialConfig) -> Self {
        Self {
            timeout_ms: config.command_timeout_ms,
            settle_ms: config.settle_delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExchange {
    pub request: String,
    pub response_lines: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl CommandExchange {
    pub fn failed(request: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            response_lines: Vec::new(),
            success: false,
            error: Some(error.into()),
        }
    }

    /// Classifies the lines read for `request`. `completed` is true when a
    /// completion token ended the read loop.
    pub fn from_lines(request: impl Into<String>, lines: &[String], completed: bool) -> Self {
        let response_lines = filter_response_lines(lines);
        let error_line = response_lines
            .iter()
            .find(|line| line.starts_with(ERROR_TOKEN))
            .cloned();

        let error = if let Some(line) = error_line {
            Some(line)
        } else if lines.is_empty() {
            Some(NO_RESPONSE.to_string())
        } else if !completed {
            Some(INCOMPLETE_RESPONSE.to_string())
        } else {
            None
        };

        Self {
            request: request.into(),
            success: completed && error.is_none(),
            response_lines,
            error,
        }
    }
}

/// Keeps acknowledgement and echo lines. Falls back to every line when the
/// remote used no recognised framing.
pub fn filter_response_lines(lines: &[String]) -> Vec<String> {
    let framed: Vec<String> = lines
        .iter()
        .filter(|line| line.starts_with(ACK_PREFIX) || line.starts_with(ECHO_PREFIX))
        .cloned()
        .collect();

    if framed.is_empty() {
        lines.to_vec()
    } else {
        framed
    }
}

fn is_completion(line: &str) -> bool {
    line.starts_with(OK_TOKEN) || line.starts_with(ERROR_TOKEN)
}

/// Sends one command and collects its response.
///
/// Unread input is flushed before transmitting so telemetry queued earlier
/// never lands in this exchange.
pub fn exchange<T, C>(
    command: &str,
    options: &ExchangeOptions,
    transport: &mut T,
    clock: &C,
) -> Result<CommandExchange, ProtocolError>
where
    T: SerialTransport + ?Sized,
    C: Clock + ?Sized,
{
    let command = command.trim();
    if command.is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }

    let flushed = transport.discard_input()?;
    if flushed > 0 {
        trace!("discarded {flushed} stale bytes before `{command}`");
    }

    let frame = format!("{command}\n");
    let written = transport.write(frame.as_bytes())?;
    if written != frame.len() {
        return Err(ProtocolError::PartialWrite {
            written,
            expected: frame.len(),
        });
    }
    debug!("serial tx: {command}");

    clock.sleep_ms(options.settle_ms);

    let started = clock.monotonic_ms();
    let mut lines = Vec::new();
    let mut completed = false;

    while clock.elapsed_since(started) < options.timeout_ms {
        if transport.bytes_available()? == 0 {
            clock.sleep_ms(POLL_INTERVAL_MS);
            continue;
        }

        let Some(raw) = transport.read_line()? else {
            continue;
        };
        let text = String::from_utf8(raw)?;
        let line = text.trim();
        if line.is_empty() {
            continue;
        }

        trace!("serial rx: {line}");
        lines.push(line.to_string());
        if is_completion(line) {
            completed = true;
            break;
        }
    }

    let result = CommandExchange::from_lines(command, &lines, completed);
    if let Some(error) = &result.error {
        warn!("command `{command}` failed: {error}");
    }
    Ok(result)
}

/// Owns the serial link to the heater controller.
pub struct ProtocolClient<T, C> {
    transport: T,
    clock: C,
    options: ExchangeOptions,
}

impl<T: SerialTransport, C: Clock> ProtocolClient<T, C> {
    pub fn new(transport: T, clock: C, options: ExchangeOptions) -> Self {
        Self {
            transport,
            clock,
            options,
        }
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn exchange(&mut self, command: &str) -> Result<CommandExchange, ProtocolError> {
        exchange(command, &self.options, &mut self.transport, &self.clock)
    }

    /// Like [`exchange`](Self::exchange), but every error becomes a failed
    /// exchange carrying the error text.
    pub fn execute(&mut self, command: &str) -> CommandExchange {
        match self.exchange(command) {
            Ok(result) => result,
            Err(err) => {
                warn!("command `{}` aborted: {err}", command.trim());
                CommandExchange::failed(command.trim(), err.to_string())
            }
        }
    }

    pub fn status(&mut self) -> Option<StatusSnapshot> {
        let result = self.execute("status");
        parse_status(&result.response_lines)
    }

    /// Prefers a dedicated `TEMP,` line, then the status reading.
    pub fn temperature(&mut self) -> Option<f32> {
        let result = self.execute("status");
        parse_temperature(&result.response_lines).or_else(|| {
            parse_status(&result.response_lines).and_then(|status| status.temperature)
        })
    }
}
