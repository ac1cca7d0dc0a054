use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    net::{Ipv4Addr, UdpSocket},
    path::Path,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{Datelike, Utc};
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use espresso_common::{
    Board, Controller, ControllerConfig, HeaterCommand, Indicator, Radio, RadioError,
    RadioStatus, SerialTransport, SystemClock, TcpBinder, TimeSync, TimeSyncError, TimeWindow,
    TransportError,
};

const HOST_HTTP_PORT: u16 = 8080;
const AMBIENT_TEMP_C: f32 = 20.0;
const TELEMETRY_PERIOD: Duration = Duration::from_secs(1);
const INDEX_HTML: &[u8] = include_bytes!("../web/index.html");

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config();
    info!(
        "host controller: window {:02}:00-{:02}:00, http port {}",
        config.schedule.window.start_hour, config.schedule.window.end_hour, config.server.port
    );

    let serial: Box<dyn SerialTransport> = match std::env::var("COFFEE_SERIAL_PORT") {
        Ok(path) => Box::new(
            SerialPortTransport::open(&path, config.serial.baud_rate, config.serial.read_timeout_ms)
                .with_context(|| format!("failed to open serial port {path}"))?,
        ),
        Err(_) => {
            info!("COFFEE_SERIAL_PORT not set, using the simulated heater controller");
            Box::new(SimulatedHeater::new())
        }
    };

    let clock = SystemClock::new();
    let board = Board {
        radio: HostRadio::default(),
        serial,
        binder: TcpBinder::new(clock, config.server.client_timeout_ms),
        time_sync: HostClockCheck,
        indicator: LogIndicator::default(),
    };

    let mut controller = Controller::new(config, board, clock, INDEX_HTML);
    match controller.run() {
        Ok(never) => match never {},
        Err(err) => Err(err).context("controller stopped"),
    }
}

fn load_config() -> ControllerConfig {
    let (mut config, file_port) = match std::env::var("COFFEE_CONFIG") {
        Ok(path) => read_config_file(Path::new(&path)).unwrap_or_else(|err| {
            warn!("failed to load config from {path}: {err:#}");
            (ControllerConfig::default(), None)
        }),
        Err(_) => (ControllerConfig::default(), None),
    };

    let env_port = std::env::var("COFFEE_HTTP_PORT").ok();
    config.server.port = http_port(env_port.as_deref(), file_port);

    if let Some(window) = std::env::var("COFFEE_WINDOW")
        .ok()
        .and_then(|value| parse_window(&value))
    {
        config.schedule.window = window;
    }

    if let Some(offset) = std::env::var("COFFEE_UTC_OFFSET")
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
    {
        config.schedule.timezone.base_utc_offset_hours = offset;
    }

    // Nothing to stabilise on the host.
    config.control.boot_delay_ms = 0;
    config.sanitize();
    config
}

/// Returns the parsed file and the port it sets explicitly, if any.
fn read_config_file(path: &Path) -> anyhow::Result<(ControllerConfig, Option<u16>)> {
    let raw = std::fs::read_to_string(path).context("read failed")?;
    parse_config(&raw)
}

fn parse_config(raw: &str) -> anyhow::Result<(ControllerConfig, Option<u16>)> {
    let value: serde_json::Value = serde_json::from_str(raw).context("invalid json")?;
    let port = value
        .pointer("/server/port")
        .and_then(serde_json::Value::as_u64)
        .and_then(|port| u16::try_from(port).ok());
    let config = serde_json::from_value(value).context("invalid config")?;
    Ok((config, port))
}

/// `COFFEE_HTTP_PORT` wins over the config file; port 80 needs privileges on
/// the host, so an unset port falls back to 8080.
fn http_port(env_port: Option<&str>, file_port: Option<u16>) -> u16 {
    env_port
        .and_then(|value| value.trim().parse::<u16>().ok())
        .or(file_port)
        .unwrap_or(HOST_HTTP_PORT)
}

/// Parses `start-end`, e.g. `5-8` or `22-2`.
fn parse_window(raw: &str) -> Option<TimeWindow> {
    let (start, end) = raw.trim().split_once('-')?;
    Some(TimeWindow::new(
        start.trim().parse().ok()?,
        end.trim().parse().ok()?,
    ))
}

struct SerialPortTransport {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialPortTransport {
    fn open(path: &str, baud_rate: u32, read_timeout_ms: u64) -> anyhow::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(read_timeout_ms))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()?;
        info!("serial port {path} opened at {baud_rate} baud");
        Ok(Self {
            port,
            pending: Vec::new(),
        })
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

fn driver_error(err: serialport::Error) -> TransportError {
    TransportError::Driver(err.to_string())
}

impl SerialTransport for SerialPortTransport {
    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        let queued = self.port.bytes_to_read().map_err(driver_error)?;
        Ok(queued as usize + self.pending.len())
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let dropped = self.bytes_available()?;
        self.pending.clear();
        self.port.clear(ClearBuffer::Input).map_err(driver_error)?;
        Ok(dropped)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let written = self.port.write(bytes)?;
        self.port.flush()?;
        Ok(written)
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(read) => self.pending.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }
        Ok(self.take_line())
    }
}

/// In-process stand-in for the heater controller. Emits one
/// `temp,duty,setpoint` telemetry line per second and answers the command
/// vocabulary with `>>` echoes and a `<<OK`/`<<ERROR` terminator.
struct SimulatedHeater {
    last_step: Instant,
    next_telemetry: Instant,
    temperature: f32,
    setpoint: f32,
    regulating: bool,
    heater_forced: bool,
    output: VecDeque<String>,
}

impl SimulatedHeater {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            last_step: now,
            next_telemetry: now + TELEMETRY_PERIOD,
            temperature: AMBIENT_TEMP_C,
            setpoint: espresso_common::commands::DEFAULT_COFFEE_TEMP_C,
            regulating: false,
            heater_forced: false,
            output: VecDeque::new(),
        }
    }

    fn duty(&self) -> i32 {
        if self.regulating {
            ((self.setpoint - self.temperature) * 10.0).clamp(0.0, 100.0) as i32
        } else if self.heater_forced {
            100
        } else {
            0
        }
    }

    fn state(&self) -> &'static str {
        match (self.regulating, self.heater_forced) {
            (true, _) => "regulating",
            (false, true) => "heating",
            (false, false) => "idle",
        }
    }

    fn step(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_step).as_secs_f32();
        self.last_step = now;

        let heat = self.duty() as f32 / 100.0 * 2.5;
        let loss = (self.temperature - AMBIENT_TEMP_C) * 0.01;
        self.temperature += (heat - loss) * dt;

        while self.next_telemetry <= now {
            self.output.push_back(format!(
                "{:.1},{},{:.1}",
                self.temperature,
                self.duty(),
                self.setpoint
            ));
            self.next_telemetry += TELEMETRY_PERIOD;
        }
    }

    fn apply(&mut self, command: HeaterCommand) {
        if let Some(target) = command.target_temp_c() {
            self.setpoint = target;
            self.regulating = true;
        }
        match command {
            HeaterCommand::RegulationOn => self.regulating = true,
            HeaterCommand::RegulationOff => self.regulating = false,
            HeaterCommand::HeaterOn => self.heater_forced = true,
            HeaterCommand::HeaterOff => self.heater_forced = false,
            _ => {}
        }
    }
}

impl SerialTransport for SimulatedHeater {
    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        self.step();
        Ok(self.output.iter().map(|line| line.len() + 1).sum())
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let dropped = self.bytes_available()?;
        self.output.clear();
        Ok(dropped)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim();
        self.step();

        match text.parse::<HeaterCommand>() {
            Ok(command) => {
                self.apply(command);
                self.output.push_back(format!(">>{command}"));
                if command == HeaterCommand::Status {
                    self.output.push_back(format!(
                        ">>STATUS,1,{:.1},{:.1},{},{}",
                        self.temperature,
                        self.setpoint,
                        self.duty(),
                        self.state()
                    ));
                }
                self.output.push_back("<<OK".to_string());
            }
            Err(err) => self.output.push_back(format!("<<ERROR {err}")),
        }
        Ok(bytes.len())
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.step();
        Ok(self.output.pop_front().map(String::into_bytes))
    }
}

/// The host is always online; association is simulated.
#[derive(Default)]
struct HostRadio {
    active: bool,
    connected: bool,
}

impl Radio for HostRadio {
    fn set_active(&mut self, active: bool) -> Result<(), RadioError> {
        debug!("host radio {}", if active { "up" } else { "down" });
        self.active = active;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn status(&mut self) -> Result<RadioStatus, RadioError> {
        Ok(match (self.active, self.connected) {
            (false, _) => RadioStatus::NotReady,
            (true, true) => RadioStatus::GotIp,
            (true, false) => RadioStatus::Idle,
        })
    }

    fn begin_connect(&mut self, ssid: &str, _password: &str) -> Result<(), RadioError> {
        debug!("host radio joining `{ssid}`");
        self.connected = self.active;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.connected = false;
        Ok(())
    }

    fn address(&mut self) -> Option<Ipv4Addr> {
        // Routing lookup only; nothing is sent.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 80)).ok()?;
        match socket.local_addr().ok()?.ip() {
            std::net::IpAddr::V4(address) => Some(address),
            std::net::IpAddr::V6(_) => None,
        }
    }

    fn rssi(&mut self) -> Option<i8> {
        None
    }
}

/// The OS keeps the host clock synchronised; only sanity-check it.
struct HostClockCheck;

impl TimeSync for HostClockCheck {
    fn sync(&mut self) -> Result<(), TimeSyncError> {
        let year = Utc::now().year();
        if year >= 2024 {
            Ok(())
        } else {
            Err(TimeSyncError(format!("system clock not set (year {year})")))
        }
    }
}

#[derive(Default)]
struct LogIndicator {
    lit: bool,
}

impl Indicator for LogIndicator {
    fn set(&mut self, on: bool) {
        if on != self.lit {
            tracing::trace!("status led {}", if on { "on" } else { "off" });
            self.lit = on;
        }
    }

    fn start_pulse(&mut self, period_ms: u64) {
        debug!("status led pulsing every {period_ms} ms");
    }

    fn stop_pulse(&mut self) {
        debug!("status led pulse stopped");
    }
}
