#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io::{self, Cursor, Read, Write},
    net::Ipv4Addr,
    rc::Rc,
};

use chrono::{DateTime, Duration, Utc};
use espresso_common::{
    Binder, Clock, Indicator, Listener, Radio, RadioError, RadioStatus, SerialTransport,
    TimeSync, TimeSyncError, TransportError,
};

#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            now_ms: Rc::new(Cell::new(0)),
            epoch,
        }
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms.max(1));
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.epoch + Duration::milliseconds(self.now_ms.get() as i64)
    }
}

/// Station radio that associates on the first poll unless told otherwise.
#[derive(Debug, Default)]
pub struct FakeRadio {
    pub active: bool,
    pub connected: bool,
    pub reject_password: bool,
    pub connect_calls: u32,
    pub disconnect_calls: u32,
    /// Disconnects refused before the radio lets go of the link.
    pub refused_disconnects: Rc<Cell<u32>>,
}

impl Radio for FakeRadio {
    fn set_active(&mut self, active: bool) -> Result<(), RadioError> {
        self.active = active;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn status(&mut self) -> Result<RadioStatus, RadioError> {
        if !self.active {
            return Ok(RadioStatus::NotReady);
        }
        Ok(match (self.connected, self.reject_password, self.connect_calls) {
            (true, _, _) => RadioStatus::GotIp,
            (false, true, calls) if calls > 0 => RadioStatus::WrongPassword,
            _ => RadioStatus::Idle,
        })
    }

    fn begin_connect(&mut self, _ssid: &str, _password: &str) -> Result<(), RadioError> {
        self.connect_calls += 1;
        self.connected = !self.reject_password;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.disconnect_calls += 1;
        let refused = self.refused_disconnects.get();
        if refused > 0 {
            self.refused_disconnects.set(refused - 1);
            return Err(RadioError("driver busy".to_string()));
        }
        self.connected = false;
        Ok(())
    }

    fn address(&mut self) -> Option<Ipv4Addr> {
        self.connected.then_some(Ipv4Addr::new(192, 168, 4, 2))
    }

    fn rssi(&mut self) -> Option<i8> {
        None
    }
}

/// Heater controller that answers every command on the next write.
#[derive(Debug, Default)]
pub struct HeaterLink {
    input: VecDeque<String>,
    pub commands: Vec<String>,
}

impl SerialTransport for HeaterLink {
    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        Ok(self.input.iter().map(|line| line.len() + 1).sum())
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let bytes = self.bytes_available()?;
        self.input.clear();
        Ok(bytes)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let command = String::from_utf8_lossy(bytes).trim().to_string();
        self.input.push_back("T,91.2,0".to_string());
        if command == "status" {
            self.input
                .push_back(">>STATUS,1,93.4,108.0,42,heating".to_string());
        }
        self.input.push_back("<<OK".to_string());
        self.commands.push(command);
        Ok(bytes.len())
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.input.pop_front().map(String::into_bytes))
    }
}

/// Client connection whose response stays readable after the server drops it.
pub struct RecordedStream {
    input: Cursor<Vec<u8>>,
    output: Rc<RefCell<Vec<u8>>>,
}

impl Read for RecordedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for RecordedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PlannedRequest {
    at_ms: u64,
    request: String,
    output: Rc<RefCell<Vec<u8>>>,
}

/// Listener fed by requests planned at fixed monotonic times.
#[derive(Clone)]
pub struct PlannedClients {
    clock: ManualClock,
    planned: Rc<RefCell<VecDeque<PlannedRequest>>>,
    pub binds: Rc<Cell<u32>>,
}

impl PlannedClients {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            planned: Rc::default(),
            binds: Rc::default(),
        }
    }

    /// Queues a request and returns the buffer its response will land in.
    pub fn plan(&self, at_ms: u64, request: &str) -> Rc<RefCell<Vec<u8>>> {
        let output = Rc::new(RefCell::new(Vec::new()));
        self.planned.borrow_mut().push_back(PlannedRequest {
            at_ms,
            request: request.to_string(),
            output: output.clone(),
        });
        output
    }
}

impl Binder for PlannedClients {
    type Listener = PlannedClients;

    fn bind(&mut self, _port: u16) -> io::Result<PlannedClients> {
        self.binds.set(self.binds.get() + 1);
        Ok(self.clone())
    }
}

impl Listener for PlannedClients {
    type Stream = RecordedStream;

    fn accept(&mut self, timeout_ms: u64) -> io::Result<Option<(RecordedStream, String)>> {
        let now = self.clock.monotonic_ms();
        let due = self
            .planned
            .borrow()
            .front()
            .is_some_and(|next| next.at_ms <= now);

        if due {
            if let Some(next) = self.planned.borrow_mut().pop_front() {
                let stream = RecordedStream {
                    input: Cursor::new(next.request.into_bytes()),
                    output: next.output,
                };
                return Ok(Some((stream, "192.168.4.10:50123".to_string())));
            }
        }

        self.clock.sleep_ms(timeout_ms);
        Ok(None)
    }
}

/// Network time source failing a fixed number of times first.
#[derive(Clone, Default)]
pub struct CountingTimeSync {
    pub calls: Rc<Cell<u32>>,
    pub failures_left: Rc<Cell<u32>>,
}

impl TimeSync for CountingTimeSync {
    fn sync(&mut self) -> Result<(), TimeSyncError> {
        self.calls.set(self.calls.get() + 1);
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            return Err(TimeSyncError("ntp timeout".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LedLog {
    pub pulses_started: u32,
    pub pulses_stopped: u32,
    pub lit: bool,
}

impl Indicator for LedLog {
    fn set(&mut self, on: bool) {
        self.lit = on;
    }

    fn start_pulse(&mut self, _period_ms: u64) {
        self.pulses_started += 1;
    }

    fn stop_pulse(&mut self) {
        self.pulses_stopped += 1;
    }
}

pub fn body_of(response: &[u8]) -> String {
    let text = String::from_utf8_lossy(response);
    text.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}
