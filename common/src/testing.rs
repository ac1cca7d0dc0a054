use std::{cell::Cell, collections::VecDeque, rc::Rc};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::clock::Clock;
use crate::protocol::{SerialTransport, TransportError};

/// Clock whose sleeps advance time instantly. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap())
    }

    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            now_ms: Rc::new(Cell::new(0)),
            epoch,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms);
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms.max(1));
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.epoch + Duration::milliseconds(self.now_ms.get() as i64)
    }
}

/// Serial double: each write releases the next scripted reply batch.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    input: VecDeque<Vec<u8>>,
    replies: VecDeque<Vec<Vec<u8>>>,
    written: Vec<u8>,
    write_limit: Option<usize>,
    discarded_lines: usize,
    lines_read: usize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preload(&mut self, lines: &[&str]) {
        self.input
            .extend(lines.iter().map(|line| line.as_bytes().to_vec()));
    }

    pub fn reply_with(&mut self, lines: &[&str]) {
        self.replies
            .push_back(lines.iter().map(|line| line.as_bytes().to_vec()).collect());
    }

    pub fn reply_with_bytes(&mut self, lines: Vec<Vec<u8>>) {
        self.replies.push_back(lines);
    }

    pub fn limit_writes(&mut self, limit: usize) {
        self.write_limit = Some(limit);
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }

    pub fn discarded(&self) -> usize {
        self.discarded_lines
    }

    pub fn lines_read(&self) -> usize {
        self.lines_read
    }
}

impl SerialTransport for ScriptedTransport {
    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        Ok(self.input.iter().map(|line| line.len() + 1).sum())
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let bytes = self.bytes_available()?;
        self.discarded_lines += self.input.len();
        self.input.clear();
        Ok(bytes)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let accepted = self.write_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
        self.written.extend_from_slice(&bytes[..accepted]);
        if let Some(batch) = self.replies.pop_front() {
            self.input.extend(batch);
        }
        Ok(accepted)
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let line = self.input.pop_front();
        if line.is_some() {
            self.lines_read += 1;
        }
        Ok(line)
    }
}
