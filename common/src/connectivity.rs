use std::net::Ipv4Addr;

use log::{debug, info, warn};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::NetworkConfig;
use crate::indicator::{blink, Indicator};

const READINESS_POLL_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    HardwareInitializing,
    Connecting,
    Connected,
    Failed,
}

/// Station status as reported by the radio driver. Codes the driver does not
/// document map to `Unknown` and carry no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    NotReady,
    Idle,
    Connecting,
    WrongPassword,
    NoApFound,
    GotIp,
    Unknown(i32),
}

#[derive(Debug, Error)]
#[error("radio: {0}")]
pub struct RadioError(pub String);

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("radio hardware not ready after {0} ms")]
    HardwareNotReady(u64),
    #[error("access point rejected the credentials")]
    WrongCredentials,
    #[error("no association after {0} attempts")]
    AttemptsExhausted(u32),
    #[error(transparent)]
    Radio(#[from] RadioError),
}

pub trait Radio {
    fn set_active(&mut self, active: bool) -> Result<(), RadioError>;
    fn is_active(&self) -> bool;
    fn status(&mut self) -> Result<RadioStatus, RadioError>;
    fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;
    fn is_connected(&mut self) -> bool;
    fn disconnect(&mut self) -> Result<(), RadioError>;
    fn address(&mut self) -> Option<Ipv4Addr>;
    fn rssi(&mut self) -> Option<i8>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub address: Option<Ipv4Addr>,
    pub rssi_dbm: Option<i8>,
}

enum AttemptOutcome {
    Associated,
    TimedOut,
    NetworkNotFound,
    WrongCredentials,
}

/// Owns the radio and its connection lifecycle.
pub struct ConnectivityManager<R, C> {
    radio: R,
    clock: C,
    config: NetworkConfig,
    state: ConnectionState,
    link: LinkInfo,
}

impl<R: Radio, C: Clock> ConnectivityManager<R, C> {
    pub fn new(radio: R, clock: C, config: NetworkConfig) -> Self {
        Self {
            radio,
            clock,
            config,
            state: ConnectionState::Idle,
            link: LinkInfo::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link(&self) -> LinkInfo {
        self.link
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// True while associated. A dropped link moves the manager to `Failed`.
    pub fn is_network_active(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        if self.radio.is_connected() {
            return true;
        }
        warn!("wifi link dropped");
        self.state = ConnectionState::Failed;
        self.link = LinkInfo::default();
        false
    }

    pub fn connect<I>(&mut self, indicator: &mut I) -> Result<LinkInfo, ConnectivityError>
    where
        I: Indicator + ?Sized,
    {
        info!("connecting to wifi network `{}`", self.config.wifi_ssid);
        self.state = ConnectionState::HardwareInitializing;
        if let Err(err) = self.wait_for_hardware(indicator) {
            self.state = ConnectionState::Failed;
            return Err(err);
        }

        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            if self.radio.is_connected() {
                return Ok(self.mark_connected());
            }

            self.state = ConnectionState::Connecting;
            info!("wifi attempt {attempt}/{attempts}");
            match self.attempt(indicator) {
                Ok(AttemptOutcome::Associated) => return Ok(self.mark_connected()),
                Ok(AttemptOutcome::WrongCredentials) => {
                    warn!("wifi rejected the password, giving up");
                    self.state = ConnectionState::Failed;
                    return Err(ConnectivityError::WrongCredentials);
                }
                Ok(AttemptOutcome::NetworkNotFound) => {
                    warn!("wifi attempt {attempt} failed: network not found")
                }
                Ok(AttemptOutcome::TimedOut) => {
                    warn!("wifi attempt {attempt} timed out ({:?})", self.radio.status().ok())
                }
                Err(err) => warn!("wifi attempt {attempt} failed: {err}"),
            }
            self.state = ConnectionState::Failed;

            if attempt < attempts {
                self.pause(indicator, self.config.retry_delay_ms);
            }
        }

        warn!("wifi connection failed after {attempts} attempts");
        Err(ConnectivityError::AttemptsExhausted(attempts))
    }

    /// Drops any association and powers the radio down. Safe to repeat.
    pub fn disconnect(&mut self) -> Result<(), ConnectivityError> {
        if self.radio.is_connected() {
            self.radio.disconnect()?;
        }
        if self.radio.is_active() {
            self.radio.set_active(false)?;
        }
        if self.state != ConnectionState::Idle {
            info!("wifi disabled, power saving");
        }
        self.state = ConnectionState::Idle;
        self.link = LinkInfo::default();
        Ok(())
    }

    fn wait_for_hardware<I>(&mut self, indicator: &mut I) -> Result<(), ConnectivityError>
    where
        I: Indicator + ?Sized,
    {
        if !self.radio.is_active() {
            self.radio.set_active(true)?;
        }

        let started = self.clock.monotonic_ms();
        let limit = self.config.hardware_ready_timeout_ms;
        while self.clock.elapsed_since(started) < limit {
            match self.radio.status() {
                Ok(RadioStatus::NotReady) => {}
                Ok(status) => {
                    debug!(
                        "wifi hardware ready after {} ms ({status:?})",
                        self.clock.elapsed_since(started)
                    );
                    return Ok(());
                }
                Err(err) => debug!("wifi readiness poll failed: {err}"),
            }
            blink(indicator, &self.clock);
            self.clock.sleep_ms(READINESS_POLL_MS);
        }

        warn!("wifi hardware not ready after {limit} ms");
        Err(ConnectivityError::HardwareNotReady(limit))
    }

    fn attempt<I>(&mut self, indicator: &mut I) -> Result<AttemptOutcome, RadioError>
    where
        I: Indicator + ?Sized,
    {
        // Associating mid-transition leaves some drivers wedged.
        if !matches!(self.radio.status(), Ok(RadioStatus::Idle)) {
            if let Err(err) = self.radio.disconnect() {
                debug!("pre-attempt disconnect failed: {err}");
            }
            self.clock.sleep_ms(self.config.disconnect_settle_ms);
        }

        self.radio
            .begin_connect(&self.config.wifi_ssid, &self.config.wifi_pass)?;

        let started = self.clock.monotonic_ms();
        while self.clock.elapsed_since(started) < self.config.attempt_timeout_ms {
            if self.radio.is_connected() {
                return Ok(AttemptOutcome::Associated);
            }
            match self.radio.status() {
                Ok(RadioStatus::WrongPassword) => return Ok(AttemptOutcome::WrongCredentials),
                Ok(RadioStatus::NoApFound) => return Ok(AttemptOutcome::NetworkNotFound),
                _ => {}
            }
            blink(indicator, &self.clock);
        }

        if self.radio.is_connected() {
            Ok(AttemptOutcome::Associated)
        } else {
            Ok(AttemptOutcome::TimedOut)
        }
    }

    fn pause<I>(&self, indicator: &mut I, ms: u64)
    where
        I: Indicator + ?Sized,
    {
        let started = self.clock.monotonic_ms();
        while self.clock.elapsed_since(started) < ms {
            blink(indicator, &self.clock);
        }
    }

    fn mark_connected(&mut self) -> LinkInfo {
        self.state = ConnectionState::Connected;
        self.link = LinkInfo {
            address: self.radio.address(),
            rssi_dbm: self.radio.rssi(),
        };
        match (self.link.address, self.link.rssi_dbm) {
            (Some(address), Some(rssi)) => info!("wifi connected, ip {address}, rssi {rssi} dBm"),
            (Some(address), None) => info!("wifi connected, ip {address}"),
            _ => info!("wifi connected"),
        }
        self.link
    }
}
