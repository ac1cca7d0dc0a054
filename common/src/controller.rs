use std::convert::Infallible;

use log::{info, warn};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::{ControllerConfig, LoopConfig};
use crate::connectivity::{ConnectivityError, ConnectivityManager, Radio};
use crate::indicator::{heartbeat, Indicator};
use crate::protocol::{ExchangeOptions, ProtocolClient, SerialTransport};
use crate::schedule::{NetworkSchedule, ScheduleDecision};
use crate::server::{Binder, ControlServer, ServeSummary};

#[derive(Debug, Error)]
#[error("time sync: {0}")]
pub struct TimeSyncError(pub String);

/// Sets the wall clock from a network source. Requires an open connection.
pub trait TimeSync {
    fn sync(&mut self) -> Result<(), TimeSyncError>;
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("radio power-down failed: {0}")]
    Radio(#[from] ConnectivityError),
}

/// Platform parts handed to the controller.
pub struct Board<R, T, B, S, I> {
    pub radio: R,
    pub serial: T,
    pub binder: B,
    pub time_sync: S,
    pub indicator: I,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Wall clock still unknown; the schedule was not evaluated.
    TimeUnsynced,
    /// A serving session ran to completion and the radio was powered down.
    Served(ServeSummary),
    /// The serving session ended on a bind or accept failure.
    ServerFailed,
    PoweredDown,
    Steady,
}

pub struct Controller<R, T, B, S, I, C> {
    settings: LoopConfig,
    schedule: NetworkSchedule,
    clock: C,
    wifi: ConnectivityManager<R, C>,
    client: ProtocolClient<T, C>,
    server: ControlServer<B>,
    time_sync: S,
    indicator: I,
    time_synced: bool,
    last_sync_ms: u64,
    last_decision: Option<bool>,
}

impl<R, T, B, S, I, C> Controller<R, T, B, S, I, C>
where
    R: Radio,
    T: SerialTransport,
    B: Binder,
    S: TimeSync,
    I: Indicator,
    C: Clock + Clone,
{
    pub fn new(
        mut config: ControllerConfig,
        board: Board<R, T, B, S, I>,
        clock: C,
        index_html: &'static [u8],
    ) -> Self {
        config.sanitize();
        let options = ExchangeOptions::from(&config.serial);

        Self {
            schedule: NetworkSchedule::from_config(&config.schedule),
            wifi: ConnectivityManager::new(board.radio, clock.clone(), config.network),
            client: ProtocolClient::new(board.serial, clock.clone(), options),
            server: ControlServer::new(board.binder, config.server, index_html),
            settings: config.control,
            time_sync: board.time_sync,
            indicator: board.indicator,
            clock,
            time_synced: false,
            last_sync_ms: 0,
            last_decision: None,
        }
    }

    pub fn is_time_synced(&self) -> bool {
        self.time_synced
    }

    pub fn connectivity(&self) -> &ConnectivityManager<R, C> {
        &self.wifi
    }

    pub fn protocol_mut(&mut self) -> &mut ProtocolClient<T, C> {
        &mut self.client
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    /// Boots, then runs the tick loop forever. Only a boot fault returns.
    pub fn run(&mut self) -> Result<Infallible, ControllerError> {
        self.boot()?;
        loop {
            self.idle_until_next_tick();
            self.tick();
        }
    }

    pub fn boot(&mut self) -> Result<(), ControllerError> {
        let window = self.schedule.window;
        info!(
            "booting, network window {:02}:00-{:02}:00 local",
            window.start_hour, window.end_hour
        );

        self.indicator.set(true);
        self.clock.sleep_ms(self.settings.boot_delay_ms);
        self.indicator.set(false);

        if self.connect_and_sync() {
            let decision = self.decide();
            if decision.active && self.wifi.is_network_active() {
                info!("inside the network window, serving now");
                self.serve_session();
            }
        } else {
            warn!("initial time sync failed, retrying every tick");
        }

        self.wifi.disconnect()?;
        Ok(())
    }

    pub fn tick(&mut self) -> TickOutcome {
        if self.time_synced && self.resync_due() {
            self.resync();
        }

        if !self.time_synced {
            info!("retrying time sync");
            let synced = self.connect_and_sync();
            self.power_down();
            if !synced {
                return TickOutcome::TimeUnsynced;
            }
        }

        let decision = self.decide();
        let connected = self.wifi.is_network_active();

        if decision.active && !connected {
            if let Err(err) = self.wifi.connect(&mut self.indicator) {
                warn!("could not enter the network window: {err}");
                self.power_down();
                return TickOutcome::PoweredDown;
            }
            return self.serve_session();
        }

        // Only reached when an earlier power-down failed and left the link up.
        if !decision.active && connected {
            info!("leaving the network window, disabling wifi");
            self.power_down();
            return TickOutcome::PoweredDown;
        }

        TickOutcome::Steady
    }

    /// Sleeps one tick interval, in heartbeat flashes while the radio is off.
    pub fn idle_until_next_tick(&mut self) {
        let started = self.clock.monotonic_ms();
        let interval = self.settings.tick_interval_ms;

        if self.wifi.is_network_active() {
            self.clock.sleep_ms(interval);
            return;
        }
        while self.clock.elapsed_since(started) < interval {
            let remaining = interval - self.clock.elapsed_since(started);
            heartbeat(&mut self.indicator, &self.clock, remaining);
        }
    }

    fn decide(&mut self) -> ScheduleDecision {
        let now = self.clock.utc_now();
        let decision = self.schedule.decide(now);
        let label = self.schedule.timezone.local_time_label(now);

        if self.last_decision != Some(decision.active) {
            info!(
                "[{label}] network should be {}",
                if decision.active { "on" } else { "off" }
            );
            self.last_decision = Some(decision.active);
        }
        decision
    }

    fn resync_due(&self) -> bool {
        self.clock.elapsed_since(self.last_sync_ms) >= self.settings.time_sync_interval_ms
    }

    fn resync(&mut self) {
        info!("periodic time resync");
        if self.wifi.is_network_active() {
            self.sync_time();
            return;
        }
        match self.wifi.connect(&mut self.indicator) {
            Ok(_) => {
                self.sync_time();
            }
            Err(err) => warn!("resync skipped, no connection: {err}"),
        }
        self.power_down();
    }

    fn connect_and_sync(&mut self) -> bool {
        if !self.wifi.is_network_active() {
            if let Err(err) = self.wifi.connect(&mut self.indicator) {
                warn!("wifi unavailable for time sync: {err}");
                return false;
            }
        }
        self.sync_time()
    }

    fn sync_time(&mut self) -> bool {
        let attempts = self.settings.time_sync_attempts;
        for attempt in 1..=attempts {
            match self.time_sync.sync() {
                Ok(()) => {
                    self.time_synced = true;
                    self.last_sync_ms = self.clock.monotonic_ms();
                    let now = self.clock.utc_now();
                    let timezone = &self.schedule.timezone;
                    info!(
                        "time synced: {} {}, dst {}, offset UTC{:+}",
                        now.format("%Y-%m-%d"),
                        timezone.local_time_label(now),
                        timezone.is_dst(now),
                        timezone.effective_offset(now)
                    );
                    return true;
                }
                Err(err) => warn!("time sync attempt {attempt}/{attempts} failed: {err}"),
            }
            if attempt < attempts {
                self.clock.sleep_ms(self.settings.time_sync_retry_delay_ms);
            }
        }
        false
    }

    fn serve_session(&mut self) -> TickOutcome {
        let Self {
            server,
            client,
            wifi,
            schedule,
            clock,
            indicator,
            ..
        } = self;

        let result = server.serve(client, indicator, || {
            schedule.is_active(clock.utc_now()) && wifi.is_network_active()
        });
        self.power_down();

        match result {
            Ok(summary) => TickOutcome::Served(summary),
            Err(_) => TickOutcome::ServerFailed,
        }
    }

    fn power_down(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("radio power-down failed: {err}");
        }
    }
}
