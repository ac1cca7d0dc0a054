use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    delay::TickType,
    gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver},
    uart::{config::Config as UartConfig, UartDriver, UART1},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    sntp::{EspSntp, SyncStatus},
    timer::{EspTaskTimerService, EspTimer},
    wifi::EspWifi,
};
use log::{error, info, warn};

use espresso_common::{
    config::{NetworkConfig, SerialConfig},
    indicator, Board, Controller, ControllerConfig, Indicator, Radio, RadioError, RadioStatus,
    SerialTransport, SystemClock, TcpBinder, TimeSync, TimeSyncError, TransportError,
};

const INDEX_HTML: &[u8] = include_bytes!("../web/index.html");
const SNTP_WAIT_MS: u64 = 15_000;
const SNTP_POLL_MS: u64 = 100;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = build_config();
    let mut fault_led = StatusLed::new(config.control.status_led_pin);

    if let Err(err) = start(config, fault_led.clone()) {
        error!("fatal startup fault: {err:#}");
        indicator::fault(&mut fault_led, &SystemClock::new());
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
    Ok(())
}

fn build_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    config.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    config.sanitize();

    if !config.network.has_credentials() {
        warn!("WIFI_SSID was not set at build time; the radio will never associate");
    }
    config
}

fn start(config: ControllerConfig, led: StatusLed) -> anyhow::Result<()> {
    mark_running_slot_valid();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, uart1, .. } = Peripherals::take()?;

    let serial = UartTransport::new(uart1, &config.serial).context("failed to start UART1")?;
    info!(
        "UART1 ready on TX GPIO{} / RX GPIO{} @ {} baud",
        config.serial.tx_pin, config.serial.rx_pin, config.serial.baud_rate
    );

    let radio = EspRadio::new(modem, sys_loop, nvs_partition, &config.network)
        .context("failed to create wifi driver")?;

    let clock = SystemClock::new();
    let board = Board {
        radio,
        serial,
        binder: TcpBinder::new(clock, config.server.client_timeout_ms),
        time_sync: SntpSync::default(),
        indicator: led,
    };

    let mut controller = Controller::new(config, board, clock, INDEX_HTML);
    match controller.run() {
        Ok(never) => match never {},
        Err(err) => Err(err).context("controller boot failed"),
    }
}

fn mark_running_slot_valid() {
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }
}

struct UartTransport {
    uart: UartDriver<'static>,
    pending: Vec<u8>,
    read_timeout: u32,
}

impl UartTransport {
    fn new(uart1: UART1, config: &SerialConfig) -> anyhow::Result<Self> {
        let uart_config = UartConfig::default()
            .baudrate(Hertz(config.baud_rate))
            .rx_fifo_size(config.rx_buffer_bytes);
        let tx = unsafe { AnyIOPin::new(config.tx_pin) };
        let rx = unsafe { AnyIOPin::new(config.rx_pin) };
        let uart = UartDriver::new(
            uart1,
            tx,
            rx,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &uart_config,
        )?;

        Ok(Self {
            uart,
            pending: Vec::with_capacity(config.rx_buffer_bytes),
            read_timeout: TickType::new_millis(config.read_timeout_ms).ticks(),
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

fn uart_error(err: esp_idf_svc::sys::EspError) -> TransportError {
    TransportError::Driver(err.to_string())
}

impl SerialTransport for UartTransport {
    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        let queued = self.uart.remaining_read().map_err(uart_error)?;
        Ok(queued + self.pending.len())
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let dropped = self.bytes_available()?;
        self.pending.clear();
        self.uart.clear_rx().map_err(uart_error)?;
        Ok(dropped)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.uart.write(bytes).map_err(uart_error)
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let mut chunk = [0u8; 128];
        let read = self
            .uart
            .read(&mut chunk, self.read_timeout)
            .map_err(uart_error)?;
        self.pending.extend_from_slice(&chunk[..read]);
        Ok(self.take_line())
    }
}

/// Station-mode radio. esp-idf-svc reports association state but not the
/// disconnect reason, so wrong-password and no-AP statuses never surface.
struct EspRadio {
    wifi: EspWifi<'static>,
    connecting: bool,
}

impl EspRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
        wifi.set_configuration(&client_configuration(network)?)?;
        Ok(Self {
            wifi,
            connecting: false,
        })
    }

    fn link_up(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }
}

fn client_configuration(network: &NetworkConfig) -> anyhow::Result<Configuration> {
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Ok(Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))
}

fn radio_error(err: esp_idf_svc::sys::EspError) -> RadioError {
    RadioError(err.to_string())
}

impl Radio for EspRadio {
    fn set_active(&mut self, active: bool) -> Result<(), RadioError> {
        if active {
            self.wifi.start().map_err(radio_error)
        } else {
            self.connecting = false;
            self.wifi.stop().map_err(radio_error)
        }
    }

    fn is_active(&self) -> bool {
        self.wifi.is_started().unwrap_or(false)
    }

    fn status(&mut self) -> Result<RadioStatus, RadioError> {
        if !self.wifi.is_started().map_err(radio_error)? {
            return Ok(RadioStatus::NotReady);
        }
        Ok(if self.link_up() {
            RadioStatus::GotIp
        } else if self.connecting {
            RadioStatus::Connecting
        } else {
            RadioStatus::Idle
        })
    }

    fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        let network = NetworkConfig {
            wifi_ssid: ssid.to_string(),
            wifi_pass: password.to_string(),
            ..NetworkConfig::default()
        };
        let configuration =
            client_configuration(&network).map_err(|err| RadioError(err.to_string()))?;
        self.wifi
            .set_configuration(&configuration)
            .map_err(radio_error)?;
        self.wifi.connect().map_err(radio_error)?;
        self.connecting = true;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.link_up()
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.connecting = false;
        self.wifi.disconnect().map_err(radio_error)
    }

    fn address(&mut self) -> Option<Ipv4Addr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }

    fn rssi(&mut self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }
}

/// SNTP client started on first use and kept for the process lifetime.
#[derive(Default)]
struct SntpSync {
    sntp: Option<EspSntp<'static>>,
}

impl TimeSync for SntpSync {
    fn sync(&mut self) -> Result<(), TimeSyncError> {
        if self.sntp.is_none() {
            let sntp = EspSntp::new_default().map_err(|err| TimeSyncError(err.to_string()))?;
            self.sntp = Some(sntp);
        }
        let Some(sntp) = self.sntp.as_ref() else {
            return Err(TimeSyncError("sntp unavailable".to_string()));
        };

        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(SNTP_WAIT_MS) {
            if sntp.get_sync_status() == SyncStatus::Completed {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(SNTP_POLL_MS));
        }
        Err(TimeSyncError(format!("no sntp reply within {SNTP_WAIT_MS} ms")))
    }
}

type LedPin = PinDriver<'static, AnyOutputPin, Output>;

/// Status LED; the pulse toggles it from the task timer service.
#[derive(Clone)]
struct StatusLed {
    pin: Option<Arc<Mutex<LedPin>>>,
    timers: Option<EspTaskTimerService>,
    pulse: Option<Arc<EspTimer<'static>>>,
}

impl StatusLed {
    fn new(gpio: i32) -> Self {
        let pin = match unsafe { PinDriver::output(AnyOutputPin::new(gpio)) } {
            Ok(mut pin) => {
                let _ = pin.set_low();
                Some(Arc::new(Mutex::new(pin)))
            }
            Err(err) => {
                warn!("status LED unavailable on GPIO{gpio}: {err}");
                None
            }
        };
        let timers = match EspTaskTimerService::new() {
            Ok(service) => Some(service),
            Err(err) => {
                warn!("timer service unavailable, LED pulse disabled: {err}");
                None
            }
        };
        Self {
            pin,
            timers,
            pulse: None,
        }
    }
}

impl Indicator for StatusLed {
    fn set(&mut self, on: bool) {
        let Some(pin) = self.pin.as_ref() else {
            return;
        };
        let Ok(mut pin) = pin.lock() else {
            return;
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        }
    }

    fn start_pulse(&mut self, period_ms: u64) {
        let (Some(pin), Some(timers)) = (self.pin.clone(), self.timers.as_ref()) else {
            return;
        };
        let timer = timers.timer(move || {
            if let Ok(mut pin) = pin.lock() {
                let _ = pin.toggle();
            }
        });
        match timer {
            Ok(timer) => match timer.every(Duration::from_millis(period_ms)) {
                Ok(()) => self.pulse = Some(Arc::new(timer)),
                Err(err) => warn!("failed to schedule LED pulse: {err}"),
            },
            Err(err) => warn!("failed to create LED pulse timer: {err}"),
        }
    }

    fn stop_pulse(&mut self) {
        if let Some(timer) = self.pulse.take() {
            let _ = timer.cancel();
        }
    }
}
