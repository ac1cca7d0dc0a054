use serde::{Deserialize, Serialize};

use crate::schedule::TimeWindow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimezoneConfig {
    pub base_utc_offset_hours: i32,
    pub observe_dst: bool,
    pub standard_abbrev: String,
    pub daylight_abbrev: String,
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self {
            base_utc_offset_hours: -8,
            observe_dst: true,
            standard_abbrev: "PST".to_string(),
            daylight_abbrev: "PDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub window: TimeWindow,
    pub timezone: TimezoneConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub connect_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub hardware_ready_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub disconnect_settle_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            connect_attempts: 10,
            attempt_timeout_ms: 10_000,
            hardware_ready_timeout_ms: 30_000,
            retry_delay_ms: 3_000,
            disconnect_settle_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub tx_pin: i32,
    pub rx_pin: i32,
    pub rx_buffer_bytes: usize,
    pub read_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            tx_pin: 16,
            rx_pin: 17,
            rx_buffer_bytes: 1024,
            read_timeout_ms: 100,
            command_timeout_ms: 2_000,
            settle_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub accept_timeout_ms: u64,
    pub client_timeout_ms: u64,
    pub max_request_bytes: usize,
    pub chunk_size: usize,
    pub pulse_period_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 80,
            accept_timeout_ms: 10_000,
            client_timeout_ms: 10_000,
            max_request_bytes: 2_048,
            chunk_size: 512,
            pulse_period_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub boot_delay_ms: u64,
    pub tick_interval_ms: u64,
    pub time_sync_interval_ms: u64,
    pub time_sync_attempts: u32,
    pub time_sync_retry_delay_ms: u64,
    pub status_led_pin: i32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: 3_000,
            tick_interval_ms: 60_000,
            time_sync_interval_ms: 3_600_000,
            time_sync_attempts: 3,
            time_sync_retry_delay_ms: 2_000,
            status_led_pin: 15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub schedule: ScheduleConfig,
    pub network: NetworkConfig,
    pub serial: SerialConfig,
    pub server: ServerConfig,
    #[serde(rename = "loop")]
    pub control: LoopConfig,
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.schedule.window.sanitize();
        self.schedule.timezone.base_utc_offset_hours =
            self.schedule.timezone.base_utc_offset_hours.clamp(-12, 14);
        self.network.sanitize();
        self.serial.sanitize();
        self.server.sanitize();
        self.control.sanitize();
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.connect_attempts = self.connect_attempts.max(1);
        self.attempt_timeout_ms = self.attempt_timeout_ms.max(1_000);
        self.hardware_ready_timeout_ms = self.hardware_ready_timeout_ms.max(1_000);
    }

    pub fn has_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }
}

impl SerialConfig {
    pub fn sanitize(&mut self) {
        if self.baud_rate == 0 {
            self.baud_rate = 115_200;
        }
        self.rx_buffer_bytes = self.rx_buffer_bytes.max(256);
        self.command_timeout_ms = self.command_timeout_ms.max(100);
    }
}

impl ServerConfig {
    pub fn sanitize(&mut self) {
        self.accept_timeout_ms = self.accept_timeout_ms.max(100);
        self.client_timeout_ms = self.client_timeout_ms.max(100);
        self.max_request_bytes = self.max_request_bytes.max(256);
        self.chunk_size = self.chunk_size.clamp(64, 4_096);
        self.pulse_period_ms = self.pulse_period_ms.max(100);
    }
}

impl LoopConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.max(1_000);
        self.time_sync_interval_ms = self.time_sync_interval_ms.max(self.tick_interval_ms);
        self.time_sync_attempts = self.time_sync_attempts.max(1);
    }
}
