pub mod clock;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod indicator;
pub mod protocol;
pub mod response;
pub mod schedule;
pub mod server;
pub mod types;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use commands::{CommandParseError, HeaterCommand};
pub use config::{
    ControllerConfig, LoopConfig, NetworkConfig, ScheduleConfig, SerialConfig, ServerConfig,
    TimezoneConfig,
};
pub use connectivity::{
    ConnectionState, ConnectivityError, ConnectivityManager, LinkInfo, Radio, RadioError,
    RadioStatus,
};
pub use controller::{Board, Controller, ControllerError, TickOutcome, TimeSync, TimeSyncError};
pub use indicator::Indicator;
pub use protocol::{
    CommandExchange, ExchangeOptions, ProtocolClient, ProtocolError, SerialTransport,
    TransportError,
};
pub use response::StatusSnapshot;
pub use schedule::{NetworkSchedule, ScheduleDecision, TimeWindow, TimezoneRule};
pub use server::{Binder, ControlServer, Listener, ServeSummary, ServerError, TcpBinder};
pub use types::{CommandReply, StatusPayload};
