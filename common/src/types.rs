use serde::Serialize;

use crate::protocol::CommandExchange;
use crate::response::StatusSnapshot;

/// Body of `GET /status`. Missing readings render as zeros, never as an
/// HTTP error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPayload {
    pub temperature: Option<f32>,
    pub setpoint: f32,
    pub duty_cycle: i32,
    pub state: String,
}

impl StatusPayload {
    pub fn unknown() -> Self {
        Self {
            temperature: None,
            setpoint: 0.0,
            duty_cycle: 0,
            state: "unknown".to_string(),
        }
    }
}

impl From<Option<&StatusSnapshot>> for StatusPayload {
    fn from(status: Option<&StatusSnapshot>) -> Self {
        match status {
            Some(status) => Self {
                temperature: status.temperature,
                setpoint: status.setpoint.unwrap_or(0.0),
                duty_cycle: status.duty_cycle.unwrap_or(0),
                state: status.state.clone(),
            },
            None => Self::unknown(),
        }
    }
}

/// Body of `POST /cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReply {
    pub success: bool,
    pub response: Vec<String>,
}

impl From<CommandExchange> for CommandReply {
    fn from(exchange: CommandExchange) -> Self {
        Self {
            success: exchange.success,
            response: exchange.response_lines,
        }
    }
}
