use serde::Serialize;

use crate::protocol::{ACK_PREFIX, ECHO_PREFIX};

const STATUS_TAG: &str = "STATUS";
const TEMP_TAG: &str = "TEMP,";

/// Heater controller readings parsed from one exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub temperature: Option<f32>,
    pub setpoint: Option<f32>,
    pub duty_cycle: Option<i32>,
    pub state: String,
    #[serde(skip)]
    pub raw_line: String,
}

/// Legacy `STATUS,<id>,<temp>,<setpoint>,<duty>,<state>` lines win; otherwise
/// the last line is read as `<temp>,<duty>,<setpoint>`.
pub fn parse_status(lines: &[String]) -> Option<StatusSnapshot> {
    lines
        .iter()
        .find_map(|line| parse_legacy_status(line))
        .or_else(|| lines.last().and_then(|line| parse_csv_status(line)))
}

pub fn parse_temperature(lines: &[String]) -> Option<f32> {
    let line = lines.iter().find(|line| line.starts_with(TEMP_TAG))?;
    line.split(',').nth(1)?.trim().parse().ok()
}

fn parse_legacy_status(line: &str) -> Option<StatusSnapshot> {
    let body = line
        .strip_prefix(ECHO_PREFIX)
        .or_else(|| line.strip_prefix(ACK_PREFIX))
        .unwrap_or(line);
    let fields = body.strip_prefix(STATUS_TAG)?.strip_prefix(',')?;
    let fields: Vec<&str> = fields.split(',').map(str::trim).collect();

    // fields[0] is the controller's identifier slot.
    let [_, temperature, setpoint, duty_cycle, state, ..] = fields.as_slice() else {
        return None;
    };

    Some(StatusSnapshot {
        temperature: Some(temperature.parse().ok()?),
        setpoint: Some(setpoint.parse().ok()?),
        duty_cycle: Some(duty_cycle.parse().ok()?),
        state: (*state).to_string(),
        raw_line: line.to_string(),
    })
}

// Field order differs from the legacy line: temperature, duty, setpoint.
fn parse_csv_status(line: &str) -> Option<StatusSnapshot> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [temperature, duty_cycle, setpoint, ..] = fields.as_slice() else {
        return None;
    };

    Some(StatusSnapshot {
        temperature: Some(temperature.parse().ok()?),
        setpoint: Some(setpoint.parse().ok()?),
        duty_cycle: Some(duty_cycle.parse().ok()?),
        state: "unknown".to_string(),
        raw_line: line.to_string(),
    })
}
