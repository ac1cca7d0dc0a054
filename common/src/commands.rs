use std::{fmt, str::FromStr};

use thiserror::Error;

pub const DEFAULT_COFFEE_TEMP_C: f32 = 108.0;
pub const DEFAULT_STEAM_TEMP_C: f32 = 145.0;

/// Commands understood by the heater controller's serial CLI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeaterCommand {
    RegulateCoffee(Option<f32>),
    RegulateSteam(Option<f32>),
    RegulationOn,
    RegulationOff,
    HeaterOn,
    HeaterOff,
    Status,
}

impl HeaterCommand {
    /// Setpoint the controller will apply, with the firmware defaults filled in.
    pub fn target_temp_c(&self) -> Option<f32> {
        match self {
            Self::RegulateCoffee(temp) => Some(temp.unwrap_or(DEFAULT_COFFEE_TEMP_C)),
            Self::RegulateSteam(temp) => Some(temp.unwrap_or(DEFAULT_STEAM_TEMP_C)),
            _ => None,
        }
    }
}

impl fmt::Display for HeaterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegulateCoffee(None) => f.write_str("reg coffee"),
            Self::RegulateCoffee(Some(temp)) => write!(f, "reg coffee {temp}"),
            Self::RegulateSteam(None) => f.write_str("reg steam"),
            Self::RegulateSteam(Some(temp)) => write!(f, "reg steam {temp}"),
            Self::RegulationOn => f.write_str("reg on"),
            Self::RegulationOff => f.write_str("reg off"),
            Self::HeaterOn => f.write_str("heater on"),
            Self::HeaterOff => f.write_str("heater off"),
            Self::Status => f.write_str("status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("invalid temperature `{0}`")]
    InvalidTemperature(String),
}

impl FromStr for HeaterCommand {
    type Err = CommandParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lowered = raw.trim().to_ascii_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();

        match words.as_slice() {
            [] => Err(CommandParseError::Empty),
            ["status"] => Ok(Self::Status),
            ["reg", "on"] => Ok(Self::RegulationOn),
            ["reg", "off"] => Ok(Self::RegulationOff),
            ["heater", "on"] => Ok(Self::HeaterOn),
            ["heater", "off"] => Ok(Self::HeaterOff),
            ["reg", "coffee"] => Ok(Self::RegulateCoffee(None)),
            ["reg", "coffee", temp] => parse_temp(temp).map(|t| Self::RegulateCoffee(Some(t))),
            ["reg", "steam"] => Ok(Self::RegulateSteam(None)),
            ["reg", "steam", temp] => parse_temp(temp).map(|t| Self::RegulateSteam(Some(t))),
            _ => Err(CommandParseError::Unknown(raw.trim().to_string())),
        }
    }
}

fn parse_temp(raw: &str) -> Result<f32, CommandParseError> {
    raw.parse::<f32>()
        .ok()
        .filter(|temp| temp.is_finite())
        .ok_or_else(|| CommandParseError::InvalidTemperature(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vocabulary() {
        assert_eq!("status".parse::<HeaterCommand>(), Ok(HeaterCommand::Status));
        assert_eq!(" Reg ON ".parse::<HeaterCommand>(), Ok(HeaterCommand::RegulationOn));
        assert_eq!("heater off".parse::<HeaterCommand>(), Ok(HeaterCommand::HeaterOff));
        assert_eq!(
            "reg coffee 107".parse::<HeaterCommand>(),
            Ok(HeaterCommand::RegulateCoffee(Some(107.0)))
        );
        assert_eq!(
            "reg steam".parse::<HeaterCommand>(),
            Ok(HeaterCommand::RegulateSteam(None))
        );
    }

    #[test]
    fn rejects_unknown_and_bad_temperatures() {
        assert_eq!("".parse::<HeaterCommand>(), Err(CommandParseError::Empty));
        assert_eq!(
            "reg coffee hot".parse::<HeaterCommand>(),
            Err(CommandParseError::InvalidTemperature("hot".to_string()))
        );
        assert!(matches!(
            "pump on".parse::<HeaterCommand>(),
            Err(CommandParseError::Unknown(_))
        ));
    }

    #[test]
    fn applies_default_setpoints() {
        assert_eq!(HeaterCommand::RegulateCoffee(None).target_temp_c(), Some(108.0));
        assert_eq!(HeaterCommand::RegulateSteam(None).target_temp_c(), Some(145.0));
        assert_eq!(
            HeaterCommand::RegulateSteam(Some(150.5)).target_temp_c(),
            Some(150.5)
        );
        assert_eq!(HeaterCommand::HeaterOn.target_temp_c(), None);
    }

    #[test]
    fn renders_wire_text() {
        assert_eq!(HeaterCommand::RegulateCoffee(Some(107.5)).to_string(), "reg coffee 107.5");
        assert_eq!(HeaterCommand::RegulateCoffee(Some(108.0)).to_string(), "reg coffee 108");
        assert_eq!(HeaterCommand::RegulationOff.to_string(), "reg off");
    }
}
