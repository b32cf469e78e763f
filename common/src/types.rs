use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::humidity::{Position, DEFAULT_TARGET};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumidifierState {
    pub active: bool,
    #[serde(rename = "targetHumidity")]
    pub target_humidity: u8,
    #[serde(rename = "internalPosition")]
    pub internal_position: Position,
}

impl Default for HumidifierState {
    fn default() -> Self {
        Self {
            active: false,
            target_humidity: DEFAULT_TARGET,
            internal_position: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionPhase {
    Idle,
    Entering,
    Stepping,
    Draining,
}

impl TransitionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Entering => "ENTERING",
            Self::Stepping => "STEPPING",
            Self::Draining => "DRAINING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RawActive {
    Inactive = 0,
    Active = 1,
}

impl TryFrom<u8> for RawActive {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Inactive),
            1 => Ok(Self::Active),
            other => Err(other),
        }
    }
}

impl From<RawActive> for bool {
    fn from(value: RawActive) -> Self {
        match value {
            RawActive::Active => true,
            RawActive::Inactive => false,
        }
    }
}

impl From<bool> for RawActive {
    fn from(value: bool) -> Self {
        if value {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandStats {
    #[serde(rename = "sentCommands")]
    pub sent: u64,
    #[serde(rename = "failedCommands")]
    pub failed: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastCommandAt")]
    pub last_command_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HumidifierStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub active: bool,
    #[serde(rename = "targetHumidity")]
    pub target_humidity: u8,
    #[serde(rename = "internalPosition")]
    pub internal_position: Position,
    #[serde(rename = "currentHumidity")]
    pub current_humidity: Option<f32>,
    pub phase: &'static str,
    pub hot: bool,
    pub requesting: bool,
    #[serde(flatten)]
    pub commands: CommandStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct HumidifierStatePayload {
    pub active: u8,
    pub target: u8,
    pub position: Position,
    pub humidity: Option<f32>,
    pub phase: &'static str,
}

impl From<&HumidifierStatus> for HumidifierStatePayload {
    fn from(status: &HumidifierStatus) -> Self {
        Self {
            active: RawActive::from(status.active) as u8,
            target: status.target_humidity,
            position: status.internal_position,
            humidity: status.current_humidity,
            phase: status.phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn raw_active_rejects_unknown_values() {
        assert_eq!(RawActive::try_from(1), Ok(RawActive::Active));
        assert_eq!(RawActive::try_from(0), Ok(RawActive::Inactive));
        assert_eq!(RawActive::try_from(2), Err(2));
        assert!(bool::from(RawActive::Active));
    }

    #[test]
    fn state_round_trips_with_disengaged_position() {
        let json = serde_json::to_string(&HumidifierState::default()).unwrap();
        assert_eq!(
            json,
            r#"{"active":false,"targetHumidity":50,"internalPosition":null}"#
        );
    }
}
