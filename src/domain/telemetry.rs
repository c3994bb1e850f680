//! Telemetry samples, device status reports and device commands

use crate::domain::parcel::DeviceMode;
use crate::domain::types::{Coordinate, ParcelId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry point recorded against a parcel. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub parcel_id: ParcelId,
    pub coordinate: Coordinate,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub door_open: bool,
    pub signal: i32,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub satellites: Option<u32>,
    pub gps_timestamp: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// Telemetry as reported by a device, before it is attributed to a parcel
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub coordinate: Coordinate,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub door_open: bool,
    pub signal: i32,
    pub speed: Option<f64>,
    pub satellites: Option<u32>,
    pub gps_timestamp: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl DeviceReading {
    pub fn into_sample(self, parcel_id: ParcelId) -> TelemetrySample {
        TelemetrySample {
            parcel_id,
            coordinate: self.coordinate,
            temperature: self.temperature,
            humidity: self.humidity,
            door_open: self.door_open,
            signal: self.signal,
            speed: self.speed,
            satellites: self.satellites,
            gps_timestamp: self.gps_timestamp,
            recorded_at: self.recorded_at,
        }
    }
}

/// Device self-report received on the status topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommandStatus {
    #[serde(alias = "status")]
    pub mode: DeviceMode,
    #[serde(rename = "endPosition", default)]
    pub end_position: Option<Coordinate>,
    #[serde(rename = "logInterval", default)]
    pub log_interval_seconds: Option<u32>,
}

/// Command published on the device's cmd topic.
///
/// Wire form is `{"cmd": "<name>", "value": <payload>}`; `value` is omitted
/// for commands without a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "value", rename_all = "lowercase")]
pub enum DeviceCommand {
    /// Ask the device to report its status
    Status,
    /// Begin a transport leg towards the given destination
    Start(Coordinate),
    End,
    /// Logging interval in seconds
    Time(u32),
    /// Unlock the door for the given number of seconds
    Door(u32),
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Status => "status",
            DeviceCommand::Start(_) => "start",
            DeviceCommand::End => "end",
            DeviceCommand::Time(_) => "time",
            DeviceCommand::Door(_) => "door",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let start = DeviceCommand::Start(Coordinate::new(-6.2, 106.8).unwrap());
        let json: serde_json::Value = serde_json::to_value(&start).unwrap();
        assert_eq!(json["cmd"], "start");
        assert_eq!(json["value"]["lat"], -6.2);
        assert_eq!(json["value"]["lng"], 106.8);

        let json = serde_json::to_value(DeviceCommand::Time(30)).unwrap();
        assert_eq!(json, serde_json::json!({"cmd": "time", "value": 30}));

        let json = serde_json::to_value(DeviceCommand::End).unwrap();
        assert_eq!(json, serde_json::json!({"cmd": "end"}));
    }

    #[test]
    fn test_status_wire_shape() {
        let status: DeviceCommandStatus = serde_json::from_str(
            r#"{"mode": 1, "endPosition": {"lat": 1.0, "lng": 2.0}, "logInterval": 15}"#,
        )
        .unwrap();
        assert_eq!(status.mode, DeviceMode::Active);
        assert_eq!(status.log_interval_seconds, Some(15));

        let status: DeviceCommandStatus = serde_json::from_str(r#"{"status": 0}"#).unwrap();
        assert_eq!(status.mode, DeviceMode::Idle);
        assert!(status.end_position.is_none());
    }

    #[test]
    fn test_status_rejects_bad_end_position() {
        let bad = serde_json::from_str::<DeviceCommandStatus>(
            r#"{"mode": 1, "endPosition": {"lat": "north", "lng": 2.0}}"#,
        );
        assert!(bad.is_err());
    }
}
