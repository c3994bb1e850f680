//! Device topic layout and payload codecs
//!
//! Every device owns three topics derived from its name:
//! `smartbox_<name>/data` (telemetry, device → app),
//! `smartbox_<name>/status` (self-report, device → app) and
//! `smartbox_<name>/cmd` (commands, app → device).

use crate::domain::telemetry::{DeviceCommand, DeviceCommandStatus, DeviceReading};
use crate::domain::types::{deserialize_timestamp, Coordinate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub data: String,
    pub status: String,
    pub cmd: String,
}

/// Which inbound stream a topic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Data,
    Status,
}

impl DeviceTopics {
    pub fn for_device(device_name: &str) -> Self {
        let prefix = format!("smartbox_{device_name}");
        Self {
            data: format!("{prefix}/data"),
            status: format!("{prefix}/status"),
            cmd: format!("{prefix}/cmd"),
        }
    }

    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.data {
            Some(TopicKind::Data)
        } else if topic == self.status {
            Some(TopicKind::Status)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload does not match schema: {0}")]
    Schema(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct WireCoordinate {
    lat: f64,
    lng: f64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    satellites: Option<u32>,
}

/// Door flag: firmware revisions send either a bool or 0/1
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DoorFlag {
    Bool(bool),
    Int(i64),
}

impl DoorFlag {
    fn is_open(&self) -> bool {
        match self {
            DoorFlag::Bool(open) => *open,
            DoorFlag::Int(v) => *v != 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDatum {
    coordinate: WireCoordinate,
    #[serde(default)]
    temp: Option<f64>,
    #[serde(default)]
    humid: Option<f64>,
    is_door_open: DoorFlag,
    #[serde(default)]
    signal: i32,
    #[serde(deserialize_with = "deserialize_timestamp")]
    gps_timestamp: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
}

/// Strictly decode a data-topic payload
pub fn decode_reading(payload: &[u8]) -> Result<DeviceReading, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let datum: DeviceDatum = serde_json::from_str(text)?;
    let coordinate = Coordinate::new(datum.coordinate.lat, datum.coordinate.lng)
        .map_err(|e| DecodeError::Schema(<serde_json::Error as serde::de::Error>::custom(e)))?;

    Ok(DeviceReading {
        coordinate,
        temperature: datum.temp,
        humidity: datum.humid,
        door_open: datum.is_door_open.is_open(),
        signal: datum.signal,
        speed: datum.coordinate.speed,
        satellites: datum.coordinate.satellites,
        gps_timestamp: datum.gps_timestamp,
        recorded_at: datum.timestamp,
    })
}

/// Strictly decode a status-topic payload
pub fn decode_status(payload: &[u8]) -> Result<DeviceCommandStatus, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    Ok(serde_json::from_str(text)?)
}

pub fn encode_command(command: &DeviceCommand) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(command)
}

/// Outbound form of a reading, used by the simulated device
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDatumOut {
    pub coordinate: DeviceCoordinateOut,
    pub temp: Option<f64>,
    pub humid: Option<f64>,
    pub is_door_open: u8,
    pub signal: i32,
    pub gps_timestamp: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceCoordinateOut {
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub satellites: u32,
}

impl From<&DeviceReading> for DeviceDatumOut {
    fn from(reading: &DeviceReading) -> Self {
        Self {
            coordinate: DeviceCoordinateOut {
                lat: reading.coordinate.lat(),
                lng: reading.coordinate.lng(),
                speed: reading.speed.unwrap_or(0.0),
                satellites: reading.satellites.unwrap_or(0),
            },
            temp: reading.temperature,
            humid: reading.humidity,
            is_door_open: u8::from(reading.door_open),
            signal: reading.signal,
            gps_timestamp: reading.gps_timestamp.to_rfc3339(),
            timestamp: reading.recorded_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parcel::DeviceMode;

    const DATUM: &str = r#"{
        "coordinate": {"lat": -6.2, "lng": 106.8, "speed": 12.5, "satellites": 7},
        "temp": 24.5,
        "humid": -999,
        "isDoorOpen": 0,
        "signal": 21,
        "gpsTimestamp": "2024-03-01T08:00:00Z",
        "timestamp": 1709280000000
    }"#;

    #[test]
    fn test_topics_for_device() {
        let topics = DeviceTopics::for_device("box01");
        assert_eq!(topics.data, "smartbox_box01/data");
        assert_eq!(topics.status, "smartbox_box01/status");
        assert_eq!(topics.cmd, "smartbox_box01/cmd");
        assert_eq!(topics.classify("smartbox_box01/status"), Some(TopicKind::Status));
        assert_eq!(topics.classify("smartbox_box02/data"), None);
        assert_eq!(topics.classify("smartbox_box01/cmd"), None);
    }

    #[test]
    fn test_decode_reading() {
        let reading = decode_reading(DATUM.as_bytes()).unwrap();
        assert_eq!(reading.coordinate.lat(), -6.2);
        assert_eq!(reading.temperature, Some(24.5));
        assert_eq!(reading.humidity, Some(-999.0));
        assert!(!reading.door_open);
        assert_eq!(reading.satellites, Some(7));
        assert_eq!(reading.recorded_at.timestamp(), 1709280000);
    }

    #[test]
    fn test_decode_reading_bool_door_and_null_temp() {
        let payload = DATUM.replace("\"isDoorOpen\": 0", "\"isDoorOpen\": true").replace("24.5", "null");
        let reading = decode_reading(payload.as_bytes()).unwrap();
        assert!(reading.door_open);
        assert_eq!(reading.temperature, None);
    }

    #[test]
    fn test_decode_reading_rejects_bad_coordinate() {
        let payload = DATUM.replace("-6.2", "-96.2");
        assert!(matches!(decode_reading(payload.as_bytes()), Err(DecodeError::Schema(_))));
        assert!(decode_reading(b"\xff\xfe").is_err());
        assert!(decode_reading(b"{}").is_err());
    }

    #[test]
    fn test_decode_status() {
        let status = decode_status(br#"{"mode": 1, "endPosition": null, "logInterval": 60}"#).unwrap();
        assert_eq!(status.mode, DeviceMode::Active);
        assert!(status.end_position.is_none());

        let err = decode_status(br#"{"mode": 1, "endPosition": {"lat": "x"}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_datum_out_decodes_back() {
        let reading = decode_reading(DATUM.as_bytes()).unwrap();
        let bytes = serde_json::to_vec(&DeviceDatumOut::from(&reading)).unwrap();
        let again = decode_reading(&bytes).unwrap();
        assert_eq!(again, reading);
    }
}
