//! Parcel aggregate and its lifecycle stages

use crate::domain::types::{Coordinate, DeviceId, ParcelId, Threshold, UserId, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum parcel name length (characters)
pub const MIN_NAME_LEN: usize = 3;
/// Minimum parcel description length (characters)
pub const MIN_DESCRIPTION_LEN: usize = 6;

/// Delivery stage. Ordered: a parcel only ever moves to `next()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ParcelStatus {
    Draft = 0,
    WaitingForCourier = 1,
    PickUp = 2,
    OnGoing = 3,
    Arrived = 4,
    Done = 5,
}

impl ParcelStatus {
    pub fn next(self) -> Option<Self> {
        match self {
            ParcelStatus::Draft => Some(ParcelStatus::WaitingForCourier),
            ParcelStatus::WaitingForCourier => Some(ParcelStatus::PickUp),
            ParcelStatus::PickUp => Some(ParcelStatus::OnGoing),
            ParcelStatus::OnGoing => Some(ParcelStatus::Arrived),
            ParcelStatus::Arrived => Some(ParcelStatus::Done),
            ParcelStatus::Done => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ParcelStatus::Done
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParcelStatus::Draft => "draft",
            ParcelStatus::WaitingForCourier => "waiting_for_courier",
            ParcelStatus::PickUp => "pick_up",
            ParcelStatus::OnGoing => "on_going",
            ParcelStatus::Arrived => "arrived",
            ParcelStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for ParcelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for ParcelStatus {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => ParcelStatus::Draft,
            1 => ParcelStatus::WaitingForCourier,
            2 => ParcelStatus::PickUp,
            3 => ParcelStatus::OnGoing,
            4 => ParcelStatus::Arrived,
            5 => ParcelStatus::Done,
            other => return Err(ValidationError::new("status", format!("unknown code {other}"))),
        })
    }
}

impl From<ParcelStatus> for u8 {
    fn from(status: ParcelStatus) -> Self {
        status as u8
    }
}

/// Stage a photo is taken at. Encoded on the wire as the matching status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PhotoStage {
    PickUp,
    Arrived,
}

impl PhotoStage {
    pub fn status(self) -> ParcelStatus {
        match self {
            PhotoStage::PickUp => ParcelStatus::PickUp,
            PhotoStage::Arrived => ParcelStatus::Arrived,
        }
    }
}

impl TryFrom<u8> for PhotoStage {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match ParcelStatus::try_from(code)? {
            ParcelStatus::PickUp => Ok(PhotoStage::PickUp),
            ParcelStatus::Arrived => Ok(PhotoStage::Arrived),
            other => Err(ValidationError::new("photo stage", format!("no photo at {other}"))),
        }
    }
}

impl From<PhotoStage> for u8 {
    fn from(stage: PhotoStage) -> Self {
        stage.status().into()
    }
}

/// Device operating mode, reported by the device and stored on the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DeviceMode {
    #[default]
    Idle,
    Active,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Idle => "idle",
            DeviceMode::Active => "active",
        }
    }
}

impl TryFrom<u8> for DeviceMode {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DeviceMode::Idle),
            1 => Ok(DeviceMode::Active),
            other => Err(ValidationError::new("mode", format!("unknown code {other}"))),
        }
    }
}

impl From<DeviceMode> for u8 {
    fn from(mode: DeviceMode) -> Self {
        match mode {
            DeviceMode::Idle => 0,
            DeviceMode::Active => 1,
        }
    }
}

/// Photo evidence. Validity is decided by the remote photo check, never locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub uri: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl UserRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: UserId(id.into()), name: name.into(), email: String::new() }
    }
}

/// Physical tracking hardware. `name` derives the broker topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub status: DeviceMode,
}

/// Aggregate root. Field names match the persistence service's JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    pub id: ParcelId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pick_up_coor: Option<Coordinate>,
    #[serde(default)]
    pub arrived_coor: Option<Coordinate>,
    #[serde(default)]
    pub pick_up_photo: Option<Photo>,
    #[serde(default)]
    pub arrived_photo: Option<Photo>,
    #[serde(default)]
    pub temp_thr: Option<Threshold>,
    #[serde(default)]
    pub hmd_thr: Option<Threshold>,
    #[serde(default)]
    pub sender: Option<UserRef>,
    #[serde(default)]
    pub receiver: Option<UserRef>,
    #[serde(default)]
    pub courier: Option<UserRef>,
    #[serde(default)]
    pub device: Option<Device>,
    pub status: ParcelStatus,
}

impl Parcel {
    /// Fresh draft owned by `sender`
    pub fn draft(id: ParcelId, sender: UserRef) -> Self {
        Self {
            id,
            name: String::new(),
            description: String::new(),
            pick_up_coor: None,
            arrived_coor: None,
            pick_up_photo: None,
            arrived_photo: None,
            temp_thr: None,
            hmd_thr: None,
            sender: Some(sender),
            receiver: None,
            courier: None,
            device: None,
            status: ParcelStatus::Draft,
        }
    }

    pub fn photo_for(&self, stage: PhotoStage) -> Option<&Photo> {
        match stage {
            PhotoStage::PickUp => self.pick_up_photo.as_ref(),
            PhotoStage::Arrived => self.arrived_photo.as_ref(),
        }
    }

    pub fn is_courier(&self, user: &UserId) -> bool {
        self.courier.as_ref().is_some_and(|c| &c.id == user)
    }

    pub fn is_receiver(&self, user: &UserId) -> bool {
        self.receiver.as_ref().is_some_and(|r| &r.id == user)
    }
}

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let len = name.trim().chars().count();
    if len < MIN_NAME_LEN {
        return Err(ValidationError::new(
            "name",
            format!("needs at least {MIN_NAME_LEN} characters, got {len}"),
        ));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> Result<(), ValidationError> {
    let len = description.trim().chars().count();
    if len < MIN_DESCRIPTION_LEN {
        return Err(ValidationError::new(
            "description",
            format!("needs at least {MIN_DESCRIPTION_LEN} characters, got {len}"),
        ));
    }
    Ok(())
}

/// Partial update for `UpdateDetails`.
///
/// Draft parcels accept the descriptive fields, endpoints, thresholds and the
/// receiver. Parcels waiting for a courier accept only the courier and device
/// binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParcelPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pick_up_coor: Option<Coordinate>,
    pub arrived_coor: Option<Coordinate>,
    pub temp_thr: Option<Threshold>,
    pub hmd_thr: Option<Threshold>,
    pub receiver: Option<UserRef>,
    pub courier: Option<UserRef>,
    pub device: Option<Device>,
}

impl ParcelPatch {
    pub fn is_empty(&self) -> bool {
        *self == ParcelPatch::default()
    }

    pub fn touches_details(&self) -> bool {
        self.name.is_some()
            || self.description.is_some()
            || self.pick_up_coor.is_some()
            || self.arrived_coor.is_some()
            || self.temp_thr.is_some()
            || self.hmd_thr.is_some()
            || self.receiver.is_some()
    }

    pub fn touches_binding(&self) -> bool {
        self.courier.is_some() || self.device.is_some()
    }

    /// Field-level checks; stage rules are enforced by the lifecycle machine
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        if let Some(receiver) = &self.receiver {
            if receiver.id.0.trim().is_empty() {
                return Err(ValidationError::new("receiver", "empty user id"));
            }
        }
        if let Some(courier) = &self.courier {
            if courier.id.0.trim().is_empty() {
                return Err(ValidationError::new("courier", "empty user id"));
            }
        }
        if let Some(device) = &self.device {
            if device.name.trim().is_empty() {
                return Err(ValidationError::new("device", "empty device name"));
            }
        }
        Ok(())
    }

    pub fn apply_to(self, parcel: &mut Parcel) {
        if let Some(name) = self.name {
            parcel.name = name;
        }
        if let Some(description) = self.description {
            parcel.description = description;
        }
        if self.pick_up_coor.is_some() {
            parcel.pick_up_coor = self.pick_up_coor;
        }
        if self.arrived_coor.is_some() {
            parcel.arrived_coor = self.arrived_coor;
        }
        if self.temp_thr.is_some() {
            parcel.temp_thr = self.temp_thr;
        }
        if self.hmd_thr.is_some() {
            parcel.hmd_thr = self.hmd_thr;
        }
        if self.receiver.is_some() {
            parcel.receiver = self.receiver;
        }
        if self.courier.is_some() {
            parcel.courier = self.courier;
        }
        if self.device.is_some() {
            parcel.device = self.device;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> ParcelId {
        "64b7f0c2a1d3e4f5a6b7c8d9".parse().unwrap()
    }

    #[test]
    fn test_status_order_and_next() {
        let mut status = ParcelStatus::Draft;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            assert!(next > status);
            status = next;
            seen.push(status);
        }
        assert_eq!(seen.len(), 6);
        assert!(status.is_terminal());
    }

    #[test]
    fn test_status_wire_codes() {
        assert_eq!(serde_json::to_string(&ParcelStatus::OnGoing).unwrap(), "3");
        assert_eq!(serde_json::from_str::<ParcelStatus>("4").unwrap(), ParcelStatus::Arrived);
        assert!(serde_json::from_str::<ParcelStatus>("9").is_err());
    }

    #[test]
    fn test_photo_stage_codes() {
        assert_eq!(serde_json::to_string(&PhotoStage::Arrived).unwrap(), "4");
        assert!(PhotoStage::try_from(1).is_err());
    }

    #[test]
    fn test_parcel_from_remote_json() {
        let json = r#"{
            "id": "64b7f0c2a1d3e4f5a6b7c8d9",
            "name": "Vaccines",
            "description": "Cold chain box",
            "pick_up_coor": {"lat": -6.2, "lng": 106.8},
            "arrived_coor": null,
            "pick_up_photo": {"uri": "p.jpg", "updated_at": "2024-03-01T08:00:00Z"},
            "temp_thr": {"low": 2, "high": 8},
            "receiver": {"id": "u2", "name": "Rina", "email": "rina@example.com"},
            "device": {"id": "aaaaaaaaaaaaaaaaaaaaaaaa", "name": "box01", "status": 1},
            "status": 2
        }"#;
        let parcel: Parcel = serde_json::from_str(json).unwrap();
        assert_eq!(parcel.status, ParcelStatus::PickUp);
        assert_eq!(parcel.temp_thr.unwrap().high(), 8.0);
        assert!(parcel.arrived_coor.is_none());
        assert_eq!(parcel.device.as_ref().unwrap().status, DeviceMode::Active);
        assert!(parcel.photo_for(PhotoStage::PickUp).is_some());
    }

    #[test]
    fn test_patch_validation() {
        let patch = ParcelPatch { name: Some("ab".to_string()), ..Default::default() };
        assert_eq!(patch.validate().unwrap_err().field, "name");

        let patch = ParcelPatch { description: Some("short".to_string()), ..Default::default() };
        assert_eq!(patch.validate().unwrap_err().field, "description");

        let patch = ParcelPatch {
            name: Some("Vaccines".to_string()),
            description: Some("Cold chain box".to_string()),
            ..Default::default()
        };
        assert!(patch.validate().is_ok());
        assert!(patch.touches_details());
        assert!(!patch.touches_binding());
    }

    #[test]
    fn test_patch_apply() {
        let mut parcel = Parcel::draft(sample_id(), UserRef::new("u1", "Sender"));
        let patch = ParcelPatch {
            name: Some("Vaccines".to_string()),
            receiver: Some(UserRef::new("u2", "Receiver")),
            ..Default::default()
        };
        patch.apply_to(&mut parcel);
        assert_eq!(parcel.name, "Vaccines");
        assert!(parcel.is_receiver(&UserId("u2".to_string())));
        assert!(parcel.description.is_empty());
    }
}
