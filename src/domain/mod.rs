//! Domain models - parcels, telemetry and shared value types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Parcel` - the aggregate root, moving through `ParcelStatus` stages
//! - `TelemetrySample` - one recorded position/environment point of a parcel
//! - `DeviceCommand` / `DeviceCommandStatus` - device control plane messages
//! - `Coordinate`, `Threshold`, `ParcelId` - validated value types

pub mod parcel;
pub mod telemetry;
pub mod types;

pub use parcel::{Device, DeviceMode, Parcel, ParcelPatch, ParcelStatus, Photo, PhotoStage, UserRef};
pub use telemetry::{DeviceCommand, DeviceCommandStatus, DeviceReading, TelemetrySample};
pub use types::{Coordinate, DeviceId, ParcelId, Threshold, UserId, ValidationError};
