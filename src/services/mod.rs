//! Services - business logic and state management
//!
//! - `lifecycle` - Parcel stage machine, guards and stage side effects
//! - `geofence` - Haversine distance and fence containment
//! - `telemetry_store` - Per-parcel append-only telemetry trails
//! - `safety` - Threshold verdicts over a trail
//! - `gateway` - Device command seam and telemetry pump
//! - `device_test` - Standalone device test run state
//! - `poller` - Periodic parcel refresh and trail sync

pub mod gateway;
pub mod geofence;
pub mod lifecycle;
pub mod poller;
pub mod safety;
pub mod telemetry_store;

// Re-export commonly used types
pub use device_test::{DeviceTestError, DeviceTestSession};
pub use gateway::{DeviceGateway, SessionGateway, TelemetryPump};
pub use lifecycle::{LifecycleError, LifecycleMachine, LifecycleSettings, Transition};
pub use poller::Poller;
pub use safety::{SafetyReport, Verdict};
pub use telemetry_store::{TelemetryError, TelemetryStore};
