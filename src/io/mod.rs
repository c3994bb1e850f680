//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `device_wire` - Device topic layout and JSON payload codecs
//! - `mqtt` - Per-device MQTT channel (commands out, telemetry/status in)
//! - `remote` - Persistence service contract and its HTTP client

pub mod device_wire;
pub mod mqtt;
pub mod remote;

// Re-export commonly used types
pub use device_wire::DeviceTopics;
pub use mqtt::{ChannelError, ChannelOptions, ConnectionState, DeviceChannel, DeviceEvent, DeviceSession};
pub use remote::{HttpParcelRemote, ParcelRemote, RemoteError};
