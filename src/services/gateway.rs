//! Seam between the lifecycle machine and the device channel
//!
//! - `DeviceGateway` - sends commands to a parcel's bound device
//! - `SessionGateway` - routes commands to open `DeviceSession`s by device name
//! - `TelemetryPump` - drains a session's events into the telemetry store

use crate::domain::parcel::{Device, DeviceMode};
use crate::domain::telemetry::{DeviceCommand, DeviceCommandStatus};
use crate::domain::types::ParcelId;
use crate::infra::metrics::Metrics;
use crate::io::mqtt::{ChannelError, DeviceEvent, DeviceSession};
use crate::services::telemetry_store::TelemetryStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[async_trait]
pub trait DeviceGateway: Send + Sync {
    async fn send_command(&self, device: &Device, command: DeviceCommand) -> Result<(), ChannelError>;
}

/// Gateway over live device sessions, keyed by device name
#[derive(Default)]
pub struct SessionGateway {
    sessions: RwLock<FxHashMap<String, Arc<DeviceSession>>>,
}

impl SessionGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<DeviceSession>) {
        let name = session.device_name().to_string();
        info!(device = %name, "gateway_session_registered");
        self.sessions.write().insert(name, session);
    }

    pub fn remove(&self, device_name: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.write().remove(device_name)
    }

    pub fn session(&self, device_name: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().get(device_name).cloned()
    }
}

#[async_trait]
impl DeviceGateway for SessionGateway {
    async fn send_command(&self, device: &Device, command: DeviceCommand) -> Result<(), ChannelError> {
        let Some(session) = self.session(&device.name) else {
            warn!(device = %device.name, cmd = command.name(), "gateway_no_session");
            return Err(ChannelError::NotConnected);
        };
        session.publish(&command).await
    }
}

/// Moves device telemetry into the store for the parcel it is bound to
pub struct TelemetryPump {
    parcel_id: ParcelId,
    store: Arc<TelemetryStore>,
    metrics: Arc<Metrics>,
    last_mode: Option<DeviceMode>,
    last_status: Option<DeviceCommandStatus>,
}

impl TelemetryPump {
    pub fn new(parcel_id: ParcelId, store: Arc<TelemetryStore>, metrics: Arc<Metrics>) -> Self {
        Self { parcel_id, store, metrics, last_mode: None, last_status: None }
    }

    pub fn last_status(&self) -> Option<&DeviceCommandStatus> {
        self.last_status.as_ref()
    }

    /// Apply one event. A device that switches from idle to active starts a
    /// new leg, so the previous trail is discarded.
    pub fn handle(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Data(reading) => {
                if !self.store.record(&self.parcel_id, reading.into_sample(self.parcel_id.clone())) {
                    self.metrics.record_sample_rejected();
                }
            }
            DeviceEvent::Status(status) => {
                if self.last_mode == Some(DeviceMode::Idle) && status.mode == DeviceMode::Active {
                    info!(parcel_id = %self.parcel_id, "telemetry_leg_started");
                    self.store.clear(&self.parcel_id);
                }
                self.last_mode = Some(status.mode);
                self.last_status = Some(status);
            }
            DeviceEvent::State(state) => {
                debug!(parcel_id = %self.parcel_id, state = %state, "telemetry_channel_state");
            }
        }
    }

    /// Drain events until the session closes its queue or shutdown is signalled
    pub async fn run(mut self, mut events: mpsc::Receiver<DeviceEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => break,
                    }
                }
            }
        }
        info!(parcel_id = %self.parcel_id, samples = self.store.len(&self.parcel_id), "telemetry_pump_stopped");
    }
}
