//! Parcel lifecycle state machine
//!
//! The machine moves parcels through `Draft → WaitingForCourier → PickUp →
//! OnGoing → Arrived → Done`. Each step is gated on real-world evidence
//! (photos accepted by the service, the parcel inside the destination fence,
//! the receiver's one-time code) and confirmed by the remote service before
//! the local copy changes.
//!
//! Operations on one parcel are serialized by a per-parcel async mutex held
//! across the whole read-check-remote-write sequence; different parcels
//! proceed in parallel.

mod handlers;

use crate::domain::parcel::{Parcel, ParcelPatch, ParcelStatus, PhotoStage, UserRef};
use crate::domain::telemetry::TelemetrySample;
use crate::domain::types::{Coordinate, ParcelId, UserId, ValidationError};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::remote::{ParcelRemote, RemoteError};
use crate::services::gateway::DeviceGateway;
use crate::services::geofence::{Fence, GeofenceRadii};
use crate::services::safety::SafetyReport;
use crate::services::telemetry_store::TelemetryStore;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Minimum digits in a handoff code
pub const CODE_MIN_DIGITS: usize = 6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("precondition failed in {from}: {reason}")]
    Precondition { from: ParcelStatus, reason: String },
    #[error("handoff code rejected")]
    InvalidCode,
    #[error("code was sent recently, retry in {remaining_secs}s")]
    Cooldown { remaining_secs: u64 },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("unknown parcel {0}")]
    UnknownParcel(ParcelId),
}

impl LifecycleError {
    fn precondition(from: ParcelStatus, reason: impl Into<String>) -> Self {
        LifecycleError::Precondition { from, reason: reason.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleSettings {
    pub radii: GeofenceRadii,
    /// Advisory wait between two code sends for the same parcel
    pub code_resend_cooldown: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self { radii: GeofenceRadii::default(), code_resend_cooldown: Duration::from_secs(60) }
    }
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self { radii: GeofenceRadii::from_config(config), code_resend_cooldown: config.code_resend_cooldown() }
    }
}

/// Outcome of a confirmed stage change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Parcel as stored by the remote service after the change
    pub parcel: Parcel,
    pub from: ParcelStatus,
    /// Device command that failed after the stage was confirmed, if any
    pub command_error: Option<String>,
}

impl Transition {
    pub fn to(&self) -> ParcelStatus {
        self.parcel.status
    }
}

/// Per-parcel mutable state
#[derive(Debug, Default)]
struct ParcelSlot {
    parcel: Option<Parcel>,
    /// Receiver's code accepted during the current OnGoing stage
    code_verified: bool,
    last_code_sent: Option<Instant>,
}

pub struct LifecycleMachine {
    remote: Arc<dyn ParcelRemote>,
    devices: Arc<dyn DeviceGateway>,
    store: Arc<TelemetryStore>,
    metrics: Arc<Metrics>,
    settings: LifecycleSettings,
    slots: Mutex<FxHashMap<ParcelId, Arc<tokio::sync::Mutex<ParcelSlot>>>>,
}

impl LifecycleMachine {
    pub fn new(
        remote: Arc<dyn ParcelRemote>,
        devices: Arc<dyn DeviceGateway>,
        store: Arc<TelemetryStore>,
        metrics: Arc<Metrics>,
        settings: LifecycleSettings,
    ) -> Self {
        Self { remote, devices, store, metrics, settings, slots: Mutex::new(FxHashMap::default()) }
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    fn slot(&self, id: &ParcelId) -> Arc<tokio::sync::Mutex<ParcelSlot>> {
        self.slots.lock().entry(id.clone()).or_default().clone()
    }

    /// Create a draft owned by `sender` and cache it
    pub async fn create_parcel(&self, sender: &UserRef) -> Result<Parcel, LifecycleError> {
        let id = self.remote.create_parcel(&sender.id).await?;
        let slot = self.slot(&id);
        let mut slot = slot.lock().await;
        let parcel = self.fetch(&id).await?;
        self.adopt(&mut slot, parcel, None)?;
        info!(parcel_id = %id, sender = %sender.id, "parcel_created");
        self.current(&slot, &id)
    }

    /// Cached parcel, fetched on first use
    pub async fn load(&self, id: &ParcelId) -> Result<Parcel, LifecycleError> {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        self.ensure_loaded(&mut slot, id).await
    }

    /// Re-read the parcel from the remote service. A stage change made
    /// elsewhere is adopted with its device effects.
    pub async fn refresh(&self, id: &ParcelId) -> Result<Parcel, LifecycleError> {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        let before = slot.parcel.as_ref().map(|p| p.status);
        let parcel = self.fetch(id).await?;
        self.adopt(&mut slot, parcel, None)?;
        let parcel = self.current(&slot, id)?;
        match before {
            Some(from) if from != parcel.status => Ok(self.entered(from, parcel).await.parcel),
            _ => Ok(parcel),
        }
    }

    /// Edit descriptive fields (Draft) or bind courier and device
    /// (WaitingForCourier)
    pub async fn update_details(&self, id: &ParcelId, patch: ParcelPatch) -> Result<Parcel, LifecycleError> {
        patch.validate()?;
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        let parcel = self.ensure_loaded(&mut slot, id).await?;
        if patch.is_empty() {
            return Ok(parcel);
        }

        match parcel.status {
            ParcelStatus::Draft if !patch.touches_binding() => {}
            ParcelStatus::WaitingForCourier if !patch.touches_details() => {}
            ParcelStatus::Draft => {
                return Err(LifecycleError::precondition(parcel.status, "courier and device are bound after the draft is submitted"));
            }
            ParcelStatus::WaitingForCourier => {
                return Err(LifecycleError::precondition(parcel.status, "only courier and device can change once submitted"));
            }
            status => {
                return Err(LifecycleError::precondition(status, "details are frozen"));
            }
        }

        let mut candidate = parcel;
        patch.apply_to(&mut candidate);
        let stored = self.remote.put_parcel(&candidate).await?;
        self.adopt(&mut slot, stored, Some(candidate.status))?;
        info!(parcel_id = %id, "parcel_details_updated");
        self.current(&slot, id)
    }

    /// Move to the next stage once its guard holds
    pub async fn advance_stage(&self, id: &ParcelId) -> Result<Transition, LifecycleError> {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        self.advance_locked(&mut slot, id).await
    }

    /// Ask the service to send the handoff code to the receiver
    pub async fn send_code(&self, id: &ParcelId, to_user: &UserId) -> Result<(), LifecycleError> {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        let parcel = self.ensure_loaded(&mut slot, id).await?;

        if parcel.status != ParcelStatus::OnGoing {
            return Err(LifecycleError::precondition(parcel.status, "codes are only sent while on the way"));
        }
        if !parcel.is_receiver(to_user) {
            return Err(ValidationError::new("to_user", format!("{to_user} is not the receiver")).into());
        }
        self.check_arrival(&parcel).map_err(|reason| LifecycleError::precondition(parcel.status, reason))?;

        if let Some(sent) = slot.last_code_sent {
            let elapsed = sent.elapsed();
            if elapsed < self.settings.code_resend_cooldown {
                let remaining = self.settings.code_resend_cooldown - elapsed;
                return Err(LifecycleError::Cooldown { remaining_secs: remaining.as_secs_f64().ceil() as u64 });
            }
        }

        self.remote.send_code(id, to_user).await?;
        slot.last_code_sent = Some(Instant::now());
        info!(parcel_id = %id, to_user = %to_user, "code_sent");
        Ok(())
    }

    /// Verify the receiver's code; completes the arrival when the parcel is
    /// inside the destination fence, or adopts it when the service has
    /// already moved the parcel on
    pub async fn verify_code(&self, id: &ParcelId, code: &str) -> Result<Transition, LifecycleError> {
        let code = code.trim();
        if code.len() < CODE_MIN_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::new("code", format!("expected at least {CODE_MIN_DIGITS} digits")).into());
        }

        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        let parcel = self.ensure_loaded(&mut slot, id).await?;
        if parcel.status != ParcelStatus::OnGoing {
            return Err(LifecycleError::precondition(parcel.status, "no code challenge is open"));
        }

        match self.remote.verify_code(id, code).await {
            Ok(()) => {}
            Err(RemoteError::Rejected(reason)) => {
                info!(parcel_id = %id, reason = %reason, "code_rejected");
                return Err(LifecycleError::InvalidCode);
            }
            Err(e) => return Err(e.into()),
        }
        slot.code_verified = true;
        info!(parcel_id = %id, "code_verified");

        let stored = self.fetch(id).await?;
        self.adopt(&mut slot, stored, Some(ParcelStatus::Arrived))?;
        let parcel = self.current(&slot, id)?;
        if parcel.status == ParcelStatus::Arrived {
            return Ok(self.entered(ParcelStatus::OnGoing, parcel).await);
        }

        // Fence is judged on the newest sample at this moment
        self.check_arrival(&parcel).map_err(|reason| LifecycleError::precondition(parcel.status, reason))?;
        self.advance_locked(&mut slot, id).await
    }

    /// Whether a courier standing at `courier_location` may start the
    /// delivery. Advisory only; nothing is gated on it.
    pub async fn pickup_eligible(&self, id: &ParcelId, courier_location: &Coordinate) -> Result<bool, LifecycleError> {
        let parcel = self.load(id).await?;
        Ok(parcel
            .pick_up_coor
            .is_some_and(|center| Fence::new(center, self.settings.radii.pick_up_m).contains(courier_location)))
    }

    pub async fn open_door(&self, id: &ParcelId) -> Result<(), LifecycleError> {
        self.door(id, true).await
    }

    pub async fn close_door(&self, id: &ParcelId) -> Result<(), LifecycleError> {
        self.door(id, false).await
    }

    /// Pull remotely stored samples of the current leg that the live feed
    /// has not delivered; returns how many were added
    pub async fn sync_trail(&self, id: &ParcelId) -> Result<usize, LifecycleError> {
        let slot = self.slot(id);
        let _slot = slot.lock().await;
        let samples = self.remote.get_parcel_travels(id).await?;
        let added = self
            .store
            .merge(id, samples)
            .map_err(|e| LifecycleError::Remote(RemoteError::Protocol(e.to_string())))?;
        info!(parcel_id = %id, added, "trail_synced");
        Ok(added)
    }

    pub async fn safety_report(&self, id: &ParcelId) -> Result<SafetyReport, LifecycleError> {
        let parcel = self.load(id).await?;
        Ok(SafetyReport::from_trail(&parcel, &self.store.all(id)))
    }

    /// Whether the newest sample lies inside the arrival fence
    pub async fn has_reached_destination(&self, id: &ParcelId) -> Result<bool, LifecycleError> {
        let parcel = self.load(id).await?;
        Ok(self.check_arrival(&parcel).is_ok())
    }

    /// Record a sample; invalid samples are logged and dropped
    pub fn ingest(&self, id: &ParcelId, sample: TelemetrySample) -> bool {
        let kept = self.store.record(id, sample);
        if !kept {
            self.metrics.record_sample_rejected();
        }
        kept
    }

    /// Signed upload URL for a stage photo
    pub async fn request_photo_upload(&self, id: &ParcelId, stage: PhotoStage) -> Result<String, LifecycleError> {
        self.load(id).await?;
        Ok(self.remote.request_photo_upload_url(id, stage).await?)
    }
}
