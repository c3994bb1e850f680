use super::{LifecycleError, LifecycleMachine, ParcelSlot, Transition};
use crate::domain::parcel::{validate_description, validate_name, Parcel, ParcelStatus, PhotoStage};
use crate::domain::telemetry::DeviceCommand;
use crate::domain::types::ParcelId;
use crate::io::remote::RemoteError;
use crate::services::geofence::Fence;
use tracing::{info, warn};

impl LifecycleMachine {
    pub(super) async fn fetch(&self, id: &ParcelId) -> Result<Parcel, LifecycleError> {
        let parcel = self.remote.get_parcel(id).await.map_err(|e| match e {
            RemoteError::Status { code: 404, .. } => LifecycleError::UnknownParcel(id.clone()),
            other => LifecycleError::Remote(other),
        })?;
        if &parcel.id != id {
            return Err(RemoteError::Protocol(format!("asked for parcel {id}, got {}", parcel.id)).into());
        }
        Ok(parcel)
    }

    pub(super) fn current(&self, slot: &ParcelSlot, id: &ParcelId) -> Result<Parcel, LifecycleError> {
        slot.parcel.clone().ok_or_else(|| LifecycleError::UnknownParcel(id.clone()))
    }

    pub(super) async fn ensure_loaded(&self, slot: &mut ParcelSlot, id: &ParcelId) -> Result<Parcel, LifecycleError> {
        if let Some(parcel) = &slot.parcel {
            return Ok(parcel.clone());
        }
        let parcel = self.fetch(id).await?;
        self.adopt(slot, parcel, None)?;
        self.current(slot, id)
    }

    /// Install the remote copy. With no `expected` status the parcel may stay
    /// where it is or move on by one stage; otherwise it must stay or land on
    /// `expected`. A stage change closes the code challenge of the previous stage.
    pub(super) fn adopt(
        &self,
        slot: &mut ParcelSlot,
        incoming: Parcel,
        expected: Option<ParcelStatus>,
    ) -> Result<(), LifecycleError> {
        if let Some(current) = &slot.parcel {
            if incoming.id != current.id {
                return Err(RemoteError::Protocol(format!("parcel {} answered for {}", incoming.id, current.id)).into());
            }
            let allowed = expected.or_else(|| current.status.next());
            if incoming.status != current.status && Some(incoming.status) != allowed {
                warn!(parcel_id = %current.id, from = %current.status, got = %incoming.status, "remote_status_rejected");
                return Err(RemoteError::Protocol(format!(
                    "parcel {} moved from {} to {}",
                    current.id, current.status, incoming.status
                ))
                .into());
            }
        }

        let previous = slot.parcel.as_ref().map(|p| p.status);
        if previous != Some(incoming.status) {
            slot.code_verified = false;
            slot.last_code_sent = None;
        }
        slot.parcel = Some(incoming);
        Ok(())
    }

    pub(super) async fn advance_locked(&self, slot: &mut ParcelSlot, id: &ParcelId) -> Result<Transition, LifecycleError> {
        let parcel = self.ensure_loaded(slot, id).await?;
        let from = parcel.status;
        let Some(expected) = from.next() else {
            return Err(LifecycleError::precondition(from, "delivery is complete"));
        };
        self.check_guard(slot, &parcel).await?;

        let stored = self.remote.advance_progress(id).await?;
        self.adopt(slot, stored, Some(expected))?;
        let parcel = self.current(slot, id)?;
        if parcel.status == from {
            return Ok(Transition { parcel, from, command_error: None });
        }
        Ok(self.entered(from, parcel).await)
    }

    /// Bookkeeping and device effects of a confirmed stage change
    pub(super) async fn entered(&self, from: ParcelStatus, parcel: Parcel) -> Transition {
        self.metrics.record_transition();
        info!(parcel_id = %parcel.id, from = %from, to = %parcel.status, "stage_advanced");
        let command_error = self.enter_stage(&parcel).await;
        Transition { parcel, from, command_error }
    }

    async fn check_guard(&self, slot: &ParcelSlot, parcel: &Parcel) -> Result<(), LifecycleError> {
        let from = parcel.status;
        let fail = |reason: String| LifecycleError::precondition(from, reason);

        match from {
            ParcelStatus::Draft => {
                validate_name(&parcel.name).map_err(|e| fail(e.to_string()))?;
                validate_description(&parcel.description).map_err(|e| fail(e.to_string()))?;
                if parcel.pick_up_coor.is_none() || parcel.arrived_coor.is_none() {
                    return Err(fail("pick-up and destination must be set".into()));
                }
                // Threshold construction already enforces low <= high
                if parcel.temp_thr.is_none() || parcel.hmd_thr.is_none() {
                    return Err(fail("temperature and humidity thresholds must be set".into()));
                }
                if parcel.receiver.is_none() {
                    return Err(fail("receiver must be set".into()));
                }
            }
            ParcelStatus::WaitingForCourier => {
                if parcel.device.is_none() {
                    return Err(fail("no device bound".into()));
                }
                if parcel.courier.is_none() {
                    return Err(fail("no courier bound".into()));
                }
            }
            ParcelStatus::PickUp => self.check_photo(parcel, PhotoStage::PickUp).await?,
            ParcelStatus::OnGoing => {
                if !slot.code_verified {
                    return Err(fail("receiver code not verified".into()));
                }
                self.check_arrival(parcel).map_err(fail)?;
            }
            ParcelStatus::Arrived => self.check_photo(parcel, PhotoStage::Arrived).await?,
            ParcelStatus::Done => return Err(fail("delivery is complete".into())),
        }
        Ok(())
    }

    async fn check_photo(&self, parcel: &Parcel, stage: PhotoStage) -> Result<(), LifecycleError> {
        if parcel.photo_for(stage).is_none() {
            return Err(LifecycleError::precondition(parcel.status, format!("no {} photo", stage.status())));
        }
        if !self.remote.confirm_photo_valid(&parcel.id, stage).await? {
            return Err(LifecycleError::precondition(parcel.status, format!("{} photo rejected", stage.status())));
        }
        Ok(())
    }

    /// `Err(reason)` unless the newest sample lies inside the arrival fence
    pub(super) fn check_arrival(&self, parcel: &Parcel) -> Result<(), String> {
        let Some(destination) = parcel.arrived_coor else {
            return Err("no destination set".into());
        };
        let Some(latest) = self.store.latest(&parcel.id) else {
            return Err("no telemetry received".into());
        };
        let fence = Fence::new(destination, self.settings.radii.arrival_m);
        if !fence.contains(&latest.coordinate) {
            return Err(format!(
                "parcel is {:.0} m from destination, needs {:.0} m",
                fence.distance_to(&latest.coordinate),
                fence.radius_m
            ));
        }
        Ok(())
    }

    /// Stage entry effects. Returns the command failure, if any.
    async fn enter_stage(&self, parcel: &Parcel) -> Option<String> {
        let command = match parcel.status {
            ParcelStatus::OnGoing => {
                self.store.clear(&parcel.id);
                match parcel.arrived_coor {
                    Some(destination) => DeviceCommand::Start(destination),
                    None => return Some("no destination to track toward".into()),
                }
            }
            ParcelStatus::Arrived => DeviceCommand::End,
            _ => return None,
        };
        let cmd = command.name();

        let Some(device) = &parcel.device else {
            warn!(parcel_id = %parcel.id, cmd, "device_command_skipped");
            return Some("no device bound".into());
        };
        match self.devices.send_command(device, command).await {
            Ok(()) => {
                info!(parcel_id = %parcel.id, device = %device.name, cmd, "device_command_sent");
                None
            }
            Err(e) => {
                warn!(parcel_id = %parcel.id, device = %device.name, cmd, error = %e, "device_command_failed");
                Some(e.to_string())
            }
        }
    }

    pub(super) async fn door(&self, id: &ParcelId, open: bool) -> Result<(), LifecycleError> {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        let parcel = self.ensure_loaded(&mut slot, id).await?;
        if !matches!(parcel.status, ParcelStatus::PickUp | ParcelStatus::Arrived) {
            return Err(LifecycleError::precondition(parcel.status, "door is locked outside pick-up and arrival"));
        }
        if open {
            self.remote.open_door(id).await?;
        } else {
            self.remote.close_door(id).await?;
        }
        info!(parcel_id = %id, open, "door_command_sent");
        Ok(())
    }
}
