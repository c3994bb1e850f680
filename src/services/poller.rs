//! Periodic refresh of one parcel and its remote trail

use crate::domain::types::ParcelId;
use crate::services::lifecycle::LifecycleMachine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Poller;

impl Poller {
    /// Refresh the parcel every `parcel_every` and re-sync the trail every
    /// `trail_every` until `shutdown` flips. Failures are logged and retried
    /// on the next tick.
    pub fn spawn(
        machine: Arc<LifecycleMachine>,
        parcel_id: ParcelId,
        parcel_every: Duration,
        trail_every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut parcel_tick = tokio::time::interval(parcel_every);
            parcel_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut trail_tick = tokio::time::interval(trail_every);
            trail_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(parcel_id = %parcel_id, "poller_started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = parcel_tick.tick() => {
                        match machine.refresh(&parcel_id).await {
                            Ok(parcel) => debug!(parcel_id = %parcel_id, status = %parcel.status, "parcel_refreshed"),
                            Err(e) => warn!(parcel_id = %parcel_id, error = %e, "parcel_refresh_failed"),
                        }
                    }
                    _ = trail_tick.tick() => {
                        if let Err(e) = machine.sync_trail(&parcel_id).await {
                            warn!(parcel_id = %parcel_id, error = %e, "trail_sync_failed");
                        }
                    }
                }
            }
            info!(parcel_id = %parcel_id, "poller_stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parcel::{Device, Parcel, PhotoStage, UserRef};
    use crate::domain::telemetry::{DeviceCommand, TelemetrySample};
    use crate::domain::types::UserId;
    use crate::infra::metrics::Metrics;
    use crate::io::mqtt::ChannelError;
    use crate::io::remote::{ParcelRemote, RemoteError};
    use crate::services::gateway::DeviceGateway;
    use crate::services::lifecycle::LifecycleSettings;
    use crate::services::telemetry_store::TelemetryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Remote that serves one parcel and counts reads
    struct CountingRemote {
        parcel: Parcel,
        gets: AtomicUsize,
        travels: AtomicUsize,
    }

    #[async_trait]
    impl ParcelRemote for CountingRemote {
        async fn get_parcel(&self, _id: &ParcelId) -> Result<Parcel, RemoteError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.parcel.clone())
        }
        async fn put_parcel(&self, parcel: &Parcel) -> Result<Parcel, RemoteError> {
            Ok(parcel.clone())
        }
        async fn create_parcel(&self, _sender: &UserId) -> Result<ParcelId, RemoteError> {
            Ok(self.parcel.id.clone())
        }
        async fn get_parcel_travels(&self, _id: &ParcelId) -> Result<Vec<TelemetrySample>, RemoteError> {
            self.travels.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Http("offline".into()))
        }
        async fn request_photo_upload_url(&self, _id: &ParcelId, _stage: PhotoStage) -> Result<String, RemoteError> {
            Err(RemoteError::Http("offline".into()))
        }
        async fn confirm_photo_valid(&self, _id: &ParcelId, _stage: PhotoStage) -> Result<bool, RemoteError> {
            Ok(false)
        }
        async fn send_code(&self, _id: &ParcelId, _to_user: &UserId) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn verify_code(&self, _id: &ParcelId, _code: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn advance_progress(&self, _id: &ParcelId) -> Result<Parcel, RemoteError> {
            Ok(self.parcel.clone())
        }
        async fn open_door(&self, _id: &ParcelId) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn close_door(&self, _id: &ParcelId) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    struct NoDevices;

    #[async_trait]
    impl DeviceGateway for NoDevices {
        async fn send_command(&self, _device: &Device, _command: DeviceCommand) -> Result<(), ChannelError> {
            Err(ChannelError::NotConnected)
        }
    }

    #[tokio::test]
    async fn test_polls_until_shutdown() {
        let id: ParcelId = "64b7f0c2a1d3e4f5a6b7c8d9".parse().unwrap();
        let remote = Arc::new(CountingRemote {
            parcel: Parcel::draft(id.clone(), UserRef::new("u1", "Sari")),
            gets: AtomicUsize::new(0),
            travels: AtomicUsize::new(0),
        });
        let machine = Arc::new(LifecycleMachine::new(
            remote.clone(),
            Arc::new(NoDevices),
            Arc::new(TelemetryStore::new()),
            Arc::new(Metrics::new()),
            LifecycleSettings::default(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Poller::spawn(machine, id, Duration::from_millis(20), Duration::from_millis(50), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(130)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        // Failed trail syncs do not stop the polling
        assert!(remote.gets.load(Ordering::SeqCst) >= 3);
        assert!(remote.travels.load(Ordering::SeqCst) >= 2);
    }
}
