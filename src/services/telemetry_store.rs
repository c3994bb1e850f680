//! Append-only telemetry log, one trail per parcel
//!
//! Each trail sits behind its own `RwLock`, so readers of one parcel never
//! wait on writers of another and always observe whole samples.

use crate::domain::telemetry::TelemetrySample;
use crate::domain::types::ParcelId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("invalid sample for parcel {parcel_id}: {reason}")]
    InvalidSample { parcel_id: ParcelId, reason: String },
}

/// Samples of the current leg plus the moment the leg began
#[derive(Default)]
struct TrailState {
    samples: Vec<TelemetrySample>,
    leg_start: Option<DateTime<Utc>>,
}

type Trail = Arc<RwLock<TrailState>>;

#[derive(Default)]
pub struct TelemetryStore {
    trails: Mutex<FxHashMap<ParcelId, Trail>>,
}

fn check_order(parcel_id: &ParcelId, prev: Option<&TelemetrySample>, sample: &TelemetrySample) -> Result<(), TelemetryError> {
    if &sample.parcel_id != parcel_id {
        return Err(TelemetryError::InvalidSample {
            parcel_id: parcel_id.clone(),
            reason: format!("sample belongs to parcel {}", sample.parcel_id),
        });
    }
    if let Some(prev) = prev {
        if sample.recorded_at < prev.recorded_at {
            return Err(TelemetryError::InvalidSample {
                parcel_id: parcel_id.clone(),
                reason: format!("recorded_at {} precedes {}", sample.recorded_at, prev.recorded_at),
            });
        }
    }
    Ok(())
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn trail(&self, parcel_id: &ParcelId) -> Trail {
        self.trails.lock().entry(parcel_id.clone()).or_default().clone()
    }

    fn existing(&self, parcel_id: &ParcelId) -> Option<Trail> {
        self.trails.lock().get(parcel_id).cloned()
    }

    /// Append a sample. Equal timestamps are accepted; earlier ones are not.
    pub fn append(&self, parcel_id: &ParcelId, sample: TelemetrySample) -> Result<(), TelemetryError> {
        let trail = self.trail(parcel_id);
        let mut trail = trail.write();
        check_order(parcel_id, trail.samples.last(), &sample)?;
        trail.samples.push(sample);
        Ok(())
    }

    /// Append, logging and dropping a rejected sample. Returns whether it was kept.
    pub fn record(&self, parcel_id: &ParcelId, sample: TelemetrySample) -> bool {
        match self.append(parcel_id, sample) {
            Ok(()) => true,
            Err(e) => {
                warn!(parcel_id = %parcel_id, error = %e, "telemetry_sample_dropped");
                false
            }
        }
    }

    pub fn latest(&self, parcel_id: &ParcelId) -> Option<TelemetrySample> {
        self.existing(parcel_id)?.read().samples.last().cloned()
    }

    /// Snapshot of the whole trail, oldest first
    pub fn all(&self, parcel_id: &ParcelId) -> Vec<TelemetrySample> {
        self.existing(parcel_id).map(|trail| trail.read().samples.clone()).unwrap_or_default()
    }

    pub fn len(&self, parcel_id: &ParcelId) -> usize {
        self.existing(parcel_id).map(|trail| trail.read().samples.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, parcel_id: &ParcelId) -> bool {
        self.len(parcel_id) == 0
    }

    /// Start a new leg. The leg begins at the newest sample dropped, or now
    /// when the trail was already empty.
    pub fn clear(&self, parcel_id: &ParcelId) {
        let trail = self.trail(parcel_id);
        let mut trail = trail.write();
        let leg_start = trail.samples.last().map_or_else(Utc::now, |s| s.recorded_at);
        trail.leg_start = Some(trail.leg_start.map_or(leg_start, |prev| prev.max(leg_start)));
        trail.samples.clear();
    }

    /// Add the samples of a remotely stored trail that are newer than both
    /// the local trail and the start of the leg. Returns how many were added.
    /// Nothing is added if the remote trail is out of order or mixes parcels.
    pub fn merge(&self, parcel_id: &ParcelId, remote: Vec<TelemetrySample>) -> Result<usize, TelemetryError> {
        let mut prev = None;
        for sample in &remote {
            check_order(parcel_id, prev, sample)?;
            prev = Some(sample);
        }

        let trail = self.trail(parcel_id);
        let mut trail = trail.write();
        let floor = match (trail.samples.last().map(|s| s.recorded_at), trail.leg_start) {
            (Some(last), Some(leg)) => Some(last.max(leg)),
            (last, leg) => last.or(leg),
        };
        let before = trail.samples.len();
        trail
            .samples
            .extend(remote.into_iter().filter(|s| floor.map_or(true, |floor| s.recorded_at > floor)));
        Ok(trail.samples.len() - before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Coordinate;
    use chrono::{DateTime, Duration, Utc};

    fn pid(tail: char) -> ParcelId {
        format!("64b7f0c2a1d3e4f5a6b7c8d{tail}").parse().unwrap()
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn sample(parcel_id: &ParcelId, offset_secs: i64, temp: f64) -> TelemetrySample {
        TelemetrySample {
            parcel_id: parcel_id.clone(),
            coordinate: Coordinate::new(-6.2, 106.8).unwrap(),
            temperature: Some(temp),
            humidity: Some(60.0),
            door_open: false,
            signal: 20,
            speed: None,
            satellites: None,
            gps_timestamp: base() + Duration::seconds(offset_secs),
            recorded_at: base() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_append_and_latest() {
        let store = TelemetryStore::new();
        let p = pid('1');
        assert!(store.latest(&p).is_none());

        store.append(&p, sample(&p, 0, 4.0)).unwrap();
        store.append(&p, sample(&p, 10, 5.0)).unwrap();
        // Equal timestamp accepted
        store.append(&p, sample(&p, 10, 6.0)).unwrap();

        assert_eq!(store.len(&p), 3);
        assert_eq!(store.latest(&p).unwrap().temperature, Some(6.0));
    }

    #[test]
    fn test_rejects_out_of_order() {
        let store = TelemetryStore::new();
        let p = pid('1');
        store.append(&p, sample(&p, 10, 4.0)).unwrap();
        let err = store.append(&p, sample(&p, 5, 5.0)).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidSample { .. }));
        assert_eq!(store.len(&p), 1);
        assert_eq!(store.latest(&p).unwrap().temperature, Some(4.0));
    }

    #[test]
    fn test_rejects_foreign_parcel() {
        let store = TelemetryStore::new();
        let (a, b) = (pid('1'), pid('2'));
        assert!(store.append(&a, sample(&b, 0, 4.0)).is_err());
        assert!(store.is_empty(&a));
        assert!(store.is_empty(&b));
    }

    #[test]
    fn test_clear_and_independent_parcels() {
        let store = TelemetryStore::new();
        let (a, b) = (pid('1'), pid('2'));
        store.append(&a, sample(&a, 0, 4.0)).unwrap();
        store.append(&b, sample(&b, 0, 4.0)).unwrap();
        store.clear(&a);
        assert!(store.all(&a).is_empty());
        assert_eq!(store.len(&b), 1);
        // After clear any timestamp is accepted again
        store.append(&a, sample(&a, -100, 1.0)).unwrap();
    }

    #[test]
    fn test_merge_validates() {
        let store = TelemetryStore::new();
        let p = pid('1');
        store.append(&p, sample(&p, 0, 1.0)).unwrap();

        let unordered = vec![sample(&p, 20, 2.0), sample(&p, 10, 3.0)];
        assert!(store.merge(&p, unordered).is_err());
        assert_eq!(store.len(&p), 1);

        let foreign = vec![sample(&pid('2'), 30, 2.0)];
        assert!(store.merge(&p, foreign).is_err());
        assert_eq!(store.len(&p), 1);
    }

    #[test]
    fn test_merge_keeps_newer_local_samples() {
        let store = TelemetryStore::new();
        let p = pid('1');
        store.append(&p, sample(&p, 100, 7.0)).unwrap();

        // Remote copy lags behind the live feed
        let added = store.merge(&p, vec![sample(&p, 0, 1.0), sample(&p, 50, 2.0)]).unwrap();
        assert_eq!(added, 0);
        assert_eq!(store.latest(&p).unwrap().temperature, Some(7.0));

        let added = store.merge(&p, vec![sample(&p, 50, 2.0), sample(&p, 120, 3.0), sample(&p, 140, 4.0)]).unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.len(&p), 3);
        assert_eq!(store.latest(&p).unwrap().temperature, Some(4.0));
    }

    #[test]
    fn test_merge_skips_previous_leg() {
        let store = TelemetryStore::new();
        let p = pid('1');
        store.append(&p, sample(&p, 0, 1.0)).unwrap();
        store.append(&p, sample(&p, 60, 2.0)).unwrap();
        store.clear(&p);

        let added = store.merge(&p, vec![sample(&p, 0, 1.0), sample(&p, 60, 2.0), sample(&p, 90, 3.0)]).unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.latest(&p).unwrap().temperature, Some(3.0));

        // Clearing an empty trail starts the leg now, so anything older stays out
        store.clear(&p);
        store.clear(&p);
        assert_eq!(store.merge(&p, vec![sample(&p, 200, 4.0)]).unwrap(), 0);
        assert!(store.is_empty(&p));
    }

    #[test]
    fn test_concurrent_appends_keep_order() {
        let store = Arc::new(TelemetryStore::new());
        let p = pid('1');
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let p = p.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        // Same timestamp from every writer, so all appends succeed
                        store.append(&p, sample(&p, i / 100, i as f64)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let trail = store.all(&p);
        assert_eq!(trail.len(), 400);
        assert!(trail.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at));
    }
}
