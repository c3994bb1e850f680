//! Threshold verdicts over a parcel's telemetry trail

use crate::domain::parcel::Parcel;
use crate::domain::telemetry::TelemetrySample;
use crate::domain::types::Threshold;
use serde::Serialize;

/// Sensor value devices report when a reading failed
pub const INVALID_READING: f64 = -999.0;

/// Share of out-of-range readings (percent) at which a channel is unsafe
pub const UNSAFE_PERCENT: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Safe,
    Unsafe,
}

fn is_valid(reading: f64) -> bool {
    reading.is_finite() && reading != INVALID_READING
}

/// `Unsafe` once at least 5% of the valid readings fall outside `threshold`.
/// Sentinel and non-finite readings are ignored; no valid readings is `Safe`.
pub fn evaluate(threshold: &Threshold, readings: impl IntoIterator<Item = f64>) -> Verdict {
    let mut valid = 0u64;
    let mut outside = 0u64;
    for reading in readings.into_iter().filter(|r| is_valid(*r)) {
        valid += 1;
        if !threshold.contains(reading) {
            outside += 1;
        }
    }

    // outside / valid * 100 >= 5, kept in integers so 1 of 20 is exactly 5%
    if valid > 0 && outside * 100 >= UNSAFE_PERCENT * valid {
        Verdict::Unsafe
    } else {
        Verdict::Safe
    }
}

/// Per-channel verdicts. A channel is `None` when its threshold is unset or
/// there is nothing to judge yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SafetyReport {
    pub temperature: Option<Verdict>,
    pub humidity: Option<Verdict>,
}

impl SafetyReport {
    pub fn from_trail(parcel: &Parcel, trail: &[TelemetrySample]) -> Self {
        if trail.is_empty() {
            return Self { temperature: None, humidity: None };
        }
        let temperature = parcel.temp_thr.map(|thr| {
            evaluate(&thr, trail.iter().map(|s| s.temperature.unwrap_or(INVALID_READING)))
        });
        let humidity = parcel
            .hmd_thr
            .map(|thr| evaluate(&thr, trail.iter().map(|s| s.humidity.unwrap_or(INVALID_READING))));
        Self { temperature, humidity }
    }

    pub fn is_safe(&self) -> bool {
        self.temperature != Some(Verdict::Unsafe) && self.humidity != Some(Verdict::Unsafe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parcel::UserRef;
    use crate::domain::types::Coordinate;
    use chrono::Utc;

    fn thr(low: f64, high: f64) -> Threshold {
        Threshold::new(low, high).unwrap()
    }

    #[test]
    fn test_no_valid_readings_is_safe() {
        assert_eq!(evaluate(&thr(2.0, 8.0), Vec::<f64>::new()), Verdict::Safe);
        assert_eq!(evaluate(&thr(2.0, 8.0), [INVALID_READING, f64::NAN]), Verdict::Safe);
    }

    #[test]
    fn test_five_percent_boundary() {
        // 1 of 20 outside = exactly 5%
        let mut readings = vec![5.0; 19];
        readings.push(30.0);
        assert_eq!(evaluate(&thr(2.0, 8.0), readings), Verdict::Unsafe);

        // 1 of 21 outside is below 5%
        let mut readings = vec![5.0; 20];
        readings.push(30.0);
        assert_eq!(evaluate(&thr(2.0, 8.0), readings), Verdict::Safe);
    }

    #[test]
    fn test_sentinel_excluded_from_denominator() {
        // 1 outside of 10 valid; the sentinels do not dilute the ratio
        let mut readings = vec![5.0; 9];
        readings.push(30.0);
        readings.extend(std::iter::repeat(INVALID_READING).take(200));
        assert_eq!(evaluate(&thr(2.0, 8.0), readings), Verdict::Unsafe);
    }

    #[test]
    fn test_bounds_inclusive() {
        assert_eq!(evaluate(&thr(2.0, 8.0), [2.0, 8.0, 5.0]), Verdict::Safe);
    }

    #[test]
    fn test_report_from_trail() {
        let id = "64b7f0c2a1d3e4f5a6b7c8d9".parse().unwrap();
        let mut parcel = Parcel::draft(id, UserRef::new("u1", "Sender"));
        parcel.temp_thr = Some(thr(2.0, 8.0));

        assert_eq!(SafetyReport::from_trail(&parcel, &[]), SafetyReport { temperature: None, humidity: None });

        let sample = TelemetrySample {
            parcel_id: parcel.id.clone(),
            coordinate: Coordinate::new(0.0, 0.0).unwrap(),
            temperature: Some(12.0),
            humidity: None,
            door_open: false,
            signal: 0,
            speed: None,
            satellites: None,
            gps_timestamp: Utc::now(),
            recorded_at: Utc::now(),
        };
        let report = SafetyReport::from_trail(&parcel, &[sample]);
        assert_eq!(report.temperature, Some(Verdict::Unsafe));
        assert_eq!(report.humidity, None);
        assert!(!report.is_safe());
    }
}
