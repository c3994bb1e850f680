//! Persistence service client
//!
//! `ParcelRemote` is the contract the lifecycle machine talks to. The remote
//! service owns parcel state; every stage change goes through it and its
//! answer is authoritative. `HttpParcelRemote` speaks the service's JSON API.

use crate::domain::parcel::{Parcel, ParcelStatus, Photo, PhotoStage};
use crate::domain::telemetry::TelemetrySample;
use crate::domain::types::{deserialize_timestamp, Coordinate, ParcelId, Threshold, UserId};
use crate::infra::config::Config;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// Transport failure (connect, timeout, TLS)
    #[error("remote unavailable: {0}")]
    Http(String),
    #[error("remote returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("remote response undecodable: {0}")]
    Decode(String),
    /// The service understood the request and refused it
    #[error("remote rejected request: {0}")]
    Rejected(String),
    /// The service answered something that contradicts local state
    #[error("remote protocol violation: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait ParcelRemote: Send + Sync {
    async fn get_parcel(&self, id: &ParcelId) -> Result<Parcel, RemoteError>;

    /// Persist descriptive fields and bindings; returns the stored parcel
    async fn put_parcel(&self, parcel: &Parcel) -> Result<Parcel, RemoteError>;

    async fn create_parcel(&self, sender: &UserId) -> Result<ParcelId, RemoteError>;

    async fn get_parcel_travels(&self, id: &ParcelId) -> Result<Vec<TelemetrySample>, RemoteError>;

    /// Signed URL the caller uploads the stage photo to
    async fn request_photo_upload_url(&self, id: &ParcelId, stage: PhotoStage) -> Result<String, RemoteError>;

    /// Whether the service accepts the uploaded photo for `stage`
    async fn confirm_photo_valid(&self, id: &ParcelId, stage: PhotoStage) -> Result<bool, RemoteError>;

    async fn send_code(&self, id: &ParcelId, to_user: &UserId) -> Result<(), RemoteError>;

    /// `Err(RemoteError::Rejected)` when the code is wrong or expired
    async fn verify_code(&self, id: &ParcelId, code: &str) -> Result<(), RemoteError>;

    /// Move the parcel to its next stage; returns the parcel as stored
    async fn advance_progress(&self, id: &ParcelId) -> Result<Parcel, RemoteError>;

    async fn open_door(&self, id: &ParcelId) -> Result<(), RemoteError>;

    async fn close_door(&self, id: &ParcelId) -> Result<(), RemoteError>;
}

/// PUT body: relations are sent as ids
#[derive(Debug, Serialize)]
struct ParcelUpdateBody<'a> {
    id: &'a ParcelId,
    name: &'a str,
    description: &'a str,
    pick_up_coor: Option<Coordinate>,
    arrived_coor: Option<Coordinate>,
    pick_up_photo: Option<PhotoStamp>,
    arrived_photo: Option<PhotoStamp>,
    temp_thr: Option<Threshold>,
    hmd_thr: Option<Threshold>,
    receiver_id: Option<&'a UserId>,
    sender_id: Option<&'a UserId>,
    courier_id: Option<&'a UserId>,
    device_id: Option<String>,
    status: ParcelStatus,
}

#[derive(Debug, Serialize)]
struct PhotoStamp {
    updated_at: DateTime<Utc>,
}

impl From<&Photo> for PhotoStamp {
    fn from(photo: &Photo) -> Self {
        Self { updated_at: photo.updated_at }
    }
}

impl<'a> From<&'a Parcel> for ParcelUpdateBody<'a> {
    fn from(parcel: &'a Parcel) -> Self {
        Self {
            id: &parcel.id,
            name: &parcel.name,
            description: &parcel.description,
            pick_up_coor: parcel.pick_up_coor,
            arrived_coor: parcel.arrived_coor,
            pick_up_photo: parcel.pick_up_photo.as_ref().map(PhotoStamp::from),
            arrived_photo: parcel.arrived_photo.as_ref().map(PhotoStamp::from),
            temp_thr: parcel.temp_thr,
            hmd_thr: parcel.hmd_thr,
            receiver_id: parcel.receiver.as_ref().map(|u| &u.id),
            sender_id: parcel.sender.as_ref().map(|u| &u.id),
            courier_id: parcel.courier.as_ref().map(|u| &u.id),
            device_id: parcel.device.as_ref().map(|d| d.id.to_string()),
            status: parcel.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedBody {
    id: ParcelId,
}

#[derive(Debug, Deserialize)]
struct UploadUrlBody {
    url: String,
}

#[derive(Debug, Deserialize)]
struct TravelsBody {
    #[serde(default)]
    parcel_travels: Option<Vec<TravelDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DoorStatus {
    Bool(bool),
    Int(i64),
}

/// One stored telemetry point as the service returns it
#[derive(Debug, Deserialize)]
struct TravelDto {
    parcel_id: ParcelId,
    coor: Coordinate,
    #[serde(default)]
    temp: Option<f64>,
    #[serde(default)]
    hmd: Option<f64>,
    door_status: DoorStatus,
    #[serde(default)]
    sgnl: i32,
    #[serde(default)]
    spd: Option<f64>,
    #[serde(default)]
    stls: Option<u32>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    gps_ts: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    ts: DateTime<Utc>,
}

impl From<TravelDto> for TelemetrySample {
    fn from(dto: TravelDto) -> Self {
        Self {
            parcel_id: dto.parcel_id,
            coordinate: dto.coor,
            temperature: dto.temp,
            humidity: dto.hmd,
            door_open: match dto.door_status {
                DoorStatus::Bool(open) => open,
                DoorStatus::Int(v) => v != 0,
            },
            signal: dto.sgnl,
            speed: dto.spd,
            satellites: dto.stls,
            gps_timestamp: dto.gps_ts,
            recorded_at: dto.ts,
        }
    }
}

/// Decode a travels response, oldest first
fn decode_travels(body: &str) -> Result<Vec<TelemetrySample>, RemoteError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
    if !value.is_object() {
        return Err(RemoteError::Decode("travels response is not an object".into()));
    }
    let parsed: TravelsBody = serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))?;
    let mut samples: Vec<TelemetrySample> =
        parsed.parcel_travels.unwrap_or_default().into_iter().map(TelemetrySample::from).collect();
    samples.sort_by_key(|s| s.recorded_at);
    Ok(samples)
}

pub struct HttpParcelRemote {
    /// Base URL without trailing slash
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

impl HttpParcelRemote {
    pub fn new(mut base_url: String, auth_token: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        let trimmed_len = base_url.trim_end_matches('/').len();
        base_url.truncate(trimmed_len);
        Ok(Self { base_url, auth_token, client })
    }

    pub fn from_config(config: &Config) -> Result<Self, RemoteError> {
        Self::new(
            config.remote_base_url().to_string(),
            config.remote_token().map(str::to_string),
            config.remote_timeout(),
        )
    }

    fn headers(&self) -> Result<HeaderMap, RemoteError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| RemoteError::Http("invalid auth token".to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and return the status with the raw body
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, String), RemoteError> {
        let response = request
            .headers(self.headers()?)
            .send()
            .await
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok((status, body))
    }

    async fn expect_ok(&self, request: reqwest::RequestBuilder) -> Result<String, RemoteError> {
        let (status, body) = self.send(request).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(RemoteError::Status { code: status.as_u16(), body })
        }
    }

    async fn expect_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, RemoteError> {
        let body = self.expect_ok(request).await?;
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST
            | StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::UNPROCESSABLE_ENTITY
    )
}

#[async_trait]
impl ParcelRemote for HttpParcelRemote {
    async fn get_parcel(&self, id: &ParcelId) -> Result<Parcel, RemoteError> {
        let url = self.url(&format!("/parcel/one/{id}"));
        self.expect_json(self.client.get(url)).await
    }

    async fn put_parcel(&self, parcel: &Parcel) -> Result<Parcel, RemoteError> {
        let body = ParcelUpdateBody::from(parcel);
        self.expect_ok(self.client.put(self.url("/parcel/")).json(&body)).await?;
        debug!(parcel_id = %parcel.id, "remote_parcel_updated");
        self.get_parcel(&parcel.id).await
    }

    async fn create_parcel(&self, sender: &UserId) -> Result<ParcelId, RemoteError> {
        let body = serde_json::json!({ "sender_id": sender });
        let created: CreatedBody = self.expect_json(self.client.post(self.url("/parcel/")).json(&body)).await?;
        Ok(created.id)
    }

    async fn get_parcel_travels(&self, id: &ParcelId) -> Result<Vec<TelemetrySample>, RemoteError> {
        let request = self.client.get(self.url("/parcel_travel/")).query(&[("parcel_id", id.as_str())]);
        let body = self.expect_ok(request).await?;
        decode_travels(&body)
    }

    async fn request_photo_upload_url(&self, id: &ParcelId, stage: PhotoStage) -> Result<String, RemoteError> {
        let body = serde_json::json!({ "id": id, "status": stage });
        let reply: UploadUrlBody = self.expect_json(self.client.post(self.url("/parcel/photo/url")).json(&body)).await?;
        Ok(reply.url)
    }

    async fn confirm_photo_valid(&self, id: &ParcelId, stage: PhotoStage) -> Result<bool, RemoteError> {
        let body = serde_json::json!({ "id": id, "status": stage });
        let (status, text) = self.send(self.client.post(self.url("/parcel/photo/check")).json(&body)).await?;
        if status.is_success() {
            Ok(true)
        } else if is_rejection(status) {
            debug!(parcel_id = %id, status = %status, body = %text, "remote_photo_rejected");
            Ok(false)
        } else {
            Err(RemoteError::Status { code: status.as_u16(), body: text })
        }
    }

    async fn send_code(&self, id: &ParcelId, to_user: &UserId) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "id": id, "to_user_id": to_user });
        self.expect_ok(self.client.post(self.url("/parcel/code/send")).json(&body)).await?;
        Ok(())
    }

    async fn verify_code(&self, id: &ParcelId, code: &str) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "id": id, "code": code });
        let (status, text) = self.send(self.client.post(self.url("/parcel/code/verify")).json(&body)).await?;
        if status.is_success() {
            Ok(())
        } else if is_rejection(status) {
            Err(RemoteError::Rejected(text))
        } else {
            Err(RemoteError::Status { code: status.as_u16(), body: text })
        }
    }

    async fn advance_progress(&self, id: &ParcelId) -> Result<Parcel, RemoteError> {
        let body = serde_json::json!({ "id": id });
        self.expect_json(self.client.post(self.url("/parcel/progress")).json(&body)).await
    }

    async fn open_door(&self, id: &ParcelId) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "id": id });
        self.expect_ok(self.client.post(self.url("/parcel/open")).json(&body)).await?;
        Ok(())
    }

    async fn close_door(&self, id: &ParcelId) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "id": id });
        self.expect_ok(self.client.post(self.url("/parcel/close")).json(&body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parcel::{Device, UserRef};

    #[test]
    fn test_decode_travels_sorts_and_maps() {
        let body = r#"{"parcel_travels": [
            {"id": "t2", "parcel_id": "64b7f0c2a1d3e4f5a6b7c8d9", "coor": {"lat": 1.0, "lng": 2.0},
             "temp": 5.0, "hmd": null, "door_status": 1, "sgnl": 20, "spd": 3.5, "stls": 8,
             "gps_ts": "2024-03-01T08:01:00Z", "ts": "2024-03-01T08:01:00Z"},
            {"id": "t1", "parcel_id": "64b7f0c2a1d3e4f5a6b7c8d9", "coor": {"lat": 1.0, "lng": 2.0},
             "temp": 4.0, "hmd": 60.0, "door_status": false, "sgnl": 20,
             "gps_ts": 1709280000000, "ts": 1709280000000}
        ]}"#;
        let samples = decode_travels(body).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].temperature, Some(4.0));
        assert!(!samples[0].door_open);
        assert!(samples[1].door_open);
        assert_eq!(samples[1].humidity, None);
        assert_eq!(samples[1].satellites, Some(8));
    }

    #[test]
    fn test_decode_travels_missing_list() {
        assert!(decode_travels(r#"{"parcel_travels": null}"#).unwrap().is_empty());
        assert!(decode_travels("{}").unwrap().is_empty());
        assert!(matches!(decode_travels("[]"), Err(RemoteError::Decode(_))));
        assert!(matches!(decode_travels(r#"[[{"id": "t0"}]]"#), Err(RemoteError::Decode(_))));
    }

    #[test]
    fn test_update_body_sends_ids() {
        let mut parcel = Parcel::draft("64b7f0c2a1d3e4f5a6b7c8d9".parse().unwrap(), UserRef::new("u1", "Sender"));
        parcel.receiver = Some(UserRef::new("u2", "Receiver"));
        parcel.device = Some(Device {
            id: "aaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            name: "box01".to_string(),
            status: Default::default(),
        });
        let json = serde_json::to_value(ParcelUpdateBody::from(&parcel)).unwrap();
        assert_eq!(json["sender_id"], "u1");
        assert_eq!(json["receiver_id"], "u2");
        assert_eq!(json["device_id"], "aaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(json["courier_id"], serde_json::Value::Null);
        assert_eq!(json["status"], 0);
    }

    #[test]
    fn test_base_url_trimmed() {
        let remote = HttpParcelRemote::new("http://api.local/".to_string(), None, Duration::from_secs(1)).unwrap();
        assert_eq!(remote.url("/parcel/progress"), "http://api.local/parcel/progress");
    }

    #[test]
    fn test_rejection_statuses() {
        assert!(is_rejection(StatusCode::BAD_REQUEST));
        assert!(is_rejection(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_rejection(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_rejection(StatusCode::NOT_FOUND));
    }
}
