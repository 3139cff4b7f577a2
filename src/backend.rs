use crate::config::{self, AgentConfig};
use crate::error::{BackendError, ConfigError};
use crate::types::{LastKnownLocation, PositionSample};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const CSRF_HEADER: &str = "X-CSRFToken";

/// `{success, error?}` contract shared by the backend's POST endpoints
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        ApiResponse {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: &str) -> Self {
        ApiResponse {
            success: false,
            error: Some(error.to_string()),
        }
    }

    /// Server-supplied error text, or `fallback` when there is none
    pub fn error_or(&self, fallback: &str) -> String {
        match self.error.as_deref() {
            Some(msg) if !msg.trim().is_empty() => msg.to_string(),
            _ => fallback.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: f64,
    pub accuracy: f64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl LocationReport {
    pub fn from_sample(sample: &PositionSample, sequence: Option<u64>) -> Self {
        LocationReport {
            latitude: sample.latitude,
            longitude: sample.longitude,
            speed: sample.speed_kph,
            accuracy: sample.accuracy_meters,
            timestamp: sample.timestamp.clone(),
            sequence,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssueReport {
    pub bus_id: String,
    pub issue: String,
    pub location: Option<LastKnownLocation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyReport {
    pub bus_id: String,
    pub location: Option<LastKnownLocation>,
    pub reason: String,
}

impl EmergencyReport {
    pub fn emergency_stop(bus_id: &str, location: Option<LastKnownLocation>) -> Self {
        EmergencyReport {
            bus_id: bus_id.to_string(),
            location,
            reason: "emergency_stop".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeofenceResponse {
    #[serde(default)]
    pub inside_geofence: bool,
    #[serde(default)]
    pub geofence_name: Option<String>,
}

/// `{prefix}{bus_id}/` with the id escaped as one segment
fn bus_path(prefix: &str, bus_id: &str) -> String {
    format!("{}{}/", prefix, config::path_segment(bus_id))
}

/// Every call the agent makes to the backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn report_location(
        &self,
        bus_id: &str,
        report: &LocationReport,
    ) -> Result<ApiResponse, BackendError>;

    async fn start_trip(&self, bus_id: &str) -> Result<ApiResponse, BackendError>;

    async fn end_trip(&self, bus_id: &str) -> Result<ApiResponse, BackendError>;

    async fn report_issue(&self, report: &IssueReport) -> Result<ApiResponse, BackendError>;

    /// Response body is ignored; only transport failures are reported.
    async fn emergency_stop(&self, report: &EmergencyReport) -> Result<(), BackendError>;

    async fn check_geofence(
        &self,
        bus_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<GeofenceResponse, BackendError>;
}

/// reqwest-backed [`Backend`]
///
/// Every request carries the session cookie and the `X-CSRFToken` header
/// taken from its `csrftoken` entry.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    cookie: String,
    csrf_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &AgentConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(HttpBackend {
            client,
            base_url: config.base_url()?,
            cookie: config.cookie.clone(),
            csrf_token: config.csrf_token(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, BackendError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| BackendError::Url(format!("{}: {}", path, e)))?;

        let mut builder = self.client.request(method, url);
        if !self.cookie.is_empty() {
            builder = builder.header(reqwest::header::COOKIE, self.cookie.as_str());
        }
        if let Some(token) = &self.csrf_token {
            builder = builder.header(CSRF_HEADER, token.as_str());
        }
        Ok(builder)
    }

    /// Send and decode a JSON body. The backend answers application errors
    /// with a JSON body on non-2xx statuses too, so the body wins over the
    /// status whenever it parses.
    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, BackendError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str(&body) {
            Ok(value) => Ok(value),
            Err(_) if !status.is_success() => Err(BackendError::Http(status.as_u16())),
            Err(e) => Err(BackendError::Decode(e.to_string())),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn report_location(
        &self,
        bus_id: &str,
        report: &LocationReport,
    ) -> Result<ApiResponse, BackendError> {
        let path = bus_path("/tracking/update-location/", bus_id);
        let builder = self.request(Method::POST, &path)?.json(report);
        Self::send_json(builder).await
    }

    async fn start_trip(&self, bus_id: &str) -> Result<ApiResponse, BackendError> {
        let builder = self.request(Method::POST, &bus_path("/api/trips/start/", bus_id))?;
        Self::send_json(builder).await
    }

    async fn end_trip(&self, bus_id: &str) -> Result<ApiResponse, BackendError> {
        let builder = self.request(Method::POST, &bus_path("/api/trips/end/", bus_id))?;
        Self::send_json(builder).await
    }

    async fn report_issue(&self, report: &IssueReport) -> Result<ApiResponse, BackendError> {
        let builder = self.request(Method::POST, "/api/issues/report/")?.json(report);
        Self::send_json(builder).await
    }

    async fn emergency_stop(&self, report: &EmergencyReport) -> Result<(), BackendError> {
        self.request(Method::POST, "/api/emergency/stop/")?
            .json(report)
            .send()
            .await?;
        Ok(())
    }

    async fn check_geofence(
        &self,
        bus_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<GeofenceResponse, BackendError> {
        let builder = self.request(Method::GET, "/api/geofences/check/")?.query(&[
            ("lat", latitude.to_string()),
            ("lng", longitude.to_string()),
            ("bus_id", bus_id.to_string()),
        ]);
        Self::send_json(builder).await
    }
}
