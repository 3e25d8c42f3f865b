use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::model::OfflineIncident;

/// Identifier assigned by the server on a successful submission.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct ServerIncidentId(pub String);

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("invalid submission url: {reason}")]
    InvalidUrl { reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("submission timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },

    #[error("server rejected submission with status {code}")]
    Status { code: u16 },

    #[error("could not read photo '{uri}': {reason}")]
    PhotoUnreadable { uri: String, reason: String },

    #[error("unparseable server response: {0}")]
    InvalidResponse(String),
}

/// The remote incident-submission endpoint, consumed not implemented.
/// Any failure leaves the caller's record untouched; success hands
/// back the server-assigned identifier.
#[async_trait]
pub trait SubmissionEndpoint: Send + Sync {
    async fn submit(&self, incident: &OfflineIncident) -> Result<ServerIncidentId, SubmitError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

/// Multipart POST to the Watchpost incident API.
pub struct HttpEndpoint {
    client: reqwest::Client,
    submit_url: Url,
}

impl HttpEndpoint {
    pub fn new(submit_url: Url) -> Result<Self, SubmitError> {
        let scheme = submit_url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(SubmitError::InvalidUrl {
                reason: format!("invalid scheme '{scheme}', only http and https are allowed"),
            });
        }
        if submit_url.host_str().is_none() {
            return Err(SubmitError::InvalidUrl {
                reason: "url must have a host".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        Ok(Self { client, submit_url })
    }

    async fn build_form(&self, incident: &OfflineIncident) -> Result<Form, SubmitError> {
        let mut form = Form::new()
            .text("title", incident.title.clone())
            .text("description", incident.description.clone())
            .text("priority", incident.priority.as_str());

        if let Some(location) = incident.location {
            form = form
                .text("location_lat", location.lat().to_string())
                .text("location_lng", location.lon().to_string());
        }
        if let Some(address) = &incident.location_address {
            form = form.text("location_address", address.clone());
        }

        if let Some(photo) = &incident.photo {
            let bytes = tokio::fs::read(&photo.uri).await.map_err(|e| {
                SubmitError::PhotoUnreadable {
                    uri: photo.uri.clone(),
                    reason: e.to_string(),
                }
            })?;
            let file_name = Path::new(&photo.uri)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "photo".to_string());
            form = form.part("photo", Part::bytes(bytes).file_name(file_name));
        }

        Ok(form)
    }
}

#[async_trait]
impl SubmissionEndpoint for HttpEndpoint {
    async fn submit(&self, incident: &OfflineIncident) -> Result<ServerIncidentId, SubmitError> {
        let form = self.build_form(incident).await?;

        let response = self
            .client
            .post(self.submit_url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubmitError::Status {
                code: status.as_u16(),
            });
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| SubmitError::InvalidResponse(e.to_string()))?;

        Ok(ServerIncidentId(body.id))
    }
}
