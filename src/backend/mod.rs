//! The REST backend that owns services and incidents.
//!
//! Implementations return the raw JSON the backend answered with. Turning
//! it into canonical entities is the job of [`crate::normalize`].

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::model::{IncidentStatus, ServiceStatus};

pub use memory::MemoryBackend;
pub use rest::RestBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Resource not found")]
    NotFound,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Backend answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid backend URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Invalid JSON from backend: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BackendError {
    /// Timeouts, refused connections, 429 and 5xx are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewService {
    pub name: String,
    pub description: String,
    pub status: ServiceStatus,
}

/// Fields left as `None` are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServicePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub status: IncidentStatus,
    pub severity: Option<String>,
    pub affected_services: BTreeSet<String>,
}

impl NewIncident {
    /// The backend links one service per incident; the first affected id is
    /// the primary one.
    pub fn primary_service(&self) -> Option<&str> {
        self.affected_services.iter().next().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewIncidentUpdate {
    pub message: String,
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncidentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<IncidentStatus>,
    /// Appended to the incident's history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<NewIncidentUpdate>,
}

#[async_trait]
pub trait StatusBackend: Send + Sync {
    async fn organization_status(&self, slug: &str) -> Result<Value>;
    async fn list_organizations(&self) -> Result<Value>;

    async fn list_services(&self, organization_id: &str) -> Result<Value>;
    async fn create_service(&self, organization_id: &str, service: &NewService) -> Result<Value>;
    async fn update_service(
        &self,
        organization_id: &str,
        id: &str,
        patch: &ServicePatch,
    ) -> Result<Value>;
    async fn delete_service(&self, organization_id: &str, id: &str) -> Result<()>;

    async fn list_incidents(&self, organization_id: &str) -> Result<Value>;
    async fn create_incident(&self, organization_id: &str, incident: &NewIncident)
    -> Result<Value>;
    /// `service_id` scopes the write to the incident's primary service.
    async fn update_incident(
        &self,
        organization_id: &str,
        id: &str,
        service_id: Option<&str>,
        patch: &IncidentPatch,
    ) -> Result<Value>;
    async fn delete_incident(
        &self,
        organization_id: &str,
        id: &str,
        service_id: Option<&str>,
    ) -> Result<()>;
}
