//! Admin writes against the backend.
//!
//! Nothing is applied locally until the backend confirms it: the view only
//! ever receives the normalized record the server answered with. Each
//! request takes a ticket before it leaves, and the view drops a result if
//! a later ticket for the same entity was already committed.

use log::{debug, info, warn};
use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::backend::{
    BackendError, IncidentPatch, NewIncident, NewIncidentUpdate, NewService, ServicePatch,
    StatusBackend,
};
use crate::model::{ChannelEvent, Incident, IncidentStatus, Service, ServiceStatus};
use crate::normalize::{DEFAULT_INCIDENT_STATUS, normalize_incident, normalize_service};
use crate::realtime::Publisher;
use crate::view::{Change, ViewError, ViewHandle};

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("Missing required fields: {}", .0.join(", "))]
    Validation(Vec<&'static str>),
    #[error("No organization selected")]
    MissingOrganization,
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Backend answered with a record that could not be read")]
    InvalidResponse,
}

pub type Result<T> = std::result::Result<T, MutationError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ServiceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentInput {
    pub title: Option<String>,
    pub description: Option<String>,
    /// Defaults to `investigating`.
    pub status: Option<IncidentStatus>,
    pub severity: Option<String>,
    pub affected_services: BTreeSet<String>,
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl ServiceInput {
    fn validate(&self) -> Result<NewService> {
        let name = present(&self.name);
        let description = present(&self.description);
        let mut missing = Vec::new();
        if name.is_none() {
            missing.push("name");
        }
        if self.status.is_none() {
            missing.push("status");
        }
        if description.is_none() {
            missing.push("description");
        }
        match (name, self.status, description) {
            (Some(name), Some(status), Some(description)) => Ok(NewService {
                name,
                description,
                status,
            }),
            _ => Err(MutationError::Validation(missing)),
        }
    }

    fn into_patch(self) -> ServicePatch {
        ServicePatch {
            name: present(&self.name),
            description: present(&self.description),
            status: self.status,
        }
    }
}

impl IncidentInput {
    fn validate(&self) -> Result<NewIncident> {
        let title = present(&self.title);
        let affected_services: BTreeSet<String> = self
            .affected_services
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        let mut missing = Vec::new();
        if title.is_none() {
            missing.push("title");
        }
        if affected_services.is_empty() {
            missing.push("affected_services");
        }
        match title {
            Some(title) if missing.is_empty() => Ok(NewIncident {
                title,
                description: present(&self.description).unwrap_or_default(),
                status: self.status.unwrap_or(DEFAULT_INCIDENT_STATUS),
                severity: present(&self.severity),
                affected_services,
            }),
            _ => Err(MutationError::Validation(missing)),
        }
    }
}

pub struct MutationController {
    backend: Arc<dyn StatusBackend>,
    view: ViewHandle,
    organization_id: Option<String>,
    publisher: Option<Arc<dyn Publisher>>,
    tickets: AtomicU64,
}

impl MutationController {
    pub fn new(backend: Arc<dyn StatusBackend>, view: ViewHandle) -> Self {
        Self {
            backend,
            view,
            organization_id: None,
            publisher: None,
            tickets: AtomicU64::new(0),
        }
    }

    /// Scope writes to this organization instead of the one the view loaded.
    pub fn with_organization_id(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Announce confirmed writes to the view's other viewers.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn organization_id(&self) -> Result<String> {
        self.organization_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                self.view
                    .snapshot()
                    .organization
                    .as_ref()
                    .map(|organization| organization.id.clone())
            })
            .ok_or(MutationError::MissingOrganization)
    }

    fn ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The backend scopes incident writes by the incident's primary service.
    fn incident_service(&self, incident_id: &str) -> Option<String> {
        self.view
            .snapshot()
            .incidents
            .get(incident_id)
            .and_then(|incident| incident.affected_services.iter().next().cloned())
    }

    async fn commit(&self, ticket: u64, change: Change) {
        match self.view.commit(ticket, change).await {
            Ok(()) => {}
            Err(ViewError::Closed(slug)) => {
                debug!("View of {slug} closed, discarding result #{ticket}");
            }
            Err(e) => warn!("Failed to commit result #{ticket}: {e}"),
        }
    }

    async fn announce(&self, event: ChannelEvent) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(e) = publisher.publish(self.view.slug(), &event).await {
            warn!("Failed to announce {} for {}: {e}", event.kind(), self.view.slug());
        }
    }

    async fn confirm_service(&self, ticket: u64, raw: serde_json::Value) -> Result<Service> {
        let Some(service) = normalize_service(&raw) else {
            // The write went through; reload instead of guessing.
            let _ = self.view.resync().await;
            return Err(MutationError::InvalidResponse);
        };
        self.commit(ticket, Change::UpsertService(service.clone()))
            .await;
        self.announce(ChannelEvent::StatusChange {
            service_id: service.id.clone(),
            new_status: service.status,
            last_checked: Some(service.last_checked),
        })
        .await;
        Ok(service)
    }

    async fn confirm_incident(&self, ticket: u64, raw: serde_json::Value) -> Result<Incident> {
        let Some(incident) = normalize_incident(&raw) else {
            let _ = self.view.resync().await;
            return Err(MutationError::InvalidResponse);
        };
        self.commit(ticket, Change::UpsertIncident(incident.clone()))
            .await;
        self.announce(ChannelEvent::IncidentUpdate {
            incident: incident.clone(),
        })
        .await;
        Ok(incident)
    }

    pub async fn create_service(&self, input: ServiceInput) -> Result<Service> {
        let service = input.validate()?;
        let organization_id = self.organization_id()?;
        let ticket = self.ticket();

        let raw = self.backend.create_service(&organization_id, &service).await?;
        let service = self.confirm_service(ticket, raw).await?;
        info!("Created service {} ({})", service.id, service.name);
        Ok(service)
    }

    pub async fn update_service(&self, id: &str, changes: ServiceInput) -> Result<Service> {
        let organization_id = self.organization_id()?;
        let ticket = self.ticket();

        let raw = self
            .backend
            .update_service(&organization_id, id, &changes.into_patch())
            .await?;
        let service = self.confirm_service(ticket, raw).await?;
        info!("Updated service {}", service.id);
        Ok(service)
    }

    /// Deleting something that is already gone succeeds.
    pub async fn delete_service(&self, id: &str) -> Result<()> {
        let organization_id = self.organization_id()?;
        let ticket = self.ticket();

        match self.backend.delete_service(&organization_id, id).await {
            Ok(()) => info!("Deleted service {id}"),
            Err(BackendError::NotFound) => info!("Service {id} was already gone"),
            Err(e) => return Err(e.into()),
        }
        self.commit(ticket, Change::RemoveService(id.to_string()))
            .await;
        Ok(())
    }

    pub async fn create_incident(&self, input: IncidentInput) -> Result<Incident> {
        let incident = input.validate()?;
        let organization_id = self.organization_id()?;
        let ticket = self.ticket();

        let raw = self
            .backend
            .create_incident(&organization_id, &incident)
            .await?;
        let incident = self.confirm_incident(ticket, raw).await?;
        info!("Opened incident {} ({})", incident.id, incident.title);
        Ok(incident)
    }

    /// A status change is recorded as a new history entry, since an
    /// incident's status is that of its latest update.
    pub async fn update_incident(&self, id: &str, mut patch: IncidentPatch) -> Result<Incident> {
        if let Some(status) = patch.status.filter(|_| patch.update.is_none()) {
            patch.update = Some(NewIncidentUpdate {
                message: format!("Status changed to {status}"),
                status,
            });
        }
        let organization_id = self.organization_id()?;
        let ticket = self.ticket();
        let service_id = self.incident_service(id);

        let raw = self
            .backend
            .update_incident(&organization_id, id, service_id.as_deref(), &patch)
            .await?;
        let incident = self.confirm_incident(ticket, raw).await?;
        info!("Updated incident {} (now {})", incident.id, incident.status());
        Ok(incident)
    }

    /// Append to an incident's history; its status follows the new entry.
    pub async fn add_incident_update(
        &self,
        id: &str,
        message: &str,
        status: IncidentStatus,
    ) -> Result<Incident> {
        let message = message.trim();
        if message.is_empty() {
            return Err(MutationError::Validation(vec!["message"]));
        }
        let patch = IncidentPatch {
            update: Some(NewIncidentUpdate {
                message: message.to_string(),
                status,
            }),
            ..Default::default()
        };
        self.update_incident(id, patch).await
    }

    pub async fn delete_incident(&self, id: &str) -> Result<()> {
        let organization_id = self.organization_id()?;
        let ticket = self.ticket();
        let service_id = self.incident_service(id);

        match self
            .backend
            .delete_incident(&organization_id, id, service_id.as_deref())
            .await
        {
            Ok(()) => info!("Deleted incident {id}"),
            Err(BackendError::NotFound) => info!("Incident {id} was already gone"),
            Err(e) => return Err(e.into()),
        }
        self.commit(ticket, Change::RemoveIncident(id.to_string()))
            .await;
        Ok(())
    }
}
