use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::sync::Mutex;

use super::{
    BackendError, IncidentPatch, NewIncident, NewService, Result, ServicePatch, StatusBackend,
};
use crate::model::{IncidentStatus, ServiceStatus};

#[derive(Debug, Clone)]
struct StoredService {
    name: String,
    description: String,
    status: ServiceStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredUpdate {
    id: u64,
    message: String,
    status: IncidentStatus,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredIncident {
    title: String,
    description: String,
    status: IncidentStatus,
    severity: Option<String>,
    service_id: Option<String>,
    affected_services: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    updates: Vec<StoredUpdate>,
}

#[derive(Debug, Default)]
struct Organization {
    name: String,
    slug: String,
    services: BTreeMap<u64, StoredService>,
    incidents: BTreeMap<u64, StoredIncident>,
}

#[derive(Debug)]
struct Store {
    next_id: u64,
    clock: DateTime<Utc>,
    organizations: BTreeMap<String, Organization>,
}

impl Store {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Strictly increasing write timestamps.
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock = (self.clock + Duration::milliseconds(1)).max(Utc::now());
        self.clock
    }

    fn organization(&mut self, organization_id: &str) -> Result<&mut Organization> {
        self.organizations
            .get_mut(organization_id)
            .ok_or(BackendError::NotFound)
    }
}

/// A [`StatusBackend`] held in memory that answers in the relational
/// backend's casing (`ID`, `Name`, `CreatedAt`, ...).
#[derive(Debug)]
pub struct MemoryBackend {
    store: Mutex<Store>,
    offline: AtomicBool,
    status_fetches: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_id(id: &str) -> Result<u64> {
    id.parse().map_err(|_| BackendError::NotFound)
}

fn service_record(id: u64, organization_id: &str, service: &StoredService) -> Value {
    json!({
        "ID": id,
        "Name": service.name,
        "Description": service.description,
        "Status": service.status,
        "OrganizationID": organization_id,
        "CreatedAt": service.created_at,
        "UpdatedAt": service.updated_at,
    })
}

fn incident_record(id: u64, organization_id: &str, incident: &StoredIncident) -> Value {
    let updates: Vec<Value> = incident
        .updates
        .iter()
        .map(|update| {
            json!({
                "ID": update.id,
                "IncidentID": id,
                "Message": update.message,
                "Status": update.status,
                "CreatedAt": update.created_at,
            })
        })
        .collect();
    json!({
        "ID": id,
        "Title": incident.title,
        "Description": incident.description,
        "Status": incident.status,
        "Severity": incident.severity,
        "ServiceID": incident.service_id,
        "AffectedServices": incident.affected_services,
        "OrganizationID": organization_id,
        "CreatedAt": incident.created_at,
        "UpdatedAt": incident.updated_at,
        "Updates": updates,
    })
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store {
                next_id: 0,
                clock: Utc::now(),
                organizations: BTreeMap::new(),
            }),
            offline: AtomicBool::new(false),
            status_fetches: AtomicUsize::new(0),
        }
    }

    /// Registers an organization and returns its id.
    pub async fn add_organization(&self, name: &str, slug: &str) -> String {
        let mut store = self.store.lock().await;
        let id = store.next_id().to_string();
        store.organizations.insert(
            id.clone(),
            Organization {
                name: name.to_string(),
                slug: slug.to_string(),
                ..Default::default()
            },
        );
        id
    }

    /// While offline every call fails with a 503.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `organization_status` calls answered so far.
    pub fn status_fetches(&self) -> usize {
        self.status_fetches.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                body: "backend offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StatusBackend for MemoryBackend {
    async fn organization_status(&self, slug: &str) -> Result<Value> {
        self.check_online()?;
        self.status_fetches.fetch_add(1, Ordering::SeqCst);
        let store = self.store.lock().await;
        let (id, organization) = store
            .organizations
            .iter()
            .find(|(_, organization)| organization.slug == slug)
            .ok_or(BackendError::NotFound)?;
        let services: Vec<Value> = organization
            .services
            .iter()
            .map(|(service_id, service)| service_record(*service_id, id, service))
            .collect();
        let incidents: Vec<Value> = organization
            .incidents
            .iter()
            .map(|(incident_id, incident)| incident_record(*incident_id, id, incident))
            .collect();
        Ok(json!({
            "organization": {"id": id, "name": organization.name, "slug": organization.slug},
            "services": services,
            "incidents": incidents,
        }))
    }

    async fn list_organizations(&self) -> Result<Value> {
        self.check_online()?;
        let store = self.store.lock().await;
        Ok(store
            .organizations
            .iter()
            .map(|(id, organization)| {
                json!({"ID": id, "Name": organization.name, "Slug": organization.slug})
            })
            .collect())
    }

    async fn list_services(&self, organization_id: &str) -> Result<Value> {
        self.check_online()?;
        let mut store = self.store.lock().await;
        let organization = store.organization(organization_id)?;
        Ok(organization
            .services
            .iter()
            .map(|(id, service)| service_record(*id, organization_id, service))
            .collect())
    }

    async fn create_service(&self, organization_id: &str, service: &NewService) -> Result<Value> {
        self.check_online()?;
        let mut store = self.store.lock().await;
        let id = store.next_id();
        let now = store.tick();
        let stored = StoredService {
            name: service.name.clone(),
            description: service.description.clone(),
            status: service.status,
            created_at: now,
            updated_at: now,
        };
        let record = service_record(id, organization_id, &stored);
        store
            .organization(organization_id)?
            .services
            .insert(id, stored);
        Ok(record)
    }

    async fn update_service(
        &self,
        organization_id: &str,
        id: &str,
        patch: &ServicePatch,
    ) -> Result<Value> {
        self.check_online()?;
        let id = parse_id(id)?;
        let mut store = self.store.lock().await;
        let now = store.tick();
        let service = store
            .organization(organization_id)?
            .services
            .get_mut(&id)
            .ok_or(BackendError::NotFound)?;
        if let Some(name) = &patch.name {
            service.name = name.clone();
        }
        if let Some(description) = &patch.description {
            service.description = description.clone();
        }
        if let Some(status) = patch.status {
            service.status = status;
        }
        service.updated_at = now;
        Ok(service_record(id, organization_id, service))
    }

    async fn delete_service(&self, organization_id: &str, id: &str) -> Result<()> {
        self.check_online()?;
        let id = parse_id(id)?;
        let mut store = self.store.lock().await;
        store
            .organization(organization_id)?
            .services
            .remove(&id)
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }

    async fn list_incidents(&self, organization_id: &str) -> Result<Value> {
        self.check_online()?;
        let mut store = self.store.lock().await;
        let organization = store.organization(organization_id)?;
        Ok(organization
            .incidents
            .iter()
            .map(|(id, incident)| incident_record(*id, organization_id, incident))
            .collect())
    }

    async fn create_incident(
        &self,
        organization_id: &str,
        incident: &NewIncident,
    ) -> Result<Value> {
        self.check_online()?;
        let mut store = self.store.lock().await;
        let id = store.next_id();
        let now = store.tick();
        let stored = StoredIncident {
            title: incident.title.clone(),
            description: incident.description.clone(),
            status: incident.status,
            severity: incident.severity.clone(),
            service_id: incident.primary_service().map(str::to_string),
            affected_services: incident.affected_services.iter().cloned().collect(),
            created_at: now,
            updated_at: now,
            updates: Vec::new(),
        };
        let record = incident_record(id, organization_id, &stored);
        store
            .organization(organization_id)?
            .incidents
            .insert(id, stored);
        Ok(record)
    }

    async fn update_incident(
        &self,
        organization_id: &str,
        id: &str,
        _service_id: Option<&str>,
        patch: &IncidentPatch,
    ) -> Result<Value> {
        self.check_online()?;
        let id = parse_id(id)?;
        let mut store = self.store.lock().await;
        let update_id = store.next_id();
        let now = store.tick();
        let incident = store
            .organization(organization_id)?
            .incidents
            .get_mut(&id)
            .ok_or(BackendError::NotFound)?;
        if let Some(title) = &patch.title {
            incident.title = title.clone();
        }
        if let Some(description) = &patch.description {
            incident.description = description.clone();
        }
        if let Some(status) = patch.status {
            incident.status = status;
        }
        if let Some(update) = &patch.update {
            incident.status = update.status;
            incident.updates.push(StoredUpdate {
                id: update_id,
                message: update.message.clone(),
                status: update.status,
                created_at: now,
            });
        }
        incident.updated_at = now;
        Ok(incident_record(id, organization_id, incident))
    }

    async fn delete_incident(
        &self,
        organization_id: &str,
        id: &str,
        _service_id: Option<&str>,
    ) -> Result<()> {
        self.check_online()?;
        let id = parse_id(id)?;
        let mut store = self.store.lock().await;
        store
            .organization(organization_id)?
            .incidents
            .remove(&id)
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NewIncidentUpdate;
    use crate::normalize::{normalize_incident, normalize_organization_status, normalize_service};
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_records_use_backend_casing() {
        let backend = MemoryBackend::new();
        let org = backend.add_organization("Acme", "acme").await;
        let raw = backend
            .create_service(
                &org,
                &NewService {
                    name: "API".into(),
                    description: "Public API".into(),
                    status: ServiceStatus::Degraded,
                },
            )
            .await
            .unwrap();

        assert!(raw.get("ID").is_some());
        assert_eq!(raw["Status"], "degraded");
        let service = normalize_service(&raw).unwrap();
        assert_eq!(service.name, "API");
        assert_eq!(service.status, ServiceStatus::Degraded);
    }

    #[tokio::test]
    async fn test_incident_update_appends_history() {
        let backend = MemoryBackend::new();
        let org = backend.add_organization("Acme", "acme").await;
        let raw = backend
            .create_incident(
                &org,
                &NewIncident {
                    title: "Errors".into(),
                    description: String::new(),
                    status: IncidentStatus::Investigating,
                    severity: Some("high".into()),
                    affected_services: BTreeSet::from(["3".to_string()]),
                },
            )
            .await
            .unwrap();
        let id = normalize_incident(&raw).unwrap().id;

        let raw = backend
            .update_incident(
                &org,
                &id,
                Some("3"),
                &IncidentPatch {
                    update: Some(NewIncidentUpdate {
                        message: "Fixed".into(),
                        status: IncidentStatus::Resolved,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let incident = normalize_incident(&raw).unwrap();
        assert_eq!(incident.status(), IncidentStatus::Resolved);
        assert_eq!(incident.updates().len(), 1);
        assert!(incident.updated_at() > incident.created_at);
        assert!(incident.affected_services.contains("3"));
        assert_eq!(incident.severity.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn test_missing_entities_are_not_found() {
        let backend = MemoryBackend::new();
        let org = backend.add_organization("Acme", "acme").await;
        assert!(matches!(
            backend.delete_service(&org, "999").await,
            Err(BackendError::NotFound)
        ));
        assert!(matches!(
            backend.organization_status("nobody").await,
            Err(BackendError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_status_payload_and_fetch_counter() {
        let backend = MemoryBackend::new();
        let org = backend.add_organization("Acme", "acme").await;
        backend
            .create_service(
                &org,
                &NewService {
                    name: "CDN".into(),
                    description: "Edge".into(),
                    status: ServiceStatus::Operational,
                },
            )
            .await
            .unwrap();

        let status = normalize_organization_status(&backend.organization_status("acme").await.unwrap());
        assert_eq!(status.organization.unwrap().slug, "acme");
        assert_eq!(status.services.len(), 1);
        assert_eq!(backend.status_fetches(), 1);
    }

    #[tokio::test]
    async fn test_offline_backend_fails_transiently() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let err = backend.list_organizations().await.unwrap_err();
        assert!(err.is_transient());
    }
}
