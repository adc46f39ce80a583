use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::aggregate::{self, DerivedView};
use crate::model::{ChannelEvent, Incident, Organization, Service};
use crate::normalize::OrganizationStatus;

/// Identifies an entity for mutation ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Service(String),
    Incident(String),
}

/// A server-confirmed write, ready to be reflected locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    UpsertService(Service),
    RemoveService(String),
    UpsertIncident(Incident),
    RemoveIncident(String),
}

impl Change {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::UpsertService(service) => EntityKey::Service(service.id.clone()),
            Self::RemoveService(id) => EntityKey::Service(id.clone()),
            Self::UpsertIncident(incident) => EntityKey::Incident(incident.id.clone()),
            Self::RemoveIncident(id) => EntityKey::Incident(id.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Stale or superseded; state untouched.
    Ignored,
    /// The message refers to something this view has never seen.
    NeedsResync,
}

/// Read-only picture of one organization's status page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Bumped every time the state changes.
    pub version: u64,
    pub last_synced: Option<DateTime<Utc>>,
    pub organization: Option<Organization>,
    pub services: BTreeMap<String, Service>,
    pub incidents: BTreeMap<String, Incident>,
    pub derived: DerivedView,
}

/// The state owned by an organization's view task.
#[derive(Debug, Default)]
pub struct StatusState {
    version: u64,
    last_synced: Option<DateTime<Utc>>,
    organization: Option<Organization>,
    services: BTreeMap<String, Service>,
    incidents: BTreeMap<String, Incident>,
    committed: HashMap<EntityKey, u64>,
}

impl StatusState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a full canonical fetch.
    pub fn replace(&mut self, status: OrganizationStatus, at: DateTime<Utc>) {
        if status.organization.is_some() {
            self.organization = status.organization;
        }
        self.services = status
            .services
            .into_iter()
            .map(|service| (service.id.clone(), service))
            .collect();
        self.incidents = status
            .incidents
            .into_iter()
            .map(|incident| (incident.id.clone(), incident))
            .collect();
        self.last_synced = Some(at);
        self.version += 1;
    }

    /// Reconcile one channel message, last write wins.
    pub fn apply_event(&mut self, event: ChannelEvent, received_at: DateTime<Utc>) -> Applied {
        let applied = match event {
            ChannelEvent::StatusChange {
                service_id,
                new_status,
                last_checked,
            } => {
                let Some(service) = self.services.get_mut(&service_id) else {
                    return Applied::NeedsResync;
                };
                // Without a timestamp the queue order is all there is.
                let changed_at =
                    last_checked.unwrap_or_else(|| received_at.max(service.last_checked));
                if changed_at < service.last_checked {
                    log::debug!(
                        "Dropping stale statusChange for service {service_id} ({changed_at} < {})",
                        service.last_checked
                    );
                    Applied::Ignored
                } else {
                    service.status = new_status;
                    service.last_checked = changed_at;
                    Applied::Changed
                }
            }
            ChannelEvent::IncidentUpdate { incident } => match self.incidents.get(&incident.id) {
                Some(held) if incident.updated_at() < held.updated_at() => {
                    log::debug!("Dropping stale incidentUpdate for incident {}", incident.id);
                    Applied::Ignored
                }
                _ => {
                    self.incidents.insert(incident.id.clone(), incident);
                    Applied::Changed
                }
            },
        };
        if applied == Applied::Changed {
            self.version += 1;
        }
        applied
    }

    /// Apply a confirmed mutation unless a newer one for the same entity
    /// already landed, either as a later ticket or over the channel.
    pub fn commit(&mut self, ticket: u64, change: Change) -> Applied {
        let key = change.key();
        if let Some(&last) = self.committed.get(&key) {
            if ticket <= last {
                log::debug!("Discarding superseded result #{ticket} for {key:?} (last #{last})");
                return Applied::Ignored;
            }
        }
        self.committed.insert(key.clone(), ticket);

        let stale = match &change {
            Change::UpsertService(service) => self
                .services
                .get(&service.id)
                .is_some_and(|held| held.last_checked > service.last_checked),
            Change::UpsertIncident(incident) => self
                .incidents
                .get(&incident.id)
                .is_some_and(|held| held.updated_at() > incident.updated_at()),
            Change::RemoveService(_) | Change::RemoveIncident(_) => false,
        };
        if stale {
            log::debug!("Discarding result #{ticket} for {key:?}, newer state already held");
            return Applied::Ignored;
        }

        match change {
            Change::UpsertService(service) => {
                self.services.insert(service.id.clone(), service);
            }
            Change::RemoveService(id) => {
                self.services.remove(&id);
            }
            Change::UpsertIncident(incident) => {
                self.incidents.insert(incident.id.clone(), incident);
            }
            Change::RemoveIncident(id) => {
                self.incidents.remove(&id);
            }
        }
        self.version += 1;
        Applied::Changed
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            last_synced: self.last_synced,
            organization: self.organization.clone(),
            services: self.services.clone(),
            incidents: self.incidents.clone(),
            derived: aggregate::derive(self.services.values(), self.incidents.values()),
        }
    }
}
