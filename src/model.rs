//! Canonical status-page entities.
//!
//! Everything past the normalization boundary works with these types only.
//! Wire formats are handled in [`crate::normalize`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;

/// Health of a single service, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Operational,
    Degraded,
    PartialOutage,
    MajorOutage,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 4] = [
        Self::Operational,
        Self::Degraded,
        Self::PartialOutage,
        Self::MajorOutage,
    ];
}

impl AsRef<str> for ServiceStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Operational => "operational",
            Self::Degraded => "degraded",
            Self::PartialOutage => "partial_outage",
            Self::MajorOutage => "major_outage",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(String);

/// Strict parsing for operator input. Backend payloads go through
/// [`crate::normalize`] instead, which never fails.
impl std::str::FromStr for ServiceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_ref() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

impl IncidentStatus {
    pub const ALL: [IncidentStatus; 4] = [
        Self::Investigating,
        Self::Identified,
        Self::Monitoring,
        Self::Resolved,
    ];
}

impl AsRef<str> for IncidentStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Investigating => "investigating",
            Self::Identified => "identified",
            Self::Monitoring => "monitoring",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_ref() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub status: ServiceStatus,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single entry of an incident's history. Never edited once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentUpdate {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    /// Free-form, e.g. `critical`, `high`, `medium` or `low`.
    pub severity: Option<String>,
    /// Status reported while the incident has no updates.
    pub base_status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub affected_services: BTreeSet<String>,
    /// Sorted by `(timestamp, id)` ascending.
    updates: Vec<IncidentUpdate>,
}

impl Incident {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        base_status: IncidentStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            severity: None,
            base_status,
            created_at,
            affected_services: BTreeSet::new(),
            updates: Vec::new(),
        }
    }

    pub fn with_affected_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_services
            .extend(services.into_iter().map(Into::into));
        self
    }

    pub fn with_updates(mut self, updates: impl IntoIterator<Item = IncidentUpdate>) -> Self {
        for update in updates {
            self.append_update(update);
        }
        self
    }

    /// Insert an update at its chronological position.
    pub fn append_update(&mut self, update: IncidentUpdate) {
        let at = self
            .updates
            .partition_point(|u| (u.timestamp, &u.id) <= (update.timestamp, &update.id));
        self.updates.insert(at, update);
    }

    pub fn updates(&self) -> &[IncidentUpdate] {
        &self.updates
    }

    /// The status of the most recent update, or the base status if there is none.
    pub fn status(&self) -> IncidentStatus {
        self.updates
            .last()
            .map(|u| u.status)
            .unwrap_or(self.base_status)
    }

    /// Timestamp of the most recent update, never earlier than `created_at`.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updates
            .last()
            .map(|u| u.timestamp.max(self.created_at))
            .unwrap_or(self.created_at)
    }

    pub fn is_active(&self) -> bool {
        self.status() != IncidentStatus::Resolved
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IncidentRecord<'a> {
    id: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<&'a str>,
    status: IncidentStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    affected_services: &'a BTreeSet<String>,
    updates: &'a [IncidentUpdate],
}

impl Serialize for Incident {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        IncidentRecord {
            id: &self.id,
            title: &self.title,
            description: self.description.as_deref(),
            severity: self.severity.as_deref(),
            status: self.status(),
            created_at: self.created_at,
            updated_at: self.updated_at(),
            affected_services: &self.affected_services,
            updates: &self.updates,
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    IncidentCreated,
    StatusUpdated,
    Resolved,
}

/// Derived from incident state; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
}

/// A change pushed to viewers over the real-time channel.
///
/// Serializes to the wire envelope `{"type": "statusChange", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelEvent {
    #[serde(rename_all = "camelCase")]
    StatusChange {
        service_id: String,
        new_status: ServiceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_checked: Option<DateTime<Utc>>,
    },
    IncidentUpdate { incident: Incident },
}

impl ChannelEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChange { .. } => "statusChange",
            Self::IncidentUpdate { .. } => "incidentUpdate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn update(id: &str, secs: i64, status: IncidentStatus) -> IncidentUpdate {
        IncidentUpdate {
            id: id.to_string(),
            timestamp: at(secs),
            message: format!("update {id}"),
            status,
        }
    }

    #[test]
    fn test_status_follows_latest_update() {
        let incident = Incident::new("1", "Database down", IncidentStatus::Investigating, at(100))
            .with_updates([
                update("b", 300, IncidentStatus::Resolved),
                update("a", 200, IncidentStatus::Investigating),
            ]);

        assert_eq!(incident.status(), IncidentStatus::Resolved);
        assert_eq!(incident.updated_at(), at(300));
        assert_eq!(incident.updates()[0].id, "a");
    }

    #[test]
    fn test_append_rederives_updated_at() {
        let mut incident =
            Incident::new("1", "Latency", IncidentStatus::Investigating, at(100));
        assert_eq!(incident.updated_at(), at(100));
        assert_eq!(incident.status(), IncidentStatus::Investigating);

        incident.append_update(update("a", 150, IncidentStatus::Identified));
        assert_eq!(incident.updated_at(), at(150));
        assert_eq!(incident.status(), IncidentStatus::Identified);

        incident.append_update(update("b", 250, IncidentStatus::Monitoring));
        assert_eq!(incident.updated_at(), at(250));
        assert_eq!(incident.status(), IncidentStatus::Monitoring);
    }

    #[test]
    fn test_updated_at_never_before_created_at() {
        let incident = Incident::new("1", "Clock skew", IncidentStatus::Investigating, at(500))
            .with_updates([update("a", 100, IncidentStatus::Identified)]);
        assert_eq!(incident.updated_at(), at(500));
    }

    #[test]
    fn test_incident_serializes_derived_fields() {
        let incident = Incident::new("7", "Outage", IncidentStatus::Investigating, at(100))
            .with_affected_services(["svc-1"])
            .with_updates([update("a", 200, IncidentStatus::Resolved)]);

        let json = serde_json::to_value(&incident).unwrap();
        assert_eq!(json["status"], "resolved");
        assert_eq!(json["updatedAt"], serde_json::to_value(at(200)).unwrap());
        assert_eq!(json["affectedServices"][0], "svc-1");
        assert!(json.get("description").is_none());
    }

    #[test]
    fn test_channel_event_wire_shape() {
        let event = ChannelEvent::StatusChange {
            service_id: "3".into(),
            new_status: ServiceStatus::PartialOutage,
            last_checked: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "statusChange", "serviceId": "3", "newStatus": "partial_outage"})
        );
        assert_eq!(event.kind(), "statusChange");
    }

    #[test]
    fn test_strict_status_parsing() {
        assert_eq!("major_outage".parse::<ServiceStatus>().unwrap(), ServiceStatus::MajorOutage);
        assert_eq!("resolved".parse::<IncidentStatus>().unwrap(), IncidentStatus::Resolved);
        assert!("Major Outage".parse::<ServiceStatus>().is_err());
    }

    #[test]
    fn test_service_status_severity_order() {
        assert!(ServiceStatus::MajorOutage > ServiceStatus::PartialOutage);
        assert!(ServiceStatus::PartialOutage > ServiceStatus::Degraded);
        assert!(ServiceStatus::Degraded > ServiceStatus::Operational);
    }
}
