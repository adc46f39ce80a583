//! Normalization boundary between backend wire payloads and the canonical model.
//!
//! The backend answers with its native casing (`ID`, `Name`, `Status`,
//! `CreatedAt`, ...) while newer payloads and the real-time channel use
//! camelCase. Nothing here fails: malformed values fall back to documented
//! defaults and records without an identifier are skipped.

mod fields;
mod status;

pub use status::{DEFAULT_INCIDENT_STATUS, DEFAULT_SERVICE_STATUS, incident_status, service_status};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{ChannelEvent, Incident, IncidentUpdate, Organization, Service};
use fields::{Record, records};

const ID: &[&str] = &["ID", "id", "Id"];
const NAME: &[&str] = &["Name", "name"];
const STATUS: &[&str] = &["Status", "status"];
const DESCRIPTION: &[&str] = &["Description", "description"];
const LAST_CHECKED: &[&str] = &["lastChecked", "LastChecked", "UpdatedAt", "updatedAt"];
const CREATED_AT: &[&str] = &["CreatedAt", "createdAt", "created_at"];
const TITLE: &[&str] = &["Title", "title"];
const SEVERITY: &[&str] = &["Severity", "severity"];
const UPDATES: &[&str] = &["Updates", "updates"];
const AFFECTED_SERVICES: &[&str] = &["AffectedServices", "affectedServices", "affected_services"];
const SERVICE_ID: &[&str] = &["ServiceID", "serviceId", "service_id"];
const UPDATE_TIMESTAMP: &[&str] = &["timestamp", "Timestamp", "CreatedAt", "createdAt"];
const MESSAGE: &[&str] = &["Message", "message"];
const SLUG: &[&str] = &["Slug", "slug"];
const MESSAGE_TYPE: &[&str] = &["type", "Type"];
const CHANGED_SERVICE_ID: &[&str] = &["serviceId", "ServiceID", "service_id"];
const NEW_STATUS: &[&str] = &["newStatus", "NewStatus", "status"];
const INCIDENT: &[&str] = &["incident", "Incident"];

/// Full state of one organization's status page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationStatus {
    pub organization: Option<Organization>,
    pub services: Vec<Service>,
    pub incidents: Vec<Incident>,
}

pub fn normalize_services(raw: &Value) -> Vec<Service> {
    normalize_services_at(raw, Utc::now())
}

pub fn normalize_services_at(raw: &Value, now: DateTime<Utc>) -> Vec<Service> {
    records(raw)
        .iter()
        .filter_map(|record| normalize_service_at(record, now))
        .collect()
}

pub fn normalize_service(raw: &Value) -> Option<Service> {
    normalize_service_at(raw, Utc::now())
}

pub fn normalize_service_at(raw: &Value, now: DateTime<Utc>) -> Option<Service> {
    let Some(record) = Record::new(raw) else {
        log::warn!("Skipping service record that is not an object: {raw}");
        return None;
    };
    let Some(id) = record.id(ID) else {
        log::warn!("Skipping service record without an id: {raw}");
        return None;
    };

    Some(Service {
        name: record.non_empty_string(NAME).unwrap_or_else(|| id.clone()),
        status: service_status(record.string(STATUS).as_deref()),
        last_checked: record.timestamp(LAST_CHECKED).unwrap_or(now),
        description: record.non_empty_string(DESCRIPTION),
        id,
    })
}

pub fn normalize_incidents(raw: &Value) -> Vec<Incident> {
    normalize_incidents_at(raw, Utc::now())
}

pub fn normalize_incidents_at(raw: &Value, now: DateTime<Utc>) -> Vec<Incident> {
    records(raw)
        .iter()
        .filter_map(|record| normalize_incident_at(record, now))
        .collect()
}

pub fn normalize_incident(raw: &Value) -> Option<Incident> {
    normalize_incident_at(raw, Utc::now())
}

pub fn normalize_incident_at(raw: &Value, now: DateTime<Utc>) -> Option<Incident> {
    let Some(record) = Record::new(raw) else {
        log::warn!("Skipping incident record that is not an object: {raw}");
        return None;
    };
    let Some(id) = record.id(ID) else {
        log::warn!("Skipping incident record without an id: {raw}");
        return None;
    };

    let raw_status = record.string(STATUS);
    let base_status = incident_status(raw_status.as_deref());
    let created_at = record.timestamp(CREATED_AT).unwrap_or(now);

    let mut affected: Vec<String> = record
        .array(AFFECTED_SERVICES)
        .iter()
        .filter_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    // The relational backend links a single service per incident.
    if let Some(service_id) = record.id(SERVICE_ID).filter(|id| id != "0") {
        affected.push(service_id);
    }

    let updates = record
        .array(UPDATES)
        .iter()
        .enumerate()
        .filter_map(|(index, update)| {
            normalize_update(update, &id, index, raw_status.as_deref(), now)
        })
        .collect::<Vec<_>>();

    let mut incident = Incident::new(
        id.clone(),
        record.non_empty_string(TITLE).unwrap_or(id),
        base_status,
        created_at,
    )
    .with_affected_services(affected)
    .with_updates(updates);
    incident.description = record.non_empty_string(DESCRIPTION);
    incident.severity = record
        .non_empty_string(SEVERITY)
        .map(|severity| severity.trim().to_lowercase());

    Some(incident)
}

/// Updates without their own status inherit the incident's raw status.
fn normalize_update(
    raw: &Value,
    incident_id: &str,
    index: usize,
    incident_status_raw: Option<&str>,
    now: DateTime<Utc>,
) -> Option<IncidentUpdate> {
    let Some(record) = Record::new(raw) else {
        log::warn!("Skipping update of incident {incident_id} that is not an object");
        return None;
    };
    let status_raw = record.string(STATUS);
    Some(IncidentUpdate {
        id: record
            .id(ID)
            .unwrap_or_else(|| format!("{incident_id}-update-{index}")),
        timestamp: record.timestamp(UPDATE_TIMESTAMP).unwrap_or(now),
        message: record.string(MESSAGE).unwrap_or_default(),
        status: incident_status(status_raw.as_deref().or(incident_status_raw)),
    })
}

pub fn normalize_organization(raw: &Value) -> Option<Organization> {
    let record = Record::new(raw)?;
    let id = record.id(ID)?;
    let slug = record.non_empty_string(SLUG).unwrap_or_else(|| id.clone());
    Some(Organization {
        name: record.non_empty_string(NAME).unwrap_or_else(|| slug.clone()),
        slug,
        id,
    })
}

pub fn normalize_organizations(raw: &Value) -> Vec<Organization> {
    records(raw)
        .iter()
        .filter_map(normalize_organization)
        .collect()
}

/// Payload of `GET /organizations/:slug/status`.
pub fn normalize_organization_status(raw: &Value) -> OrganizationStatus {
    normalize_organization_status_at(raw, Utc::now())
}

pub fn normalize_organization_status_at(raw: &Value, now: DateTime<Utc>) -> OrganizationStatus {
    let Some(record) = Record::new(raw) else {
        log::warn!("Organization status payload is not an object");
        return OrganizationStatus {
            organization: None,
            services: Vec::new(),
            incidents: Vec::new(),
        };
    };

    let organization = record
        .get(&["organization", "Organization"])
        .and_then(normalize_organization);
    let services = record
        .get(&["services", "Services"])
        .map(|raw| normalize_services_at(raw, now))
        .unwrap_or_default();
    let incidents = record
        .get(&["incidents", "Incidents"])
        .map(|raw| normalize_incidents_at(raw, now))
        .unwrap_or_default();

    OrganizationStatus {
        organization,
        services,
        incidents,
    }
}

/// Decodes one real-time channel message. Unknown message types and
/// messages without a usable payload yield `None`.
pub fn normalize_channel_event(raw: &Value) -> Option<ChannelEvent> {
    normalize_channel_event_at(raw, Utc::now())
}

pub fn normalize_channel_event_at(raw: &Value, now: DateTime<Utc>) -> Option<ChannelEvent> {
    let record = Record::new(raw)?;
    match record.string(MESSAGE_TYPE)?.as_str() {
        "statusChange" => {
            let Some(service_id) = record.id(CHANGED_SERVICE_ID) else {
                log::warn!("Dropping statusChange without a service id: {raw}");
                return None;
            };
            Some(ChannelEvent::StatusChange {
                service_id,
                new_status: service_status(record.string(NEW_STATUS).as_deref()),
                last_checked: record.timestamp(LAST_CHECKED),
            })
        }
        "incidentUpdate" => {
            let incident = record
                .get(INCIDENT)
                .and_then(|incident| normalize_incident_at(incident, now))?;
            Some(ChannelEvent::IncidentUpdate { incident })
        }
        other => {
            log::debug!("Ignoring channel message of type {other:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IncidentStatus, ServiceStatus};
    use chrono::TimeZone;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_backend_casing_services() {
        let raw = json!([
            {"ID": 1, "Name": "API", "Status": "operational", "UpdatedAt": "2024-06-01T11:00:00Z"},
            {"ID": 2, "Name": "Database", "Status": "degraded_performance", "Description": "Primary"},
        ]);
        let services = normalize_services_at(&raw, now());

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].id, "1");
        assert_eq!(services[0].status, ServiceStatus::Operational);
        assert_eq!(
            services[0].last_checked,
            Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap()
        );
        assert_eq!(services[1].status, ServiceStatus::Degraded);
        assert_eq!(services[1].last_checked, now());
        assert_eq!(services[1].description.as_deref(), Some("Primary"));
    }

    #[test]
    fn test_camel_case_services() {
        let raw = json!([
            {"id": "svc-a", "name": "CDN", "status": "major_outage", "lastChecked": "2024-06-01T10:00:00Z"},
        ]);
        let services = normalize_services_at(&raw, now());
        assert_eq!(services[0].id, "svc-a");
        assert_eq!(services[0].name, "CDN");
        assert_eq!(services[0].status, ServiceStatus::MajorOutage);
    }

    #[test]
    fn test_bad_records_are_skipped_not_fatal() {
        let raw = json!([42, {"Name": "no id"}, {"ID": 3, "Status": 17}]);
        let services = normalize_services_at(&raw, now());
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "3");
        assert_eq!(services[0].name, "3");
        assert_eq!(services[0].status, ServiceStatus::Operational);
    }

    #[test]
    fn test_incident_updated_at_follows_last_update() {
        let raw = json!({
            "ID": 9,
            "Title": "Checkout errors",
            "Status": "investigating",
            "CreatedAt": "2024-06-01T08:00:00Z",
            "UpdatedAt": "2024-06-01T08:00:00Z",
            "ServiceID": 2,
            "Updates": [
                {"ID": 2, "CreatedAt": "2024-06-01T10:00:00Z", "Message": "Fixed", "Status": "resolved"},
                {"ID": 1, "CreatedAt": "2024-06-01T09:00:00Z", "Message": "Looking", "Status": "investigating"},
            ]
        });
        let incident = normalize_incident_at(&raw, now()).unwrap();

        assert_eq!(incident.id, "9");
        assert_eq!(incident.status(), IncidentStatus::Resolved);
        assert_eq!(
            incident.updated_at(),
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
        );
        assert!(incident.affected_services.contains("2"));
        assert_eq!(incident.updates()[0].message, "Looking");
    }

    #[test]
    fn test_incident_without_updates_uses_created_at() {
        let raw = json!({
            "id": "inc-1",
            "title": "Slow search",
            "status": "monitoring",
            "createdAt": "2024-06-01T07:00:00Z",
            "updatedAt": "2024-06-01T09:30:00Z",
            "affectedServices": ["a", "b"],
        });
        let incident = normalize_incident_at(&raw, now()).unwrap();
        assert_eq!(incident.status(), IncidentStatus::Monitoring);
        assert_eq!(incident.updated_at(), incident.created_at);
        assert_eq!(incident.affected_services.len(), 2);
    }

    #[test]
    fn test_update_without_status_inherits_incident_status() {
        let raw = json!({
            "ID": 3,
            "Title": "DNS",
            "Status": "identified",
            "CreatedAt": "2024-06-01T07:00:00Z",
            "Updates": [{"Message": "Root cause found", "CreatedAt": "2024-06-01T07:30:00Z"}],
        });
        let incident = normalize_incident_at(&raw, now()).unwrap();
        assert_eq!(incident.updates()[0].status, IncidentStatus::Identified);
        assert_eq!(incident.updates()[0].id, "3-update-0");
    }

    #[test]
    fn test_incident_severity_is_carried() {
        let raw = json!({"ID": 4, "Title": "Disk", "Severity": " High "});
        let incident = normalize_incident_at(&raw, now()).unwrap();
        assert_eq!(incident.severity.as_deref(), Some("high"));

        let raw = json!({"ID": 5, "Title": "Disk", "Severity": ""});
        assert_eq!(normalize_incident_at(&raw, now()).unwrap().severity, None);
    }

    #[test]
    fn test_organization_status_payload() {
        let raw = json!({
            "organization": {"id": 4, "name": "Acme", "slug": "acme"},
            "services": [{"ID": 1, "Name": "API", "Status": "partial_outage"}],
            "incidents": [{"ID": 5, "Title": "API errors", "Status": "investigating"}],
        });
        let status = normalize_organization_status_at(&raw, now());

        assert_eq!(
            status.organization,
            Some(Organization {
                id: "4".into(),
                name: "Acme".into(),
                slug: "acme".into(),
            })
        );
        assert_eq!(status.services[0].status, ServiceStatus::PartialOutage);
        assert_eq!(status.incidents[0].title, "API errors");
    }

    #[test]
    fn test_organization_status_garbage_is_empty() {
        let status = normalize_organization_status_at(&json!("oops"), now());
        assert!(status.organization.is_none());
        assert!(status.services.is_empty());
        assert!(status.incidents.is_empty());
    }

    #[test]
    fn test_channel_status_change() {
        let raw = json!({"type": "statusChange", "seq": 4, "serviceId": 12, "newStatus": "Major Outage"});
        assert_eq!(
            normalize_channel_event_at(&raw, now()),
            Some(ChannelEvent::StatusChange {
                service_id: "12".into(),
                new_status: ServiceStatus::MajorOutage,
                last_checked: None,
            })
        );
    }

    #[test]
    fn test_channel_incident_update_round_trips_canonical_form() {
        let incident = Incident::new("5", "Queue backlog", IncidentStatus::Identified, now())
            .with_affected_services(["2"]);
        let raw = serde_json::to_value(ChannelEvent::IncidentUpdate {
            incident: incident.clone(),
        })
        .unwrap();
        assert_eq!(
            normalize_channel_event_at(&raw, now()),
            Some(ChannelEvent::IncidentUpdate { incident })
        );
    }

    #[test]
    fn test_channel_unknown_or_incomplete_messages() {
        assert!(normalize_channel_event_at(&json!({"type": "ping"}), now()).is_none());
        assert!(normalize_channel_event_at(&json!({"type": "statusChange"}), now()).is_none());
        assert!(normalize_channel_event_at(&json!({"type": "incidentUpdate"}), now()).is_none());
        assert!(normalize_channel_event_at(&json!([1, 2]), now()).is_none());
    }

    #[quickcheck]
    fn prop_normalizer_never_panics_on_arbitrary_status(status: String, name: String) -> bool {
        let raw = json!([{"ID": 1, "Name": name, "Status": status}]);
        normalize_services_at(&raw, now()).len() == 1
    }

    #[quickcheck]
    fn prop_incident_with_two_updates_derives_from_latest(t1: u32, gap: u16) -> bool {
        let t1 = i64::from(t1);
        let t2 = t1 + i64::from(gap) + 1;
        let first = Utc.timestamp_opt(t1, 0).unwrap();
        let second = Utc.timestamp_opt(t2, 0).unwrap();
        let raw = json!({
            "ID": 1,
            "Title": "x",
            "Status": "investigating",
            "CreatedAt": first.to_rfc3339(),
            "Updates": [
                {"ID": "u1", "timestamp": first.to_rfc3339(), "Status": "investigating"},
                {"ID": "u2", "timestamp": second.to_rfc3339(), "Status": "resolved"},
            ],
        });
        let incident = normalize_incident_at(&raw, now()).unwrap();
        incident.updated_at() == second && incident.status() == IncidentStatus::Resolved
    }
}
