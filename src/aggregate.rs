//! Views derived from an organization's services and incidents.
//!
//! Everything here is a pure function of its inputs: it is re-run from the
//! full entity set after every change instead of being patched incrementally.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{Incident, Service, ServiceStatus, TimelineEvent, TimelineEventType};

pub const UNKNOWN_SERVICE_NAME: &str = "Unknown Service";

/// Worst-case severity across all services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    #[default]
    Operational,
    Degraded,
    MajorOutage,
}

impl AggregateStatus {
    pub fn headline(&self) -> &'static str {
        match self {
            Self::Operational => "All systems operational",
            Self::Degraded => "Partial system degradation",
            Self::MajorOutage => "System outage detected",
        }
    }
}

impl From<ServiceStatus> for AggregateStatus {
    fn from(status: ServiceStatus) -> Self {
        match status {
            ServiceStatus::Operational => Self::Operational,
            ServiceStatus::Degraded | ServiceStatus::PartialOutage => Self::Degraded,
            ServiceStatus::MajorOutage => Self::MajorOutage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedView {
    pub aggregate: AggregateStatus,
    pub active_incidents: Vec<Incident>,
    pub timeline: Vec<TimelineEvent>,
}

pub fn aggregate_status<'a>(services: impl IntoIterator<Item = &'a Service>) -> AggregateStatus {
    services
        .into_iter()
        .map(|service| AggregateStatus::from(service.status))
        .max()
        .unwrap_or(AggregateStatus::Operational)
}

/// Unresolved incidents, most recently updated first.
pub fn active_incidents<'a>(incidents: impl IntoIterator<Item = &'a Incident>) -> Vec<Incident> {
    let mut active: Vec<Incident> = incidents
        .into_iter()
        .filter(|incident| incident.is_active())
        .cloned()
        .collect();
    active.sort_by(|a, b| {
        b.updated_at()
            .cmp(&a.updated_at())
            .then_with(|| a.id.cmp(&b.id))
    });
    active
}

/// One `resolved` event per resolved incident, newest first.
pub fn timeline<'a>(incidents: impl IntoIterator<Item = &'a Incident>) -> Vec<TimelineEvent> {
    let mut events: Vec<TimelineEvent> = incidents
        .into_iter()
        .filter(|incident| !incident.is_active())
        .map(|incident| TimelineEvent {
            id: incident.id.clone(),
            timestamp: incident.updated_at(),
            kind: TimelineEventType::Resolved,
            description: format!("{} has been resolved", incident.title),
            incident_id: Some(incident.id.clone()),
        })
        .collect();
    events.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.incident_id.cmp(&b.incident_id))
    });
    events
}

pub fn derive<'a, S, I>(services: S, incidents: I) -> DerivedView
where
    S: IntoIterator<Item = &'a Service>,
    I: IntoIterator<Item = &'a Incident> + Clone,
{
    DerivedView {
        aggregate: aggregate_status(services),
        active_incidents: active_incidents(incidents.clone()),
        timeline: timeline(incidents),
    }
}

/// `(id, name)` of each affected service. Ids that no longer resolve to a
/// service are reported as [`UNKNOWN_SERVICE_NAME`].
pub fn resolve_affected_services(
    incident: &Incident,
    services: &BTreeMap<String, Service>,
) -> Vec<(String, String)> {
    incident
        .affected_services
        .iter()
        .map(|id| {
            let name = services
                .get(id)
                .map(|service| service.name.clone())
                .unwrap_or_else(|| UNKNOWN_SERVICE_NAME.to_string());
            (id.clone(), name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IncidentStatus, IncidentUpdate};
    use chrono::{DateTime, TimeZone, Utc};
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn service(id: &str, status: ServiceStatus) -> Service {
        Service {
            id: id.to_string(),
            name: format!("service {id}"),
            status,
            last_checked: at(0),
            description: None,
        }
    }

    fn incident(id: &str, status: IncidentStatus, updated: i64) -> Incident {
        Incident::new(id, format!("incident {id}"), IncidentStatus::Investigating, at(0))
            .with_updates([IncidentUpdate {
                id: format!("{id}-u"),
                timestamp: at(updated),
                message: String::new(),
                status,
            }])
    }

    #[derive(Debug, Clone)]
    struct ArbService(Service);

    impl Arbitrary for ArbService {
        fn arbitrary(g: &mut Gen) -> Self {
            let status = *g.choose(&ServiceStatus::ALL).unwrap();
            let id = u8::arbitrary(g).to_string();
            ArbService(service(&id, status))
        }
    }

    #[derive(Debug, Clone)]
    struct ArbIncident(Incident);

    impl Arbitrary for ArbIncident {
        fn arbitrary(g: &mut Gen) -> Self {
            let status = *g.choose(&IncidentStatus::ALL).unwrap();
            let id = u8::arbitrary(g).to_string();
            ArbIncident(incident(&id, status, i64::from(u16::arbitrary(g))))
        }
    }

    #[test]
    fn test_outage_scenario() {
        let services = [
            service("1", ServiceStatus::Operational),
            service("2", ServiceStatus::MajorOutage),
        ];
        let status = aggregate_status(&services);
        assert_eq!(status, AggregateStatus::MajorOutage);
        assert_eq!(status.headline(), "System outage detected");
    }

    #[test]
    fn test_partial_outage_is_degradation() {
        let services = [
            service("1", ServiceStatus::Operational),
            service("2", ServiceStatus::PartialOutage),
        ];
        assert_eq!(aggregate_status(&services), AggregateStatus::Degraded);
        assert_eq!(
            aggregate_status(&services).headline(),
            "Partial system degradation"
        );
    }

    #[test]
    fn test_no_services_is_operational() {
        assert_eq!(
            aggregate_status(std::iter::empty::<&Service>()),
            AggregateStatus::Operational
        );
    }

    #[test]
    fn test_active_incidents_exclude_resolved() {
        let incidents = [
            incident("a", IncidentStatus::Investigating, 10),
            incident("b", IncidentStatus::Resolved, 20),
            incident("c", IncidentStatus::Monitoring, 30),
        ];
        let active = active_incidents(&incidents);
        let ids: Vec<&str> = active.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_timeline_is_newest_first_with_id_tiebreak() {
        let incidents = [
            incident("b", IncidentStatus::Resolved, 50),
            incident("a", IncidentStatus::Resolved, 50),
            incident("c", IncidentStatus::Resolved, 90),
            incident("d", IncidentStatus::Identified, 100),
        ];
        let events = timeline(&incidents);
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(events.iter().all(|e| e.kind == TimelineEventType::Resolved));
        assert_eq!(events[0].description, "incident c has been resolved");
        assert_eq!(events[0].timestamp, at(90));
    }

    #[test]
    fn test_unknown_affected_service_gets_placeholder() {
        let mut services = BTreeMap::new();
        services.insert("1".to_string(), service("1", ServiceStatus::Operational));
        let incident = incident("x", IncidentStatus::Investigating, 5)
            .with_affected_services(["1", "gone"]);

        let resolved = resolve_affected_services(&incident, &services);
        assert_eq!(
            resolved,
            vec![
                ("1".to_string(), "service 1".to_string()),
                ("gone".to_string(), UNKNOWN_SERVICE_NAME.to_string()),
            ]
        );
    }

    #[quickcheck]
    fn prop_derive_is_pure(services: Vec<ArbService>, incidents: Vec<ArbIncident>) -> bool {
        let services: Vec<Service> = services.into_iter().map(|s| s.0).collect();
        let incidents: Vec<Incident> = incidents.into_iter().map(|i| i.0).collect();
        derive(&services, &incidents) == derive(&services, &incidents)
    }

    #[quickcheck]
    fn prop_major_outage_iff_any_service_down(services: Vec<ArbService>) -> bool {
        let services: Vec<Service> = services.into_iter().map(|s| s.0).collect();
        let any_down = services
            .iter()
            .any(|s| s.status == ServiceStatus::MajorOutage);
        (aggregate_status(&services) == AggregateStatus::MajorOutage) == any_down
    }
}
