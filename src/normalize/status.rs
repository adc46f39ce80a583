use crate::model::{IncidentStatus, ServiceStatus};

/// Backend status codes accepted for services. Anything else is operational.
const SERVICE_STATUS_TABLE: &[(&str, ServiceStatus)] = &[
    ("operational", ServiceStatus::Operational),
    ("degraded", ServiceStatus::Degraded),
    ("degraded_performance", ServiceStatus::Degraded),
    ("partial_outage", ServiceStatus::PartialOutage),
    ("major_outage", ServiceStatus::MajorOutage),
    ("outage", ServiceStatus::MajorOutage),
];

const INCIDENT_STATUS_TABLE: &[(&str, IncidentStatus)] = &[
    ("investigating", IncidentStatus::Investigating),
    ("identified", IncidentStatus::Identified),
    ("monitoring", IncidentStatus::Monitoring),
    ("resolved", IncidentStatus::Resolved),
];

pub const DEFAULT_SERVICE_STATUS: ServiceStatus = ServiceStatus::Operational;
pub const DEFAULT_INCIDENT_STATUS: IncidentStatus = IncidentStatus::Investigating;

/// `"Partial Outage"`, `"partial-outage"` and `"PARTIAL_OUTAGE"` all become
/// `"partial_outage"`.
fn canonical_code(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn lookup<T: Copy>(table: &[(&str, T)], raw: &str) -> Option<T> {
    let code = canonical_code(raw);
    table
        .iter()
        .find(|(name, _)| *name == code)
        .map(|(_, status)| *status)
}

pub fn service_status(raw: Option<&str>) -> ServiceStatus {
    match raw.and_then(|raw| lookup(SERVICE_STATUS_TABLE, raw)) {
        Some(status) => status,
        None => {
            if let Some(raw) = raw {
                log::debug!("Unknown service status {raw:?}, using {DEFAULT_SERVICE_STATUS}");
            }
            DEFAULT_SERVICE_STATUS
        }
    }
}

pub fn incident_status(raw: Option<&str>) -> IncidentStatus {
    match raw.and_then(|raw| lookup(INCIDENT_STATUS_TABLE, raw)) {
        Some(status) => status,
        None => {
            if let Some(raw) = raw {
                log::debug!("Unknown incident status {raw:?}, using {DEFAULT_INCIDENT_STATUS}");
            }
            DEFAULT_INCIDENT_STATUS
        }
    }
}
