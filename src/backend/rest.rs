use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use url::Url;

use super::{
    BackendError, IncidentPatch, NewIncident, NewService, Result, ServicePatch, StatusBackend,
};
use crate::config::ApiConfig;

/// [`StatusBackend`] over HTTP.
///
/// Reads are retried on transient failures. Writes are sent exactly once.
pub struct RestBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RestBackend {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Url::parse(&config.base_url)?;
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(3)
            .with_jitter()
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.base_url, path))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch(&self, url: &Url) -> Result<Value> {
        let response = self.request(Method::GET, url.clone()).send().await?;
        read_json(response).await
    }

    async fn get(&self, url: Url) -> Result<Value> {
        (|| self.fetch(&url))
            .retry(Self::backoff())
            .when(BackendError::is_transient)
            .notify(|err, after| log::warn!("GET {url} failed ({err}), retrying in {after:?}"))
            .await
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<Value> {
        log::debug!("{method} {url}");
        let mut request = self.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        read_json(request.send().await?).await
    }
}

async fn read_json(response: Response) -> Result<Value> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        });
    }
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Numeric ids go over the wire as numbers; the relational backend rejects
/// quoted integers.
fn id_value(id: &str) -> Value {
    id.parse::<u64>().map(Value::from).unwrap_or_else(|_| json!(id))
}

fn scoped<'a>(organization_id: &'a str, service_id: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
    let mut query = vec![("organization_id", organization_id)];
    if let Some(service_id) = service_id {
        query.push(("service_id", service_id));
    }
    query
}

#[async_trait]
impl StatusBackend for RestBackend {
    async fn organization_status(&self, slug: &str) -> Result<Value> {
        let url = self.url(&format!("organizations/{}/status", segment(slug)), &[])?;
        self.get(url).await
    }

    async fn list_organizations(&self) -> Result<Value> {
        self.get(self.url("organizations/list", &[])?).await
    }

    async fn list_services(&self, organization_id: &str) -> Result<Value> {
        let url = self.url("services/list", &[("organization_id", organization_id)])?;
        self.get(url).await
    }

    async fn create_service(&self, organization_id: &str, service: &NewService) -> Result<Value> {
        let body = json!({
            "name": service.name,
            "description": service.description,
            "status": service.status,
            "OrganizationID": id_value(organization_id),
        });
        let url = self.url("services/create", &[])?;
        self.send(Method::POST, url, Some(body)).await
    }

    async fn update_service(
        &self,
        organization_id: &str,
        id: &str,
        patch: &ServicePatch,
    ) -> Result<Value> {
        let url = self.url(
            &format!("services/{}", segment(id)),
            &[("organization_id", organization_id)],
        )?;
        self.send(Method::PUT, url, Some(serde_json::to_value(patch)?))
            .await
    }

    async fn delete_service(&self, organization_id: &str, id: &str) -> Result<()> {
        let url = self.url(
            &format!("services/{}", segment(id)),
            &[("organization_id", organization_id)],
        )?;
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }

    async fn list_incidents(&self, organization_id: &str) -> Result<Value> {
        let url = self.url("incidents/list", &[("organization_id", organization_id)])?;
        self.get(url).await
    }

    async fn create_incident(
        &self,
        organization_id: &str,
        incident: &NewIncident,
    ) -> Result<Value> {
        let body = json!({
            "title": incident.title,
            "description": incident.description,
            "status": incident.status,
            "severity": incident.severity,
            "service_id": incident.primary_service().map(id_value),
            "organization_id": id_value(organization_id),
            "affected_services": incident.affected_services,
        });
        let url = self.url("incidents/create", &[])?;
        self.send(Method::POST, url, Some(body)).await
    }

    async fn update_incident(
        &self,
        organization_id: &str,
        id: &str,
        service_id: Option<&str>,
        patch: &IncidentPatch,
    ) -> Result<Value> {
        let url = self.url(
            &format!("incidents/update/{}", segment(id)),
            &scoped(organization_id, service_id),
        )?;
        self.send(Method::PUT, url, Some(serde_json::to_value(patch)?))
            .await
    }

    async fn delete_incident(
        &self,
        organization_id: &str,
        id: &str,
        service_id: Option<&str>,
    ) -> Result<()> {
        let url = self.url(
            &format!("incidents/delete/{}", segment(id)),
            &scoped(organization_id, service_id),
        )?;
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }
}
