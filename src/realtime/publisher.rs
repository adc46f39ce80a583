use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{ChannelError, Hub, Result, channel_url};
use crate::config::ChannelConfig;
use crate::model::ChannelEvent;

/// Pushes a change to every viewer of an organization.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, organization: &str, event: &ChannelEvent) -> Result<()>;
}

#[async_trait]
impl Publisher for Hub {
    async fn publish(&self, organization: &str, event: &ChannelEvent) -> Result<()> {
        Hub::publish(self, organization, event).await.map(|_| ())
    }
}

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes through a remote hub's `POST /channel/:org/publish`.
pub struct HttpPublisher {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPublisher {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        channel_url(&config.base_url, "probe", "publish")?;
        let client = Client::builder().timeout(PUBLISH_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.publish_token.clone(),
        })
    }

    /// `POST /channel/:org/echo`. Returns the hub's reply.
    pub async fn probe(&self, organization: &str, body: &str) -> Result<String> {
        let url = channel_url(&self.base_url, organization, "echo")?;
        let response = self.client.post(url).body(body.to_string()).send().await?;
        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, organization: &str, event: &ChannelEvent) -> Result<()> {
        let url = channel_url(&self.base_url, organization, "publish")?;
        let mut request = self.client.post(url).json(event);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status().as_u16()));
        }
        log::debug!("Published {} to {organization}", event.kind());
        Ok(())
    }
}
