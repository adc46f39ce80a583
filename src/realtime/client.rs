use async_trait::async_trait;
use backon::BackoffBuilder;
use futures_util::{Stream, StreamExt, stream};
use log::{debug, info, warn};
use reqwest::{Client, header};
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

use super::sse::{SseDecoder, SseFrame};
use super::{ChannelError, ConnectionState, MESSAGE_EVENT, Result, channel_url};
use crate::config::{ChannelConfig, ReconnectConfig};
use crate::model::ChannelEvent;
use crate::normalize::normalize_channel_event;
use crate::view::ViewHandle;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChannelEvent>> + Send>>;

/// Opens subscriptions to an organization's channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the subscription is live on the server.
    async fn connect(&self, organization: &str) -> Result<EventStream>;
}

/// [`Transport`] over the hub's Server-Sent Events endpoint.
pub struct SseTransport {
    client: Client,
    base_url: String,
}

impl SseTransport {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        channel_url(&config.base_url, "probe", "events")?;
        // No overall timeout: the response body is the subscription.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }
}

fn decode_frame(frame: SseFrame) -> Option<ChannelEvent> {
    if frame.event != MESSAGE_EVENT {
        debug!("Ignoring SSE event {:?}", frame.event);
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(&frame.data) {
        Ok(raw) => normalize_channel_event(&raw),
        Err(e) => {
            warn!("Dropping malformed channel message: {e}");
            None
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self, organization: &str) -> Result<EventStream> {
        let url = channel_url(&self.base_url, organization, "events")?;
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status().as_u16()));
        }

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder
                    .push(&bytes)
                    .into_iter()
                    .filter_map(decode_frame)
                    .map(Ok)
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(ChannelError::Http(e))],
            })
            .flat_map(stream::iter);
        Ok(Box::pin(events))
    }
}

/// Keeps one view subscribed to its organization's channel.
///
/// Every successful connection starts with a full re-fetch of the view, so
/// whatever happened while disconnected is picked up from the backend
/// rather than replayed. Failed connections are retried with exponential
/// backoff, which starts over after each successful connection.
pub struct ChannelClient {
    view: ViewHandle,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    state: watch::Sender<ConnectionState>,
}

enum Disconnect {
    /// The view was closed; stop for good.
    Closed,
    Lost,
}

impl ChannelClient {
    pub fn new(view: ViewHandle, transport: Arc<dyn Transport>, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            view,
            transport,
            reconnect,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn spawn(self) -> (watch::Receiver<ConnectionState>, JoinHandle<Result<()>>) {
        let state = self.state();
        (state, tokio::spawn(self.run()))
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Channel of {} is {state}", self.view.slug());
        self.state.send_replace(state);
    }

    /// Runs until the view is closed or reconnecting is given up.
    pub async fn run(self) -> Result<()> {
        let slug = self.view.slug().to_string();
        let mut delays = self.reconnect.backoff().build();
        let mut failures = 0;

        loop {
            if self.view.is_closed() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.view.closed() => break,
                connected = self.transport.connect(&slug) => connected,
            };

            match connected {
                Ok(events) => {
                    info!("Connected to the channel of {slug}");
                    self.set_state(ConnectionState::Connected);
                    delays = self.reconnect.backoff().build();
                    failures = 0;

                    if let Disconnect::Closed = self.receive(events).await {
                        break;
                    }
                }
                Err(e) => warn!("Failed to connect to the channel of {slug}: {e}"),
            }

            self.set_state(ConnectionState::Disconnected);
            failures += 1;
            let Some(delay) = delays.next() else {
                return Err(ChannelError::RetriesExhausted(failures));
            };
            info!("Reconnecting to the channel of {slug} in {delay:?}");
            tokio::select! {
                _ = self.view.closed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Channel client of {slug} stopped");
        Ok(())
    }

    async fn receive(&self, mut events: EventStream) -> Disconnect {
        if self.view.resync().await.is_err() {
            return Disconnect::Closed;
        }
        loop {
            let next = tokio::select! {
                _ = self.view.closed() => return Disconnect::Closed,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if self.view.apply(event).await.is_err() {
                        return Disconnect::Closed;
                    }
                }
                Some(Err(e)) => {
                    warn!("Channel of {} failed: {e}", self.view.slug());
                    return Disconnect::Lost;
                }
                None => {
                    info!("Channel of {} ended", self.view.slug());
                    return Disconnect::Lost;
                }
            }
        }
    }
}
