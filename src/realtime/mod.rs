//! Real-time update channel.
//!
//! The [`hub::Hub`] fans status changes out to every subscriber of an
//! organization over Server-Sent Events ([`server`]). Viewers follow it
//! with a [`client::ChannelClient`], and admin writes are pushed into it by a
//! [`publisher::Publisher`].

pub mod client;
pub mod hub;
pub mod publisher;
pub mod server;
pub mod sse;

pub use client::{ChannelClient, SseTransport, Transport};
pub use hub::Hub;
pub use publisher::{HttpPublisher, Publisher};

/// SSE event name every channel message is delivered under.
pub const MESSAGE_EVENT: &str = "message";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Channel endpoint answered {0}")]
    Status(u16),
    #[error("Invalid channel URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Failed to encode channel message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Gave up reconnecting after {0} attempts")]
    RetriesExhausted(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// `{base}/channel/{organization}/{action}`
pub(crate) fn channel_url(base_url: &str, organization: &str, action: &str) -> Result<url::Url> {
    Ok(url::Url::parse(&format!(
        "{}/channel/{}/{action}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(organization)
    ))?)
}

/// Observable lifecycle of a channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        })
    }
}
