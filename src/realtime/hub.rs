use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, broadcast};

use super::Result;
use crate::model::ChannelEvent;

/// Serialized envelope, shared by every subscriber of an organization.
pub type Frame = Arc<str>;

#[derive(Serialize)]
struct Envelope<'a> {
    seq: u64,
    #[serde(flatten)]
    event: &'a ChannelEvent,
}

struct Topic {
    sender: broadcast::Sender<Frame>,
    seq: u64,
}

/// Per-organization broadcast of channel messages.
///
/// Each organization gets its own bounded buffer; nothing is shared across
/// tenants. Messages carry a per-organization sequence number starting at 1.
pub struct Hub {
    capacity: usize,
    topics: Mutex<HashMap<String, Topic>>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topic<'a>(&self, topics: &'a mut HashMap<String, Topic>, organization: &str) -> &'a mut Topic {
        topics
            .entry(organization.to_string())
            .or_insert_with(|| Topic {
                sender: broadcast::channel(self.capacity).0,
                seq: 0,
            })
    }

    pub async fn subscribe(&self, organization: &str) -> broadcast::Receiver<Frame> {
        let mut topics = self.topics.lock().await;
        self.topic(&mut topics, organization).sender.subscribe()
    }

    /// Returns the message's sequence number and how many subscribers got it.
    pub async fn publish(&self, organization: &str, event: &ChannelEvent) -> Result<(u64, usize)> {
        let mut topics = self.topics.lock().await;
        let topic = self.topic(&mut topics, organization);
        let seq = topic.seq + 1;
        let frame: Frame = serde_json::to_string(&Envelope { seq, event })?.into();
        topic.seq = seq;
        // No subscribers is not an error; the message is simply not seen.
        let receivers = topic.sender.send(frame).unwrap_or(0);
        log::debug!(
            "Published {} #{seq} to {organization} ({receivers} subscribers)",
            event.kind()
        );
        // Organizations nobody follows any more.
        topics.retain(|_, topic| topic.sender.receiver_count() > 0);
        Ok((seq, receivers))
    }

    pub async fn subscriber_count(&self, organization: &str) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(organization)
            .map(|topic| topic.sender.receiver_count())
            .unwrap_or(0)
    }
}
