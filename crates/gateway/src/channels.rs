//! Channel registry — one entry per connected client channel, each with an
//! outbound frame sender. Events are delivered to the originating channel
//! only; there is no broadcast path.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use ab_domain::event::Event;
use ab_protocol::Frame;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct ConnectedChannel {
    pub channel_id: String,
    pub client: String,
    pub connected_at: DateTime<Utc>,
    pub sink: mpsc::Sender<Frame>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, ConnectedChannel>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a channel. A reconnect with the same id replaces the old
    /// sink (the stale writer task ends when its receiver drops).
    pub fn register(&self, channel: ConnectedChannel) {
        let mut channels = self.channels.write();
        if channels.insert(channel.channel_id.clone(), channel).is_some() {
            tracing::debug!("channel reconnected, previous sink replaced");
        }
    }

    pub fn remove(&self, channel_id: &str) {
        self.channels.write().remove(channel_id);
    }

    /// Remove only when the registered sink is still `sink` — a closing
    /// connection must not unregister its own replacement.
    pub fn remove_if_same(&self, channel_id: &str, sink: &mpsc::Sender<Frame>) {
        let mut channels = self.channels.write();
        if channels
            .get(channel_id)
            .is_some_and(|c| c.sink.same_channel(sink))
        {
            channels.remove(channel_id);
        }
    }

    pub fn sink(&self, channel_id: &str) -> Option<mpsc::Sender<Frame>> {
        self.channels.read().get(channel_id).map(|c| c.sink.clone())
    }

    pub fn count(&self) -> usize {
        self.channels.read().len()
    }

    /// Deliver an event to its origin channel. Disconnected channels are
    /// fine — the event is already durable in the log and replayable.
    pub fn deliver(&self, event: &Event) {
        let Some(channel_id) = event.channel_id.as_deref() else {
            return; // scheduler/worker events have no client channel
        };
        let Some(sink) = self.sink(channel_id) else {
            return;
        };
        let frame = event_frame(event);
        if sink.try_send(frame).is_err() {
            // Slow or closing consumer. The log remains the source of
            // truth; the client replays from its last seq on reconnect.
            tracing::debug!(channel_id, seq = event.seq, "event dropped on full channel");
        }
    }
}

/// Render an event as a wire frame: name from the kind tag, full record as
/// the payload, top-level `seq` for replay cursors.
pub fn event_frame(event: &Event) -> Frame {
    let payload = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    Frame::event(event.kind.name(), payload, Some(event.seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ab_domain::event::EventKind;
    use uuid::Uuid;

    fn channel(id: &str) -> (ConnectedChannel, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ConnectedChannel {
                channel_id: id.into(),
                client: id.into(),
                connected_at: Utc::now(),
                sink: tx,
            },
            rx,
        )
    }

    fn token_event(channel_id: Option<&str>) -> Event {
        let mut event = Event::new(
            Uuid::new_v4(),
            channel_id.map(String::from),
            EventKind::Token { text: "hi".into() },
        );
        event.seq = 7;
        event
    }

    #[tokio::test]
    async fn delivers_to_origin_channel_only() {
        let registry = ChannelRegistry::new();
        let (a, mut rx_a) = channel("a");
        let (b, mut rx_b) = channel("b");
        registry.register(a);
        registry.register(b);

        registry.deliver(&token_event(Some("a")));

        let frame = rx_a.recv().await.unwrap();
        match frame {
            Frame::Event { event, seq, .. } => {
                assert_eq!(event, "token");
                assert_eq!(seq, Some(7));
            }
            _ => panic!("expected Event frame"),
        }
        assert!(rx_b.try_recv().is_err(), "no cross-channel delivery");
    }

    #[test]
    fn channelless_events_are_log_only() {
        let registry = ChannelRegistry::new();
        let (a, mut rx) = channel("a");
        registry.register(a);
        registry.deliver(&token_event(None));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_and_count() {
        let registry = ChannelRegistry::new();
        let (a, _rx) = channel("a");
        registry.register(a);
        assert_eq!(registry.count(), 1);
        registry.remove("a");
        assert_eq!(registry.count(), 0);
        assert!(registry.sink("a").is_none());
    }
}
