//! SSE broadcaster for the dashboard.
//!
//! Built on `tokio::sync::broadcast`: every subscription gets its own
//! receiver, and a slow client that falls behind the channel capacity drops
//! the oldest messages (documented policy: drop-oldest, never block the
//! sender). Heartbeats fire after 30 seconds of idle so proxies keep the
//! connection open.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::broadcast;

use super::events::DashboardEvent;

/// Heartbeat interval on an idle stream.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-subscription buffer; lagging subscribers lose the oldest messages.
const CHANNEL_CAPACITY: usize = 1024;

/// One SSE message: event name + data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

impl SseMessage {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// From a typed dashboard event: the event name is the type, the data is
    /// the full JSON payload.
    pub fn from_event(event: &DashboardEvent) -> Self {
        Self {
            event: event.r#type.clone(),
            data: serde_json::to_string(event).unwrap_or_default(),
        }
    }
}

/// Fan-out hub for SSE subscribers.
#[derive(Clone)]
pub struct SseBroadcaster {
    sender: broadcast::Sender<SseMessage>,
}

impl SseBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to all current subscribers. No subscribers is fine.
    pub fn publish(&self, message: SseMessage) {
        let _ = self.sender.send(message);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Raw receiver, for non-SSE consumers and tests.
    pub fn raw_subscribe(&self) -> broadcast::Receiver<SseMessage> {
        self.sender.subscribe()
    }

    /// Subscribe as an axum SSE stream: next message, or a heartbeat after
    /// 30 s of idle. Lag (dropped messages) is skipped silently — the client
    /// sees newer events with a higher `sequence_id` and may resync over the
    /// REST API.
    pub fn subscribe(&self) -> impl Stream<Item = Result<Event, Infallible>> + use<> {
        futures::stream::unfold(self.sender.subscribe(), |mut rx| async move {
            loop {
                match tokio::time::timeout(HEARTBEAT_INTERVAL, rx.recv()).await {
                    Ok(Ok(message)) => {
                        let event = Event::default().event(&message.event).data(&message.data);
                        return Some((Ok(event), rx));
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        tracing::debug!("SSE subscriber lagged, skipped {skipped} messages");
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                    Err(_) => {
                        let event = Event::default().event("heartbeat").data("{}");
                        return Some((Ok(event), rx));
                    }
                }
            }
        })
    }
}

impl Default for SseBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broadcaster = SseBroadcaster::new();
        let mut receiver = broadcaster.sender.subscribe();
        broadcaster.publish(SseMessage::new("output", "{\"line\":\"hi\"}"));

        let message = receiver.recv().await.unwrap();
        assert_eq!(message.event, "output");
        assert!(message.data.contains("hi"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let broadcaster = SseBroadcaster::new();
        broadcaster.publish(SseMessage::new("status", "{}"));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_message_from_typed_event() {
        let emitter = super::super::events::DashboardEmitter::new("run-1", false);
        let event = emitter.emit("story_status", serde_json::json!({"story": "1.1"}));
        let message = SseMessage::from_event(&event);
        assert_eq!(message.event, "story_status");
        assert!(message.data.contains("\"run_id\":\"run-1\""));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_drops_oldest() {
        let broadcaster = SseBroadcaster::new();
        let mut receiver = broadcaster.sender.subscribe();
        // Overflow the buffer: the receiver must lag, not block the sender.
        for i in 0..(CHANNEL_CAPACITY + 10) {
            broadcaster.publish(SseMessage::new("output", format!("{i}")));
        }
        match receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 10),
            other => panic!("Expected lag, got {other:?}"),
        }
    }
}
