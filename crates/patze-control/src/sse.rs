//! SSE fan-out with per-subscriber backpressure.
//!
//! Each subscriber gets a bounded queue of pending chunks; a client that
//! stops reading falls behind, overflows its queue, and is disconnected
//! without affecting anyone else. Heartbeat comments flow every 15s via
//! the SSE keep-alive.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum chunks a slow subscriber may have pending before it is dropped.
pub const MAX_PENDING_CHUNKS: usize = 1024;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SseMessage {
    pub event: String,
    pub data: serde_json::Value,
}

pub struct SseBroker {
    tx: broadcast::Sender<SseMessage>,
}

impl SseBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MAX_PENDING_CHUNKS);
        Self { tx }
    }

    /// Publish to all subscribers. Dropped silently when nobody listens.
    pub fn publish(&self, event: &str, data: impl Serialize) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(_) => return,
        };
        let _ = self.tx.send(SseMessage {
            event: event.to_string(),
            data,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// A response stream for one subscriber. Lag (queue overflow) ends the
    /// stream, which disconnects that client and frees its buffers.
    pub fn stream(&self) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
        let rx = self.tx.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let event = Event::default()
                            .event(message.event.clone())
                            .data(message.data.to_string());
                        return Some((Ok(event), rx));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "sse subscriber overflowed; disconnecting");
                        return None;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(HEARTBEAT_INTERVAL)
                .text("heartbeat"),
        )
    }
}

impl Default for SseBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = SseBroker::new();
        let mut rx = broker.tx.subscribe();
        broker.publish("telemetry", serde_json::json!({"id": "e-1"}));
        let message = rx.recv().await.expect("message");
        assert_eq!(message.event, "telemetry");
        assert_eq!(message.data["id"], "e-1");
    }

    #[tokio::test]
    async fn test_slow_subscriber_overflow_isolated() {
        let broker = SseBroker::new();
        let mut slow = broker.tx.subscribe();
        // Overflow the slow subscriber's queue.
        for i in 0..(MAX_PENDING_CHUNKS + 10) {
            broker.publish("telemetry", serde_json::json!({"i": i}));
        }
        // A fresh subscriber is unaffected.
        let mut fresh = broker.tx.subscribe();
        broker.publish("telemetry", serde_json::json!({"i": "after"}));
        assert!(fresh.recv().await.is_ok());

        // The slow one observes the lag, which the stream treats as a
        // disconnect.
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
