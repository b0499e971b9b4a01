//! Observability event stream.
//!
//! The runner emits timestamped events (connection status, message traffic,
//! tool executions, adapter log lines) over a bounded channel for a
//! presentation layer to consume. Emission is best-effort: when the consumer
//! falls behind, events are dropped instead of blocking the pipeline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::broker::ToolInfo;

/// Whether a message entered or left the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// The state of one tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

/// An observability event.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connection status changed.
    Status {
        time: DateTime<Utc>,
        connected: bool,
        agent_name: String,
        detail: Option<String>,
    },

    /// A message was received or sent.
    Message {
        time: DateTime<Utc>,
        direction: MessageDirection,
        topic: String,
        content: String,
        model: Option<String>,
        tokens: Option<u32>,
    },

    /// A tool execution started, finished, or failed.
    Tool {
        time: DateTime<Utc>,
        status: ToolStatus,
        name: String,
        args: String,
        result: Option<String>,
        error: Option<String>,
        duration: Option<Duration>,
    },

    /// The set of available tools was discovered.
    ToolsAvailable {
        time: DateTime<Utc>,
        tools: Vec<ToolInfo>,
    },

    /// A log line, e.g. from an adapter's `log()` capability.
    Log {
        time: DateTime<Utc>,
        level: String,
        message: String,
    },
}

impl Event {
    /// The event's timestamp.
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Status { time, .. }
            | Self::Message { time, .. }
            | Self::Tool { time, .. }
            | Self::ToolsAvailable { time, .. }
            | Self::Log { time, .. } => *time,
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Sending half of the event stream. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

impl EventBus {
    /// Sends an event. Never blocks; drops the event when the buffer is full
    /// or the receiver is gone.
    pub fn send(&self, event: Event) {
        let _ = self.tx.try_send(event);
    }
}

/// Creates an event stream with the given buffer capacity.
pub fn event_channel(capacity: usize) -> (EventBus, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventBus { tx }, rx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn log_event(message: &str) -> Event {
        Event::Log {
            time: Utc::now(),
            level: "info".into(),
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn send_and_receive() {
        let (bus, mut rx) = event_channel(8);
        bus.send(log_event("hello"));

        match rx.recv().await {
            Some(Event::Log { message, .. }) => assert_eq!(message, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let (bus, mut rx) = event_channel(2);

        // Fill the buffer and keep sending; the extra sends return
        // immediately and are dropped.
        for i in 0..10 {
            bus.send(log_event(&format!("event-{i}")));
        }

        let mut received = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, Event::Log { .. }));
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_is_noop() {
        let (bus, rx) = event_channel(2);
        drop(rx);
        bus.send(log_event("nobody home"));
    }

    #[test]
    fn event_time_accessor() {
        let event = log_event("x");
        assert!(event.time() <= Utc::now());
    }
}
