//! Session lifecycle events
//!
//! Broadcast to any number of subscribers (persistence, status pages).
//! Publishing never blocks; a subscriber that falls behind loses the
//! oldest events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::errors::{Result, SessionError};
use crate::functions::FunctionCallStatus;
use crate::types::{CallId, CallState, CallSummary, CallerMetadata, Speaker};

const EVENT_BUFFER: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Created {
        call_id: CallId,
        caller: CallerMetadata,
    },
    StateChanged {
        call_id: CallId,
        old_state: CallState,
        new_state: CallState,
    },
    /// Final transcript of one utterance
    Transcript {
        call_id: CallId,
        speaker: Speaker,
        text: String,
    },
    FunctionCompleted {
        call_id: CallId,
        function_call_id: String,
        name: String,
        status: FunctionCallStatus,
    },
    Closed {
        summary: CallSummary,
    },
}

impl SessionEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            SessionEvent::Created { call_id, .. }
            | SessionEvent::StateChanged { call_id, .. }
            | SessionEvent::Transcript { call_id, .. }
            | SessionEvent::FunctionCompleted { call_id, .. } => call_id,
            SessionEvent::Closed { summary } => &summary.call_id,
        }
    }
}

/// Publisher side of the event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    /// Publish an event; dropped silently when nobody is subscribed
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> SessionEventSubscriber {
        SessionEventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side of the event channel
#[derive(Debug)]
pub struct SessionEventSubscriber {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl SessionEventSubscriber {
    /// Wait for the next event, skipping over any lost to lag
    pub async fn receive(&mut self) -> Result<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "session event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SessionError::invalid_state("event bus closed"));
                }
            }
        }
    }

    pub fn try_receive(&mut self) -> Result<Option<SessionEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(SessionError::invalid_state("event bus closed"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(SessionEvent::StateChanged {
            call_id: CallId::new("CA1"),
            old_state: CallState::Initiating,
            new_state: CallState::Negotiating,
        });
        let event = sub.receive().await.unwrap();
        assert_eq!(event.call_id().as_str(), "CA1");
        assert!(sub.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(SessionEvent::Created {
            call_id: CallId::new("CA1"),
            caller: CallerMetadata::default(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::Transcript {
            call_id: CallId::new("CA1"),
            speaker: Speaker::Agent,
            text: "Namaste".into(),
        };
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["event"], "transcript");
        assert_eq!(json["speaker"], "agent");
    }
}
