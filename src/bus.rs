use crate::chat::{Message, Session};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    SessionCreated(Session),

    /// The active session changed to `session_id`
    SessionSelected { session_id: String },

    SessionDeleted { session_id: String },

    /// A finalized message was added to a session's transcript
    MessageAppended {
        session_id: String,
        message: Message,
    },

    StreamStarted { session_id: String },

    /// A reply fragment arrived; `buffer` is the reply so far
    StreamFragment {
        session_id: String,
        fragment: String,
        buffer: String,
    },

    /// The in-flight reply for `session_id` was finalized or discarded
    StreamFinished { session_id: String, failed: bool },

    TopicChanged { session_id: String, topic: String },
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
