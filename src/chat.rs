use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topic::NEW_CHAT_TOPIC;

/// Version of the persisted `SessionCollection` shape.
pub const COLLECTION_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    #[serde(alias = "ai")]
    Assistant,
}

impl Sender {
    /// Role name used on the completion wire.
    pub fn role(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            sender,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Sender::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Sender::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub date: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, preset: Option<&Preset>) -> Self {
        Self {
            id: id.into(),
            topic: preset
                .map(|p| p.name.clone())
                .unwrap_or_else(|| NEW_CHAT_TOPIC.to_string()),
            label: preset.map(|p| p.name.clone()),
            messages: Vec::new(),
            date: Utc::now(),
        }
    }

    /// The first message the user sent, which drives topic detection.
    pub fn first_user_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.sender == Sender::User)
    }

    /// Ordered transcript in the shape the completion service expects.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.messages
            .iter()
            .enumerate()
            .map(|(index, m)| TranscriptEntry {
                index,
                role: m.sender,
                content: m.content.clone(),
            })
            .collect()
    }
}

/// A dashboard starter topic. Creating a chat from a preset fixes its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub id: u32,
    pub name: String,
    pub icon: String,
}

pub fn default_presets() -> Vec<Preset> {
    [
        (1, "COGS Analysis", "📊"),
        (2, "Revenue Analysis", "💰"),
        (3, "Benchmarking", "📈"),
    ]
    .into_iter()
    .map(|(id, name, icon)| Preset {
        id,
        name: name.to_string(),
        icon: icon.to_string(),
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub index: usize,
    pub role: Sender,
    pub content: String,
}

/// The unit of persistence: every session, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCollection {
    pub version: u32,
    pub sessions: Vec<Session>,
}

impl SessionCollection {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            version: COLLECTION_VERSION,
            sessions,
        }
    }
}

/// Hands out session ids derived from the wall clock in epoch milliseconds.
/// Ids are strictly increasing, so two sessions created within the same
/// millisecond still get distinct ids.
#[derive(Debug, Default)]
pub struct SessionIds {
    last: i64,
}

impl SessionIds {
    /// Seed from existing sessions so reloaded ids are never reissued.
    pub fn seeded<'a>(sessions: impl IntoIterator<Item = &'a Session>) -> Self {
        let last = sessions
            .into_iter()
            .filter_map(|s| s.id.parse::<i64>().ok())
            .max()
            .unwrap_or(0);
        Self { last }
    }

    pub fn next_at(&mut self, now: DateTime<Utc>) -> String {
        let id = now.timestamp_millis().max(self.last + 1);
        self.last = id;
        id.to_string()
    }

    pub fn next(&mut self) -> String {
        self.next_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_never_repeat_within_one_millisecond() {
        let mut ids = SessionIds::default();
        let now = Utc::now();
        let a = ids.next_at(now);
        let b = ids.next_at(now);
        assert_ne!(a, b);
        assert!(b.parse::<i64>().unwrap() > a.parse::<i64>().unwrap());
    }

    #[test]
    fn seeded_ids_skip_past_loaded_sessions() {
        let future = (Utc::now().timestamp_millis() + 60_000).to_string();
        let session = Session::new(future.clone(), None);
        let mut ids = SessionIds::seeded([&session]);
        assert!(ids.next().parse::<i64>().unwrap() > future.parse::<i64>().unwrap());
    }

    #[test]
    fn legacy_ai_sender_is_read_as_assistant() {
        let raw = r#"{"id":"1","content":"hi","sender":"ai","timestamp":"2024-01-01T00:00:00Z"}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.sender, Sender::Assistant);
        assert!(serde_json::to_string(&msg).unwrap().contains(r#""sender":"assistant""#));
    }

    #[test]
    fn preset_sets_label_and_topic() {
        let presets = default_presets();
        let session = Session::new("1", Some(&presets[1]));
        assert_eq!(session.label.as_deref(), Some("Revenue Analysis"));
        assert_eq!(session.topic, "Revenue Analysis");

        let plain = Session::new("2", None);
        assert_eq!(plain.label, None);
        assert_eq!(plain.topic, NEW_CHAT_TOPIC);
    }

    #[test]
    fn transcript_is_indexed_in_order() {
        let mut session = Session::new("1", None);
        session.messages.push(Message::user("a"));
        session.messages.push(Message::assistant("b"));
        let t = session.transcript();
        assert_eq!(t.len(), 2);
        assert_eq!((t[0].index, t[0].role, t[0].content.as_str()), (0, Sender::User, "a"));
        assert_eq!((t[1].index, t[1].role), (1, Sender::Assistant));
    }
}
