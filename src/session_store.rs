use crate::{
    bus::{Event, EventBus},
    chat::{
        default_presets, Message, Preset, Session, SessionCollection, SessionIds, TranscriptEntry,
    },
    completion::{CompletionError, CompletionProvider},
    store::Persistence,
    topic::{detect_topic, ERROR_TOPIC},
};
use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Reply recorded when the completion stream fails.
pub const FALLBACK_REPLY: &str = "Sorry, an error occurred while processing your request.";

/// Result of a completed `send_message` call.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    /// Session the exchange was written to, captured when the message was sent.
    pub session_id: String,
    pub reply: Message,
    pub failed: bool,
    /// False when the session was deleted before the reply arrived.
    pub delivered: bool,
}

/// What the chat panel shows right now.
#[derive(Debug, Clone, Serialize)]
pub struct ChatView {
    pub active_id: Option<String>,
    pub messages: Vec<Message>,
    pub streaming: Option<String>,
}

/// A user turn that has been recorded but whose reply is not streamed yet.
#[derive(Debug)]
pub struct PendingSend {
    session_id: String,
    ticket: u64,
    transcript: Vec<TranscriptEntry>,
}

impl PendingSend {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

struct InFlight {
    session_id: String,
    buffer: String,
}

#[derive(Default)]
struct State {
    sessions: Vec<Session>,
    active: Option<String>,
    ids: SessionIds,
    in_flight: HashMap<u64, InFlight>,
    next_ticket: u64,
}

impl State {
    fn find(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn active_session(&self) -> Option<&Session> {
        self.active.as_deref().and_then(|id| self.find(id))
    }

    fn insert_new(&mut self, preset: Option<&Preset>) -> Session {
        let session = Session::new(self.ids.next(), preset);
        self.sessions.insert(0, session.clone());
        self.active = Some(session.id.clone());
        session
    }
}

/// Owns the session collection and the active-session pointer. Every
/// mutation goes through here and is followed by a save of the whole
/// collection.
///
/// The state lock is never held across an `.await`, so each mutation is
/// atomic with respect to the others while a reply stream is suspended.
pub struct SessionStore {
    state: Mutex<State>,
    save_lock: tokio::sync::Mutex<()>,
    persistence: Arc<dyn Persistence>,
    completion: Arc<dyn CompletionProvider>,
    bus: Arc<EventBus>,
    presets: Vec<Preset>,
}

impl SessionStore {
    /// Load the persisted collection once and build the store around it.
    /// Nothing is active after a load.
    pub async fn load(
        persistence: Arc<dyn Persistence>,
        completion: Arc<dyn CompletionProvider>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let sessions = persistence
            .load()
            .await
            .context("Failed to load chat history")?
            .map(|c| c.sessions)
            .unwrap_or_default();

        info!("Loaded {} chat sessions", sessions.len());

        let state = State {
            ids: SessionIds::seeded(&sessions),
            sessions,
            ..State::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            save_lock: tokio::sync::Mutex::new(()),
            persistence,
            completion,
            bus,
            presets: default_presets(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self) {
        // Snapshot under the save lock so saves land in mutation order.
        let _guard = self.save_lock.lock().await;
        let collection = SessionCollection::new(self.lock().sessions.clone());
        if let Err(e) = self.persistence.save(&collection).await {
            error!("Failed to save chat history: {:#}", e);
        }
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    pub fn preset(&self, id: u32) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == id)
    }

    /// Start a fresh chat and make it active. The visible transcript is empty.
    pub async fn create_session(&self, preset: Option<&Preset>) -> Session {
        let session = self.lock().insert_new(preset);
        info!("Created chat {} ({})", session.id, session.topic);

        self.bus.publish(Event::SessionCreated(session.clone()));
        self.persist().await;
        session
    }

    /// Make `id` the active session. Unknown ids are ignored.
    pub fn select_session(&self, id: &str) -> bool {
        {
            let mut state = self.lock();
            if state.find(id).is_none() {
                debug!("Ignoring select of unknown chat {}", id);
                return false;
            }
            state.active = Some(id.to_string());
        }

        self.bus.publish(Event::SessionSelected {
            session_id: id.to_string(),
        });
        true
    }

    /// Remove `id` from the collection. Deleting the active session clears
    /// the active pointer. Unknown ids are ignored.
    pub async fn delete_session(&self, id: &str) -> bool {
        {
            let mut state = self.lock();
            let Some(pos) = state.sessions.iter().position(|s| s.id == id) else {
                debug!("Ignoring delete of unknown chat {}", id);
                return false;
            };
            state.sessions.remove(pos);
            if state.active.as_deref() == Some(id) {
                state.active = None;
            }
        }

        info!("Deleted chat {}", id);
        self.bus.publish(Event::SessionDeleted {
            session_id: id.to_string(),
        });
        self.persist().await;
        true
    }

    /// Send `text` as a user turn and stream the assistant reply.
    ///
    /// The user message is recorded before the completion service is
    /// contacted. The reply is written to the session that was active when
    /// this was called, even if the user has since moved elsewhere. Stream
    /// failures never escape: they become [`FALLBACK_REPLY`] and the session
    /// topic becomes "Error".
    ///
    /// Returns `None` when `text` is blank.
    #[cfg(test)]
    pub async fn send_message(&self, text: &str) -> Option<SendOutcome> {
        let pending = self.begin_send(text).await?;
        Some(self.complete_send(pending).await)
    }

    /// Pick or create the target session, record the user message, and
    /// capture the transcript. [`complete_send`](Self::complete_send) then
    /// streams the reply.
    pub async fn begin_send(&self, text: &str) -> Option<PendingSend> {
        if text.trim().is_empty() {
            return None;
        }

        let message = Message::user(text);
        let (pending, created) = {
            let mut state = self.lock();
            let created = if state.active_session().is_none() {
                Some(state.insert_new(None))
            } else {
                None
            };
            let session_id = state.active.clone()?;
            let session = state.find_mut(&session_id)?;
            session.messages.push(message.clone());
            let transcript = session.transcript();

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.in_flight.insert(
                ticket,
                InFlight {
                    session_id: session_id.clone(),
                    buffer: String::new(),
                },
            );
            let pending = PendingSend {
                session_id,
                ticket,
                transcript,
            };
            (pending, created)
        };

        if let Some(session) = created {
            self.bus.publish(Event::SessionCreated(session));
        }
        self.bus.publish(Event::MessageAppended {
            session_id: pending.session_id.clone(),
            message,
        });
        self.persist().await;
        Some(pending)
    }

    /// Second half of [`send_message`](Self::send_message): stream the reply
    /// and commit it to the captured session.
    pub async fn complete_send(&self, pending: PendingSend) -> SendOutcome {
        let PendingSend {
            session_id,
            ticket,
            transcript,
        } = pending;

        debug!("Opening completion stream for chat {}", session_id);
        self.bus.publish(Event::StreamStarted {
            session_id: session_id.clone(),
        });
        let result = self.stream_reply(ticket, &session_id, &transcript).await;

        self.finish_reply(ticket, session_id, result).await
    }

    async fn stream_reply(
        &self,
        ticket: u64,
        session_id: &str,
        transcript: &[TranscriptEntry],
    ) -> Result<(), CompletionError> {
        let mut fragments = self.completion.open(transcript).await?;

        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            let buffer = {
                let mut state = self.lock();
                match state.in_flight.get_mut(&ticket) {
                    Some(in_flight) => {
                        in_flight.buffer.push_str(&fragment);
                        in_flight.buffer.clone()
                    }
                    None => continue,
                }
            };
            self.bus.publish(Event::StreamFragment {
                session_id: session_id.to_string(),
                fragment,
                buffer,
            });
        }

        Ok(())
    }

    async fn finish_reply(
        &self,
        ticket: u64,
        session_id: String,
        result: Result<(), CompletionError>,
    ) -> SendOutcome {
        let (reply, failed, delivered, topic) = {
            let mut state = self.lock();
            let buffer = state
                .in_flight
                .remove(&ticket)
                .map(|f| f.buffer)
                .unwrap_or_default();

            let (reply, failed) = match result {
                Ok(()) => (Message::assistant(buffer), false),
                Err(e) => {
                    error!("Error streaming reply for chat {}: {}", session_id, e);
                    (Message::assistant(FALLBACK_REPLY), true)
                }
            };

            match state.find_mut(&session_id) {
                Some(session) => {
                    session.messages.push(reply.clone());
                    session.topic = if failed {
                        ERROR_TOPIC.to_string()
                    } else {
                        detect_topic(session.first_user_message().map(|m| m.content.as_str()))
                            .to_string()
                    };
                    (reply, failed, true, Some(session.topic.clone()))
                }
                None => {
                    warn!(
                        "Chat {} was deleted before its reply arrived, dropping reply",
                        session_id
                    );
                    (reply, failed, false, None)
                }
            }
        };

        self.bus.publish(Event::StreamFinished {
            session_id: session_id.clone(),
            failed,
        });
        if let Some(topic) = topic {
            self.bus.publish(Event::MessageAppended {
                session_id: session_id.clone(),
                message: reply.clone(),
            });
            self.bus.publish(Event::TopicChanged {
                session_id: session_id.clone(),
                topic,
            });
            self.persist().await;
        }

        SendOutcome {
            session_id,
            reply,
            failed,
            delivered,
        }
    }

    /// Record staged uploads in the active chat as a user message. The
    /// completion service is not contacted, so this turn gets no reply.
    pub async fn note_uploads(&self, names: &[String]) -> Option<Message> {
        if names.is_empty() {
            return None;
        }

        let message = Message::user(format!("Uploaded files: {}", names.join(", ")));
        let session_id = {
            let mut state = self.lock();
            let session_id = state.active.clone()?;
            state.find_mut(&session_id)?.messages.push(message.clone());
            session_id
        };

        self.bus.publish(Event::MessageAppended {
            session_id,
            message: message.clone(),
        });
        self.persist().await;
        Some(message)
    }

    pub fn active_id(&self) -> Option<String> {
        self.lock().active.clone()
    }

    #[cfg(test)]
    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.clone()
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.lock().find(id).cloned()
    }

    /// Run `f` against the session collection without cloning it.
    pub fn with_sessions<R>(&self, f: impl FnOnce(&[Session]) -> R) -> R {
        f(&self.lock().sessions)
    }

    /// Messages of the active session, or empty when nothing is active.
    pub fn transcript(&self) -> Vec<Message> {
        self.lock()
            .active_session()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// The newest in-flight reply for the active session, if any.
    pub fn streaming_buffer(&self) -> Option<String> {
        let state = self.lock();
        let active = state.active.as_deref()?;
        state
            .in_flight
            .iter()
            .filter(|(_, f)| f.session_id == active)
            .max_by_key(|(ticket, _)| **ticket)
            .map(|(_, f)| f.buffer.clone())
    }

    pub fn view(&self) -> ChatView {
        ChatView {
            active_id: self.active_id(),
            messages: self.transcript(),
            streaming: self.streaming_buffer(),
        }
    }
}
