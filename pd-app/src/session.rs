//! Per-conversation state, keyed by (channel_id, chat_id).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pd_channels::{ChannelId, ChatId, FileMetadata};
use pd_ops::{JobId, JobInput, OperationId};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

/// Where a conversation is in the select → upload → run flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingInput { operation: OperationId, slot: usize },
    AwaitingParameter { operation: OperationId },
    CollectingMultiple { operation: OperationId },
    Executing { job_id: JobId },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::AwaitingParameter { .. } => "awaiting_parameter",
            Self::CollectingMultiple { .. } => "collecting_multiple",
            Self::Executing { .. } => "executing",
        }
    }

    pub fn operation(&self) -> Option<&OperationId> {
        match self {
            Self::AwaitingInput { operation, .. }
            | Self::AwaitingParameter { operation }
            | Self::CollectingMultiple { operation } => Some(operation),
            Self::Idle | Self::Executing { .. } => None,
        }
    }
}

/// An accepted file whose bytes are fetched when the job runs.
#[derive(Debug)]
pub struct PendingInput {
    pub metadata: FileMetadata,
    pub input: JobInput,
}

pub struct Session {
    pub id: String,
    pub channel_id: ChannelId,
    pub chat_id: ChatId,
    pub state: SessionState,
    pub inputs: Vec<PendingInput>,
    pub parameter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    fn new(channel_id: ChannelId, chat_id: ChatId) -> Self {
        let now = Utc::now();
        Self {
            id: session_key(&channel_id, &chat_id),
            channel_id,
            chat_id,
            state: SessionState::Idle,
            inputs: Vec::new(),
            parameter: None,
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active = now;
    }

    /// Drops back to `Idle`. Pending input handles are released by being
    /// dropped. A job that was running keeps its own handles until it ends.
    pub fn reset(&mut self) -> usize {
        let released = self.inputs.len();
        self.inputs.clear();
        self.parameter = None;
        self.state = SessionState::Idle;
        released
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The parameter may be a password; only its presence is shown.
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("inputs", &self.inputs)
            .field("parameter", &self.parameter.as_ref().map(|_| "<set>"))
            .field("last_active", &self.last_active)
            .finish_non_exhaustive()
    }
}

pub fn session_key(channel_id: &ChannelId, chat_id: &ChatId) -> String {
    format!("{channel_id}:{chat_id}")
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: &'static str,
    pub pending_inputs: usize,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Live sessions. Each session sits behind its own mutex, held only for
/// synchronous transitions.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, channel_id: &ChannelId, chat_id: &ChatId) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(session_key(channel_id, chat_id))
            .or_insert_with(|| {
                tracing::debug!(channel = %channel_id, chat = %chat_id, "session created");
                Arc::new(Mutex::new(Session::new(channel_id.clone(), chat_id.clone())))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn handles(&self) -> Vec<Arc<Mutex<Session>>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Removes the session if it is still idle.
    pub fn remove_if_idle(&self, session_id: &str) -> bool {
        self.sessions
            .remove_if(session_id, |_, session| lock(session).is_idle())
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .handles()
            .iter()
            .map(|session| {
                let s = lock(session);
                SessionSummary {
                    id: s.id.clone(),
                    state: s.state.label(),
                    pending_inputs: s.inputs.len(),
                    created_at: s.created_at,
                    last_active: s.last_active,
                }
            })
            .collect();
        out.sort_by_key(|s| s.last_active);
        out.reverse();
        out
    }
}

/// Locks a session. A transition that panicked leaves the session usable.
pub fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_channels::MemorySource;
    use pd_ops::{ResourceGuard, Role};

    #[test]
    fn sessions_are_partitioned_by_channel_and_chat() {
        let store = SessionStore::new();
        let a = store.get_or_create(&ChannelId::new("telegram"), &ChatId::new("1"));
        let again = store.get_or_create(&ChannelId::new("telegram"), &ChatId::new("1"));
        let b = store.get_or_create(&ChannelId::new("telegram"), &ChatId::new("2"));
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 2);
        assert_eq!(lock(&a).id, "telegram:1");
    }

    #[test]
    fn reset_releases_pending_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let store = SessionStore::new();
        let session = store.get_or_create(&ChannelId::new("telegram"), &ChatId::new("1"));
        let mut s = lock(&session);
        let handle = guard.acquire(&s.id, Role::Input, ".pdf");
        std::fs::write(handle.path(), b"x").unwrap();
        s.inputs.push(PendingInput {
            metadata: FileMetadata {
                file_name: "a.pdf".to_string(),
                mime_type: None,
                size: Some(1),
            },
            input: JobInput {
                handle,
                source: Some(Arc::new(MemorySource::new(b"x".to_vec()))),
            },
        });
        s.state = SessionState::CollectingMultiple {
            operation: OperationId::new("merge"),
        };
        assert_eq!(guard.live_count("telegram:1"), 1);

        assert_eq!(s.reset(), 1);
        assert!(s.is_idle());
        assert_eq!(guard.live_count("telegram:1"), 0);
    }

    #[test]
    fn debug_output_hides_the_parameter() {
        let store = SessionStore::new();
        let session = store.get_or_create(&ChannelId::new("telegram"), &ChatId::new("1"));
        let mut s = lock(&session);
        s.parameter = Some("hunter2".to_string());
        let printed = format!("{:?}", *s);
        assert!(!printed.contains("hunter2"), "{printed}");
        assert!(printed.contains("<set>"));
    }

    #[test]
    fn remove_if_idle_keeps_busy_sessions() {
        let store = SessionStore::new();
        let busy = store.get_or_create(&ChannelId::new("telegram"), &ChatId::new("1"));
        lock(&busy).state = SessionState::Executing { job_id: JobId::new() };
        store.get_or_create(&ChannelId::new("telegram"), &ChatId::new("2"));

        assert!(!store.remove_if_idle("telegram:1"));
        assert!(store.remove_if_idle("telegram:2"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.list()[0].state, "executing");
    }
}
