// Per-user conversation state and where it is kept.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    Start,
    RegisterConfirm,
    RegisterName,
    RegisterEmail,
    Password,
    Menu,
    WaitingGeo,
    WaitingApprove,
    ReadyForTask,
    TaskReceived,
    Answer,
    AllTasksComplete,
}

impl ConversationState {
    /// States only reachable after a successful login.
    pub fn is_logged_in(&self) -> bool {
        !matches!(
            self,
            Self::Start
                | Self::RegisterConfirm
                | Self::RegisterName
                | Self::RegisterEmail
                | Self::Password
        )
    }
}

/// Scratch data for one chat user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSession {
    pub state: ConversationState,
    pub email: Option<String>,
    pub team_id: Option<i64>,
    pub task_id: Option<i64>,
    pub pending_team_name: Option<String>,
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self {
            state: ConversationState::Start,
            email: None,
            team_id: None,
            task_id: None,
            pending_team_name: None,
        }
    }
}

/// Storage for conversation sessions keyed by chat id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, chat_id: i64) -> Option<ConversationSession>;
    async fn set(&self, chat_id: i64, session: ConversationSession);
    async fn delete(&self, chat_id: i64);
    /// Move a session from `from` to `to`. Does nothing and returns false if
    /// the session is gone or in another state.
    async fn transition(&self, chat_id: i64, from: ConversationState, to: ConversationState)
        -> bool;
    /// Store `session` only if the stored state is still `expected`
    /// (`None` meaning no session). Returns whether it was stored.
    async fn replace(
        &self,
        chat_id: i64,
        expected: Option<ConversationState>,
        session: ConversationSession,
    ) -> bool;
}

/// Process-local session store. Sessions are lost on restart.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<i64, ConversationSession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, chat_id: i64) -> Option<ConversationSession> {
        self.inner.lock().unwrap().get(&chat_id).cloned()
    }

    async fn set(&self, chat_id: i64, session: ConversationSession) {
        let mut sessions = self.inner.lock().unwrap();
        sessions.insert(chat_id, session);
        crate::metrics::CONVERSATIONS_ACTIVE.set(sessions.len() as i64);
    }

    async fn delete(&self, chat_id: i64) {
        let mut sessions = self.inner.lock().unwrap();
        sessions.remove(&chat_id);
        crate::metrics::CONVERSATIONS_ACTIVE.set(sessions.len() as i64);
    }

    async fn transition(
        &self,
        chat_id: i64,
        from: ConversationState,
        to: ConversationState,
    ) -> bool {
        let mut sessions = self.inner.lock().unwrap();
        match sessions.get_mut(&chat_id) {
            Some(session) if session.state == from => {
                session.state = to;
                true
            }
            _ => false,
        }
    }

    async fn replace(
        &self,
        chat_id: i64,
        expected: Option<ConversationState>,
        session: ConversationSession,
    ) -> bool {
        let mut sessions = self.inner.lock().unwrap();
        if sessions.get(&chat_id).map(|s| s.state) != expected {
            return false;
        }
        sessions.insert(chat_id, session);
        crate::metrics::CONVERSATIONS_ACTIVE.set(sessions.len() as i64);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemorySessionStore::new();
        assert!(store.get(1).await.is_none());

        let session = ConversationSession {
            email: Some("a@example.com".into()),
            ..Default::default()
        };
        store.set(1, session.clone()).await;
        assert_eq!(store.get(1).await, Some(session));
        assert_eq!(store.len(), 1);

        store.delete(1).await;
        assert!(store.get(1).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_transition_checks_current_state() {
        let store = InMemorySessionStore::new();
        assert!(
            !store
                .transition(1, ConversationState::Start, ConversationState::Menu)
                .await
        );

        store.set(1, ConversationSession::default()).await;
        assert!(
            !store
                .transition(1, ConversationState::Menu, ConversationState::Answer)
                .await
        );
        assert!(
            store
                .transition(1, ConversationState::Start, ConversationState::Menu)
                .await
        );
        assert_eq!(store.get(1).await.unwrap().state, ConversationState::Menu);
    }

    #[tokio::test]
    async fn test_replace_refuses_when_state_moved_on() {
        let store = InMemorySessionStore::new();
        let waiting = ConversationSession {
            state: ConversationState::WaitingApprove,
            team_id: Some(7),
            ..Default::default()
        };
        assert!(store.replace(1, None, waiting.clone()).await);
        assert!(!store.replace(1, None, waiting.clone()).await);

        assert!(
            store
                .transition(
                    1,
                    ConversationState::WaitingApprove,
                    ConversationState::ReadyForTask
                )
                .await
        );
        assert!(
            !store
                .replace(1, Some(ConversationState::WaitingApprove), waiting)
                .await
        );
        assert_eq!(
            store.get(1).await.unwrap().state,
            ConversationState::ReadyForTask
        );
    }

    #[test]
    fn test_logged_in_states() {
        assert!(!ConversationState::Password.is_logged_in());
        assert!(ConversationState::Menu.is_logged_in());
        assert!(ConversationState::AllTasksComplete.is_logged_in());
    }
}
