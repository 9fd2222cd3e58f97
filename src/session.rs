//! In-memory conversation history, bounded per session.
//!
//! Sessions are created lazily and live for the lifetime of the store. Each
//! session has its own lock, so different sessions never contend. A
//! question/answer round holds that lock for its whole duration through a
//! [`SessionTurn`], which keeps user and assistant messages strictly paired
//! even when two requests race on the same session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::Message;

/// Default number of messages retained per session.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

type History = VecDeque<Message>;

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Mutex<History>>>>,
    limit: usize,
}

impl SessionStore {
    pub fn new(limit: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    async fn session(&self, id: &str) -> Arc<Mutex<History>> {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(id.to_string()).or_default())
    }

    /// Append one message, dropping the oldest ones beyond the cap.
    pub async fn append(&self, id: &str, message: Message) {
        let session = self.session(id).await;
        let mut history = session.lock().await;
        history.push_back(message);
        trim(&mut history, self.limit);
    }

    /// Messages of `id`, oldest first. Unknown ids have no messages.
    pub async fn get(&self, id: &str) -> Vec<Message> {
        let session = {
            let sessions = self.sessions.lock().await;
            match sessions.get(id) {
                Some(s) => Arc::clone(s),
                None => return Vec::new(),
            }
        };
        let history = session.lock().await;
        history.iter().cloned().collect()
    }

    pub async fn clear(&self, id: &str) {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(id).cloned()
        };
        if let Some(session) = session {
            session.lock().await.clear();
        }
    }

    /// Take exclusive hold of a session for one question/answer round.
    pub async fn begin_turn(&self, id: &str) -> SessionTurn {
        let session = self.session(id).await;
        SessionTurn {
            history: session.lock_owned().await,
            limit: self.limit,
            pending: None,
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

fn trim(history: &mut History, limit: usize) -> Vec<Message> {
    let mut evicted = Vec::new();
    while history.len() > limit {
        if let Some(m) = history.pop_front() {
            evicted.push(m);
        }
    }
    evicted
}

/// Messages displaced by the pending user message, restored on rollback.
struct Pending {
    evicted: Vec<Message>,
}

/// Exclusive hold on one session for the duration of a round.
///
/// Dropping the turn without calling [`SessionTurn::commit`] rolls back the
/// pending user message.
pub struct SessionTurn {
    history: OwnedMutexGuard<History>,
    limit: usize,
    pending: Option<Pending>,
}

impl SessionTurn {
    /// Current messages, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.history.iter().cloned().collect()
    }

    /// Messages before the pending question.
    pub fn prior_messages(&self) -> Vec<Message> {
        let skip_last = usize::from(self.pending.is_some());
        let keep = self.history.len().saturating_sub(skip_last);
        self.history.iter().take(keep).cloned().collect()
    }

    /// Append the question. Only one question may be pending.
    pub fn push_user(&mut self, message: Message) {
        self.rollback();
        self.history.push_back(message);
        let evicted = trim(&mut self.history, self.limit);
        self.pending = Some(Pending { evicted });
    }

    /// Append the answer to the pending question.
    pub fn commit(mut self, message: Message) {
        self.pending = None;
        self.history.push_back(message);
        trim(&mut self.history, self.limit);
    }

    /// Remove the pending question and restore anything it displaced.
    pub fn rollback(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.history.pop_back();
            for m in pending.evicted.into_iter().rev() {
                self.history.push_front(m);
            }
        }
    }
}

impl Drop for SessionTurn {
    fn drop(&mut self) {
        self.rollback();
    }
}
