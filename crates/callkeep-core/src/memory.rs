//! In-process session and call store.
//!
//! Every live stream is backed by a `tokio::sync::watch` channel: a new
//! subscriber first receives the current value, then every later change.
//! Rapid successive updates may be conflated, which is the same contract a
//! state-holding reactive store gives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::calls::{Call, CallStatus};
use crate::errors::CallError;
use crate::ids::{ConversationId, UserId};
use crate::session::{LiveStream, SelfUser, Session, SessionStore, UserScope};

type Slot<T> = watch::Sender<Result<T, CallError>>;

fn slot<T: Send + Sync + 'static>(initial: T) -> Slot<T> {
    let (tx, _rx) = watch::channel(Ok(initial));
    tx
}

fn live<T: Clone + Send + Sync + 'static>(slot: &Slot<T>) -> LiveStream<T> {
    Box::pin(WatchStream::new(slot.subscribe()))
}

/// Session store holding every account in memory.
pub struct MemorySessionStore {
    current: Slot<Option<Session>>,
    accounts: DashMap<UserId, Arc<MemoryUserScope>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            current: slot(None),
            accounts: DashMap::new(),
        }
    }

    /// Register an account with a valid session and return its scope.
    pub fn add_account(&self, self_user: SelfUser) -> Arc<MemoryUserScope> {
        let scope = Arc::new(MemoryUserScope::new(self_user));
        self.accounts.insert(scope.user_id().clone(), Arc::clone(&scope));
        scope
    }

    pub fn account(&self, user_id: &UserId) -> Option<Arc<MemoryUserScope>> {
        self.accounts.get(user_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn set_current_session(&self, session: Option<Session>) {
        self.current.send_modify(|current| *current = Ok(session));
    }

    /// Make the current-session stream yield an error.
    pub fn fail_current_session(&self, error: CallError) {
        self.current.send_modify(|current| *current = Err(error));
    }

    /// Number of live subscriptions to the current-session stream.
    pub fn session_subscribers(&self) -> usize {
        self.current.receiver_count()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn current_session(&self) -> LiveStream<Option<Session>> {
        live(&self.current)
    }

    async fn has_valid_session(&self, user_id: &UserId) -> Result<bool, CallError> {
        Ok(self
            .accounts
            .get(user_id)
            .is_some_and(|scope| scope.is_valid()))
    }

    async fn user_scope(&self, user_id: &UserId) -> Result<Arc<dyn UserScope>, CallError> {
        match self.accounts.get(user_id) {
            Some(scope) => {
                let scope: Arc<dyn UserScope> = Arc::clone(scope.value()) as Arc<dyn UserScope>;
                Ok(scope)
            }
            None => Err(CallError::SessionNotFound(user_id.clone())),
        }
    }
}

/// Calls and self user of one in-memory account.
pub struct MemoryUserScope {
    self_user: Mutex<SelfUser>,
    valid: AtomicBool,
    established: Slot<Vec<Call>>,
    outgoing: Slot<Vec<Call>>,
    incoming: Slot<Vec<Call>>,
    answered: Mutex<Vec<ConversationId>>,
    answer_failure: Mutex<Option<CallError>>,
    answer_delay: Mutex<Option<Duration>>,
    answer_establishes: AtomicBool,
}

impl MemoryUserScope {
    fn new(self_user: SelfUser) -> Self {
        Self {
            self_user: Mutex::new(self_user),
            valid: AtomicBool::new(true),
            established: slot(Vec::new()),
            outgoing: slot(Vec::new()),
            incoming: slot(Vec::new()),
            answered: Mutex::new(Vec::new()),
            answer_failure: Mutex::new(None),
            answer_delay: Mutex::new(None),
            answer_establishes: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.self_user.lock().id.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    pub fn set_self_user(&self, self_user: SelfUser) {
        *self.self_user.lock() = self_user;
    }

    pub fn set_established(&self, calls: Vec<Call>) {
        self.established.send_modify(|current| *current = Ok(calls));
    }

    pub fn set_outgoing(&self, calls: Vec<Call>) {
        self.outgoing.send_modify(|current| *current = Ok(calls));
    }

    pub fn set_incoming(&self, calls: Vec<Call>) {
        self.incoming.send_modify(|current| *current = Ok(calls));
    }

    pub fn fail_established(&self, error: CallError) {
        self.established.send_modify(|current| *current = Err(error));
    }

    /// Conversations passed to `answer_call`, in invocation order.
    pub fn answered(&self) -> Vec<ConversationId> {
        self.answered.lock().clone()
    }

    pub fn answer_count(&self, conversation_id: &ConversationId) -> usize {
        self.answered
            .lock()
            .iter()
            .filter(|id| *id == conversation_id)
            .count()
    }

    pub fn set_answer_failure(&self, error: Option<CallError>) {
        *self.answer_failure.lock() = error;
    }

    /// Hold `answer_call` for this long before it takes effect.
    pub fn set_answer_delay(&self, delay: Option<Duration>) {
        *self.answer_delay.lock() = delay;
    }

    /// When set, answering moves the call from incoming to established as `Answered`.
    pub fn set_answer_establishes(&self, enabled: bool) {
        self.answer_establishes.store(enabled, Ordering::Release);
    }

    fn move_to_established(&self, conversation_id: &ConversationId) {
        let incoming = match &*self.incoming.borrow() {
            Ok(calls) => calls.clone(),
            Err(_) => return,
        };
        let (answered, remaining): (Vec<Call>, Vec<Call>) = incoming
            .into_iter()
            .partition(|call| &call.conversation_id == conversation_id);
        if answered.is_empty() {
            return;
        }
        let mut established = match &*self.established.borrow() {
            Ok(calls) => calls.clone(),
            Err(_) => Vec::new(),
        };
        established.extend(answered.into_iter().map(|call| call.with_status(CallStatus::Answered)));
        self.set_established(established);
        self.set_incoming(remaining);
    }
}

#[async_trait]
impl UserScope for MemoryUserScope {
    fn established_calls(&self) -> LiveStream<Vec<Call>> {
        live(&self.established)
    }

    fn outgoing_calls(&self) -> LiveStream<Vec<Call>> {
        live(&self.outgoing)
    }

    fn incoming_calls(&self) -> LiveStream<Vec<Call>> {
        live(&self.incoming)
    }

    async fn answer_call(&self, conversation_id: &ConversationId) -> Result<(), CallError> {
        let delay = *self.answer_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.answered.lock().push(conversation_id.clone());
        if let Some(error) = self.answer_failure.lock().clone() {
            return Err(error);
        }
        if self.answer_establishes.load(Ordering::Acquire) {
            self.move_to_established(conversation_id);
        }
        tracing::debug!(conversation_id = %conversation_id, "in-memory call answered");
        Ok(())
    }

    async fn self_user(&self) -> Result<SelfUser, CallError> {
        Ok(self.self_user.lock().clone())
    }
}
