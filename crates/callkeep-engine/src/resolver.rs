use std::sync::Arc;

use callkeep_core::{CallError, LiveStream, Session, SessionStore, UserId, UserScope};
use tracing::{debug, warn};

/// A valid account with the data the pipeline reads once per session change.
#[derive(Clone)]
pub struct ResolvedSession {
    pub user_id: UserId,
    pub scope: Arc<dyn UserScope>,
    pub display_name: String,
}

impl std::fmt::Debug for ResolvedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSession")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Thin layer over the external session store.
#[derive(Clone)]
pub struct SessionResolver {
    store: Arc<dyn SessionStore>,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Live stream of the current session, `None` while logged out.
    pub fn sessions(&self) -> LiveStream<Option<Session>> {
        self.store.current_session()
    }

    /// Resolve the current session. Absent or invalid sessions yield `None`.
    pub async fn resolve(&self, session: Option<&Session>) -> Result<Option<ResolvedSession>, CallError> {
        match session {
            Some(session) if session.is_valid() => {
                let scope = self.store.user_scope(&session.user_id).await?;
                let display_name = display_name(scope.as_ref(), &session.user_id).await?;
                Ok(Some(ResolvedSession {
                    user_id: session.user_id.clone(),
                    scope,
                    display_name,
                }))
            }
            Some(session) => {
                debug!(user_id = %session.user_id, status = ?session.status, "current session not valid");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Resolve any account by id, as long as it still holds a valid session.
    pub async fn resolve_user(&self, user_id: &UserId) -> Result<Option<ResolvedSession>, CallError> {
        if !self.store.has_valid_session(user_id).await? {
            return Ok(None);
        }
        let scope = self.store.user_scope(user_id).await?;
        let display_name = display_name(scope.as_ref(), user_id).await?;
        Ok(Some(ResolvedSession {
            user_id: user_id.clone(),
            scope,
            display_name,
        }))
    }

    pub async fn has_valid_session(&self, user_id: &UserId) -> Result<bool, CallError> {
        self.store.has_valid_session(user_id).await
    }

    pub async fn user_scope(&self, user_id: &UserId) -> Result<Arc<dyn UserScope>, CallError> {
        self.store.user_scope(user_id).await
    }
}

async fn display_name(scope: &dyn UserScope, user_id: &UserId) -> Result<String, CallError> {
    let name = scope.self_user().await?.display_name();
    if name.is_empty() {
        warn!(user_id = %user_id, "self user has neither handle nor name");
    }
    Ok(name)
}
