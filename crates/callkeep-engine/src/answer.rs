//! Best-effort answering of an incoming call.
//!
//! The call is only answered if it is still listed among the incoming calls
//! of a valid session, so a tap on a stale notification is a no-op.

use callkeep_core::{CallError, ConversationId, UserId};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::resolver::SessionResolver;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnswerOutcome {
    Answered,
    NoValidSession,
    CallNotFound,
    Failed(CallError),
    /// Superseded by a later action before the answer went through.
    Aborted,
}

#[derive(Clone)]
pub struct AnswerCoordinator {
    resolver: SessionResolver,
}

impl AnswerCoordinator {
    pub fn new(resolver: SessionResolver) -> Self {
        Self { resolver }
    }

    #[instrument(skip_all, fields(user_id = %user_id, conversation_id = %conversation_id))]
    pub async fn answer(&self, user_id: &UserId, conversation_id: &ConversationId) -> AnswerOutcome {
        match self.try_answer(user_id, conversation_id).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(error = %error, kind = error.error_kind(), "answering call failed");
                AnswerOutcome::Failed(error)
            }
        }
    }

    async fn try_answer(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<AnswerOutcome, CallError> {
        if !self.resolver.has_valid_session(user_id).await? {
            info!("no valid session for user, skipping answer");
            return Ok(AnswerOutcome::NoValidSession);
        }
        let scope = self.resolver.user_scope(user_id).await?;

        let incoming = match scope.incoming_calls().next().await {
            Some(calls) => calls?,
            None => Vec::new(),
        };
        if !incoming.iter().any(|call| &call.conversation_id == conversation_id) {
            info!("call no longer incoming, skipping answer");
            return Ok(AnswerOutcome::CallNotFound);
        }

        scope.answer_call(conversation_id).await?;
        info!("call answered");
        Ok(AnswerOutcome::Answered)
    }

    /// Run an answer attempt on its own task.
    ///
    /// With `cancel`, the attempt is abandoned as soon as the token fires.
    /// Without it, the attempt runs to completion whatever happens next.
    pub fn spawn(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        cancel: Option<CancellationToken>,
    ) -> JoinHandle<AnswerOutcome> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let attempt = coordinator.answer(&user_id, &conversation_id);
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(user_id = %user_id, conversation_id = %conversation_id, "answer attempt aborted");
                            AnswerOutcome::Aborted
                        }
                        outcome = attempt => outcome,
                    }
                }
                None => attempt.await,
            }
        })
    }
}
