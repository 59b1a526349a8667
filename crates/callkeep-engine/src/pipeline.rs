//! One Start action's decision pipeline.
//!
//! Follows the current session; for every valid session it switches to that
//! session's combined calls, dropping the previous session's streams. Every
//! await is raced against the pipeline's cancellation token.

use std::future::{pending, Future};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callkeep_core::{CallError, Decision, DecisionResult, LiveStream, Session, StopReason};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::aggregator::{decide, AnswerTarget, CallStateAggregator, CombinedCalls};
use crate::policy::DecisionPolicy;
use crate::resolver::SessionResolver;

/// Output of a pipeline, tagged with the generation that produced it.
#[derive(Debug)]
pub(crate) struct PipelineOutput {
    pub generation: u64,
    pub result: DecisionResult,
}

/// Counts itself in the engine's alive-pipeline count until dropped.
pub(crate) struct AliveGuard(Arc<AtomicUsize>);

impl AliveGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Pipeline {
    pub generation: u64,
    pub target: Option<AnswerTarget>,
    pub resolver: SessionResolver,
    pub aggregator: CallStateAggregator,
    pub stop_debounce: Duration,
    pub cancel: CancellationToken,
    pub output: mpsc::Sender<PipelineOutput>,
    /// Held only for its drop, which decrements the alive-pipeline count.
    pub _alive: AliveGuard,
}

enum Event {
    Session(Option<Result<Option<Session>, CallError>>),
    Calls(Option<Result<Vec<callkeep_core::NotificationData>, CallError>>),
    Deadline,
}

impl Pipeline {
    #[instrument(skip_all, fields(generation = self.generation))]
    pub async fn run(self) {
        let mut sessions: Option<LiveStream<Option<Session>>> = Some(self.resolver.sessions());
        let mut calls: Option<CombinedCalls> = None;
        let mut policy = DecisionPolicy::new(self.stop_debounce);

        loop {
            let deadline = policy.deadline();
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                next = next_or_pending(sessions.as_mut()) => Event::Session(next),
                next = next_or_pending(calls.as_mut()) => Event::Calls(next),
                _ = expire(deadline) => Event::Deadline,
            };

            let decision = match event {
                Event::Session(Some(Ok(session))) => {
                    calls = None;
                    match self.switch_session(session.as_ref()).await {
                        Some(Ok(Some(combined))) => {
                            calls = Some(combined);
                            continue;
                        }
                        Some(Ok(None)) => Decision::Stop(StopReason::NoValidSession),
                        Some(Err(error)) => return self.fail(error).await,
                        None => return,
                    }
                }
                Event::Calls(Some(Ok(list))) => decide(&list),
                Event::Session(Some(Err(error))) | Event::Calls(Some(Err(error))) => {
                    return self.fail(error).await;
                }
                Event::Session(None) => {
                    debug!("session stream completed");
                    sessions = None;
                    if calls.is_none() {
                        return self.complete(policy).await;
                    }
                    continue;
                }
                Event::Calls(None) => {
                    debug!("combined calls completed");
                    calls = None;
                    if sessions.is_none() {
                        return self.complete(policy).await;
                    }
                    continue;
                }
                Event::Deadline => {
                    if let Some(decision) = policy.fire(Instant::now()) {
                        if !self.emit(Ok(decision)).await {
                            return;
                        }
                    }
                    continue;
                }
            };

            if let Some(decision) = policy.offer(decision, Instant::now()) {
                if !self.emit(Ok(decision)).await {
                    return;
                }
            }
        }
    }

    /// Resolve a new session into its combined calls. `None` when cancelled.
    async fn switch_session(&self, session: Option<&Session>) -> Option<Result<Option<CombinedCalls>, CallError>> {
        let resolved = match self.cancellable(self.resolver.resolve(session)).await? {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Some(Ok(None)),
            Err(error) => return Some(Err(error)),
        };
        debug!(user_id = %resolved.user_id, "session resolved");
        let combined = self
            .cancellable(self.aggregator.combined(&resolved, self.target.as_ref()))
            .await?;
        Some(combined.map(Some))
    }

    async fn cancellable<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = future => Some(output),
        }
    }

    async fn emit(&self, result: DecisionResult) -> bool {
        let output = PipelineOutput {
            generation: self.generation,
            result,
        };
        match self.cancellable(self.output.send(output)).await {
            Some(sent) => sent.is_ok(),
            None => false,
        }
    }

    async fn fail(&self, error: CallError) {
        info!(error = %error, kind = error.error_kind(), "pipeline failed");
        self.emit(Err(error)).await;
    }

    async fn complete(&self, mut policy: DecisionPolicy) {
        if let Some(decision) = policy.flush() {
            self.emit(Ok(decision)).await;
        }
    }
}

async fn next_or_pending<S>(stream: Option<&mut S>) -> Option<S::Item>
where
    S: futures::Stream + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
