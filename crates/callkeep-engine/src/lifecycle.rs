//! Lifecycle Decision Engine.
//!
//! A single actor task consumes the action queue and owns the current
//! pipeline. Every action cancels and awaits the previous pipeline before
//! anything else happens, so at most one pipeline is ever alive. Pipeline
//! output is tagged with a generation and dropped unless it belongs to the
//! current pipeline.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use callkeep_core::{Action, ActionTicket, Decision, DecisionResult, SessionStore, StartAction, StopReason};
use futures::Stream;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{AnswerTarget, CallStateAggregator};
use crate::answer::AnswerCoordinator;
use crate::error::EngineError;
use crate::pipeline::{AliveGuard, Pipeline, PipelineOutput};
use crate::queue::{ActionQueue, DEFAULT_QUEUE_CAPACITY};
use crate::resolver::SessionResolver;

pub const DEFAULT_STOP_DEBOUNCE: Duration = Duration::from_millis(200);

const OUTPUT_BUFFER: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub stop_debounce: Duration,
    /// Abort an in-flight answer attempt when the next action arrives.
    pub bind_answer_to_pipeline: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stop_debounce: DEFAULT_STOP_DEBOUNCE,
            bind_answer_to_pipeline: false,
        }
    }
}

/// A decision as published to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    /// Increases with every publication.
    pub seq: u64,
    /// The action whose processing produced this decision.
    pub ticket: ActionTicket,
    pub result: DecisionResult,
}

type DecisionSlot = Arc<watch::Sender<Option<Published>>>;

pub struct LifecycleEngine {
    queue: Arc<ActionQueue>,
    decisions: DecisionSlot,
    alive: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    actor: Mutex<Option<Actor>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn SessionStore>, config: EngineConfig) -> Self {
        let queue = Arc::new(ActionQueue::new(config.queue_capacity));
        let (tx, _rx) = watch::channel(None);
        let decisions = Arc::new(tx);
        let alive = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let resolver = SessionResolver::new(store);

        let actor = Actor {
            queue: Arc::clone(&queue),
            aggregator: CallStateAggregator::new(resolver.clone()),
            answer: AnswerCoordinator::new(resolver.clone()),
            resolver,
            config,
            decisions: Arc::clone(&decisions),
            alive: Arc::clone(&alive),
            shutdown: shutdown.clone(),
            next_generation: 0,
            seq: 0,
            current: None,
        };

        Self {
            queue,
            decisions,
            alive,
            shutdown,
            actor: Mutex::new(Some(actor)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the actor on the current runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let actor = self.actor.lock().take().ok_or(EngineError::AlreadyRunning)?;
        let handle = tokio::spawn(actor.run());
        *self.task.lock() = Some(handle);
        info!("lifecycle engine started");
        Ok(())
    }

    /// Never blocks. Actions submitted after shutdown are discarded.
    pub fn submit(&self, action: Action) -> ActionTicket {
        let name = action.name();
        let ticket = self.queue.enqueue(action);
        debug!(ticket = %ticket, action = name, "action submitted");
        ticket
    }

    pub fn try_submit(&self, action: Action) -> Result<ActionTicket, EngineError> {
        self.queue.try_enqueue(action)
    }

    /// Live decisions, starting with the latest one if any.
    pub fn subscribe(&self) -> DecisionStream {
        DecisionStream::new(self.decisions.subscribe())
    }

    pub fn latest(&self) -> Option<Published> {
        self.decisions.borrow().clone()
    }

    /// Pipelines currently alive. Never more than one.
    pub fn active_pipelines(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop accepting actions and wind the actor down.
    pub fn shutdown(&self) {
        self.queue.close();
        self.shutdown.cancel();
    }

    /// Wait for the actor to finish after [`shutdown`](Self::shutdown).
    pub async fn join(&self) -> Result<(), EngineError> {
        let handle = self.task.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| EngineError::Internal(format!("engine actor panicked: {e}"))),
            None => Ok(()),
        }
    }
}

impl Drop for LifecycleEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActivePipeline {
    generation: u64,
    ticket: ActionTicket,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Actor {
    queue: Arc<ActionQueue>,
    resolver: SessionResolver,
    aggregator: CallStateAggregator,
    answer: AnswerCoordinator,
    config: EngineConfig,
    decisions: DecisionSlot,
    alive: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    next_generation: u64,
    seq: u64,
    current: Option<ActivePipeline>,
}

impl Actor {
    async fn run(mut self) {
        let (output_tx, mut output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Some((ticket, action)) => self.handle(ticket, action, &output_tx).await,
                    None => break,
                },
                Some(output) = output_rx.recv() => self.on_output(output).await,
            }
        }

        self.cancel_current().await;
        info!("lifecycle engine stopped");
    }

    async fn handle(&mut self, ticket: ActionTicket, action: Action, output: &mpsc::Sender<PipelineOutput>) {
        info!(ticket = %ticket, action = action.name(), "processing action");
        self.cancel_current().await;

        match action {
            Action::Stop => {
                self.publish(ticket, Ok(Decision::Stop(StopReason::ActionStopCalled)));
            }
            Action::Start(start) => {
                self.clear_published();
                let cancel = CancellationToken::new();
                let target = match start {
                    StartAction::Default => None,
                    StartAction::AnswerCall {
                        user_id,
                        conversation_id,
                    } => {
                        let bound = self.config.bind_answer_to_pipeline.then(|| cancel.clone());
                        self.answer.spawn(user_id.clone(), conversation_id.clone(), bound);
                        Some(AnswerTarget {
                            user_id,
                            conversation_id,
                        })
                    }
                };
                self.spawn_pipeline(ticket, target, cancel, output.clone());
            }
        }
    }

    fn spawn_pipeline(
        &mut self,
        ticket: ActionTicket,
        target: Option<AnswerTarget>,
        cancel: CancellationToken,
        output: mpsc::Sender<PipelineOutput>,
    ) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let pipeline = Pipeline {
            generation,
            target,
            resolver: self.resolver.clone(),
            aggregator: self.aggregator.clone(),
            stop_debounce: self.config.stop_debounce,
            cancel: cancel.clone(),
            output,
            _alive: AliveGuard::new(Arc::clone(&self.alive)),
        };
        let handle = tokio::spawn(pipeline.run());
        debug!(ticket = %ticket, generation, "pipeline spawned");
        self.current = Some(ActivePipeline {
            generation,
            ticket,
            cancel,
            handle,
        });
    }

    async fn cancel_current(&mut self) {
        let Some(active) = self.current.take() else {
            return;
        };
        active.cancel.cancel();
        if let Err(e) = active.handle.await {
            warn!(generation = active.generation, error = %e, "pipeline task ended abnormally");
        }
        debug!(generation = active.generation, "pipeline cancelled");
    }

    async fn on_output(&mut self, output: PipelineOutput) {
        let Some(active) = self.current.as_ref() else {
            debug!(generation = output.generation, "dropped output with no active pipeline");
            return;
        };
        if active.generation != output.generation {
            debug!(
                generation = output.generation,
                current = active.generation,
                "dropped output of superseded pipeline"
            );
            return;
        }
        let ticket = active.ticket;
        let failed = output.result.is_err();
        self.publish(ticket, output.result);
        if failed {
            self.cancel_current().await;
        }
    }

    fn publish(&mut self, ticket: ActionTicket, result: DecisionResult) {
        self.seq += 1;
        match &result {
            Ok(Decision::Stop(reason)) => info!(ticket = %ticket, reason = %reason, "decision: stop"),
            Ok(Decision::Update(data)) => info!(
                ticket = %ticket,
                user_id = %data.user_id,
                conversation_id = %data.conversation_id(),
                status = data.call.status.as_str(),
                "decision: update"
            ),
            Err(error) => warn!(ticket = %ticket, error = %error, kind = error.error_kind(), "decision: failure"),
        }
        self.decisions.send_replace(Some(Published {
            seq: self.seq,
            ticket,
            result,
        }));
    }

    /// Forget the last decision without waking observers.
    fn clear_published(&self) {
        self.decisions.send_if_modified(|slot| {
            *slot = None;
            false
        });
    }
}

pin_project! {
    /// Stream of published decisions.
    ///
    /// Yields the latest decision on first poll, then every later one.
    /// Rapid successive decisions may be conflated to the newest.
    pub struct DecisionStream {
        #[pin]
        inner: WatchStream<Option<Published>>,
        since: ActionTicket,
    }
}

impl DecisionStream {
    pub fn new(rx: watch::Receiver<Option<Published>>) -> Self {
        Self {
            inner: WatchStream::new(rx),
            since: ActionTicket::default(),
        }
    }

    /// Skip decisions produced for actions older than `ticket`.
    pub fn since(mut self, ticket: ActionTicket) -> Self {
        self.since = ticket;
        self
    }
}

impl Stream for DecisionStream {
    type Item = Published;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Some(published))) if published.ticket >= *this.since => {
                    return Poll::Ready(Some(published));
                }
                Poll::Ready(Some(_)) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use callkeep_core::memory::{MemorySessionStore, MemoryUserScope};
    use callkeep_core::{
        Call, CallError, CallStatus, ConversationId, LogoutReason, SelfUser, Session, UserId,
    };
    use futures::StreamExt;
    use tokio::time::{sleep, timeout, Instant};

    const WINDOW: Duration = Duration::from_millis(200);

    struct Harness {
        store: Arc<MemorySessionStore>,
        me: Arc<MemoryUserScope>,
        engine: LifecycleEngine,
    }

    fn self_user(value: &str) -> SelfUser {
        SelfUser {
            id: UserId::new(value, "wire.com"),
            name: Some(value.to_uppercase()),
            handle: Some(format!("{value}_handle")),
        }
    }

    fn me() -> UserId {
        UserId::new("me", "wire.com")
    }

    fn conv(value: &str) -> ConversationId {
        ConversationId::new(value, "wire.com")
    }

    fn call(value: &str, status: CallStatus) -> Call {
        Call::new(conv(value), UserId::new("caller", "wire.com"), status)
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let me = store.add_account(self_user("me"));
        store.set_current_session(Some(Session::valid(UserId::new("me", "wire.com"))));
        let engine = LifecycleEngine::new(store.clone(), config);
        engine.start().unwrap();
        Harness { store, me, engine }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default())
    }

    async fn next(stream: &mut DecisionStream) -> Published {
        timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no decision within 5s")
            .expect("decision stream ended")
    }

    async fn assert_quiet(stream: &mut DecisionStream, window: Duration) {
        if let Ok(published) = timeout(window, stream.next()).await {
            panic!("unexpected decision: {published:?}");
        }
    }

    fn update_of(published: &Published) -> &callkeep_core::NotificationData {
        match &published.result {
            Ok(Decision::Update(data)) => data,
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_published_without_debounce() {
        let h = harness();
        let mut decisions = h.engine.subscribe();
        let started = Instant::now();

        let ticket = h.engine.submit(Action::Stop);
        let published = next(&mut decisions).await;

        assert_eq!(published.ticket, ticket);
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::ActionStopCalled)));
        assert!(started.elapsed() < WINDOW);
        assert_quiet(&mut decisions, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_session_stops_after_window() {
        let h = harness();
        h.store.set_current_session(None);
        let mut decisions = h.engine.subscribe();
        let started = Instant::now();

        h.engine.submit(Action::start());
        let published = next(&mut decisions).await;

        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoValidSession)));
        assert!(started.elapsed() >= WINDOW);
        assert_quiet(&mut decisions, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn established_call_updates_immediately() {
        let h = harness();
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        let mut decisions = h.engine.subscribe();
        let started = Instant::now();

        h.engine.submit(Action::start());
        let published = next(&mut decisions).await;

        let data = update_of(&published);
        assert_eq!(data.user_id, me());
        assert_eq!(data.call, call("conv", CallStatus::Established));
        assert_eq!(data.display_name, "me_handle");
        assert!(started.elapsed() < WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn no_calls_stops_only_after_window() {
        let h = harness();
        let mut decisions = h.engine.subscribe();
        let started = Instant::now();

        h.engine.submit(Action::start());
        let published = next(&mut decisions).await;

        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoCalls)));
        assert!(started.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_for_missing_call_skips_answer_but_keeps_deciding() {
        let h = harness();
        h.me.set_established(vec![call("ongoing", CallStatus::Established)]);
        let mut decisions = h.engine.subscribe();

        h.engine.submit(Action::answer(me(), conv("gone")));
        let published = next(&mut decisions).await;

        assert_eq!(update_of(&published).call.conversation_id, conv("ongoing"));
        sleep(Duration::from_secs(1)).await;
        assert!(h.me.answered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn answer_shows_incoming_then_established_call() {
        let h = harness();
        h.me.set_answer_establishes(true);
        h.me.set_incoming(vec![call("target", CallStatus::Incoming)]);
        let mut decisions = h.engine.subscribe();

        h.engine.submit(Action::answer(me(), conv("target")));

        let mut last = next(&mut decisions).await;
        while update_of(&last).call.status != CallStatus::Answered {
            last = next(&mut decisions).await;
        }
        assert_eq!(update_of(&last).call.conversation_id, conv("target"));
        assert_eq!(h.me.answer_count(&conv("target")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_actions_publish_only_the_final_stop() {
        let h = harness();
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        h.me.set_incoming(vec![call("target", CallStatus::Incoming)]);
        let mut decisions = h.engine.subscribe();

        h.engine.submit(Action::start());
        h.engine.submit(Action::answer(me(), conv("target")));
        let stop = h.engine.submit(Action::Stop);

        let published = next(&mut decisions).await;
        assert_eq!(published.ticket, stop);
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::ActionStopCalled)));
        assert_quiet(&mut decisions, Duration::from_secs(2)).await;
        assert_eq!(h.engine.active_pipelines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flooding_processes_latest_action() {
        let h = harness_with(EngineConfig {
            queue_capacity: 4,
            ..EngineConfig::default()
        });
        h.me.set_established(vec![call("conv", CallStatus::Established)]);

        for _ in 0..500 {
            h.engine.submit(Action::start());
        }
        let last = h.engine.submit(Action::Stop);

        let mut decisions = h.engine.subscribe().since(last);
        let published = next(&mut decisions).await;
        assert_eq!(published.ticket, last);
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::ActionStopCalled)));
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_pipeline_alive() {
        let h = harness();
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        h.me.set_incoming(vec![call("target", CallStatus::Incoming)]);

        let actions = [
            Action::start(),
            Action::answer(me(), conv("target")),
            Action::Stop,
            Action::start(),
            Action::start(),
            Action::answer(UserId::new("ghost", "wire.com"), conv("target")),
        ];
        for round in 0..20 {
            for action in actions.iter().cycle().skip(round).take(actions.len()) {
                h.engine.submit(action.clone());
                assert!(h.engine.active_pipelines() <= 1);
                tokio::task::yield_now().await;
                assert!(h.engine.active_pipelines() <= 1);
            }
            sleep(Duration::from_millis(round as u64 * 13)).await;
            assert!(h.engine.active_pipelines() <= 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn logout_stops_with_no_valid_session() {
        let h = harness();
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        let mut decisions = h.engine.subscribe();
        h.engine.submit(Action::start());
        update_of(&next(&mut decisions).await);

        h.store
            .set_current_session(Some(Session::invalid(me(), LogoutReason::SelfHardLogout)));

        let published = next(&mut decisions).await;
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoValidSession)));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_to_account_without_calls_stops() {
        let h = harness();
        h.store.add_account(self_user("other"));
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        let mut decisions = h.engine.subscribe();
        h.engine.submit(Action::start());
        update_of(&next(&mut decisions).await);

        h.store
            .set_current_session(Some(Session::valid(UserId::new("other", "wire.com"))));

        let published = next(&mut decisions).await;
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoCalls)));
    }

    #[tokio::test(start_paused = true)]
    async fn status_change_publishes_new_update() {
        let h = harness();
        h.me.set_outgoing(vec![call("conv", CallStatus::Started)]);
        let mut decisions = h.engine.subscribe();
        h.engine.submit(Action::start());
        assert!(update_of(&next(&mut decisions).await).is_outgoing());

        h.me.set_outgoing(vec![]);
        h.me.set_established(vec![call("conv", CallStatus::Established)]);

        let mut published = next(&mut decisions).await;
        while update_of(&published).is_outgoing() {
            published = next(&mut decisions).await;
        }
        assert_eq!(update_of(&published).call.status, CallStatus::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn flicker_shorter_than_window_is_absorbed() {
        let h = harness();
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        let mut decisions = h.engine.subscribe();
        h.engine.submit(Action::start());
        update_of(&next(&mut decisions).await);

        h.me.set_established(vec![]);
        sleep(Duration::from_millis(100)).await;
        h.me.set_established(vec![call("conv", CallStatus::Established)]);

        assert_quiet(&mut decisions, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn display_name_is_read_once_per_session() {
        let h = harness();
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        let mut decisions = h.engine.subscribe();
        h.engine.submit(Action::start());
        update_of(&next(&mut decisions).await);

        h.me.set_self_user(SelfUser {
            handle: Some("renamed".into()),
            ..self_user("me")
        });
        h.me.set_established(vec![call("conv", CallStatus::StillOngoing)]);

        let published = next(&mut decisions).await;
        assert_eq!(update_of(&published).display_name, "me_handle");
    }

    #[tokio::test(start_paused = true)]
    async fn answer_for_other_valid_account() {
        let h = harness();
        let other = h.store.add_account(self_user("other"));
        other.set_incoming(vec![call("target", CallStatus::Incoming)]);
        let other_id = UserId::new("other", "wire.com");
        let mut decisions = h.engine.subscribe();

        h.engine.submit(Action::answer(other_id.clone(), conv("target")));

        let published = next(&mut decisions).await;
        let data = update_of(&published);
        assert_eq!(data.user_id, other_id);
        assert_eq!(data.display_name, "other_handle");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(other.answer_count(&conv("target")), 1);
        assert!(h.me.answered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn answer_for_invalid_account_is_skipped() {
        let h = harness();
        let other = h.store.add_account(self_user("other"));
        other.set_incoming(vec![call("target", CallStatus::Incoming)]);
        other.set_valid(false);
        let mut decisions = h.engine.subscribe();

        h.engine
            .submit(Action::answer(UserId::new("other", "wire.com"), conv("target")));

        let published = next(&mut decisions).await;
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoCalls)));
        assert!(other.answered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_failure_is_published_once() {
        let h = harness();
        h.me.fail_established(CallError::Storage("database locked".into()));
        let mut decisions = h.engine.subscribe();

        h.engine.submit(Action::start());

        let published = next(&mut decisions).await;
        assert_matches!(published.result, Err(CallError::Storage(_)));
        assert_quiet(&mut decisions, Duration::from_secs(1)).await;
        assert_eq!(h.engine.active_pipelines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_stream_failure_is_published() {
        let h = harness();
        h.store.fail_current_session(CallError::Internal("session store gone".into()));
        let mut decisions = h.engine.subscribe();

        h.engine.submit(Action::start());

        assert_matches!(next(&mut decisions).await.result, Err(CallError::Internal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_clears_replayed_decision() {
        let h = harness();
        let mut decisions = h.engine.subscribe();
        h.engine.submit(Action::Stop);
        next(&mut decisions).await;
        assert!(h.engine.latest().is_some());

        h.engine.submit(Action::start());
        sleep(Duration::from_millis(10)).await;
        assert!(h.engine.latest().is_none());

        let published = next(&mut decisions).await;
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoCalls)));
        assert_eq!(h.engine.latest(), Some(published));
    }

    #[tokio::test(start_paused = true)]
    async fn since_skips_older_decisions() {
        let h = harness();
        let first = h.engine.submit(Action::Stop);
        let mut all = h.engine.subscribe();
        assert_eq!(next(&mut all).await.ticket, first);

        let later = ActionTicket(first.0 + 1);
        let mut filtered = h.engine.subscribe().since(later);
        assert_quiet(&mut filtered, Duration::from_millis(500)).await;

        let second = h.engine.submit(Action::Stop);
        assert_eq!(second, later);
        assert_eq!(next(&mut filtered).await.ticket, second);
    }

    #[tokio::test(start_paused = true)]
    async fn bound_answer_is_aborted_by_next_action() {
        let h = harness_with(EngineConfig {
            bind_answer_to_pipeline: true,
            ..EngineConfig::default()
        });
        h.me.set_incoming(vec![call("target", CallStatus::Incoming)]);
        h.me.set_answer_delay(Some(Duration::from_secs(1)));

        h.engine.submit(Action::answer(me(), conv("target")));
        sleep(Duration::from_millis(50)).await;
        h.engine.submit(Action::Stop);
        sleep(Duration::from_secs(3)).await;

        assert!(h.me.answered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn detached_answer_survives_next_action() {
        let h = harness();
        h.me.set_incoming(vec![call("target", CallStatus::Incoming)]);
        h.me.set_answer_delay(Some(Duration::from_secs(1)));

        h.engine.submit(Action::answer(me(), conv("target")));
        sleep(Duration::from_millis(50)).await;
        h.engine.submit(Action::Stop);
        sleep(Duration::from_secs(3)).await;

        assert_eq!(h.me.answer_count(&conv("target")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_actor_and_pipeline() {
        let h = harness();
        h.me.set_established(vec![call("conv", CallStatus::Established)]);
        let mut decisions = h.engine.subscribe();
        h.engine.submit(Action::start());
        next(&mut decisions).await;
        assert_eq!(h.engine.active_pipelines(), 1);

        h.engine.shutdown();
        h.engine.join().await.unwrap();

        assert_eq!(h.engine.active_pipelines(), 0);
        assert_matches!(h.engine.try_submit(Action::start()), Err(EngineError::QueueClosed));
        assert_eq!(h.store.session_subscribers(), 0);
    }

    /// Session source that reports one logged-out state, then ends.
    struct FiniteSessions;

    #[async_trait::async_trait]
    impl SessionStore for FiniteSessions {
        fn current_session(&self) -> callkeep_core::LiveStream<Option<Session>> {
            Box::pin(futures::stream::iter([Ok(None)]))
        }

        async fn has_valid_session(&self, _user_id: &UserId) -> Result<bool, CallError> {
            Ok(false)
        }

        async fn user_scope(&self, user_id: &UserId) -> Result<Arc<dyn callkeep_core::UserScope>, CallError> {
            Err(CallError::SessionNotFound(user_id.clone()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completed_session_stream_flushes_pending_stop() {
        let engine = LifecycleEngine::new(Arc::new(FiniteSessions), EngineConfig::default());
        engine.start().unwrap();
        let mut decisions = engine.subscribe();
        let started = Instant::now();

        engine.submit(Action::start());
        let published = next(&mut decisions).await;

        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoValidSession)));
        assert!(started.elapsed() < WINDOW);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_pipelines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_debounce_still_stops() {
        let h = harness_with(EngineConfig {
            stop_debounce: Duration::MAX,
            ..EngineConfig::default()
        });
        let mut decisions = h.engine.subscribe();
        let started = Instant::now();

        h.engine.submit(Action::start());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.engine.active_pipelines(), 1);

        let published = timeout(crate::policy::MAX_DEBOUNCE_WINDOW * 2, decisions.next())
            .await
            .expect("no decision within the clamped window")
            .expect("decision stream ended");
        assert_eq!(published.result, Ok(Decision::Stop(StopReason::NoCalls)));
        assert!(started.elapsed() >= crate::policy::MAX_DEBOUNCE_WINDOW);
        assert_eq!(h.engine.active_pipelines(), 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let h = harness();
        assert_matches!(h.engine.start(), Err(EngineError::AlreadyRunning));
    }
}
