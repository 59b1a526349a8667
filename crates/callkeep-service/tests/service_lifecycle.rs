//! End-to-end: OS callbacks → CallService → engine → in-memory store → host.

use std::sync::Arc;
use std::time::Duration;

use callkeep_core::memory::{MemorySessionStore, MemoryUserScope};
use callkeep_core::{
    Action, Call, CallError, CallStatus, ConversationId, LogoutReason, NotificationData, SelfUser,
    ServiceState, Session, StopReason, UserId,
};
use callkeep_engine::EngineConfig;
use callkeep_service::{CallService, EngineOrchestrator, ServiceHost, ServiceStateCell, StopCause};
use parking_lot::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq)]
enum HostEvent {
    Placeholder,
    Update(NotificationData),
    Stop(StopCause),
}

#[derive(Default)]
struct RecordingHost {
    events: Mutex<Vec<HostEvent>>,
}

impl RecordingHost {
    fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    fn last(&self) -> Option<HostEvent> {
        self.events.lock().last().cloned()
    }

    fn stops(&self) -> Vec<StopCause> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::Stop(cause) => Some(cause),
                _ => None,
            })
            .collect()
    }
}

impl ServiceHost for RecordingHost {
    fn show_placeholder(&self) {
        self.events.lock().push(HostEvent::Placeholder);
    }

    fn update_notification(&self, data: &NotificationData) {
        self.events.lock().push(HostEvent::Update(data.clone()));
    }

    fn stop_self(&self, cause: StopCause) {
        self.events.lock().push(HostEvent::Stop(cause));
    }
}

struct World {
    store: Arc<MemorySessionStore>,
    me: Arc<MemoryUserScope>,
    orchestrator: Arc<EngineOrchestrator>,
    host: Arc<RecordingHost>,
    state: ServiceStateCell,
    service: CallService,
}

fn user(value: &str) -> SelfUser {
    SelfUser {
        id: UserId::new(value, "wire.com"),
        name: Some(format!("{value} name")),
        handle: Some(value.to_string()),
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

fn world() -> World {
    let store = Arc::new(MemorySessionStore::new());
    let me_scope = store.add_account(user("me"));
    store.set_current_session(Some(Session::valid(me())));
    let orchestrator = Arc::new(EngineOrchestrator::start(store.clone(), EngineConfig::default()).unwrap());
    let host = Arc::new(RecordingHost::default());
    let state = ServiceStateCell::new();
    let service = CallService::new(orchestrator.clone(), host.clone(), state.clone());
    World {
        store,
        me: me_scope,
        orchestrator,
        host,
        state,
        service,
    }
}

/// Long enough for any debounced stop to land.
async fn settle() {
    sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn stop_action_stops_service() {
    let w = world();
    w.me.set_established(vec![call("conv", CallStatus::Established)]);
    w.service.on_create();
    w.service.on_start_command(None);
    settle().await;

    w.service.on_start_command(Some(Action::Stop));
    settle().await;

    assert_eq!(
        w.host.last(),
        Some(HostEvent::Stop(StopCause::Decision(StopReason::ActionStopCalled)))
    );
}

#[tokio::test(start_paused = true)]
async fn no_session_stops_service() {
    let w = world();
    w.store.set_current_session(None);
    w.service.on_create();
    w.service.on_start_command(None);
    settle().await;

    assert_eq!(
        w.host.events(),
        vec![
            HostEvent::Placeholder,
            HostEvent::Stop(StopCause::Decision(StopReason::NoValidSession)),
        ]
    );
    assert_eq!(w.state.get(), ServiceState::Foreground);
}

#[tokio::test(start_paused = true)]
async fn established_call_then_closed() {
    let w = world();
    w.me.set_established(vec![call("conv", CallStatus::Established)]);
    w.service.on_create();
    w.service.on_start_command(None);
    sleep(Duration::from_millis(10)).await;

    assert_eq!(w.host.events().len(), 2);
    match w.host.last() {
        Some(HostEvent::Update(data)) => {
            assert_eq!(data.user_id, me());
            assert_eq!(data.display_name, "me");
            assert_eq!(data.call.status, CallStatus::Established);
        }
        other => panic!("expected update, got {other:?}"),
    }

    w.me.set_established(vec![]);
    settle().await;
    assert_eq!(w.host.stops(), vec![StopCause::Decision(StopReason::NoCalls)]);
}

#[tokio::test(start_paused = true)]
async fn answered_call_becoming_established_updates() {
    let w = world();
    w.me.set_established(vec![call("conv", CallStatus::Answered)]);
    w.service.on_start_command(None);
    sleep(Duration::from_millis(10)).await;

    w.me.set_established(vec![call("conv", CallStatus::Established)]);
    sleep(Duration::from_millis(10)).await;

    let statuses: Vec<CallStatus> = w
        .host
        .events()
        .into_iter()
        .filter_map(|event| match event {
            HostEvent::Update(data) => Some(data.call.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![CallStatus::Answered, CallStatus::Established]);
}

#[tokio::test(start_paused = true)]
async fn logout_during_call_stops_service() {
    let w = world();
    w.me.set_established(vec![call("conv", CallStatus::Established)]);
    w.service.on_start_command(None);
    sleep(Duration::from_millis(10)).await;

    w.store
        .set_current_session(Some(Session::invalid(me(), LogoutReason::RemovedClient)));
    settle().await;

    assert_eq!(
        w.host.stops(),
        vec![StopCause::Decision(StopReason::NoValidSession)]
    );
}

#[tokio::test(start_paused = true)]
async fn answer_for_current_session() {
    let w = world();
    w.me.set_answer_establishes(true);
    w.me.set_incoming(vec![call("target", CallStatus::Incoming)]);
    w.service.on_start_command(Some(Action::answer(me(), conv("target"))));
    settle().await;

    assert_eq!(w.me.answer_count(&conv("target")), 1);
    match w.host.last() {
        Some(HostEvent::Update(data)) => {
            assert_eq!(data.call.conversation_id, conv("target"));
            assert_eq!(data.call.status, CallStatus::Answered);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert!(w.host.stops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn answer_for_missing_call_stops() {
    let w = world();
    w.service.on_start_command(Some(Action::answer(me(), conv("gone"))));
    settle().await;

    assert!(w.me.answered().is_empty());
    assert_eq!(w.host.stops(), vec![StopCause::Decision(StopReason::NoCalls)]);
}

#[tokio::test(start_paused = true)]
async fn answer_for_other_valid_account() {
    let w = world();
    let other = w.store.add_account(user("other"));
    other.set_incoming(vec![call("target", CallStatus::Incoming)]);
    let other_id = UserId::new("other", "wire.com");

    w.service
        .on_start_command(Some(Action::answer(other_id.clone(), conv("target"))));
    settle().await;

    assert_eq!(other.answer_count(&conv("target")), 1);
    match w.host.last() {
        Some(HostEvent::Update(data)) => {
            assert_eq!(data.user_id, other_id);
            assert_eq!(data.display_name, "other");
        }
        other => panic!("expected update, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn answer_for_other_invalid_account() {
    let w = world();
    let other = w.store.add_account(user("other"));
    other.set_incoming(vec![call("target", CallStatus::Incoming)]);
    other.set_valid(false);

    w.service.on_start_command(Some(Action::answer(
        UserId::new("other", "wire.com"),
        conv("target"),
    )));
    settle().await;

    assert!(other.answered().is_empty());
    assert_eq!(w.host.stops(), vec![StopCause::Decision(StopReason::NoCalls)]);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_stops_service_once() {
    let w = world();
    w.me.fail_established(CallError::Storage("disk I/O error".into()));
    w.service.on_start_command(None);
    settle().await;

    assert_eq!(
        w.host.stops(),
        vec![StopCause::Failure(CallError::Storage("disk I/O error".into()))]
    );
    assert_eq!(w.orchestrator.active_pipelines(), 0);
}

#[tokio::test(start_paused = true)]
async fn new_service_ignores_previous_instance_decision() {
    let w = world();
    w.service.on_start_command(Some(Action::Stop));
    settle().await;
    w.service.on_destroy();

    w.me.set_established(vec![call("conv", CallStatus::Established)]);
    let host = Arc::new(RecordingHost::default());
    let next = CallService::new(w.orchestrator.clone(), host.clone(), w.state.clone());
    next.on_create();
    next.on_start_command(None);
    settle().await;

    assert!(host.stops().is_empty());
    assert!(matches!(host.last(), Some(HostEvent::Update(_))));
}

#[tokio::test(start_paused = true)]
async fn destroy_resets_state_and_stops_observing() {
    let w = world();
    w.service.on_create();
    w.service.on_start_command(None);
    sleep(Duration::from_millis(10)).await;
    assert!(w.service.is_observing());

    w.service.on_destroy();
    settle().await;

    assert_eq!(w.state.get(), ServiceState::NotStarted);
    assert!(!w.service.is_observing());
    assert!(w.host.stops().is_empty());
}
