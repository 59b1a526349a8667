//! Service host contract and the call-service driver.
//!
//! The platform layer implements [`ServiceHost`] and forwards its OS service
//! callbacks to [`CallService`]. The driver owns no decision logic: it shows
//! a placeholder, submits the action, and mirrors every decision onto the
//! host until the service is destroyed.

use std::sync::Arc;

use callkeep_core::{Action, ActionTicket, CallError, Decision, NotificationData, ServiceState, StopReason};
use callkeep_engine::{DecisionStream, Published};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::orchestrator::CallOrchestrator;

/// Why the host is asked to terminate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopCause {
    Decision(StopReason),
    Failure(CallError),
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decision(reason) => write!(f, "{reason}"),
            Self::Failure(error) => write!(f, "failure: {error}"),
        }
    }
}

/// The OS-level foreground process keeping a call alive.
pub trait ServiceHost: Send + Sync {
    /// Enter the foreground with a generic notification.
    fn show_placeholder(&self);

    fn update_notification(&self, data: &NotificationData);

    fn stop_self(&self, cause: StopCause);
}

/// Shared view of the hosting process lifecycle.
#[derive(Clone, Debug, Default)]
pub struct ServiceStateCell(Arc<RwLock<ServiceState>>);

impl ServiceStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ServiceState {
        *self.0.read()
    }

    pub fn set(&self, state: ServiceState) {
        let previous = std::mem::replace(&mut *self.0.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "service state changed");
        }
    }
}

/// Drives a [`ServiceHost`] from OS callbacks and orchestrator decisions.
pub struct CallService {
    orchestrator: Arc<dyn CallOrchestrator>,
    host: Arc<dyn ServiceHost>,
    state: ServiceStateCell,
    scope: CancellationToken,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl CallService {
    pub fn new(orchestrator: Arc<dyn CallOrchestrator>, host: Arc<dyn ServiceHost>, state: ServiceStateCell) -> Self {
        Self {
            orchestrator,
            host,
            state,
            scope: CancellationToken::new(),
            observer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    pub fn on_create(&self) {
        self.state.set(ServiceState::Started);
    }

    /// A missing action is treated as `Start(Default)`, the way an OS
    /// restart of a sticky service delivers no payload.
    pub fn on_start_command(&self, action: Option<Action>) -> ActionTicket {
        let action = action.unwrap_or_else(Action::start);
        info!(action = action.name(), "start command");
        self.host.show_placeholder();
        self.state.set(ServiceState::Foreground);

        let ticket = self.orchestrator.submit(action);
        let mut observer = self.observer.lock();
        if observer.is_none() {
            let decisions = self.orchestrator.observe_decisions().since(ticket);
            *observer = Some(tokio::spawn(observe(
                decisions,
                Arc::clone(&self.host),
                self.scope.clone(),
            )));
        }
        ticket
    }

    /// Ends every task this service started.
    pub fn on_destroy(&self) {
        info!("destroy");
        self.state.set(ServiceState::NotStarted);
        self.scope.cancel();
        self.observer.lock().take();
    }

    /// Whether the decision observer task is still running.
    pub fn is_observing(&self) -> bool {
        self.observer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for CallService {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn observe(mut decisions: DecisionStream, host: Arc<dyn ServiceHost>, scope: CancellationToken) {
    loop {
        let published = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            next = decisions.next() => match next {
                Some(published) => published,
                None => break,
            },
        };
        react(host.as_ref(), published);
    }
    debug!("decision observer finished");
}

fn react(host: &dyn ServiceHost, published: Published) {
    match published.result {
        Ok(Decision::Update(data)) => host.update_notification(&data),
        Ok(Decision::Stop(reason)) => {
            info!(ticket = %published.ticket, reason = %reason, "stopping service");
            host.stop_self(StopCause::Decision(reason));
        }
        Err(e) => {
            error!(ticket = %published.ticket, error = %e, kind = e.error_kind(), "call pipeline failed, stopping service");
            host.stop_self(StopCause::Failure(e));
        }
    }
}
