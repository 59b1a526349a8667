//! Scripted runs against the in-memory session store.
//!
//! A scenario registers accounts, then replays timed steps: store mutations
//! and OS service callbacks. Every host reaction is written as one JSON line.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use callkeep_core::memory::{MemorySessionStore, MemoryUserScope};
use callkeep_core::{Action, Call, CallError, NotificationData, SelfUser, Session, UserId};
use callkeep_engine::EngineConfig;
use callkeep_service::{CallOrchestrator, CallService, EngineOrchestrator, ServiceHost, ServiceStateCell, StopCause};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};

fn default_settle_ms() -> u64 {
    1_000
}

#[derive(Clone, Debug, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub accounts: Vec<SelfUser>,
    pub steps: Vec<TimedStep>,
    /// How long to keep observing after the last step.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TimedStep {
    #[serde(default)]
    pub at_ms: u64,
    #[serde(flatten)]
    pub step: Step,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Session {
        session: Option<Session>,
    },
    FailSession {
        message: String,
    },
    SelfUser {
        user: SelfUser,
    },
    Valid {
        user_id: UserId,
        valid: bool,
    },
    Established {
        user_id: UserId,
        calls: Vec<Call>,
    },
    Outgoing {
        user_id: UserId,
        calls: Vec<Call>,
    },
    Incoming {
        user_id: UserId,
        calls: Vec<Call>,
    },
    FailEstablished {
        user_id: UserId,
        message: String,
    },
    AnswerBehavior {
        user_id: UserId,
        #[serde(default)]
        establishes: bool,
        #[serde(default)]
        delay_ms: Option<u64>,
        #[serde(default)]
        fail: Option<String>,
    },
    /// `onStartCommand`; creates the service first if it is not running.
    Command {
        #[serde(default)]
        action: Option<Action>,
    },
    /// `onDestroy`.
    Destroy,
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing scenario {}", path.display()))
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HostLine<'a> {
    Placeholder { at_ms: u64 },
    Update { at_ms: u64, data: &'a NotificationData },
    Stop { at_ms: u64, reason: String },
}

/// Writes every host reaction as a JSON line.
pub struct JsonLinesHost<W> {
    out: Mutex<W>,
    started: Instant,
}

impl<W: Write + Send> JsonLinesHost<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            started: Instant::now(),
        }
    }

    fn at_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn emit(&self, line: &HostLine<'_>) {
        let mut out = self.out.lock();
        let written = serde_json::to_writer(&mut *out, line)
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(out))
            .and_then(|_| out.flush());
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write host event");
        }
    }
}

impl<W: Write + Send> ServiceHost for JsonLinesHost<W> {
    fn show_placeholder(&self) {
        self.emit(&HostLine::Placeholder { at_ms: self.at_ms() });
    }

    fn update_notification(&self, data: &NotificationData) {
        self.emit(&HostLine::Update {
            at_ms: self.at_ms(),
            data,
        });
    }

    fn stop_self(&self, cause: StopCause) {
        self.emit(&HostLine::Stop {
            at_ms: self.at_ms(),
            reason: cause.to_string(),
        });
    }
}

struct Runner {
    store: Arc<MemorySessionStore>,
    orchestrator: Arc<EngineOrchestrator>,
    host: Arc<dyn ServiceHost>,
    state: ServiceStateCell,
    service: Option<CallService>,
}

impl Runner {
    fn account(&self, user_id: &UserId) -> anyhow::Result<Arc<MemoryUserScope>> {
        match self.store.account(user_id) {
            Some(scope) => Ok(scope),
            None => bail!("scenario refers to unknown account {user_id}"),
        }
    }

    fn apply(&mut self, step: Step) -> anyhow::Result<()> {
        match step {
            Step::Session { session } => self.store.set_current_session(session),
            Step::FailSession { message } => self.store.fail_current_session(CallError::Storage(message)),
            Step::SelfUser { user } => self.account(&user.id)?.set_self_user(user),
            Step::Valid { user_id, valid } => self.account(&user_id)?.set_valid(valid),
            Step::Established { user_id, calls } => self.account(&user_id)?.set_established(calls),
            Step::Outgoing { user_id, calls } => self.account(&user_id)?.set_outgoing(calls),
            Step::Incoming { user_id, calls } => self.account(&user_id)?.set_incoming(calls),
            Step::FailEstablished { user_id, message } => {
                self.account(&user_id)?.fail_established(CallError::Storage(message))
            }
            Step::AnswerBehavior {
                user_id,
                establishes,
                delay_ms,
                fail,
            } => {
                let scope = self.account(&user_id)?;
                scope.set_answer_establishes(establishes);
                scope.set_answer_delay(delay_ms.map(Duration::from_millis));
                scope.set_answer_failure(fail.map(CallError::Internal));
            }
            Step::Command { action } => {
                let service = self.service.get_or_insert_with(|| {
                    let service = CallService::new(
                        self.orchestrator.clone(),
                        Arc::clone(&self.host),
                        self.state.clone(),
                    );
                    service.on_create();
                    service
                });
                service.on_start_command(action);
            }
            Step::Destroy => {
                if let Some(service) = self.service.take() {
                    service.on_destroy();
                }
            }
        }
        Ok(())
    }
}

/// Replay `scenario` and report host reactions to `host`.
pub async fn run(scenario: Scenario, config: EngineConfig, host: Arc<dyn ServiceHost>) -> anyhow::Result<()> {
    let store = Arc::new(MemorySessionStore::new());
    for account in scenario.accounts {
        store.add_account(account);
    }
    let orchestrator = Arc::new(EngineOrchestrator::start(store.clone(), config)?);
    let mut runner = Runner {
        store,
        orchestrator: Arc::clone(&orchestrator),
        host,
        state: ServiceStateCell::new(),
        service: None,
    };

    let started = Instant::now();
    let mut steps = scenario.steps;
    steps.sort_by_key(|step| step.at_ms);
    let mut last_ms = 0;
    for TimedStep { at_ms, step } in steps {
        sleep_until(started + Duration::from_millis(at_ms)).await;
        tracing::debug!(at_ms, step = ?step, "applying scenario step");
        runner.apply(step)?;
        last_ms = at_ms;
    }
    sleep_until(started + Duration::from_millis(last_ms + scenario.settle_ms)).await;

    if let Some(service) = runner.service.take() {
        service.on_destroy();
    }
    orchestrator.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    const CALL_SCENARIO: &str = r#"{
        "accounts": [{"id": "me@wire.com", "name": "Me", "handle": "me"}],
        "steps": [
            {"step": "session", "session": {"user_id": "me@wire.com", "status": {"state": "valid"}}},
            {"step": "established", "user_id": "me@wire.com", "calls": [
                {"conversation_id": "conv@wire.com", "caller_id": "bob@wire.com", "status": "established"}
            ]},
            {"at_ms": 10, "step": "command"},
            {"at_ms": 500, "step": "established", "user_id": "me@wire.com", "calls": []}
        ],
        "settle_ms": 1000
    }"#;

    async fn replay(json: &str) -> Vec<serde_json::Value> {
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        let buf = SharedBuf::default();
        let host = Arc::new(JsonLinesHost::new(buf.clone()));
        run(scenario, EngineConfig::default(), host).await.unwrap();
        buf.lines()
    }

    #[tokio::test(start_paused = true)]
    async fn call_then_hangup() {
        let lines = replay(CALL_SCENARIO).await;
        let events: Vec<&str> = lines.iter().map(|l| l["event"].as_str().unwrap()).collect();
        assert_eq!(events, vec!["placeholder", "update", "stop"]);
        assert_eq!(lines[1]["data"]["display_name"], "me");
        assert_eq!(lines[1]["data"]["call"]["status"], "established");
        assert_eq!(lines[2]["reason"], "no_calls");
        assert!(lines[2]["at_ms"].as_u64().unwrap() >= 700);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_command() {
        let lines = replay(
            r#"{
                "steps": [
                    {"step": "command", "action": {"type": "start", "kind": "default"}},
                    {"at_ms": 50, "step": "command", "action": {"type": "stop"}}
                ],
                "settle_ms": 100
            }"#,
        )
        .await;
        let events: Vec<&str> = lines.iter().map(|l| l["event"].as_str().unwrap()).collect();
        assert_eq!(events, vec!["placeholder", "placeholder", "stop"]);
        assert_eq!(lines[2]["reason"], "action_stop_called");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_account_is_an_error() {
        let scenario: Scenario = serde_json::from_str(
            r#"{"steps": [{"step": "valid", "user_id": "ghost@wire.com", "valid": false}]}"#,
        )
        .unwrap();
        let host = Arc::new(JsonLinesHost::new(std::io::sink()));
        assert!(run(scenario, EngineConfig::default(), host).await.is_err());
    }

    #[test]
    fn scenario_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.json");
        std::fs::write(&path, CALL_SCENARIO).unwrap();
        let scenario = Scenario::from_file(&path).unwrap();
        assert_eq!(scenario.accounts.len(), 1);
        assert_eq!(scenario.steps.len(), 4);
        assert!(Scenario::from_file(&dir.path().join("missing.json")).is_err());
    }
}
