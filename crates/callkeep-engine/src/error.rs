use callkeep_core::CallError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("call error: {0}")]
    Call(#[from] CallError),

    #[error("action queue closed")]
    QueueClosed,

    #[error("engine already running")]
    AlreadyRunning,

    #[error("{0}")]
    Internal(String),
}
