use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PupError {
    #[error("config error: {0}")]
    Config(String),
    #[error("failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },
    #[error("watch error: {0}")]
    Watch(String),
    #[error("ipc error: {0}")]
    Ipc(String),
    #[error("another pup core is already running at {0}")]
    BusConflict(String),
    #[error("unknown process: {0}")]
    UnknownProcess(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
