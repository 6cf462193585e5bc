use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("framing error: expected {expected} bytes, got {actual}")]
    Framing { expected: usize, actual: usize },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("device not connected")]
    NotConnected,
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("an experiment run is already active")]
    RunInProgress,
    #[error("no experiment run is active")]
    NoActiveRun,
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("profile parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a single characteristic write.
///
/// The dispatcher never retries these; the scheduler owns retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("write timed out")]
    Timeout,
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("device not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {mac}")]
    NotFound { mac: String },
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: uuid::Uuid },
    #[error("gatt operation failed: {0}")]
    Gatt(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
