use thiserror::Error;

use crate::types::DeviceId;

/// Errors raised by the routing core.
///
/// None of them is fatal to a session: unknown devices are dropped, sink and
/// model failures are logged and surfaced to the UI.
#[derive(Error, Debug)]
pub enum ShioError {
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Unknown channel: {0}")]
    UnknownChannel(usize),

    #[error("Sink I/O error: {0}")]
    Sink(#[from] std::io::Error),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Inference timed out after {0} ms")]
    InferenceTimeout(u128),

    #[error("Invalid tensor shape: expected {expected} values, got {actual}")]
    InvalidShape { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ShioError>;
