use crate::config::ConfigError;
use thiserror::Error;

/// Failures that end a run. Everything else is handled inside the
/// supervisor and shows up only as counters in the report.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("refusing to start: {0}")]
    FatalConfig(#[from] ConfigError),

    #[error("gave up on {endpoint} after {attempts} consecutive connection failures (last: {last_error})")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
}

impl RunError {
    /// Process exit code, following sysexits(3).
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::FatalConfig(_) => 78,
            RunError::RetriesExhausted { .. } => 69,
        }
    }
}
