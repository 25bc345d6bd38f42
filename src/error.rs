//! Error types for the load engine.

/// Rejections returned by the session and ramp controllers.
///
/// All of these leave the engine state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// `start` was called while a session is live.
    #[error("Load already running")]
    AlreadyRunning,
    /// `stop` was called with no live session.
    #[error("Load not running")]
    NotRunning,
    /// The ramp is already at its cap.
    #[error("Maximum CPU load of {max}% already reached (current: {current}%)")]
    RampAtMaximum {
        /// Current ramp level.
        current: u8,
        /// Configured cap.
        max: u8,
    },
    /// The runtime shut down before a spawned transition finished.
    #[error("Load operation interrupted")]
    Interrupted,
}

impl ControlError {
    /// Rejections caused by the current engine state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ControlError::AlreadyRunning
                | ControlError::NotRunning
                | ControlError::RampAtMaximum { .. }
        )
    }
}

/// Failure of the memory generator to commit its next block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("allocation failed after {allocated_bytes} of {requested_bytes} bytes: {reason}")]
    Exhausted {
        allocated_bytes: u64,
        requested_bytes: u64,
        reason: String,
    },
}

/// Startup configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("dynamic load increment step must be greater than zero")]
    InvalidRampStep,
}
