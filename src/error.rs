//! Error types for controller resolution, sessions and hardware I/O.
//!
//! Every failure surfaced by this crate is a [`DaqError`], and every
//! `DaqError` belongs to exactly one [`ErrorKind`]:
//!
//! - **Configuration**: resolve-time problems (unknown controller type,
//!   missing or mistyped keys, conflicting calibration) and per-call argument
//!   problems (wrong axis count, out-of-range position). Never retryable and
//!   always raised before any hardware is touched.
//! - **SessionState**: lifecycle misuse such as starting a running session or
//!   claiming channels that another session already owns. A read that was
//!   cancelled by `stop()` also lands here.
//! - **Transient**: read/write timeouts. The session is left running and the
//!   caller may retry.
//! - **HardwareFault**: the driver or device failed. The owning session is
//!   forced into `Stopped` and must be restarted explicitly.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for DAQ controller operations.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resolve-time or argument error, non-retryable.
    Configuration,
    /// Lifecycle misuse, non-retryable.
    SessionState,
    /// Timeout, retryable by the caller.
    Transient,
    /// Driver/device failure, requires an explicit restart.
    HardwareFault,
}

/// Errors that can occur while resolving or operating a controller.
#[derive(Error, Debug)]
pub enum DaqError {
    /// No factory is registered for the namespace/type pair.
    #[error("Unknown controller type '{namespace}.{type_name}'")]
    UnknownControllerType {
        /// Requested namespace
        namespace: String,
        /// Requested type name
        type_name: String,
    },

    /// A required configuration key is absent.
    #[error("Missing required configuration key '{key}' for {controller}")]
    MissingRequiredKey {
        /// Controller archetype being resolved
        controller: &'static str,
        /// Missing key
        key: String,
    },

    /// A configuration value has the wrong type.
    #[error("Configuration key '{key}' must be {expected}, found {found}")]
    InvalidValueType {
        /// Offending key
        key: String,
        /// Declared type of the key
        expected: &'static str,
        /// Type actually found
        found: &'static str,
    },

    /// A configuration value has the right type but an unusable value.
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// Offending key
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// Two configuration values contradict each other.
    #[error("Configuration conflict: {message}")]
    ConfigurationConflict {
        /// Description of the conflict
        message: String,
    },

    /// The configuration source itself could not be loaded.
    #[error("Failed to load configuration: {0}")]
    ConfigSource(#[from] Box<figment::Error>),

    /// Number of values passed does not match the number of channels.
    #[error("Expected {expected} value(s) (or 1 for all axes), got {actual}")]
    ChannelCountMismatch {
        /// Number of configured channels
        expected: usize,
        /// Number of values supplied
        actual: usize,
    },

    /// A position command lies outside the calibrated range.
    #[error("Position {position} on axis {axis} outside allowed range [{min}, {max}]")]
    PositionOutOfRange {
        /// Axis index in channel order
        axis: usize,
        /// Requested position
        position: f64,
        /// Minimum allowed position
        min: f64,
        /// Maximum allowed position
        max: f64,
    },

    /// Another live session already claims the channel.
    #[error("Session already active on {device}/{channel}")]
    SessionAlreadyActive {
        /// Device name
        device: String,
        /// First conflicting channel
        channel: String,
    },

    /// Operation not permitted in the current lifecycle state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Current state name
        state: &'static str,
    },

    /// A blocking read was cancelled by `stop()`.
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking call did not complete in time.
    #[error("Read timed out after {timeout:?} ({received}/{requested} samples)")]
    ReadTimeout {
        /// Per-call timeout
        timeout: Duration,
        /// Samples requested
        requested: usize,
        /// Samples available when the timeout fired
        received: usize,
    },

    /// Driver-level or device-level failure.
    #[error("Hardware fault on {device}: {message}")]
    HardwareFault {
        /// Device name
        device: String,
        /// Driver message
        message: String,
    },

    /// Resolving a named controller from a lab configuration failed.
    #[error("Controller '{name}': {source}")]
    InController {
        /// Controller name in the configuration
        name: String,
        /// Underlying failure
        #[source]
        source: Box<DaqError>,
    },
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::ConfigSource(Box::new(err))
    }
}

impl DaqError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownControllerType { .. }
            | Self::MissingRequiredKey { .. }
            | Self::InvalidValueType { .. }
            | Self::InvalidValue { .. }
            | Self::ConfigurationConflict { .. }
            | Self::ConfigSource(_)
            | Self::ChannelCountMismatch { .. }
            | Self::PositionOutOfRange { .. } => ErrorKind::Configuration,
            Self::SessionAlreadyActive { .. } | Self::InvalidState { .. } | Self::Cancelled => {
                ErrorKind::SessionState
            }
            Self::ReadTimeout { .. } => ErrorKind::Transient,
            Self::HardwareFault { .. } => ErrorKind::HardwareFault,
            Self::InController { source, .. } => source.kind(),
        }
    }

    /// Whether the caller may simply retry the same call.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::InController { source, .. } => source.is_timeout(),
            other => matches!(other, Self::ReadTimeout { .. }),
        }
    }

    /// Check if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::InController { source, .. } => source.is_cancelled(),
            other => matches!(other, Self::Cancelled),
        }
    }

    pub(crate) fn in_controller(name: &str, source: DaqError) -> Self {
        Self::InController {
            name: name.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn hardware(device: &str, message: impl Into<String>) -> Self {
        Self::HardwareFault {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::ConfigurationConflict {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_value(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
