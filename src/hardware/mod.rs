//! DAQ hardware layer.
//!
//! - [`driver`]: the [`DaqDriver`] boundary to the vendor driver
//! - [`sim`]: [`SimulatedDaq`], an in-process driver for tests and dry runs
//! - [`session`]: [`SessionManager`] / [`HardwareSession`] lifecycle and
//!   exclusive channel ownership
//!
//! The identity types below describe *what* a session binds to and are
//! shared by all three.

pub mod driver;
pub mod session;
pub mod sim;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, Result};

pub use driver::{DaqDriver, DriverError, DriverResult, TaskHandle};
pub use session::{HardwareSession, SessionManager, SessionState};
pub use sim::{EdgeSource, SimulatedDaq};

/// Physical DAQ unit, e.g. `Dev1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Driver-level device name
    pub device_name: String,
}

impl DeviceIdentity {
    /// Create a device identity, rejecting empty names.
    pub fn new(device_name: impl Into<String>) -> Result<Self> {
        let device_name = device_name.into().trim().to_string();
        if device_name.is_empty() {
            return Err(DaqError::invalid_value("daq_name", "device name cannot be empty"));
        }
        Ok(Self { device_name })
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.device_name
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_name)
    }
}

/// Ordered, non-empty list of terminals on one device.
///
/// Terminals may be given bare (`ao0`) or device-qualified (`Dev1/ao0`); the
/// qualifier must match the owning device and is stripped. Order is kept
/// because it maps positionally onto calibration arrays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelSet {
    channels: Vec<String>,
}

impl ChannelSet {
    /// Validate `channels` against `device`.
    pub fn new<I, S>(device: &DeviceIdentity, channels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for raw in channels {
            let raw = raw.as_ref().trim();
            let terminal = match raw.split_once('/') {
                Some((dev, term)) if dev == device.name() => term,
                Some((dev, _)) => {
                    return Err(DaqError::conflict(format!(
                        "channel '{}' belongs to device '{}', not '{}'",
                        raw,
                        dev,
                        device.name()
                    )));
                }
                None => raw,
            };
            if terminal.is_empty() {
                return Err(DaqError::invalid_value("channels", "empty channel name"));
            }
            if out.iter().any(|c| c == terminal) {
                return Err(DaqError::conflict(format!(
                    "channel '{}' listed more than once",
                    terminal
                )));
            }
            out.push(terminal.to_string());
        }
        if out.is_empty() {
            return Err(DaqError::invalid_value("channels", "at least one channel is required"));
        }
        Ok(Self { channels: out })
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the set has no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Terminals in configured order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    /// Whether `terminal` is part of this set.
    pub fn contains(&self, terminal: &str) -> bool {
        self.channels.iter().any(|c| c == terminal)
    }

    /// Device-qualified names, e.g. `Dev1/ao0`.
    pub fn qualified(&self, device: &DeviceIdentity) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| format!("{}/{}", device.name(), c))
            .collect()
    }
}

/// Sample clock for a buffered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// External clock terminal; `None` selects the internal clock
    pub terminal: Option<String>,
    /// Clock rate in Hz. Programmed for the internal clock, advisory otherwise.
    pub rate_hz: u32,
}

impl ClockConfig {
    /// Internal clock at `rate_hz`.
    pub fn internal(rate_hz: u32) -> Self {
        Self {
            terminal: None,
            rate_hz,
        }
    }

    /// External clock on `terminal`, nominally at `rate_hz`.
    pub fn external(terminal: impl Into<String>, rate_hz: u32) -> Self {
        Self {
            terminal: Some(terminal.into()),
            rate_hz,
        }
    }

    /// Whether the device must generate the clock itself.
    pub fn is_internal(&self) -> bool {
        self.terminal.is_none()
    }
}

/// What a driver task does with its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    /// Count rising edges on `signal_terminal` using the counter channel
    EdgeCount {
        /// Digital input terminal carrying the pulses
        signal_terminal: String,
    },
    /// On-demand analog output
    AnalogOutput,
    /// On-demand analog input
    AnalogInput,
}

impl TaskKind {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::EdgeCount { .. } => "edge_count",
            Self::AnalogOutput => "analog_output",
            Self::AnalogInput => "analog_input",
        }
    }
}

/// Everything needed to create one driver task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Owning device
    pub device: DeviceIdentity,
    /// Task type
    pub kind: TaskKind,
    /// Channels claimed by the task
    pub channels: ChannelSet,
    /// Sample clock for buffered tasks
    pub clock: Option<ClockConfig>,
    /// Buffer size in samples per channel (buffered tasks only)
    pub samples_per_channel: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev1() -> DeviceIdentity {
        DeviceIdentity::new("Dev1").unwrap()
    }

    #[test]
    fn test_channel_set_strips_own_device() {
        let set = ChannelSet::new(&dev1(), ["Dev1/ao0", "ao1"]).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["ao0", "ao1"]);
        assert_eq!(set.qualified(&dev1()), vec!["Dev1/ao0", "Dev1/ao1"]);
    }

    #[test]
    fn test_channel_set_rejects_foreign_device() {
        let err = ChannelSet::new(&dev1(), ["Dev2/ao0"]).unwrap_err();
        assert!(matches!(err, DaqError::ConfigurationConflict { .. }));
    }

    #[test]
    fn test_channel_set_rejects_empty_and_duplicates() {
        assert!(ChannelSet::new(&dev1(), Vec::<String>::new()).is_err());
        assert!(ChannelSet::new(&dev1(), ["ao0", "Dev1/ao0"]).is_err());
    }

    #[test]
    fn test_device_identity_rejects_blank() {
        assert!(DeviceIdentity::new("  ").is_err());
    }
}
