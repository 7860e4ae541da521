//! Vendor driver boundary.
//!
//! [`DaqDriver`] is the only place this crate touches a DAQ card. Calls are
//! synchronous and may block; session code decides which thread they run on.
//! Every blocking read takes a [`CancellationToken`] so that `stop()` on
//! another thread can unblock it promptly.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{ClockConfig, TaskSpec};

/// Opaque identifier of a driver-side task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Failures reported by a driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The call did not complete before its timeout.
    #[error("timed out with {received} sample(s) available")]
    Timeout {
        /// Samples available when the timeout fired
        received: usize,
    },

    /// The cancellation token fired while the call was blocked.
    #[error("cancelled")]
    Cancelled,

    /// Anything else the driver or device reports.
    #[error("{0}")]
    Fault(String),
}

/// Result type for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Synchronous interface to a DAQ driver.
///
/// Implementations must be callable from several threads. Calls that touch
/// the same task are serialized by the session layer; calls that touch
/// different tasks on one device may still overlap and must be safe.
pub trait DaqDriver: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &str;

    /// Create a task for `spec`. The task is idle until [`start_task`](Self::start_task).
    fn open_task(&self, spec: &TaskSpec) -> DriverResult<TaskHandle>;

    /// Program the sample clock of a buffered task.
    fn configure_clock(
        &self,
        task: TaskHandle,
        clock: &ClockConfig,
        samples_per_channel: usize,
    ) -> DriverResult<()>;

    /// Arm the task.
    fn start_task(&self, task: TaskHandle) -> DriverResult<()>;

    /// Disarm the task. Stopping an idle task succeeds.
    fn stop_task(&self, task: TaskHandle) -> DriverResult<()>;

    /// Block until `samples_per_channel` scans are available, the timeout
    /// elapses, or `cancel` fires.
    ///
    /// Samples are returned interleaved by scan
    /// (`[scan0_ch0, scan0_ch1, scan1_ch0, ...]`).
    fn read_samples(
        &self,
        task: TaskHandle,
        samples_per_channel: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DriverResult<Vec<f64>>;

    /// Write one value per channel to an output task.
    fn write_samples(&self, task: TaskHandle, values: &[f64], timeout: Duration)
        -> DriverResult<()>;

    /// Release the task. Closing an unknown task is a no-op.
    fn close_task(&self, task: TaskHandle) -> DriverResult<()>;
}
