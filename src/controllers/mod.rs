//! The two controller archetypes and their shared lifecycle contract.
//!
//! Controllers are built by the [`ControllerRegistry`](crate::registry::ControllerRegistry)
//! in a not-yet-started state. Hardware is only touched from
//! [`Lifecycle::start`] onward.

pub mod counter;
pub mod voltage;

use std::sync::Arc;

use crate::error::Result;
use crate::hardware::DeviceIdentity;

pub use counter::{CountBatch, EdgeCounter, EdgeCounterConfig, RateSample, RateStream, RawCounts};
pub use voltage::{VoltageConfig, VoltageController};

/// Start/stop contract shared by every controller.
pub trait Lifecycle: Send + Sync {
    /// Acquire hardware sessions and arm them.
    fn start(&self) -> Result<()>;

    /// Disarm and release hardware sessions. Unblocks pending reads.
    fn stop(&self) -> Result<()>;

    /// Release everything; errors are logged, not returned.
    fn close(&self);

    /// Whether the controller is armed.
    fn is_running(&self) -> bool;

    /// Device the controller operates on.
    fn device(&self) -> &DeviceIdentity;
}

/// A resolved controller.
#[derive(Clone)]
pub enum ControllerInstance {
    /// Clocked digital edge counter
    EdgeCounter(Arc<EdgeCounter>),
    /// Analog voltage/position controller
    Voltage(Arc<VoltageController>),
}

impl std::fmt::Debug for ControllerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EdgeCounter(c) => f.debug_tuple("EdgeCounter").field(c.config()).finish(),
            Self::Voltage(v) => f.debug_tuple("Voltage").field(v.config()).finish(),
        }
    }
}

impl ControllerInstance {
    /// Archetype label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EdgeCounter(_) => "edge_counter",
            Self::Voltage(_) => "voltage",
        }
    }

    /// The edge counter, if this is one.
    pub fn as_edge_counter(&self) -> Option<&Arc<EdgeCounter>> {
        match self {
            Self::EdgeCounter(c) => Some(c),
            Self::Voltage(_) => None,
        }
    }

    /// The voltage controller, if this is one.
    pub fn as_voltage(&self) -> Option<&Arc<VoltageController>> {
        match self {
            Self::Voltage(v) => Some(v),
            Self::EdgeCounter(_) => None,
        }
    }

    /// Lifecycle view of either archetype.
    pub fn lifecycle(&self) -> &dyn Lifecycle {
        match self {
            Self::EdgeCounter(c) => c.as_ref(),
            Self::Voltage(v) => v.as_ref(),
        }
    }
}
