//! # qt3_daq
//!
//! Configuration-driven controllers for NI-style DAQ cards: a clocked digital
//! edge counter and an analog voltage/position controller, plus the session
//! layer that keeps their hardware tasks from colliding.
//!
//! ## Crate Structure
//!
//! - **`config`**: `ControllerSpec` and the figment-loaded `LabConfig`.
//! - **`registry`**: resolves a `ControllerSpec` to a not-yet-started controller.
//! - **`controllers`**: the `EdgeCounter` and `VoltageController` archetypes and
//!   their shared `Lifecycle` trait.
//! - **`scanner`**: sweeps a voltage controller while sampling a counter.
//! - **`hardware`**: the `DaqDriver` boundary, `SimulatedDaq`, and the
//!   `SessionManager` that owns driver tasks and channel claims.
//! - **`units`**: position/voltage calibration.
//! - **`error`**: `DaqError` and its `ErrorKind` classification.
//! - **`logging`**: tracing-subscriber setup.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use qt3_daq::config::LabConfig;
//! use qt3_daq::controllers::Lifecycle;
//! use qt3_daq::hardware::{EdgeSource, SessionManager, SimulatedDaq};
//! use qt3_daq::registry::ControllerRegistry;
//!
//! # fn main() -> qt3_daq::Result<()> {
//! let config = LabConfig::from_yaml_str(r#"
//! controllers:
//!   counter:
//!     namespace: qt3utils.datagenerators
//!     type_name: NiDaqDigitalInputRateCounter
//!     configuration:
//!       daq_name: Dev1
//!       signal_terminal: PFI0
//!       signal_counter: ctr2
//!       clock_rate: 100000
//!       num_data_samples_per_batch: 1000
//! "#)?;
//!
//! let daq = Arc::new(SimulatedDaq::new());
//! daq.set_edge_source("Dev1", "PFI0", EdgeSource::Constant { hz: 5_000.0 });
//! let sessions = Arc::new(SessionManager::new(daq));
//!
//! let controllers = ControllerRegistry::with_defaults().resolve_all(&config, &sessions)?;
//! let counter = controllers["counter"].as_edge_counter().unwrap();
//! counter.start()?;
//! let batch = counter.read_batch()?;
//! assert!((batch.rate() - 5_000.0).abs() < 1e-6);
//! counter.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controllers;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod registry;
pub mod scanner;
pub mod units;

pub use config::{ControllerSpec, LabConfig};
pub use controllers::{ControllerInstance, EdgeCounter, Lifecycle, VoltageController};
pub use error::{DaqError, ErrorKind, Result};
pub use registry::ControllerRegistry;
