//! Controller registry: maps `(namespace, type_name)` to a factory.
//!
//! Resolution is an explicit table lookup followed by configuration
//! validation. Building a controller never touches hardware, and a spec that
//! fails validation never yields a partially built controller.
//!
//! ```text
//! ControllerSpec ──► ControllerRegistry ──► factory fn ──► ControllerInstance
//!                         │                                   (not started)
//!                         └─ UnknownControllerType
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use qt3_daq::config::ControllerSpec;
//! use qt3_daq::hardware::{SessionManager, SimulatedDaq};
//! use qt3_daq::registry::ControllerRegistry;
//!
//! let sessions = Arc::new(SessionManager::new(Arc::new(SimulatedDaq::new())));
//! let registry = ControllerRegistry::with_defaults();
//! let spec = ControllerSpec::new("qt3utils.nidaq.customcontrollers", "VControl")
//!     .with("daq_name", "Dev1")
//!     .with("write_channels", "ao0")
//!     .with("min_position", -10.0)
//!     .with("max_position", 10.0)
//!     .with("scale_nm_per_volt", 1.0);
//! let controller = registry.resolve(&spec, &sessions).unwrap();
//! assert_eq!(controller.kind(), "voltage");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ControllerSpec, LabConfig};
use crate::controllers::{
    ControllerInstance, EdgeCounter, EdgeCounterConfig, VoltageConfig, VoltageController,
};
use crate::error::{DaqError, Result};
use crate::hardware::SessionManager;

/// Builds a controller from a validated spec.
pub type ControllerFactory = fn(&ControllerSpec, &Arc<SessionManager>) -> Result<ControllerInstance>;

fn build_edge_counter(
    spec: &ControllerSpec,
    sessions: &Arc<SessionManager>,
) -> Result<ControllerInstance> {
    let config = EdgeCounterConfig::from_spec(spec)?;
    Ok(ControllerInstance::EdgeCounter(Arc::new(EdgeCounter::new(
        config,
        Arc::clone(sessions),
    ))))
}

fn build_voltage(
    spec: &ControllerSpec,
    sessions: &Arc<SessionManager>,
) -> Result<ControllerInstance> {
    let config = VoltageConfig::from_spec(spec)?;
    Ok(ControllerInstance::Voltage(Arc::new(VoltageController::new(
        config,
        Arc::clone(sessions),
    ))))
}

/// Table of known controller archetypes.
#[derive(Default)]
pub struct ControllerRegistry {
    factories: HashMap<(String, String), ControllerFactory>,
}

impl ControllerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the edge counter and voltage controller archetypes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            (EdgeCounter::NAMESPACE.into(), EdgeCounter::TYPE_NAME.into()),
            build_edge_counter,
        );
        registry.factories.insert(
            (
                VoltageController::NAMESPACE.into(),
                VoltageController::TYPE_NAME.into(),
            ),
            build_voltage,
        );
        registry
    }

    /// Register `factory` under `namespace.type_name`.
    ///
    /// Registering the same pair twice is a configuration conflict.
    pub fn register(
        &mut self,
        namespace: &str,
        type_name: &str,
        factory: ControllerFactory,
    ) -> Result<()> {
        let key = (namespace.to_string(), type_name.to_string());
        if self.factories.contains_key(&key) {
            return Err(DaqError::conflict(format!(
                "controller type '{}.{}' is already registered",
                namespace, type_name
            )));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Registered `(namespace, type_name)` pairs, sorted.
    pub fn registered_types(&self) -> Vec<(String, String)> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build the controller described by `spec`.
    pub fn resolve(
        &self,
        spec: &ControllerSpec,
        sessions: &Arc<SessionManager>,
    ) -> Result<ControllerInstance> {
        let factory = self
            .factories
            .get(&(spec.namespace.clone(), spec.type_name.clone()))
            .ok_or_else(|| DaqError::UnknownControllerType {
                namespace: spec.namespace.clone(),
                type_name: spec.type_name.clone(),
            })?;
        let instance = factory(spec, sessions)?;
        debug!(
            namespace = %spec.namespace,
            type_name = %spec.type_name,
            kind = instance.kind(),
            "Controller resolved"
        );
        Ok(instance)
    }

    /// Build every controller of a lab configuration.
    ///
    /// Stops at the first failure, which carries the controller name.
    pub fn resolve_all(
        &self,
        config: &LabConfig,
        sessions: &Arc<SessionManager>,
    ) -> Result<BTreeMap<String, ControllerInstance>> {
        let mut out = BTreeMap::new();
        for (name, spec) in &config.controllers {
            let instance = self
                .resolve(spec, sessions)
                .map_err(|e| DaqError::in_controller(name, e))?;
            out.insert(name.clone(), instance);
        }
        info!(count = out.len(), "Controllers resolved");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedDaq;

    fn sessions() -> (Arc<SimulatedDaq>, Arc<SessionManager>) {
        let daq = Arc::new(SimulatedDaq::new());
        (daq.clone(), Arc::new(SessionManager::new(daq)))
    }

    fn counter_spec() -> ControllerSpec {
        ControllerSpec::new(EdgeCounter::NAMESPACE, EdgeCounter::TYPE_NAME)
            .with("daq_name", "Dev1")
            .with("signal_terminal", "PFI0")
            .with("signal_counter", "ctr2")
            .with("clock_rate", 100_000.0)
            .with("num_data_samples_per_batch", 1_000.0)
    }

    #[test]
    fn test_default_types() {
        let registry = ControllerRegistry::with_defaults();
        assert_eq!(
            registry.registered_types(),
            vec![
                (
                    "qt3utils.datagenerators".to_string(),
                    "NiDaqDigitalInputRateCounter".to_string()
                ),
                (
                    "qt3utils.nidaq.customcontrollers".to_string(),
                    "VControl".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_unknown_type() {
        let (_daq, sessions) = sessions();
        let spec = ControllerSpec::new("qt3utils.datagenerators", "Spectrometer");
        let err = ControllerRegistry::with_defaults()
            .resolve(&spec, &sessions)
            .unwrap_err();
        assert!(matches!(err, DaqError::UnknownControllerType { .. }));
    }

    #[test]
    fn test_resolve_touches_no_hardware() {
        let (daq, sessions) = sessions();
        let registry = ControllerRegistry::with_defaults();
        let a = registry.resolve(&counter_spec(), &sessions).unwrap();
        let b = registry.resolve(&counter_spec(), &sessions).unwrap();
        assert_eq!(
            a.as_edge_counter().unwrap().config(),
            b.as_edge_counter().unwrap().config()
        );
        assert_eq!(daq.open_task_count(), 0);
        assert_eq!(sessions.active_sessions(), 0);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = ControllerRegistry::with_defaults();
        let err = registry
            .register(EdgeCounter::NAMESPACE, EdgeCounter::TYPE_NAME, build_voltage)
            .unwrap_err();
        assert!(matches!(err, DaqError::ConfigurationConflict { .. }));
        registry
            .register("lab.custom", "Piezo", build_voltage)
            .unwrap();
        assert_eq!(registry.registered_types().len(), 3);
    }

    #[test]
    fn test_resolve_all_names_failing_controller() {
        let (_daq, sessions) = sessions();
        let mut config = LabConfig::default();
        config.controllers.insert("counter".into(), counter_spec());
        config.controllers.insert(
            "piezo".into(),
            ControllerSpec::new(VoltageController::NAMESPACE, VoltageController::TYPE_NAME)
                .with("daq_name", "Dev1"),
        );
        let err = ControllerRegistry::with_defaults()
            .resolve_all(&config, &sessions)
            .unwrap_err();
        assert!(matches!(err, DaqError::InController { ref name, .. } if name == "piezo"));

        config.controllers.remove("piezo");
        let resolved = ControllerRegistry::with_defaults()
            .resolve_all(&config, &sessions)
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }
}
