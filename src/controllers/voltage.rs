//! Analog voltage/position controller.
//!
//! Commands one or more axes through analog output channels and reads them
//! back through analog input channels (or, without read channels, from the
//! output task itself). Every axis has an [`AxisCalibration`]; calibration
//! keys may be a scalar applied to all axes or one value per write channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::Lifecycle;
use crate::config::ControllerSpec;
use crate::error::{DaqError, Result};
use crate::hardware::{
    ChannelSet, DeviceIdentity, HardwareSession, SessionManager, SessionState, TaskKind,
    TaskSpec,
};
use crate::units::{self, AxisCalibration, LengthUnit, OutOfRangePolicy};

const CONTROLLER: &str = "voltage controller";

/// Default blocking-call timeout.
pub const DEFAULT_READ_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Validated voltage controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageConfig {
    /// DAQ device
    pub device: DeviceIdentity,
    /// Analog outputs, one per axis
    pub write_channels: ChannelSet,
    /// Analog inputs paired with `write_channels`
    pub read_channels: Option<ChannelSet>,
    /// Per-axis calibration, same order as `write_channels`
    pub calibration: Vec<AxisCalibration>,
    /// Per-call timeout
    pub read_write_timeout: Duration,
    /// Handling of out-of-window position commands
    pub out_of_range: OutOfRangePolicy,
    /// Unit of positions and calibration values
    pub units: LengthUnit,
}

fn per_axis(key: &str, values: Vec<f64>, n_axes: usize) -> Result<Vec<f64>> {
    if values.len() != 1 && values.len() != n_axes {
        return Err(DaqError::conflict(format!(
            "'{}' has {} entries but there are {} write channel(s)",
            key,
            values.len(),
            n_axes
        )));
    }
    units::broadcast(&values, n_axes)
}

impl VoltageConfig {
    /// Validate the configuration map of `spec`.
    pub fn from_spec(spec: &ControllerSpec) -> Result<Self> {
        let r = spec.reader(CONTROLLER);
        let device = DeviceIdentity::new(r.string("daq_name")?)?;
        let write_channels = ChannelSet::new(&device, r.string_or_list("write_channels")?)?;
        let read_channels = r
            .optional_string_or_list("read_channels")?
            .map(|chs| ChannelSet::new(&device, chs))
            .transpose()?;
        if let Some(read) = &read_channels {
            if read.len() != write_channels.len() {
                return Err(DaqError::conflict(format!(
                    "{} read channel(s) for {} write channel(s)",
                    read.len(),
                    write_channels.len()
                )));
            }
        }

        let n = write_channels.len();
        let min = per_axis("min_position", r.number_or_list("min_position")?, n)?;
        let max = per_axis("max_position", r.number_or_list("max_position")?, n)?;
        let scale = per_axis("scale_nm_per_volt", r.number_or_list("scale_nm_per_volt")?, n)?;
        let calibration = min
            .iter()
            .zip(&max)
            .zip(&scale)
            .map(|((&lo, &hi), &s)| AxisCalibration::new(lo, hi, s))
            .collect::<Result<Vec<_>>>()?;

        let out_of_range = match r.optional_string("out_of_range")? {
            Some(policy) => policy.parse()?,
            None => OutOfRangePolicy::default(),
        };
        let units = match r.optional_string("units")? {
            Some(unit) => unit.parse()?,
            None => LengthUnit::default(),
        };

        Ok(Self {
            device,
            write_channels,
            read_channels,
            calibration,
            read_write_timeout: r.seconds_or("read_write_timeout", DEFAULT_READ_WRITE_TIMEOUT)?,
            out_of_range,
            units,
        })
    }

    fn task_spec(&self, kind: TaskKind, channels: &ChannelSet) -> TaskSpec {
        TaskSpec {
            device: self.device.clone(),
            kind,
            channels: channels.clone(),
            clock: None,
            samples_per_channel: 1,
        }
    }
}

#[derive(Default)]
struct Sessions {
    write: Option<Arc<HardwareSession>>,
    read: Option<Arc<HardwareSession>>,
}

/// Voltage/position controller.
pub struct VoltageController {
    config: VoltageConfig,
    sessions: Arc<SessionManager>,
    active: Mutex<Sessions>,
}

impl VoltageController {
    /// Namespace the default registry files this archetype under.
    pub const NAMESPACE: &'static str = "qt3utils.nidaq.customcontrollers";
    /// Type name the default registry files this archetype under.
    pub const TYPE_NAME: &'static str = "VControl";

    /// Build a stopped controller. Does not touch hardware.
    pub fn new(config: VoltageConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            config,
            sessions,
            active: Mutex::new(Sessions::default()),
        }
    }

    /// Validated configuration.
    pub fn config(&self) -> &VoltageConfig {
        &self.config
    }

    /// Number of axes.
    pub fn n_axes(&self) -> usize {
        self.config.calibration.len()
    }

    /// Per-axis calibration.
    pub fn calibration(&self) -> &[AxisCalibration] {
        &self.config.calibration
    }

    /// `(min, max)` of `axis`.
    pub fn position_limits(&self, axis: usize) -> Option<(f64, f64)> {
        self.config
            .calibration
            .get(axis)
            .map(|c| (c.min_position, c.max_position))
    }

    /// Lower position limit of the first axis.
    pub fn minimum_allowed_position(&self) -> f64 {
        self.config.calibration[0].min_position
    }

    /// Upper position limit of the first axis.
    pub fn maximum_allowed_position(&self) -> f64 {
        self.config.calibration[0].max_position
    }

    /// Fail unless `position` lies inside every axis' window, whatever the
    /// configured policy.
    pub fn check_allowed_position(&self, position: f64) -> Result<()> {
        for (axis, cal) in self.config.calibration.iter().enumerate() {
            cal.admit(axis, position, OutOfRangePolicy::Reject)?;
        }
        Ok(())
    }

    fn write_session(&self, operation: &'static str) -> Result<Arc<HardwareSession>> {
        self.active
            .lock()
            .write
            .as_ref()
            .map(Arc::clone)
            .ok_or(DaqError::InvalidState {
                operation,
                state: "closed",
            })
    }

    fn write_volts(&self, volts: &[f64]) -> Result<()> {
        let session = self.write_session("write")?;
        session.write(volts, self.config.read_write_timeout)?;
        debug!(device = %self.config.device, ?volts, "Voltages written");
        Ok(())
    }

    /// Move to `positions` (one per axis, or one for all axes).
    ///
    /// Always writes to hardware, even if the position is unchanged.
    pub fn move_to(&self, positions: &[f64]) -> Result<()> {
        let volts =
            units::positions_to_volts(&self.config.calibration, positions, self.config.out_of_range)?;
        self.write_volts(&volts)
    }

    /// [`move_to`](Self::move_to) with positions given in `unit`.
    pub fn move_to_in(&self, positions: &[f64], unit: LengthUnit) -> Result<()> {
        let converted: Vec<f64> = positions
            .iter()
            .map(|&p| unit.convert(p, self.config.units))
            .collect();
        self.move_to(&converted)
    }

    /// Command raw voltages (one per axis, or one for all axes).
    ///
    /// Voltages that map outside the calibrated window follow the configured
    /// out-of-range policy.
    pub fn go_to_voltage(&self, volts: &[f64]) -> Result<()> {
        let volts = units::broadcast(volts, self.n_axes())?;
        let positions = units::volts_to_positions(&self.config.calibration, &volts)?;
        self.move_to(&positions)
    }

    /// Current voltages, one per axis.
    ///
    /// Reads the analog inputs when configured, otherwise the levels last
    /// written to the outputs.
    pub fn current_voltages(&self) -> Result<Vec<f64>> {
        let session = {
            let active = self.active.lock();
            active.read.as_ref().or(active.write.as_ref()).map(Arc::clone)
        }
        .ok_or(DaqError::InvalidState {
            operation: "read",
            state: "closed",
        })?;
        let volts = session.read(1, self.config.read_write_timeout)?;
        if volts.len() != self.n_axes() {
            return Err(DaqError::hardware(
                self.config.device.name(),
                format!("expected {} reading(s), got {}", self.n_axes(), volts.len()),
            ));
        }
        Ok(volts)
    }

    /// Current positions, one per axis.
    pub fn read_position(&self) -> Result<Vec<f64>> {
        units::volts_to_positions(&self.config.calibration, &self.current_voltages()?)
    }

    /// [`read_position`](Self::read_position) expressed in `unit`.
    pub fn read_position_in(&self, unit: LengthUnit) -> Result<Vec<f64>> {
        Ok(self
            .read_position()?
            .into_iter()
            .map(|p| self.config.units.convert(p, unit))
            .collect())
    }
}

impl Lifecycle for VoltageController {
    fn start(&self) -> Result<()> {
        let mut active = self.active.lock();
        if active.write.is_some() {
            let held: Vec<_> = active.write.iter().chain(active.read.iter()).collect();
            if held.iter().all(|s| s.is_running()) {
                return Err(DaqError::InvalidState {
                    operation: "start",
                    state: SessionState::Running.as_str(),
                });
            }
            // Re-arm sessions left stopped by a hardware fault
            for session in held.into_iter().filter(|s| !s.is_running()) {
                session.start()?;
            }
            info!(device = %self.config.device, "Voltage controller restarted");
            return Ok(());
        }
        let write = self.sessions.open(
            self.config
                .task_spec(TaskKind::AnalogOutput, &self.config.write_channels),
        )?;
        let read = match &self.config.read_channels {
            Some(chs) => Some(
                self.sessions
                    .open(self.config.task_spec(TaskKind::AnalogInput, chs))?,
            ),
            None => None,
        };
        // Unstarted sessions close on drop if either start fails
        write.start()?;
        if let Some(read) = &read {
            read.start()?;
        }
        active.write = Some(write);
        active.read = read;
        info!(
            device = %self.config.device,
            axes = self.n_axes(),
            readback = self.config.read_channels.is_some(),
            "Voltage controller started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let Sessions { write, read } = std::mem::take(&mut *self.active.lock());
        let mut result = Ok(());
        for session in write.iter().chain(read.iter()) {
            if let Err(e) = session.stop() {
                result = Err(e);
            }
            session.close();
        }
        if write.is_some() {
            info!(device = %self.config.device, "Voltage controller stopped");
        }
        result
    }

    fn close(&self) {
        if let Err(e) = self.stop() {
            warn!(device = %self.config.device, error = %e, "Error while closing voltage controller");
        }
    }

    fn is_running(&self) -> bool {
        let active = self.active.lock();
        active.write.as_ref().map_or(false, |s| s.is_running())
            && active.read.as_ref().map_or(true, |s| s.is_running())
    }

    fn device(&self) -> &DeviceIdentity {
        &self.config.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::Lifecycle;
    use crate::hardware::SimulatedDaq;

    fn spec() -> ControllerSpec {
        ControllerSpec::new(VoltageController::NAMESPACE, VoltageController::TYPE_NAME)
            .with("daq_name", "Dev1")
            .with("write_channels", vec!["ao0", "ao1"])
            .with("min_position", 0.0)
            .with("max_position", vec![80.0, 40.0])
            .with("scale_nm_per_volt", 8.0)
    }

    fn controller(spec: &ControllerSpec) -> (Arc<SimulatedDaq>, VoltageController) {
        let daq = Arc::new(SimulatedDaq::new());
        let config = VoltageConfig::from_spec(spec).unwrap();
        let controller = VoltageController::new(config, Arc::new(SessionManager::new(daq.clone())));
        (daq, controller)
    }

    #[test]
    fn test_config_broadcasts_scalars() {
        let config = VoltageConfig::from_spec(&spec()).unwrap();
        assert_eq!(config.calibration.len(), 2);
        assert_eq!(config.calibration[1].max_position, 40.0);
        assert_eq!(config.calibration[1].scale_per_volt, 8.0);
        assert_eq!(config.out_of_range, OutOfRangePolicy::Reject);
    }

    #[test]
    fn test_config_length_conflicts() {
        let three = spec().with("min_position", vec![0.0, 0.0, 0.0]);
        assert!(matches!(
            VoltageConfig::from_spec(&three),
            Err(DaqError::ConfigurationConflict { .. })
        ));
        let reads = spec().with("read_channels", "ai0");
        assert!(matches!(
            VoltageConfig::from_spec(&reads),
            Err(DaqError::ConfigurationConflict { .. })
        ));
        let inverted = spec().with("min_position", 100.0);
        assert!(matches!(
            VoltageConfig::from_spec(&inverted),
            Err(DaqError::ConfigurationConflict { .. })
        ));
    }

    #[test]
    fn test_move_and_read_back_without_inputs() {
        let (daq, controller) = controller(&spec());
        controller.start().unwrap();
        controller.move_to(&[40.0, 20.0]).unwrap();
        assert_eq!(daq.output_level("Dev1", "ao0"), Some(5.0));
        assert_eq!(daq.output_level("Dev1", "ao1"), Some(2.5));

        let positions = controller.read_position().unwrap();
        assert!((positions[0] - 40.0).abs() < 1e-9);
        assert!((positions[1] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_reject_and_clamp_policies() {
        let (_daq, controller) = controller(&spec());
        controller.start().unwrap();
        assert!(matches!(
            controller.move_to(&[10.0, 50.0]),
            Err(DaqError::PositionOutOfRange { axis: 1, .. })
        ));
        assert!(matches!(
            controller.move_to(&[1.0, 2.0, 3.0]),
            Err(DaqError::ChannelCountMismatch { .. })
        ));

        let (daq, clamped) = self::controller(&spec().with("out_of_range", "clamp"));
        clamped.start().unwrap();
        clamped.move_to(&[10.0, 50.0]).unwrap();
        assert_eq!(daq.output_level("Dev1", "ao1"), Some(5.0));
    }

    #[test]
    fn test_requires_start() {
        let (_daq, controller) = controller(&spec());
        assert!(matches!(
            controller.move_to(&[1.0]),
            Err(DaqError::InvalidState { .. })
        ));
        controller.start().unwrap();
        assert!(controller.start().is_err());
        controller.stop().unwrap();
        assert!(!controller.is_running());
    }

    #[test]
    fn test_units_conversion() {
        let (_daq, controller) = controller(&spec().with("units", "microns"));
        controller.start().unwrap();
        controller
            .move_to_in(&[12_000.0], LengthUnit::Nanometers)
            .unwrap();
        let microns = controller.read_position().unwrap();
        assert!((microns[0] - 12.0).abs() < 1e-9);
        let nm = controller.read_position_in(LengthUnit::Nanometers).unwrap();
        assert!((nm[1] - 12_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_allowed_position_and_voltage_commands() {
        let (daq, controller) = controller(&spec());
        assert_eq!(controller.minimum_allowed_position(), 0.0);
        assert_eq!(controller.maximum_allowed_position(), 80.0);
        assert!(controller.check_allowed_position(30.0).is_ok());
        // Inside axis 0 but outside axis 1
        assert!(controller.check_allowed_position(60.0).is_err());

        controller.start().unwrap();
        controller.go_to_voltage(&[1.5]).unwrap();
        assert_eq!(controller.current_voltages().unwrap(), vec![1.5, 1.5]);
        assert_eq!(daq.output_level("Dev1", "ao1"), Some(1.5));
        assert!(controller.go_to_voltage(&[6.0]).is_err());
    }
}
