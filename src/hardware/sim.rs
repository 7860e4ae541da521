//! In-process DAQ simulator.
//!
//! [`SimulatedDaq`] implements [`DaqDriver`] with wall-clock timing so the
//! controllers behave as they would against a card: an edge-count read at
//! 1 kHz for 500 samples takes about half a second, an external clock that
//! is not wired never ticks, and a fault injected on a device surfaces on the
//! next call that touches it.
//!
//! ```
//! use qt3_daq::hardware::{EdgeSource, SimulatedDaq};
//!
//! let daq = SimulatedDaq::new().with_devices(["Dev1"]);
//! daq.set_edge_source("Dev1", "PFI0", EdgeSource::Constant { hz: 5_000.0 });
//! daq.connect_loopback("Dev1", "ai0", "ao0");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::driver::{DaqDriver, DriverError, DriverResult, TaskHandle};
use super::{ClockConfig, TaskKind, TaskSpec};

/// Longest a blocked read sleeps before re-checking cancel and timeout.
const POLL_SLICE: Duration = Duration::from_millis(2);

/// Span of the simulated analog output range (±10 V).
const OUTPUT_SPAN_VOLTS: f64 = 20.0;

/// Pulse train seen on a digital input terminal.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum EdgeSource {
    /// Perfectly regular pulses
    Constant {
        /// Edge rate in Hz
        hz: f64,
    },
    /// Pulses with random per-tick jitter around `mean_hz`
    Jittered {
        /// Mean edge rate in Hz
        mean_hz: f64,
    },
    /// No pulses
    #[default]
    Stalled,
}

type Terminal = (String, String);

fn terminal(device: &str, name: &str) -> Terminal {
    (device.to_string(), name.to_string())
}

struct SimTask {
    spec: TaskSpec,
    clock: Option<ClockConfig>,
    running: bool,
    started_at: Option<Instant>,
    scans_consumed: u64,
    count: u32,
    rng: StdRng,
}

#[derive(Default)]
struct SimState {
    tasks: HashMap<TaskHandle, SimTask>,
    edge_sources: HashMap<Terminal, EdgeSource>,
    external_clocks: HashMap<Terminal, f64>,
    levels: HashMap<Terminal, f64>,
    loopback: HashMap<Terminal, String>,
    faults: HashMap<String, String>,
    clock_programs: Vec<(String, ClockConfig)>,
}

impl SimState {
    fn take_fault(&mut self, device: &str) -> DriverResult<()> {
        match self.faults.remove(device) {
            Some(message) => Err(DriverError::Fault(message)),
            None => Ok(()),
        }
    }

    fn clock_hz(&self, device: &str, clock: &ClockConfig) -> f64 {
        match &clock.terminal {
            None => f64::from(clock.rate_hz),
            Some(term) => self
                .external_clocks
                .get(&terminal(device, term))
                .copied()
                .unwrap_or(0.0),
        }
    }

    fn analog_level(&self, device: &str, channel: &str, kind: &TaskKind) -> f64 {
        let source = match kind {
            TaskKind::AnalogInput => match self.loopback.get(&terminal(device, channel)) {
                Some(ao) => ao.as_str(),
                None => return 0.0,
            },
            _ => channel,
        };
        self.levels
            .get(&terminal(device, source))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Simulated multi-device DAQ driver.
pub struct SimulatedDaq {
    devices: Option<HashSet<String>>,
    resolution_bits: Option<u32>,
    seed: Option<u64>,
    next_handle: AtomicU64,
    state: Mutex<SimState>,
}

impl Default for SimulatedDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDaq {
    /// Simulator that accepts any device name.
    pub fn new() -> Self {
        Self {
            devices: None,
            resolution_bits: None,
            seed: None,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Restrict the simulator to the given devices; others fail to open.
    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    /// Quantize analog writes to a DAC of `bits` over ±10 V.
    pub fn with_resolution_bits(mut self, bits: u32) -> Self {
        self.resolution_bits = Some(bits);
        self
    }

    /// Seed the jitter generator for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Attach a pulse train to a digital input terminal.
    pub fn set_edge_source(&self, device: &str, signal_terminal: &str, source: EdgeSource) {
        self.state
            .lock()
            .edge_sources
            .insert(terminal(device, signal_terminal), source);
    }

    /// Drive an external clock terminal at `hz`.
    pub fn connect_external_clock(&self, device: &str, clock_terminal: &str, hz: f64) {
        self.state
            .lock()
            .external_clocks
            .insert(terminal(device, clock_terminal), hz);
    }

    /// Wire analog input `ai` to analog output `ao` on the same device.
    pub fn connect_loopback(&self, device: &str, ai: &str, ao: &str) {
        self.state
            .lock()
            .loopback
            .insert(terminal(device, ai), ao.to_string());
    }

    /// Make the next call touching `device` fail with `message`.
    pub fn inject_fault(&self, device: &str, message: impl Into<String>) {
        self.state
            .lock()
            .faults
            .insert(device.to_string(), message.into());
    }

    /// Number of tasks currently open.
    pub fn open_task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Clocks programmed on `device`, oldest first.
    pub fn clock_programs(&self, device: &str) -> Vec<ClockConfig> {
        self.state
            .lock()
            .clock_programs
            .iter()
            .filter(|(d, _)| d == device)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Last value written to an analog output terminal.
    pub fn output_level(&self, device: &str, ao: &str) -> Option<f64> {
        self.state.lock().levels.get(&terminal(device, ao)).copied()
    }

    fn quantize(&self, volts: f64) -> f64 {
        match self.resolution_bits {
            Some(bits) if bits > 0 && bits < 64 => {
                let step = OUTPUT_SPAN_VOLTS / ((1u64 << bits) - 1) as f64;
                (volts / step).round() * step
            }
            _ => volts,
        }
    }

    fn new_rng(&self, handle: TaskHandle) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(handle.0)),
            None => StdRng::from_entropy(),
        }
    }

    /// Try to satisfy an edge-count read. `Ok(Err(n))` means only `n` scans are ready.
    fn poll_edge_count(
        state: &mut SimState,
        task: TaskHandle,
        samples_per_channel: usize,
    ) -> DriverResult<std::result::Result<Vec<f64>, usize>> {
        let (device, signal, clock) = {
            let t = state
                .tasks
                .get(&task)
                .ok_or_else(|| DriverError::Fault(format!("unknown {}", task)))?;
            let signal = match &t.spec.kind {
                TaskKind::EdgeCount { signal_terminal } => signal_terminal.clone(),
                other => {
                    return Err(DriverError::Fault(format!(
                        "{} task has no edge counter",
                        other.label()
                    )))
                }
            };
            let clock = t
                .clock
                .clone()
                .ok_or_else(|| DriverError::Fault("no sample clock configured".into()))?;
            (t.spec.device.device_name.clone(), signal, clock)
        };
        let hz = state.clock_hz(&device, &clock);
        let source = state
            .edge_sources
            .get(&terminal(&device, &signal))
            .copied()
            .unwrap_or_default();

        let t = state
            .tasks
            .get_mut(&task)
            .ok_or_else(|| DriverError::Fault(format!("unknown {}", task)))?;
        let elapsed = t.started_at.map(|s| s.elapsed()).unwrap_or_default();
        let ticks = (elapsed.as_secs_f64() * hz).floor() as u64;
        let available = ticks.saturating_sub(t.scans_consumed) as usize;
        if available < samples_per_channel {
            return Ok(Err(available));
        }

        let n_channels = t.spec.channels.len();
        let mut out = Vec::with_capacity(samples_per_channel * n_channels);
        for _ in 0..samples_per_channel {
            t.scans_consumed += 1;
            let k = t.scans_consumed as f64;
            let increment = match source {
                EdgeSource::Constant { hz: edges } => {
                    ((k * edges / hz).floor() - ((k - 1.0) * edges / hz).floor()) as u32
                }
                EdgeSource::Jittered { mean_hz } => {
                    let x = mean_hz / hz * t.rng.gen_range(0.8..1.2);
                    let base = x.floor();
                    base as u32 + u32::from(t.rng.gen::<f64>() < x - base)
                }
                EdgeSource::Stalled => 0,
            };
            t.count = t.count.wrapping_add(increment);
            out.extend(std::iter::repeat(f64::from(t.count)).take(n_channels));
        }
        Ok(Ok(out))
    }
}

impl DaqDriver for SimulatedDaq {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open_task(&self, spec: &TaskSpec) -> DriverResult<TaskHandle> {
        if let Some(devices) = &self.devices {
            if !devices.contains(spec.device.name()) {
                return Err(DriverError::Fault(format!(
                    "device '{}' not found",
                    spec.device
                )));
            }
        }
        let handle = TaskHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let rng = self.new_rng(handle);
        let mut state = self.state.lock();
        state.take_fault(spec.device.name())?;
        state.tasks.insert(
            handle,
            SimTask {
                spec: spec.clone(),
                clock: None,
                running: false,
                started_at: None,
                scans_consumed: 0,
                count: 0,
                rng,
            },
        );
        debug!(%handle, device = %spec.device, kind = spec.kind.label(), "Simulated task opened");
        Ok(handle)
    }

    fn configure_clock(
        &self,
        task: TaskHandle,
        clock: &ClockConfig,
        _samples_per_channel: usize,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        let t = state
            .tasks
            .get_mut(&task)
            .ok_or_else(|| DriverError::Fault(format!("unknown {}", task)))?;
        if clock.is_internal() && clock.rate_hz == 0 {
            return Err(DriverError::Fault("internal clock rate must be positive".into()));
        }
        t.clock = Some(clock.clone());
        let device = t.spec.device.device_name.clone();
        state.clock_programs.push((device, clock.clone()));
        Ok(())
    }

    fn start_task(&self, task: TaskHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let device = state
            .tasks
            .get(&task)
            .map(|t| t.spec.device.device_name.clone())
            .ok_or_else(|| DriverError::Fault(format!("unknown {}", task)))?;
        state.take_fault(&device)?;
        if let Some(t) = state.tasks.get_mut(&task) {
            t.running = true;
            t.started_at = Some(Instant::now());
            t.scans_consumed = 0;
            t.count = 0;
        }
        debug!(%task, "Simulated task started");
        Ok(())
    }

    fn stop_task(&self, task: TaskHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let t = state
            .tasks
            .get_mut(&task)
            .ok_or_else(|| DriverError::Fault(format!("unknown {}", task)))?;
        t.running = false;
        debug!(%task, "Simulated task stopped");
        Ok(())
    }

    fn read_samples(
        &self,
        task: TaskHandle,
        samples_per_channel: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DriverResult<Vec<f64>> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            let available = {
                let mut state = self.state.lock();
                let (device, kind, running) = match state.tasks.get(&task) {
                    Some(t) => (t.spec.device.device_name.clone(), t.spec.kind.clone(), t.running),
                    None => return Err(DriverError::Fault(format!("unknown {}", task))),
                };
                state.take_fault(&device)?;
                if !running {
                    return Err(DriverError::Fault(format!("{} is not running", task)));
                }
                match kind {
                    TaskKind::EdgeCount { .. } => {
                        match Self::poll_edge_count(&mut state, task, samples_per_channel)? {
                            Ok(samples) => return Ok(samples),
                            Err(available) => available,
                        }
                    }
                    TaskKind::AnalogInput | TaskKind::AnalogOutput => {
                        let t = &state.tasks[&task];
                        let scan: Vec<f64> = t
                            .spec
                            .channels
                            .iter()
                            .map(|ch| state.analog_level(&device, ch, &kind))
                            .collect();
                        return Ok(scan
                            .iter()
                            .copied()
                            .cycle()
                            .take(scan.len() * samples_per_channel)
                            .collect());
                    }
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout {
                    received: available,
                });
            }
            trace!(%task, available, requested = samples_per_channel, "Waiting for samples");
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    fn write_samples(
        &self,
        task: TaskHandle,
        values: &[f64],
        _timeout: Duration,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (device, channels, kind, running) = match state.tasks.get(&task) {
            Some(t) => (
                t.spec.device.device_name.clone(),
                t.spec.channels.iter().map(str::to_string).collect::<Vec<_>>(),
                t.spec.kind.clone(),
                t.running,
            ),
            None => return Err(DriverError::Fault(format!("unknown {}", task))),
        };
        state.take_fault(&device)?;
        if kind != TaskKind::AnalogOutput {
            return Err(DriverError::Fault(format!(
                "{} task does not accept writes",
                kind.label()
            )));
        }
        if !running {
            return Err(DriverError::Fault(format!("{} is not running", task)));
        }
        if values.len() != channels.len() {
            return Err(DriverError::Fault(format!(
                "expected {} value(s), got {}",
                channels.len(),
                values.len()
            )));
        }
        for (ch, &v) in channels.iter().zip(values) {
            let level = self.quantize(v);
            state.levels.insert(terminal(&device, ch), level);
        }
        trace!(%task, ?values, "Simulated write");
        Ok(())
    }

    fn close_task(&self, task: TaskHandle) -> DriverResult<()> {
        if self.state.lock().tasks.remove(&task).is_some() {
            debug!(%task, "Simulated task closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ChannelSet, DeviceIdentity};

    fn edge_spec(device: &str) -> TaskSpec {
        let dev = DeviceIdentity::new(device).unwrap();
        TaskSpec {
            channels: ChannelSet::new(&dev, ["ctr0"]).unwrap(),
            device: dev,
            kind: TaskKind::EdgeCount {
                signal_terminal: "PFI0".into(),
            },
            clock: Some(ClockConfig::internal(1_000)),
            samples_per_channel: 10,
        }
    }

    fn ao_spec(channels: &[&str]) -> TaskSpec {
        let dev = DeviceIdentity::new("Dev1").unwrap();
        TaskSpec {
            channels: ChannelSet::new(&dev, channels.iter().copied()).unwrap(),
            device: dev,
            kind: TaskKind::AnalogOutput,
            clock: None,
            samples_per_channel: 1,
        }
    }

    #[test]
    fn test_constant_source_counts_exactly() {
        let daq = SimulatedDaq::new();
        daq.set_edge_source("Dev1", "PFI0", EdgeSource::Constant { hz: 5_000.0 });
        let task = daq.open_task(&edge_spec("Dev1")).unwrap();
        daq.configure_clock(task, &ClockConfig::internal(1_000), 10)
            .unwrap();
        daq.start_task(task).unwrap();

        let samples = daq
            .read_samples(task, 10, Duration::from_secs(2), &CancellationToken::new())
            .unwrap();
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[0], 5.0);
        assert_eq!(samples[9], 50.0);
    }

    #[test]
    fn test_unknown_device_fails_to_open() {
        let daq = SimulatedDaq::new().with_devices(["Dev1"]);
        assert!(daq.open_task(&edge_spec("Dev2")).is_err());
        assert!(daq.open_task(&edge_spec("Dev1")).is_ok());
    }

    #[test]
    fn test_unwired_external_clock_times_out() {
        let daq = SimulatedDaq::new();
        let task = daq.open_task(&edge_spec("Dev1")).unwrap();
        daq.configure_clock(task, &ClockConfig::external("PFI12", 1_000), 10)
            .unwrap();
        daq.start_task(task).unwrap();
        let err = daq
            .read_samples(task, 1, Duration::from_millis(20), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err, DriverError::Timeout { received: 0 });
    }

    #[test]
    fn test_cancelled_read_returns_promptly() {
        let daq = SimulatedDaq::new();
        let task = daq.open_task(&edge_spec("Dev1")).unwrap();
        daq.configure_clock(task, &ClockConfig::external("PFI12", 1_000), 10)
            .unwrap();
        daq.start_task(task).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = daq
            .read_samples(task, 1, Duration::from_secs(10), &token)
            .unwrap_err();
        assert_eq!(err, DriverError::Cancelled);
    }

    #[test]
    fn test_injected_fault_is_one_shot() {
        let daq = SimulatedDaq::new();
        let task = daq.open_task(&ao_spec(&["ao0"])).unwrap();
        daq.start_task(task).unwrap();
        daq.inject_fault("Dev1", "DAC overcurrent");
        let err = daq
            .write_samples(task, &[1.0], Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err, DriverError::Fault("DAC overcurrent".into()));
        assert!(daq.write_samples(task, &[1.0], Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_write_quantizes_and_loops_back() {
        let daq = SimulatedDaq::new().with_resolution_bits(16);
        daq.connect_loopback("Dev1", "ai0", "ao0");
        let ao = daq.open_task(&ao_spec(&["ao0"])).unwrap();
        daq.start_task(ao).unwrap();
        daq.write_samples(ao, &[1.234_567], Duration::from_secs(1))
            .unwrap();

        let level = daq.output_level("Dev1", "ao0").unwrap();
        assert!((level - 1.234_567).abs() < OUTPUT_SPAN_VOLTS / 65_535.0);

        let dev = DeviceIdentity::new("Dev1").unwrap();
        let ai = daq
            .open_task(&TaskSpec {
                channels: ChannelSet::new(&dev, ["ai0"]).unwrap(),
                device: dev,
                kind: TaskKind::AnalogInput,
                clock: None,
                samples_per_channel: 1,
            })
            .unwrap();
        daq.start_task(ai).unwrap();
        let read = daq
            .read_samples(ai, 1, Duration::from_secs(1), &CancellationToken::new())
            .unwrap();
        assert_eq!(read, vec![level]);
    }

    #[test]
    fn test_close_removes_task() {
        let daq = SimulatedDaq::new();
        let task = daq.open_task(&ao_spec(&["ao0", "ao1"])).unwrap();
        assert_eq!(daq.open_task_count(), 1);
        daq.close_task(task).unwrap();
        daq.close_task(task).unwrap();
        assert_eq!(daq.open_task_count(), 0);
    }
}
