//! Counter-and-scanner: sweep a voltage controller while sampling counts.
//!
//! Each call to [`CounterAndScanner::scan_v`] performs one line: move to the
//! start of the range, wait for the actuator to settle, then step from `vmin`
//! towards `vmax` sampling the edge counter at every position. Raw counts and
//! count rates are accumulated per line until [`CounterAndScanner::reset`].
//!
//! A scan runs until `tmax` lines are complete or someone calls
//! [`ScanHandle::stop`], typically from another thread:
//!
//! ```no_run
//! # use qt3_daq::scanner::CounterAndScanner;
//! # fn run(mut scanner: CounterAndScanner) -> qt3_daq::Result<()> {
//! let handle = scanner.handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     handle.stop();
//! });
//!
//! scanner.start()?;
//! scanner.set_to_starting_position()?;
//! while scanner.still_scanning() {
//!     scanner.scan_v()?;
//! }
//! scanner.stop()?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::controllers::{EdgeCounter, Lifecycle, RawCounts, VoltageController};
use crate::error::{DaqError, Result};

/// Settle time before each line.
pub const DEFAULT_RASTER_LINE_PAUSE: Duration = Duration::from_millis(150);
/// Default number of lines per scan.
pub const DEFAULT_TMAX: u32 = 100;
/// Default step between positions.
pub const DEFAULT_STEP_SIZE: f64 = 0.5;

/// Shared stop flag for a running scan.
#[derive(Debug, Clone, Default)]
pub struct ScanHandle {
    running: Arc<AtomicBool>,
}

impl ScanHandle {
    /// Ask the scan to stop after the current position.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the scan is still requested to run.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }
}

/// Raw counts sampled at each position of one line.
pub type LineCounts = Vec<Vec<RawCounts>>;

/// Sweeps a [`VoltageController`] and samples an [`EdgeCounter`].
pub struct CounterAndScanner {
    counter: Arc<EdgeCounter>,
    controller: Arc<VoltageController>,
    handle: ScanHandle,
    current_t: u32,
    current_v: f64,
    vmin: f64,
    vmax: f64,
    tmax: u32,
    step_size: f64,
    raster_line_pause: Duration,
    num_daq_batches: usize,
    scanned_raw_counts: Vec<LineCounts>,
    scanned_count_rate: Vec<Vec<Option<f64>>>,
}

impl CounterAndScanner {
    /// Scanner over the full allowed range of `controller`'s first axis.
    pub fn new(counter: Arc<EdgeCounter>, controller: Arc<VoltageController>) -> Self {
        let vmin = controller.minimum_allowed_position();
        let vmax = controller.maximum_allowed_position();
        Self {
            counter,
            controller,
            handle: ScanHandle::default(),
            current_t: 0,
            current_v: vmin,
            vmin,
            vmax,
            tmax: DEFAULT_TMAX,
            step_size: DEFAULT_STEP_SIZE,
            raster_line_pause: DEFAULT_RASTER_LINE_PAUSE,
            num_daq_batches: 1,
            scanned_raw_counts: Vec::new(),
            scanned_count_rate: Vec::new(),
        }
    }

    /// Stop flag that can be moved to another thread.
    pub fn handle(&self) -> ScanHandle {
        self.handle.clone()
    }

    /// Mark the scan as running and start the counter.
    pub fn start(&mut self) -> Result<()> {
        self.handle.set_running();
        self.counter.start()
    }

    /// Stop the counter and end the scan.
    pub fn stop(&mut self) -> Result<()> {
        self.handle.stop();
        self.counter.stop()
    }

    /// Release the counter.
    pub fn close(&mut self) {
        self.counter.close();
    }

    /// Move to the start of the scan range.
    pub fn set_to_starting_position(&mut self) -> Result<()> {
        self.current_v = self.vmin;
        self.controller.move_to(&[self.vmin])
    }

    /// Change the counter batch size.
    pub fn set_num_data_samples_per_batch(&mut self, n: usize) -> Result<()> {
        self.counter.set_num_data_samples_per_batch(n)
    }

    /// Number of counter batches sampled per position.
    pub fn num_daq_batches(&self) -> usize {
        self.num_daq_batches
    }

    /// Set the number of counter batches sampled per position.
    pub fn set_num_daq_batches(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(DaqError::invalid_value("num_daq_batches", "must be positive"));
        }
        self.num_daq_batches = n;
        Ok(())
    }

    /// Sample the counter at the current position.
    pub fn sample_counts(&self) -> Result<Vec<RawCounts>> {
        self.counter.sample_counts(self.num_daq_batches)
    }

    /// Mean rate over `data`.
    pub fn sample_count_rate(&self, data: &[RawCounts]) -> Option<f64> {
        self.counter.sample_count_rate(data)
    }

    /// Restrict the scan to `[vmin, vmax]`, which must be allowed positions.
    pub fn set_scan_range(&mut self, vmin: f64, vmax: f64) -> Result<()> {
        self.controller.check_allowed_position(vmin)?;
        self.controller.check_allowed_position(vmax)?;
        if vmin >= vmax {
            return Err(DaqError::conflict(format!(
                "scan start {} must be below scan end {}",
                vmin, vmax
            )));
        }
        self.vmin = vmin;
        self.vmax = vmax;
        Ok(())
    }

    /// `(vmin, vmax)`.
    pub fn scan_range(&self) -> (f64, f64) {
        (self.vmin, self.vmax)
    }

    /// `(vmin, vmax, current_v)`.
    pub fn completed_scan_range(&self) -> (f64, f64, f64) {
        (self.vmin, self.vmax, self.current_v)
    }

    /// Lines completed since the last reset.
    pub fn current_t(&self) -> u32 {
        self.current_t
    }

    /// Set the number of lines per scan.
    pub fn set_tmax(&mut self, tmax: u32) {
        self.tmax = tmax;
    }

    /// Set the settle time before each line.
    pub fn set_raster_line_pause(&mut self, pause: Duration) {
        self.raster_line_pause = pause;
    }

    /// Whether another line should be scanned.
    ///
    /// Returns false once stopped externally, or after `tmax` lines, in
    /// which case the scan is also marked stopped.
    pub fn still_scanning(&mut self) -> bool {
        if !self.handle.is_running() {
            return false;
        }
        if self.current_t < self.tmax {
            true
        } else {
            self.handle.stop();
            false
        }
    }

    /// Advance one step. Positions past `vmax` are not commanded.
    pub fn move_v(&mut self) -> Result<()> {
        self.current_v += self.step_size;
        if self.current_v > self.vmax {
            return Ok(());
        }
        match self.controller.move_to(&[self.current_v]) {
            Err(e @ DaqError::PositionOutOfRange { .. }) => {
                info!(error = %e, "Scan step out of range");
                Ok(())
            }
            other => other,
        }
    }

    /// Move to `position` if it lies inside the scan range.
    pub fn go_to_v(&mut self, position: f64) -> Result<()> {
        if position < self.vmin || position > self.vmax {
            debug!(position, vmin = self.vmin, vmax = self.vmax, "Ignoring move outside scan range");
            return Ok(());
        }
        self.controller.move_to(&[position])?;
        self.current_v = position;
        Ok(())
    }

    /// Scan one line and record its counts and rates.
    pub fn scan_v(&mut self) -> Result<()> {
        let raw = self.scan_axis(self.vmin, self.vmax, self.step_size)?;
        let rates = raw.iter().map(|r| self.sample_count_rate(r)).collect();
        self.scanned_raw_counts.push(raw);
        self.scanned_count_rate.push(rates);
        self.current_t += 1;
        Ok(())
    }

    /// Step from `min` towards `max` (exclusive) and sample at each position.
    ///
    /// Stops early, returning what was collected, if the scan is stopped.
    pub fn scan_axis(&mut self, min: f64, max: f64, step_size: f64) -> Result<LineCounts> {
        if !step_size.is_finite() || step_size <= 0.0 {
            return Err(DaqError::invalid_value("step_size", "must be positive"));
        }
        self.controller.move_to(&[min])?;
        thread::sleep(self.raster_line_pause);

        let steps = ((max - min) / step_size).ceil().max(0.0) as usize;
        let mut raw_counts = Vec::with_capacity(steps);
        for i in 0..steps {
            if !self.handle.is_running() {
                debug!(completed = i, "Line interrupted");
                break;
            }
            let position = min + i as f64 * step_size;
            self.controller.move_to(&[position])?;
            self.current_v = position;
            let counts = self.sample_counts()?;
            debug!(position, ?counts, "Sampled position");
            raw_counts.push(counts);
        }
        Ok(raw_counts)
    }

    /// Discard accumulated lines.
    pub fn reset(&mut self) {
        self.scanned_raw_counts.clear();
        self.scanned_count_rate.clear();
        self.current_t = 0;
    }

    /// Raw counts per line and position.
    pub fn scanned_raw_counts(&self) -> &[LineCounts] {
        &self.scanned_raw_counts
    }

    /// Count rates per line and position.
    pub fn scanned_count_rate(&self) -> &[Vec<Option<f64>>] {
        &self.scanned_count_rate
    }

    /// Step between positions.
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Set the step between positions.
    pub fn set_step_size(&mut self, step_size: f64) -> Result<()> {
        if !step_size.is_finite() || step_size <= 0.0 {
            return Err(DaqError::invalid_value(
                "step_size",
                format!("{} is not a positive step", step_size),
            ));
        }
        self.step_size = step_size;
        Ok(())
    }
}
