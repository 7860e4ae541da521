//! Clocked digital edge counter.
//!
//! Counts rising edges on `signal_terminal` with the hardware counter
//! `signal_counter`, sampled once per tick of either the device's internal
//! clock at `clock_rate` or an external clock on `clock_terminal`. The
//! hardware reports cumulative counts; [`EdgeCounter::read_batch`] turns them
//! into per-sample counts, tolerating 32-bit counter wrap.
//!
//! The count rate of a batch of `n` samples is
//!
//! ```text
//! rate = sum(counts) / (n / clock_rate)
//! ```
//!
//! With an external clock `clock_rate` is only the nominal divisor.
//!
//! `read_batch` blocks. Use [`EdgeCounter::spawn_stream`] (or
//! `tokio::task::spawn_blocking`) to keep it off threads that must stay
//! responsive; [`Lifecycle::stop`] from any thread unblocks it with
//! [`DaqError::Cancelled`].

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::Lifecycle;
use crate::config::ControllerSpec;
use crate::error::{DaqError, Result};
use crate::hardware::{
    ChannelSet, ClockConfig, DeviceIdentity, HardwareSession, SessionManager, SessionState,
    TaskKind, TaskSpec,
};

const CONTROLLER: &str = "edge counter";

/// Default blocking-call timeout.
pub const DEFAULT_READ_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Validated edge counter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeCounterConfig {
    /// DAQ device
    pub device: DeviceIdentity,
    /// Digital input carrying the pulses, e.g. `PFI0`
    pub signal_terminal: String,
    /// Counter resource, e.g. `ctr2`
    pub signal_counter: String,
    /// Sample clock
    pub clock: ClockConfig,
    /// Samples per batch
    pub num_data_samples_per_batch: usize,
    /// Per-call timeout for blocking reads
    pub read_write_timeout: Duration,
}

impl EdgeCounterConfig {
    /// Validate the configuration map of `spec`.
    pub fn from_spec(spec: &ControllerSpec) -> Result<Self> {
        let r = spec.reader(CONTROLLER);
        let device = DeviceIdentity::new(r.string("daq_name")?)?;
        let signal_terminal = r.string("signal_terminal")?;
        let signal_counter = r.string("signal_counter")?;
        // Qualified names must belong to our device
        let counter = ChannelSet::new(&device, [&signal_counter])?;
        let signal_counter = counter.iter().next().unwrap_or_default().to_string();

        let clock_rate = u32::try_from(r.positive_integer("clock_rate")?)
            .map_err(|_| DaqError::invalid_value("clock_rate", "exceeds 32 bits"))?;
        let clock = match r.optional_string("clock_terminal")? {
            Some(terminal) => ClockConfig::external(terminal, clock_rate),
            None => ClockConfig::internal(clock_rate),
        };
        let num_data_samples_per_batch = r.positive_integer("num_data_samples_per_batch")? as usize;
        let read_write_timeout = r.seconds_or("read_write_timeout", DEFAULT_READ_WRITE_TIMEOUT)?;

        Ok(Self {
            device,
            signal_terminal,
            signal_counter,
            clock,
            num_data_samples_per_batch,
            read_write_timeout,
        })
    }

    fn task_spec(&self, samples_per_batch: usize) -> Result<TaskSpec> {
        Ok(TaskSpec {
            device: self.device.clone(),
            kind: TaskKind::EdgeCount {
                signal_terminal: self.signal_terminal.clone(),
            },
            channels: ChannelSet::new(&self.device, [&self.signal_counter])?,
            clock: Some(self.clock.clone()),
            samples_per_channel: samples_per_batch,
        })
    }
}

/// Per-sample counts from one blocking read.
#[derive(Debug, Clone, PartialEq)]
pub struct CountBatch {
    /// Edges counted in each clock period
    pub counts: Vec<u32>,
    /// Nominal clock rate used for rate math
    pub clock_rate_hz: u32,
    /// Batch number since the last start
    pub sequence: u64,
}

impl CountBatch {
    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }

    /// Number of clock samples.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the batch has no samples.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Counts per second over the batch.
    pub fn rate(&self) -> f64 {
        if self.counts.is_empty() {
            return 0.0;
        }
        self.total() as f64 / (self.counts.len() as f64 / f64::from(self.clock_rate_hz))
    }

    /// Total counts and clock samples.
    pub fn raw(&self) -> RawCounts {
        RawCounts {
            counts: self.total(),
            clock_samples: self.counts.len() as u64,
        }
    }
}

/// Total counts over some number of clock samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawCounts {
    /// Edges counted
    pub counts: u64,
    /// Clock samples they were counted over
    pub clock_samples: u64,
}

/// One element of a [`RateStream`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateSample {
    /// Counts per second
    pub rate: f64,
    /// Edges in the batch
    pub total_counts: u64,
    /// Batch number since the last start
    pub sequence: u64,
    /// When the batch completed
    pub timestamp: Instant,
}

impl From<&CountBatch> for RateSample {
    fn from(batch: &CountBatch) -> Self {
        Self {
            rate: batch.rate(),
            total_counts: batch.total(),
            sequence: batch.sequence,
            timestamp: Instant::now(),
        }
    }
}

/// Edge counter controller.
pub struct EdgeCounter {
    config: EdgeCounterConfig,
    batch_size: AtomicUsize,
    sessions: Arc<SessionManager>,
    session: Mutex<Option<Arc<HardwareSession>>>,
    last_count: Mutex<u32>,
    sequence: AtomicU64,
}

impl EdgeCounter {
    /// Namespace the default registry files this archetype under.
    pub const NAMESPACE: &'static str = "qt3utils.datagenerators";
    /// Type name the default registry files this archetype under.
    pub const TYPE_NAME: &'static str = "NiDaqDigitalInputRateCounter";

    /// Build a stopped controller. Does not touch hardware.
    pub fn new(config: EdgeCounterConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            batch_size: AtomicUsize::new(config.num_data_samples_per_batch),
            config,
            sessions,
            session: Mutex::new(None),
            last_count: Mutex::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    /// Validated configuration.
    pub fn config(&self) -> &EdgeCounterConfig {
        &self.config
    }

    /// Current batch size.
    pub fn num_data_samples_per_batch(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Change the batch size. Only allowed while not running; takes effect on
    /// the next `start()`.
    pub fn set_num_data_samples_per_batch(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(DaqError::invalid_value(
                "num_data_samples_per_batch",
                "must be positive",
            ));
        }
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            if session.is_running() {
                return Err(DaqError::InvalidState {
                    operation: "resize batch",
                    state: SessionState::Running.as_str(),
                });
            }
            // The buffer is sized at open time
            session.close();
            *slot = None;
        }
        self.batch_size.store(n, Ordering::Relaxed);
        Ok(())
    }

    /// Nominal clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.config.clock.rate_hz
    }

    fn current_session(&self, operation: &'static str) -> Result<Arc<HardwareSession>> {
        self.session
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(DaqError::InvalidState {
                operation,
                state: SessionState::Closed.as_str(),
            })
    }

    fn reset_counts(&self) {
        *self.last_count.lock() = 0;
        self.sequence.store(0, Ordering::Relaxed);
    }

    /// Block until one batch of samples arrives.
    ///
    /// Timeouts leave the counter running. A hardware fault leaves it
    /// stopped until the next `start()`.
    pub fn read_batch(&self) -> Result<CountBatch> {
        let session = self.current_session("read")?;
        let n = self.num_data_samples_per_batch();
        let samples = session.read(n, self.config.read_write_timeout)?;

        let counts = per_sample_counts(&mut self.last_count.lock(), &samples);

        let batch = CountBatch {
            counts,
            clock_rate_hz: self.clock_rate(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        debug!(
            device = %self.config.device,
            sequence = batch.sequence,
            total = batch.total(),
            rate = batch.rate(),
            "Edge count batch"
        );
        Ok(batch)
    }

    /// Iterator over batches while the counter runs.
    ///
    /// Ends when the counter is stopped or a pending read is cancelled.
    /// Timeouts and faults are yielded as errors; after a fault the counter
    /// is stopped, so the iterator ends on the following call.
    pub fn batches(&self) -> Batches<'_> {
        Batches { counter: self }
    }

    /// Read `num_batches` batches and return their totals.
    pub fn sample_counts(&self, num_batches: usize) -> Result<Vec<RawCounts>> {
        (0..num_batches)
            .map(|_| self.read_batch().map(|b| b.raw()))
            .collect()
    }

    /// Mean count rate over `data`, or `None` if it holds no clock samples.
    pub fn sample_count_rate(&self, data: &[RawCounts]) -> Option<f64> {
        let counts: u64 = data.iter().map(|d| d.counts).sum();
        let samples: u64 = data.iter().map(|d| d.clock_samples).sum();
        if samples == 0 {
            return None;
        }
        Some(f64::from(self.clock_rate()) * counts as f64 / samples as f64)
    }

    /// Run the read loop on a worker thread and stream rates.
    ///
    /// The stream ends when the counter stops. Timeouts are delivered as
    /// errors and the loop continues; a hardware fault is delivered and ends
    /// the loop. Dropping the stream stops the worker after its current read.
    pub fn spawn_stream(self: &Arc<Self>, capacity: usize) -> Result<RateStream> {
        if !self.is_running() {
            return Err(DaqError::InvalidState {
                operation: "stream",
                state: self
                    .session
                    .lock()
                    .as_ref()
                    .map_or(SessionState::Closed, |s| s.state())
                    .as_str(),
            });
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counter = Arc::clone(self);
        let worker = thread::Builder::new()
            .name(format!("edge-counter-{}", self.config.device))
            .spawn(move || counter.stream_loop(tx))
            .map_err(|e| DaqError::hardware(self.config.device.name(), e.to_string()))?;

        Ok(RateStream {
            inner: ReceiverStream::new(rx),
            worker: Some(worker),
        })
    }

    fn stream_loop(&self, tx: mpsc::Sender<Result<RateSample>>) {
        info!(device = %self.config.device, "Edge counter stream started");
        loop {
            let item = match self.read_batch() {
                Ok(batch) => Ok(RateSample::from(&batch)),
                Err(e) if e.is_timeout() => {
                    warn!(device = %self.config.device, error = %e, "Edge counter read timed out");
                    Err(e)
                }
                Err(DaqError::Cancelled) | Err(DaqError::InvalidState { .. }) => break,
                Err(e) => {
                    if tx.blocking_send(Err(e)).is_err() {
                        debug!("Rate stream receiver dropped");
                    }
                    break;
                }
            };
            if tx.blocking_send(item).is_err() {
                debug!("Rate stream receiver dropped");
                break;
            }
        }
        info!(device = %self.config.device, "Edge counter stream ended");
    }
}

/// Differences of cumulative counter readings, modulo 2^32.
fn per_sample_counts(last: &mut u32, cumulative: &[f64]) -> Vec<u32> {
    cumulative
        .iter()
        .map(|&reading| {
            let reading = reading as u32;
            let diff = reading.wrapping_sub(*last);
            *last = reading;
            diff
        })
        .collect()
}

impl Lifecycle for EdgeCounter {
    fn start(&self) -> Result<()> {
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            match session.state() {
                SessionState::Running => {
                    return Err(DaqError::InvalidState {
                        operation: "start",
                        state: SessionState::Running.as_str(),
                    })
                }
                SessionState::Configured | SessionState::Stopped => {
                    session.start()?;
                    self.reset_counts();
                    info!(device = %self.config.device, "Edge counter restarted");
                    return Ok(());
                }
                SessionState::Closed => {}
            }
        }

        let spec = self.config.task_spec(self.num_data_samples_per_batch())?;
        let session = self.sessions.open(spec)?;
        if let Err(e) = session.start() {
            session.close();
            return Err(e);
        }
        self.reset_counts();
        *slot = Some(session);
        info!(
            device = %self.config.device,
            signal = %self.config.signal_terminal,
            clock_rate = self.config.clock.rate_hz,
            external_clock = ?self.config.clock.terminal,
            "Edge counter started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let result = session.stop();
            session.close();
            result?;
            info!(device = %self.config.device, "Edge counter stopped");
        }
        Ok(())
    }

    fn close(&self) {
        if let Err(e) = self.stop() {
            warn!(device = %self.config.device, error = %e, "Error while closing edge counter");
        }
    }

    fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |s| s.is_running())
    }

    fn device(&self) -> &DeviceIdentity {
        &self.config.device
    }
}

impl Drop for EdgeCounter {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.close();
        }
    }
}

/// Iterator returned by [`EdgeCounter::batches`].
pub struct Batches<'a> {
    counter: &'a EdgeCounter,
}

impl Iterator for Batches<'_> {
    type Item = Result<CountBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.counter.is_running() {
            return None;
        }
        match self.counter.read_batch() {
            Ok(batch) => Some(Ok(batch)),
            Err(DaqError::Cancelled) | Err(DaqError::InvalidState { .. }) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Stream of [`RateSample`]s fed by a worker thread.
pub struct RateStream {
    inner: ReceiverStream<Result<RateSample>>,
    worker: Option<JoinHandle<()>>,
}

impl RateStream {
    /// Receive the next sample, `None` once the worker has finished.
    pub async fn recv(&mut self) -> Option<Result<RateSample>> {
        self.inner.next().await
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Stream for RateStream {
    type Item = Result<RateSample>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for RateStream {
    fn drop(&mut self) {
        // Closing the receiver makes the worker exit at its next send
        self.inner.close();
        self.worker.take();
    }
}
