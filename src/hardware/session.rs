//! Hardware session lifecycle.
//!
//! A [`HardwareSession`] owns one driver task and the channels it was opened
//! on. [`SessionManager`] hands sessions out and enforces that a channel on a
//! device belongs to at most one live session at a time.
//!
//! ```text
//!            open()                start()
//! Closed ──────────► Configured ──────────► Running
//!   ▲                                        │  ▲
//!   │ close()                        stop()  │  │ start()
//!   │                                        ▼  │
//!   └──────────────────────────────────── Stopped
//! ```
//!
//! A hardware fault during I/O forces the session into `Stopped`. `close()`
//! is idempotent and also runs on drop.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{DaqDriver, DriverError, TaskHandle};
use super::TaskSpec;
use crate::error::{DaqError, Result};

/// Lifecycle state of a [`HardwareSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Released; no driver task
    Closed,
    /// Task created and clocked but not armed
    Configured,
    /// Armed; reads and writes allowed
    Running,
    /// Disarmed after `stop()` or a hardware fault
    Stopped,
}

impl SessionState {
    /// Lowercase name for messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ClaimTable = Mutex<HashMap<String, HashSet<String>>>;

/// Channels reserved on one device, released on drop.
struct ClaimGuard {
    claims: Arc<ClaimTable>,
    device: String,
    channels: Vec<String>,
}

impl ClaimGuard {
    fn acquire(claims: &Arc<ClaimTable>, spec: &TaskSpec) -> Result<Self> {
        let mut table = claims.lock();
        let taken = table.entry(spec.device.device_name.clone()).or_default();
        if let Some(busy) = spec.channels.iter().find(|ch| taken.contains(*ch)) {
            return Err(DaqError::SessionAlreadyActive {
                device: spec.device.device_name.clone(),
                channel: busy.to_string(),
            });
        }
        let channels: Vec<String> = spec.channels.iter().map(str::to_string).collect();
        taken.extend(channels.iter().cloned());
        Ok(Self {
            claims: Arc::clone(claims),
            device: spec.device.device_name.clone(),
            channels,
        })
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut table = self.claims.lock();
        if let Some(taken) = table.get_mut(&self.device) {
            for ch in &self.channels {
                taken.remove(ch);
            }
            if taken.is_empty() {
                table.remove(&self.device);
            }
        }
    }
}

struct SessionInner {
    state: SessionState,
    task: Option<TaskHandle>,
    cancel: CancellationToken,
    claim: Option<ClaimGuard>,
}

/// Exclusive, lifecycle-tracked binding to one driver task.
pub struct HardwareSession {
    id: u64,
    spec: TaskSpec,
    driver: Arc<dyn DaqDriver>,
    device_lock: Arc<Mutex<()>>,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for HardwareSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareSession")
            .field("id", &self.id)
            .field("device", &self.spec.device.device_name)
            .field("kind", &self.spec.kind.label())
            .field("state", &self.state())
            .finish()
    }
}

impl HardwareSession {
    /// Session id, unique per manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Task specification the session was opened with.
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Whether the session is armed.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    fn device(&self) -> &str {
        self.spec.device.name()
    }

    /// Arm the task. Allowed from `Configured` or `Stopped`.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = match (inner.state, inner.task) {
            (SessionState::Configured | SessionState::Stopped, Some(task)) => task,
            (state, _) => {
                return Err(DaqError::InvalidState {
                    operation: "start",
                    state: state.as_str(),
                })
            }
        };
        inner.cancel = CancellationToken::new();
        let result = {
            let _device = self.device_lock.lock();
            self.driver.start_task(task)
        };
        match result {
            Ok(()) => {
                inner.state = SessionState::Running;
                debug!(session = self.id, device = self.device(), "Session started");
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Stopped;
                warn!(session = self.id, device = self.device(), error = %e, "Session failed to start");
                Err(DaqError::hardware(self.device(), e.to_string()))
            }
        }
    }

    /// Disarm the task and unblock any pending read. No-op unless running.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Running {
            return Ok(());
        }
        inner.cancel.cancel();
        inner.state = SessionState::Stopped;
        let task = inner.task;
        drop(inner);

        if let Some(task) = task {
            let _device = self.device_lock.lock();
            self.driver
                .stop_task(task)
                .map_err(|e| DaqError::hardware(self.device(), e.to_string()))?;
        }
        debug!(session = self.id, device = self.device(), "Session stopped");
        Ok(())
    }

    /// Release the task and the channel claims. Safe to call repeatedly.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return;
        }
        inner.cancel.cancel();
        let was_running = inner.state == SessionState::Running;
        inner.state = SessionState::Closed;
        let task = inner.task.take();
        let claim = inner.claim.take();
        drop(inner);

        if let Some(task) = task {
            let _device = self.device_lock.lock();
            if was_running {
                if let Err(e) = self.driver.stop_task(task) {
                    warn!(session = self.id, error = %e, "Failed to stop task during close");
                }
            }
            if let Err(e) = self.driver.close_task(task) {
                warn!(session = self.id, error = %e, "Failed to close task");
            }
        }
        drop(claim);
        debug!(session = self.id, device = self.device(), "Session closed");
    }

    fn running_task(&self, operation: &'static str) -> Result<(TaskHandle, CancellationToken)> {
        let inner = self.inner.lock();
        match (inner.state, inner.task) {
            (SessionState::Running, Some(task)) => Ok((task, inner.cancel.clone())),
            (state, _) => Err(DaqError::InvalidState {
                operation,
                state: state.as_str(),
            }),
        }
    }

    fn map_driver_error(
        &self,
        err: DriverError,
        cancel: &CancellationToken,
        timeout: Duration,
        requested: usize,
    ) -> DaqError {
        if cancel.is_cancelled() {
            return DaqError::Cancelled;
        }
        match err {
            DriverError::Cancelled => DaqError::Cancelled,
            DriverError::Timeout { received } => DaqError::ReadTimeout {
                timeout,
                requested,
                received,
            },
            DriverError::Fault(message) => {
                let mut inner = self.inner.lock();
                if inner.state == SessionState::Running {
                    inner.state = SessionState::Stopped;
                }
                drop(inner);
                warn!(
                    session = self.id,
                    device = self.device(),
                    error = %message,
                    "Hardware fault, session stopped"
                );
                DaqError::hardware(self.device(), message)
            }
        }
    }

    /// Blocking read of `samples_per_channel` scans, interleaved by scan.
    ///
    /// Returns [`DaqError::Cancelled`] promptly if [`stop`](Self::stop) or
    /// [`close`](Self::close) is called on another thread.
    pub fn read(&self, samples_per_channel: usize, timeout: Duration) -> Result<Vec<f64>> {
        let (task, cancel) = self.running_task("read")?;
        self.driver
            .read_samples(task, samples_per_channel, timeout, &cancel)
            .map_err(|e| self.map_driver_error(e, &cancel, timeout, samples_per_channel))
    }

    /// Write one value per channel.
    pub fn write(&self, values: &[f64], timeout: Duration) -> Result<()> {
        if values.len() != self.spec.channels.len() {
            return Err(DaqError::ChannelCountMismatch {
                expected: self.spec.channels.len(),
                actual: values.len(),
            });
        }
        let (task, cancel) = self.running_task("write")?;
        let result = {
            let _device = self.device_lock.lock();
            self.driver.write_samples(task, values, timeout)
        };
        result.map_err(|e| self.map_driver_error(e, &cancel, timeout, values.len()))
    }
}

impl Drop for HardwareSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens sessions against one driver and tracks channel ownership.
pub struct SessionManager {
    driver: Arc<dyn DaqDriver>,
    claims: Arc<ClaimTable>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    sessions: Mutex<Vec<std::sync::Weak<HardwareSession>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("driver", &self.driver.name())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

impl SessionManager {
    /// Create a manager for `driver`.
    pub fn new(driver: Arc<dyn DaqDriver>) -> Self {
        Self {
            driver,
            claims: Arc::new(Mutex::new(HashMap::new())),
            device_locks: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Underlying driver.
    pub fn driver(&self) -> &Arc<dyn DaqDriver> {
        &self.driver
    }

    fn device_lock(&self, device: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.device_locks
                .lock()
                .entry(device.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Claim the channels of `spec`, create the driver task and program its
    /// clock. The returned session is `Configured`.
    ///
    /// Fails with [`DaqError::SessionAlreadyActive`] if any channel is owned
    /// by another live session on the same device.
    pub fn open(&self, spec: TaskSpec) -> Result<Arc<HardwareSession>> {
        let claim = ClaimGuard::acquire(&self.claims, &spec)?;
        let device_lock = self.device_lock(spec.device.name());

        let task = {
            let _device = device_lock.lock();
            let task = self
                .driver
                .open_task(&spec)
                .map_err(|e| DaqError::hardware(spec.device.name(), e.to_string()))?;
            if let Some(clock) = &spec.clock {
                if let Err(e) = self
                    .driver
                    .configure_clock(task, clock, spec.samples_per_channel)
                {
                    if let Err(close_err) = self.driver.close_task(task) {
                        warn!(error = %close_err, "Failed to close task after clock error");
                    }
                    return Err(DaqError::hardware(spec.device.name(), e.to_string()));
                }
            }
            task
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            session = id,
            device = %spec.device,
            kind = spec.kind.label(),
            channels = ?spec.channels.qualified(&spec.device),
            "Session opened"
        );
        let session = Arc::new(HardwareSession {
            id,
            spec,
            driver: Arc::clone(&self.driver),
            device_lock,
            inner: Mutex::new(SessionInner {
                state: SessionState::Configured,
                task: Some(task),
                cancel: CancellationToken::new(),
                claim: Some(claim),
            }),
        });

        let mut sessions = self.sessions.lock();
        sessions.retain(|w| w.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        Ok(session)
    }

    /// Close `session`, releasing its channels.
    pub fn close(&self, session: &HardwareSession) {
        session.close();
    }

    /// Number of sessions that are not closed.
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter_map(std::sync::Weak::upgrade)
            .filter(|s| s.state() != SessionState::Closed)
            .count()
    }

    /// Whether a live session owns `device/channel`.
    pub fn is_claimed(&self, device: &str, channel: &str) -> bool {
        self.claims
            .lock()
            .get(device)
            .map_or(false, |taken| taken.contains(channel))
    }
}
