//! # Polling Drivers
//!
//! A [`Driver`] runs one [`WorkUnit`] at a fixed check interval until told to
//! stop. The two units shipped here are [`TaskWorker`], which advances the
//! tasks of one execution endpoint, and [`ActivityWorker`], which processes
//! background activities.
//!
//! ## Control
//!
//! A [`DriverHandle`] is the control channel: `stop()` ends the loop once the
//! current unit of work completes, `wake()` cuts the current wait short and
//! `request_sleep_mode()` replaces the next wait with a longer one. The unit
//! itself sees the same handle through its [`DriverContext`].
//!
//! The stop flag is checked before each unit of work and the wait itself
//! listens for stop and wake notifications. A running unit is never
//! interrupted.
//!
//! ## Heartbeat
//!
//! When configured, the driver writes its PID to a heartbeat file on start
//! and removes it on exit. Deleting that file from outside stops the driver
//! at its next check.

pub mod activity_worker;
pub mod task_worker;

use crate::error::{Result, TaskerError};
use crate::logging::{log_driver_operation, log_error};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

pub use activity_worker::ActivityWorker;
pub use task_worker::TaskWorker;

/// One kind of periodic work
#[async_trait]
pub trait WorkUnit: Send {
    fn name(&self) -> &str;

    /// Run once before the first unit of work
    async fn setup(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }

    async fn do_regular_work(&mut self, ctx: &DriverContext) -> Result<()>;

    /// Run once after the loop ends
    async fn finish(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DriverState {
    running: AtomicBool,
    stop_requested: AtomicBool,
    wake_notify: Notify,
    shutdown_notify: Notify,
    sleep_request: Mutex<Option<Duration>>,
}

/// Cloneable control channel of a [`Driver`]
#[derive(Debug, Clone, Default)]
pub struct DriverHandle {
    state: Arc<DriverState>,
}

impl DriverHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graceful stop after the current unit of work
    pub fn stop(&self) {
        self.state.stop_requested.store(true, Ordering::Release);
        self.state.shutdown_notify.notify_one();
    }

    /// End the current wait early, including an extended sleep
    pub fn wake(&self) {
        self.state.wake_notify.notify_one();
    }

    /// Make the next wait last `duration` instead of the check interval
    pub fn request_sleep_mode(&self, duration: Duration) {
        *self.state.sleep_request.lock() = Some(duration);
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stop_requested.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    fn take_sleep_request(&self) -> Option<Duration> {
        self.state.sleep_request.lock().take()
    }
}

/// What a work unit can see of its driver
#[derive(Debug, Clone)]
pub struct DriverContext {
    handle: DriverHandle,
    name: String,
}

impl DriverContext {
    pub fn new(handle: DriverHandle, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopping(&self) -> bool {
        self.handle.is_stopping()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn request_sleep_mode(&self, duration: Duration) {
        self.handle.request_sleep_mode(duration);
    }
}

pub struct Driver<W: WorkUnit> {
    unit: W,
    handle: DriverHandle,
    check_interval: Duration,
    heartbeat_file: Option<PathBuf>,
    endpoint_id: Option<i64>,
}

impl<W: WorkUnit> std::fmt::Debug for Driver<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("unit", &self.unit.name())
            .field("check_interval", &self.check_interval)
            .field("heartbeat_file", &self.heartbeat_file)
            .finish()
    }
}

impl<W: WorkUnit> Driver<W> {
    pub fn new(unit: W, check_interval: Duration) -> Self {
        Self {
            unit,
            handle: DriverHandle::new(),
            check_interval,
            heartbeat_file: None,
            endpoint_id: None,
        }
    }

    pub fn with_heartbeat_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.heartbeat_file = Some(path.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint_id: i64) -> Self {
        self.endpoint_id = Some(endpoint_id);
        self
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle.clone()
    }

    /// Run until stopped; hands the unit back for inspection
    pub async fn run(mut self) -> Result<W> {
        let state = Arc::clone(&self.handle.state);
        if state.running.swap(true, Ordering::AcqRel) {
            return Err(TaskerError::InvalidState(format!(
                "Driver '{}' is already running",
                self.unit.name()
            )));
        }
        let name = self.unit.name().to_string();
        let ctx = DriverContext::new(self.handle.clone(), name.clone());

        if let Some(path) = &self.heartbeat_file {
            write_heartbeat(path).await?;
        }
        log_driver_operation("start", &name, self.endpoint_id, "running", None);

        if let Err(e) = self.unit.setup(&ctx).await {
            log_error(&name, "setup", &e.to_string(), None);
            self.shutdown(&ctx).await;
            return Err(e);
        }

        loop {
            if self.handle.is_stopping() {
                break;
            }
            if let Some(path) = &self.heartbeat_file {
                if !path.exists() {
                    info!(driver = %name, heartbeat = %path.display(), "Heartbeat file removed, stopping");
                    break;
                }
            }

            if let Err(e) = self.unit.do_regular_work(&ctx).await {
                log_error(&name, "do_regular_work", &e.to_string(), None);
            }
            if self.handle.is_stopping() {
                break;
            }

            let wait = self.handle.take_sleep_request().unwrap_or(self.check_interval);
            if wait > self.check_interval {
                debug!(driver = %name, seconds = wait.as_secs(), "Entering sleep mode");
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = state.wake_notify.notified() => {
                    debug!(driver = %name, "Woken up");
                }
                _ = state.shutdown_notify.notified() => {
                    debug!(driver = %name, "Shutdown notification received");
                    break;
                }
            }
        }

        self.shutdown(&ctx).await;
        Ok(self.unit)
    }

    async fn shutdown(&mut self, ctx: &DriverContext) {
        if let Err(e) = self.unit.finish(ctx).await {
            log_error(ctx.name(), "finish", &e.to_string(), None);
        }
        if let Some(path) = &self.heartbeat_file {
            if path.exists() {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    debug!(error = %e, "Could not remove heartbeat file");
                }
            }
        }
        self.handle.state.running.store(false, Ordering::Release);
        log_driver_operation("stop", ctx.name(), self.endpoint_id, "stopped", None);
    }
}

async fn write_heartbeat(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, format!("{}\n", std::process::id())).await?;
    Ok(())
}
