//! Uniform poll-loop scheduler for pipeline workers.
//!
//! Every worker runs on its own OS thread. A worker is a plain value
//! implementing [`Worker`]; the scheduler calls `before_start`, then `tick`
//! repeatedly while the worker is active, then `after_stop`.
//!
//! # Cancellation
//!
//! Stopping is flag-setting only: [`WorkerHandle::stop`] clears the active
//! flag and returns immediately. Ticks never block longer than the queue
//! timeout they were configured with, so the loop observes the flag within
//! one tick. Device-bound workers additionally carry a gate flag (the device
//! "open" state) and exit as soon as the device is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{DeviceFault, Notice};
use crate::queue::{Offer, Queue};

/// Outcome of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Work was done; run again without sleeping.
    Busy,
    /// Nothing to do; sleep the inter-tick interval.
    Idle,
    /// The worker is finished.
    Stop,
}

/// A unit of the pipeline driven by the scheduler.
pub trait Worker: Send + 'static {
    /// Thread and log name.
    fn name(&self) -> &'static str;

    /// Runs once on the worker thread before the first tick.
    fn before_start(&mut self, _ctx: &WorkerContext) {}

    /// One unit of work.
    fn tick(&mut self, ctx: &WorkerContext) -> Tick;

    /// Runs once after the last tick.
    fn after_stop(&mut self) {}
}

/// Shared state a worker sees while running.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    name: &'static str,
    active: Arc<AtomicBool>,
    gate: Option<Arc<AtomicBool>>,
    notice: Queue<Notice>,
}

impl WorkerContext {
    /// An active context reporting faults on `notice`.
    pub fn new(name: &'static str, notice: Queue<Notice>) -> Self {
        Self {
            name,
            active: Arc::new(AtomicBool::new(true)),
            gate: None,
            notice,
        }
    }

    /// Ties the worker's lifetime to an external flag (e.g. device open).
    pub fn with_gate(mut self, gate: Arc<AtomicBool>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Worker name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `false` once stopped or the gate closes.
    pub fn is_active(&self) -> bool {
        let gate_open = self
            .gate
            .as_ref()
            .map_or(true, |gate| gate.load(Ordering::SeqCst));
        self.active.load(Ordering::SeqCst) && gate_open
    }

    /// Asks the loop to stop after this tick.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Reports a fatal fault on the notice queue and asks the loop to stop.
    pub fn fail(&self, fault: DeviceFault) -> Tick {
        warn!(worker = self.name, fault = %fault, "Worker raised a fatal fault");
        if let Offer::Closed(notice) = self.notice.offer(Notice::new(self.name, fault)) {
            warn!(worker = self.name, notice = %notice, "Notice queue closed, fault dropped");
        }
        self.stop();
        Tick::Stop
    }
}

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Worker name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Requests the worker to stop. Idempotent and non-blocking.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!(worker = self.name, "Stop worker");
        }
    }

    /// `true` once the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits up to `timeout` for the thread to exit. Returns `true` if joined.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = self.name, "Worker did not stop within {:?}", timeout);
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = self.name, "Worker thread panicked");
            }
        }
        true
    }
}

/// Spawns `worker` on a named thread driven by the poll loop.
pub fn spawn<W: Worker>(
    mut worker: W,
    ctx: WorkerContext,
    interval: Duration,
) -> std::io::Result<WorkerHandle> {
    let name = worker.name();
    let active = Arc::clone(&ctx.active);
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(worker = name, "Worker starting");
            worker.before_start(&ctx);
            while ctx.is_active() {
                match worker.tick(&ctx) {
                    Tick::Busy => {}
                    Tick::Idle => std::thread::sleep(interval),
                    Tick::Stop => break,
                }
            }
            ctx.stop();
            worker.after_stop();
            debug!(worker = name, "Worker stopped");
        })?;

    Ok(WorkerHandle {
        name,
        active,
        thread: Some(thread),
    })
}
