//! Process-level service lifecycle.
//!
//! A [`Daemon`] runs one [`Service`] through
//! `before_start -> start delay -> run -> before_stop -> stop`, keeps a PID
//! file for the duration and turns SIGINT/SIGTERM into a cleared active flag.
//! The service polls that flag through the [`Supervisor`] trait.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::AgentResult;

/// Something a long-running service can ask whether it should keep going.
pub trait Supervisor: Send + Sync {
    /// `false` once the service should wind down.
    fn is_active(&self) -> bool;
}

/// Work driven by a [`Daemon`].
pub trait Service {
    /// Prepares the service; an error skips `run`.
    fn before_start(&mut self) -> AgentResult<()> {
        Ok(())
    }

    /// Runs until done, failed or `supervisor` turns inactive.
    fn run(&mut self, supervisor: &dyn Supervisor) -> AgentResult<()>;

    /// Called after `run`, whatever its outcome.
    fn before_stop(&mut self) {}
}

/// Exit status of the process, following `sysexits.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean shutdown.
    Ok,
    /// `EX_OSERR`: the service failed.
    OsError,
    /// `EX_CONFIG`: the configuration is unusable.
    Config,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::OsError => 71,
            ExitStatus::Config => 78,
        }
    }
}

/// Shared active flag, cheap to clone into signal handlers.
#[derive(Debug, Clone, Default)]
pub struct ActiveFlag(Arc<AtomicBool>);

impl ActiveFlag {
    /// Turns the flag on or off.
    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }
}

impl Supervisor for ActiveFlag {
    fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs one [`Service`] under a PID file and a signal-driven active flag.
pub struct Daemon {
    name: String,
    pid_file: PathBuf,
    start_timeout: Duration,
    active: ActiveFlag,
}

impl Daemon {
    /// A daemon writing `<pid_dir>/<name>.pid`.
    pub fn new(name: impl Into<String>, pid_dir: impl AsRef<Path>, start_timeout: Duration) -> Self {
        let name = name.into();
        let pid_file = pid_dir.as_ref().join(format!("{name}.pid"));
        Self {
            name,
            pid_file,
            start_timeout,
            active: ActiveFlag::default(),
        }
    }

    /// Path of the PID file.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// The flag services and signal handlers share.
    pub fn active_flag(&self) -> ActiveFlag {
        self.active.clone()
    }

    /// Clears the active flag on SIGINT/SIGTERM. Can only be installed once
    /// per process.
    pub fn install_signal_handler(&self) -> AgentResult<()> {
        let flag = self.active.clone();
        let name = self.name.clone();
        ctrlc::set_handler(move || {
            info!(service = %name, "Stop signal received");
            flag.set(false);
        })?;
        Ok(())
    }

    /// Asks the running service to stop.
    pub fn request_stop(&self) {
        self.active.set(false);
    }

    /// Runs `service` to completion and returns the process exit status.
    pub fn start<S: Service + ?Sized>(&self, service: &mut S) -> ExitStatus {
        info!(service = %self.name, "Start service");
        self.active.set(true);
        if let Err(e) = self.create_pid_file() {
            error!(service = %self.name, path = %self.pid_file.display(), error = %e, "Cannot write PID file");
            self.active.set(false);
            return ExitStatus::OsError;
        }

        let status = match self.run_service(service) {
            Ok(()) => ExitStatus::Ok,
            Err(e) => {
                error!(service = %self.name, error = %e, "Service exit status fail");
                ExitStatus::OsError
            }
        };
        self.stop(service);
        status
    }

    fn run_service<S: Service + ?Sized>(&self, service: &mut S) -> AgentResult<()> {
        service.before_start()?;
        self.wait_start_timeout();
        if !self.active.is_active() {
            return Ok(());
        }
        service.run(&self.active)
    }

    /// Sleeps the configured start delay, cut short by a stop request.
    fn wait_start_timeout(&self) {
        let deadline = Instant::now() + self.start_timeout;
        while self.active.is_active() && Instant::now() < deadline {
            let left = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(left.min(Duration::from_millis(100)));
        }
    }

    fn stop<S: Service + ?Sized>(&self, service: &mut S) {
        info!(service = %self.name, "Stop service");
        self.active.set(false);
        service.before_stop();
        self.remove_pid_file();
    }

    fn create_pid_file(&self) -> std::io::Result<()> {
        if let Some(dir) = self.pid_file.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.pid_file, std::process::id().to_string())
    }

    fn remove_pid_file(&self) {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.pid_file.display(), error = %e, "Cannot remove PID file"),
        }
    }
}

impl Supervisor for Daemon {
    fn is_active(&self) -> bool {
        self.active.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, DeviceFault, Notice};

    #[derive(Default)]
    struct RecordingService {
        pid_seen: bool,
        stopped: bool,
        fail: bool,
        pid_file: PathBuf,
    }

    impl Service for RecordingService {
        fn run(&mut self, _supervisor: &dyn Supervisor) -> AgentResult<()> {
            self.pid_seen = self.pid_file.exists();
            if self.fail {
                return Err(AgentError::from(Notice::new(
                    "test",
                    DeviceFault::ProcessData("boom".into()),
                )));
            }
            Ok(())
        }

        fn before_stop(&mut self) {
            self.stopped = true;
        }
    }

    #[test]
    fn graceful_run_exits_zero_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::new("current-meter", dir.path().join("run"), Duration::ZERO);
        let mut service = RecordingService {
            pid_file: daemon.pid_file().to_path_buf(),
            ..Default::default()
        };

        assert_eq!(daemon.start(&mut service), ExitStatus::Ok);
        assert!(service.pid_seen);
        assert!(service.stopped);
        assert!(!daemon.pid_file().exists());
        assert!(!daemon.is_active());
    }

    #[test]
    fn failing_service_exits_with_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::new("current-meter", dir.path(), Duration::ZERO);
        let mut service = RecordingService {
            fail: true,
            ..Default::default()
        };

        let status = daemon.start(&mut service);
        assert_eq!(status, ExitStatus::OsError);
        assert_eq!(status.code(), 71);
        assert!(service.stopped);
    }

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(ExitStatus::Ok.code(), 0);
        assert_eq!(ExitStatus::Config.code(), 78);
    }
}
