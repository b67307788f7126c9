//! knxd subprocess control
//!
//! Spawning, stopping, PID file handling, the process health layer and USB
//! interface presence/reset all sit behind [`ProcessControl`] so the manager
//! can be tested against a fake.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::args::build_args;
use super::health::{CheckResult, HealthFailure};
use super::state::HealthLayer;
use crate::config::KnxdConfig;
use crate::error::{KnxSrvError, Result};

pub const DEFAULT_PID_FILE: &str = "/var/run/knxsrv-knxd.pid";
pub const FALLBACK_PID_FILE: &str = "/tmp/knxsrv-knxd.pid";

const USB_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const USB_RESET_TIMEOUT: Duration = Duration::from_secs(10);
const USB_RESET_SETTLE: Duration = Duration::from_millis(500);

/// Consecutive `D` samples before the process counts as hung
const D_STATE_LIMIT: u32 = 3;

#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Start the daemon; returns its pid
    async fn spawn(&self) -> Result<u32>;

    /// Graceful stop, escalating to a kill after the configured timeout
    async fn stop(&self) -> Result<()>;

    fn pid(&self) -> Option<u32>;

    /// Layer 0: interface present and process in a runnable state
    async fn check_process(&self) -> CheckResult;

    /// Whether [`ProcessControl::reset_interface`] does anything
    fn can_reset_interface(&self) -> bool;

    async fn reset_interface(&self) -> Result<()>;
}

/// Outcome of a `/proc/<pid>/stat` sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    /// Uninterruptible sleep; tolerated for a few samples
    DiskSleep,
    Stopped,
    Zombie,
    Dead,
}

/// Parse the state field from `/proc/<pid>/stat` contents
///
/// The command name may contain spaces and parentheses, so the state is taken
/// from the first field after the last `)`.
pub fn parse_proc_state(stat: &str) -> Option<ProcState> {
    let idx = stat.rfind(')')?;
    let state = stat.get(idx + 1..)?.split_whitespace().next()?;
    Some(match state {
        "T" | "t" => ProcState::Stopped,
        "Z" => ProcState::Zombie,
        "X" | "x" => ProcState::Dead,
        "D" => ProcState::DiskSleep,
        _ => ProcState::Running,
    })
}

pub struct KnxdProcess {
    config: KnxdConfig,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    d_state_count: AtomicU32,
    pid_file: parking_lot::Mutex<Option<PathBuf>>,
}

impl KnxdProcess {
    pub fn new(config: KnxdConfig) -> Result<Self> {
        let args = build_args(&config)?;
        Ok(Self {
            config,
            args,
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            d_state_count: AtomicU32::new(0),
            pid_file: parking_lot::Mutex::new(None),
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn pid_file_candidates(&self) -> Vec<PathBuf> {
        match &self.config.pid_file {
            Some(path) => vec![PathBuf::from(path)],
            None => vec![
                PathBuf::from(DEFAULT_PID_FILE),
                PathBuf::from(FALLBACK_PID_FILE),
            ],
        }
    }

    fn release_pid_file(&self) {
        let path = self.pid_file.lock().take();
        if let Some(path) = path {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed PID file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!("Failed to remove PID file {}: {}", path.display(), e),
            }
        }
    }

    async fn kill_group(&self, pid: u32, signal: &str) {
        // knxd was spawned as its own process group leader
        let target = format!("-{}", pid);
        match Command::new("kill")
            .args([signal, "--", target.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => {},
            Ok(status) => debug!("kill {} {} exited with {}", signal, target, status),
            Err(e) => debug!("kill {} {} failed: {}", signal, target, e),
        }
    }

    fn usb_id(&self) -> Option<String> {
        self.config.usb_id()
    }

    async fn check_usb_present(&self) -> CheckResult {
        let Some(id) = self.usb_id() else {
            return Ok(());
        };
        let output = Command::new("lsusb").args(["-d", id.as_str()]).output();
        match tokio::time::timeout(USB_CHECK_TIMEOUT, output).await {
            Err(_) => Err(HealthFailure::unrecoverable(
                HealthLayer::Process,
                format!("USB device check timed out after {:?}", USB_CHECK_TIMEOUT),
            )),
            Ok(Err(e)) => Err(HealthFailure::unrecoverable(
                HealthLayer::Process,
                format!("lsusb failed: {}", e),
            )),
            Ok(Ok(out)) if out.status.success() && !out.stdout.is_empty() => {
                debug!(
                    "USB interface {} present: {}",
                    id,
                    String::from_utf8_lossy(&out.stdout).trim()
                );
                Ok(())
            },
            Ok(Ok(_)) => Err(HealthFailure::unrecoverable(
                HealthLayer::Process,
                format!("USB KNX interface {} not detected", id),
            )),
        }
    }

    fn sample_proc_state(&self, pid: u32) -> CheckResult {
        let path = format!("/proc/{}/stat", pid);
        let stat = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            // No procfs (non-Linux); try_wait already covered exit
            Err(_) if !Path::new("/proc/self/stat").exists() => return Ok(()),
            Err(e) => {
                return Err(HealthFailure::new(
                    HealthLayer::Process,
                    format!("cannot read process state: {}", e),
                ))
            },
        };
        let state = parse_proc_state(&stat).ok_or_else(|| {
            HealthFailure::new(HealthLayer::Process, "invalid /proc stat format")
        })?;
        self.judge_state(state)
    }

    fn judge_state(&self, state: ProcState) -> CheckResult {
        match state {
            ProcState::Stopped => Err(HealthFailure::new(
                HealthLayer::Process,
                "knxd process is stopped",
            )),
            ProcState::Zombie => Err(HealthFailure::new(
                HealthLayer::Process,
                "knxd process is a zombie",
            )),
            ProcState::Dead => Err(HealthFailure::new(
                HealthLayer::Process,
                "knxd process is dead",
            )),
            ProcState::DiskSleep => {
                let count = self.d_state_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= D_STATE_LIMIT {
                    Err(HealthFailure::new(
                        HealthLayer::Process,
                        format!("knxd stuck in uninterruptible sleep ({} samples)", count),
                    ))
                } else {
                    debug!("knxd in uninterruptible sleep (sample {})", count);
                    Ok(())
                }
            },
            ProcState::Running => {
                self.d_state_count.store(0, Ordering::Relaxed);
                Ok(())
            },
        }
    }
}

/// Claim the PID file, refusing when another live knxd owns it
pub fn acquire_pid_file(path: &Path, pid: u32) -> Result<()> {
    use std::io::Write;

    for _ in 0..3 {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", pid)?;
                return Ok(());
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                match existing {
                    Some(other) if other != pid && is_knxd_alive(other) => {
                        return Err(KnxSrvError::Internal(format!(
                            "another knxd instance is already running (pid {}, file {})",
                            other,
                            path.display()
                        )));
                    },
                    _ => {
                        info!("Removing stale PID file {}", path.display());
                        let _ = std::fs::remove_file(path);
                    },
                }
            },
            Err(e) => return Err(e.into()),
        }
    }
    Err(KnxSrvError::Internal(format!(
        "could not acquire PID file {}",
        path.display()
    )))
}

fn is_knxd_alive(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|comm| comm.trim() == "knxd")
        .unwrap_or(false)
}

fn forward_output<R>(stream: R, stream_name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "knxd", "[{}] {}", stream_name, line);
        }
    });
}

#[async_trait]
impl ProcessControl for KnxdProcess {
    async fn spawn(&self) -> Result<u32> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Err(KnxSrvError::Internal("knxd is already running".to_string()));
            }
        }

        info!("Starting knxd: {} {}", self.config.binary, self.args.join(" "));
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            KnxSrvError::Io(format!("failed to start {}: {}", self.config.binary, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| KnxSrvError::Internal("knxd exited during spawn".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        self.pid.store(pid, Ordering::Release);
        self.d_state_count.store(0, Ordering::Relaxed);
        *guard = Some(child);
        drop(guard);

        let mut last_error = None;
        for path in self.pid_file_candidates() {
            match acquire_pid_file(&path, pid) {
                Ok(()) => {
                    debug!("PID file {} written", path.display());
                    *self.pid_file.lock() = Some(path);
                    last_error = None;
                    break;
                },
                Err(e @ KnxSrvError::Internal(_)) => {
                    // Another instance owns it: don't run a duplicate
                    let _ = self.stop().await;
                    return Err(e);
                },
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(e) = last_error {
            warn!("No PID file written: {}", e);
        }

        info!("[OK] knxd started (pid {})", pid);
        Ok(pid)
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        let pid = self.pid.swap(0, Ordering::AcqRel);

        if child.try_wait()?.is_none() && pid != 0 {
            info!("Stopping knxd (pid {})", pid);
            self.kill_group(pid, "-TERM").await;
            match tokio::time::timeout(self.config.graceful_timeout(), child.wait()).await {
                Ok(Ok(status)) => info!("knxd exited: {}", status),
                Ok(Err(e)) => warn!("Waiting for knxd failed: {}", e),
                Err(_) => {
                    warn!(
                        "knxd did not exit within {:?}, killing",
                        self.config.graceful_timeout()
                    );
                    self.kill_group(pid, "-KILL").await;
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                },
            }
        }
        drop(guard);
        self.release_pid_file();
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    async fn check_process(&self) -> CheckResult {
        self.check_usb_present().await?;

        let pid = {
            let mut guard = self.child.lock().await;
            let Some(child) = guard.as_mut() else {
                return Err(HealthFailure::new(HealthLayer::Process, "knxd is not running"));
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(HealthFailure::new(
                        HealthLayer::Process,
                        format!("knxd exited: {}", status),
                    ))
                },
                Ok(None) => {},
                Err(e) => {
                    return Err(HealthFailure::new(
                        HealthLayer::Process,
                        format!("cannot query knxd: {}", e),
                    ))
                },
            }
            child.id()
        };
        match pid {
            Some(pid) => self.sample_proc_state(pid),
            None => Err(HealthFailure::new(HealthLayer::Process, "knxd has no pid")),
        }
    }

    fn can_reset_interface(&self) -> bool {
        self.usb_id().is_some()
    }

    async fn reset_interface(&self) -> Result<()> {
        let Some(id) = self.usb_id() else {
            return Ok(());
        };
        info!("Resetting USB interface {}", id);
        let output = Command::new("usbreset").arg(&id).output();
        let out = tokio::time::timeout(USB_RESET_TIMEOUT, output)
            .await
            .map_err(|_| KnxSrvError::Timeout(format!("usbreset {} timed out", id)))?
            .map_err(|e| KnxSrvError::Io(format!("usbreset failed: {}", e)))?;
        if !out.status.success() {
            return Err(KnxSrvError::Io(format!(
                "usbreset {} failed: {}",
                id,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        tokio::time::sleep(USB_RESET_SETTLE).await;
        info!("[OK] USB interface {} reset", id);
        Ok(())
    }
}
