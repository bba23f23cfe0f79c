//! Disk-space monitoring for active recording sessions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use eventbus::ErrorBus;
use pitch_types::{ErrorCategory, ErrorSeverity, RecordingConfig};

/// Source of free-space readings; tests inject a fake.
pub trait FreeSpaceProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Reads free space with `statvfs`.
pub struct StatvfsProbe;

impl FreeSpaceProbe for StatvfsProbe {
    #[cfg(unix)]
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "free-space probing not implemented for this platform",
        ))
    }
}

fn gb_to_bytes(gb: f64) -> u64 {
    (gb * 1e9) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceLevel {
    Ok,
    /// Below the soft threshold: logged only.
    Warning,
    /// Below the elevated threshold: WARNING on the error bus.
    Elevated,
    /// At or below the critical threshold: CRITICAL + auto-stop.
    Critical,
}

/// Classify a free-space reading against the configured thresholds.
///
/// The critical comparison is inclusive: exactly 5.0 GB free is critical,
/// one byte more is not.
pub fn classify(free_bytes: u64, cfg: &RecordingConfig) -> SpaceLevel {
    if free_bytes <= gb_to_bytes(cfg.disk_critical_gb) {
        SpaceLevel::Critical
    } else if free_bytes <= gb_to_bytes(cfg.disk_elevated_gb) {
        SpaceLevel::Elevated
    } else if free_bytes <= gb_to_bytes(cfg.disk_warning_gb) {
        SpaceLevel::Warning
    } else {
        SpaceLevel::Ok
    }
}

struct StopFlag {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Polls free space under the session directory while recording is
/// active. On a critical reading it reports on the error bus, fires the
/// auto-stop trigger once, and exits.
pub struct DiskMonitor {
    flag: Arc<StopFlag>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl DiskMonitor {
    pub fn spawn(
        session_dir: PathBuf,
        cfg: RecordingConfig,
        probe: Arc<dyn FreeSpaceProbe>,
        error_bus: ErrorBus,
        on_critical: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        let flag = Arc::new(StopFlag {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        });
        let thread_flag = flag.clone();
        let poll = Duration::from_secs(cfg.disk_poll_seconds.max(1));
        let join = std::thread::Builder::new()
            .name("disk-monitor".to_string())
            .spawn(move || {
                loop {
                    // Interruptible sleep so stop is prompt.
                    {
                        let guard = thread_flag.stopped.lock().unwrap();
                        let (guard, _timeout) =
                            thread_flag.cond.wait_timeout(guard, poll).unwrap();
                        if *guard {
                            return;
                        }
                    }
                    let free = match probe.free_bytes(&session_dir) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("disk monitor: free-space read failed: {e}");
                            continue;
                        }
                    };
                    match classify(free, &cfg) {
                        SpaceLevel::Ok => {}
                        SpaceLevel::Warning => {
                            info!(
                                "free space below {} GB ({:.1} GB left)",
                                cfg.disk_warning_gb,
                                free as f64 / 1e9
                            );
                        }
                        SpaceLevel::Elevated => {
                            error_bus.report(
                                ErrorCategory::DiskSpace,
                                ErrorSeverity::Warning,
                                "disk-monitor",
                                format!("free space low: {:.1} GB left", free as f64 / 1e9),
                            );
                        }
                        SpaceLevel::Critical => {
                            error_bus.report(
                                ErrorCategory::DiskSpace,
                                ErrorSeverity::Critical,
                                "disk-monitor",
                                format!(
                                    "free space critical: {:.1} GB left; stopping recording",
                                    free as f64 / 1e9
                                ),
                            );
                            on_critical();
                            return;
                        }
                    }
                }
            })
            .expect("spawn disk monitor");
        Self {
            flag,
            join: Some(join),
        }
    }

    /// Signal the thread without joining (safe to call from the monitor
    /// thread itself).
    pub fn signal(&self) {
        {
            let mut stopped = self.flag.stopped.lock().unwrap();
            *stopped = true;
        }
        self.flag.cond.notify_all();
    }

    /// Signal the thread and join it.
    pub fn stop(&mut self) {
        self.signal();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DiskMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RecordingConfig {
        RecordingConfig::default()
    }

    #[test]
    fn classification_boundaries() {
        let cfg = cfg();
        // Exactly 5.0 GB is critical; one byte more is elevated.
        assert_eq!(classify(5_000_000_000, &cfg), SpaceLevel::Critical);
        assert_eq!(classify(5_000_000_001, &cfg), SpaceLevel::Elevated);
        assert_eq!(classify(20_000_000_000, &cfg), SpaceLevel::Elevated);
        assert_eq!(classify(20_000_000_001, &cfg), SpaceLevel::Warning);
        assert_eq!(classify(50_000_000_000, &cfg), SpaceLevel::Warning);
        assert_eq!(classify(50_000_000_001, &cfg), SpaceLevel::Ok);
        assert_eq!(classify(0, &cfg), SpaceLevel::Critical);
    }

    #[test]
    fn statvfs_reads_something_on_unix() {
        #[cfg(unix)]
        {
            let free = StatvfsProbe.free_bytes(Path::new("/")).unwrap();
            assert!(free > 0);
        }
    }
}
