//! Startup self-checks for `motiond --diagnostics`.
//!
//! Checks, in order:
//! 1. The configured frame source opens and delivers a frame
//! 2. The output directory can be created, written and cleaned up
//! 3. Free space on the output volume (a warning below 1 GiB)

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::Path;

use crate::config::{CaptureSettings, MotionConfig, SourceSettings};
use crate::error::FrameError;
use crate::ingest::open_source;

const LOW_SPACE_BYTES: u64 = 1 << 30;
const WRITE_TEST_FILE: &str = ".motiond-write-test";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Failed,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warning",
            CheckStatus::Failed => "FAILED",
        };
        f.pad(label)
    }
}

#[derive(Clone, Debug)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckOutcome {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DiagnosticReport {
    pub checks: Vec<CheckOutcome>,
    /// Bytes available to unprivileged users on the output volume.
    pub free_bytes: Option<u64>,
}

impl DiagnosticReport {
    /// True unless a check failed. Warnings do not fail the report.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Failed)
    }

    pub fn check(&self, name: &str) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Run every check against `config`, logging each outcome.
pub fn run_diagnostics(config: &MotionConfig) -> DiagnosticReport {
    let mut report = DiagnosticReport::default();
    let output = &config.storage.output_directory;

    report.checks.push(check_source(&config.source, &config.capture));
    report.checks.push(check_output_directory(output));

    let (space, free_bytes) = check_free_space(output);
    report.checks.push(space);
    report.free_bytes = free_bytes;

    for check in &report.checks {
        match check.status {
            CheckStatus::Ok => log::info!("diagnostics: {}: {}", check.name, check.detail),
            CheckStatus::Warning => log::warn!("diagnostics: {}: {}", check.name, check.detail),
            CheckStatus::Failed => log::error!("diagnostics: {}: {}", check.name, check.detail),
        }
    }
    report
}

fn check_source(source: &SourceSettings, capture: &CaptureSettings) -> CheckOutcome {
    const NAME: &str = "camera";
    let mut frames = match open_source(source) {
        Ok(frames) => frames,
        Err(err) => return CheckOutcome::new(NAME, CheckStatus::Failed, format!("{:#}", err)),
    };

    let mut last_reason = String::new();
    for attempt in 1..=capture.error_retry_limit {
        match frames.next_frame() {
            Ok(frame) => {
                return CheckOutcome::new(
                    NAME,
                    CheckStatus::Ok,
                    format!(
                        "{} delivered a {}x{} frame (attempt {})",
                        frames.name(),
                        frame.width(),
                        frame.height(),
                        attempt
                    ),
                );
            }
            Err(FrameError::Closed) => {
                return CheckOutcome::new(
                    NAME,
                    CheckStatus::Failed,
                    format!("{} closed before delivering a frame", frames.name()),
                );
            }
            Err(FrameError::Unavailable(reason)) => {
                last_reason = reason;
                std::thread::sleep(capture.retry_delay);
            }
        }
    }
    CheckOutcome::new(
        NAME,
        CheckStatus::Failed,
        format!(
            "{} failed {} times: {}",
            frames.name(),
            capture.error_retry_limit,
            last_reason
        ),
    )
}

fn check_output_directory(dir: &Path) -> CheckOutcome {
    const NAME: &str = "output directory";
    match write_test_file(dir) {
        Ok(()) => {
            CheckOutcome::new(NAME, CheckStatus::Ok, format!("{} is writable", dir.display()))
        }
        Err(err) => CheckOutcome::new(NAME, CheckStatus::Failed, format!("{:#}", err)),
    }
}

fn write_test_file(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(WRITE_TEST_FILE);
    std::fs::write(&path, b"motiond").with_context(|| format!("write {}", path.display()))?;
    std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    Ok(())
}

fn check_free_space(dir: &Path) -> (CheckOutcome, Option<u64>) {
    const NAME: &str = "disk space";
    match available_space(dir) {
        Ok(Some(bytes)) => {
            let gib = bytes as f64 / (1u64 << 30) as f64;
            let status = if bytes < LOW_SPACE_BYTES {
                CheckStatus::Warning
            } else {
                CheckStatus::Ok
            };
            (
                CheckOutcome::new(NAME, status, format!("{:.1} GiB available", gib)),
                Some(bytes),
            )
        }
        Ok(None) => (
            CheckOutcome::new(NAME, CheckStatus::Warning, "not available on this platform"),
            None,
        ),
        Err(err) => (
            CheckOutcome::new(NAME, CheckStatus::Warning, format!("{:#}", err)),
            None,
        ),
    }
}

/// Bytes available on the volume holding `path`.
pub fn available_space(path: &Path) -> Result<Option<u64>> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| anyhow!("invalid path {}: {}", path.display(), e))?;
        // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(anyhow!(
                    "statvfs {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                ));
            }
            #[allow(clippy::unnecessary_cast)]
            let available = stat.f_bavail as u64 * stat.f_frsize as u64;
            Ok(Some(available))
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(uri: &str, output: &Path) -> MotionConfig {
        let mut cfg = MotionConfig::default();
        cfg.source.uri = uri.to_string();
        cfg.source.width = 64;
        cfg.source.height = 48;
        cfg.capture.retry_delay = Duration::ZERO;
        cfg.storage.output_directory = output.to_path_buf();
        cfg
    }

    #[test]
    fn healthy_setup_passes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("captures");
        let report = run_diagnostics(&config("stub://diag", &output));

        assert!(report.passed(), "{:?}", report);
        assert_eq!(report.check("camera").map(|c| c.status), Some(CheckStatus::Ok));
        assert!(output.is_dir());
        assert!(!output.join(WRITE_TEST_FILE).exists());
        #[cfg(unix)]
        assert!(report.free_bytes.is_some_and(|b| b > 0));
        Ok(())
    }

    #[test]
    fn missing_source_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let report = run_diagnostics(&config(
            &dir.path().join("no-frames-here").display().to_string(),
            dir.path(),
        ));

        assert!(!report.passed());
        assert_eq!(
            report.check("camera").map(|c| c.status),
            Some(CheckStatus::Failed)
        );
        Ok(())
    }

    #[test]
    fn empty_sequence_counts_as_closed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let frames = dir.path().join("frames");
        std::fs::create_dir(&frames)?;
        let outcome = check_source(
            &config(&frames.display().to_string(), dir.path()).source,
            &CaptureSettings::default(),
        );
        assert_eq!(outcome.status, CheckStatus::Failed);
        Ok(())
    }

    #[test]
    fn unwritable_output_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, "a file, not a directory")?;

        let outcome = check_output_directory(&blocker);
        assert_eq!(outcome.status, CheckStatus::Failed);
        assert!(outcome.detail.contains("occupied"), "{}", outcome.detail);
        Ok(())
    }
}
