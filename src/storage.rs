//! Capture persistence.
//!
//! `StorageWriter` turns capture requests into image files named
//! `motion_<unix-millis>_<sequence>.<ext>`. After every write it deletes
//! captures older than `max_age_days`, then the oldest ones beyond
//! `max_photos`, unless cleanup is disabled. It usually runs on its own
//! thread fed by the pipeline's capture channel; failures are logged and
//! never reach the detection loop.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::capture::CaptureRequest;
use crate::config::{PhotoFormat, StorageSettings};

const FILE_PREFIX: &str = "motion_";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub saved: u64,
    pub failed: u64,
    pub evicted: u64,
}

pub struct StorageWriter {
    settings: StorageSettings,
    stats: StorageStats,
}

impl StorageWriter {
    /// Validate settings and make sure the output directory exists.
    pub fn new(settings: StorageSettings) -> Result<Self> {
        settings.validate()?;
        std::fs::create_dir_all(&settings.output_directory).with_context(|| {
            format!(
                "create output directory {}",
                settings.output_directory.display()
            )
        })?;
        Ok(Self {
            settings,
            stats: StorageStats::default(),
        })
    }

    pub fn stats(&self) -> StorageStats {
        self.stats
    }

    pub fn output_directory(&self) -> &Path {
        &self.settings.output_directory
    }

    /// Write one capture, then apply the retention limits. A failed cleanup
    /// is logged and does not fail the save.
    pub fn save(&mut self, request: &CaptureRequest) -> Result<PathBuf> {
        let path = self.settings.output_directory.join(file_name(
            request,
            self.settings.photo_format,
        ));
        match self.write_image(request, &path) {
            Ok(()) => self.stats.saved += 1,
            Err(err) => {
                self.stats.failed += 1;
                return Err(err);
            }
        }
        self.stats.evicted += self.cleanup();
        Ok(path)
    }

    fn write_image(&self, request: &CaptureRequest, path: &Path) -> Result<()> {
        let image = request.frame.to_rgb();
        match self.settings.photo_format {
            PhotoFormat::Jpeg => {
                let file = File::create(path)
                    .with_context(|| format!("create {}", path.display()))?;
                let mut writer = BufWriter::new(file);
                JpegEncoder::new_with_quality(&mut writer, self.settings.photo_quality)
                    .encode_image(&image)
                    .with_context(|| format!("encode {}", path.display()))?;
                writer
                    .flush()
                    .with_context(|| format!("flush {}", path.display()))?;
            }
            PhotoFormat::Png => image
                .save_with_format(path, ImageFormat::Png)
                .with_context(|| format!("write {}", path.display()))?,
        }
        Ok(())
    }

    /// Apply the age and count limits. Returns how many captures were removed.
    pub fn cleanup(&self) -> u64 {
        if !self.settings.cleanup_enabled {
            return 0;
        }
        match self.remove_expired(SystemTime::now()) {
            Ok(removed) => removed,
            Err(err) => {
                log::warn!(
                    "cleanup of {} skipped: {:#}",
                    self.settings.output_directory.display(),
                    err
                );
                0
            }
        }
    }

    fn remove_expired(&self, now: SystemTime) -> Result<u64> {
        let mut captures = list_captures(&self.settings.output_directory)?;
        captures.sort();

        let cutoff = match self.settings.max_age_days {
            0 => None,
            days => now.checked_sub(Duration::from_secs(days as u64 * SECS_PER_DAY)),
        };
        let (expired, kept): (Vec<PathBuf>, Vec<PathBuf>) = match cutoff {
            Some(cutoff) => captures
                .into_iter()
                .partition(|path| captured_at(path).is_some_and(|at| at < cutoff)),
            None => (Vec::new(), captures),
        };
        let excess = kept.len().saturating_sub(self.settings.max_photos);

        let mut removed = 0;
        for path in expired.iter().chain(kept.iter().take(excess)) {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    removed += 1;
                    log::debug!("removed old capture {}", path.display());
                }
                Err(err) => log::warn!("failed to remove {}: {}", path.display(), err),
            }
        }
        if removed > 0 {
            log::info!(
                "removed {} old capture(s) (max_photos={}, max_age_days={})",
                removed,
                self.settings.max_photos,
                self.settings.max_age_days
            );
        }
        Ok(removed)
    }

    /// Drain `requests` on a dedicated thread until every sender is dropped.
    pub fn spawn(self, requests: Receiver<CaptureRequest>) -> Result<StorageHandle> {
        let join = std::thread::Builder::new()
            .name("motion-storage".to_string())
            .spawn(move || self.drain(requests))
            .context("spawn storage writer thread")?;
        Ok(StorageHandle { join: Some(join) })
    }

    fn drain(mut self, requests: Receiver<CaptureRequest>) -> StorageStats {
        for request in requests {
            match self.save(&request) {
                Ok(path) => log::info!(
                    "capture #{} saved to {} ({:?}, area={}, regions={})",
                    request.sequence,
                    path.display(),
                    request.trigger,
                    request.total_area,
                    request.region_count
                ),
                Err(err) => log::error!("capture #{} not saved: {:#}", request.sequence, err),
            }
        }
        log::debug!("storage writer finished: {:?}", self.stats);
        self.stats
    }
}

/// Join handle of a spawned storage writer.
#[derive(Debug)]
pub struct StorageHandle {
    join: Option<JoinHandle<StorageStats>>,
}

impl StorageHandle {
    /// Wait for the writer to flush. Returns once all senders are dropped.
    pub fn join(mut self) -> Result<StorageStats> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("storage writer thread panicked")),
            None => Ok(StorageStats::default()),
        }
    }
}

fn file_name(request: &CaptureRequest, format: PhotoFormat) -> String {
    let millis = request
        .frame
        .captured_wall()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!(
        "{}{:013}_{:06}.{}",
        FILE_PREFIX,
        millis,
        request.sequence,
        format.extension()
    )
}

/// Capture time from the millisecond stamp in the file name, falling back to
/// the modification time for names that do not carry one.
fn captured_at(path: &Path) -> Option<SystemTime> {
    let stamped = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(FILE_PREFIX))
        .and_then(|rest| rest.split('_').next())
        .and_then(|millis| millis.parse::<u64>().ok())
        .map(|millis| UNIX_EPOCH + Duration::from_millis(millis));
    stamped.or_else(|| std::fs::metadata(path).and_then(|m| m.modified()).ok())
}

fn list_captures(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut captures = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        let is_capture = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                name.starts_with(FILE_PREFIX) && (name.ends_with(".jpg") || name.ends_with(".png"))
            });
        if is_capture && path.is_file() {
            captures.push(path);
        }
    }
    Ok(captures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureTrigger;
    use crate::frame::Frame;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn request(sequence: u64) -> CaptureRequest {
        CaptureRequest {
            frame: Arc::new(Frame::solid(16, 12, 120, sequence)),
            timestamp: Instant::now(),
            sequence,
            trigger: CaptureTrigger::Motion,
            total_area: 600,
            region_count: 1,
        }
    }

    #[test]
    fn file_names_carry_time_and_sequence() {
        let req = request(42);
        let name = file_name(&req, PhotoFormat::Jpeg);
        assert!(name.starts_with("motion_"));
        assert!(name.ends_with("_000042.jpg"));
        let millis: &str = &name["motion_".len().."motion_".len() + 13];
        assert!(millis.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn saved_png_decodes_to_frame_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = StorageWriter::new(StorageSettings {
            output_directory: dir.path().to_path_buf(),
            photo_format: PhotoFormat::Png,
            ..StorageSettings::default()
        })?;

        let path = writer.save(&request(1))?;
        let decoded = image::open(&path)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 12));
        assert_eq!(decoded.get_pixel(3, 3).0, [120, 120, 120]);
        assert_eq!(writer.stats().saved, 1);
        Ok(())
    }

    #[test]
    fn capture_time_comes_from_the_file_name() {
        let at = captured_at(Path::new("/tmp/motion_0000000005000_000001.jpg"));
        assert_eq!(at, Some(UNIX_EPOCH + Duration::from_secs(5)));
    }

    #[test]
    fn cleanup_of_a_missing_directory_is_not_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("captures");
        let writer = StorageWriter::new(StorageSettings {
            output_directory: output.clone(),
            ..StorageSettings::default()
        })?;
        std::fs::remove_dir(&output)?;

        assert!(writer.remove_expired(SystemTime::now()).is_err());
        assert_eq!(writer.cleanup(), 0);
        Ok(())
    }

    #[test]
    fn spawned_writer_drains_until_senders_drop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = StorageWriter::new(StorageSettings {
            output_directory: dir.path().join("nested"),
            ..StorageSettings::default()
        })?;
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = writer.spawn(rx)?;

        for seq in 1..=3 {
            tx.send(request(seq))?;
            std::thread::sleep(Duration::from_millis(2));
        }
        drop(tx);

        let stats = handle.join()?;
        assert_eq!(stats.saved, 3);
        assert_eq!(list_captures(&dir.path().join("nested"))?.len(), 3);
        Ok(())
    }
}
