use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use motion_sentinel::config::{PhotoFormat, StorageSettings};
use motion_sentinel::{CaptureRequest, CaptureTrigger, Frame, StorageWriter};

fn request(sequence: u64) -> CaptureRequest {
    CaptureRequest {
        frame: Arc::new(Frame::solid(32, 24, 200, sequence)),
        timestamp: Instant::now(),
        sequence,
        trigger: CaptureTrigger::Motion,
        total_area: 1200,
        region_count: 2,
    }
}

fn captures_in(dir: &std::path::Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    names.sort();
    Ok(names)
}

#[test]
fn keeps_only_the_newest_photos() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = StorageWriter::new(StorageSettings {
        output_directory: dir.path().to_path_buf(),
        max_photos: 3,
        ..StorageSettings::default()
    })?;

    let mut saved = Vec::new();
    for seq in 1..=5 {
        let path = writer.save(&request(seq))?;
        saved.push(path.file_name().unwrap().to_string_lossy().into_owned());
        // Distinct millisecond timestamps in the file names.
        std::thread::sleep(std::time::Duration::from_millis(3));
    }

    let remaining = captures_in(dir.path())?;
    assert_eq!(remaining, saved[2..].to_vec());
    assert!(remaining.iter().all(|name| name.ends_with(".jpg")));
    assert_eq!(writer.stats().saved, 5);
    assert_eq!(writer.stats().evicted, 2);
    Ok(())
}

#[test]
fn unrelated_files_are_never_evicted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("notes.txt"), "keep me")?;
    std::fs::write(dir.path().join("holiday.jpg"), "not a capture")?;

    let mut writer = StorageWriter::new(StorageSettings {
        output_directory: dir.path().to_path_buf(),
        photo_format: PhotoFormat::Png,
        max_photos: 1,
        ..StorageSettings::default()
    })?;
    writer.save(&request(1))?;
    let last = writer.save(&request(2))?;

    let remaining = captures_in(dir.path())?;
    assert_eq!(remaining.len(), 3);
    assert!(remaining.contains(&"notes.txt".to_string()));
    assert!(remaining.contains(&"holiday.jpg".to_string()));
    assert!(last.exists());
    Ok(())
}

#[test]
fn jpeg_quality_is_applied() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut low = StorageWriter::new(StorageSettings {
        output_directory: dir.path().join("low"),
        photo_quality: 10,
        ..StorageSettings::default()
    })?;
    let mut high = StorageWriter::new(StorageSettings {
        output_directory: dir.path().join("high"),
        photo_quality: 100,
        ..StorageSettings::default()
    })?;

    let gradient = image::RgbImage::from_fn(64, 48, |x, y| {
        image::Rgb([(x * 4) as u8, (y * 5) as u8, ((x + y) * 2) as u8])
    });
    let req = CaptureRequest {
        frame: Arc::new(Frame::from_rgb(gradient, 1)),
        ..request(1)
    };

    let low_size = std::fs::metadata(low.save(&req)?)?.len();
    let high_size = std::fs::metadata(high.save(&req)?)?.len();
    assert!(low_size < high_size, "{} >= {}", low_size, high_size);
    Ok(())
}

#[test]
fn captures_past_the_age_limit_are_removed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // Stamped 1970 and 2001, well past any age limit.
    std::fs::write(dir.path().join("motion_0000000001000_000001.jpg"), "old")?;
    std::fs::write(dir.path().join("motion_1000000000000_000002.png"), "old")?;

    let mut writer = StorageWriter::new(StorageSettings {
        output_directory: dir.path().to_path_buf(),
        max_age_days: 30,
        ..StorageSettings::default()
    })?;
    let fresh = writer.save(&request(3))?;

    let remaining = captures_in(dir.path())?;
    assert_eq!(remaining.len(), 1);
    assert!(fresh.exists());
    assert_eq!(writer.stats().evicted, 2);
    Ok(())
}

#[test]
fn zero_max_age_keeps_old_captures() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("motion_0000000001000_000001.jpg"), "old")?;

    let mut writer = StorageWriter::new(StorageSettings {
        output_directory: dir.path().to_path_buf(),
        max_age_days: 0,
        ..StorageSettings::default()
    })?;
    writer.save(&request(2))?;

    assert_eq!(captures_in(dir.path())?.len(), 2);
    assert_eq!(writer.stats().evicted, 0);
    Ok(())
}

#[test]
fn disabled_cleanup_keeps_everything() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("motion_0000000001000_000001.jpg"), "old")?;

    let mut writer = StorageWriter::new(StorageSettings {
        output_directory: dir.path().to_path_buf(),
        max_photos: 1,
        cleanup_enabled: false,
        ..StorageSettings::default()
    })?;
    for seq in 2..=4 {
        writer.save(&request(seq))?;
        std::thread::sleep(std::time::Duration::from_millis(3));
    }

    assert_eq!(captures_in(dir.path())?.len(), 4);
    assert_eq!(writer.stats().saved, 3);
    assert_eq!(writer.stats().evicted, 0);
    Ok(())
}
