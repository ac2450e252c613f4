//! motiond - motion detection and photo capture daemon
//!
//! This daemon:
//! 1. Loads layered configuration (file, environment, command line)
//! 2. Opens the configured frame source
//! 3. Runs the detection pipeline until Ctrl-C, `q`, or the source closes
//! 4. Saves capture requests on a storage thread with rolling cleanup
//! 5. Optionally writes an annotated preview image at a fixed interval
//!
//! `--diagnostics` checks the source, the output directory and free disk
//! space instead, exiting non-zero when a check fails.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use motion_sentinel::{
    open_source, render_overlay, run_diagnostics, DetectionPipeline, MotionConfig,
    PipelineControls, PreviewSlot, StorageWriter,
};

const PREVIEW_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "MOTION_CONFIG")]
    config: Option<PathBuf>,
    /// Frame source: stub://name, an image directory or /dev/videoN.
    #[arg(long)]
    source: Option<String>,
    /// Directory captured photos are written to.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Stop after this many cycles.
    #[arg(long)]
    max_cycles: Option<u64>,
    /// Periodically write an annotated preview image to this path.
    #[arg(long)]
    preview: Option<PathBuf>,
    /// Read single-letter commands from stdin (q quit, r reset background, s snapshot).
    #[arg(long)]
    interactive: bool,
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
    /// Print the resolved configuration and exit.
    #[arg(long)]
    print_config: bool,
    /// Check camera access, output directory and disk space, then exit.
    #[arg(long)]
    diagnostics: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = MotionConfig::load(args.config.as_deref())?;
    if let Some(source) = &args.source {
        config.source.uri = source.clone();
    }
    if let Some(output) = &args.output {
        config.storage.output_directory = output.clone();
    }
    config.validate()?;

    if args.print_config {
        println!("{}", config.summary());
        return Ok(());
    }
    if args.diagnostics {
        let report = run_diagnostics(&config);
        for check in &report.checks {
            println!("{:<17} {:<8} {}", check.name, check.status, check.detail);
        }
        if !report.passed() {
            bail!("diagnostics failed");
        }
        println!("system ready");
        return Ok(());
    }
    log::info!("motiond {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("{}", config.summary());

    let source = open_source(&config.source)?;
    let writer = StorageWriter::new(config.storage.clone())?;
    log::info!("saving captures to {}", writer.output_directory().display());

    let (capture_tx, capture_rx) = mpsc::channel();
    let storage = writer.spawn(capture_rx)?;

    let mut pipeline = DetectionPipeline::new(source, &config)?.with_capture_sink(capture_tx);
    let controls = pipeline.controls();

    let preview = match &args.preview {
        Some(path) => {
            let slot = PreviewSlot::new();
            pipeline = pipeline.with_preview(slot.clone());
            Some(spawn_preview_writer(path.clone(), slot, controls.clone())?)
        }
        None => None,
    };

    let stop = controls.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        stop.request_stop();
    })
    .expect("error setting Ctrl-C handler");

    if args.interactive {
        spawn_command_reader(controls.clone())?;
        log::info!("commands: q = quit, r = reset background, s = snapshot");
    }

    let stats = match args.max_cycles {
        Some(n) => pipeline.run_for(n),
        None => pipeline.run(),
    };
    controls.request_stop();
    // Dropping the pipeline closes the capture channel so the writer can finish.
    drop(pipeline);

    let saved = storage.join()?;
    if let Some(handle) = preview {
        handle
            .join()
            .map_err(|_| anyhow!("preview writer thread panicked"))?;
    }
    log::info!(
        "motiond stopped: cycles={} captures_sent={} saved={} failed={} evicted={}",
        stats.cycles,
        stats.captures_sent,
        saved.saved,
        saved.failed,
        saved.evicted
    );
    Ok(())
}

fn spawn_preview_writer(
    path: PathBuf,
    slot: PreviewSlot,
    controls: PipelineControls,
) -> Result<JoinHandle<()>> {
    let join = std::thread::Builder::new()
        .name("motion-preview".to_string())
        .spawn(move || {
            while !controls.is_stop_requested() {
                if let Some(snapshot) = slot.take_latest() {
                    if let Err(err) = write_preview(&path, &render_overlay(&snapshot)) {
                        log::warn!("preview not written: {:#}", err);
                    }
                }
                std::thread::sleep(PREVIEW_INTERVAL);
            }
        })?;
    Ok(join)
}

fn write_preview(path: &Path, image: &image::RgbImage) -> Result<()> {
    // Write next to the target and rename so viewers never see a partial file.
    let tmp = path.with_extension("partial.png");
    image.save_with_format(&tmp, image::ImageFormat::Png)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn spawn_command_reader(controls: PipelineControls) -> Result<()> {
    std::thread::Builder::new()
        .name("motion-commands".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "q" => {
                        controls.request_stop();
                        break;
                    }
                    "r" => {
                        log::info!("background reset requested by operator");
                        controls.request_background_reset();
                    }
                    "s" => controls.request_manual_capture(),
                    "" => {}
                    other => log::warn!("unknown command '{}'", other),
                }
            }
        })?;
    Ok(())
}
