// src/main.rs
//
// Traffic census: per-vehicle analysis over traffic videos. Finds videos in
// the configured input directory and runs them through the analysis job one
// at a time, echoing progress and final counts.

mod color;
mod config;
mod detector;
mod job;
mod overlay;
mod pipeline;
mod plate;
mod progress;
mod registry;
mod report;
mod types;
mod video;

use crate::job::{AnalysisJob, JobStatus};
use crate::types::Config;
use crate::video::VideoProcessor;
use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_default("config.yaml")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("🚦 Traffic census starting");

    let processor = VideoProcessor::new(
        config.video.max_output_width,
        config.video.codec_chain.clone(),
    );
    let videos = processor.find_video_files(&config.video.input_dir)?;
    if videos.is_empty() {
        info!("No videos found in {}", config.video.input_dir);
        return Ok(());
    }
    info!("Found {} video(s) to process", videos.len());

    let mut job = AnalysisJob::new();
    let mut failures = 0usize;

    for path in &videos {
        if let Err(e) = job.submit(config.clone(), path) {
            error!("Failed to submit {}: {:#}", path.display(), e);
            failures += 1;
            continue;
        }

        let mut last_echoed = u32::MAX;
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let snap = job.snapshot();
            if snap.counters.progress_percent != last_echoed
                && snap.status == JobStatus::Processing
            {
                last_echoed = snap.counters.progress_percent;
                info!(
                    "⏳ {}% | {} vehicles ({} cars, {} bikes, {} trucks)",
                    snap.counters.progress_percent,
                    snap.counters.total,
                    snap.counters.cars,
                    snap.counters.bikes,
                    snap.counters.trucks
                );
            }
            if matches!(snap.status, JobStatus::Completed | JobStatus::Error) {
                break;
            }
        }
        job.join().await;

        let snap = job.snapshot();
        match snap.status {
            JobStatus::Completed => {
                info!(
                    "✓ {} done: {} vehicles, report {}",
                    path.display(),
                    snap.counters.total,
                    snap.report_output_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                );
            }
            JobStatus::Error => {
                error!(
                    "✗ {} failed: {}",
                    path.display(),
                    snap.error.unwrap_or_else(|| "unknown error".to_string())
                );
                failures += 1;
            }
            _ => {}
        }
    }

    info!(
        "🏁 All videos processed ({} succeeded, {} failed)",
        videos.len() - failures,
        failures
    );
    Ok(())
}
