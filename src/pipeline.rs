// src/pipeline.rs
//
// Per-video processing driver. Wires the reader, detector, registry,
// plate extraction, overlay, writer and report sink into one pass over
// the input video.

use crate::color;
use crate::detector::DetectorTracker;
use crate::overlay;
use crate::plate::{PlateExtractor, TextRecognizer};
use crate::progress::{Counters, ProgressPublisher};
use crate::registry::{RegistryConfig, TrackEvent, TrackRegistry};
use crate::report::ReportSink;
use crate::types::{Config, Observation, PlateRead, VehicleColor};
use crate::video::{mat_to_rgb, VideoProcessor};
use anyhow::Result;
use opencv::core::Mat;
use opencv::videoio::VideoWriterTrait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Frame-bound analyzer handed to the registry: color classification over
/// the frame's RGB buffer, plate reads over the BGR Mat.
struct CropAnalyzer<'a> {
    frame: &'a Mat,
    rgb: &'a [u8],
    width: usize,
    height: usize,
    out_width: i32,
    recognizer: &'a mut dyn TextRecognizer,
}

impl crate::registry::FrameAnalyzer for CropAnalyzer<'_> {
    fn classify_color(&mut self, obs: &Observation) -> VehicleColor {
        color::classify_vehicle_color(self.rgb, self.width, self.height, &obs.bbox)
    }

    fn read_plate(&mut self, obs: &Observation) -> Option<PlateRead> {
        match PlateExtractor::read_plate(self.recognizer, self.frame, &obs.bbox, self.out_width) {
            Ok(read) => read,
            Err(e) => {
                warn!("Plate extraction failed for track {}: {}", obs.track_id, e);
                None
            }
        }
    }
}

/// Process one video end to end. Returns the final vehicle counters.
/// Cancellation is checked once per raw frame and surfaces as an error.
pub fn process_video(
    config: &Config,
    input_path: &Path,
    video_output_path: &Path,
    report_output_path: &Path,
    detector: &mut dyn DetectorTracker,
    recognizer: &mut dyn TextRecognizer,
    progress: &mut ProgressPublisher,
    cancel: &AtomicBool,
) -> Result<Counters> {
    let processor = VideoProcessor::new(
        config.video.max_output_width,
        config.video.codec_chain.clone(),
    );
    let mut reader = processor.open_video(input_path)?;
    let mut writer = processor.create_writer(
        video_output_path,
        reader.fps,
        reader.out_width,
        reader.out_height,
    )?;
    let mut sink = ReportSink::create(report_output_path)?;

    let mut registry = TrackRegistry::new(RegistryConfig {
        lock_threshold: config.analysis.lock_threshold,
        ocr_interval: config.analysis.ocr_interval,
        max_ocr_attempts: config.ocr.max_attempts,
        ocr_accept_threshold: config.ocr.accept_threshold,
        stale_after_frames: config.analysis.stale_after_frames,
    });

    let frame_skip = config.analysis.frame_skip.max(1);
    let progress_interval = config.analysis.progress_interval.max(1);
    let total_frames = reader.total_frames;

    info!(
        "🎬 Processing {} (analyzing every {} frame(s))",
        input_path.display(),
        frame_skip
    );

    while let Some(mut frame) = reader.read_frame()? {
        if cancel.load(Ordering::Relaxed) {
            anyhow::bail!("job cancelled");
        }
        let frame_idx = reader.current_frame;

        if frame_idx % progress_interval == 0 {
            progress.publish(*registry.counters(), frame_idx, total_frames);
        }

        // Skipped frames pass through unannotated
        if frame_idx % frame_skip != 0 {
            writer.write(&frame)?;
            continue;
        }

        let rgb = mat_to_rgb(&frame)?;
        let observations = match detector.detect_and_track(
            &rgb,
            reader.out_width as usize,
            reader.out_height as usize,
        ) {
            Ok(obs) => obs,
            Err(e) => {
                // Inference failure on one frame must not poison track
                // state; the frame is written as-is.
                error!("Detection failed on frame {}: {}", frame_idx, e);
                writer.write(&frame)?;
                continue;
            }
        };

        let mut analyzer = CropAnalyzer {
            frame: &frame,
            rgb: &rgb,
            width: reader.out_width as usize,
            height: reader.out_height as usize,
            out_width: reader.out_width,
            recognizer,
        };
        let events = registry.observe_frame(frame_idx, &observations, &mut analyzer);

        for event in events {
            match event {
                TrackEvent::Locked { .. } => {
                    progress.publish(*registry.counters(), frame_idx, total_frames);
                }
                TrackEvent::Finalized(row) => sink.write_row(&row)?,
            }
        }

        overlay::draw_observations(&mut frame, &observations, &registry)?;
        writer.write(&frame)?;
    }

    // End of stream: every surviving locked track becomes a row
    let final_frame = reader.current_frame;
    for row in registry.flush(final_frame) {
        sink.write_row(&row)?;
    }
    progress.publish(*registry.counters(), final_frame, total_frames);

    let counters = *registry.counters();
    info!(
        "✓ Finished {}: {} vehicles ({} cars, {} bikes, {} trucks), {} report rows",
        input_path.display(),
        counters.total,
        counters.cars,
        counters.bikes,
        counters.trucks,
        sink.rows_written()
    );
    sink.into_inner()?;

    Ok(counters)
}
