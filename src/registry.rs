// src/registry.rs
//
// Per-track lifecycle state machine: create → accumulate → lock/count →
// OCR-vote → finalize/evict.
//
// The registry consumes the noisy per-analyzed-frame observation stream from
// the detector/tracker and reconciles it into exactly one report row per
// physical vehicle. Pixel-level work (color classification, plate OCR) goes
// through the FrameAnalyzer seam, so the state machine itself never touches
// frame data and can be driven entirely by synthetic observations in tests.
//
// Lifecycle invariants:
//   - a track locks (is counted and color-classified) exactly once, the
//     first time frames_seen reaches the lock threshold;
//   - tracks that never lock are discarded silently — detector noise, not
//     an error;
//   - a locked track is finalized exactly once, either by stale eviction
//     (absent > stale_after raw frames, checked after each analyzed frame)
//     or by the end-of-stream flush;
//   - finalized tracks leave the live set.

use crate::progress::Counters;
use crate::types::{Observation, PlateRead, VehicleClass, VehicleColor, PLATE_NOT_DETECTED};
use std::collections::HashMap;
use tracing::{debug, info};

/// The registry's window onto pixel data for the current analyzed frame.
/// The pipeline backs this with real crops; tests substitute fakes.
pub trait FrameAnalyzer {
    fn classify_color(&mut self, obs: &Observation) -> VehicleColor;
    fn read_plate(&mut self, obs: &Observation) -> Option<PlateRead>;
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Analyzed-frame observations required before a track is counted.
    pub lock_threshold: u32,
    /// OCR sampling cadence in analyzed-frame observations.
    pub ocr_interval: u32,
    /// OCR attempts per track before sampling stops.
    pub max_ocr_attempts: u32,
    /// Minimum OCR confidence for a read to enter the vote.
    pub ocr_accept_threshold: f32,
    /// Raw frames of absence before a track goes stale.
    pub stale_after_frames: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_threshold: 5,
            ocr_interval: 5,
            max_ocr_attempts: 10,
            ocr_accept_threshold: 0.30,
            stale_after_frames: 15,
        }
    }
}

/// Registry record of one externally-tracked identity.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: i64,
    pub class: VehicleClass,
    /// Detector confidence captured at creation.
    pub detection_confidence: f32,
    /// Analyzed frames in which this identity was observed.
    pub frames_seen: u32,
    /// Raw frame index of the most recent observation.
    pub last_seen_frame: u64,
    /// Counted into totals; flips once.
    pub locked: bool,
    /// Assigned once, at the lock transition.
    pub color: VehicleColor,
    pub ocr_attempts: u32,
    /// First accepted OCR read; kept permanently.
    pub initial_plate: Option<String>,
    /// Highest-confidence OCR read so far.
    pub best_plate: Option<String>,
    pub best_plate_confidence: f32,
}

impl Track {
    fn new(obs: &Observation) -> Self {
        Self {
            id: obs.track_id,
            class: obs.class,
            detection_confidence: obs.confidence,
            frames_seen: 0,
            last_seen_frame: 0,
            locked: false,
            color: VehicleColor::Blue,
            ocr_attempts: 0,
            initial_plate: None,
            best_plate: None,
            best_plate_confidence: 0.0,
        }
    }

    pub fn best_plate_label(&self) -> &str {
        self.best_plate.as_deref().unwrap_or(PLATE_NOT_DETECTED)
    }
}

/// One finalized vehicle, ready for the report sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub vehicle_type: VehicleClass,
    pub color: VehicleColor,
    pub number_plate: String,
    pub initial_plate: String,
    /// Best OCR confidence (0.0 when no plate was ever read).
    pub confidence: f32,
    /// Raw frame index at finalization.
    pub frame: u64,
}

/// Events surfaced to the driver from one analyzed frame.
#[derive(Debug)]
pub enum TrackEvent {
    /// A track crossed the lock threshold and was counted.
    Locked { track_id: i64, class: VehicleClass },
    /// A track was finalized; its report row has been produced.
    Finalized(ReportRow),
}

pub struct TrackRegistry {
    config: RegistryConfig,
    tracks: HashMap<i64, Track>,
    counters: Counters,
}

impl TrackRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn live_track(&self, id: i64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn live_count(&self) -> usize {
        self.tracks.len()
    }

    /// Process one analyzed frame's observation set, then run the stale
    /// sweep. `frame_idx` is the raw frame index.
    pub fn observe_frame(
        &mut self,
        frame_idx: u64,
        observations: &[Observation],
        analyzer: &mut dyn FrameAnalyzer,
    ) -> Vec<TrackEvent> {
        let mut events = Vec::new();

        for obs in observations {
            let track = self
                .tracks
                .entry(obs.track_id)
                .or_insert_with(|| Track::new(obs));
            track.frames_seen += 1;
            track.last_seen_frame = frame_idx;

            // Lock: count and color-classify, exactly once.
            if !track.locked && track.frames_seen == self.config.lock_threshold {
                track.locked = true;
                track.color = analyzer.classify_color(obs);
                self.counters.count(track.class);
                info!(
                    "🔒 Track {} locked: {} ({}) at frame {}",
                    track.id,
                    track.class.as_str(),
                    track.color.as_str(),
                    frame_idx
                );
                events.push(TrackEvent::Locked {
                    track_id: track.id,
                    class: track.class,
                });
            }

            // OCR vote: sample on the gate cadence up to the attempt cap.
            // Attempts are spent whether or not the read succeeds.
            if track.ocr_attempts < self.config.max_ocr_attempts
                && track.frames_seen >= self.config.lock_threshold
                && track.frames_seen % self.config.ocr_interval == 0
            {
                track.ocr_attempts += 1;
                if let Some(read) = analyzer.read_plate(obs) {
                    if read.confidence > self.config.ocr_accept_threshold {
                        if read.confidence > track.best_plate_confidence {
                            track.best_plate_confidence = read.confidence;
                            track.best_plate = Some(read.text.clone());
                        }
                        if track.initial_plate.is_none() {
                            track.initial_plate = Some(read.text.clone());
                            debug!("Track {} first plate read: {}", track.id, read.text);
                        }
                    }
                }
            }
        }

        // Stale sweep: runs once per analyzed frame, after all observations.
        events.extend(
            self.evict_stale(frame_idx)
                .into_iter()
                .map(TrackEvent::Finalized),
        );

        events
    }

    fn evict_stale(&mut self, frame_idx: u64) -> Vec<ReportRow> {
        let stale_after = self.config.stale_after_frames;
        let mut rows = Vec::new();

        let stale_ids: Vec<i64> = self
            .tracks
            .values()
            .filter(|t| {
                t.last_seen_frame < frame_idx && frame_idx - t.last_seen_frame > stale_after
            })
            .map(|t| t.id)
            .collect();

        for id in stale_ids {
            let track = self.tracks.remove(&id).expect("stale id came from the map");
            if track.locked {
                info!(
                    "📋 Track {} finalized (stale, last seen frame {})",
                    track.id, track.last_seen_frame
                );
                rows.push(finalize(track, frame_idx));
            } else {
                // Never reached the lock threshold: detector noise.
                debug!(
                    "Track {} discarded after {} observation(s)",
                    track.id, track.frames_seen
                );
            }
        }

        rows
    }

    /// End-of-stream flush: finalize every remaining locked track.
    pub fn flush(&mut self, frame_idx: u64) -> Vec<ReportRow> {
        let mut rows = Vec::new();
        let mut ids: Vec<i64> = self.tracks.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let track = self.tracks.remove(&id).expect("id came from the map");
            if track.locked {
                info!("📋 Track {} finalized (end of stream)", track.id);
                rows.push(finalize(track, frame_idx));
            }
        }
        rows
    }
}

fn finalize(track: Track, frame_idx: u64) -> ReportRow {
    ReportRow {
        vehicle_type: track.class,
        color: track.color,
        number_plate: track
            .best_plate
            .unwrap_or_else(|| PLATE_NOT_DETECTED.to_string()),
        initial_plate: track
            .initial_plate
            .unwrap_or_else(|| PLATE_NOT_DETECTED.to_string()),
        confidence: track.best_plate_confidence,
        frame: frame_idx,
    }
}
