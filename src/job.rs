// src/job.rs
//
// Single-slot analysis job owner. One video job runs at a time; submitting
// while a job is in flight is rejected. The worker runs on the blocking
// pool, publishes counter snapshots through a watch channel, and records
// its terminal state under the shared mutex.

use crate::detector::YoloTracker;
use crate::pipeline;
use crate::plate::OrtTextRecognizer;
use crate::progress::{CountersSnapshot, ProgressPublisher};
use crate::types::Config;
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Starting,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
struct JobState {
    status: JobStatus,
    video_output_path: Option<PathBuf>,
    report_output_path: Option<PathBuf>,
    error: Option<String>,
}

impl JobState {
    fn idle() -> Self {
        Self {
            status: JobStatus::Idle,
            video_output_path: None,
            report_output_path: None,
            error: None,
        }
    }
}

/// Point-in-time view of the job, safe to serialize for a status poller.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub video_output_path: Option<PathBuf>,
    pub report_output_path: Option<PathBuf>,
    pub error: Option<String>,
    #[serde(flatten)]
    pub counters: CountersSnapshot,
}

pub struct AnalysisJob {
    state: Arc<Mutex<JobState>>,
    progress_rx: watch::Receiver<CountersSnapshot>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AnalysisJob {
    pub fn new() -> Self {
        let (_, rx) = ProgressPublisher::channel();
        Self {
            state: Arc::new(Mutex::new(JobState::idle())),
            progress_rx: rx,
            cancel: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Submit a video for analysis. Fails if a job is already in flight.
    pub fn submit(&mut self, config: Config, input_path: &Path) -> Result<()> {
        let stem = input_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let out_dir = PathBuf::from(&config.video.output_dir);
        let video_out = out_dir.join(format!("{}_analyzed.mp4", stem));
        let report_out = out_dir.join(format!("{}_report.csv", stem));
        let input = input_path.to_path_buf();

        self.launch(video_out.clone(), report_out.clone(), move |cancel, mut progress| {
            let mut detector = YoloTracker::new(config.detector.clone())?;
            let mut recognizer = OrtTextRecognizer::new(&config.ocr)?;
            pipeline::process_video(
                &config,
                &input,
                &video_out,
                &report_out,
                &mut detector,
                &mut recognizer,
                &mut progress,
                &cancel,
            )?;
            Ok(())
        })
    }

    /// Start a worker in the single job slot. Split from `submit` so the
    /// slot semantics are testable without model files or video input.
    fn launch<F>(&mut self, video_out: PathBuf, report_out: PathBuf, worker: F) -> Result<()>
    where
        F: FnOnce(Arc<AtomicBool>, ProgressPublisher) -> Result<()> + Send + 'static,
    {
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                anyhow::bail!("a job is already running");
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.status = JobStatus::Starting;
            state.video_output_path = Some(video_out);
            state.report_output_path = Some(report_out);
            state.error = None;
        }
        self.cancel.store(false, Ordering::Relaxed);

        let (publisher, rx) = ProgressPublisher::channel();
        self.progress_rx = rx;

        let state = Arc::clone(&self.state);
        let cancel = Arc::clone(&self.cancel);
        self.handle = Some(tokio::task::spawn_blocking(move || {
            state.lock().unwrap().status = JobStatus::Processing;
            match worker(cancel, publisher) {
                Ok(()) => {
                    info!("✓ Job completed");
                    state.lock().unwrap().status = JobStatus::Completed;
                }
                Err(e) => {
                    error!("Job failed: {:#}", e);
                    let mut state = state.lock().unwrap();
                    state.status = JobStatus::Error;
                    state.error = Some(format!("{:#}", e));
                }
            }
        }));
        Ok(())
    }

    /// Latest status plus the most recent counter snapshot.
    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock().unwrap();
        JobSnapshot {
            status: state.status,
            video_output_path: state.video_output_path.clone(),
            report_output_path: state.report_output_path.clone(),
            error: state.error.clone(),
            counters: *self.progress_rx.borrow(),
        }
    }

    /// Request cancellation. The worker notices at its next frame boundary
    /// and terminates with an error state.
    pub fn cancel(&self) {
        info!("🗑️ Cancellation requested");
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Wait for the in-flight worker, if any, to finish.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Default for AnalysisJob {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Counters;
    use std::sync::mpsc;

    fn paths() -> (PathBuf, PathBuf) {
        (PathBuf::from("out/v.mp4"), PathBuf::from("out/v.csv"))
    }

    #[tokio::test]
    async fn test_rejects_concurrent_submission() {
        let mut job = AnalysisJob::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let (v, r) = paths();
        job.launch(v, r, move |_, _| {
            release_rx.recv().unwrap();
            Ok(())
        })
        .unwrap();

        let (v, r) = paths();
        let second = job.launch(v, r, |_, _| Ok(()));
        assert!(second.is_err());

        release_tx.send(()).unwrap();
        job.join().await;
    }

    #[tokio::test]
    async fn test_completion_state_and_counters() {
        let mut job = AnalysisJob::new();
        let (v, r) = paths();
        job.launch(v, r, |_, mut progress| {
            let mut counters = Counters::default();
            counters.count(crate::types::VehicleClass::Car);
            counters.count(crate::types::VehicleClass::Truck);
            progress.publish(counters, 40, 100);
            Ok(())
        })
        .unwrap();
        job.join().await;

        let snap = job.snapshot();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.counters.total, 2);
        assert_eq!(snap.counters.trucks, 1);
        assert_eq!(snap.counters.progress_percent, 40);
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn test_worker_error_surfaces() {
        let mut job = AnalysisJob::new();
        let (v, r) = paths();
        job.launch(v, r, |_, _| anyhow::bail!("codec chain exhausted"))
            .unwrap();
        job.join().await;

        let snap = job.snapshot();
        assert_eq!(snap.status, JobStatus::Error);
        assert!(snap.error.unwrap().contains("codec chain exhausted"));
    }

    #[tokio::test]
    async fn test_cancel_reaches_worker() {
        let mut job = AnalysisJob::new();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        let (v, r) = paths();
        job.launch(v, r, move |cancel, _| {
            started_tx.send(()).unwrap();
            while !cancel.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            anyhow::bail!("job cancelled")
        })
        .unwrap();

        started_rx.recv().unwrap();
        job.cancel();
        job.join().await;

        let snap = job.snapshot();
        assert_eq!(snap.status, JobStatus::Error);
        assert!(snap.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_resubmit_after_completion() {
        let mut job = AnalysisJob::new();
        let (v, r) = paths();
        job.launch(v, r, |_, _| Ok(())).unwrap();
        job.join().await;

        let (v, r) = paths();
        assert!(job.launch(v, r, |_, _| Ok(())).is_ok());
        job.join().await;
        assert_eq!(job.snapshot().status, JobStatus::Completed);
    }
}
