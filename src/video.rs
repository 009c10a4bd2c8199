// src/video.rs
//
// Video decode/encode edges of the pipeline: sequential frame source with
// stream properties, and an output writer opened through an ordered codec
// fallback chain (VP9 → VP8 → mp4v by default; the first codec that opens
// is used for the whole job).

use anyhow::Result;
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTraitConst, VideoWriter},
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub struct VideoProcessor {
    max_output_width: i32,
    codec_chain: Vec<String>,
}

impl VideoProcessor {
    pub fn new(max_output_width: i32, codec_chain: Vec<String>) -> Self {
        Self {
            max_output_width,
            codec_chain,
        }
    }

    pub fn find_video_files(&self, input_dir: &str) -> Result<Vec<PathBuf>> {
        let mut videos = Vec::new();
        let video_extensions = ["mp4", "avi", "mov", "mkv", "webm"];

        for entry in WalkDir::new(input_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if video_extensions.contains(&ext.to_ascii_lowercase().as_str()) {
                    videos.push(path.to_path_buf());
                }
            }
        }

        videos.sort();
        info!("Found {} video file(s)", videos.len());
        Ok(videos)
    }

    pub fn open_video(&self, path: &Path) -> Result<VideoReader> {
        info!("Opening video: {}", path.display());

        let cap = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            anyhow::bail!("failed to open input video {}", path.display());
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let fps = if fps > 0.0 { fps } else { 30.0 };
        let total_frames =
            VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)?.max(0.0) as u64;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        let (out_width, out_height) = output_size(width, height, self.max_output_width);

        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames (output {}x{})",
            width, height, fps, total_frames, out_width, out_height
        );

        Ok(VideoReader {
            cap,
            fps,
            total_frames,
            current_frame: 0,
            width,
            height,
            out_width,
            out_height,
        })
    }

    /// Open the output writer through the codec fallback chain. All codecs
    /// failing is a fatal initialization error, raised before any frame of
    /// the job is read.
    pub fn create_writer(
        &self,
        output_path: &Path,
        fps: f64,
        out_width: i32,
        out_height: i32,
    ) -> Result<VideoWriter> {
        if let Some(dir) = output_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let (fourcc, writer) = select_codec(&self.codec_chain, |fourcc| {
            let mut chars = fourcc.chars();
            let (Some(c1), Some(c2), Some(c3), Some(c4)) =
                (chars.next(), chars.next(), chars.next(), chars.next())
            else {
                warn!("Skipping malformed fourcc '{}'", fourcc);
                return Ok(None);
            };

            let code = VideoWriter::fourcc(c1, c2, c3, c4)?;
            let writer = VideoWriter::new(
                &output_path.to_string_lossy(),
                code,
                fps,
                Size::new(out_width, out_height),
                true,
            )?;

            if writer.is_opened()? {
                Ok(Some(writer))
            } else {
                Ok(None)
            }
        })
        .map_err(|e| anyhow::anyhow!("{} for {}", e, output_path.display()))?;

        info!("🎬 Output writer opened with codec '{}'", fourcc);
        Ok(writer)
    }
}

/// Try each codec of the fallback chain in order; the first attempt that
/// yields a writer wins and later codecs are never tried. Exhausting the
/// chain is an error.
fn select_codec<T, F>(chain: &[String], mut attempt: F) -> Result<(String, T)>
where
    F: FnMut(&str) -> Result<Option<T>>,
{
    for fourcc in chain {
        if let Some(writer) = attempt(fourcc)? {
            return Ok((fourcc.clone(), writer));
        }
        warn!("Codec '{}' failed to open, trying next", fourcc);
    }
    anyhow::bail!("no codec in the fallback chain {:?} could open a writer", chain)
}

/// Cap width at `max_width` with proportional height.
pub fn output_size(width: i32, height: i32, max_width: i32) -> (i32, i32) {
    if width > max_width {
        let scale = max_width as f64 / width as f64;
        (max_width, (height as f64 * scale).round() as i32)
    } else {
        (width, height)
    }
}

pub struct VideoReader {
    cap: VideoCapture,
    pub fps: f64,
    pub total_frames: u64,
    pub current_frame: u64,
    pub width: i32,
    pub height: i32,
    pub out_width: i32,
    pub out_height: i32,
}

impl VideoReader {
    /// Read the next frame, already resized to the output dimensions.
    /// Returns None at end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Mat>> {
        use opencv::videoio::VideoCaptureTrait;

        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }
        self.current_frame += 1;

        if mat.cols() != self.out_width || mat.rows() != self.out_height {
            let mut resized = Mat::default();
            imgproc::resize(
                &mat,
                &mut resized,
                Size::new(self.out_width, self.out_height),
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;
            return Ok(Some(resized));
        }
        Ok(Some(mat))
    }
}

/// BGR Mat to a packed RGB byte buffer for the detector and color paths.
/// `cvt_color` always produces a freshly-allocated continuous Mat.
pub fn mat_to_rgb(frame: &Mat) -> Result<Vec<u8>> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    Ok(rgb.data_bytes()?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_size_caps_width() {
        assert_eq!(output_size(3840, 2160, 1920), (1920, 1080));
        assert_eq!(output_size(1280, 720, 1920), (1280, 720));
        assert_eq!(output_size(1920, 1080, 1920), (1920, 1080));
    }

    #[test]
    fn test_output_size_rounds_height() {
        let (w, h) = output_size(1921, 1080, 1920);
        assert_eq!(w, 1920);
        assert_eq!(h, 1079); // 1080 * 1920/1921 rounded
    }

    fn chain() -> Vec<String> {
        vec!["vp09".to_string(), "vp80".to_string(), "mp4v".to_string()]
    }

    #[test]
    fn test_codec_fallback_tries_second_when_first_fails() {
        let mut attempted = Vec::new();
        let result = select_codec(&chain(), |fourcc| {
            attempted.push(fourcc.to_string());
            if fourcc == "vp80" {
                Ok(Some("opened"))
            } else {
                Ok(None)
            }
        });

        let (fourcc, writer) = result.unwrap();
        assert_eq!(fourcc, "vp80");
        assert_eq!(writer, "opened");
        assert_eq!(attempted, ["vp09", "vp80"]);
    }

    #[test]
    fn test_codec_fallback_keeps_first_success() {
        let mut attempted = Vec::new();
        let (fourcc, _) = select_codec(&chain(), |fourcc| {
            attempted.push(fourcc.to_string());
            Ok(Some(()))
        })
        .unwrap();

        assert_eq!(fourcc, "vp09");
        assert_eq!(attempted, ["vp09"], "later codecs must not be tried");
    }

    #[test]
    fn test_codec_fallback_exhaustion_is_fatal() {
        let mut attempted = Vec::new();
        let result = select_codec::<(), _>(&chain(), |fourcc| {
            attempted.push(fourcc.to_string());
            Ok(None)
        });

        assert_eq!(attempted, ["vp09", "vp80", "mp4v"]);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("fallback chain"), "{}", err);
    }

    #[test]
    fn test_codec_fallback_propagates_attempt_error() {
        let result = select_codec::<(), _>(&chain(), |fourcc| {
            if fourcc == "vp09" {
                anyhow::bail!("encoder backend unavailable")
            }
            Ok(Some(()))
        });
        assert!(result.is_err());
    }
}
