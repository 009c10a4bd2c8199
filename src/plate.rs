// src/plate.rs
//
// License-plate text extraction with multi-variant preprocessing.
//
// Plates sit in the lower-middle band of a vehicle bbox, so the extractor
// takes a fixed fractional sub-region (40-85% height, 5-95% width), pads it,
// and produces three enhancement variants at a 2x upscale: Otsu-binarized
// sharpened, CLAHE-equalized sharpened, and raw grayscale (filters sometimes
// destroy the very features they are meant to enhance). The external
// text-recognition capability runs on each variant; the highest-confidence
// cleaned alphanumeric candidate of length >= 4 wins.

use crate::types::{OcrConfig, PlateRead};
use anyhow::Result;
use opencv::{
    core::{self, Mat, Point, Scalar, Size, BORDER_CONSTANT},
    imgproc,
    prelude::*,
};
use tracing::{debug, info, warn};

/// Plate band inside the vehicle crop.
const BAND_TOP: f32 = 0.40;
const BAND_BOTTOM: f32 = 0.85;
const BAND_LEFT: f32 = 0.05;
const BAND_RIGHT: f32 = 0.95;

/// Crops narrower than this fraction of the output frame width cannot
/// plausibly contain readable text.
const MIN_WIDTH_FRACTION: f32 = 0.05;

/// Candidates shorter than this after cleaning are rejected.
const MIN_PLATE_LEN: usize = 4;

const ALPHANUMERIC: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// One raw candidate from the text-recognition capability.
#[derive(Debug, Clone)]
pub struct TextCandidate {
    pub text: String,
    pub confidence: f32,
}

/// External text-recognition capability, restricted to the alphanumeric
/// charset by contract. One call per preprocessed variant.
pub trait TextRecognizer {
    fn recognize(&mut self, image: &Mat) -> Result<Vec<TextCandidate>>;
}

pub struct PlateExtractor;

impl PlateExtractor {
    /// Attempt one plate read for a vehicle bbox on the given BGR frame.
    /// Returns None when the crop is too small, no variant yields a
    /// candidate, or every candidate is too short. A recognizer failure on
    /// a single variant is recovered; it only loses that variant.
    pub fn read_plate(
        recognizer: &mut dyn TextRecognizer,
        frame: &Mat,
        bbox: &[f32; 4],
        out_width: i32,
    ) -> Result<Option<PlateRead>> {
        let Some(crop) = clamp_roi(frame, bbox)? else {
            return Ok(None);
        };
        let (w, h) = (crop.cols(), crop.rows());
        if (w as f32) < out_width as f32 * MIN_WIDTH_FRACTION {
            return Ok(None);
        }

        // Plate band sub-region
        let by1 = (h as f32 * BAND_TOP) as i32;
        let by2 = (h as f32 * BAND_BOTTOM) as i32;
        let bx1 = (w as f32 * BAND_LEFT) as i32;
        let bx2 = (w as f32 * BAND_RIGHT) as i32;
        if bx2 <= bx1 || by2 <= by1 {
            return Ok(None);
        }
        let band = Mat::roi(&crop, core::Rect::new(bx1, by1, bx2 - bx1, by2 - by1))?;

        // Width-proportional constant border, so characters at the crop edge
        // are not lost to the recognizer's receptive field
        let pad = (out_width / 100).max(5);
        let mut padded = Mat::default();
        core::copy_make_border(
            &band,
            &mut padded,
            pad,
            pad,
            pad,
            pad,
            BORDER_CONSTANT,
            Scalar::all(0.0),
        )?;

        let mut gray = Mat::default();
        imgproc::cvt_color(&padded, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;

        // Sharpening kernel
        let kernel = Mat::from_slice_2d(&[[0.0f32, -1.0, 0.0], [-1.0, 5.0, -1.0], [0.0, -1.0, 0.0]])?;
        let mut sharpened = Mat::default();
        imgproc::filter_2d(
            &gray,
            &mut sharpened,
            -1,
            &kernel,
            Point::new(-1, -1),
            0.0,
            core::BORDER_DEFAULT,
        )?;

        let mut upscaled = Mat::default();
        imgproc::resize(
            &sharpened,
            &mut upscaled,
            Size::new(0, 0),
            2.0,
            2.0,
            imgproc::INTER_CUBIC,
        )?;

        let mut otsu = Mat::default();
        imgproc::threshold(
            &upscaled,
            &mut otsu,
            0.0,
            255.0,
            imgproc::THRESH_BINARY + imgproc::THRESH_OTSU,
        )?;

        let mut clahe = imgproc::create_clahe(2.0, Size::new(8, 8))?;
        let mut equalized = Mat::default();
        clahe.apply(&upscaled, &mut equalized)?;

        let mut raw_upscaled = Mat::default();
        imgproc::resize(
            &gray,
            &mut raw_upscaled,
            Size::new(0, 0),
            2.0,
            2.0,
            imgproc::INTER_CUBIC,
        )?;

        let mut candidates = Vec::new();
        for variant in [&otsu, &equalized, &raw_upscaled] {
            match recognizer.recognize(variant) {
                Ok(mut found) => candidates.append(&mut found),
                Err(e) => debug!("Recognizer failed on a variant: {}", e),
            }
        }

        Ok(select_best_candidate(candidates))
    }
}

/// Clamp a float bbox to the frame and return the ROI, or None for
/// degenerate boxes.
fn clamp_roi(frame: &Mat, bbox: &[f32; 4]) -> Result<Option<Mat>> {
    let x1 = (bbox[0].max(0.0) as i32).min(frame.cols() - 1);
    let y1 = (bbox[1].max(0.0) as i32).min(frame.rows() - 1);
    let x2 = (bbox[2].max(0.0) as i32).min(frame.cols());
    let y2 = (bbox[3].max(0.0) as i32).min(frame.rows());
    if x2 <= x1 || y2 <= y1 {
        return Ok(None);
    }
    let roi = Mat::roi(frame, core::Rect::new(x1, y1, x2 - x1, y2 - y1))?;
    Ok(Some(roi.try_clone()?))
}

/// Uppercase and strip the separators recognizers tend to hallucinate.
fn clean_candidate(text: &str) -> String {
    text.to_uppercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '.' | '-'))
        .collect()
}

/// Highest-confidence cleaned candidate of qualifying length, if any.
fn select_best_candidate(candidates: Vec<TextCandidate>) -> Option<PlateRead> {
    let mut best: Option<PlateRead> = None;
    for candidate in candidates {
        let clean = clean_candidate(&candidate.text);
        if clean.len() < MIN_PLATE_LEN {
            continue;
        }
        if best
            .as_ref()
            .map_or(true, |b| candidate.confidence > b.confidence)
        {
            best = Some(PlateRead {
                text: clean,
                confidence: candidate.confidence,
            });
        }
    }
    best
}

/// CTC-style recognition session: grayscale strip at a fixed input height,
/// greedy argmax decode over the alphanumeric charset with a leading blank,
/// confidence = mean probability of the kept steps.
pub struct OrtTextRecognizer {
    session: ort::session::Session,
    input_height: usize,
    input_width: usize,
}

impl OrtTextRecognizer {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        info!("Loading text recognition model: {}", config.model_path);
        let session = ort::session::Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(&config.model_path)?;
        info!("✓ Text recognizer initialized");
        Ok(Self {
            session,
            input_height: 48,
            input_width: 320,
        })
    }

    fn prepare_input(&self, image: &Mat) -> Result<Vec<f32>> {
        let mut gray = Mat::default();
        if image.channels() == 3 {
            imgproc::cvt_color(image, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
        } else {
            gray = image.try_clone()?;
        }

        let mut resized = Mat::default();
        imgproc::resize(
            &gray,
            &mut resized,
            Size::new(self.input_width as i32, self.input_height as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let bytes = resized.data_bytes()?;
        Ok(bytes.iter().map(|&b| b as f32 / 127.5 - 1.0).collect())
    }

}

/// Greedy CTC decode: softmax + argmax per step, collapse repeats, drop
/// blanks (class 0). Confidence is the mean post-softmax probability of the
/// kept steps, so it stays in [0,1] whether the model's last layer is a
/// softmax or raw logits.
fn ctc_greedy_decode(logits: &[f32], steps: usize, classes: usize) -> Option<TextCandidate> {
    let charset: Vec<char> = ALPHANUMERIC.chars().collect();
    let mut text = String::new();
    let mut confidences = Vec::new();
    let mut prev_class = 0usize;

    for t in 0..steps {
        let row = &logits[t * classes..(t + 1) * classes];
        let (best_class, best_prob) = softmax_argmax(row);

        if best_class != 0 && best_class != prev_class {
            if let Some(&ch) = charset.get(best_class - 1) {
                text.push(ch);
                confidences.push(best_prob);
            }
        }
        prev_class = best_class;
    }

    if text.is_empty() {
        return None;
    }
    let confidence = confidences.iter().sum::<f32>() / confidences.len() as f32;
    Some(TextCandidate { text, confidence })
}

/// Argmax of one timestep with its softmax probability, max-subtracted for
/// numerical stability.
fn softmax_argmax(row: &[f32]) -> (usize, f32) {
    let (best_class, best_score) =
        row.iter()
            .enumerate()
            .fold((0usize, f32::MIN), |(bi, bs), (i, &s)| {
                if s > bs {
                    (i, s)
                } else {
                    (bi, bs)
                }
            });
    let denom: f32 = row.iter().map(|&s| (s - best_score).exp()).sum();
    (best_class, 1.0 / denom)
}

impl TextRecognizer for OrtTextRecognizer {
    fn recognize(&mut self, image: &Mat) -> Result<Vec<TextCandidate>> {
        let input = self.prepare_input(image)?;
        let shape = [1usize, 1, self.input_height, self.input_width];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["x" => input_value])?;
        let (dims, data) = outputs[0].try_extract_tensor::<f32>()?;

        // Expected [1, steps, classes]
        if dims.len() != 3 {
            warn!("Unexpected recognizer output rank {}", dims.len());
            return Ok(Vec::new());
        }
        let steps = dims[1] as usize;
        let classes = dims[2] as usize;
        if classes != ALPHANUMERIC.len() + 1 {
            warn!(
                "Recognizer charset mismatch: model has {} classes",
                classes
            );
            return Ok(Vec::new());
        }

        Ok(ctc_greedy_decode(data, steps, classes).into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, confidence: f32) -> TextCandidate {
        TextCandidate {
            text: text.to_string(),
            confidence,
        }
    }

    #[test]
    fn test_clean_candidate_strips_separators() {
        assert_eq!(clean_candidate("ka 01-ab.1234"), "KA01AB1234");
        assert_eq!(clean_candidate("AB 12"), "AB12");
    }

    #[test]
    fn test_select_rejects_short_candidates() {
        let result = select_best_candidate(vec![
            candidate("AB1", 0.99),
            candidate("X-Y", 0.95),
        ]);
        assert!(result.is_none());
    }

    #[test]
    fn test_select_picks_highest_confidence() {
        let result = select_best_candidate(vec![
            candidate("AB1234", 0.41),
            candidate("AB1234Z", 0.67),
            candidate("AB1Z34", 0.52),
        ])
        .unwrap();
        assert_eq!(result.text, "AB1234Z");
        assert!((result.confidence - 0.67).abs() < 1e-6);
    }

    #[test]
    fn test_select_cleaning_precedes_length_bar() {
        // "A B 1" cleans to "AB1" (too short); "A B 1 2" cleans to "AB12"
        let result = select_best_candidate(vec![
            candidate("A B 1", 0.9),
            candidate("A B 1 2", 0.4),
        ])
        .unwrap();
        assert_eq!(result.text, "AB12");
    }

    #[test]
    fn test_select_empty_input() {
        assert!(select_best_candidate(Vec::new()).is_none());
    }

    #[test]
    fn test_ctc_decode_collapses_repeats_and_blanks() {
        // charset index 1 = '0', 11 = 'A', 12 = 'B' (blank at 0)
        let recognizer_charset: Vec<char> = ALPHANUMERIC.chars().collect();
        assert_eq!(recognizer_charset[10], 'A');
        assert_eq!(recognizer_charset[11], 'B');

        let classes = ALPHANUMERIC.len() + 1;
        // Steps: A, A, blank, B → "AB"
        let mut logits = vec![0.0f32; 4 * classes];
        logits[11] = 5.0; // t0: 'A'
        logits[classes + 11] = 5.0; // t1: 'A' (repeat, collapsed)
        logits[2 * classes] = 5.0; // t2: blank
        logits[3 * classes + 12] = 5.0; // t3: 'B'

        let decoded = ctc_greedy_decode(&logits, 4, classes).unwrap();
        assert_eq!(decoded.text, "AB");
        assert!(decoded.confidence > 0.0 && decoded.confidence <= 1.0);
    }

    #[test]
    fn test_ctc_confidence_is_a_probability_for_logit_input() {
        // A model without a softmax head emits large raw logits; the decoded
        // confidence must still be a probability, or it would beat the
        // acceptance threshold and every prior best read unconditionally.
        let classes = ALPHANUMERIC.len() + 1;
        let mut logits = vec![0.0f32; 2 * classes];
        logits[11] = 8.3; // t0: 'A', far from softmax output
        logits[classes + 15] = 12.7; // t1: 'E'

        let decoded = ctc_greedy_decode(&logits, 2, classes).unwrap();
        assert_eq!(decoded.text, "AE");
        assert!(decoded.confidence <= 1.0, "confidence {}", decoded.confidence);
        assert!(decoded.confidence > 0.5, "dominant logits decode confidently");
    }

    #[test]
    fn test_ctc_confidence_tracks_step_certainty() {
        let classes = ALPHANUMERIC.len() + 1;
        // Near-uniform row: the winning class is barely ahead
        let mut weak = vec![0.0f32; classes];
        weak[11] = 0.01;
        let (_, weak_prob) = softmax_argmax(&weak);

        let mut strong = vec![0.0f32; classes];
        strong[11] = 10.0;
        let (_, strong_prob) = softmax_argmax(&strong);

        assert!(weak_prob < 0.1);
        assert!(strong_prob > 0.99);
    }

    #[test]
    fn test_ctc_decode_all_blanks_is_none() {
        let classes = ALPHANUMERIC.len() + 1;
        let mut logits = vec![0.0f32; 3 * classes];
        for t in 0..3 {
            logits[t * classes] = 5.0;
        }
        assert!(ctc_greedy_decode(&logits, 3, classes).is_none());
    }
}
