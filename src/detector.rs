// src/detector.rs
//
// Detector/tracker adapter: turns an analyzed frame into a set of
// (track_id, class, bbox, confidence) observations with persistent opaque
// identities.
//
// The ML capability sits behind the DetectorTracker trait so the pipeline
// and tests can substitute deterministic fakes. The production impl pairs a
// YOLOv8 ONNX session (letterbox → [1,84,8400] parse → vehicle-class filter
// → NMS) with a greedy-IoU associator that carries identities across
// analyzed frames and retires them after a bounded coast.

use crate::types::{DetectorConfig, Observation, VehicleClass};
use anyhow::Result;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, info};

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_CLASSES: usize = 80;
const YOLO_PREDICTIONS: usize = 8400;

/// External detection-with-persistent-identity capability. Track ids are
/// opaque: they persist while the implementation can maintain
/// correspondence and may be dropped at any gap.
pub trait DetectorTracker {
    fn detect_and_track(
        &mut self,
        rgb: &[u8],
        width: usize,
        height: usize,
    ) -> Result<Vec<Observation>>;
}

/// Raw per-frame detection before identity assignment.
#[derive(Debug, Clone)]
struct Detection {
    bbox: [f32; 4],
    class: VehicleClass,
    confidence: f32,
}

pub struct YoloTracker {
    session: Session,
    config: DetectorConfig,
    associator: IouAssociator,
}

impl YoloTracker {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        info!("Loading detector model: {}", config.model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&config.model_path)?;

        info!("✓ Vehicle detector initialized");
        let associator = IouAssociator::new(config.match_iou_threshold, config.max_coast_frames);
        Ok(Self {
            session,
            config,
            associator,
        })
    }

    fn preprocess(&self, src: &[u8], src_w: usize, src_h: usize) -> (Vec<f32>, f32, f32, f32) {
        let target = YOLO_INPUT_SIZE;
        let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;
        let pad_x = (target - scaled_w) as f32 / 2.0;
        let pad_y = (target - scaled_h) as f32 / 2.0;

        let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

        // Letterbox onto a gray canvas
        let mut canvas = vec![114u8; target * target * 3];
        for y in 0..scaled_h {
            for x in 0..scaled_w {
                let src_idx = (y * scaled_w + x) * 3;
                let dst_idx = ((y + pad_y as usize) * target + x + pad_x as usize) * 3;
                canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
            }
        }

        // HWC u8 -> CHW f32 in [0,1]
        let mut input = vec![0.0f32; 3 * target * target];
        for c in 0..3 {
            for h in 0..target {
                for w in 0..target {
                    input[c * target * target + h * target + w] =
                        canvas[(h * target + w) * 3 + c] as f32 / 255.0;
                }
            }
        }

        (input, scale, pad_x, pad_y)
    }

    fn infer(&mut self, input: Vec<f32>) -> Result<Vec<f32>> {
        let shape = [1usize, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }

    fn postprocess(&self, output: &[f32], scale: f32, pad_x: f32, pad_y: f32) -> Vec<Detection> {
        let mut detections = Vec::new();

        // Output layout [1, 84, 8400]: 4 bbox rows then 80 class rows
        for i in 0..YOLO_PREDICTIONS {
            let mut max_conf = 0.0f32;
            let mut best_class = 0usize;
            for c in 0..YOLO_CLASSES {
                let conf = output[YOLO_PREDICTIONS * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }

            if max_conf < self.config.confidence_threshold {
                continue;
            }
            let Some(class) = VehicleClass::from_coco_id(best_class) else {
                continue;
            };

            let cx = output[i];
            let cy = output[YOLO_PREDICTIONS + i];
            let w = output[YOLO_PREDICTIONS * 2 + i];
            let h = output[YOLO_PREDICTIONS * 3 + i];

            // Center format -> corners, then undo the letterbox
            let x1 = (cx - w / 2.0 - pad_x) / scale;
            let y1 = (cy - h / 2.0 - pad_y) / scale;
            let x2 = (cx + w / 2.0 - pad_x) / scale;
            let y2 = (cy + h / 2.0 - pad_y) / scale;

            detections.push(Detection {
                bbox: [x1, y1, x2, y2],
                class,
                confidence: max_conf,
            });
        }

        nms(detections, self.config.nms_iou_threshold)
    }
}

impl DetectorTracker for YoloTracker {
    fn detect_and_track(
        &mut self,
        rgb: &[u8],
        width: usize,
        height: usize,
    ) -> Result<Vec<Observation>> {
        let (input, scale, pad_x, pad_y) = self.preprocess(rgb, width, height);
        let output = self.infer(input)?;
        let detections = self.postprocess(&output, scale, pad_x, pad_y);
        debug!("Detector produced {} vehicle box(es)", detections.len());
        Ok(self.associator.assign(detections))
    }
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter <= 0.0 {
        return 0.0;
    }

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    'outer: for det in detections {
        for kept in &keep {
            if iou(&kept.bbox, &det.bbox) >= iou_threshold {
                continue 'outer;
            }
        }
        keep.push(det);
    }
    keep
}

/// Identity record carried between analyzed frames.
struct Identity {
    id: i64,
    bbox: [f32; 4],
    class: VehicleClass,
    missed: u32,
}

/// Greedy IoU association. Matches current detections to the previous
/// frame's identities (same class, best IoU first); unmatched detections
/// open new identities; unmatched identities coast for a bounded number of
/// analyzed frames before retirement. Ids are never reused.
struct IouAssociator {
    identities: Vec<Identity>,
    next_id: i64,
    min_iou: f32,
    max_coast: u32,
}

impl IouAssociator {
    fn new(min_iou: f32, max_coast: u32) -> Self {
        Self {
            identities: Vec::new(),
            next_id: 1,
            min_iou,
            max_coast,
        }
    }

    fn assign(&mut self, detections: Vec<Detection>) -> Vec<Observation> {
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ii, ident) in self.identities.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if ident.class != det.class {
                    continue;
                }
                let score = iou(&ident.bbox, &det.bbox);
                if score >= self.min_iou {
                    pairs.push((ii, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut ident_matched = vec![false; self.identities.len()];
        let mut det_assigned: Vec<Option<i64>> = vec![None; detections.len()];

        for (ii, di, _) in pairs {
            if ident_matched[ii] || det_assigned[di].is_some() {
                continue;
            }
            ident_matched[ii] = true;
            self.identities[ii].bbox = detections[di].bbox;
            self.identities[ii].missed = 0;
            det_assigned[di] = Some(self.identities[ii].id);
        }

        for (di, det) in detections.iter().enumerate() {
            if det_assigned[di].is_none() {
                det_assigned[di] = Some(self.next_id);
                self.identities.push(Identity {
                    id: self.next_id,
                    bbox: det.bbox,
                    class: det.class,
                    missed: 0,
                });
                debug!("🆕 Identity {} opened ({})", self.next_id, det.class.as_str());
                self.next_id += 1;
            }
        }

        for (ii, matched) in ident_matched.iter().enumerate() {
            if !matched {
                self.identities[ii].missed += 1;
            }
        }
        let max_coast = self.max_coast;
        self.identities.retain(|ident| {
            if ident.missed > max_coast {
                debug!("🗑️  Identity {} retired after coasting", ident.id);
                false
            } else {
                true
            }
        });

        detections
            .into_iter()
            .zip(det_assigned)
            .map(|(det, id)| Observation {
                track_id: id.expect("every detection was assigned an id"),
                class: det.class,
                bbox: det.bbox,
                confidence: det.confidence,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, class: VehicleClass) -> Detection {
        Detection {
            bbox: [x1, y1, x2, y2],
            class,
            confidence: 0.8,
        }
    }

    #[test]
    fn test_iou_overlap() {
        let a = [0.0, 0.0, 100.0, 100.0];
        let b = [50.0, 50.0, 150.0, 150.0];
        assert!((iou(&a, &b) - 2500.0 / 17500.0).abs() < 0.01);
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn test_nms_drops_duplicate_boxes() {
        let dets = vec![
            det(0.0, 0.0, 100.0, 100.0, VehicleClass::Car),
            det(5.0, 5.0, 105.0, 105.0, VehicleClass::Car),
            det(300.0, 300.0, 400.0, 400.0, VehicleClass::Truck),
        ];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_associator_persists_identity() {
        let mut assoc = IouAssociator::new(0.2, 3);

        let obs1 = assoc.assign(vec![det(100.0, 100.0, 200.0, 200.0, VehicleClass::Car)]);
        assert_eq!(obs1.len(), 1);
        let id = obs1[0].track_id;

        // Slightly moved box keeps the same identity
        let obs2 = assoc.assign(vec![det(110.0, 105.0, 210.0, 205.0, VehicleClass::Car)]);
        assert_eq!(obs2[0].track_id, id);
    }

    #[test]
    fn test_associator_opens_new_identity_for_new_vehicle() {
        let mut assoc = IouAssociator::new(0.2, 3);

        let obs1 = assoc.assign(vec![det(100.0, 100.0, 200.0, 200.0, VehicleClass::Car)]);
        let obs2 = assoc.assign(vec![
            det(102.0, 100.0, 202.0, 200.0, VehicleClass::Car),
            det(500.0, 300.0, 650.0, 420.0, VehicleClass::Truck),
        ]);
        assert_eq!(obs2.len(), 2);
        let truck = obs2.iter().find(|o| o.class == VehicleClass::Truck).unwrap();
        assert_ne!(truck.track_id, obs1[0].track_id);
    }

    #[test]
    fn test_associator_never_matches_across_classes() {
        let mut assoc = IouAssociator::new(0.2, 3);

        let obs1 = assoc.assign(vec![det(100.0, 100.0, 200.0, 200.0, VehicleClass::Car)]);
        // Same box, different class: must open a fresh identity
        let obs2 = assoc.assign(vec![det(100.0, 100.0, 200.0, 200.0, VehicleClass::Bike)]);
        assert_ne!(obs2[0].track_id, obs1[0].track_id);
    }

    #[test]
    fn test_associator_coasts_then_retires() {
        let mut assoc = IouAssociator::new(0.2, 2);

        let obs1 = assoc.assign(vec![det(100.0, 100.0, 200.0, 200.0, VehicleClass::Car)]);
        let id = obs1[0].track_id;

        // Two empty frames: identity coasts
        assoc.assign(vec![]);
        assoc.assign(vec![]);
        let rescued = assoc.assign(vec![det(105.0, 100.0, 205.0, 200.0, VehicleClass::Car)]);
        assert_eq!(rescued[0].track_id, id, "identity survives within coast");

        // Past the coast limit the identity is gone and the id is not reused
        assoc.assign(vec![]);
        assoc.assign(vec![]);
        assoc.assign(vec![]);
        let fresh = assoc.assign(vec![det(105.0, 100.0, 205.0, 200.0, VehicleClass::Car)]);
        assert_ne!(fresh[0].track_id, id);
    }
}
