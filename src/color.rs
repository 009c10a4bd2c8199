// src/color.rs
//
// HSV-based vehicle color classification.
//
// Works on a centered sub-crop of the vehicle bounding box (background and
// road pixels dominate the edges of a detector bbox, so the outer band is
// excluded). Each palette color is a set of HSV ranges; the color with the
// most in-range pixels wins, provided it covers at least 30% of the
// sub-crop. Deterministic for identical input pixels.

use crate::types::VehicleColor;

/// Centered sub-crop fractions: rows 20%..75%, columns 25%..75% of the bbox.
const CROP_TOP: f32 = 0.20;
const CROP_BOTTOM: f32 = 0.75;
const CROP_LEFT: f32 = 0.25;
const CROP_RIGHT: f32 = 0.75;

/// Winning color must cover at least this fraction of the sub-crop.
const MIN_COVERAGE: f32 = 0.30;

/// One inclusive HSV range. H in degrees 0-360, S 0-100, V 0-255.
struct HsvRange {
    h: (f32, f32),
    s: (f32, f32),
    v: (f32, f32),
}

impl HsvRange {
    fn contains(&self, h: f32, s: f32, v: f32) -> bool {
        h >= self.h.0 && h <= self.h.1 && s >= self.s.0 && s <= self.s.1 && v >= self.v.0 && v <= self.v.1
    }
}

/// Palette ranges. Red needs two ranges because its hue wraps the origin.
const PALETTE: [(VehicleColor, &[HsvRange]); 5] = [
    (
        VehicleColor::White,
        &[HsvRange { h: (0.0, 360.0), s: (0.0, 20.0), v: (180.0, 255.0) }],
    ),
    (
        VehicleColor::Black,
        &[HsvRange { h: (0.0, 360.0), s: (0.0, 100.0), v: (0.0, 50.0) }],
    ),
    (
        VehicleColor::Red,
        &[
            HsvRange { h: (0.0, 20.0), s: (27.0, 100.0), v: (50.0, 255.0) },
            HsvRange { h: (340.0, 360.0), s: (27.0, 100.0), v: (50.0, 255.0) },
        ],
    ),
    (
        VehicleColor::Blue,
        &[HsvRange { h: (200.0, 280.0), s: (58.0, 100.0), v: (0.0, 255.0) }],
    ),
    (
        VehicleColor::Gray,
        &[HsvRange { h: (0.0, 360.0), s: (0.0, 20.0), v: (50.0, 180.0) }],
    ),
];

/// Convert RGB to HSV. Returns (H: 0-360, S: 0-100, V: 0-255).
#[inline]
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let r_n = r / 255.0;
    let g_n = g / 255.0;
    let b_n = b / 255.0;

    let max = r_n.max(g_n).max(b_n);
    let min = r_n.min(g_n).min(b_n);
    let delta = max - min;

    let h = if delta < 1e-6 {
        0.0
    } else if (max - r_n).abs() < 1e-6 {
        60.0 * (((g_n - b_n) / delta) % 6.0)
    } else if (max - g_n).abs() < 1e-6 {
        60.0 * (((b_n - r_n) / delta) + 2.0)
    } else {
        60.0 * (((r_n - g_n) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let s = if max < 1e-6 { 0.0 } else { (delta / max) * 100.0 };
    let v = max * 255.0;

    (h, s, v)
}

/// Classify the dominant color of a vehicle crop given the full RGB frame
/// and the vehicle's bounding box. Degenerate boxes return the default.
pub fn classify_vehicle_color(
    frame_rgb: &[u8],
    width: usize,
    height: usize,
    bbox: &[f32; 4],
) -> VehicleColor {
    let x1 = (bbox[0].max(0.0) as usize).min(width.saturating_sub(1));
    let y1 = (bbox[1].max(0.0) as usize).min(height.saturating_sub(1));
    let x2 = (bbox[2].max(0.0) as usize).min(width);
    let y2 = (bbox[3].max(0.0) as usize).min(height);

    if x2 <= x1 || y2 <= y1 {
        return VehicleColor::Blue;
    }

    let bw = x2 - x1;
    let bh = y2 - y1;

    // Centered sub-crop inside the bbox
    let cy1 = y1 + (bh as f32 * CROP_TOP) as usize;
    let cy2 = y1 + (bh as f32 * CROP_BOTTOM) as usize;
    let cx1 = x1 + (bw as f32 * CROP_LEFT) as usize;
    let cx2 = x1 + (bw as f32 * CROP_RIGHT) as usize;

    if cx2 <= cx1 || cy2 <= cy1 {
        return VehicleColor::Blue;
    }

    let total = ((cx2 - cx1) * (cy2 - cy1)) as f32;
    let mut counts = [0u32; PALETTE.len()];

    for y in cy1..cy2 {
        for x in cx1..cx2 {
            let idx = (y * width + x) * 3;
            if idx + 2 >= frame_rgb.len() {
                continue;
            }
            let (h, s, v) = rgb_to_hsv(
                frame_rgb[idx] as f32,
                frame_rgb[idx + 1] as f32,
                frame_rgb[idx + 2] as f32,
            );
            for (ci, (_, ranges)) in PALETTE.iter().enumerate() {
                if ranges.iter().any(|r| r.contains(h, s, v)) {
                    counts[ci] += 1;
                }
            }
        }
    }

    let mut best = VehicleColor::Blue;
    let mut max_pixels = 0u32;
    for (ci, (color, _)) in PALETTE.iter().enumerate() {
        if counts[ci] > max_pixels && counts[ci] as f32 / total > MIN_COVERAGE {
            max_pixels = counts[ci];
            best = *color;
        }
    }
    best
}
