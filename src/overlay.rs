// src/overlay.rs
//
// Annotation drawing for the output video. Green box with the class label
// while a vehicle has no plate read yet; once a plate is known the box turns
// yellow and the label switches to the plate text.

use crate::registry::TrackRegistry;
use crate::types::Observation;
use anyhow::Result;
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};

const GREEN: (f64, f64, f64) = (0.0, 255.0, 0.0);
const YELLOW: (f64, f64, f64) = (0.0, 255.0, 255.0);

/// Draw boxes and labels for every observation on the current frame.
pub fn draw_observations(
    frame: &mut Mat,
    observations: &[Observation],
    registry: &TrackRegistry,
) -> Result<()> {
    for obs in observations {
        let (label, color) = match registry.live_track(obs.track_id) {
            Some(track) if track.best_plate.is_some() => {
                (track.best_plate_label().to_string(), YELLOW)
            }
            _ => (obs.class.as_str().to_string(), GREEN),
        };
        draw_box(frame, &obs.bbox, &label, color)?;
    }
    Ok(())
}

fn draw_box(frame: &mut Mat, bbox: &[f32; 4], label: &str, color: (f64, f64, f64)) -> Result<()> {
    let x1 = (bbox[0].max(0.0) as i32).min(frame.cols() - 1);
    let y1 = (bbox[1].max(0.0) as i32).min(frame.rows() - 1);
    let x2 = (bbox[2].max(0.0) as i32).min(frame.cols() - 1);
    let y2 = (bbox[3].max(0.0) as i32).min(frame.rows() - 1);
    if x2 <= x1 || y2 <= y1 {
        return Ok(());
    }

    let box_color = Scalar::new(color.0, color.1, color.2, 0.0);
    imgproc::rectangle(
        frame,
        Rect::new(x1, y1, x2 - x1, y2 - y1),
        box_color,
        2,
        imgproc::LINE_8,
        0,
    )?;

    let font = imgproc::FONT_HERSHEY_SIMPLEX;
    let scale = 0.6;
    let thickness = 2;
    let mut baseline = 0;
    let text_size = imgproc::get_text_size(label, font, scale, thickness, &mut baseline)?;

    // Label background sits above the box, or inside it at the top edge
    let bg_top = (y1 - text_size.height - baseline - 4).max(0);
    imgproc::rectangle(
        frame,
        Rect::new(
            x1,
            bg_top,
            (text_size.width + 8).min(frame.cols() - x1),
            text_size.height + baseline + 4,
        ),
        box_color,
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )?;

    imgproc::put_text(
        frame,
        label,
        Point::new(x1 + 4, bg_top + text_size.height + 2),
        font,
        scale,
        Scalar::new(0.0, 0.0, 0.0, 0.0),
        thickness,
        imgproc::LINE_AA,
        false,
    )?;

    Ok(())
}
