// src/report.rs
//
// CSV report sink. One row per finalized vehicle, flushed immediately so a
// crash mid-video loses at most the in-flight row.

use crate::registry::ReportRow;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tracing::info;

const HEADER: [&str; 6] = [
    "vehicle_type",
    "color",
    "number_plate",
    "initial_plate",
    "confidence",
    "frame",
];

pub struct ReportSink<W: Write> {
    writer: csv::Writer<W>,
    rows_written: usize,
}

impl ReportSink<std::fs::File> {
    /// Create the report file and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        info!("📋 Report: {}", path.display());
        Self::from_writer(file)
    }
}

impl<W: Write> ReportSink<W> {
    pub fn from_writer(inner: W) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(HEADER)?;
        writer.flush()?;
        Ok(Self {
            writer,
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, row: &ReportRow) -> Result<()> {
        self.writer.write_record([
            row.vehicle_type.as_str(),
            row.color.as_str(),
            row.number_plate.as_str(),
            row.initial_plate.as_str(),
            &format!("{:.2}", row.confidence),
            &row.frame.to_string(),
        ])?;
        self.writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("failed to finish report: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VehicleClass, VehicleColor, PLATE_NOT_DETECTED};

    fn row(plate: &str, initial: &str, confidence: f32) -> ReportRow {
        ReportRow {
            vehicle_type: VehicleClass::Car,
            color: VehicleColor::Blue,
            number_plate: plate.to_string(),
            initial_plate: initial.to_string(),
            confidence,
            frame: 120,
        }
    }

    fn render(rows: &[ReportRow]) -> String {
        let mut sink = ReportSink::from_writer(Vec::new()).unwrap();
        for r in rows {
            sink.write_row(r).unwrap();
        }
        String::from_utf8(sink.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn test_header_written_even_when_empty() {
        let out = render(&[]);
        assert_eq!(
            out.trim_end(),
            "vehicle_type,color,number_plate,initial_plate,confidence,frame"
        );
    }

    #[test]
    fn test_row_formatting() {
        let out = render(&[row("KA01AB1234", "KA01AB123", 0.8765)]);
        let lines: Vec<&str> = out.trim_end().lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "Car,Blue,KA01AB1234,KA01AB123,0.88,120");
    }

    #[test]
    fn test_sentinel_plate_row() {
        let out = render(&[row(PLATE_NOT_DETECTED, PLATE_NOT_DETECTED, 0.5)]);
        assert!(out.contains("Not Detected,Not Detected,0.50,120"));
    }

    #[test]
    fn test_rows_written_counter() {
        let mut sink = ReportSink::from_writer(Vec::new()).unwrap();
        sink.write_row(&row("AB1234", "AB1234", 0.9)).unwrap();
        sink.write_row(&row("CD5678", "CD5678", 0.7)).unwrap();
        assert_eq!(sink.rows_written(), 2);
    }
}
