//! JSON wire format for detection batches.
//!
//! Confidence is written with exactly 4 decimals and box coordinates with 2,
//! as literal JSON numbers. Non-finite values are written as 0.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::value::RawValue;

use crate::detect::{Detection, DetectionBatch};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Serialize)]
struct WireBatch<'a> {
    timestamp: String,
    camera_id: &'a str,
    frame_width: u32,
    frame_height: u32,
    detections: Vec<WireDetection<'a>>,
    detection_count: usize,
}

#[derive(Serialize)]
struct WireDetection<'a> {
    class_id: i32,
    class_name: &'a str,
    confidence: Box<RawValue>,
    bbox: WireBox,
}

#[derive(Serialize)]
struct WireBox {
    x: Box<RawValue>,
    y: Box<RawValue>,
    width: Box<RawValue>,
    height: Box<RawValue>,
}

fn fixed(value: f32, decimals: usize) -> Result<Box<RawValue>> {
    let value = if value.is_finite() { value } else { 0.0 };
    RawValue::from_string(format!("{:.*}", decimals, value))
        .with_context(|| format!("format {} as a JSON number", value))
}

fn wire_detection(det: &Detection) -> Result<WireDetection<'_>> {
    Ok(WireDetection {
        class_id: det.class_id,
        class_name: det.label,
        confidence: fixed(det.confidence, 4)?,
        bbox: WireBox {
            x: fixed(det.bbox.x, 2)?,
            y: fixed(det.bbox.y, 2)?,
            width: fixed(det.bbox.width, 2)?,
            height: fixed(det.bbox.height, 2)?,
        },
    })
}

/// Serialize one batch to its POST body.
pub fn to_wire_json(batch: &DetectionBatch) -> Result<String> {
    let detections = batch
        .detections
        .iter()
        .map(wire_detection)
        .collect::<Result<Vec<_>>>()?;
    let wire = WireBatch {
        timestamp: batch.captured_at.format(TIMESTAMP_FORMAT).to_string(),
        camera_id: &batch.source_id,
        frame_width: batch.frame_width,
        frame_height: batch.frame_height,
        detection_count: detections.len(),
        detections,
    };
    serde_json::to_string(&wire).context("serialize detection batch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use chrono::{TimeZone, Utc};

    fn captured() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap() + chrono::Duration::milliseconds(42)
    }

    #[test]
    fn empty_batch_has_zero_count() -> Result<()> {
        let batch = DetectionBatch::new(Vec::new(), captured(), 640, 480, "camera_0");
        let json = to_wire_json(&batch)?;
        let value: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(value["detection_count"], 0);
        assert_eq!(value["detections"], serde_json::json!([]));
        assert_eq!(value["timestamp"], "2024-03-09T14:05:07.042Z");
        assert_eq!(value["camera_id"], "camera_0");
        assert_eq!(value["frame_width"], 640);
        Ok(())
    }

    #[test]
    fn numbers_have_fixed_precision() -> Result<()> {
        let det = Detection {
            class_id: 2,
            label: "car",
            confidence: 0.876_54,
            bbox: BoundingBox {
                x: 10.0,
                y: 20.126,
                width: 33.3333,
                height: f32::NAN,
            },
        };
        let batch = DetectionBatch::new(vec![det], captured(), 640, 480, "camera_0");
        let json = to_wire_json(&batch)?;
        assert!(json.contains(r#""confidence":0.8765"#), "{json}");
        assert!(json.contains(r#""x":10.00"#), "{json}");
        assert!(json.contains(r#""y":20.13"#), "{json}");
        assert!(json.contains(r#""width":33.33"#), "{json}");
        assert!(json.contains(r#""height":0.00"#), "{json}");
        assert!(json.contains(r#""class_name":"car""#), "{json}");
        assert!(json.ends_with(r#""detection_count":1}"#), "{json}");
        Ok(())
    }
}
