use chrono::{DateTime, Utc};

/// One raw row from the inference engine.
///
/// Coordinates are normalized to the letterboxed input tensor (0..1, ordered
/// x1, y1, x2, y2). Nothing here is validated; the postprocessor copes with
/// out-of-range or non-finite values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawCandidate {
    pub class_id: i32,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RawCandidate {
    pub fn new(class_id: i32, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }
}

/// Axis-aligned box in original-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            return 0.0;
        }
        w * h
    }

    /// Intersection over union; 0 when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// A recognized object instance, immutable once produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub label: &'static str,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Detections from one frame plus the frame's metadata.
#[derive(Clone, Debug)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
    pub captured_at: DateTime<Utc>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub source_id: String,
}

impl DetectionBatch {
    pub fn new(
        detections: Vec<Detection>,
        captured_at: DateTime<Utc>,
        frame_width: u32,
        frame_height: u32,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            detections,
            captured_at,
            frame_width,
            frame_height,
            source_id: source_id.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
