//! Detector output post-processing.
//!
//! Raw candidates -> confidence filter -> letterbox inversion -> clamp ->
//! degenerate-box rejection -> confidence ranking -> greedy NMS.
//!
//! Malformed candidates (non-finite values, confidence outside [0, 1]) are
//! capped or skipped individually; a bad row never fails the batch.

use std::cmp::Ordering;

use anyhow::Result;

use crate::detect::letterbox::Letterbox;
use crate::detect::result::{BoundingBox, Detection, RawCandidate};
use crate::labels::class_name;

/// Smallest box side, in original-frame pixels, that survives.
pub const MIN_BOX_SIZE: f32 = 10.0;

/// Whether suppression compares boxes across classes or only within one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NmsPolicy {
    #[default]
    ClassAgnostic,
    PerClass,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostprocessParams {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub min_box_size: f32,
    pub nms_policy: NmsPolicy,
}

impl Default for PostprocessParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            min_box_size: MIN_BOX_SIZE,
            nms_policy: NmsPolicy::ClassAgnostic,
        }
    }
}

/// Turn raw candidates into a deduplicated, confidence-descending list in
/// original-frame pixel coordinates.
pub fn postprocess(
    candidates: &[RawCandidate],
    letterbox: &Letterbox,
    params: &PostprocessParams,
) -> Vec<Detection> {
    let mut detections: Vec<Detection> = candidates
        .iter()
        .filter_map(|candidate| remap_candidate(candidate, letterbox, params))
        .collect();
    rank_by_confidence(&mut detections);
    suppress_sorted(detections, params.nms_threshold, params.nms_policy)
}

/// Convenience form taking the original and letterboxed sizes directly.
#[allow(clippy::too_many_arguments)]
pub fn postprocess_padded(
    candidates: &[RawCandidate],
    original_width: u32,
    original_height: u32,
    letterboxed_width: u32,
    letterboxed_height: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let letterbox = Letterbox::from_padded(
        original_width,
        original_height,
        letterboxed_width,
        letterboxed_height,
    )?;
    let params = PostprocessParams {
        confidence_threshold,
        nms_threshold,
        ..PostprocessParams::default()
    };
    Ok(postprocess(candidates, &letterbox, &params))
}

fn remap_candidate(
    candidate: &RawCandidate,
    letterbox: &Letterbox,
    params: &PostprocessParams,
) -> Option<Detection> {
    if !candidate.confidence.is_finite() {
        return None;
    }
    let confidence = candidate.confidence.clamp(0.0, 1.0);
    if confidence < params.confidence_threshold {
        return None;
    }
    let coords = [candidate.x1, candidate.y1, candidate.x2, candidate.y2];
    if coords.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let (x1, y1) = letterbox.to_original(candidate.x1, candidate.y1);
    let (x2, y2) = letterbox.to_original(candidate.x2, candidate.y2);

    let max_x = letterbox.original_width.saturating_sub(1) as f32;
    let max_y = letterbox.original_height.saturating_sub(1) as f32;
    let x1 = x1.clamp(0.0, max_x);
    let y1 = y1.clamp(0.0, max_y);
    let x2 = x2.clamp(0.0, max_x);
    let y2 = y2.clamp(0.0, max_y);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    if x2 - x1 < params.min_box_size || y2 - y1 < params.min_box_size {
        return None;
    }

    Some(Detection {
        class_id: candidate.class_id,
        label: class_name(candidate.class_id),
        confidence,
        bbox: BoundingBox::from_corners(x1, y1, x2, y2),
    })
}

/// Stable sort, highest confidence first.
fn rank_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
}

/// Greedy non-maximum suppression.
///
/// Input order does not matter; the output is confidence-descending. A box is
/// dropped when its IoU with any already-kept box exceeds `threshold`.
pub fn non_max_suppression(
    mut detections: Vec<Detection>,
    threshold: f32,
    policy: NmsPolicy,
) -> Vec<Detection> {
    rank_by_confidence(&mut detections);
    suppress_sorted(detections, threshold, policy)
}

fn suppress_sorted(detections: Vec<Detection>, threshold: f32, policy: NmsPolicy) -> Vec<Detection> {
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|winner| {
            let comparable = match policy {
                NmsPolicy::ClassAgnostic => true,
                NmsPolicy::PerClass => winner.class_id == candidate.class_id,
            };
            comparable && candidate.bbox.iou(&winner.bbox) > threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::letterbox::InputSpec;

    fn square(w: u32, h: u32) -> Letterbox {
        Letterbox::new(w, h, InputSpec::square(416)).unwrap()
    }

    fn detection(class_id: i32, confidence: f32, x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            class_id,
            label: class_name(class_id),
            confidence,
            bbox: BoundingBox {
                x,
                y,
                width: w,
                height: h,
            },
        }
    }

    #[test]
    fn full_canvas_candidate_inverts_to_full_frame() {
        let lb = square(640, 480);
        let out = postprocess(
            &[RawCandidate::new(0, 0.9, 0.0, 0.0, 1.0, 1.0)],
            &lb,
            &PostprocessParams::default(),
        );
        assert_eq!(out.len(), 1);
        let b = out[0].bbox;
        assert!(b.x.abs() < 1e-3 && b.y.abs() < 1e-3);
        assert!((b.right() - 639.0).abs() < 1e-3);
        assert!((b.bottom() - 479.0).abs() < 1e-3);
    }

    #[test]
    fn keeps_only_confident_candidate_at_same_location() {
        let lb = square(640, 480);
        let params = PostprocessParams {
            confidence_threshold: 0.5,
            ..PostprocessParams::default()
        };
        let out = postprocess(
            &[
                RawCandidate::new(0, 0.9, 0.2, 0.3, 0.5, 0.7),
                RawCandidate::new(0, 0.4, 0.2, 0.3, 0.5, 0.7),
            ],
            &lb,
            &params,
        );
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn rejects_inverted_tiny_and_malformed_boxes() {
        let lb = square(640, 480);
        let out = postprocess(
            &[
                RawCandidate::new(0, 0.9, 0.5, 0.5, 0.4, 0.6),
                RawCandidate::new(0, 0.9, 0.5, 0.5, 0.505, 0.6),
                RawCandidate::new(0, f32::NAN, 0.1, 0.3, 0.5, 0.7),
                RawCandidate::new(0, 0.9, f32::INFINITY, 0.3, 0.5, 0.7),
                RawCandidate::new(0, 0.9, 0.0, 0.0, 0.01, 0.01),
            ],
            &lb,
            &PostprocessParams::default(),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn caps_out_of_range_confidence() {
        let lb = square(640, 480);
        let out = postprocess(
            &[RawCandidate::new(3, 7.5, 0.2, 0.3, 0.5, 0.7)],
            &lb,
            &PostprocessParams::default(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 1.0);
        assert_eq!(out[0].label, "motorcycle");
    }

    #[test]
    fn outputs_stay_inside_frame() {
        let lb = square(320, 200);
        let candidates: Vec<RawCandidate> = (0..40)
            .map(|i| {
                let f = i as f32 / 10.0 - 1.5;
                RawCandidate::new(i % 5, 0.3 + (i as f32) * 0.01, f, f * 0.5, f + 0.8, f + 1.2)
            })
            .collect();
        let out = postprocess(&candidates, &lb, &PostprocessParams::default());
        for det in out {
            assert!(det.bbox.width > 0.0 && det.bbox.height > 0.0);
            assert!(det.bbox.x >= 0.0 && det.bbox.right() < 320.0);
            assert!(det.bbox.y >= 0.0 && det.bbox.bottom() < 200.0);
        }
    }

    #[test]
    fn nms_keeps_higher_confidence_of_overlapping_pair() {
        let out = non_max_suppression(
            vec![
                detection(0, 0.6, 10.0, 10.0, 100.0, 100.0),
                detection(2, 0.8, 12.0, 12.0, 100.0, 100.0),
            ],
            0.45,
            NmsPolicy::ClassAgnostic,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 2);
    }

    #[test]
    fn nms_keeps_pair_below_threshold() {
        let a = detection(0, 0.6, 0.0, 0.0, 100.0, 100.0);
        let b = detection(0, 0.8, 60.0, 0.0, 100.0, 100.0);
        assert!(a.bbox.iou(&b.bbox) <= 0.45);
        let out = non_max_suppression(vec![a, b], 0.45, NmsPolicy::ClassAgnostic);
        assert_eq!(out.len(), 2);
        assert!(out[0].confidence > out[1].confidence);
    }

    #[test]
    fn per_class_policy_keeps_overlapping_different_classes() {
        let out = non_max_suppression(
            vec![
                detection(0, 0.9, 10.0, 10.0, 100.0, 100.0),
                detection(1, 0.8, 10.0, 10.0, 100.0, 100.0),
                detection(1, 0.7, 11.0, 11.0, 100.0, 100.0),
            ],
            0.45,
            NmsPolicy::PerClass,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].class_id, 1);
        assert_eq!(out[1].confidence, 0.8);
    }

    #[test]
    fn nms_is_idempotent() {
        let input: Vec<Detection> = (0..30)
            .map(|i| {
                let offset = (i * 13 % 200) as f32;
                detection(i % 3, 0.3 + (i % 7) as f32 * 0.1, offset, offset / 2.0, 80.0, 60.0)
            })
            .collect();
        let once = non_max_suppression(input, 0.4, NmsPolicy::ClassAgnostic);
        let twice = non_max_suppression(once.clone(), 0.4, NmsPolicy::ClassAgnostic);
        assert_eq!(once, twice);
    }

    #[test]
    fn padded_signature_matches_letterbox_form() -> Result<()> {
        let candidates = [RawCandidate::new(0, 0.9, 0.25, 0.25, 0.75, 0.75)];
        let out = postprocess_padded(&candidates, 640, 480, 416, 416, 0.25, 0.45)?;
        let lb = square(640, 480);
        let expected = postprocess(&candidates, &lb, &PostprocessParams::default());
        assert_eq!(out.len(), 1);
        assert!((out[0].bbox.x - expected[0].bbox.x).abs() < 1.0);
        assert!((out[0].bbox.y - expected[0].bbox.y).abs() < 1.0);
        Ok(())
    }
}
