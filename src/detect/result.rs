use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-image pixel coordinates.
///
/// Serialized as `[x1, y1, x2, y2]`. Construction orders the corners so that
/// `x1 <= x2` and `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Build from a center/size box, the layout YOLO-style heads emit.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection over union; 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One predicted object instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    /// Confidence is clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}

/// Greedy per-class non-maximum suppression.
///
/// Output is ordered by descending confidence.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
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

    #[test]
    fn bbox_orders_corners() {
        let b = BoundingBox::new(10.0, 20.0, 2.0, 4.0);
        assert_eq!(b, BoundingBox::new(2.0, 4.0, 10.0, 20.0));
        assert_eq!(b.width(), 8.0);
        assert_eq!(b.height(), 16.0);
    }

    #[test]
    fn bbox_serializes_as_array() {
        let b = BoundingBox::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(serde_json::to_string(&b).unwrap(), "[1.0,2.0,3.0,4.0]");
        let back: BoundingBox = serde_json::from_str("[3.0,4.0,1.0,2.0]").unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn confidence_is_clamped() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(Detection::new(0, 1.7, bbox).confidence, 1.0);
        assert_eq!(Detection::new(0, -0.2, bbox).confidence, 0.0);
        assert_eq!(Detection::new(0, f32::NAN, bbox).confidence, 0.0);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn nms_keeps_best_overlap_per_class() {
        let a = Detection::new(1, 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        let b = Detection::new(1, 0.6, BoundingBox::new(1.0, 1.0, 10.0, 10.0));
        // same place, different class: survives
        let c = Detection::new(0, 0.5, BoundingBox::new(1.0, 1.0, 10.0, 10.0));
        let kept = non_max_suppression(vec![b, c.clone(), a.clone()], 0.5);
        assert_eq!(kept, vec![a, c]);
    }
}
