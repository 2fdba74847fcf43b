/// One predicted object in pixel coordinates of the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2 && (0.0..=1.0).contains(&self.confidence)
    }
}

fn intersection(box1: &Detection, box2: &Detection) -> f32 {
    let w = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.0);
    let h = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.0);
    w * h
}

fn union(box1: &Detection, box2: &Detection) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

pub fn iou(box1: &Detection, box2: &Detection) -> f32 {
    let union = union(box1, box2);
    if union <= 0.0 {
        return 0.0;
    }
    intersection(box1, box2) / union
}

/// Greedy per-class non-maximum suppression.
///
/// Boxes are visited by descending confidence; a box is dropped when it
/// overlaps an already kept box of the same class by `iou_threshold` or more.
/// Whether a box survives only depends on boxes with a higher confidence, so
/// pre-filtering by a confidence threshold commutes with this function.
pub fn non_max_suppression(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(k, &candidate) >= iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
