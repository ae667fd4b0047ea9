use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel space of the original image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.w as f32 * self.h as f32
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) as f32 * (y2 - y1) as f32;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Clamp to a `width` x `height` image. Returns `None` when nothing is left.
    pub fn clamp(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.w.min(width - self.x);
        let h = self.h.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(BoundingBox { x: self.x, y: self.y, w, h })
    }
}

/// Raw detector output before thresholding, NMS and the per-image cap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub face_id: i64,
    pub image_id: i64,
    pub ordinal: i64,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub face_id: i64,
    pub vector: Vec<f32>,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub event_id: String,
    pub face_id: i64,
    pub image_id: i64,
    #[serde(skip_serializing, default)]
    pub embedding: Vec<f32>,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    #[serde(flatten)]
    pub entry: IndexEntry,
    pub distance: f32,
}

/// One photo in a selfie search result, at its best face distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoMatch {
    pub image_id: i64,
    pub face_id: i64,
    pub distance: f32,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox { x: 10, y: 10, w: 20, h: 20 };
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox { x: 0, y: 0, w: 10, h: 10 };
        let b = BoundingBox { x: 20, y: 20, w: 10, h: 10 };
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn clamp_trims_to_image() {
        let b = BoundingBox { x: 90, y: 5, w: 30, h: 10 };
        assert_eq!(b.clamp(100, 100), Some(BoundingBox { x: 90, y: 5, w: 10, h: 10 }));
        assert_eq!(b.clamp(50, 50), None);
    }
}
