use wing_proto::PixelBox;

use crate::Detection;

pub fn iou(a: &PixelBox, b: &PixelBox) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.width() * a.height() + b.width() * b.height() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy per-class NMS, highest confidence first.
pub fn nms_filter(mut dets: Vec<Detection>, iou_th: f32, max_det: usize) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<Detection> = Vec::new();

    'outer: for d in dets {
        for k in &kept {
            if k.class_id == d.class_id && iou(&d.bbox, &k.bbox) >= iou_th {
                continue 'outer;
            }
        }
        kept.push(d);
        if kept.len() >= max_det {
            break;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: i32, confidence: f32, x: f32) -> Detection {
        Detection { class_id, confidence, bbox: PixelBox { x1: x, y1: 0.0, x2: x + 10.0, y2: 10.0 } }
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = PixelBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        let b = a.translate(5.0, 0.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &a.translate(20.0, 0.0)), 0.0);
    }

    #[test]
    fn overlapping_boxes_of_same_class_collapse() {
        let dets = vec![det(0, 0.6, 1.0), det(0, 0.9, 0.0), det(1, 0.5, 0.0), det(0, 0.7, 50.0)];
        let kept = nms_filter(dets, 0.45, 10);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert!(kept.iter().any(|d| d.class_id == 1));
        assert!(!kept.iter().any(|d| d.confidence == 0.6));
    }

    #[test]
    fn max_detections_caps_output() {
        let dets = (0..5).map(|i| det(0, 0.5, i as f32 * 100.0)).collect();
        assert_eq!(nms_filter(dets, 0.45, 2).len(), 2);
    }
}
