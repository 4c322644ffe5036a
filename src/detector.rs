/// Helmet Detector — YOLOv8 via ONNX Runtime
///
/// The runner only sees the `Detector` trait: given a frame, return the
/// ordered detections. Output decoding (letterbox mapping, thresholding,
/// NMS) is plain Rust so it stays testable without the native runtime;
/// the session itself lives behind the `onnx` feature.

use anyhow::Result;

use crate::config::DetectorConfig;
use crate::frame::{BoundingBox, Detection, Frame};

pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

/// Geometry of a letterbox resize into a `target × target` square.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub new_w: u32,
    pub new_h: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

pub fn letterbox_params(width: u32, height: u32, target: u32) -> Letterbox {
    let scale = (target as f32 / width.max(1) as f32).min(target as f32 / height.max(1) as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, target);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, target);
    Letterbox {
        scale,
        new_w,
        new_h,
        pad_x: (target - new_w) / 2,
        pad_y: (target - new_h) / 2,
    }
}

/// Decode a YOLOv8 head laid out as `[4 + C, N]` (row-major, batch squeezed).
///
/// Boxes are mapped back from letterbox space to frame pixels. Scores at or
/// below `conf_threshold` are dropped; class ids beyond `class_names` are
/// labeled `class_<id>`.
pub fn decode_yolo_output(
    output: &[f32],
    num_boxes: usize,
    class_names: &[String],
    conf_threshold: f32,
    lb: &Letterbox,
    frame_w: u32,
    frame_h: u32,
) -> Vec<Detection> {
    if num_boxes == 0 || output.len() % num_boxes != 0 {
        return Vec::new();
    }
    let num_attrs = output.len() / num_boxes;
    if num_attrs <= 4 {
        return Vec::new();
    }
    let num_classes = num_attrs - 4;
    let at = |attr: usize, i: usize| output[attr * num_boxes + i];

    let fw = frame_w as f32;
    let fh = frame_h as f32;
    let mut out = Vec::new();

    for i in 0..num_boxes {
        let mut best_score = 0f32;
        let mut best_class = 0usize;
        for c in 0..num_classes {
            let score = at(4 + c, i);
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if best_score <= conf_threshold {
            continue;
        }

        let (cx, cy, bw, bh) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let unmap_x = |v: f32| ((v - lb.pad_x as f32) / lb.scale).clamp(0.0, fw);
        let unmap_y = |v: f32| ((v - lb.pad_y as f32) / lb.scale).clamp(0.0, fh);

        let label = class_names
            .get(best_class)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", best_class));

        out.push(Detection::new(
            label,
            best_score,
            BoundingBox {
                x1: unmap_x(cx - bw / 2.0),
                y1: unmap_y(cy - bh / 2.0),
                x2: unmap_x(cx + bw / 2.0),
                y2: unmap_y(cy + bh / 2.0),
            },
        ));
    }
    out
}

/// Per-label greedy NMS. Output is ordered by descending confidence.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.label == det.label && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

/// Build the configured detector for this binary.
pub fn build_detector(cfg: &DetectorConfig) -> Result<Box<dyn Detector>> {
    #[cfg(feature = "onnx")]
    {
        Ok(Box::new(onnx::OnnxDetector::new(cfg)?))
    }
    #[cfg(not(feature = "onnx"))]
    {
        anyhow::bail!(
            "cannot load {}: helmet-watch was built without the `onnx` feature",
            cfg.model_path
        )
    }
}

#[cfg(feature = "onnx")]
pub mod onnx {
    use anyhow::{anyhow, Result};
    use image::{imageops, Rgb, RgbImage};
    use ndarray::Array4;
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use ort::value::TensorRef;
    use tracing::{debug, info};

    use super::{decode_yolo_output, letterbox_params, non_max_suppression, Detector};
    use crate::config::DetectorConfig;
    use crate::frame::{Detection, Frame};

    /// YOLOv8 helmet model wrapper (ort 2.0).
    pub struct OnnxDetector {
        session: Session,
        input_size: u32,
        conf_threshold: f32,
        nms_threshold: f32,
        class_names: Vec<String>,
    }

    impl OnnxDetector {
        pub fn new(cfg: &DetectorConfig) -> Result<Self> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(2)?
                .commit_from_file(&cfg.model_path)?;
            info!(model = %cfg.model_path, input = cfg.input_size, "Detector loaded");

            Ok(Self {
                session,
                input_size: cfg.input_size,
                conf_threshold: cfg.confidence_threshold,
                nms_threshold: cfg.nms_threshold,
                class_names: cfg.class_names.clone(),
            })
        }

        /// Letterbox into the model square, grey padding, CHW f32 in [0, 1].
        fn preprocess(&self, frame: &Frame) -> (Array4<f32>, super::Letterbox) {
            let size = self.input_size;
            let lb = letterbox_params(frame.width(), frame.height(), size);
            let resized = imageops::resize(&frame.image, lb.new_w, lb.new_h, imageops::FilterType::Triangle);
            let mut canvas = RgbImage::from_pixel(size, size, Rgb([114, 114, 114]));
            imageops::overlay(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);

            let s = size as usize;
            let mut input = Array4::<f32>::zeros((1, 3, s, s));
            for (x, y, px) in canvas.enumerate_pixels() {
                for c in 0..3 {
                    input[[0, c, y as usize, x as usize]] = px[c] as f32 / 255.0;
                }
            }
            (input, lb)
        }
    }

    impl Detector for OnnxDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let (input, lb) = self.preprocess(frame);
            let tensor = TensorRef::from_array_view(&input)?;
            let outputs = self.session.run(ort::inputs!["images" => tensor])?;

            // YOLOv8 output: [1, 4 + C, N]
            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow!("Failed to extract output tensor: {}", e))?;
            let num_boxes = *shape.last().ok_or_else(|| anyhow!("empty output shape"))? as usize;

            let raw = decode_yolo_output(
                data,
                num_boxes,
                &self.class_names,
                self.conf_threshold,
                &lb,
                frame.width(),
                frame.height(),
            );
            let kept = non_max_suppression(raw, self.nms_threshold);
            debug!(detections = kept.len(), "Detector pass");
            Ok(kept)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["helmet".into(), "nohelmet".into()]
    }

    #[test]
    fn letterbox_landscape_frame() {
        let lb = letterbox_params(1280, 720, 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!((lb.new_w, lb.new_h), (640, 360));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 140));
    }

    #[test]
    fn decode_maps_boxes_back_to_frame_pixels() {
        let lb = letterbox_params(1280, 720, 640);
        // Two candidate boxes, layout [attr][box]
        #[rustfmt::skip]
        let output = vec![
            320.0, 100.0, // cx
            320.0, 200.0, // cy
            100.0,  10.0, // w
             50.0,  10.0, // h
              0.1,   0.2, // helmet
              0.9,   0.3, // nohelmet
        ];
        let dets = decode_yolo_output(&output, 2, &names(), 0.5, &lb, 1280, 720);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.label, "nohelmet");
        assert!((d.confidence - 0.9).abs() < 1e-6);
        // cx 320 → 640 px, w 100 → 200 px; cy 320 - pad 140 → 360 px, h 50 → 100 px
        assert!((d.bbox.x1 - 540.0).abs() < 1e-3);
        assert!((d.bbox.x2 - 740.0).abs() < 1e-3);
        assert!((d.bbox.y1 - 310.0).abs() < 1e-3);
        assert!((d.bbox.y2 - 410.0).abs() < 1e-3);
    }

    #[test]
    fn decode_rejects_malformed_output() {
        let lb = letterbox_params(640, 640, 640);
        assert!(decode_yolo_output(&[1.0, 2.0, 3.0], 2, &names(), 0.5, &lb, 640, 640).is_empty());
        assert!(decode_yolo_output(&[], 0, &names(), 0.5, &lb, 640, 640).is_empty());
    }

    #[test]
    fn unknown_class_id_gets_generic_label() {
        let lb = letterbox_params(640, 640, 640);
        let output = vec![10.0, 10.0, 4.0, 4.0, 0.0, 0.0, 0.95];
        let dets = decode_yolo_output(&output, 1, &names(), 0.5, &lb, 640, 640);
        assert_eq!(dets[0].label, "class_2");
    }

    #[test]
    fn nms_keeps_best_per_label() {
        let b = |x: f32| BoundingBox { x1: x, y1: 0.0, x2: x + 10.0, y2: 10.0 };
        let dets = vec![
            Detection::new("nohelmet", 0.6, b(1.0)),
            Detection::new("nohelmet", 0.9, b(0.0)),
            Detection::new("helmet", 0.7, b(0.0)),
            Detection::new("nohelmet", 0.8, b(100.0)),
        ];
        let kept = non_max_suppression(dets, 0.45);
        let summary: Vec<_> = kept.iter().map(|d| (d.label.as_str(), d.confidence)).collect();
        assert_eq!(summary, vec![("nohelmet", 0.9), ("nohelmet", 0.8), ("helmet", 0.7)]);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn build_without_onnx_reports_feature() {
        let err = build_detector(&DetectorConfig::default()).err().unwrap();
        assert!(err.to_string().contains("onnx"));
    }
}
