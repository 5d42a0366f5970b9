// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLO 后端 (COCO 80类, 输入 416×416)
//
// 每个输出张量最后一维为一行: [cx, cy, w, h, obj, class0, class1, ...], 坐标归一化到 [0, 1]。
// 多尺度输出逐个解码后合并, 再做一次内部 NMS。

use std::path::Path;

use image::RgbImage;
use ndarray::{Array, IxDyn};
use tracing::info;

use super::ort_backend::{OrtBackend, OrtConfig, OrtEP};
use super::{ModelKind, PersonDetector};
use crate::detection::{non_max_suppression, Detection, PersonBox};
use crate::error::{CounterError, Result};
use crate::utils::{resize_rgb, to_nchw, ChannelOrder};

pub const MODEL_FILE: &str = "yolov3.onnx";
/// 可选的类别名文件, 每行一个
pub const LABELS_FILE: &str = "coco.names";

pub const INPUT_SIZE: u32 = 416;
/// COCO 标签中的 person
pub const PERSON_CLASS_ID: usize = 0;
/// 每行前5个值: cx, cy, w, h, obj
const BOX_FIELDS: usize = 5;

/// YOLO 后处理器 (Tertiary 与 Accelerator 共用)
#[derive(Clone, Debug)]
pub struct YoloPostprocessor {
    pub kind: ModelKind,
    pub nms_iou: f32,
    pub person_class_id: usize,
}

impl YoloPostprocessor {
    pub fn new(kind: ModelKind, nms_iou: f32) -> Self {
        Self {
            kind,
            nms_iou,
            person_class_id: PERSON_CLASS_ID,
        }
    }

    /// 解码全部输出张量
    ///
    /// 每行取类别分数的 argmax, 只有 argmax 恰好是 person 且分数严格大于阈值时保留,
    /// 置信度即该类别分数。
    pub fn decode(
        &self,
        outputs: &[Array<f32, IxDyn>],
        frame_w: u32,
        frame_h: u32,
        conf_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let (fw, fh) = (frame_w as f32, frame_h as f32);
        let mut detections = Vec::new();

        for output in outputs {
            let row_len = *output.shape().last().unwrap_or(&0);
            if row_len <= BOX_FIELDS + self.person_class_id {
                return Err(CounterError::transient(
                    self.kind,
                    format!("输出形状异常: {:?}", output.shape()),
                ));
            }

            let data: Vec<f32> = output.iter().copied().collect();
            for row in data.chunks_exact(row_len) {
                let scores = &row[BOX_FIELDS..];
                let Some((class_id, &confidence)) = scores
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                else {
                    continue;
                };
                if class_id != self.person_class_id || !(confidence > conf_threshold) {
                    continue;
                }

                let bbox = PersonBox::from_center(row[0] * fw, row[1] * fh, row[2] * fw, row[3] * fh);
                detections.push(Detection::new(bbox, confidence, self.kind));
            }
        }

        if detections.len() > 1 {
            non_max_suppression(&mut detections, self.nms_iou);
        }
        Ok(detections)
    }
}

/// 缩放到 416×416, RGB, /255
pub fn preprocess(frame: &RgbImage, kind: ModelKind) -> Result<Array<f32, IxDyn>> {
    let resized = resize_rgb(frame, INPUT_SIZE, INPUT_SIZE, kind)?;
    Ok(to_nchw(&resized, ChannelOrder::Rgb, |p| p as f32 / 255.0))
}

/// 读取类别名, 文件不存在时返回 None
fn read_labels(path: &Path) -> Option<Vec<String>> {
    let text = std::fs::read_to_string(path).ok()?;
    Some(
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
    )
}

/// YOLO 检测器
pub struct YoloDetector {
    engine: OrtBackend,
    postprocessor: YoloPostprocessor,
}

impl YoloDetector {
    pub fn load(models_dir: &Path, nms_iou: f32) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig {
            f: models_dir.join(MODEL_FILE),
            ep: OrtEP::CPU,
            kind: ModelKind::Tertiary,
        })?;

        if let Some(labels) = read_labels(&models_dir.join(LABELS_FILE)) {
            info!(
                "🏷️  {} 个类别, person 类: {:?}",
                labels.len(),
                labels.get(PERSON_CLASS_ID)
            );
        }
        Ok(Self {
            engine,
            postprocessor: YoloPostprocessor::new(ModelKind::Tertiary, nms_iou),
        })
    }
}

impl PersonDetector for YoloDetector {
    fn kind(&self) -> ModelKind {
        ModelKind::Tertiary
    }

    fn detect(&mut self, frame: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>> {
        let xs = preprocess(frame, ModelKind::Tertiary)?;
        let ys = self.engine.run(xs)?;
        self.postprocessor
            .decode(&ys, frame.width(), frame.height(), conf_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 3 类输出 (person, bicycle, car)
    fn output(rows: &[[f32; 8]]) -> Array<f32, IxDyn> {
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        Array::from_shape_vec(IxDyn(&[1, rows.len(), 8]), data).unwrap()
    }

    #[test]
    fn test_decode_center_to_top_left() {
        let post = YoloPostprocessor::new(ModelKind::Tertiary, 0.4);
        let ys = output(&[[0.5, 0.5, 0.1, 0.4, 0.9, 0.8, 0.1, 0.05]]);
        let dets = post.decode(&[ys], 400, 200, 0.45).unwrap();
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert!((b.x - 180.0).abs() < 1e-3);
        assert!((b.y - 60.0).abs() < 1e-3);
        assert!((b.w - 40.0).abs() < 1e-3);
        assert!((b.h - 80.0).abs() < 1e-3);
        assert!((dets[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(dets[0].source, ModelKind::Tertiary);
    }

    #[test]
    fn test_decode_requires_person_argmax() {
        let post = YoloPostprocessor::new(ModelKind::Tertiary, 0.4);
        let ys = output(&[
            [0.5, 0.5, 0.1, 0.4, 0.9, 0.6, 0.7, 0.0], // argmax 为自行车
            [0.2, 0.5, 0.1, 0.4, 0.9, 0.3, 0.1, 0.0], // 分数过低
        ]);
        assert!(post.decode(&[ys], 400, 400, 0.45).unwrap().is_empty());
    }

    #[test]
    fn test_internal_nms_and_multi_scale() {
        let post = YoloPostprocessor::new(ModelKind::Tertiary, 0.4);
        let a = output(&[[0.50, 0.5, 0.1, 0.4, 0.9, 0.9, 0.0, 0.0]]);
        let b = output(&[
            [0.51, 0.5, 0.1, 0.4, 0.9, 0.7, 0.0, 0.0], // 与 a 重叠
            [0.10, 0.5, 0.1, 0.4, 0.9, 0.6, 0.0, 0.0],
        ]);
        let dets = post.decode(&[a, b], 400, 400, 0.45).unwrap();
        assert_eq!(dets.len(), 2);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        assert!((dets[1].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_short_rows() {
        let post = YoloPostprocessor::new(ModelKind::Accelerator, 0.4);
        let ys = Array::zeros(IxDyn(&[1, 3, 5]));
        assert!(matches!(
            post.decode(&[ys], 400, 400, 0.45),
            Err(CounterError::TransientDetection {
                kind: ModelKind::Accelerator,
                ..
            })
        ));
    }

    #[test]
    fn test_preprocess_rgb_unit_range() {
        let frame = RgbImage::from_pixel(32, 32, image::Rgb([255, 0, 51]));
        let xs = preprocess(&frame, ModelKind::Tertiary).unwrap();
        assert_eq!(xs.shape(), &[1, 3, 416, 416]);
        assert!((xs[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((xs[[0, 2, 0, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_read_labels_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LABELS_FILE);
        std::fs::write(&path, "person\nbicycle\n\ncar\n").unwrap();
        assert_eq!(read_labels(&path).unwrap(), vec!["person", "bicycle", "car"]);
        assert!(read_labels(&dir.path().join("missing.names")).is_none());
    }

    #[test]
    fn test_missing_model_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            YoloDetector::load(dir.path(), 0.4),
            Err(CounterError::Resource { kind: ModelKind::Tertiary, .. })
        ));
    }
}
