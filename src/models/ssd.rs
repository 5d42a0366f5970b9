// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// MobileNet-SSD 后端 (VOC 20类 + 背景, 输入 300×300)
//
// 输出格式 [1, 1, N, 7]: [image_id, label, conf, x1, y1, x2, y2], 坐标归一化到 [0, 1]

use std::path::Path;

use image::RgbImage;
use ndarray::{Array, IxDyn};

use super::ort_backend::{OrtBackend, OrtConfig, OrtEP};
use super::{ModelKind, PersonDetector};
use crate::detection::{Detection, PersonBox};
use crate::error::{CounterError, Result};
use crate::utils::{resize_rgb, to_nchw, ChannelOrder};

pub const MODEL_FILE: &str = "MobileNetSSD_deploy.onnx";

pub const INPUT_SIZE: u32 = 300;
/// VOC 标签中的 person
pub const PERSON_CLASS_ID: usize = 15;
const MEAN: f32 = 127.5;
const SCALE: f32 = 0.007843;

/// SSD 后处理器
#[derive(Clone, Debug)]
pub struct SsdPostprocessor {
    pub person_class_id: usize,
}

impl Default for SsdPostprocessor {
    fn default() -> Self {
        Self {
            person_class_id: PERSON_CLASS_ID,
        }
    }
}

impl SsdPostprocessor {
    /// 解码网络输出
    ///
    /// 只保留 person 类且置信度严格大于阈值的行; 角点裁剪到画面内后转为 (x, y, w, h)。
    pub fn decode(
        &self,
        output: &Array<f32, IxDyn>,
        frame_w: u32,
        frame_h: u32,
        conf_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let shape = output.shape();
        let row_len = *shape.last().unwrap_or(&0);
        if row_len != 7 {
            return Err(CounterError::transient(
                ModelKind::Secondary,
                format!("输出形状异常: {:?}", shape),
            ));
        }

        let (fw, fh) = (frame_w as f32, frame_h as f32);
        let rows = output
            .as_slice()
            .map(|s| s.to_vec())
            .unwrap_or_else(|| output.iter().copied().collect());

        let mut detections = Vec::new();
        for row in rows.chunks_exact(7) {
            let confidence = row[2];
            if !(confidence > conf_threshold) {
                continue;
            }
            if row[1] as usize != self.person_class_id || row[1] < 0.0 {
                continue;
            }

            let x1 = (row[3] * fw).clamp(0.0, fw);
            let y1 = (row[4] * fh).clamp(0.0, fh);
            let x2 = (row[5] * fw).clamp(0.0, fw);
            let y2 = (row[6] * fh).clamp(0.0, fh);

            detections.push(Detection::new(
                PersonBox::from_corners(x1, y1, x2, y2),
                confidence,
                ModelKind::Secondary,
            ));
        }
        Ok(detections)
    }
}

/// MobileNet-SSD 检测器
pub struct SsdDetector {
    engine: OrtBackend,
    postprocessor: SsdPostprocessor,
}

impl SsdDetector {
    pub fn load(models_dir: &Path) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig {
            f: models_dir.join(MODEL_FILE),
            ep: OrtEP::CPU,
            kind: ModelKind::Secondary,
        })?;
        Ok(Self {
            engine,
            postprocessor: SsdPostprocessor::default(),
        })
    }

    /// 缩放到 300×300, BGR, (p - 127.5) × 0.007843
    pub fn preprocess(frame: &RgbImage) -> Result<Array<f32, IxDyn>> {
        let resized = resize_rgb(frame, INPUT_SIZE, INPUT_SIZE, ModelKind::Secondary)?;
        Ok(to_nchw(&resized, ChannelOrder::Bgr, |p| (p as f32 - MEAN) * SCALE))
    }
}

impl PersonDetector for SsdDetector {
    fn kind(&self) -> ModelKind {
        ModelKind::Secondary
    }

    fn detect(&mut self, frame: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>> {
        let xs = Self::preprocess(frame)?;
        let ys = self.engine.run(xs)?;
        let output = ys
            .first()
            .ok_or_else(|| CounterError::transient(ModelKind::Secondary, "模型无输出"))?;
        self.postprocessor
            .decode(output, frame.width(), frame.height(), conf_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(rows: &[[f32; 7]]) -> Array<f32, IxDyn> {
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        Array::from_shape_vec(IxDyn(&[1, 1, rows.len(), 7]), data).unwrap()
    }

    #[test]
    fn test_decode_person_rows_only() {
        let post = SsdPostprocessor::default();
        let ys = output(&[
            [0.0, 15.0, 0.9, 0.1, 0.2, 0.3, 0.8],
            [0.0, 7.0, 0.95, 0.1, 0.2, 0.3, 0.8],   // 汽车
            [0.0, 15.0, 0.3, 0.5, 0.2, 0.6, 0.8],   // 低置信度
            [0.0, 15.0, 0.45, 0.5, 0.2, 0.6, 0.8],  // 等于阈值
        ]);
        let dets = post.decode(&ys, 640, 480, 0.45).unwrap();
        assert_eq!(dets.len(), 1);

        let d = &dets[0];
        assert_eq!(d.source, ModelKind::Secondary);
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert!((d.bbox.x - 64.0).abs() < 1e-3);
        assert!((d.bbox.y - 96.0).abs() < 1e-3);
        assert!((d.bbox.w - 128.0).abs() < 1e-3);
        assert!((d.bbox.h - 288.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_clips_to_frame() {
        let post = SsdPostprocessor::default();
        let ys = output(&[[0.0, 15.0, 0.9, -0.1, -0.2, 1.2, 0.5]]);
        let dets = post.decode(&ys, 100, 200, 0.5).unwrap();
        assert_eq!(dets[0].bbox, PersonBox::new(0.0, 0.0, 100.0, 100.0));
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let post = SsdPostprocessor::default();
        let ys = Array::zeros(IxDyn(&[1, 1, 4, 6]));
        assert!(matches!(
            post.decode(&ys, 640, 480, 0.5),
            Err(CounterError::TransientDetection { .. })
        ));
    }

    #[test]
    fn test_preprocess_layout() {
        let frame = RgbImage::from_pixel(64, 48, image::Rgb([255, 127, 0]));
        let xs = SsdDetector::preprocess(&frame).unwrap();
        assert_eq!(xs.shape(), &[1, 3, 300, 300]);
        // BGR: 第0通道为蓝色
        assert!((xs[[0, 0, 10, 10]] - (0.0 - 127.5) * SCALE).abs() < 1e-4);
        assert!((xs[[0, 2, 10, 10]] - (255.0 - 127.5) * SCALE).abs() < 1e-4);
    }

    #[test]
    fn test_missing_model_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SsdDetector::load(dir.path()),
            Err(CounterError::Resource { kind: ModelKind::Secondary, .. })
        ));
    }
}
