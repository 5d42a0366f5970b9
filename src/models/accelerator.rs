// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 硬件加速后端: 与 Tertiary 相同的输入/输出约定, 推理放在 CUDA (可选 TensorRT) 上执行。
// 设备注册失败不会退回 CPU, 而是整个后端标记为未加载。

use std::path::Path;

use image::RgbImage;

use super::ort_backend::{OrtBackend, OrtConfig, OrtEP};
use super::yolo::{preprocess, YoloPostprocessor};
use super::{ModelKind, PersonDetector};
use crate::detection::Detection;
use crate::error::Result;

pub const MODEL_FILE: &str = "accelerator.onnx";

pub struct AcceleratorDetector {
    engine: OrtBackend,
    postprocessor: YoloPostprocessor,
}

impl AcceleratorDetector {
    /// `nms_iou` 与 Tertiary 共用 `ModelConfig::tertiary_nms_iou`
    pub fn load(models_dir: &Path, device_id: i32, tensorrt: bool, nms_iou: f32) -> Result<Self> {
        let ep = if tensorrt {
            OrtEP::Trt(device_id)
        } else {
            OrtEP::CUDA(device_id)
        };
        let engine = OrtBackend::build(OrtConfig {
            f: models_dir.join(MODEL_FILE),
            ep,
            kind: ModelKind::Accelerator,
        })?;
        Ok(Self {
            engine,
            postprocessor: postprocessor(nms_iou),
        })
    }
}

fn postprocessor(nms_iou: f32) -> YoloPostprocessor {
    YoloPostprocessor::new(ModelKind::Accelerator, nms_iou)
}

impl PersonDetector for AcceleratorDetector {
    fn kind(&self) -> ModelKind {
        ModelKind::Accelerator
    }

    fn detect(&mut self, frame: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>> {
        let xs = preprocess(frame, ModelKind::Accelerator)?;
        let ys = self.engine.run(xs)?;
        self.postprocessor
            .decode(&ys, frame.width(), frame.height(), conf_threshold)
    }

    fn summary(&self) {
        tracing::info!("🔍 检测后端: accelerator ({:?})", self.engine.ep());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CounterError;

    #[test]
    fn test_missing_model_reports_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        for tensorrt in [false, true] {
            assert!(matches!(
                AcceleratorDetector::load(dir.path(), 0, tensorrt, 0.4),
                Err(CounterError::Resource {
                    kind: ModelKind::Accelerator,
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_nms_threshold_from_config() {
        // 两个框 IOU ≈ 0.54
        let data = vec![
            0.50, 0.5, 0.1, 0.4, 0.9, 0.9, 0.0, 0.0, //
            0.53, 0.5, 0.1, 0.4, 0.9, 0.8, 0.0, 0.0,
        ];
        let ys = ndarray::Array::from_shape_vec(ndarray::IxDyn(&[1, 2, 8]), data).unwrap();

        let loose = postprocessor(0.6).decode(&[ys.clone()], 400, 400, 0.45).unwrap();
        assert_eq!(loose.len(), 2);
        assert!(loose.iter().all(|d| d.source == ModelKind::Accelerator));

        let strict = postprocessor(0.4).decode(&[ys], 400, 400, 0.45).unwrap();
        assert_eq!(strict.len(), 1);
        assert!((strict[0].confidence - 0.9).abs() < 1e-6);
    }
}
