// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 人员检测后端
//!
//! # 架构说明
//!
//! ## 后端变体 (ModelKind)
//! - **Baseline**: HOG + 线性SVM, 纯CPU实现, 始终可用, 作为兜底后端
//! - **Secondary**: MobileNet-SSD (300×300), ONNX
//! - **Tertiary**: YOLO (416×416), ONNX, 自带 NMS(0.4)
//! - **Accelerator**: 硬件加速 (CUDA/TensorRT) 的 YOLO 格式模型, 首次选择时才初始化
//!
//! ## 后处理器模式 (Postprocessor Pattern)
//! SSD/YOLO 的输出解码是纯函数 (`SsdPostprocessor`/`YoloPostprocessor`),
//! 与推理引擎 `OrtBackend` 分离, 便于单独测试。
//!
//! ## 使用示例
//! ```no_run
//! use people_counter::config::ModelConfig;
//! use people_counter::models::{DetectorBank, ModelKind};
//!
//! let mut bank = DetectorBank::new(&ModelConfig::default());
//! if bank.select(ModelKind::Secondary).is_err() {
//!     // 未加载, 保持原后端
//! }
//! ```
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::detection::Detection;
use crate::error::{CounterError, Result};

/// 后端类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// HOG 行人检测
    #[serde(alias = "hog")]
    Baseline,
    /// MobileNet-SSD
    #[serde(alias = "ssd")]
    Secondary,
    /// YOLO
    #[serde(alias = "yolo")]
    Tertiary,
    /// 硬件加速后端
    #[serde(alias = "hailo")]
    Accelerator,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Baseline,
        ModelKind::Secondary,
        ModelKind::Tertiary,
        ModelKind::Accelerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Baseline => "baseline",
            ModelKind::Secondary => "secondary",
            ModelKind::Tertiary => "tertiary",
            ModelKind::Accelerator => "accelerator",
        }
    }

    /// 模型目录下的权重文件名
    pub fn artifact(&self) -> &'static str {
        match self {
            ModelKind::Baseline => hog::WEIGHTS_FILE,
            ModelKind::Secondary => ssd::MODEL_FILE,
            ModelKind::Tertiary => yolo::MODEL_FILE,
            ModelKind::Accelerator => accelerator::MODEL_FILE,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" | "hog" => Ok(ModelKind::Baseline),
            "secondary" | "ssd" => Ok(ModelKind::Secondary),
            "tertiary" | "yolo" => Ok(ModelKind::Tertiary),
            "accelerator" | "hailo" => Ok(ModelKind::Accelerator),
            _ => Err(CounterError::UnknownModel(s.to_string())),
        }
    }
}

/// 统一的人员检测接口
///
/// `detect` 返回原始帧像素坐标下的检测框, 已按 `conf_threshold` 初筛;
/// 几何过滤和跨后端 NMS 由 `DetectionFilter` 统一处理。
pub trait PersonDetector: Send {
    fn kind(&self) -> ModelKind;

    fn detect(&mut self, frame: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>>;

    /// 打印模型信息
    fn summary(&self) {
        info!("🔍 检测后端: {}", self.kind());
    }
}

/// 加速后端的延迟初始化状态
enum AcceleratorSlot {
    /// 尚未尝试初始化
    Pending,
    Ready(AcceleratorDetector),
    /// 初始化失败, 不再重试
    Failed,
}

/// 后端集合: 四个固定槽位, 每个槽位的 `loaded` 在构建时确定 (加速后端除外)
pub struct DetectorBank {
    models_dir: PathBuf,
    device_id: i32,
    tensorrt: bool,
    nms_iou: f32,
    baseline: HogDetector,
    secondary: Option<SsdDetector>,
    tertiary: Option<YoloDetector>,
    accelerator: AcceleratorSlot,
    active: ModelKind,
}

impl DetectorBank {
    /// 加载所有可用后端, 从不失败: 缺失的模型只会标记为未加载
    pub fn new(config: &ModelConfig) -> Self {
        let dir = config.models_dir.clone();

        let baseline = HogDetector::load(&dir, config.hog_max_side, config.hog_scale_step);

        let secondary = match SsdDetector::load(&dir) {
            Ok(d) => Some(d),
            Err(e) => {
                info!("ℹ️  {}", e);
                None
            }
        };

        let tertiary = match YoloDetector::load(&dir, config.tertiary_nms_iou) {
            Ok(d) => Some(d),
            Err(e) => {
                info!("ℹ️  {}", e);
                None
            }
        };

        let mut bank = Self {
            models_dir: dir,
            device_id: config.accelerator_device_id,
            tensorrt: config.accelerator_tensorrt,
            nms_iou: config.tertiary_nms_iou,
            baseline,
            secondary,
            tertiary,
            accelerator: AcceleratorSlot::Pending,
            active: ModelKind::Baseline,
        };

        if config.model_type == ModelKind::Accelerator {
            bank.init_accelerator();
        }

        if bank.loaded(config.model_type) {
            bank.active = config.model_type;
        } else {
            warn!(
                "⚠️  默认后端 {} 未加载, 回退到 {}",
                config.model_type,
                ModelKind::Baseline
            );
        }
        bank.active_detector().summary();
        bank
    }

    fn init_accelerator(&mut self) {
        if !matches!(self.accelerator, AcceleratorSlot::Pending) {
            return;
        }
        self.accelerator = match AcceleratorDetector::load(
            &self.models_dir,
            self.device_id,
            self.tensorrt,
            self.nms_iou,
        ) {
            Ok(d) => AcceleratorSlot::Ready(d),
            Err(e) => {
                warn!("⚠️  加速设备初始化失败: {}", e);
                AcceleratorSlot::Failed
            }
        };
    }

    pub fn loaded(&self, kind: ModelKind) -> bool {
        match kind {
            ModelKind::Baseline => true,
            ModelKind::Secondary => self.secondary.is_some(),
            ModelKind::Tertiary => self.tertiary.is_some(),
            ModelKind::Accelerator => matches!(self.accelerator, AcceleratorSlot::Ready(_)),
        }
    }

    pub fn active(&self) -> ModelKind {
        self.active
    }

    /// 切换当前后端, 目标未加载时返回错误且不改变当前后端
    pub fn select(&mut self, kind: ModelKind) -> Result<()> {
        if kind == ModelKind::Accelerator {
            self.init_accelerator();
        }
        if !self.loaded(kind) {
            return Err(CounterError::Configuration { kind });
        }
        if self.active != kind {
            info!("🔄 检测后端切换: {} → {}", self.active, kind);
            self.active = kind;
        }
        Ok(())
    }

    /// 已加载的后端列表 (加速后端未尝试初始化时不列出)
    pub fn available_models(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|k| self.loaded(*k))
            .collect()
    }

    fn active_detector(&mut self) -> &mut dyn PersonDetector {
        match (self.active, &mut self.secondary, &mut self.tertiary, &mut self.accelerator) {
            (ModelKind::Secondary, Some(d), _, _) => d as &mut dyn PersonDetector,
            (ModelKind::Tertiary, _, Some(d), _) => d,
            (ModelKind::Accelerator, _, _, AcceleratorSlot::Ready(d)) => d,
            _ => &mut self.baseline,
        }
    }

    /// 使用当前后端检测
    pub fn detect(&mut self, frame: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>> {
        self.active_detector().detect(frame, conf_threshold)
    }
}

// 各后端的具体实现
pub mod accelerator; // 硬件加速 (CUDA/TensorRT)
pub mod hog; // HOG + 线性SVM
pub mod ort_backend; // ONNX Runtime 引擎封装
pub mod ssd; // MobileNet-SSD
pub mod yolo; // YOLO

// Re-exports
pub use accelerator::AcceleratorDetector;
pub use hog::{HogDetector, HogWeights, WeightLayout};
pub use ort_backend::{OrtBackend, OrtConfig, OrtEP};
pub use ssd::{SsdDetector, SsdPostprocessor};
pub use yolo::{YoloDetector, YoloPostprocessor};

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_dir_config(dir: &std::path::Path, model_type: ModelKind) -> ModelConfig {
        ModelConfig {
            model_type,
            models_dir: dir.to_path_buf(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_parse_model_names() {
        assert_eq!("hog".parse::<ModelKind>().unwrap(), ModelKind::Baseline);
        assert_eq!("SSD".parse::<ModelKind>().unwrap(), ModelKind::Secondary);
        assert_eq!("tertiary".parse::<ModelKind>().unwrap(), ModelKind::Tertiary);
        assert_eq!("hailo".parse::<ModelKind>().unwrap(), ModelKind::Accelerator);
        assert!(matches!(
            "resnet".parse::<ModelKind>(),
            Err(CounterError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_serde_names_and_aliases() {
        assert_eq!(serde_json::to_string(&ModelKind::Tertiary).unwrap(), "\"tertiary\"");
        let kind: ModelKind = serde_json::from_str("\"yolo\"").unwrap();
        assert_eq!(kind, ModelKind::Tertiary);
    }

    #[test]
    fn test_missing_artifacts_fall_back_to_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let bank = DetectorBank::new(&empty_dir_config(dir.path(), ModelKind::Secondary));
        assert_eq!(bank.active(), ModelKind::Baseline);
        assert!(bank.loaded(ModelKind::Baseline));
        assert!(!bank.loaded(ModelKind::Secondary));
        assert_eq!(bank.available_models(), vec![ModelKind::Baseline]);
    }

    #[test]
    fn test_select_unloaded_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = DetectorBank::new(&empty_dir_config(dir.path(), ModelKind::Baseline));

        for kind in [ModelKind::Secondary, ModelKind::Tertiary, ModelKind::Accelerator] {
            assert!(matches!(
                bank.select(kind),
                Err(CounterError::Configuration { kind: k }) if k == kind
            ));
            assert_eq!(bank.active(), ModelKind::Baseline);
        }
        assert!(bank.select(ModelKind::Baseline).is_ok());
    }

    #[test]
    fn test_accelerator_uses_configured_nms() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            tertiary_nms_iou: 0.3,
            ..empty_dir_config(dir.path(), ModelKind::Accelerator)
        };
        let bank = DetectorBank::new(&config);
        assert_eq!(bank.nms_iou, 0.3);
        // 模型缺失: 初始化失败, 回退到 Baseline
        assert!(matches!(bank.accelerator, AcceleratorSlot::Failed));
        assert_eq!(bank.active(), ModelKind::Baseline);
    }

    #[test]
    fn test_baseline_detects_on_blank_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = DetectorBank::new(&empty_dir_config(dir.path(), ModelKind::Baseline));
        let frame = RgbImage::new(320, 240);
        let detections = bank.detect(&frame, 0.45).unwrap();
        assert!(detections.is_empty());
    }
}
