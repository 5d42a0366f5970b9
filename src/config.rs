// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 人数统计配置 - 通过JSON文件调整参数
//!
//! 所有策略常量(匹配权重、老化窗口、过滤阈值)都是可配置项,默认值保持原有行为。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{CounterError, Result};
use crate::models::ModelKind;

/// 置信度阈值允许范围
pub const MIN_CONFIDENCE: f32 = 0.1;
pub const MAX_CONFIDENCE: f32 = 1.0;

pub fn clamp_confidence(threshold: f32) -> f32 {
    if threshold.is_nan() {
        return MIN_CONFIDENCE;
    }
    threshold.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// 检测过滤参数 (几何合理性 + NMS)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub confidence_threshold: f32, // 置信度阈值
    pub min_person_height: f32,    // 最小人高 (像素)
    pub min_person_width: f32,     // 最小人宽 (像素)
    pub min_aspect_ratio: f32,     // 最小高宽比
    pub nms_iou_threshold: f32,    // NMS IOU阈值
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.45,
            min_person_height: 80.0,
            min_person_width: 30.0,
            min_aspect_ratio: 1.2,
            nms_iou_threshold: 0.45,
        }
    }
}

/// 跟踪器参数 (匹配代价权重 + 生命周期时间窗)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    // === 生命周期 ===
    pub min_detection_frames: u32, // Tentative → Active 所需匹配帧数

    // === 匹配代价 ===
    pub match_score_threshold: f32, // 总代价上限
    pub position_weight: f32,       // 中心距离权重
    pub area_weight: f32,           // 面积比权重
    pub aspect_weight: f32,         // 高宽比差权重
    pub iou_weight: f32,            // (1 - IOU) 权重
    pub time_weight: f32,           // 丢失时长权重

    // === 时间窗 (秒) ===
    pub match_window_secs: f32,    // 参与匹配的最长未见时间
    pub missing_window_secs: f32,  // 超过则 Active→Exited / Tentative→Invalid
    pub invalid_retention_secs: f32, // Invalid 保留时长
    pub exited_retention_secs: f32,  // Exited 保留时长
    pub velocity_epsilon_secs: f32,  // 速度更新最小时间间隔

    // === 容量 ===
    pub trajectory_len: usize, // 轨迹最大长度
    pub gc_trigger: usize,     // 超过该数量才触发回收
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_detection_frames: 5,

            match_score_threshold: 100.0,
            position_weight: 0.5,
            area_weight: 20.0,
            aspect_weight: 10.0,
            iou_weight: 50.0,
            time_weight: 10.0,

            match_window_secs: 1.0,
            missing_window_secs: 2.0,
            invalid_retention_secs: 1.0,
            exited_retention_secs: 30.0,
            velocity_epsilon_secs: 0.01,

            trajectory_len: 30,
            gc_trigger: 50,
        }
    }
}

/// 模型参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelKind,  // 默认后端
    pub models_dir: PathBuf,    // 模型文件目录
    pub hog_max_side: u32,      // HOG 缩放后短边上限
    pub hog_scale_step: f32,    // HOG 金字塔缩放步长
    pub tertiary_nms_iou: f32,  // Tertiary/Accelerator 内部 NMS 阈值
    pub accelerator_device_id: i32, // 加速设备ID
    pub accelerator_tensorrt: bool, // 加速后端优先使用 TensorRT
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelKind::Baseline,
            models_dir: default_models_dir(),
            hog_max_side: 400,
            hog_scale_step: 1.05,
            tertiary_nms_iou: 0.4,
            accelerator_device_id: 0,
            accelerator_tensorrt: false,
        }
    }
}

/// 检测工作线程参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,            // false 时在调用线程同步检测
    pub poll_interval_ms: u64,    // 空闲轮询间隔
    pub shutdown_timeout_ms: u64, // 退出等待上限
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 10,
            shutdown_timeout_ms: 1000,
        }
    }
}

/// 人数统计总配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    pub filter: FilterConfig,
    pub tracker: TrackerConfig,
    pub model: ModelConfig,
    pub worker: WorkerConfig,
}

/// 默认模型目录: <数据目录>/pulse/models, 无数据目录时退回 ./models
fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("pulse").join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

impl CounterConfig {
    /// 从JSON文件加载配置, 文件不存在时写入默认配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => {
                let mut config: Self = serde_json::from_str(&json)?;
                config.filter.confidence_threshold =
                    clamp_confidence(config.filter.confidence_threshold);
                info!("✅ 配置已从 {} 加载", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("⚠️  默认配置写入失败: {}", e);
                }
                Ok(config)
            }
            Err(source) => Err(CounterError::Config {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| CounterError::Config {
            path: path.display().to_string(),
            source,
        })?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!("🎛️  当前配置:");
        info!("  检测后端: {}", self.model.model_type);
        info!("  模型目录: {}", self.model.models_dir.display());
        info!("  置信度阈值: {:.2}", self.filter.confidence_threshold);
        info!(
            "  最小人体尺寸: {:.0}x{:.0} (高宽比≥{:.1})",
            self.filter.min_person_width, self.filter.min_person_height, self.filter.min_aspect_ratio
        );
        info!("  确认帧数: {}", self.tracker.min_detection_frames);
        info!(
            "  工作线程: {}",
            if self.worker.enabled { "启用" } else { "同步" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy() {
        let config = CounterConfig::default();
        assert_eq!(config.filter.min_person_height, 80.0);
        assert_eq!(config.filter.min_person_width, 30.0);
        assert_eq!(config.filter.min_aspect_ratio, 1.2);
        assert_eq!(config.tracker.min_detection_frames, 5);
        assert_eq!(config.tracker.match_score_threshold, 100.0);
        assert_eq!(config.tracker.gc_trigger, 50);
        assert_eq!(config.model.model_type, ModelKind::Baseline);
        assert_eq!(config.model.tertiary_nms_iou, 0.4);
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(0.01), 0.1);
        assert_eq!(clamp_confidence(3.0), 1.0);
        assert_eq!(clamp_confidence(0.5), 0.5);
        assert_eq!(clamp_confidence(f32::NAN), 0.1);
    }

    #[test]
    fn test_load_missing_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        let config = CounterConfig::load(&path).unwrap();
        assert_eq!(config, CounterConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn test_load_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        fs::write(
            &path,
            r#"{ "filter": { "confidence_threshold": 0.02 }, "model": { "model_type": "ssd" } }"#,
        )
        .unwrap();

        let config = CounterConfig::load(&path).unwrap();
        assert_eq!(config.filter.confidence_threshold, 0.1);
        assert_eq!(config.filter.min_person_height, 80.0);
        assert_eq!(config.model.model_type, ModelKind::Secondary);
        assert_eq!(config.tracker, TrackerConfig::default());
    }

    #[test]
    fn test_load_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CounterConfig::load(&path),
            Err(CounterError::ConfigParse(_))
        ));
    }
}
