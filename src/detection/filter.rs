// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测过滤 (Detection Filter)
//! 职责: 剔除几何上不合理的检测框(过小/过扁/完全在画面外/低置信度), 再做NMS去重

use super::types::{Detection, FrameSize};
use crate::config::FilterConfig;

/// 非极大值抑制: 按置信度降序保留, 与已保留框 IOU 超过阈值的框被丢弃
///
/// 排序是稳定的, 同置信度时先出现的框优先。
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 无状态检测过滤器
#[derive(Clone, Debug, Default)]
pub struct DetectionFilter {
    config: FilterConfig,
}

impl DetectionFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn set_confidence_threshold(&mut self, threshold: f32) {
        self.config.confidence_threshold = threshold;
    }

    /// 判断检测是否可能是完整的人 (而不是身体局部或误检)
    pub fn is_valid(&self, detection: &Detection, frame: FrameSize) -> bool {
        is_valid_person(&self.config, detection, frame)
    }

    /// 合理性过滤 + NMS
    pub fn apply(&self, detections: Vec<Detection>, frame: FrameSize) -> Vec<Detection> {
        let mut filtered: Vec<Detection> = detections
            .into_iter()
            .filter(|d| self.is_valid(d, frame))
            .collect();

        if filtered.len() > 1 {
            non_max_suppression(&mut filtered, self.config.nms_iou_threshold);
        }
        filtered
    }
}

/// 人体合理性判定
///
/// 非有限坐标、非正尺寸、NaN 置信度一律拒绝, 保证畸形检测进不了匹配阶段。
pub fn is_valid_person(config: &FilterConfig, detection: &Detection, frame: FrameSize) -> bool {
    let b = &detection.bbox;
    if !b.is_finite() || !detection.confidence.is_finite() {
        return false;
    }
    if b.w <= 0.0 || b.h <= 0.0 {
        return false;
    }

    // 尺寸: 太小通常是身体局部
    if b.h < config.min_person_height || b.w < config.min_person_width {
        return false;
    }

    // 高宽比: 人一般高大于宽
    if b.aspect() < config.min_aspect_ratio {
        return false;
    }

    // 位置: 与画面完全不相交
    let (fw, fh) = (frame.width as f32, frame.height as f32);
    if b.y2() < 0.0 || b.y > fh || b.x2() < 0.0 || b.x > fw {
        return false;
    }

    detection.confidence >= config.confidence_threshold
}
