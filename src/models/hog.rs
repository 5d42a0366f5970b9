// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// HOG 行人检测 (Histogram of Oriented Gradients + 线性SVM)
//
// 检测窗口 64×128, 8×8 像素 cell, 2×2 cell 组成 block (步长 1 cell),
// 9 个无符号方向 bin, 描述子由 imageproc::hog 计算。
// 窗口按 1 cell 步长滑动, 图像金字塔逐层缩小 `scale_step` 倍。

use std::fs;
use std::path::Path;

use image::{GrayImage, RgbImage};
use imageproc::hog::{hog, HogOptions};
use ndarray::{s, Array3, Axis, Zip};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ModelKind, PersonDetector};
use crate::detection::{non_max_suppression, Detection, PersonBox};
use crate::error::{CounterError, Result};
use crate::utils::resize_rgb;

/// SVM 权重文件名 (可选)
pub const WEIGHTS_FILE: &str = "hog_people_svm.json";

pub const WINDOW_WIDTH: usize = 64;
pub const WINDOW_HEIGHT: usize = 128;
const CELL: usize = 8;
const BINS: usize = 9;
/// 单个 block 的特征长度: 2×2 cell × 9 bin
const BLOCK_LEN: usize = 4 * BINS;
/// 窗口内 block 数: (16-1) 行 × (8-1) 列
const WINDOW_BLOCKS_Y: usize = WINDOW_HEIGHT / CELL - 1;
const WINDOW_BLOCKS_X: usize = WINDOW_WIDTH / CELL - 1;
/// 描述子长度 3780
pub const DESCRIPTOR_LEN: usize = WINDOW_BLOCKS_Y * WINDOW_BLOCKS_X * BLOCK_LEN;

/// 内置模板的偏置
const TEMPLATE_BIAS: f32 = -25.0;

/// 金字塔窗口合并的 IOU 阈值
const GROUP_IOU: f32 = 0.45;

const HOG_OPTIONS: HogOptions = HogOptions {
    orientations: BINS,
    signed: false,
    cell_side: CELL,
    block_side: 2,
    block_stride: 1,
};

/// 权重排列方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightLayout {
    /// block 行 → block 列 → cell(行优先) → bin, bin k 中心在 k×20°
    #[default]
    Blocks,
    /// OpenCV `HOGDescriptor::getDefaultPeopleDetector()` 的导出顺序:
    /// block 列优先, cell 列优先, bin k 中心在 (k+0.5)×20°
    OpenCv,
}

/// 线性SVM权重
///
/// `weights` 长度为 3780; 长度为 3781 时最后一项作为偏置 (OpenCV 导出格式)。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HogWeights {
    #[serde(default)]
    pub layout: WeightLayout,
    pub weights: Vec<f32>,
    #[serde(default)]
    pub bias: f32,
}

impl HogWeights {
    fn into_array(mut self) -> Option<(Array3<f32>, f32)> {
        if self.weights.len() == DESCRIPTOR_LEN + 1 {
            self.bias += self.weights.pop()?;
        }
        if self.weights.len() != DESCRIPTOR_LEN {
            return None;
        }
        let weights = match self.layout {
            WeightLayout::Blocks => self.weights,
            WeightLayout::OpenCv => from_opencv_layout(&self.weights),
        };
        let w = Array3::from_shape_vec((WINDOW_BLOCKS_Y, WINDOW_BLOCKS_X, BLOCK_LEN), weights).ok()?;
        Some((w, self.bias))
    }
}

/// OpenCV 权重重排为本地 block 顺序, 方向 bin 在相邻两个 bin 间插值
fn from_opencv_layout(cv: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; DESCRIPTOR_LEN];
    for by in 0..WINDOW_BLOCKS_Y {
        for bx in 0..WINDOW_BLOCKS_X {
            let src_block = (bx * WINDOW_BLOCKS_Y + by) * BLOCK_LEN;
            let dst_block = (by * WINDOW_BLOCKS_X + bx) * BLOCK_LEN;
            for cy in 0..2 {
                for cx in 0..2 {
                    let src = src_block + (cx * 2 + cy) * BINS;
                    let dst = dst_block + (cy * 2 + cx) * BINS;
                    for k in 0..BINS {
                        let prev = (k + BINS - 1) % BINS;
                        out[dst + k] = 0.5 * (cv[src + prev] + cv[src + k]);
                    }
                }
            }
        }
    }
    out
}

/// 内置的人体轮廓模板: 头/躯干/腿的左右边缘偏好竖直边, 头顶与肩部偏好水平边
///
/// 每个 (block 内位置, bin) 的权重在整个窗口上均值为零,
/// 均匀纹理 (条纹/棋盘/噪声) 的得分因此约等于偏置。
static SILHOUETTE_TEMPLATE: Lazy<(Array3<f32>, f32)> = Lazy::new(|| {
    // 16 行 × 8 列 cell 的人体掩码
    let inside = |cy: i32, cx: i32| -> bool {
        match cy {
            1..=3 => (3..=4).contains(&cx), // 头
            4..=9 => (2..=5).contains(&cx), // 躯干
            10..=14 => matches!(cx, 2 | 5), // 腿
            _ => false,
        }
    };

    let mut cell_weights = Array3::<f32>::zeros((WINDOW_HEIGHT / CELL, WINDOW_WIDTH / CELL, BINS));
    for cy in 0..(WINDOW_HEIGHT / CELL) as i32 {
        for cx in 0..(WINDOW_WIDTH / CELL) as i32 {
            let here = inside(cy, cx);
            let side_edge = here != inside(cy, cx - 1) || here != inside(cy, cx + 1);
            let top_edge = here != inside(cy - 1, cx);

            let mut hist = cell_weights.slice_mut(s![cy as usize, cx as usize, ..]);
            if side_edge {
                // 梯度水平 → 竖直边缘 (0° / 160° 附近)
                hist[0] += 1.0;
                hist[BINS - 1] += 0.5;
                hist[1] += 0.5;
            }
            if top_edge {
                // 梯度竖直 → 水平边缘 (80° 附近)
                hist[BINS / 2] += 0.8;
            }
        }
    }

    let mut weights = Array3::<f32>::zeros((WINDOW_BLOCKS_Y, WINDOW_BLOCKS_X, BLOCK_LEN));
    for by in 0..WINDOW_BLOCKS_Y {
        for bx in 0..WINDOW_BLOCKS_X {
            for (i, (dy, dx)) in [(0, 0), (0, 1), (1, 0), (1, 1)].into_iter().enumerate() {
                let src = cell_weights.slice(s![by + dy, bx + dx, ..]);
                weights
                    .slice_mut(s![by, bx, i * BINS..(i + 1) * BINS])
                    .assign(&src);
            }
        }
    }

    // 去均值
    let mean = weights.sum_axis(Axis(0)).sum_axis(Axis(0)) / (WINDOW_BLOCKS_Y * WINDOW_BLOCKS_X) as f32;
    weights -= &mean;
    (weights, TEMPLATE_BIAS)
});

/// HOG 行人检测器
pub struct HogDetector {
    weights: Array3<f32>,
    bias: f32,
    /// 缩放后短边上限
    max_side: u32,
    scale_step: f32,
}

impl HogDetector {
    /// 加载权重, 文件缺失或无效时使用内置模板, 因此总是可用
    pub fn load(models_dir: &Path, max_side: u32, scale_step: f32) -> Self {
        let path = models_dir.join(WEIGHTS_FILE);
        let parsed = fs::read_to_string(&path)
            .ok()
            .map(|json| serde_json::from_str::<HogWeights>(&json));

        let (weights, bias) = match parsed {
            Some(Ok(w)) => match w.into_array() {
                Some(wb) => {
                    info!("✅ HOG 权重已从 {} 加载", path.display());
                    wb
                }
                None => {
                    warn!("⚠️  HOG 权重长度应为 {}, 使用内置模板", DESCRIPTOR_LEN);
                    SILHOUETTE_TEMPLATE.clone()
                }
            },
            Some(Err(e)) => {
                warn!("⚠️  HOG 权重解析失败: {}, 使用内置模板", e);
                SILHOUETTE_TEMPLATE.clone()
            }
            None => SILHOUETTE_TEMPLATE.clone(),
        };

        Self {
            weights,
            bias,
            max_side: max_side.max(WINDOW_HEIGHT as u32),
            scale_step: scale_step.max(1.01),
        }
    }

    /// 单层图像上滑窗检测, 返回该层坐标下的 (框, SVM得分)
    fn detect_level(&self, img: &RgbImage) -> Result<Vec<(PersonBox, f32)>> {
        let blocks = block_features(img)?;
        let (rows, cols, _) = blocks.dim();
        if rows < WINDOW_BLOCKS_Y || cols < WINDOW_BLOCKS_X {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for by in 0..=(rows - WINDOW_BLOCKS_Y) {
            for bx in 0..=(cols - WINDOW_BLOCKS_X) {
                let window = blocks.slice(s![by..by + WINDOW_BLOCKS_Y, bx..bx + WINDOW_BLOCKS_X, ..]);
                let score = Zip::from(&window)
                    .and(&self.weights)
                    .fold(self.bias, |acc, &d, &w| acc + d * w);
                if score > 0.0 {
                    let bbox = PersonBox::new(
                        (bx * CELL) as f32,
                        (by * CELL) as f32,
                        WINDOW_WIDTH as f32,
                        WINDOW_HEIGHT as f32,
                    );
                    hits.push((bbox, score));
                }
            }
        }
        Ok(hits)
    }
}

impl PersonDetector for HogDetector {
    fn kind(&self) -> ModelKind {
        ModelKind::Baseline
    }

    fn detect(&mut self, frame: &RgbImage, conf_threshold: f32) -> Result<Vec<Detection>> {
        let (fw, fh) = frame.dimensions();
        if fw < WINDOW_WIDTH as u32 || fh < WINDOW_HEIGHT as u32 {
            return Ok(Vec::new());
        }

        // 缩小到短边不超过 max_side
        let shorter = fw.min(fh);
        let base_scale = (self.max_side as f32 / shorter as f32).min(1.0);
        let base_w = ((fw as f32 * base_scale).round() as u32).max(1);
        let base_h = ((fh as f32 * base_scale).round() as u32).max(1);
        let base = resize_rgb(frame, base_w, base_h, ModelKind::Baseline)?;

        let mut detections = Vec::new();
        let mut level_scale = 1.0f32;
        loop {
            let lw = (base_w as f32 / level_scale).round() as u32;
            let lh = (base_h as f32 / level_scale).round() as u32;
            if lw < WINDOW_WIDTH as u32 || lh < WINDOW_HEIGHT as u32 {
                break;
            }

            let level = resize_rgb(&base, lw, lh, ModelKind::Baseline)?;
            // 层坐标 → 原图坐标
            let sx = fw as f32 / lw as f32;
            let sy = fh as f32 / lh as f32;

            for (bbox, score) in self.detect_level(&level)? {
                if logistic(score) < conf_threshold {
                    continue;
                }
                // 先以 SVM 得分排序合并, 高分窗口的置信度会饱和到 1.0
                detections.push(Detection::new(bbox.scaled(sx, sy), score, ModelKind::Baseline));
            }

            level_scale *= self.scale_step;
        }

        // 合并金字塔各层的重复窗口
        non_max_suppression(&mut detections, GROUP_IOU);
        for d in &mut detections {
            d.confidence = logistic(d.confidence);
        }
        Ok(detections)
    }

    fn summary(&self) {
        info!(
            "🔍 检测后端: baseline (HOG {}x{}, 短边≤{}, 金字塔步长 {:.2})",
            WINDOW_WIDTH, WINDOW_HEIGHT, self.max_side, self.scale_step
        );
    }
}

fn logistic(score: f32) -> f32 {
    1.0 / (1.0 + (-score).exp())
}

/// 计算归一化后的 block 特征 [block行, block列, 36]
///
/// 右侧/底部不足一个 cell 的像素被裁掉。
fn block_features(img: &RgbImage) -> Result<Array3<f32>> {
    let gray = image::imageops::grayscale(img);
    let (w, h) = gray.dimensions();
    let (cw, ch) = (w - w % CELL as u32, h - h % CELL as u32);
    if cw < (2 * CELL) as u32 || ch < (2 * CELL) as u32 {
        return Ok(Array3::zeros((0, 0, BLOCK_LEN)));
    }

    let gray: GrayImage = if (cw, ch) == (w, h) {
        gray
    } else {
        image::imageops::crop_imm(&gray, 0, 0, cw, ch).to_image()
    };

    let descriptor = hog(&gray, HOG_OPTIONS).map_err(|e| CounterError::transient(ModelKind::Baseline, e))?;
    let rows = ch as usize / CELL - 1;
    let cols = cw as usize / CELL - 1;
    Array3::from_shape_vec((rows, cols, BLOCK_LEN), descriptor)
        .map_err(|e| CounterError::transient(ModelKind::Baseline, e))
}
