// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 人员检测系统数据结构定义
/// Data structures for the person detection system
use serde::Serialize;

use crate::models::ModelKind;

// ========== 数据结构 ==========

/// 检测框 (x, y, w, h), 原始帧像素坐标, 左上角 + 宽高
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize)]
pub struct PersonBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl PersonBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// 由角点 (x1, y1, x2, y2) 构造
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        }
    }

    /// 由中心点 + 宽高构造 (YOLO 输出格式)
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// 高宽比 h/w, 宽度非正时为 0
    pub fn aspect(&self) -> f32 {
        if self.w > 0.0 {
            self.h / self.w
        } else {
            0.0
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }

    /// 按比例缩放 (缩放图 → 原图坐标)
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            w: self.w * sx,
            h: self.h * sy,
        }
    }

    /// 计算两个框的IOU (Intersection over Union), 不相交时为 0
    pub fn iou(&self, other: &PersonBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            return 0.0;
        }

        (intersection / union).clamp(0.0, 1.0)
    }
}

/// 单帧检测结果 (无跨帧身份)
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: PersonBox,
    /// 置信度 [0, 1]
    pub confidence: f32,
    /// 产生该检测的后端
    pub source: ModelKind,
}

impl Detection {
    pub fn new(bbox: PersonBox, confidence: f32, source: ModelKind) -> Self {
        Self {
            bbox,
            confidence,
            source,
        }
    }
}

/// 帧尺寸 (帧元数据, 跟踪器只需要宽高)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(frame: &image::RgbImage) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identity_and_disjoint() {
        let a = PersonBox::new(10.0, 10.0, 50.0, 100.0);
        let b = PersonBox::new(200.0, 10.0, 50.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
        assert_eq!(b.iou(&a), 0.0);
    }

    #[test]
    fn test_iou_touching_edges_is_zero() {
        let a = PersonBox::new(0.0, 0.0, 10.0, 10.0);
        let b = PersonBox::new(10.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_center_and_aspect() {
        let b = PersonBox::new(100.0, 100.0, 40.0, 100.0);
        assert_eq!(b.center(), (120.0, 150.0));
        assert!((b.aspect() - 2.5).abs() < 1e-6);
        assert_eq!(PersonBox::new(0.0, 0.0, 0.0, 10.0).aspect(), 0.0);
    }

    #[test]
    fn test_from_center_roundtrip_geometry() {
        let b = PersonBox::from_center(50.0, 100.0, 20.0, 60.0);
        assert_eq!(b, PersonBox::new(40.0, 70.0, 20.0, 60.0));
        assert_eq!(PersonBox::from_corners(40.0, 70.0, 60.0, 130.0), b);
    }
}
