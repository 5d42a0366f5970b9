// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 人数统计入口 (People Counter)
//!
//! 帧循环线程调用 `process_frame`: 检测交给后台线程(或同步执行), 跟踪在调用线程完成。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use image::RgbImage;
use tracing::{info, warn};

use crate::config::{clamp_confidence, CounterConfig};
use crate::detection::{
    track_views, CountBoard, CountSnapshot, Detection, DetectionPipeline, DetectionWorker, FrameSize,
    PersonTracker, TrackView,
};
use crate::error::Result;
use crate::models::ModelKind;

pub struct PeopleCounter {
    pipeline: Arc<Mutex<DetectionPipeline>>,
    worker: Option<DetectionWorker>,
    tracker: PersonTracker,
    board: CountBoard,
    confidence_threshold: f32,
}

impl PeopleCounter {
    /// 构建检测后端并按配置启动检测线程; 线程创建失败时退回同步检测
    pub fn new(mut config: CounterConfig) -> Self {
        config.filter.confidence_threshold = clamp_confidence(config.filter.confidence_threshold);
        let pipeline = Arc::new(Mutex::new(DetectionPipeline::new(&config)));

        let worker = if config.worker.enabled {
            match DetectionWorker::spawn(pipeline.clone(), &config.worker) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!("⚠️  检测线程启动失败, 使用同步检测: {}", e);
                    None
                }
            }
        } else {
            info!("ℹ️  检测线程已禁用, 使用同步检测");
            None
        };

        Self {
            pipeline,
            worker,
            tracker: PersonTracker::new(config.tracker.clone(), config.filter.clone()),
            board: CountBoard::new(),
            confidence_threshold: config.filter.confidence_threshold,
        }
    }

    fn pipeline(&self) -> MutexGuard<'_, DetectionPipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 获取检测结果
    ///
    /// 异步模式下提交当前帧(槽满则丢弃)并返回最近一次发布的结果。
    pub fn detect(&mut self, frame: &RgbImage) -> Vec<Detection> {
        match &self.worker {
            Some(worker) => {
                worker.submit(frame);
                worker.latest()
            }
            None => self.pipeline().run(frame),
        }
    }

    /// 处理一帧, 返回最新计数
    pub fn process_frame(&mut self, frame: &RgbImage) -> CountSnapshot {
        self.process_frame_at(frame, Instant::now())
    }

    pub fn process_frame_at(&mut self, frame: &RgbImage, now: Instant) -> CountSnapshot {
        let detections = self.detect(frame);
        let snapshot = self
            .tracker
            .process_detections_at(&detections, FrameSize::of(frame), now);
        self.board.publish(snapshot);
        snapshot
    }

    /// 切换检测后端, 目标未加载时返回错误且保持原后端
    pub fn set_model(&mut self, kind: ModelKind) -> Result<()> {
        self.pipeline().select(kind)
    }

    /// 按名称切换 (hog/ssd/yolo/hailo 或 baseline/secondary/tertiary/accelerator)
    pub fn set_model_by_name(&mut self, name: &str) -> Result<()> {
        let kind: ModelKind = name.parse()?;
        self.set_model(kind)
    }

    pub fn model_type(&self) -> ModelKind {
        self.pipeline().active()
    }

    pub fn available_models(&self) -> Vec<ModelKind> {
        self.pipeline().available_models()
    }

    /// 设置置信度阈值, 限制在 [0.1, 1.0], 返回实际生效值
    pub fn set_confidence_threshold(&mut self, threshold: f32) -> f32 {
        let threshold = clamp_confidence(threshold);
        self.confidence_threshold = threshold;
        self.pipeline().set_confidence_threshold(threshold);
        self.tracker.set_confidence_threshold(threshold);
        info!("🎚️  置信度阈值: {:.2}", threshold);
        threshold
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn set_min_detection_frames(&mut self, frames: u32) {
        self.tracker.set_min_detection_frames(frames);
    }

    pub fn snapshot(&self) -> CountSnapshot {
        self.tracker.snapshot()
    }

    /// 可跨线程读取计数的句柄
    pub fn board(&self) -> CountBoard {
        self.board.clone()
    }

    /// 检测帧率
    pub fn fps(&self) -> f64 {
        self.pipeline().fps()
    }

    pub fn tracker(&self) -> &PersonTracker {
        &self.tracker
    }

    pub fn tracks(&self, now: Instant) -> Vec<TrackView> {
        track_views(&self.tracker, now)
    }

    pub fn toggle_debug_mode(&mut self) -> bool {
        let on = self.tracker.toggle_debug_mode();
        info!("🐞 调试模式: {}", if on { "开启" } else { "关闭" });
        on
    }

    pub fn is_async(&self) -> bool {
        self.worker.is_some()
    }

    /// 停止检测线程, 之后退回同步检测
    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl Drop for PeopleCounter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
