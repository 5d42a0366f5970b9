// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测工作线程 (Detection Worker)
//! 职责: 接收最新帧 → 后端检测 → 过滤 + NMS → 发布到共享结果槽
//!
//! 待处理槽容量为 1: 槽满时新帧直接丢弃, 工作线程始终处理较新的帧而不会积压。
//! 消费方读取的是最近一次发布的结果, 可能落后当前帧一帧或多帧。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::filter::DetectionFilter;
use super::types::{Detection, FrameSize};
use crate::config::{CounterConfig, WorkerConfig};
use crate::error::Result;
use crate::models::{DetectorBank, ModelKind};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 每秒统计一次的帧率计数器
#[derive(Debug)]
struct FpsCounter {
    count: u64,
    /// 累计帧数, 决定性能日志的输出间隔
    total: u64,
    last: Instant,
    current_fps: f64,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            count: 0,
            total: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }

    fn tick(&mut self) {
        self.count += 1;
        self.total += 1;
        let now = Instant::now();
        if now.duration_since(self.last).as_secs() >= 1 {
            self.current_fps = self.count as f64 / now.duration_since(self.last).as_secs_f64();
            self.count = 0;
            self.last = now;
        }
    }

    /// 每 60 帧输出一次性能日志
    fn should_log(&self) -> bool {
        self.total % 60 == 0
    }
}

/// 检测流水线: 后端 + 过滤器
pub struct DetectionPipeline {
    bank: DetectorBank,
    filter: DetectionFilter,
    stats: FpsCounter,
}

impl DetectionPipeline {
    pub fn new(config: &CounterConfig) -> Self {
        Self::with_bank(DetectorBank::new(&config.model), DetectionFilter::new(config.filter.clone()))
    }

    pub fn with_bank(bank: DetectorBank, filter: DetectionFilter) -> Self {
        Self {
            bank,
            filter,
            stats: FpsCounter::new(),
        }
    }

    /// 检测一帧
    ///
    /// 单帧检测失败按零检测处理, 只记录日志。
    pub fn run(&mut self, frame: &RgbImage) -> Vec<Detection> {
        let start = Instant::now();
        let threshold = self.filter.config().confidence_threshold;

        let raw = match self.bank.detect(frame, threshold) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("⚠️  {}", e);
                Vec::new()
            }
        };
        let raw_count = raw.len();
        let detections = self.filter.apply(raw, FrameSize::of(frame));

        self.stats.tick();
        if self.stats.should_log() {
            debug!(
                "🎯 检测: {}人 (原始{}个) | {:.1}ms/帧 | {:.1}fps | 后端: {}",
                detections.len(),
                raw_count,
                start.elapsed().as_secs_f64() * 1000.0,
                self.stats.current_fps,
                self.bank.active()
            );
        }
        detections
    }

    pub fn fps(&self) -> f64 {
        self.stats.current_fps
    }

    pub fn select(&mut self, kind: ModelKind) -> Result<()> {
        self.bank.select(kind)
    }

    pub fn active(&self) -> ModelKind {
        self.bank.active()
    }

    pub fn available_models(&self) -> Vec<ModelKind> {
        self.bank.available_models()
    }

    pub fn set_confidence_threshold(&mut self, threshold: f32) {
        self.filter.set_confidence_threshold(threshold);
    }
}

/// 后台检测工作线程
pub struct DetectionWorker {
    tx: Option<Sender<RgbImage>>,
    results: Arc<Mutex<Vec<Detection>>>,
    pipeline: Arc<Mutex<DetectionPipeline>>,
    stop: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl DetectionWorker {
    pub fn spawn(pipeline: Arc<Mutex<DetectionPipeline>>, config: &WorkerConfig) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<RgbImage>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let results = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let poll = Duration::from_millis(config.poll_interval_ms.max(1));
        let handle = {
            let results = results.clone();
            let pipeline = pipeline.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("detection-worker".into())
                .spawn(move || {
                    worker_loop(rx, &pipeline, &results, &stop, poll);
                    let _ = done_tx.send(());
                })?
        };

        info!("🔍 检测线程启动");
        Ok(Self {
            tx: Some(tx),
            results,
            pipeline,
            stop,
            done_rx,
            handle: Some(handle),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        })
    }

    /// 提交一帧, 待处理槽已满时丢弃并返回 false
    pub fn submit(&self, frame: &RgbImage) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.is_full() {
            return false;
        }
        tx.try_send(frame.clone()).is_ok()
    }

    /// 最近一次发布的检测结果
    pub fn latest(&self) -> Vec<Detection> {
        lock(&self.results).clone()
    }

    pub fn pipeline(&self) -> &Arc<Mutex<DetectionPipeline>> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 通知线程退出并在限定时间内等待
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        self.tx = None;

        match self.done_rx.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("⚠️  检测线程异常退出");
                } else {
                    info!("✅ 检测线程已停止");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "⚠️  检测线程 {}ms 内未退出, 放弃等待",
                    self.shutdown_timeout.as_millis()
                );
            }
        }
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: Receiver<RgbImage>,
    pipeline: &Mutex<DetectionPipeline>,
    results: &Mutex<Vec<Detection>>,
    stop: &AtomicBool,
    poll: Duration,
) {
    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(poll) {
            Ok(frame) => {
                let detections = lock(pipeline).run(&frame);
                *lock(results) = detections;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("检测线程退出循环");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn pipeline() -> (tempfile::TempDir, Arc<Mutex<DetectionPipeline>>) {
        let dir = tempfile::tempdir().unwrap();
        let config = CounterConfig {
            model: ModelConfig {
                models_dir: dir.path().to_path_buf(),
                ..ModelConfig::default()
            },
            ..CounterConfig::default()
        };
        (dir, Arc::new(Mutex::new(DetectionPipeline::new(&config))))
    }

    #[test]
    fn test_fps_counter_window() {
        let mut fps = FpsCounter::new();
        fps.last = Instant::now() - Duration::from_secs(2);
        fps.count = 9;
        fps.tick();
        assert!(fps.current_fps > 4.0 && fps.current_fps < 5.1);
        assert_eq!(fps.count, 0);
    }

    #[test]
    fn test_perf_log_every_sixty_frames() {
        let mut fps = FpsCounter::new();
        let mut logged = Vec::new();
        for frame in 1..=130u64 {
            // 每 25 帧跨过一次秒窗口, 帧率计数被清零
            if frame % 25 == 0 {
                fps.last = Instant::now() - Duration::from_secs(1);
            }
            fps.tick();
            if fps.should_log() {
                logged.push(frame);
            }
        }
        assert_eq!(logged, vec![60, 120]);
    }

    #[test]
    fn test_pipeline_runs_synchronously() {
        let (_dir, pipeline) = pipeline();
        let frame = RgbImage::new(320, 240);
        let detections = lock(&pipeline).run(&frame);
        assert!(detections.is_empty());
        assert_eq!(lock(&pipeline).active(), ModelKind::Baseline);
    }

    #[test]
    fn test_worker_processes_and_stops() {
        let (_dir, pipeline) = pipeline();
        let mut worker = DetectionWorker::spawn(pipeline, &WorkerConfig::default()).unwrap();
        assert!(worker.is_running());

        let frame = RgbImage::new(320, 240);
        // 第一帧一定能放入空槽
        assert!(worker.submit(&frame));
        // 连续提交时槽可能仍被占用, 只能是丢弃而不是阻塞
        for _ in 0..10 {
            let _ = worker.submit(&frame);
        }
        assert!(worker.latest().is_empty());

        worker.shutdown();
        assert!(!worker.is_running());
        assert!(!worker.submit(&frame));
    }

    #[test]
    fn test_full_slot_drops_frame() {
        let (_dir, pipeline) = pipeline();
        let mut worker = DetectionWorker::spawn(pipeline.clone(), &WorkerConfig::default()).unwrap();
        let frame = RgbImage::new(320, 240);

        {
            // 占住流水线, 让工作线程卡在第一帧
            let _busy = lock(&pipeline);
            assert!(worker.submit(&frame));
            std::thread::sleep(Duration::from_millis(200));

            assert!(worker.submit(&frame));
            assert!(!worker.submit(&frame));
        }

        worker.shutdown();
    }
}
