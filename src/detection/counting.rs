// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 计数报告 (Counting Reporter)
//! 职责: 把跟踪器状态投影为 {entries, exits, current} 快照, 以及调试用的目标视图

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::tracker::{PersonTracker, TrackStatus};
use super::types::PersonBox;

/// 调试模式下已离开目标的显示时长
pub const EXITED_DISPLAY_WINDOW: Duration = Duration::from_secs(5);

/// 计数快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CountSnapshot {
    /// 累计进入 (只增)
    pub entries: u64,
    /// 累计离开 (只增)
    pub exits: u64,
    /// 当前 Active 目标数
    pub current: u64,
}

/// 单个目标的可视化视图
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackView {
    pub id: u64,
    pub status: TrackStatus,
    pub bbox: PersonBox,
    pub predicted_box: Option<PersonBox>,
    pub confidence: f32,
    pub frames_tracked: u32,
    pub trajectory: Vec<(f32, f32)>,
}

/// 供界面/调试使用的目标列表
///
/// 常规模式只显示 Tentative 与 Active; 调试模式额外显示最近离开的目标。
pub fn track_views(tracker: &PersonTracker, now: Instant) -> Vec<TrackView> {
    let debug = tracker.debug_mode();
    tracker
        .tracks()
        .filter(|p| match p.status {
            TrackStatus::Tentative | TrackStatus::Active => true,
            TrackStatus::Exited => {
                debug && now.saturating_duration_since(p.last_seen) < EXITED_DISPLAY_WINDOW
            }
            TrackStatus::Invalid => false,
        })
        .map(|p| TrackView {
            id: p.id,
            status: p.status,
            bbox: p.bbox,
            predicted_box: p.predicted_box,
            confidence: p.confidence,
            frames_tracked: p.frames_tracked,
            trajectory: p.trajectory.iter().copied().collect(),
        })
        .collect()
}

/// 跨线程共享的计数板
///
/// 处理帧的线程发布, 其他线程随时读取最近一次快照。
#[derive(Clone, Debug, Default)]
pub struct CountBoard {
    inner: Arc<Mutex<CountSnapshot>>,
}

impl CountBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CountSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, snapshot: CountSnapshot) {
        *self.lock() = snapshot;
    }

    pub fn snapshot(&self) -> CountSnapshot {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{Detection, FrameSize};
    use crate::models::ModelKind;

    const FRAME: FrameSize = FrameSize {
        width: 640,
        height: 480,
    };

    fn person(x: f32) -> Detection {
        Detection::new(PersonBox::new(x, 100.0, 40.0, 100.0), 0.8, ModelKind::Baseline)
    }

    /// 确认一个目标后让它离开
    fn tracker_with_exited(t0: Instant) -> PersonTracker {
        let mut tracker = PersonTracker::default();
        for i in 0..5 {
            tracker.process_detections_at(
                &[person(100.0 + 5.0 * i as f32)],
                FRAME,
                t0 + Duration::from_secs(i),
            );
        }
        tracker.process_detections_at(&[], FRAME, t0 + Duration::from_secs(7));
        tracker
    }

    #[test]
    fn test_snapshot_serializes_as_counts() {
        let snapshot = CountSnapshot {
            entries: 3,
            exits: 1,
            current: 2,
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json, serde_json::json!({ "entries": 3, "exits": 1, "current": 2 }));
    }

    #[test]
    fn test_exited_hidden_outside_debug_mode() {
        let t0 = Instant::now();
        let tracker = tracker_with_exited(t0);
        assert!(track_views(&tracker, t0 + Duration::from_secs(8)).is_empty());
    }

    #[test]
    fn test_debug_mode_shows_recent_exits() {
        let t0 = Instant::now();
        let mut tracker = tracker_with_exited(t0);
        assert!(tracker.toggle_debug_mode());

        // 最后一次见到是 t0+4s
        let views = track_views(&tracker, t0 + Duration::from_secs(8));
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, TrackStatus::Exited);
        assert_eq!(views[0].trajectory.len(), 5);

        assert!(track_views(&tracker, t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_board_shared_between_handles() {
        let board = CountBoard::new();
        let reader = board.clone();
        assert_eq!(reader.snapshot(), CountSnapshot::default());

        let handle = std::thread::spawn(move || {
            board.publish(CountSnapshot {
                entries: 1,
                exits: 0,
                current: 1,
            });
        });
        handle.join().unwrap();
        assert_eq!(reader.snapshot().current, 1);
    }

    #[test]
    fn test_board_recovers_from_poisoned_lock() {
        let board = CountBoard::new();
        let inner = board.inner.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.lock().unwrap();
            panic!("发布线程崩溃");
        })
        .join();
        assert!(board.inner.is_poisoned());

        let counts = CountSnapshot {
            entries: 2,
            exits: 1,
            current: 1,
        };
        board.publish(counts);
        assert_eq!(board.snapshot(), counts);
    }
}
