// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测与跟踪系统 (Detection System)
//!
//! - Filter:  几何合理性过滤 + NMS
//! - Worker:  独立检测线程 (单槽交接)
//! - Tracker: 多目标跟踪状态机
//! - Counting: 进入/离开/当前人数
pub mod counting;
pub mod filter;
pub mod tracker;
pub mod types;
pub mod worker;

pub use counting::{track_views, CountBoard, CountSnapshot, TrackView};
pub use filter::{is_valid_person, non_max_suppression, DetectionFilter};
pub use tracker::{PersonTracker, TrackStatus, TrackedPerson};
pub use types::{Detection, FrameSize, PersonBox};
pub use worker::{DetectionPipeline, DetectionWorker};
