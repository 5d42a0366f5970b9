// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 人员检测与计数
//!
//! 数据流: 帧 → 检测后端 → 过滤 + NMS → 多目标跟踪 → {entries, exits, current}
pub mod config; // 统计配置参数
pub mod counter; // 帧循环入口
pub mod detection; // 过滤/跟踪/计数/检测线程
pub mod error; // 错误类型
pub mod models; // 检测后端
pub mod utils; // 图像缩放与张量打包

pub use crate::config::CounterConfig;
pub use crate::counter::PeopleCounter;
pub use crate::detection::{CountSnapshot, Detection, PersonBox, PersonTracker, TrackStatus};
pub use crate::error::{CounterError, Result};
pub use crate::models::{ModelKind, PersonDetector};
