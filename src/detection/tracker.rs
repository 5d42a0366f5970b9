// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 多目标跟踪器 (Person Tracker)
//!
//! 核心思想:
//! 1. 每个检测按加权代价(位置/形状/IOU/时间)贪心匹配到已有目标
//! 2. 新目标先为 Tentative, 连续匹配足够帧数后转为 Active 并计入 entries
//! 3. 短暂丢失的目标用速度外推预测位置, 丢失过久则 Exited(计入 exits) 或 Invalid
//! 4. 目标数量过多时才回收终态记录, 摊销清理开销
//!
//! 贪心匹配不是全局最优, 交叉轨迹下可能发生身份互换。

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use super::counting::CountSnapshot;
use super::filter::is_valid_person;
use super::types::{Detection, FrameSize, PersonBox};
use crate::config::{FilterConfig, TrackerConfig};
use crate::models::ModelKind;

/// 目标生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    /// 待确认
    Tentative,
    /// 已确认 (计入当前人数)
    Active,
    /// 已离开 (终态)
    Exited,
    /// 从未确认即消失 (终态)
    Invalid,
}

impl TrackStatus {
    /// 终态目标不再参与匹配与老化
    pub fn is_terminal(self) -> bool {
        matches!(self, TrackStatus::Exited | TrackStatus::Invalid)
    }

    /// 允许的状态转移: Tentative→Active, Tentative→Invalid, Active→Exited
    pub fn can_transition_to(self, next: TrackStatus) -> bool {
        matches!(
            (self, next),
            (TrackStatus::Tentative, TrackStatus::Active)
                | (TrackStatus::Tentative, TrackStatus::Invalid)
                | (TrackStatus::Active, TrackStatus::Exited)
        )
    }
}

/// 跟踪对象
#[derive(Clone, Debug)]
pub struct TrackedPerson {
    /// 唯一跟踪ID, 永不复用
    pub id: u64,

    /// 最近一次观测到的边界框
    pub bbox: PersonBox,

    /// 最近一次观测到的中心点
    pub center: (f32, f32),

    pub first_seen: Instant,
    pub last_seen: Instant,

    /// 成功匹配的帧数 (只增不减)
    pub frames_tracked: u32,

    /// 历史最高置信度
    pub confidence: f32,

    /// 速度 (像素/秒)
    pub velocity: (f32, f32),

    /// 历史轨迹 (中心点), 仅用于调试显示
    pub trajectory: VecDeque<(f32, f32)>,

    /// 短暂丢失时的外推位置, 重新匹配后清空
    pub predicted_box: Option<PersonBox>,

    pub status: TrackStatus,

    /// 最近一次匹配的检测来源
    pub source: ModelKind,
}

impl TrackedPerson {
    fn new(id: u64, detection: &Detection, now: Instant) -> Self {
        let center = detection.bbox.center();
        let mut trajectory = VecDeque::new();
        trajectory.push_back(center);

        Self {
            id,
            bbox: detection.bbox,
            center,
            first_seen: now,
            last_seen: now,
            frames_tracked: 1,
            confidence: detection.confidence,
            velocity: (0.0, 0.0),
            trajectory,
            predicted_box: None,
            status: TrackStatus::Tentative,
            source: detection.source,
        }
    }

    /// 距上次观测的秒数
    pub fn seconds_missing(&self, now: Instant) -> f32 {
        now.saturating_duration_since(self.last_seen).as_secs_f32()
    }

    /// 按速度外推的中心点
    pub fn predicted_center(&self, now: Instant) -> (f32, f32) {
        let dt = self.seconds_missing(now);
        (
            self.center.0 + self.velocity.0 * dt,
            self.center.1 + self.velocity.1 * dt,
        )
    }

    /// 匹配成功后更新几何/速度/计数
    fn observe(&mut self, detection: &Detection, now: Instant, config: &TrackerConfig) {
        let new_center = detection.bbox.center();
        let dt = self.seconds_missing(now);

        // 时间间隔过小时保留原速度, 避免除法放大
        if dt > config.velocity_epsilon_secs {
            self.velocity = (
                (new_center.0 - self.center.0) / dt,
                (new_center.1 - self.center.1) / dt,
            );
        }

        self.bbox = detection.bbox;
        self.center = new_center;
        self.last_seen = now;
        self.frames_tracked += 1;
        self.confidence = self.confidence.max(detection.confidence);
        self.source = detection.source;
        self.predicted_box = None;

        self.trajectory.push_back(new_center);
        while self.trajectory.len() > config.trajectory_len {
            self.trajectory.pop_front();
        }
    }

    fn transition(&mut self, next: TrackStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "非法状态转移 {:?} → {:?}",
            self.status,
            next
        );
        self.status = next;
    }
}

/// 人员跟踪器
///
/// 不做内部同步, 只能由调用 `process_detections` 的单一线程持有。
pub struct PersonTracker {
    config: TrackerConfig,

    /// 检测合理性判定 (与检测过滤器同一套规则)
    filter: FilterConfig,

    /// 所有跟踪对象, 按ID有序
    people: BTreeMap<u64, TrackedPerson>,

    /// 下一个分配的ID
    next_id: u64,

    entries: u64,
    exits: u64,
    current: u64,

    /// 最近一帧的尺寸
    frame: FrameSize,

    debug_mode: bool,
}

impl PersonTracker {
    pub fn new(config: TrackerConfig, filter: FilterConfig) -> Self {
        Self {
            config,
            filter,
            people: BTreeMap::new(),
            next_id: 0,
            entries: 0,
            exits: 0,
            current: 0,
            frame: FrameSize::new(0, 0),
            debug_mode: false,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn set_confidence_threshold(&mut self, threshold: f32) {
        self.filter.confidence_threshold = threshold;
    }

    pub fn set_min_detection_frames(&mut self, frames: u32) {
        self.config.min_detection_frames = frames.max(1);
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn exits(&self) -> u64 {
        self.exits
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn frame_size(&self) -> FrameSize {
        self.frame
    }

    pub fn get(&self, id: u64) -> Option<&TrackedPerson> {
        self.people.get(&id)
    }

    /// 当前保留的所有跟踪对象 (含终态, 直到被回收)
    pub fn tracks(&self) -> impl Iterator<Item = &TrackedPerson> {
        self.people.values()
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// 切换调试模式, 返回新状态
    pub fn toggle_debug_mode(&mut self) -> bool {
        self.debug_mode = !self.debug_mode;
        self.debug_mode
    }

    /// 使用当前时间处理一帧检测结果
    pub fn process_detections(&mut self, detections: &[Detection], frame: FrameSize) -> CountSnapshot {
        self.process_detections_at(detections, frame, Instant::now())
    }

    /// 处理一帧检测结果
    ///
    /// 复杂度 O(检测数 × 存活目标数), 对任何检测输入都不会失败, 只改变计数。
    pub fn process_detections_at(
        &mut self,
        detections: &[Detection],
        frame: FrameSize,
        now: Instant,
    ) -> CountSnapshot {
        self.frame = frame;

        // 本帧已获得检测的目标 (含本帧新建)
        let mut matched: BTreeSet<u64> = BTreeSet::new();

        // 1-3. 逐个检测: 匹配已有目标或新建
        for detection in detections {
            if !is_valid_person(&self.filter, detection, frame) {
                continue;
            }

            match self.find_match(detection, now, &matched) {
                Some(id) => {
                    self.update_matched(id, detection, now);
                    matched.insert(id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.people
                        .insert(id, TrackedPerson::new(id, detection, now));
                    matched.insert(id);
                    debug!(
                        "👤 新目标 {} ({}): conf={:.2} 位置=({:.0}, {:.0}) 大小=({:.0}x{:.0})",
                        id,
                        detection.source,
                        detection.confidence,
                        detection.bbox.x,
                        detection.bbox.y,
                        detection.bbox.w,
                        detection.bbox.h
                    );
                }
            }
        }

        // 4. 未匹配目标: 预测或退出
        self.age_unmatched(&matched, now);

        // 5. 终态记录回收
        if self.people.len() > self.config.gc_trigger {
            self.collect_garbage(now);
        }

        // 6. 当前人数只由 Active 数量重算
        self.current = self
            .people
            .values()
            .filter(|p| p.status == TrackStatus::Active)
            .count() as u64;

        self.snapshot()
    }

    /// 检测与目标之间的匹配代价, 目标不可参与匹配时返回 None
    pub fn match_cost(&self, person: &TrackedPerson, detection: &Detection, now: Instant) -> Option<f32> {
        if person.status.is_terminal() {
            return None;
        }

        let time_gap = person.seconds_missing(now);
        if time_gap > self.config.match_window_secs {
            return None;
        }

        let c = &self.config;
        let new_box = &detection.bbox;
        let old_box = &person.bbox;

        // 位置: 与速度外推后的中心点距离
        let (nx, ny) = new_box.center();
        let (px, py) = person.predicted_center(now);
        let distance = ((nx - px).powi(2) + (ny - py).powi(2)).sqrt();

        // 形状: 面积比 (≥1) 与高宽比差
        let old_area = old_box.area();
        let new_area = new_box.area();
        if old_area <= 0.0 || new_area <= 0.0 {
            return None;
        }
        let area_ratio = (new_area / old_area).max(old_area / new_area);
        let aspect_diff = (new_box.aspect() - old_box.aspect()).abs();

        let iou = new_box.iou(old_box);

        let position_score = distance * c.position_weight;
        let shape_score = (area_ratio - 1.0) * c.area_weight + aspect_diff * c.aspect_weight;
        let iou_score = (1.0 - iou) * c.iou_weight;
        let time_score = time_gap * c.time_weight;

        Some(position_score + shape_score + iou_score + time_score)
    }

    /// 贪心匹配: 代价最低且低于阈值的目标, 同分时ID小者优先
    fn find_match(&self, detection: &Detection, now: Instant, matched: &BTreeSet<u64>) -> Option<u64> {
        let mut best: Option<(u64, f32)> = None;

        for (&id, person) in &self.people {
            if matched.contains(&id) {
                continue;
            }
            let Some(score) = self.match_cost(person, detection, now) else {
                continue;
            };
            if score >= self.config.match_score_threshold {
                continue;
            }
            if best.map_or(true, |(_, best_score)| score < best_score) {
                best = Some((id, score));
            }
        }

        best.map(|(id, _)| id)
    }

    fn update_matched(&mut self, id: u64, detection: &Detection, now: Instant) {
        let min_frames = self.config.min_detection_frames;
        let Some(person) = self.people.get_mut(&id) else {
            return;
        };
        person.observe(detection, now, &self.config);

        if person.status == TrackStatus::Tentative && person.frames_tracked >= min_frames {
            person.transition(TrackStatus::Active);
            self.entries += 1;
            info!("🚶 目标 {} 进入 (已确认), 累计进入: {}", id, self.entries);
        }
    }

    fn age_unmatched(&mut self, matched: &BTreeSet<u64>, now: Instant) {
        let (fw, fh) = (self.frame.width as f32, self.frame.height as f32);
        let missing_window = self.config.missing_window_secs;

        for (id, person) in self.people.iter_mut() {
            if matched.contains(id) || person.status.is_terminal() {
                continue;
            }

            let missing = person.seconds_missing(now);
            if missing <= missing_window {
                // 短暂丢失: 可能被遮挡, 外推位置并限制在画面内
                let b = person.bbox;
                let x = (b.x + person.velocity.0 * missing).min(fw - b.w).max(0.0);
                let y = (b.y + person.velocity.1 * missing).min(fh - b.h).max(0.0);
                person.predicted_box = Some(PersonBox::new(x, y, b.w, b.h));
                continue;
            }

            match person.status {
                TrackStatus::Active => {
                    person.transition(TrackStatus::Exited);
                    self.exits += 1;
                    info!("🚪 目标 {} 离开, 累计离开: {}", id, self.exits);
                }
                TrackStatus::Tentative => {
                    person.transition(TrackStatus::Invalid);
                    debug!("❎ 目标 {} 未确认即消失, 标记无效", id);
                }
                TrackStatus::Exited | TrackStatus::Invalid => {}
            }
        }
    }

    fn collect_garbage(&mut self, now: Instant) {
        let invalid_secs = self.config.invalid_retention_secs;
        let exited_secs = self.config.exited_retention_secs;
        let before = self.people.len();

        self.people.retain(|_, p| {
            let missing = p.seconds_missing(now);
            match p.status {
                TrackStatus::Invalid => missing <= invalid_secs,
                TrackStatus::Exited => missing <= exited_secs,
                _ => true,
            }
        });

        let removed = before - self.people.len();
        if removed > 0 {
            debug!("🧹 回收 {} 条终态记录, 剩余 {}", removed, self.people.len());
        }
    }

    pub fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            entries: self.entries,
            exits: self.exits,
            current: self.current,
        }
    }
}

impl Default for PersonTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default(), FilterConfig::default())
    }
}
