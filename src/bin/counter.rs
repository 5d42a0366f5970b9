// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 人数统计 (People Counter)
//!
//! 把目录中的图片按文件名顺序当作视频帧回放, 每帧输出一行 JSON 计数:
//! {"timestamp": ..., "frame": ..., "entries": .., "exits": .., "current": .., "model": ..}
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use people_counter::{CounterConfig, PeopleCounter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 帧序列人数统计参数
#[derive(Parser, Debug)]
#[command(author, version, about = "人数统计 - 帧序列回放", long_about = None)]
struct Args {
    /// 帧图片目录 (png/jpg/bmp)
    #[arg(short, long)]
    frames: PathBuf,

    /// 配置文件 (不存在时写入默认配置)
    #[arg(short, long, default_value = "counter.json")]
    config: PathBuf,

    /// 模型目录
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// 检测后端: hog/ssd/yolo/hailo
    #[arg(short, long)]
    model: Option<String>,

    /// 置信度阈值 (0.1 - 1.0)
    #[arg(long)]
    conf: Option<f32>,

    /// 帧间隔 (毫秒)
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// 同步检测 (不启动检测线程, 使用回放时钟)
    #[arg(long, default_value_t = false)]
    sync: bool,
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("无法读取帧目录 {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"))
                .unwrap_or(false)
        })
        .collect();
    frames.sort();
    Ok(frames)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = CounterConfig::load(&args.config)?;
    if let Some(dir) = args.models_dir {
        config.model.models_dir = dir;
    }
    if args.sync {
        config.worker.enabled = false;
    }
    config.log_summary();

    let frames = list_frames(&args.frames)?;
    if frames.is_empty() {
        bail!("目录 {} 中没有图片", args.frames.display());
    }
    info!("🚀 人数统计启动, 共 {} 帧", frames.len());

    let mut counter = PeopleCounter::new(config);
    if let Some(name) = &args.model {
        if let Err(e) = counter.set_model_by_name(name) {
            warn!("⚠️  {}, 保持 {}", e, counter.model_type());
        }
    }
    if let Some(conf) = args.conf {
        counter.set_confidence_threshold(conf);
    }
    info!("📦 可用后端: {:?}", counter.available_models());

    let interval = Duration::from_millis(args.interval_ms);
    let t0 = Instant::now();

    for (i, path) in frames.iter().enumerate() {
        let frame = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!("⚠️  跳过 {}: {}", path.display(), e);
                continue;
            }
        };

        let counts = if args.sync {
            counter.process_frame_at(&frame, t0 + interval * i as u32)
        } else {
            std::thread::sleep(interval);
            counter.process_frame(&frame)
        };

        let line = serde_json::json!({
            "timestamp": chrono::Local::now().to_rfc3339(),
            "frame": path.file_name().map(|n| n.to_string_lossy().into_owned()),
            "entries": counts.entries,
            "exits": counts.exits,
            "current": counts.current,
            "model": counter.model_type(),
            "fps": counter.fps(),
        });
        println!("{}", line);
    }

    counter.shutdown();
    let total = counter.snapshot();
    info!(
        "✅ 完成: 进入 {} | 离开 {} | 当前 {}",
        total.entries, total.exits, total.current
    );
    Ok(())
}
