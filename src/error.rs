// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 错误类型 (Error taxonomy)
//!
//! 检测/后端错误全部在本地吸收并降级处理,跟踪器本身不产生错误。

use thiserror::Error;

use crate::models::ModelKind;

#[derive(Debug, Error)]
pub enum CounterError {
    /// 请求切换到未加载的后端 (非致命, 当前后端保持不变)
    #[error("模型 {kind} 未加载, 无法切换")]
    Configuration { kind: ModelKind },

    /// 未知的后端名称
    #[error("未知模型类型: {0}")]
    UnknownModel(String),

    /// 模型文件缺失/无法解析, 或加速设备初始化失败
    #[error("{kind} 资源错误: {reason}")]
    Resource { kind: ModelKind, reason: String },

    /// 单次推理失败, 该帧按零检测处理
    #[error("{kind} 检测失败: {reason}")]
    TransientDetection { kind: ModelKind, reason: String },

    /// 配置文件读写错误
    #[error("配置文件 {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("配置解析失败: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl CounterError {
    pub fn resource(kind: ModelKind, reason: impl std::fmt::Display) -> Self {
        Self::Resource {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn transient(kind: ModelKind, reason: impl std::fmt::Display) -> Self {
        Self::TransientDetection {
            kind,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CounterError>;
