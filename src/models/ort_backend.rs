// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ONNX Runtime 推理引擎封装

use std::path::{Path, PathBuf};

use ndarray::{Array, IxDyn};
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::info;

use super::ModelKind;
use crate::error::{CounterError, Result};

/// 执行设备
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
    Trt(i32),
}

/// 引擎构建参数
#[derive(Clone, Debug)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
    pub kind: ModelKind,
}

pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    kind: ModelKind,
}

impl std::fmt::Debug for OrtBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtBackend")
            .field("ep", &self.ep)
            .field("kind", &self.kind)
            .finish()
    }
}

impl OrtBackend {
    /// 加载模型文件
    ///
    /// GPU 执行设备注册失败时直接报错, 不静默退回 CPU。
    pub fn build(args: OrtConfig) -> Result<Self> {
        let kind = args.kind;
        if !Path::new(&args.f).exists() {
            return Err(CounterError::resource(
                kind,
                format!("模型文件不存在: {}", args.f.display()),
            ));
        }

        let mut builder = Session::builder()
            .map_err(|e| CounterError::resource(kind, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| CounterError::resource(kind, e))?;

        builder = match args.ep {
            OrtEP::CPU => builder,
            OrtEP::CUDA(device_id) => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure()])
                .map_err(|e| CounterError::resource(kind, e))?,
            OrtEP::Trt(device_id) => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(device_id)
                        .with_fp16(true)
                        .build()
                        .error_on_failure(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build()
                        .error_on_failure(),
                ])
                .map_err(|e| CounterError::resource(kind, e))?,
        };

        let session = builder
            .commit_from_file(&args.f)
            .map_err(|e| CounterError::resource(kind, e))?;

        info!("✅ {} 模型已加载: {} ({:?})", kind, args.f.display(), args.ep);
        Ok(Self {
            session,
            ep: args.ep,
            kind,
        })
    }

    /// 前向推理, 返回全部输出
    pub fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let kind = self.kind;
        let input = Tensor::from_array(xs).map_err(|e| CounterError::transient(kind, e))?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| CounterError::transient(kind, e))?;

        let mut ys = Vec::with_capacity(outputs.len());
        for i in 0..outputs.len() {
            let y = outputs[i]
                .try_extract_array::<f32>()
                .map_err(|e| CounterError::transient(kind, e))?;
            ys.push(y.to_owned());
        }
        Ok(ys)
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }
}
