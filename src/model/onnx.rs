// 该文件是 Baxin （靶心） 项目的一部分。
// src/model/onnx.rs - ONNX 推理网关
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use tract_onnx::prelude::{
  DatumExt, Framework, Graph, InferenceModelExt, SimplePlan, Tensor, TractError, TypedFact,
  TypedOp, tvec,
};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ObjectDetectionConfig,
  frame::InputTensor,
  model::{InferenceGateway, RawOutput},
};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Error, Debug)]
pub enum OnnxGatewayError {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("模型加载错误: {0}")]
  ModelLoadError(TractError),
  #[error("输入张量尺寸不匹配: 模型为 {expected}, 实际为 {actual}")]
  InputSizeMismatch { expected: u32, actual: u32 },
  #[error("模型执行错误: {0}")]
  ExecutionError(TractError),
  #[error("模型没有输出")]
  NoOutput,
}

/// `onnx:///path/to/model.onnx`
pub struct OnnxGatewayBuilder {
  model_path: PathBuf,
  optimize: bool,
}

impl FromUrlWithScheme for OnnxGatewayBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxGatewayBuilder {
  type Error = OnnxGatewayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OnnxGatewayError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(Self::new(url.path()))
  }
}

impl OnnxGatewayBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      optimize: true,
    }
  }

  pub fn optimize(mut self, optimize: bool) -> Self {
    self.optimize = optimize;
    self
  }

  /// 按已加载的配置固定输入形状 `[1, 3, S, S]` 并构建可执行计划。
  pub fn build(self, config: &ObjectDetectionConfig) -> Result<OnnxGateway, OnnxGatewayError> {
    let input_size = config.input_size;
    if !self.model_path.exists() {
      return Err(OnnxGatewayError::ModelNotFound(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let runnable = if self.optimize {
      match load_runnable(&self.model_path, input_size, true) {
        Ok(runnable) => runnable,
        Err(e) => {
          warn!("模型优化失败, 回退到未优化图: {}", e);
          load_runnable(&self.model_path, input_size, false)
            .map_err(OnnxGatewayError::ModelLoadError)?
        }
      }
    } else {
      load_runnable(&self.model_path, input_size, false).map_err(OnnxGatewayError::ModelLoadError)?
    };
    info!("模型加载完成, 输入尺寸 {}x{}", input_size, input_size);

    Ok(OnnxGateway {
      runnable,
      input_size,
    })
  }
}

fn load_runnable(path: &Path, input_size: u32, optimize: bool) -> Result<RunnableModel, TractError> {
  let size = input_size as usize;
  let model = tract_onnx::onnx()
    .model_for_path(path)?
    .with_input_fact(0, f32::fact([1, 3, size, size]).into())?;

  if optimize {
    model.into_optimized()?.into_runnable()
  } else {
    model.into_typed()?.into_decluttered()?.into_runnable()
  }
}

pub struct OnnxGateway {
  runnable: RunnableModel,
  input_size: u32,
}

impl std::fmt::Debug for OnnxGateway {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OnnxGateway")
      .field("input_size", &self.input_size)
      .finish()
  }
}

impl InferenceGateway for OnnxGateway {
  type Error = OnnxGatewayError;

  fn infer(&self, input: &InputTensor) -> Result<RawOutput, Self::Error> {
    if input.size() != self.input_size {
      return Err(OnnxGatewayError::InputSizeMismatch {
        expected: self.input_size,
        actual: input.size(),
      });
    }

    let tensor = Tensor::from_shape(&input.shape(), input.as_nchw())
      .map_err(OnnxGatewayError::ExecutionError)?;

    debug!("执行模型推理");
    let outputs = self
      .runnable
      .run(tvec![tensor.into()])
      .map_err(OnnxGatewayError::ExecutionError)?;

    let first = outputs.first().ok_or(OnnxGatewayError::NoOutput)?;
    let view = first
      .to_array_view::<f32>()
      .map_err(OnnxGatewayError::ExecutionError)?;
    let output = RawOutput::new(view.shape().to_vec(), view.iter().copied().collect());
    debug!("模型输出形状: {:?}", output.shape);

    Ok(output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_requires_onnx_scheme() {
    let url = Url::parse("rknn:///models/arrow.rknn").unwrap();
    assert!(matches!(
      OnnxGatewayBuilder::from_url(&url),
      Err(OnnxGatewayError::ModelPathError(_))
    ));
  }

  #[test]
  fn missing_model_file_is_reported() {
    let url = Url::parse("onnx:///no/such/model.onnx").unwrap();
    let builder = OnnxGatewayBuilder::from_url(&url).unwrap();
    let config = ObjectDetectionConfig::from_json_str(crate::config::tests::MINIMAL_CONFIG).unwrap();
    assert!(matches!(
      builder.build(&config),
      Err(OnnxGatewayError::ModelNotFound(_))
    ));
  }
}
