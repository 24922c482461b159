// 该文件是 Baxin （靶心） 项目的一部分。
// src/model.rs - 推理网关
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

use crate::frame::InputTensor;

/// 推理网关：张量输入，原始输出张量返回。模型本身对流水线不透明。
///
/// 实现可以阻塞（I/O 或计算），这是流水线中唯一的挂起点；超时策略由实现自行决定。
pub trait InferenceGateway: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&self, input: &InputTensor) -> Result<RawOutput, Self::Error>;
}

impl<G: InferenceGateway + ?Sized> InferenceGateway for Box<G> {
  type Error = G::Error;

  fn infer(&self, input: &InputTensor) -> Result<RawOutput, Self::Error> {
    (**self).infer(input)
  }
}

impl<G: InferenceGateway + ?Sized> InferenceGateway for std::sync::Arc<G> {
  type Error = G::Error;

  fn infer(&self, input: &InputTensor) -> Result<RawOutput, Self::Error> {
    (**self).infer(input)
  }
}

/// 模型原始输出：行布局由配置中的 `OutputLayout` 描述。
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl RawOutput {
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self { shape, data }
  }

  /// 按行构造 `[1, N, F]` 输出，测试与自定义网关常用。
  pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Self {
    let features = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
    let data = rows
      .iter()
      .flat_map(|r| r.as_ref().iter().copied())
      .collect::<Vec<_>>();
    Self {
      shape: vec![1, rows.len(), features],
      data,
    }
  }

  /// 形状所描述的元素个数；乘积溢出时为 `None`。
  pub fn element_count(&self) -> Option<usize> {
    self
      .shape
      .iter()
      .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
  }
}

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxGateway, OnnxGatewayBuilder, OnnxGatewayError};
