// 该文件是 Baxin （靶心） 项目的一部分。
// src/task/pipeline.rs - 单张照片的处理流水线
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

use std::{
  collections::HashSet,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{ConfigError, ObjectDetectionConfig},
  decode::{DecodeError, decode},
  input::{ImageHandle, InputError},
  model::InferenceGateway,
  preprocess::{PreprocessError, Preprocessor},
  score::{ScoreResult, ScoreRing, TargetGeometry, score},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("照片不可用: {0}")]
  InvalidImage(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("模型输出无效: {0}")]
  InvalidModelOutput(#[from] DecodeError),
  #[error("推理失败: {0}")]
  InferenceFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("该图像正在处理中")]
  AlreadyProcessing,
  #[error("配置加载失败: {0}")]
  ConfigurationLoadFailure(#[from] ConfigError),
  #[error("处理已取消")]
  Cancelled,
}

impl From<InputError> for PipelineError {
  fn from(e: InputError) -> Self {
    PipelineError::InvalidImage(Box::new(e))
  }
}

impl From<PreprocessError> for PipelineError {
  fn from(e: PreprocessError) -> Self {
    PipelineError::InvalidImage(Box::new(e))
  }
}

/// 共享的取消标志。推理调用本身不可中断，只在推理前后检查。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn reset(&self) {
    self.0.store(false, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  fn check(&self) -> Result<(), PipelineError> {
    if self.is_cancelled() {
      Err(PipelineError::Cancelled)
    } else {
      Ok(())
    }
  }
}

/// 一支箭的计分记录，交给会话管理方按顺序保存。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEnd {
  pub image_reference: String,
  pub ring: ScoreRing,
  pub points: u32,
  pub impact: (f32, f32),
  pub confidence: f32,
  pub label: Option<String>,
  pub scored_at: DateTime<Utc>,
}

struct InFlightGuard<'a> {
  registry: &'a Mutex<HashSet<usize>>,
  id: usize,
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    self
      .registry
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.id);
  }
}

/// 照片到分数的流水线：信箱变换、张量化、推理、解码、计分。
///
/// 同一物理图像缓冲区同一时刻最多只有一次处理；不同图像可以在多个线程上并行处理。
pub struct Pipeline<G> {
  config: Arc<ObjectDetectionConfig>,
  preprocessor: Box<dyn Preprocessor>,
  gateway: G,
  in_flight: Mutex<HashSet<usize>>,
  cancel: CancelFlag,
}

impl<G: InferenceGateway> Pipeline<G> {
  pub fn new(
    config: Arc<ObjectDetectionConfig>,
    preprocessor: Box<dyn Preprocessor>,
    gateway: G,
  ) -> Self {
    Self {
      config,
      preprocessor,
      gateway,
      in_flight: Mutex::new(HashSet::new()),
      cancel: CancelFlag::new(),
    }
  }

  /// 按配置中选定的预处理实现构建。
  pub fn from_config(config: Arc<ObjectDetectionConfig>, gateway: G) -> Self {
    let preprocessor = config.build_preprocessor();
    info!("预处理实现: {:?}", preprocessor);
    Self::new(config, preprocessor, gateway)
  }

  pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn cancel_flag(&self) -> CancelFlag {
    self.cancel.clone()
  }

  pub fn config(&self) -> &ObjectDetectionConfig {
    &self.config
  }

  pub fn gateway(&self) -> &G {
    &self.gateway
  }

  pub fn process(&self, image: &ImageHandle) -> Result<Vec<ScoreResult>, PipelineError> {
    self.process_with_geometry(image, &self.config.target)
  }

  /// 使用调用方提供的（例如逐张标定的）靶面几何计分。
  pub fn process_with_geometry(
    &self,
    image: &ImageHandle,
    geometry: &TargetGeometry,
  ) -> Result<Vec<ScoreResult>, PipelineError> {
    let _guard = self.acquire(image)?;
    self.cancel.check()?;

    let frame = image.decode()?;
    let config = &self.config;
    let preprocessed = self.preprocessor.preprocess(&frame, config.input_size)?;
    drop(frame);
    debug!(
      "{}: 缩放 {:.4}, 填充 ({:.1}, {:.1})",
      image.reference(),
      preprocessed.scale(),
      preprocessed.pad_x(),
      preprocessed.pad_y()
    );

    self.cancel.check()?;
    let now = std::time::Instant::now();
    let raw = self
      .gateway
      .infer(&preprocessed.tensor)
      .map_err(|e| PipelineError::InferenceFailure(Box::new(e)))?;
    debug!("推理耗时: {:.2?}", now.elapsed());
    self.cancel.check()?;

    let impact_class = config.impact_class_id();
    let results = decode(
      &raw,
      &preprocessed,
      config.confidence_threshold,
      config.iou_threshold,
      &config.class_labels,
      &config.output_layout,
    )?
    .filter(|detection| impact_class.is_none_or(|id| detection.class_id == id))
    .map(|detection| score(&detection, geometry))
    .collect::<Vec<_>>();

    info!(
      "{}: 检出 {} 支箭, 共 {} 分",
      image.reference(),
      results.len(),
      results.iter().map(|r| r.points).sum::<u32>()
    );
    Ok(results)
  }

  /// 将计分结果转换为会话记录，时间戳取同一时刻。
  pub fn session_ends(&self, image: &ImageHandle, results: &[ScoreResult]) -> Vec<SessionEnd> {
    let scored_at = Utc::now();
    results
      .iter()
      .map(|result| SessionEnd {
        image_reference: image.reference().to_string(),
        ring: result.ring,
        points: result.points,
        impact: (result.detection.center_x, result.detection.center_y),
        confidence: result.detection.confidence,
        label: result
          .detection
          .label(&self.config.class_labels)
          .map(str::to_string),
        scored_at,
      })
      .collect()
  }

  fn acquire(&self, image: &ImageHandle) -> Result<InFlightGuard<'_>, PipelineError> {
    let id = image.buffer_id();
    let mut in_flight = self
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if !in_flight.insert(id) {
      warn!("{} 正在处理中, 拒绝重复请求", image.reference());
      return Err(PipelineError::AlreadyProcessing);
    }

    Ok(InFlightGuard {
      registry: &self.in_flight,
      id,
    })
  }
}

impl<G> std::fmt::Debug for Pipeline<G> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pipeline")
      .field("input_size", &self.config.input_size)
      .field("preprocessor", &self.preprocessor)
      .finish_non_exhaustive()
  }
}
