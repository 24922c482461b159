// 该文件是 Baxin （靶心） 项目的一部分。
// src/bin/simple_batch.rs - 批量照片计分
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

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use baxin::{
  FromUrl,
  config::ObjectDetectionConfig,
  input::ImageFileInput,
  model::OnnxGatewayBuilder,
  output::OutputWrapper,
  task::{BatchTask, Pipeline, PipelineError, Task},
};

/// Baxin 批量照片计分
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测配置文件 (JSON)
  #[arg(long, value_name = "CONFIG")]
  pub config: PathBuf,
  /// ONNX 模型，例如 onnx:///models/arrow.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 照片目录，例如 image:///photos/session-7
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，可重复指定
  #[arg(long, value_name = "OUTPUT", default_value = "json:-")]
  pub output: Vec<Url>,
  /// 最多处理的照片数量
  #[arg(long, value_name = "COUNT")]
  pub max_images: Option<usize>,
  /// 关闭图优化（某些模型优化失败时使用）
  #[arg(long)]
  pub no_optimize: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let args = Args::parse();

  info!("配置文件: {}", args.config.display());
  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);

  let config = ObjectDetectionConfig::load(&args.config).map_err(PipelineError::from)?;
  let config = Arc::new(config);

  let gateway = OnnxGatewayBuilder::from_url(&args.model)?
    .optimize(!args.no_optimize)
    .build(&config)?;
  let pipeline = Pipeline::from_config(config.clone(), gateway);

  let input = ImageFileInput::from_url(&args.input)?;
  info!("待处理照片 {} 张", input.remaining());
  let output = args
    .output
    .iter()
    .map(|url| OutputWrapper::from_url(url).map(|o| o.with_target(&config.target)))
    .collect::<Result<Vec<_>, _>>()?;

  let summary = BatchTask::default()
    .with_max_images(args.max_images)
    .run_task(input, &pipeline, output)?;

  if summary.failed > 0 {
    warn!("{} 张照片处理失败", summary.failed);
  }

  Ok(())
}
