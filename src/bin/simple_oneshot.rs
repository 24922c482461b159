// 该文件是 Baxin （靶心） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张照片计分
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
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use baxin::{
  FromUrl,
  config::ObjectDetectionConfig,
  input::ImageFileInput,
  model::OnnxGatewayBuilder,
  output::OutputWrapper,
  task::{OneShotTask, Pipeline, PipelineError, Task},
};

/// Baxin 单张照片计分
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测配置文件 (JSON)
  #[arg(long, value_name = "CONFIG")]
  pub config: PathBuf,
  /// ONNX 模型，例如 onnx:///models/arrow.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入照片，例如 image:///photos/end-1.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，例如 json:- 或 annotate:///tmp/scored
  #[arg(long, value_name = "OUTPUT", default_value = "json:-")]
  pub output: Vec<Url>,
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

  let gateway = OnnxGatewayBuilder::from_url(&args.model)?.build(&config)?;
  let pipeline = Pipeline::from_config(config.clone(), gateway);

  let input = ImageFileInput::from_url(&args.input)?;
  let output = args
    .output
    .iter()
    .map(|url| OutputWrapper::from_url(url).map(|o| o.with_target(&config.target)))
    .collect::<Result<Vec<_>, _>>()?;

  let ends = OneShotTask.run_task(input, &pipeline, output)?;
  info!(
    "共 {} 支箭, 总分 {}",
    ends.len(),
    ends.iter().map(|end| end.points).sum::<u32>()
  );

  Ok(())
}
