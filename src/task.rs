// 该文件是 Baxin （靶心） 项目的一部分。
// src/task.rs - 任务调度
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

use std::{thread, time::Duration};

use anyhow::Context;
use tracing::{error, info, warn};

use crate::{input::ImageHandle, model::InferenceGateway, output::Render};

mod pipeline;
pub use self::pipeline::{CancelFlag, Pipeline, PipelineError, SessionEnd};

pub trait Task<I, G, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, pipeline: &Pipeline<G>, output: O)
  -> Result<Self::Output, Self::Error>;
}

/// 处理第一张照片，任何错误都直接返回。
pub struct OneShotTask;

impl<IE, RE, I, G, O> Task<I, G, O> for OneShotTask
where
  IE: std::error::Error + Send + Sync + 'static,
  RE: std::error::Error + Send + Sync + 'static,
  I: Iterator<Item = Result<ImageHandle, IE>>,
  G: InferenceGateway,
  O: Render<ImageHandle, [SessionEnd], Error = RE>,
{
  type Output = Vec<SessionEnd>;
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    pipeline: &Pipeline<G>,
    output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))??;
    info!("读取图像 {}, 开始处理...", image.reference());
    let now = std::time::Instant::now();
    let results = pipeline.process(&image)?;
    info!("处理完成，耗时: {:.2?}", now.elapsed());

    let ends = pipeline.session_ends(&image, &results);
    output.render_result(&image, &ends)?;
    info!("输出完成");

    Ok(ends)
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
  pub processed: usize,
  pub failed: usize,
  pub ends: usize,
  pub points: u32,
}

/// 逐张处理所有照片。单张照片的错误只记录和计数，不中断批处理；
/// Ctrl-C 在两张照片之间生效。
#[derive(Debug)]
pub struct BatchTask {
  max_images: Option<usize>,
  handle_signals: bool,
}

impl Default for BatchTask {
  fn default() -> Self {
    Self {
      max_images: None,
      handle_signals: true,
    }
  }
}

impl BatchTask {
  pub fn with_max_images(mut self, max_images: Option<usize>) -> Self {
    self.max_images = max_images;
    self
  }

  /// 不安装 Ctrl-C 处理器，由调用方通过 `CancelFlag` 自行取消。
  pub fn without_signal_handler(mut self) -> Self {
    self.handle_signals = false;
    self
  }
}

fn install_signal_handler(cancel: CancelFlag) -> anyhow::Result<()> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    cancel.cancel();
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理器")
}

impl<IE, RE, I, G, O> Task<I, G, O> for BatchTask
where
  IE: std::error::Error + Send + Sync + 'static,
  RE: std::error::Error + Send + Sync + 'static,
  I: Iterator<Item = Result<ImageHandle, IE>>,
  G: InferenceGateway,
  O: Render<ImageHandle, [SessionEnd], Error = RE>,
{
  type Output = BatchSummary;
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    pipeline: &Pipeline<G>,
    output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始批处理任务...");
    let cancel = pipeline.cancel_flag();
    if self.handle_signals {
      install_signal_handler(cancel.clone())?;
    }

    let mut summary = BatchSummary::default();
    for (index, image) in input.enumerate() {
      if cancel.is_cancelled() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      if self.max_images.is_some_and(|n| index >= n) {
        info!("达到指定数量 {}, 退出任务循环", index);
        break;
      }

      let image = match image {
        Ok(image) => image,
        Err(e) => {
          error!("第 {} 张图像读取失败: {}", index + 1, e);
          summary.failed += 1;
          continue;
        }
      };

      info!("处理第 {} 张图像: {}", index + 1, image.reference());
      let results = match pipeline.process(&image) {
        Ok(results) => results,
        Err(PipelineError::Cancelled) => {
          warn!("{} 处理被取消", image.reference());
          break;
        }
        Err(e) => {
          error!("{} 处理失败: {}", image.reference(), e);
          summary.failed += 1;
          continue;
        }
      };

      let ends = pipeline.session_ends(&image, &results);
      if let Err(e) = output.render_result(&image, &ends) {
        error!("{} 输出失败: {}", image.reference(), e);
        summary.failed += 1;
        continue;
      }

      summary.processed += 1;
      summary.ends += ends.len();
      summary.points += ends.iter().map(|end| end.points).sum::<u32>();
    }

    info!(
      "任务完成: 成功 {} 张, 失败 {} 张, 共 {} 支箭 {} 分",
      summary.processed, summary.failed, summary.ends, summary.points
    );
    Ok(summary)
  }
}
