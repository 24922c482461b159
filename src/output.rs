// 该文件是 Baxin （靶心） 项目的一部分。
// src/output.rs - 输出定义
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

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, input::ImageHandle, score::TargetGeometry, task::SessionEnd,
};

pub trait Render<Frame: ?Sized, Output: ?Sized> {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

impl<F: ?Sized, O: ?Sized, R: Render<F, O>> Render<F, O> for Vec<R> {
  type Error = R::Error;

  fn render_result(&self, frame: &F, result: &O) -> Result<(), Self::Error> {
    for output in self {
      output.render_result(frame, result)?;
    }
    Ok(())
  }
}

mod json_record;
pub use self::json_record::{JsonRecordError, JsonRecordOutput};

#[cfg(feature = "save_image_file")]
mod annotate;
#[cfg(feature = "save_image_file")]
pub use self::annotate::{AnnotatedImageError, AnnotatedImageOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("JSON 记录输出错误: {0}")]
  JsonRecordError(#[from] JsonRecordError),
  #[cfg(feature = "save_image_file")]
  #[error("标注图像输出错误: {0}")]
  AnnotatedImageError(#[from] AnnotatedImageError),
  #[error("不支持的输出方案: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  JsonRecordOutput(JsonRecordOutput),
  #[cfg(feature = "save_image_file")]
  AnnotatedImageOutput(AnnotatedImageOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      JsonRecordOutput::SCHEME => {
        let output = JsonRecordOutput::from_url(url)?;
        Ok(OutputWrapper::JsonRecordOutput(output))
      }
      #[cfg(feature = "save_image_file")]
      AnnotatedImageOutput::SCHEME => {
        let output = AnnotatedImageOutput::from_url(url)?;
        Ok(OutputWrapper::AnnotatedImageOutput(output))
      }
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl OutputWrapper {
  /// 标注输出需要靶面几何来绘制环线；其他输出忽略。
  #[cfg_attr(not(feature = "save_image_file"), allow(unused_variables))]
  pub fn with_target(self, geometry: &TargetGeometry) -> Self {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::AnnotatedImageOutput(output) => {
        OutputWrapper::AnnotatedImageOutput(output.with_target(geometry.clone()))
      }
      other => other,
    }
  }
}

impl Render<ImageHandle, [SessionEnd]> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &ImageHandle, result: &[SessionEnd]) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::JsonRecordOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "save_image_file")]
      OutputWrapper::AnnotatedImageOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}
