// 该文件是 Baxin （靶心） 项目的一部分。
// src/output/json_record.rs - JSON 计分记录输出
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
  fs::OpenOptions,
  io::{self, Write},
  path::Path,
  sync::{Mutex, PoisonError},
};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, input::ImageHandle, output::Render, task::SessionEnd,
};

#[derive(Error, Debug)]
pub enum JsonRecordError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct ImageRecord<'a> {
  image: &'a str,
  total: u32,
  ends: &'a [SessionEnd],
}

/// 每张照片一行 JSON（JSON Lines）。
///
/// `json:///path/to/scores.jsonl` 追加写入文件，`json:-` 或 `json://-` 写到标准输出。
pub struct JsonRecordOutput {
  writer: Mutex<Box<dyn Write + Send>>,
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonRecordOutput {
  type Error = JsonRecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonRecordError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let path = url.path();
    if path.is_empty() || path == "-" || url.host_str() == Some("-") {
      Ok(Self::stdout())
    } else {
      Self::open(path)
    }
  }
}

impl JsonRecordOutput {
  pub fn stdout() -> Self {
    Self::from_writer(io::stdout())
  }

  pub fn open(path: impl AsRef<Path>) -> Result<Self, JsonRecordError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    debug!("计分记录写入: {}", path.display());
    Ok(Self::from_writer(file))
  }

  pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
    Self {
      writer: Mutex::new(Box::new(writer)),
    }
  }
}

impl Render<ImageHandle, [SessionEnd]> for JsonRecordOutput {
  type Error = JsonRecordError;

  fn render_result(&self, frame: &ImageHandle, result: &[SessionEnd]) -> Result<(), Self::Error> {
    let record = ImageRecord {
      image: frame.reference(),
      total: result.iter().map(|end| end.points).sum(),
      ends: result,
    };
    let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    serde_json::to_writer(&mut *writer, &record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::score::ScoreRing;
  use chrono::Utc;

  fn end(points: u32, ring: ScoreRing) -> SessionEnd {
    SessionEnd {
      image_reference: "face.jpg".to_string(),
      ring,
      points,
      impact: (10.0, 20.0),
      confidence: 0.8,
      label: Some("arrow".to_string()),
      scored_at: Utc::now(),
    }
  }

  #[test]
  fn appends_one_line_per_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records").join("scores.jsonl");
    let url = Url::parse(&format!("json://{}", path.display())).unwrap();
    let output = JsonRecordOutput::from_url(&url).unwrap();
    let image = ImageHandle::new(vec![0u8], "face.jpg");

    output
      .render_result(&image, &[end(10, ScoreRing::Ring(0)), end(0, ScoreRing::Miss)])
      .unwrap();
    output.render_result(&image, &[]).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);

    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["image"], "face.jpg");
    assert_eq!(first["total"], 10);
    assert_eq!(first["ends"][0]["ring"], 0);
    assert_eq!(first["ends"][1]["ring"], "miss");

    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["ends"].as_array().unwrap().len(), 0);
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("annotate:///tmp/out").unwrap();
    assert!(matches!(
      JsonRecordOutput::from_url(&url),
      Err(JsonRecordError::SchemeMismatch(_))
    ));
  }
}
