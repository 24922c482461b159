// 该文件是 Baxin （靶心） 项目的一部分。
// src/output/annotate.rs - 计分结果可视化
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
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{
    Mutex, PoisonError,
    atomic::{AtomicU32, Ordering},
  },
};

use chrono::Utc;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut, draw_line_segment_mut};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{ImageHandle, InputError},
  output::Render,
  score::{ScoreRing, TargetGeometry},
  task::SessionEnd,
};

const RING_COLOR: [u8; 3] = [255, 215, 0];
const HIT_COLOR: [u8; 3] = [0, 200, 0];
const MISS_COLOR: [u8; 3] = [220, 0, 0];

#[derive(Error, Debug)]
pub enum AnnotatedImageError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("输入图像错误: {0}")]
  InputError(#[from] InputError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// `annotate:///path/to/dir`：在照片上画出靶环和着靶点，保存为 PNG。
pub struct AnnotatedImageOutput {
  directory: PathBuf,
  target: Option<TargetGeometry>,
  counter: AtomicU32,
  stems: Mutex<HashMap<String, u32>>,
}

impl FromUrlWithScheme for AnnotatedImageOutput {
  const SCHEME: &'static str = "annotate";
}

impl FromUrl for AnnotatedImageOutput {
  type Error = AnnotatedImageError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(AnnotatedImageError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(Self::new(url.path()))
  }
}

impl AnnotatedImageOutput {
  pub fn new(directory: impl AsRef<Path>) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      target: None,
      counter: AtomicU32::new(0),
      stems: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_target(mut self, target: TargetGeometry) -> Self {
    self.target = Some(target);
    self
  }

  fn output_path(&self, reference: &str) -> PathBuf {
    let stem = Path::new(reference)
      .file_stem()
      .and_then(|s| s.to_str())
      .filter(|s| !s.is_empty());
    let name = match stem {
      Some(stem) => {
        // 不同目录下的同名照片依次加序号
        let mut stems = self.stems.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = stems.entry(stem.to_string()).or_insert(0);
        *seen += 1;
        match *seen {
          1 => format!("{}-scored.png", stem),
          n => format!("{}-scored-{}.png", stem, n),
        }
      }
      None => {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{:04X}.png", Utc::now().format("%Y%m%d-%H%M%S"), id)
      }
    };
    self.directory.join(name)
  }

  pub fn annotate(&self, image: &mut RgbImage, ends: &[SessionEnd]) {
    let stroke = (image.width().max(image.height()) / 500).max(1) as i32;

    if let Some(target) = &self.target {
      let (cx, cy) = target.center();
      let center = (cx.round() as i32, cy.round() as i32);
      for ring in target.rings() {
        let radius = ring.outer_radius.round() as i32;
        for offset in 0..stroke {
          draw_hollow_circle_mut(image, center, radius + offset, Rgb(RING_COLOR));
        }
      }
    }

    let arm = (stroke * 8) as f32;
    for end in ends {
      let color = match end.ring {
        ScoreRing::Ring(_) => Rgb(HIT_COLOR),
        ScoreRing::Miss => Rgb(MISS_COLOR),
      };
      let (x, y) = end.impact;
      draw_line_segment_mut(image, (x - arm, y - arm), (x + arm, y + arm), color);
      draw_line_segment_mut(image, (x - arm, y + arm), (x + arm, y - arm), color);
      draw_filled_circle_mut(image, (x.round() as i32, y.round() as i32), stroke, color);
    }
  }
}

impl Render<ImageHandle, [SessionEnd]> for AnnotatedImageOutput {
  type Error = AnnotatedImageError;

  fn render_result(&self, frame: &ImageHandle, result: &[SessionEnd]) -> Result<(), Self::Error> {
    let mut image = RgbImage::from(&frame.decode()?);
    self.annotate(&mut image, result);

    std::fs::create_dir_all(&self.directory)?;
    let path = self.output_path(frame.reference());
    image.save(&path)?;
    info!("保存标注图像到文件: {}", path.display());

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::tests::encode_png;

  fn end(x: f32, y: f32, ring: ScoreRing) -> SessionEnd {
    SessionEnd {
      image_reference: "face.png".to_string(),
      ring,
      points: 0,
      impact: (x, y),
      confidence: 0.9,
      label: None,
      scored_at: Utc::now(),
    }
  }

  #[test]
  fn draws_rings_and_impacts() {
    let target = TargetGeometry::concentric((50.0, 50.0), 40.0, 2, 10).unwrap();
    let output = AnnotatedImageOutput::new("/unused").with_target(target);
    let mut image = RgbImage::new(100, 100);

    output.annotate(
      &mut image,
      &[end(50.0, 50.0, ScoreRing::Ring(0)), end(95.0, 5.0, ScoreRing::Miss)],
    );

    assert_eq!(*image.get_pixel(90, 50), Rgb(RING_COLOR));
    assert_eq!(*image.get_pixel(50, 50), Rgb(HIT_COLOR));
    assert_eq!(*image.get_pixel(95, 5), Rgb(MISS_COLOR));
  }

  #[test]
  fn saves_png_named_after_reference() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("annotate://{}", dir.path().display())).unwrap();
    let output = AnnotatedImageOutput::from_url(&url).unwrap();
    let image = ImageHandle::new(encode_png(16, 12), "/photos/end-3.jpg");

    output.render_result(&image, &[]).unwrap();

    let saved = image::open(dir.path().join("end-3-scored.png")).unwrap();
    assert_eq!((saved.width(), saved.height()), (16, 12));
  }

  #[test]
  fn repeated_stems_do_not_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let output = AnnotatedImageOutput::new(dir.path());
    let first = ImageHandle::new(encode_png(16, 12), "/day1/end-1.jpg");
    let second = ImageHandle::new(encode_png(8, 6), "/day2/end-1.jpg");

    output.render_result(&first, &[]).unwrap();
    output.render_result(&second, &[]).unwrap();

    let a = image::open(dir.path().join("end-1-scored.png")).unwrap();
    let b = image::open(dir.path().join("end-1-scored-2.png")).unwrap();
    assert_eq!((a.width(), b.width()), (16, 8));
  }
}
