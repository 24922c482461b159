// 该文件是 Baxin （靶心） 项目的一部分。
// src/preprocess.rs - 信箱缩放与张量化
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

//! 把任意尺寸的照片映射为固定尺寸的模型输入，并记录逆变换。
//!
//! 两种实现可以互换：[`ImageOpsPreprocessor`] 使用 `image` 的三角滤波缩放，
//! [`FusedPreprocessor`] 用整数最近邻一次性写出 NCHW 张量。两者都满足同一份
//! [`LetterboxTransform`] 约定，解码阶段只依赖这份记录。

use image::{Rgb, RgbImage, imageops::FilterType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::frame::{ImageBuffer, InputTensor, RGB_CHANNELS};

/// 画布默认填充值（YOLO 系列惯用的灰色）。
pub const DEFAULT_PAD_VALUE: u8 = 114;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreprocessError {
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidImage { width: u32, height: u32 },
  #[error("模型输入尺寸必须大于零")]
  InvalidInputSize,
  #[error("张量化要求方形图像, 实际为 {width}x{height}")]
  NotSquare { width: u32, height: u32 },
}

/// 信箱变换参数。`scale`、`pad_x`、`pad_y` 共同确定模型空间到原图空间的仿射逆映射。
///
/// 填充量为缩放图在画布上实际的整数偏移；总填充为奇数时多出的一像素落在右侧或下侧。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LetterboxTransform {
  pub input_size: u32,
  pub original_width: u32,
  pub original_height: u32,
  /// 模型空间到原图空间的缩放因子（`1 / ratio`）。
  pub scale: f32,
  pub pad_x: f32,
  pub pad_y: f32,
}

impl LetterboxTransform {
  pub fn compute(width: u32, height: u32, input_size: u32) -> Result<Self, PreprocessError> {
    if width == 0 || height == 0 {
      return Err(PreprocessError::InvalidImage { width, height });
    }
    if input_size == 0 {
      return Err(PreprocessError::InvalidInputSize);
    }

    // 1 / min(S/w, S/h) == max(w/S, h/S)，后者在整数比例下是精确的
    let size = input_size as f64;
    let scale = (width as f64 / size).max(height as f64 / size);
    let (scaled_width, scaled_height) = scaled_dimensions(width, height, input_size, scale);

    Ok(Self {
      input_size,
      original_width: width,
      original_height: height,
      scale: scale as f32,
      pad_x: ((input_size - scaled_width) / 2) as f32,
      pad_y: ((input_size - scaled_height) / 2) as f32,
    })
  }

  pub fn ratio(&self) -> f32 {
    1.0 / self.scale
  }

  /// 缩放后（未填充）的图像尺寸。
  pub fn scaled_size(&self) -> (u32, u32) {
    scaled_dimensions(
      self.original_width,
      self.original_height,
      self.input_size,
      self.scale as f64,
    )
  }

  /// 缩放图在画布上的整数偏移。
  pub fn canvas_offset(&self) -> (u32, u32) {
    (self.pad_x as u32, self.pad_y as u32)
  }

  /// 原图坐标 → 模型坐标。
  pub fn forward(&self, x: f32, y: f32) -> (f32, f32) {
    (x / self.scale + self.pad_x, y / self.scale + self.pad_y)
  }

  /// 模型坐标 → 原图坐标。
  pub fn inverse(&self, x: f32, y: f32) -> (f32, f32) {
    ((x - self.pad_x) * self.scale, (y - self.pad_y) * self.scale)
  }

  /// 模型空间中的长度 → 原图空间中的长度。
  pub fn inverse_length(&self, length: f32) -> f32 {
    length * self.scale
  }

  /// 点是否落在原图 `[0, w) × [0, h)` 范围内。
  pub fn contains(&self, x: f32, y: f32) -> bool {
    x >= 0.0 && y >= 0.0 && x < self.original_width as f32 && y < self.original_height as f32
  }
}

fn scaled_dimensions(width: u32, height: u32, input_size: u32, scale: f64) -> (u32, u32) {
  let w = (width as f64 / scale).round() as u32;
  let h = (height as f64 / scale).round() as u32;
  (w.clamp(1, input_size), h.clamp(1, input_size))
}

/// 预处理结果：模型输入张量加上用于坐标还原的变换记录。
#[derive(Debug, Clone)]
pub struct PreprocessingResult {
  pub tensor: InputTensor,
  pub transform: LetterboxTransform,
}

impl PreprocessingResult {
  pub fn original_width(&self) -> u32 {
    self.transform.original_width
  }

  pub fn original_height(&self) -> u32 {
    self.transform.original_height
  }

  pub fn scale(&self) -> f32 {
    self.transform.scale
  }

  pub fn pad_x(&self) -> f32 {
    self.transform.pad_x
  }

  pub fn pad_y(&self) -> f32 {
    self.transform.pad_y
  }
}

/// 信箱缩放后的方形图像。
#[derive(Debug, Clone)]
pub struct Letterboxed {
  pub image: ImageBuffer,
  pub transform: LetterboxTransform,
}

/// 保持宽高比缩放并居中放置在 `input_size × input_size` 画布上。
pub fn letterbox(image: &ImageBuffer, input_size: u32) -> Result<Letterboxed, PreprocessError> {
  letterbox_with_fill(image, input_size, DEFAULT_PAD_VALUE)
}

pub fn letterbox_with_fill(
  image: &ImageBuffer,
  input_size: u32,
  pad_value: u8,
) -> Result<Letterboxed, PreprocessError> {
  let transform = LetterboxTransform::compute(image.width(), image.height(), input_size)?;
  let (scaled_width, scaled_height) = transform.scaled_size();
  let (offset_x, offset_y) = transform.canvas_offset();
  debug!(
    "信箱缩放: {}x{} -> {}x{}, 缩放因子 {:.4}, 填充 ({:.1}, {:.1})",
    image.width(),
    image.height(),
    scaled_width,
    scaled_height,
    transform.scale,
    transform.pad_x,
    transform.pad_y
  );

  let source = RgbImage::from(image);
  let resized = if (scaled_width, scaled_height) == (image.width(), image.height()) {
    source
  } else {
    image::imageops::resize(&source, scaled_width, scaled_height, FilterType::Triangle)
  };

  let mut canvas = RgbImage::from_pixel(input_size, input_size, Rgb([pad_value; 3]));
  image::imageops::replace(&mut canvas, &resized, offset_x as i64, offset_y as i64);

  Ok(Letterboxed {
    image: ImageBuffer::from(canvas),
    transform,
  })
}

/// 方形 RGB8 图像 → `[1, 3, S, S]` 浮点张量，每个通道除以 255。
pub fn tensorize(image: &ImageBuffer) -> Result<InputTensor, PreprocessError> {
  if image.width() != image.height() {
    return Err(PreprocessError::NotSquare {
      width: image.width(),
      height: image.height(),
    });
  }

  let size = image.width() as usize;
  let mut tensor = InputTensor::zeros(image.width());
  for (idx, pixel) in image.as_nhwc().chunks_exact(RGB_CHANNELS).enumerate() {
    let (y, x) = (idx / size, idx % size);
    for (c, value) in pixel.iter().enumerate() {
      tensor.set(c, y, x, *value as f32 / 255.0);
    }
  }
  Ok(tensor)
}

/// 预处理能力接口，启动时选定实现。
pub trait Preprocessor: Send + Sync + std::fmt::Debug {
  fn preprocess(
    &self,
    image: &ImageBuffer,
    input_size: u32,
  ) -> Result<PreprocessingResult, PreprocessError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessorKind {
  #[default]
  Imageops,
  Fused,
}

impl PreprocessorKind {
  pub fn build(self, pad_value: u8) -> Box<dyn Preprocessor> {
    match self {
      PreprocessorKind::Imageops => Box::new(ImageOpsPreprocessor { pad_value }),
      PreprocessorKind::Fused => Box::new(FusedPreprocessor { pad_value }),
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageOpsPreprocessor {
  pub pad_value: u8,
}

impl Default for ImageOpsPreprocessor {
  fn default() -> Self {
    Self {
      pad_value: DEFAULT_PAD_VALUE,
    }
  }
}

impl Preprocessor for ImageOpsPreprocessor {
  fn preprocess(
    &self,
    image: &ImageBuffer,
    input_size: u32,
  ) -> Result<PreprocessingResult, PreprocessError> {
    let Letterboxed { image, transform } = letterbox_with_fill(image, input_size, self.pad_value)?;
    let tensor = tensorize(&image)?;
    Ok(PreprocessingResult { tensor, transform })
  }
}

#[derive(Debug, Clone, Copy)]
pub struct FusedPreprocessor {
  pub pad_value: u8,
}

impl Default for FusedPreprocessor {
  fn default() -> Self {
    Self {
      pad_value: DEFAULT_PAD_VALUE,
    }
  }
}

impl Preprocessor for FusedPreprocessor {
  fn preprocess(
    &self,
    image: &ImageBuffer,
    input_size: u32,
  ) -> Result<PreprocessingResult, PreprocessError> {
    let transform = LetterboxTransform::compute(image.width(), image.height(), input_size)?;
    let (scaled_width, scaled_height) = transform.scaled_size();
    let (offset_x, offset_y) = transform.canvas_offset();
    let (src_w, src_h) = (image.width() as u64, image.height() as u64);
    let fill = self.pad_value as f32 / 255.0;

    let mut tensor = InputTensor::zeros(input_size);
    for y in 0..input_size {
      for x in 0..input_size {
        let inside = x >= offset_x
          && y >= offset_y
          && x < offset_x + scaled_width
          && y < offset_y + scaled_height;
        let rgb = if inside {
          // 最近邻采样：取目标像素中心对应的源像素
          let sx = ((2 * (x - offset_x) as u64 + 1) * src_w / (2 * scaled_width as u64)).min(src_w - 1);
          let sy = ((2 * (y - offset_y) as u64 + 1) * src_h / (2 * scaled_height as u64)).min(src_h - 1);
          let p = image.pixel(sx as u32, sy as u32);
          [p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0]
        } else {
          [fill; 3]
        };
        for (c, value) in rgb.into_iter().enumerate() {
          tensor.set(c, y as usize, x as usize, value);
        }
      }
    }

    Ok(PreprocessingResult { tensor, transform })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn gradient(width: u32, height: u32) -> ImageBuffer {
    let image = RgbImage::from_fn(width, height, |x, y| {
      Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
    });
    ImageBuffer::from(image)
  }

  #[test]
  fn landscape_photo_matches_reference_numbers() {
    let t = LetterboxTransform::compute(4000, 3000, 640).unwrap();
    assert!((t.ratio() - 0.16).abs() < 1e-6);
    assert_eq!(t.scale, 6.25);
    assert_eq!(t.scaled_size(), (640, 480));
    assert_eq!(t.pad_x, 0.0);
    assert_eq!(t.pad_y, 80.0);

    let (x, y) = t.inverse(320.0, 280.0);
    assert!((x - 2000.0).abs() < 1e-3);
    assert!((y - 1250.0).abs() < 1e-3);
  }

  #[test]
  fn round_trip_stays_within_half_pixel() {
    let shapes = [(4000, 3000), (3000, 4000), (1, 999), (1279, 719), (640, 640), (17, 5)];
    for (w, h) in shapes {
      for size in [32, 320, 640, 1024] {
        let t = LetterboxTransform::compute(w, h, size).unwrap();
        for (fx, fy) in [(0.0, 0.0), (0.25, 0.75), (0.5, 0.5), (0.99, 0.01)] {
          let (x, y) = (w as f32 * fx, h as f32 * fy);
          let (mx, my) = t.forward(x, y);
          let (bx, by) = t.inverse(mx, my);
          assert!((bx - x).abs() <= 0.5, "{w}x{h}@{size}: x {x} -> {bx}");
          assert!((by - y).abs() <= 0.5, "{w}x{h}@{size}: y {y} -> {by}");
        }
      }
    }
  }

  #[test]
  fn odd_padding_maps_pixels_back_to_their_source() {
    // 64x31 @ 64: 缩放 1，总填充 33，图像贴在第 16 行
    let mut photo = RgbImage::new(64, 31);
    photo.put_pixel(10, 20, Rgb([255, 255, 255]));
    let image = ImageBuffer::from(photo);

    let backends: [Box<dyn Preprocessor>; 2] = [
      Box::new(ImageOpsPreprocessor::default()),
      Box::new(FusedPreprocessor::default()),
    ];
    for backend in backends {
      let result = backend.preprocess(&image, 64).unwrap();
      assert_eq!(result.pad_y(), 16.0);
      let (mx, my) = (0..64usize)
        .flat_map(|y| (0..64usize).map(move |x| (x, y)))
        .find(|&(x, y)| result.tensor.at(0, y, x) == 1.0)
        .unwrap();
      let (x, y) = result
        .transform
        .inverse(mx as f32 + 0.5, my as f32 + 0.5);
      assert!((x - 10.5).abs() < 1e-4, "{backend:?}: x {x}");
      assert!((y - 20.5).abs() < 1e-4, "{backend:?}: y {y}");
    }
  }

  #[test]
  fn image_touches_two_opposite_edges() {
    for (w, h) in [(4000, 3000), (3000, 4000), (123, 457), (640, 640), (2, 1)] {
      let t = LetterboxTransform::compute(w, h, 640).unwrap();
      assert!(t.pad_x >= 0.0 && t.pad_y >= 0.0);
      assert!(t.pad_x < 0.51 || t.pad_y < 0.51, "{w}x{h}: {t:?}");
    }
  }

  #[test]
  fn zero_sized_inputs_are_rejected() {
    assert_eq!(
      LetterboxTransform::compute(0, 10, 640),
      Err(PreprocessError::InvalidImage {
        width: 0,
        height: 10
      })
    );
    assert_eq!(
      LetterboxTransform::compute(10, 10, 0),
      Err(PreprocessError::InvalidInputSize)
    );
  }

  #[test]
  fn letterbox_fills_border_with_pad_value() {
    let boxed = letterbox_with_fill(&gradient(40, 20), 20, 9).unwrap();
    assert_eq!((boxed.image.width(), boxed.image.height()), (20, 20));
    assert_eq!(boxed.transform.pad_y, 5.0);
    assert_eq!(boxed.image.pixel(10, 0), [9, 9, 9]);
    assert_eq!(boxed.image.pixel(10, 19), [9, 9, 9]);
    assert_ne!(boxed.image.pixel(10, 10), [9, 9, 9]);
  }

  #[test]
  fn letterbox_is_bit_reproducible() {
    let image = gradient(97, 61);
    let a = letterbox(&image, 64).unwrap();
    let b = letterbox(&image, 64).unwrap();
    assert_eq!(a.image, b.image);
  }

  #[test]
  fn tensorize_normalizes_rgb_planes() {
    let image = ImageBuffer::filled(2, 2, [255, 0, 51]).unwrap();
    let tensor = tensorize(&image).unwrap();
    assert_eq!(tensor.shape(), [1, 3, 2, 2]);
    assert_eq!(tensor.at(0, 1, 1), 1.0);
    assert_eq!(tensor.at(1, 0, 1), 0.0);
    assert!((tensor.at(2, 1, 0) - 0.2).abs() < 1e-6);
  }

  #[test]
  fn tensorize_rejects_non_square() {
    let image = ImageBuffer::filled(3, 2, [0, 0, 0]).unwrap();
    assert!(matches!(
      tensorize(&image),
      Err(PreprocessError::NotSquare { .. })
    ));
  }

  #[test]
  fn implementations_agree_on_transform_and_padding() {
    let image = gradient(300, 200);
    let a = ImageOpsPreprocessor { pad_value: 0 }.preprocess(&image, 60).unwrap();
    let b = FusedPreprocessor { pad_value: 0 }.preprocess(&image, 60).unwrap();
    assert_eq!(a.transform, b.transform);
    assert_eq!(a.tensor.shape(), b.tensor.shape());
    // 填充区域完全一致
    for c in 0..3 {
      assert_eq!(a.tensor.at(c, 0, 30), 0.0);
      assert_eq!(b.tensor.at(c, 0, 30), 0.0);
    }
  }

  #[test]
  fn fused_copies_identity_sized_input() {
    let image = gradient(8, 8);
    let result = FusedPreprocessor::default().preprocess(&image, 8).unwrap();
    let reference = tensorize(&image).unwrap();
    assert_eq!(result.tensor, reference);
  }

  #[test]
  fn kind_builds_requested_backend() {
    let backend = PreprocessorKind::Fused.build(DEFAULT_PAD_VALUE);
    assert!(format!("{backend:?}").starts_with("FusedPreprocessor"));
  }
}
