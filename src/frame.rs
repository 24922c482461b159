// 该文件是 Baxin （靶心） 项目的一部分。
// src/frame.rs - 图像缓冲区与 NCHW 张量定义
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

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("图像尺寸无效: {width}x{height}")]
  ZeroDimension { width: u32, height: u32 },
}

/// 解码后的 RGB8 像素网格，按 HWC 排列。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl ImageBuffer {
  pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::ZeroDimension { width, height });
    }
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  /// 以单一颜色填充的图像，测试与画布构造常用。
  pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, FrameError> {
    let pixels = width as usize * height as usize;
    let data = rgb.iter().copied().cycle().take(pixels * RGB_CHANNELS).collect();
    Self::from_raw(width, height, data)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
    [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

impl From<image::RgbImage> for ImageBuffer {
  fn from(image: image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

impl From<&ImageBuffer> for image::RgbImage {
  fn from(frame: &ImageBuffer) -> Self {
    image::RgbImage::from_fn(frame.width, frame.height, |x, y| {
      image::Rgb(frame.pixel(x, y))
    })
  }
}

/// 模型输入张量，形状固定为 `[1, 3, S, S]`，通道顺序 R、G、B，取值范围 `[0, 1]`。
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
  size: usize,
  data: Box<[f32]>,
}

impl InputTensor {
  pub fn zeros(size: u32) -> Self {
    let size = size as usize;
    Self {
      size,
      data: vec![0.0; RGB_CHANNELS * size * size].into_boxed_slice(),
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.size, self.size]
  }

  pub fn size(&self) -> u32 {
    self.size as u32
  }

  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }

  /// 读取 `(c, y, x)` 处的值。
  pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
    self.data[self.index(c, y, x)]
  }

  pub(crate) fn set(&mut self, c: usize, y: usize, x: usize, value: f32) {
    let idx = self.index(c, y, x);
    self.data[idx] = value;
  }

  fn index(&self, c: usize, y: usize, x: usize) -> usize {
    c * self.size * self.size + y * self.size + x
  }
}

impl AsRef<[f32]> for InputTensor {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_length_mismatch() {
    let err = ImageBuffer::from_raw(2, 2, vec![0; 11]).unwrap_err();
    assert_eq!(
      err,
      FrameError::LengthMismatch {
        expected: 12,
        actual: 11
      }
    );
  }

  #[test]
  fn rejects_zero_dimension() {
    assert!(matches!(
      ImageBuffer::from_raw(0, 4, vec![]),
      Err(FrameError::ZeroDimension { .. })
    ));
  }

  #[test]
  fn converts_from_rgb_image() {
    let image = image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8, y as u8, 7]));
    let frame = ImageBuffer::from(image);
    assert_eq!(frame.width(), 3);
    assert_eq!(frame.height(), 2);
    assert_eq!(frame.pixel(2, 1), [2, 1, 7]);

    let back = image::RgbImage::from(&frame);
    assert_eq!(back.get_pixel(2, 1).0, [2, 1, 7]);
  }

  #[test]
  fn tensor_is_channel_first() {
    let mut tensor = InputTensor::zeros(4);
    tensor.set(2, 1, 3, 0.5);
    assert_eq!(tensor.shape(), [1, 3, 4, 4]);
    assert_eq!(tensor.as_nchw()[2 * 16 + 4 + 3], 0.5);
    assert_eq!(tensor.at(2, 1, 3), 0.5);
  }
}
