// 该文件是 Baxin （靶心） 项目的一部分。
// src/input.rs - 图像输入
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

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::frame::{FrameError, ImageBuffer};

mod read_image_file;
pub use self::read_image_file::ImageFileInput;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  DecodeError(#[from] image::ImageError),
  #[error("图像无效: {0}")]
  InvalidFrame(#[from] FrameError),
}

/// 一张待处理照片的编码字节及其来源引用。
///
/// 同一物理缓冲区由 `Arc` 分配确定：克隆共享身份，独立分配的缓冲区即使内容相同也互不相干。
#[derive(Debug, Clone)]
pub struct ImageHandle {
  bytes: Arc<[u8]>,
  reference: String,
}

impl ImageHandle {
  pub fn new(bytes: impl Into<Arc<[u8]>>, reference: impl Into<String>) -> Self {
    Self {
      bytes: bytes.into(),
      reference: reference.into(),
    }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn reference(&self) -> &str {
    &self.reference
  }

  /// 缓冲区的身份标识，用于单飞保护。
  pub fn buffer_id(&self) -> usize {
    Arc::as_ptr(&self.bytes) as *const u8 as usize
  }

  pub fn decode(&self) -> Result<ImageBuffer, InputError> {
    decode_image(&self.bytes)
  }
}

/// 将 JPEG/PNG 等编码字节解码为 RGB8 图像。
pub fn decode_image(bytes: &[u8]) -> Result<ImageBuffer, InputError> {
  let image = image::load_from_memory(bytes)?.to_rgb8();
  let (width, height) = image.dimensions();
  if width == 0 || height == 0 {
    return Err(FrameError::ZeroDimension { width, height }.into());
  }
  debug!("解码图像: {}x{}", width, height);
  Ok(ImageBuffer::from(image))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::io::Cursor;

  pub(crate) fn encode_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
      image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut bytes = Vec::new();
    image
      .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
      .unwrap();
    bytes
  }

  #[test]
  fn decodes_png_bytes() {
    let frame = decode_image(&encode_png(5, 3)).unwrap();
    assert_eq!((frame.width(), frame.height()), (5, 3));
    assert_eq!(frame.pixel(4, 2), [4, 2, 128]);
  }

  #[test]
  fn rejects_garbage() {
    assert!(matches!(
      decode_image(b"definitely not an image"),
      Err(InputError::DecodeError(_))
    ));
  }

  #[test]
  fn clones_share_buffer_identity() {
    let bytes = encode_png(2, 2);
    let a = ImageHandle::new(bytes.clone(), "a.png");
    let b = a.clone();
    let c = ImageHandle::new(bytes, "a.png");
    assert_eq!(a.buffer_id(), b.buffer_id());
    assert_ne!(a.buffer_id(), c.buffer_id());
  }
}
