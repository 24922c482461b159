// 该文件是 Baxin （靶心） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::{collections::VecDeque, path::PathBuf};

use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{ImageHandle, InputError},
};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// `image:///path/to/photo.jpg` 或 `image:///path/to/directory`。
///
/// 目录按文件名排序逐个读取，仅包含常见图片扩展名。
pub struct ImageFileInput {
  pending: VecDeque<PathBuf>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    Self::open(PathBuf::from(url.path()))
  }
}

impl ImageFileInput {
  pub fn open(path: PathBuf) -> Result<Self, InputError> {
    let pending = if path.is_dir() {
      let mut entries = std::fs::read_dir(&path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image_path(p))
        .collect::<Vec<_>>();
      entries.sort();
      info!("目录 {} 中找到 {} 张图片", path.display(), entries.len());
      entries.into()
    } else {
      // 单文件在这里尽早检查存在性，避免迭代时才报错
      std::fs::metadata(&path)?;
      VecDeque::from([path])
    };

    Ok(Self { pending })
  }

  pub fn remaining(&self) -> usize {
    self.pending.len()
  }
}

fn is_image_path(path: &std::path::Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    })
    .unwrap_or(false)
}

impl Iterator for ImageFileInput {
  type Item = Result<ImageHandle, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.pending.pop_front()?;
    Some(
      std::fs::read(&path)
        .map(|bytes| ImageHandle::new(bytes, path.display().to_string()))
        .map_err(InputError::from),
    )
  }
}
