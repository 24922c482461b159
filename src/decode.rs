// 该文件是 Baxin （靶心） 项目的一部分。
// src/decode.rs - 检测结果解码
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

//! 原始模型输出 → 去重、过滤后的原图坐标检测框。
//!
//! 行布局由 [`OutputLayout`] 描述：`[box(4), objectness?, class_scores(C)]`，
//! 张量可以是 `[1, F, N]`（通道在前）或 `[1, N, F]` / `[N, F]`。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
  model::RawOutput,
  preprocess::{LetterboxTransform, PreprocessingResult},
};

pub const OUTPUT_LAYOUT_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("输出形状 {shape:?} 与数据长度 {len} 不一致")]
  ShapeMismatch { shape: Vec<usize>, len: usize },
  #[error("不支持的输出形状: {0:?}")]
  UnsupportedShape(Vec<usize>),
  #[error("每行特征数不匹配: 期望 {expected}, 实际 {actual}")]
  FeatureMismatch { expected: usize, actual: usize },
  #[error("第 {row} 行包含非有限值")]
  NonFinite { row: usize },
  #[error("第 {row} 行的置信度超出 [0, 1]，输出布局可能与模型不符")]
  ConfidenceOutOfRange { row: usize },
  #[error("第 {row} 行的框尺寸为负")]
  NegativeExtent { row: usize },
  #[error("类别标签表为空")]
  NoClasses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxEncoding {
  /// 中心点与宽高
  #[default]
  Cxcywh,
  /// 左上与右下角点
  Xyxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
  /// 模型输入像素
  #[default]
  Pixels,
  /// 以输入尺寸归一化到 `[0, 1]`
  Normalized,
}

/// 原始输出的行布局描述，随配置一起版本化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputLayout {
  pub version: u32,
  pub box_encoding: BoxEncoding,
  pub objectness: bool,
  pub channels_first: bool,
  pub coordinates: CoordinateSpace,
}

impl Default for OutputLayout {
  fn default() -> Self {
    // YOLOv8 导出格式: [1, 4 + C, N]
    Self {
      version: OUTPUT_LAYOUT_VERSION,
      box_encoding: BoxEncoding::Cxcywh,
      objectness: false,
      channels_first: true,
      coordinates: CoordinateSpace::Pixels,
    }
  }
}

impl OutputLayout {
  pub fn features(&self, classes: usize) -> usize {
    4 + usize::from(self.objectness) + classes
  }
}

/// 中心点形式的轴对齐框。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
  pub center_x: f32,
  pub center_y: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  pub fn area(&self) -> f32 {
    self.width.max(0.0) * self.height.max(0.0)
  }

  pub fn iou(&self, other: &Self) -> f32 {
    let x1 = (self.center_x - self.width / 2.0).max(other.center_x - other.width / 2.0);
    let y1 = (self.center_y - self.height / 2.0).max(other.center_y - other.height / 2.0);
    let x2 = (self.center_x + self.width / 2.0).min(other.center_x + other.width / 2.0);
    let y2 = (self.center_y + self.height / 2.0).min(other.center_y + other.height / 2.0);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if intersection <= 0.0 {
      return 0.0;
    }

    let union = self.area() + other.area() - intersection;
    if union > 0.0 { intersection / union } else { 0.0 }
  }
}

/// 模型空间中的候选框，`index` 为其在原始输出中的行号。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub index: usize,
  pub class_id: usize,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

/// 原图像素坐标下的检测结果。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
  pub center_x: f32,
  pub center_y: f32,
  pub width: f32,
  pub height: f32,
  pub class_id: usize,
  pub confidence: f32,
}

impl Detection {
  pub fn bbox(&self) -> BoundingBox {
    BoundingBox {
      center_x: self.center_x,
      center_y: self.center_y,
      width: self.width,
      height: self.height,
    }
  }

  pub fn label<'a>(&self, class_labels: &'a [String]) -> Option<&'a str> {
    class_labels.get(self.class_id).map(String::as_str)
  }
}

/// 张量视图：把 `[F, N]` 和 `[N, F]` 统一成按 (行, 特征) 读取。
struct Rows<'a> {
  data: &'a [f32],
  count: usize,
  features: usize,
  channels_first: bool,
}

impl Rows<'_> {
  fn get(&self, row: usize, feature: usize) -> f32 {
    if self.channels_first {
      self.data[feature * self.count + row]
    } else {
      self.data[row * self.features + feature]
    }
  }
}

fn rows<'a>(
  raw: &'a RawOutput,
  layout: &OutputLayout,
  classes: usize,
) -> Result<Rows<'a>, DecodeError> {
  if raw.element_count() != Some(raw.data.len()) {
    return Err(DecodeError::ShapeMismatch {
      shape: raw.shape.clone(),
      len: raw.data.len(),
    });
  }

  let (outer, inner) = match raw.shape.as_slice() {
    [1, a, b] | [a, b] => (*a, *b),
    other => return Err(DecodeError::UnsupportedShape(other.to_vec())),
  };
  let (features, count) = if layout.channels_first {
    (outer, inner)
  } else {
    (inner, outer)
  };

  let expected = layout.features(classes);
  if features != expected {
    return Err(DecodeError::FeatureMismatch {
      expected,
      actual: features,
    });
  }

  Ok(Rows {
    data: &raw.data,
    count,
    features,
    channels_first: layout.channels_first,
  })
}

fn probability(value: f32, row: usize) -> Result<f32, DecodeError> {
  if !value.is_finite() {
    return Err(DecodeError::NonFinite { row });
  }
  if !(0.0..=1.0).contains(&value) {
    return Err(DecodeError::ConfidenceOutOfRange { row });
  }
  Ok(value)
}

/// 解析原始输出并丢弃置信度低于阈值的行。
///
/// 每个类别分数和目标性都必须是 `[0, 1]` 内的有限值，否则整个输出无效。
pub fn parse_candidates(
  raw: &RawOutput,
  layout: &OutputLayout,
  input_size: u32,
  confidence_threshold: f32,
  classes: usize,
) -> Result<Vec<Candidate>, DecodeError> {
  if classes == 0 {
    return Err(DecodeError::NoClasses);
  }

  let rows = rows(raw, layout, classes)?;
  let class_offset = 4 + usize::from(layout.objectness);
  let coordinate_scale = match layout.coordinates {
    CoordinateSpace::Pixels => 1.0,
    CoordinateSpace::Normalized => input_size as f32,
  };

  let mut candidates = Vec::new();
  for row in 0..rows.count {
    let (mut class_id, mut best) = (0usize, f32::NEG_INFINITY);
    for c in 0..classes {
      let score = probability(rows.get(row, class_offset + c), row)?;
      if score > best {
        best = score;
        class_id = c;
      }
    }
    let confidence = if layout.objectness {
      best * probability(rows.get(row, 4), row)?
    } else {
      best
    };
    if confidence < confidence_threshold {
      continue;
    }

    let values = [0, 1, 2, 3].map(|k| rows.get(row, k) * coordinate_scale);
    if values.iter().any(|v| !v.is_finite()) {
      return Err(DecodeError::NonFinite { row });
    }
    let bbox = match layout.box_encoding {
      BoxEncoding::Cxcywh => BoundingBox {
        center_x: values[0],
        center_y: values[1],
        width: values[2],
        height: values[3],
      },
      BoxEncoding::Xyxy => BoundingBox {
        center_x: (values[0] + values[2]) / 2.0,
        center_y: (values[1] + values[3]) / 2.0,
        width: values[2] - values[0],
        height: values[3] - values[1],
      },
    };
    if bbox.width < 0.0 || bbox.height < 0.0 {
      return Err(DecodeError::NegativeExtent { row });
    }

    candidates.push(Candidate {
      index: row,
      class_id,
      confidence,
      bbox,
    });
  }

  debug!(
    "原始输出 {} 行, 置信度过滤后剩余 {} 个候选框",
    rows.count,
    candidates.len()
  );
  Ok(candidates)
}

/// 按类别的贪心非极大值抑制。
///
/// 结果按置信度降序排列；置信度相同时原始输出中靠前的行优先。
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| {
    b.confidence
      .partial_cmp(&a.confidence)
      .unwrap_or(Ordering::Equal)
      .then(a.index.cmp(&b.index))
  });

  let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
  for candidate in candidates {
    let suppressed = kept.iter().any(|k| {
      k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
    });
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

/// 惰性、有限、不可重启的检测序列，按置信度降序产出。
///
/// 逆信箱变换在迭代时执行，中心落在原图之外的框被丢弃。
#[derive(Debug)]
pub struct DecodedDetections {
  kept: std::vec::IntoIter<Candidate>,
  transform: LetterboxTransform,
}

impl Iterator for DecodedDetections {
  type Item = Detection;

  fn next(&mut self) -> Option<Self::Item> {
    for candidate in self.kept.by_ref() {
      let BoundingBox {
        center_x,
        center_y,
        width,
        height,
      } = candidate.bbox;
      let (x, y) = self.transform.inverse(center_x, center_y);
      if !self.transform.contains(x, y) {
        debug!(
          "丢弃画面外检测: 行 {}, 中心 ({:.1}, {:.1})",
          candidate.index, x, y
        );
        continue;
      }

      return Some(Detection {
        center_x: x,
        center_y: y,
        width: self.transform.inverse_length(width),
        height: self.transform.inverse_length(height),
        class_id: candidate.class_id,
        confidence: candidate.confidence,
      });
    }
    None
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (0, Some(self.kept.len()))
  }
}

impl std::iter::FusedIterator for DecodedDetections {}

/// 解码原始输出：置信度过滤、按类别 NMS、逆信箱变换。
///
/// 变换参数只取自 `preprocessing`，不会重新计算比例。
pub fn decode(
  raw: &RawOutput,
  preprocessing: &PreprocessingResult,
  confidence_threshold: f32,
  iou_threshold: f32,
  class_labels: &[String],
  layout: &OutputLayout,
) -> Result<DecodedDetections, DecodeError> {
  let transform = preprocessing.transform;
  let candidates = parse_candidates(
    raw,
    layout,
    transform.input_size,
    confidence_threshold,
    class_labels.len(),
  )?;
  let kept = non_max_suppression(candidates, iou_threshold);
  debug!("NMS 后保留 {} 个检测框", kept.len());

  Ok(DecodedDetections {
    kept: kept.into_iter(),
    transform,
  })
}
