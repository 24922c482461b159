// 该文件是 Baxin （靶心） 项目的一部分。
// src/score.rs - 靶面几何与计分
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

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::decode::Detection;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
  #[error("靶面几何无效: {0}")]
  InvalidGeometry(String),
}

/// 同心环：外半径（原图像素）及其分值。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ring {
  pub outer_radius: f32,
  pub points: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGeometry {
  center: (f32, f32),
  rings: Vec<Ring>,
}

/// 已标定的靶面：由内到外排列的同心环。
///
/// 构造时保证：半径有限、为正且不减，分值不增。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeometry")]
pub struct TargetGeometry {
  center: (f32, f32),
  rings: Vec<Ring>,
}

impl TryFrom<RawGeometry> for TargetGeometry {
  type Error = ScoreError;

  fn try_from(raw: RawGeometry) -> Result<Self, Self::Error> {
    Self::new(raw.center, raw.rings)
  }
}

impl TargetGeometry {
  pub fn new(center: (f32, f32), rings: Vec<Ring>) -> Result<Self, ScoreError> {
    if !center.0.is_finite() || !center.1.is_finite() {
      return Err(ScoreError::InvalidGeometry(format!(
        "靶心坐标非有限值: {:?}",
        center
      )));
    }
    if rings.is_empty() {
      return Err(ScoreError::InvalidGeometry("至少需要一个环".to_string()));
    }
    for (i, ring) in rings.iter().enumerate() {
      if !ring.outer_radius.is_finite() || ring.outer_radius <= 0.0 {
        return Err(ScoreError::InvalidGeometry(format!(
          "第 {} 环半径无效: {}",
          i, ring.outer_radius
        )));
      }
    }
    for (i, pair) in rings.windows(2).enumerate() {
      if pair[1].outer_radius < pair[0].outer_radius {
        return Err(ScoreError::InvalidGeometry(format!(
          "第 {} 环半径小于内侧环",
          i + 1
        )));
      }
      if pair[1].points > pair[0].points {
        return Err(ScoreError::InvalidGeometry(format!(
          "第 {} 环分值高于内侧环",
          i + 1
        )));
      }
    }

    Ok(Self { center, rings })
  }

  /// 等间距同心靶面：第 `k` 环半径为 `outer_radius * (k + 1) / ring_count`，分值 `max_points - k`。
  ///
  /// 世界射箭 122cm 全环靶即 `ring_count = 10, max_points = 10`。
  pub fn concentric(
    center: (f32, f32),
    outer_radius: f32,
    ring_count: u32,
    max_points: u32,
  ) -> Result<Self, ScoreError> {
    if ring_count == 0 {
      return Err(ScoreError::InvalidGeometry("环数必须大于零".to_string()));
    }
    let rings = (0..ring_count)
      .map(|k| Ring {
        outer_radius: outer_radius * (k + 1) as f32 / ring_count as f32,
        points: max_points.saturating_sub(k),
      })
      .collect();
    Self::new(center, rings)
  }

  pub fn center(&self) -> (f32, f32) {
    self.center
  }

  pub fn rings(&self) -> &[Ring] {
    &self.rings
  }

  pub fn outer_radius(&self) -> f32 {
    self.rings.last().map(|r| r.outer_radius).unwrap_or(0.0)
  }
}

/// 命中环：`Ring(0)` 为最内环。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreRing {
  Ring(usize),
  Miss,
}

impl Serialize for ScoreRing {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      ScoreRing::Ring(index) => serializer.serialize_u64(*index as u64),
      ScoreRing::Miss => serializer.serialize_str("miss"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreResult {
  pub detection: Detection,
  pub ring: ScoreRing,
  pub points: u32,
  /// 到靶心的距离（原图像素）。
  pub distance: f32,
}

impl ScoreResult {
  pub fn is_miss(&self) -> bool {
    self.ring == ScoreRing::Miss
  }
}

/// 以检测框中心为着靶点计分。半径相同的环中，内侧（高分）环优先。
pub fn score(detection: &Detection, geometry: &TargetGeometry) -> ScoreResult {
  let (cx, cy) = geometry.center;
  let distance = (detection.center_x - cx).hypot(detection.center_y - cy);

  let hit = geometry
    .rings
    .iter()
    .position(|ring| distance <= ring.outer_radius);

  let (ring, points) = match hit {
    Some(index) => (ScoreRing::Ring(index), geometry.rings[index].points),
    None => (ScoreRing::Miss, 0),
  };

  ScoreResult {
    detection: *detection,
    ring,
    points,
    distance,
  }
}
