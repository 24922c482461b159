// 该文件是 Baxin （靶心） 项目的一部分。
// src/config.rs - 检测配置加载与校验
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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  decode::{OUTPUT_LAYOUT_VERSION, OutputLayout},
  preprocess::{DEFAULT_PAD_VALUE, Preprocessor, PreprocessorKind},
  score::{Ring, ScoreError, TargetGeometry},
};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("配置解析错误: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("不支持的配置版本 {found}, 当前版本为 {CONFIG_SCHEMA_VERSION}")]
  UnsupportedSchema { found: u32 },
  #[error("配置无效: {0}")]
  Invalid(String),
  #[error(transparent)]
  Geometry(#[from] ScoreError),
}

/// 靶面几何的来源。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetReference {
  Fixed {
    center: (f32, f32),
    rings: Vec<Ring>,
  },
  Concentric {
    center: (f32, f32),
    outer_radius: f32,
    ring_count: u32,
    max_points: u32,
  },
  /// 独立的几何 JSON 文件；相对路径以配置文件所在目录为基准。
  File { path: PathBuf },
}

impl TargetReference {
  fn resolve(&self, base_dir: &Path) -> Result<TargetGeometry, ConfigError> {
    let geometry = match self {
      TargetReference::Fixed { center, rings } => TargetGeometry::new(*center, rings.clone())?,
      TargetReference::Concentric {
        center,
        outer_radius,
        ring_count,
        max_points,
      } => TargetGeometry::concentric(*center, *outer_radius, *ring_count, *max_points)?,
      TargetReference::File { path } => {
        let path = base_dir.join(path);
        debug!("读取靶面几何文件: {}", path.display());
        let text = read_to_string(&path)?;
        serde_json::from_str(&text)?
      }
    };
    Ok(geometry)
  }
}

fn default_pad_value() -> u8 {
  DEFAULT_PAD_VALUE
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
  schema_version: u32,
  input_size: u32,
  confidence_threshold: f32,
  iou_threshold: f32,
  class_labels: Vec<String>,
  #[serde(default)]
  impact_class: Option<String>,
  #[serde(default)]
  output_layout: OutputLayout,
  target: TargetReference,
  #[serde(default)]
  preprocessor: PreprocessorKind,
  #[serde(default = "default_pad_value")]
  pad_value: u8,
}

/// 进程级只读配置，启动时一次性加载，之后以 `Arc` 共享。
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDetectionConfig {
  pub schema_version: u32,
  pub input_size: u32,
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
  pub class_labels: Vec<String>,
  pub impact_class: Option<String>,
  pub output_layout: OutputLayout,
  /// 已解析的靶面几何
  pub target: TargetGeometry,
  pub target_source: TargetReference,
  pub preprocessor: PreprocessorKind,
  pub pad_value: u8,
}

impl ObjectDetectionConfig {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("加载配置文件: {}", path.display());
    let text = read_to_string(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    Self::parse(&text, base_dir)
  }

  /// 从 JSON 文本构建配置；`file` 类型的靶面路径以当前工作目录为基准。
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    Self::parse(json, Path::new("."))
  }

  fn parse(json: &str, base_dir: &Path) -> Result<Self, ConfigError> {
    let doc: ConfigDocument = serde_json::from_str(json)?;
    if doc.schema_version != CONFIG_SCHEMA_VERSION {
      return Err(ConfigError::UnsupportedSchema {
        found: doc.schema_version,
      });
    }
    validate(&doc)?;

    let target = doc.target.resolve(base_dir)?;
    debug!(
      "靶面几何: 中心 {:?}, {} 个环",
      target.center(),
      target.rings().len()
    );

    Ok(Self {
      schema_version: doc.schema_version,
      input_size: doc.input_size,
      confidence_threshold: doc.confidence_threshold,
      iou_threshold: doc.iou_threshold,
      class_labels: doc.class_labels,
      impact_class: doc.impact_class,
      output_layout: doc.output_layout,
      target,
      target_source: doc.target,
      preprocessor: doc.preprocessor,
      pad_value: doc.pad_value,
    })
  }

  /// 需要计分的类别下标；未指定 `impact_class` 时所有类别都计分。
  pub fn impact_class_id(&self) -> Option<usize> {
    self
      .impact_class
      .as_ref()
      .and_then(|name| self.class_labels.iter().position(|l| l == name))
  }

  pub fn build_preprocessor(&self) -> Box<dyn Preprocessor> {
    self.preprocessor.build(self.pad_value)
  }
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
  std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
    path: path.to_path_buf(),
    source,
  })
}

fn validate(doc: &ConfigDocument) -> Result<(), ConfigError> {
  if doc.input_size == 0 {
    return Err(ConfigError::Invalid("input_size 必须为正整数".to_string()));
  }
  for (name, value) in [
    ("confidence_threshold", doc.confidence_threshold),
    ("iou_threshold", doc.iou_threshold),
  ] {
    if !(0.0..=1.0).contains(&value) {
      return Err(ConfigError::Invalid(format!(
        "{} 必须位于 [0, 1], 实际为 {}",
        name, value
      )));
    }
  }
  if doc.class_labels.is_empty() {
    return Err(ConfigError::Invalid("class_labels 不能为空".to_string()));
  }
  for (i, label) in doc.class_labels.iter().enumerate() {
    if doc.class_labels[..i].contains(label) {
      return Err(ConfigError::Invalid(format!("类别标签重复: {}", label)));
    }
  }
  if let Some(name) = &doc.impact_class
    && !doc.class_labels.contains(name)
  {
    return Err(ConfigError::Invalid(format!(
      "impact_class {} 不在 class_labels 中",
      name
    )));
  }
  if doc.output_layout.version != OUTPUT_LAYOUT_VERSION {
    return Err(ConfigError::Invalid(format!(
      "不支持的输出布局版本 {}",
      doc.output_layout.version
    )));
  }
  Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::decode::BoxEncoding;

  pub(crate) const MINIMAL_CONFIG: &str = r#"{
    "schema_version": 1,
    "input_size": 640,
    "confidence_threshold": 0.5,
    "iou_threshold": 0.45,
    "class_labels": ["arrow"],
    "target": {"kind": "concentric", "center": [2000.0, 1500.0], "outer_radius": 1000.0, "ring_count": 10, "max_points": 10}
  }"#;

  #[test]
  fn minimal_config_uses_defaults() {
    let config = ObjectDetectionConfig::from_json_str(MINIMAL_CONFIG).unwrap();
    assert_eq!(config.input_size, 640);
    assert_eq!(config.pad_value, DEFAULT_PAD_VALUE);
    assert_eq!(config.preprocessor, PreprocessorKind::Imageops);
    assert_eq!(config.output_layout, OutputLayout::default());
    assert_eq!(config.target.rings().len(), 10);
    assert_eq!(config.impact_class_id(), None);
  }

  #[test]
  fn full_config_round_trips_fields() {
    let json = r#"{
      "schema_version": 1,
      "input_size": 320,
      "confidence_threshold": 0.25,
      "iou_threshold": 0.7,
      "class_labels": ["target", "arrow"],
      "impact_class": "arrow",
      "output_layout": {"box_encoding": "xyxy", "objectness": true, "channels_first": false},
      "target": {"kind": "fixed", "center": [10.0, 10.0], "rings": [{"outer_radius": 5.0, "points": 10}]},
      "preprocessor": "fused",
      "pad_value": 0
    }"#;
    let config = ObjectDetectionConfig::from_json_str(json).unwrap();
    assert_eq!(config.impact_class_id(), Some(1));
    assert_eq!(config.output_layout.box_encoding, BoxEncoding::Xyxy);
    assert!(config.output_layout.objectness);
    assert!(!config.output_layout.channels_first);
    assert_eq!(config.preprocessor, PreprocessorKind::Fused);
    assert_eq!(config.pad_value, 0);
    assert!(matches!(config.target_source, TargetReference::Fixed { .. }));
  }

  fn with_field(field: &str, value: &str) -> String {
    let mut doc: serde_json::Value = serde_json::from_str(MINIMAL_CONFIG).unwrap();
    doc[field] = serde_json::from_str(value).unwrap();
    doc.to_string()
  }

  #[test]
  fn rejects_out_of_range_values() {
    for (field, value) in [
      ("input_size", "0"),
      ("confidence_threshold", "1.5"),
      ("iou_threshold", "-0.1"),
      ("class_labels", "[]"),
      ("class_labels", r#"["arrow", "arrow"]"#),
      ("impact_class", r#""bolt""#),
      ("output_layout", r#"{"version": 2}"#),
    ] {
      let result = ObjectDetectionConfig::from_json_str(&with_field(field, value));
      assert!(
        matches!(result, Err(ConfigError::Invalid(_))),
        "{field} = {value}: {result:?}"
      );
    }
  }

  #[test]
  fn rejects_unknown_schema_and_fields() {
    assert!(matches!(
      ObjectDetectionConfig::from_json_str(&with_field("schema_version", "2")),
      Err(ConfigError::UnsupportedSchema { found: 2 })
    ));
    assert!(matches!(
      ObjectDetectionConfig::from_json_str(&with_field("colour", r#""red""#)),
      Err(ConfigError::Parse(_))
    ));
  }

  #[test]
  fn invalid_geometry_is_a_config_error() {
    let target = r#"{"kind": "fixed", "center": [0.0, 0.0], "rings": []}"#;
    assert!(matches!(
      ObjectDetectionConfig::from_json_str(&with_field("target", target)),
      Err(ConfigError::Geometry(_))
    ));
  }

  #[test]
  fn file_target_resolves_relative_to_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
      dir.path().join("face.json"),
      r#"{"center": [50.0, 60.0], "rings": [{"outer_radius": 10.0, "points": 10}, {"outer_radius": 20.0, "points": 9}]}"#,
    )
    .unwrap();
    let config_path = dir.path().join("baxin.json");
    std::fs::write(
      &config_path,
      with_field("target", r#"{"kind": "file", "path": "face.json"}"#),
    )
    .unwrap();

    let config = ObjectDetectionConfig::load(&config_path).unwrap();
    assert_eq!(config.target.center(), (50.0, 60.0));
    assert_eq!(config.target.rings()[1].points, 9);
  }

  #[test]
  fn missing_files_report_their_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    match ObjectDetectionConfig::load(&missing) {
      Err(ConfigError::Io { path, .. }) => assert_eq!(path, missing),
      other => panic!("unexpected: {other:?}"),
    }

    let config_path = dir.path().join("baxin.json");
    std::fs::write(
      &config_path,
      with_field("target", r#"{"kind": "file", "path": "nowhere.json"}"#),
    )
    .unwrap();
    assert!(matches!(
      ObjectDetectionConfig::load(&config_path),
      Err(ConfigError::Io { .. })
    ));
  }
}
