// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 检测尺度、锚框与流水线配置
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

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{iou::IouKind, target::AssignPolicy};

/// 每个检测尺度的锚框数量
pub const ANCHORS_PER_SCALE: usize = 3;

const YOLOV4_ANCHORS: [(f32, f32); 9] = [
  (12.0, 16.0),
  (19.0, 36.0),
  (40.0, 28.0),
  (36.0, 75.0),
  (76.0, 55.0),
  (72.0, 146.0),
  (142.0, 110.0),
  (192.0, 243.0),
  (459.0, 401.0),
];
const YOLOV4_STRIDES: [u32; 3] = [8, 16, 32];
const YOLOV4_XY_SCALES: [f32; 3] = [1.2, 1.1, 1.05];

const YOLOV4_TINY_ANCHORS: [(f32, f32); 6] = [
  (23.0, 27.0),
  (37.0, 58.0),
  (81.0, 82.0),
  (81.0, 82.0),
  (135.0, 169.0),
  (344.0, 319.0),
];
const YOLOV4_TINY_STRIDES: [u32; 2] = [16, 32];
const YOLOV4_TINY_XY_SCALES: [f32; 2] = [1.05, 1.05];

const DEFAULT_INPUT_SIZE: u32 = 608;
const DEFAULT_NUM_CLASSES: usize = 80;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_NMS_THRESHOLD: f32 = 0.3;
const DEFAULT_IGNORE_THRESHOLD: f32 = 0.5;
const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_SUBDIVISION: usize = 16;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("输入尺寸 {size} 必须是最大步长 {stride} 的正整数倍")]
  InputSize { size: u32, stride: u32 },
  #[error("锚框数量不匹配: 期望 {expected}, 实际 {actual}")]
  AnchorCount { expected: usize, actual: usize },
  #[error("{what} 数量不匹配: 期望 {expected}, 实际 {actual}")]
  ScaleCount {
    what: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("步长必须为正数")]
  InvalidStride,
  #[error("锚框尺寸必须为正数: ({0}, {1})")]
  InvalidAnchor(f32, f32),
  #[error("xy 缩放系数必须不小于 1: {0}")]
  InvalidXyScale(f32),
  #[error("类别数量必须大于 0")]
  NoClasses,
  #[error("{name} 超出取值范围: {value}")]
  OutOfRange { name: &'static str, value: f32 },
  #[error("批大小 {batch_size} 必须能被细分数 {subdivision} 整除且均大于 0")]
  Batch {
    batch_size: usize,
    subdivision: usize,
  },
  #[error("配置文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件解析错误: {0}")]
  SettingsError(#[from] serde_json::Error),
}

/// 网络拓扑变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
  /// 完整 YOLOv4，3 个输出尺度
  #[default]
  Standard,
  /// YOLOv4-tiny，2 个输出尺度
  Tiny,
}

impl Topology {
  pub fn num_scales(&self) -> usize {
    match self {
      Topology::Standard => YOLOV4_STRIDES.len(),
      Topology::Tiny => YOLOV4_TINY_STRIDES.len(),
    }
  }

  fn default_anchors(&self) -> Vec<(f32, f32)> {
    match self {
      Topology::Standard => YOLOV4_ANCHORS.to_vec(),
      Topology::Tiny => YOLOV4_TINY_ANCHORS.to_vec(),
    }
  }

  fn default_strides(&self) -> Vec<u32> {
    match self {
      Topology::Standard => YOLOV4_STRIDES.to_vec(),
      Topology::Tiny => YOLOV4_TINY_STRIDES.to_vec(),
    }
  }

  fn default_xy_scales(&self) -> Vec<f32> {
    match self {
      Topology::Standard => YOLOV4_XY_SCALES.to_vec(),
      Topology::Tiny => YOLOV4_TINY_XY_SCALES.to_vec(),
    }
  }
}

/// 单个检测尺度：步长、锚框 (输入像素单位) 与网格敏感度修正系数
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleSpec {
  pub stride: u32,
  pub anchors: [(f32, f32); ANCHORS_PER_SCALE],
  pub xy_scale: f32,
}

/// 检测流水线配置，构建后只读
#[derive(Debug, Clone)]
pub struct YoloConfig {
  topology: Topology,
  input_size: u32,
  num_classes: usize,
  scales: Vec<ScaleSpec>,
  confidence_threshold: f32,
  nms_threshold: f32,
  ignore_threshold: f32,
  iou_loss: IouKind,
  batch_size: usize,
  subdivision: usize,
  label_smoothing: f32,
  noobj_weight: f32,
  max_detections: Option<usize>,
  assign_policy: AssignPolicy,
}

impl YoloConfig {
  pub fn builder(topology: Topology) -> YoloConfigBuilder {
    YoloConfigBuilder::new(topology)
  }

  pub fn topology(&self) -> Topology {
    self.topology
  }

  pub fn input_size(&self) -> u32 {
    self.input_size
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  pub fn num_scales(&self) -> usize {
    self.scales.len()
  }

  pub fn scales(&self) -> &[ScaleSpec] {
    &self.scales
  }

  /// 第 `index` 个尺度的步长与锚框
  ///
  /// # Panics
  /// `index` 超出尺度数量时 panic
  pub fn scale(&self, index: usize) -> &ScaleSpec {
    &self.scales[index]
  }

  pub fn grid_size(&self, index: usize) -> usize {
    (self.input_size / self.scales[index].stride) as usize
  }

  /// 每个网格单元每个锚框的属性数: x, y, w, h, objectness + 类别
  pub fn attributes(&self) -> usize {
    5 + self.num_classes
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  pub fn nms_threshold(&self) -> f32 {
    self.nms_threshold
  }

  pub fn ignore_threshold(&self) -> f32 {
    self.ignore_threshold
  }

  pub fn iou_loss(&self) -> IouKind {
    self.iou_loss
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  pub fn subdivision(&self) -> usize {
    self.subdivision
  }

  /// 单次前向的小批大小 (batch_size / subdivision)
  pub fn micro_batch(&self) -> usize {
    self.batch_size / self.subdivision
  }

  pub fn label_smoothing(&self) -> f32 {
    self.label_smoothing
  }

  pub fn noobj_weight(&self) -> f32 {
    self.noobj_weight
  }

  pub fn max_detections(&self) -> Option<usize> {
    self.max_detections
  }

  pub fn assign_policy(&self) -> AssignPolicy {
    self.assign_policy
  }
}

#[derive(Debug, Clone)]
pub struct YoloConfigBuilder {
  topology: Topology,
  input_size: u32,
  num_classes: usize,
  anchors: Vec<(f32, f32)>,
  strides: Vec<u32>,
  xy_scales: Vec<f32>,
  confidence_threshold: f32,
  nms_threshold: f32,
  ignore_threshold: f32,
  iou_loss: IouKind,
  batch_size: usize,
  subdivision: usize,
  label_smoothing: f32,
  noobj_weight: f32,
  max_detections: Option<usize>,
  assign_policy: AssignPolicy,
}

impl YoloConfigBuilder {
  pub fn new(topology: Topology) -> Self {
    Self {
      topology,
      input_size: DEFAULT_INPUT_SIZE,
      num_classes: DEFAULT_NUM_CLASSES,
      anchors: topology.default_anchors(),
      strides: topology.default_strides(),
      xy_scales: topology.default_xy_scales(),
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      ignore_threshold: DEFAULT_IGNORE_THRESHOLD,
      iou_loss: IouKind::default(),
      batch_size: DEFAULT_BATCH_SIZE,
      subdivision: DEFAULT_SUBDIVISION,
      label_smoothing: 0.0,
      noobj_weight: 1.0,
      max_detections: None,
      assign_policy: AssignPolicy::default(),
    }
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes;
    self
  }

  /// 按尺度顺序排列的全部锚框 (w, h)
  pub fn anchors(mut self, anchors: Vec<(f32, f32)>) -> Self {
    self.anchors = anchors;
    self
  }

  pub fn strides(mut self, strides: Vec<u32>) -> Self {
    self.strides = strides;
    self
  }

  pub fn xy_scales(mut self, xy_scales: Vec<f32>) -> Self {
    self.xy_scales = xy_scales;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = threshold;
    self
  }

  pub fn ignore_threshold(mut self, threshold: f32) -> Self {
    self.ignore_threshold = threshold;
    self
  }

  pub fn iou_loss(mut self, kind: IouKind) -> Self {
    self.iou_loss = kind;
    self
  }

  pub fn batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  pub fn subdivision(mut self, subdivision: usize) -> Self {
    self.subdivision = subdivision;
    self
  }

  pub fn label_smoothing(mut self, delta: f32) -> Self {
    self.label_smoothing = delta;
    self
  }

  pub fn noobj_weight(mut self, weight: f32) -> Self {
    self.noobj_weight = weight;
    self
  }

  pub fn max_detections(mut self, max_detections: Option<usize>) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn assign_policy(mut self, policy: AssignPolicy) -> Self {
    self.assign_policy = policy;
    self
  }

  pub fn build(self) -> Result<YoloConfig, ConfigError> {
    let num_scales = self.topology.num_scales();

    if self.strides.len() != num_scales {
      return Err(ConfigError::ScaleCount {
        what: "步长",
        expected: num_scales,
        actual: self.strides.len(),
      });
    }
    if self.xy_scales.len() != num_scales {
      return Err(ConfigError::ScaleCount {
        what: "xy 缩放系数",
        expected: num_scales,
        actual: self.xy_scales.len(),
      });
    }
    if self.anchors.len() != num_scales * ANCHORS_PER_SCALE {
      return Err(ConfigError::AnchorCount {
        expected: num_scales * ANCHORS_PER_SCALE,
        actual: self.anchors.len(),
      });
    }
    if self.strides.contains(&0) {
      return Err(ConfigError::InvalidStride);
    }
    if let Some(&(w, h)) = self.anchors.iter().find(|(w, h)| !(*w > 0.0 && *h > 0.0)) {
      return Err(ConfigError::InvalidAnchor(w, h));
    }
    if let Some(&s) = self.xy_scales.iter().find(|s| !(**s >= 1.0)) {
      return Err(ConfigError::InvalidXyScale(s));
    }

    let max_stride = self.strides.iter().copied().max().unwrap_or(1);
    if self.input_size == 0 || self.input_size % max_stride != 0 {
      return Err(ConfigError::InputSize {
        size: self.input_size,
        stride: max_stride,
      });
    }
    if let Some(&stride) = self.strides.iter().find(|&&s| self.input_size % s != 0) {
      return Err(ConfigError::InputSize {
        size: self.input_size,
        stride,
      });
    }
    if self.num_classes == 0 {
      return Err(ConfigError::NoClasses);
    }

    check_unit("置信度阈值", self.confidence_threshold)?;
    check_unit("NMS 阈值", self.nms_threshold)?;
    check_unit("忽略阈值", self.ignore_threshold)?;
    if !(0.0..1.0).contains(&self.label_smoothing) {
      return Err(ConfigError::OutOfRange {
        name: "标签平滑系数",
        value: self.label_smoothing,
      });
    }
    if !(self.noobj_weight >= 0.0) {
      return Err(ConfigError::OutOfRange {
        name: "负样本权重",
        value: self.noobj_weight,
      });
    }
    if self.batch_size == 0 || self.subdivision == 0 || self.batch_size % self.subdivision != 0 {
      return Err(ConfigError::Batch {
        batch_size: self.batch_size,
        subdivision: self.subdivision,
      });
    }

    let scales = self
      .strides
      .iter()
      .zip(&self.xy_scales)
      .zip(self.anchors.chunks_exact(ANCHORS_PER_SCALE))
      .map(|((&stride, &xy_scale), anchors)| ScaleSpec {
        stride,
        anchors: [anchors[0], anchors[1], anchors[2]],
        xy_scale,
      })
      .collect::<Vec<_>>();

    debug!(
      "构建配置: {:?}, 输入尺寸 {}, 类别数 {}, 尺度数 {}",
      self.topology,
      self.input_size,
      self.num_classes,
      scales.len()
    );

    Ok(YoloConfig {
      topology: self.topology,
      input_size: self.input_size,
      num_classes: self.num_classes,
      scales,
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
      ignore_threshold: self.ignore_threshold,
      iou_loss: self.iou_loss,
      batch_size: self.batch_size,
      subdivision: self.subdivision,
      label_smoothing: self.label_smoothing,
      noobj_weight: self.noobj_weight,
      max_detections: self.max_detections,
      assign_policy: self.assign_policy,
    })
  }
}

fn check_unit(name: &'static str, value: f32) -> Result<(), ConfigError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::OutOfRange { name, value })
  }
}

/// JSON 配置文件，所有字段可选，缺省时使用拓扑默认值
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct YoloSettings {
  pub topology: Option<Topology>,
  pub input_size: Option<u32>,
  pub num_classes: Option<usize>,
  pub anchors: Option<Vec<[f32; 2]>>,
  pub strides: Option<Vec<u32>>,
  pub xy_scales: Option<Vec<f32>>,
  pub confidence_threshold: Option<f32>,
  pub nms_threshold: Option<f32>,
  pub ignore_threshold: Option<f32>,
  pub iou_loss: Option<IouKind>,
  pub batch_size: Option<usize>,
  pub subdivision: Option<usize>,
  pub label_smoothing: Option<f32>,
  pub noobj_weight: Option<f32>,
  pub max_detections: Option<usize>,
  pub assign_policy: Option<AssignPolicy>,
}

impl YoloSettings {
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Self::from_json(&text)
  }

  pub fn from_json(text: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn into_builder(self) -> YoloConfigBuilder {
    let mut builder = YoloConfigBuilder::new(self.topology.unwrap_or_default());
    if let Some(v) = self.input_size {
      builder = builder.input_size(v);
    }
    if let Some(v) = self.num_classes {
      builder = builder.num_classes(v);
    }
    if let Some(v) = self.anchors {
      builder = builder.anchors(v.into_iter().map(|[w, h]| (w, h)).collect());
    }
    if let Some(v) = self.strides {
      builder = builder.strides(v);
    }
    if let Some(v) = self.xy_scales {
      builder = builder.xy_scales(v);
    }
    if let Some(v) = self.confidence_threshold {
      builder = builder.confidence_threshold(v);
    }
    if let Some(v) = self.nms_threshold {
      builder = builder.nms_threshold(v);
    }
    if let Some(v) = self.ignore_threshold {
      builder = builder.ignore_threshold(v);
    }
    if let Some(v) = self.iou_loss {
      builder = builder.iou_loss(v);
    }
    if let Some(v) = self.batch_size {
      builder = builder.batch_size(v);
    }
    if let Some(v) = self.subdivision {
      builder = builder.subdivision(v);
    }
    if let Some(v) = self.label_smoothing {
      builder = builder.label_smoothing(v);
    }
    if let Some(v) = self.noobj_weight {
      builder = builder.noobj_weight(v);
    }
    if let Some(v) = self.assign_policy {
      builder = builder.assign_policy(v);
    }
    builder.max_detections(self.max_detections)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn standard_defaults() {
    let config = YoloConfig::builder(Topology::Standard).build().unwrap();
    assert_eq!(config.num_scales(), 3);
    assert_eq!(config.grid_size(0), 76);
    assert_eq!(config.grid_size(2), 19);
    assert_eq!(config.scale(1).anchors[1], (76.0, 55.0));
    assert_eq!(config.scale(0).xy_scale, 1.2);
    assert_eq!(config.micro_batch(), 2);
  }

  #[test]
  fn tiny_defaults() {
    let config = YoloConfig::builder(Topology::Tiny)
      .input_size(416)
      .build()
      .unwrap();
    assert_eq!(config.num_scales(), 2);
    assert_eq!(config.scale(0).stride, 16);
    assert_eq!(config.grid_size(1), 13);
  }

  #[test]
  fn rejects_input_size_not_multiple_of_stride() {
    let err = YoloConfig::builder(Topology::Standard)
      .input_size(600)
      .build()
      .unwrap_err();
    assert!(matches!(err, ConfigError::InputSize { size: 600, stride: 32 }));

    let err = YoloConfig::builder(Topology::Standard)
      .input_size(0)
      .build()
      .unwrap_err();
    assert!(matches!(err, ConfigError::InputSize { .. }));

    // 608 可被最大步长 32 整除，但不能被 24 整除
    let err = YoloConfig::builder(Topology::Standard)
      .strides(vec![8, 24, 32])
      .build()
      .unwrap_err();
    assert!(matches!(err, ConfigError::InputSize { size: 608, stride: 24 }));

    let config = YoloConfig::builder(Topology::Standard)
      .strides(vec![8, 24, 32])
      .input_size(96)
      .build()
      .unwrap();
    assert_eq!(config.grid_size(1), 4);
  }

  #[test]
  fn rejects_anchor_count_for_topology() {
    let err = YoloConfig::builder(Topology::Tiny)
      .anchors(YOLOV4_ANCHORS.to_vec())
      .build()
      .unwrap_err();
    assert!(matches!(
      err,
      ConfigError::AnchorCount {
        expected: 6,
        actual: 9
      }
    ));
  }

  #[test]
  fn rejects_bad_batch_and_thresholds() {
    assert!(matches!(
      YoloConfig::builder(Topology::Standard)
        .batch_size(30)
        .subdivision(16)
        .build(),
      Err(ConfigError::Batch { .. })
    ));
    assert!(matches!(
      YoloConfig::builder(Topology::Standard)
        .nms_threshold(1.5)
        .build(),
      Err(ConfigError::OutOfRange { .. })
    ));
    assert!(matches!(
      YoloConfig::builder(Topology::Standard).num_classes(0).build(),
      Err(ConfigError::NoClasses)
    ));
  }

  #[test]
  fn settings_from_json() {
    let settings = YoloSettings::from_json(
      r#"{ "topology": "tiny", "input_size": 416, "num_classes": 2, "iou_loss": "giou",
           "assign_policy": "highest_iou_wins" }"#,
    )
    .unwrap();
    let config = settings.into_builder().build().unwrap();
    assert_eq!(config.topology(), Topology::Tiny);
    assert_eq!(config.input_size(), 416);
    assert_eq!(config.attributes(), 7);
    assert_eq!(config.iou_loss(), IouKind::Giou);
    assert_eq!(config.assign_policy(), AssignPolicy::HighestIouWins);
  }

  #[test]
  fn settings_reject_unknown_field() {
    assert!(YoloSettings::from_json(r#"{ "inputsize": 416 }"#).is_err());
  }
}
