// 该文件是 Shanan （山南西风） 项目的一部分。
// src/target.rs - 训练目标分配
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

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
  bbox::BBox,
  codec::{Slot, decode_feature_map, encode_box},
  config::YoloConfig,
  iou::iou,
  tensor::{FeatureMap, ShapeError},
};

/// 多个真值框落入同一槽位时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignPolicy {
  /// 后写入的真值框覆盖先前的
  #[default]
  LastWriteWins,
  /// 保留与锚框形状 IoU 更高的真值框，相等时后写入者胜出
  HighestIouWins,
}

/// 真值框，坐标为网络输入像素
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
  pub bbox: BBox,
  pub class_id: usize,
}

impl GroundTruth {
  pub fn new(bbox: BBox, class_id: usize) -> Self {
    Self { bbox, class_id }
  }

  /// 由相对输入尺寸归一化的坐标构造
  pub fn from_normalized(bbox: BBox, class_id: usize, input_size: u32) -> Self {
    Self::new(bbox.scaled(input_size as f32), class_id)
  }
}

/// 与真值框形状最匹配的锚框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorMatch {
  pub scale: usize,
  pub anchor: usize,
  pub iou: f32,
}

/// 在所有尺度的全部锚框中选出形状 IoU 最大者，相等时取先出现的
pub fn best_anchor(config: &YoloConfig, bbox: &BBox) -> AnchorMatch {
  let shape = BBox::shape(bbox.w, bbox.h);
  let mut best = AnchorMatch {
    scale: 0,
    anchor: 0,
    iou: f32::NEG_INFINITY,
  };
  for (scale, spec) in config.scales().iter().enumerate() {
    for (anchor, &(aw, ah)) in spec.anchors.iter().enumerate() {
      let overlap = iou(&shape, &BBox::shape(aw, ah));
      if overlap > best.iou {
        best = AnchorMatch {
          scale,
          anchor,
          iou: overlap,
        };
      }
    }
  }
  best
}

/// 框中心所在的网格单元 (row, col)，越界时夹到网格边缘
pub fn responsible_cell(config: &YoloConfig, scale: usize, bbox: &BBox) -> (usize, usize) {
  let stride = config.scale(scale).stride as f32;
  let last = config.grid_size(scale) - 1;
  let cell = |c: f32| ((c / stride).floor().max(0.0) as usize).min(last);
  (cell(bbox.y), cell(bbox.x))
}

/// 一个正样本槽位的分配记录
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
  pub batch: usize,
  pub slot: Slot,
  pub ground_truth: GroundTruth,
  pub shape_iou: f32,
  /// 该槽位应回归到的 (tx, ty, tw, th)
  pub offsets: [f32; 4],
}

/// 单个尺度的训练目标
///
/// 与检测头输出同形状；每个槽位为 `[x, y, w, h, objectness, 类别...]`，
/// 框坐标为输入像素。`ignore` 与槽位一一对应。
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTarget {
  map: FeatureMap,
  ignore: Box<[bool]>,
}

impl ScaleTarget {
  fn new(map: FeatureMap) -> Self {
    let ignore = vec![false; map.num_slots()].into_boxed_slice();
    Self { map, ignore }
  }

  pub fn map(&self) -> &FeatureMap {
    &self.map
  }

  pub fn shape(&self) -> [usize; 4] {
    self.map.shape()
  }

  pub fn slot(&self, batch: usize, row: usize, col: usize, anchor: usize) -> &[f32] {
    self.map.slot(batch, row, col, anchor)
  }

  pub fn objectness(&self, batch: usize, row: usize, col: usize, anchor: usize) -> f32 {
    self.slot(batch, row, col, anchor)[4]
  }

  pub fn is_positive(&self, batch: usize, row: usize, col: usize, anchor: usize) -> bool {
    self.objectness(batch, row, col, anchor) > 0.0
  }

  pub fn is_ignored(&self, batch: usize, row: usize, col: usize, anchor: usize) -> bool {
    self.ignore[self.map.slot_index(batch, row, col, anchor)]
  }

  pub fn bbox(&self, batch: usize, row: usize, col: usize, anchor: usize) -> BBox {
    let s = self.slot(batch, row, col, anchor);
    BBox::new(s[0], s[1], s[2], s[3])
  }

  pub fn class_target(&self, batch: usize, row: usize, col: usize, anchor: usize) -> &[f32] {
    &self.slot(batch, row, col, anchor)[5..]
  }

  /// 正样本槽位数
  pub fn positives(&self) -> usize {
    self
      .map
      .as_slice()
      .chunks_exact(self.map.attributes())
      .filter(|s| s[4] > 0.0)
      .count()
  }

  pub fn ignored(&self) -> usize {
    self.ignore.iter().filter(|&&i| i).count()
  }
}

/// 一个批次的训练目标
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTargets {
  pub scales: Vec<ScaleTarget>,
  pub assignments: Vec<Assignment>,
}

impl TrainingTargets {
  pub fn batch(&self) -> usize {
    self.scales.first().map(|s| s.map.batch()).unwrap_or(0)
  }

  pub fn num_positives(&self) -> usize {
    self.assignments.len()
  }
}

/// 将真值框分配到检测头槽位
pub struct TargetAssigner<'a> {
  config: &'a YoloConfig,
}

impl<'a> TargetAssigner<'a> {
  pub fn new(config: &'a YoloConfig) -> Self {
    Self { config }
  }

  fn is_valid(&self, index: usize, truth: &GroundTruth) -> bool {
    if truth.bbox.is_degenerate() {
      warn!("第 {} 个真值框面积为 0，已跳过: {:?}", index, truth.bbox);
      return false;
    }
    if truth.class_id >= self.config.num_classes() {
      warn!(
        "第 {} 个真值框类别 {} 超出类别数 {}，已跳过",
        index,
        truth.class_id,
        self.config.num_classes()
      );
      return false;
    }
    true
  }

  fn write_slot(&self, values: &mut [f32], truth: &GroundTruth) {
    let classes = self.config.num_classes();
    let delta = self.config.label_smoothing();
    values[..4].copy_from_slice(&truth.bbox.to_array());
    values[4] = 1.0;
    for (c, v) in values[5..].iter_mut().enumerate() {
      let onehot = if c == truth.class_id { 1.0 } else { 0.0 };
      *v = onehot * (1.0 - delta) + delta / classes as f32;
    }
  }

  /// 为批次中每张图像的真值框生成训练目标
  pub fn assign(&self, batch: &[Vec<GroundTruth>]) -> TrainingTargets {
    let config = self.config;
    let mut scales: Vec<ScaleTarget> = (0..config.num_scales())
      .map(|s| ScaleTarget::new(FeatureMap::zeros_for(config, s, batch.len())))
      .collect();
    // 每个槽位当前对应的 assignments 下标
    let mut owners: Vec<Vec<Option<usize>>> = scales
      .iter()
      .map(|s| vec![None; s.map.num_slots()])
      .collect();
    let mut assignments: Vec<Assignment> = Vec::new();

    for (b, truths) in batch.iter().enumerate() {
      for (index, truth) in truths.iter().enumerate() {
        if !self.is_valid(index, truth) {
          continue;
        }

        let matched = best_anchor(config, &truth.bbox);
        let (row, col) = responsible_cell(config, matched.scale, &truth.bbox);
        let slot = Slot {
          scale: matched.scale,
          row,
          col,
          anchor: matched.anchor,
        };
        let assignment = Assignment {
          batch: b,
          slot,
          ground_truth: *truth,
          shape_iou: matched.iou,
          offsets: encode_box(config.scale(slot.scale), &slot, &truth.bbox),
        };

        let target = &mut scales[slot.scale];
        let slot_index = target.map.slot_index(b, row, col, slot.anchor);
        let owner = &mut owners[slot.scale][slot_index];

        if let Some(previous) = *owner {
          let replace = match config.assign_policy() {
            AssignPolicy::LastWriteWins => true,
            AssignPolicy::HighestIouWins => matched.iou >= assignments[previous].shape_iou,
          };
          warn!(
            "图像 {} 的槽位冲突: 尺度 {}, 单元 ({}, {}), 锚框 {}, {}",
            b,
            slot.scale,
            row,
            col,
            slot.anchor,
            if replace { "覆盖已有目标" } else { "保留已有目标" }
          );
          if !replace {
            continue;
          }
          self.write_slot(target.map.slot_mut(b, row, col, slot.anchor), truth);
          assignments[previous] = assignment;
        } else {
          self.write_slot(target.map.slot_mut(b, row, col, slot.anchor), truth);
          *owner = Some(assignments.len());
          assignments.push(assignment);
        }
      }
    }

    debug!("目标分配完成: {} 个正样本", assignments.len());
    TrainingTargets {
      scales,
      assignments,
    }
  }

  /// 分配目标并根据当前预测生成忽略掩码
  ///
  /// 非正样本槽位的预测框与同一图像任一真值框的 IoU 大于忽略阈值时，
  /// 该槽位不计入负样本 objectness 损失。
  pub fn assign_with_predictions(
    &self,
    batch: &[Vec<GroundTruth>],
    predictions: &[FeatureMap],
  ) -> Result<TrainingTargets, ShapeError> {
    let config = self.config;
    FeatureMap::check_outputs(config, predictions)?;
    for map in predictions {
      if map.batch() != batch.len() {
        return Err(ShapeError::BatchSize {
          expected: batch.len(),
          actual: map.batch(),
        });
      }
    }

    let mut targets = self.assign(batch);
    let threshold = config.ignore_threshold();

    for (b, truths) in batch.iter().enumerate() {
      let valid: Vec<&GroundTruth> = truths
        .iter()
        .filter(|t| !t.bbox.is_degenerate() && t.class_id < config.num_classes())
        .collect();
      if valid.is_empty() {
        continue;
      }

      for (scale, map) in predictions.iter().enumerate() {
        let target = &mut targets.scales[scale];
        for decoded in decode_feature_map(config, scale, map, b)? {
          let Some(slot) = decoded.slot else {
            continue;
          };
          if target.is_positive(b, slot.row, slot.col, slot.anchor) {
            continue;
          }
          if valid
            .iter()
            .any(|t| iou(&decoded.bbox, &t.bbox) > threshold)
          {
            let index = target.map.slot_index(b, slot.row, slot.col, slot.anchor);
            target.ignore[index] = true;
          }
        }
      }
    }

    debug!(
      "忽略掩码: {} 个槽位",
      targets.scales.iter().map(ScaleTarget::ignored).sum::<usize>()
    );
    Ok(targets)
  }
}
