// 该文件是 Shanan （山南西风） 项目的一部分。
// src/loss.rs - 检测损失
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

use std::ops::AddAssign;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
  codec::{Slot, decode_box},
  config::YoloConfig,
  target::TrainingTargets,
  tensor::{FeatureMap, ShapeError},
};

#[derive(Error, Debug)]
pub enum LossError {
  #[error("预测与训练目标形状不匹配: {0}")]
  Shape(#[from] ShapeError),
}

/// 以 logit 为输入的二元交叉熵，数值稳定形式
pub fn bce_with_logits(x: f32, target: f32) -> f32 {
  x.max(0.0) - x * target + (-x.abs()).exp().ln_1p()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossBreakdown {
  pub localization: f32,
  pub objectness: f32,
  pub classification: f32,
  pub total: f32,
}

impl LossBreakdown {
  fn normalized(self, divisor: f32) -> Self {
    let localization = self.localization / divisor;
    let objectness = self.objectness / divisor;
    let classification = self.classification / divisor;
    Self {
      localization,
      objectness,
      classification,
      total: localization + objectness + classification,
    }
  }
}

impl AddAssign for LossBreakdown {
  fn add_assign(&mut self, rhs: Self) {
    self.localization += rhs.localization;
    self.objectness += rhs.objectness;
    self.classification += rhs.classification;
    self.total += rhs.total;
  }
}

/// 总损失与各尺度损失
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossReport {
  pub total: LossBreakdown,
  pub scales: Vec<LossBreakdown>,
}

pub struct YoloLoss<'a> {
  config: &'a YoloConfig,
}

impl<'a> YoloLoss<'a> {
  pub fn new(config: &'a YoloConfig) -> Self {
    Self { config }
  }

  fn check_shapes(
    &self,
    predictions: &[FeatureMap],
    targets: &TrainingTargets,
  ) -> Result<(), ShapeError> {
    FeatureMap::check_outputs(self.config, predictions)?;
    if targets.scales.len() != predictions.len() {
      return Err(ShapeError::ScaleCount {
        expected: predictions.len(),
        actual: targets.scales.len(),
      });
    }
    for (scale, (pred, target)) in predictions.iter().zip(&targets.scales).enumerate() {
      if pred.shape() != target.shape() {
        return Err(ShapeError::Scale {
          scale,
          expected: pred.shape(),
          actual: target.shape(),
        });
      }
      if pred.attributes() != target.map().attributes() {
        return Err(ShapeError::Attributes {
          scale,
          expected: pred.attributes(),
          actual: target.map().attributes(),
        });
      }
    }
    Ok(())
  }

  /// 计算一个批次的损失
  ///
  /// 正样本计算定位损失 `(1 - IoU) × (2 - w·h / S²)` 与各类别 BCE 之和；
  /// objectness 对正样本以 1、对未被忽略的负样本以 0 为目标。
  /// 各项求和后除以小批大小。
  pub fn compute(
    &self,
    predictions: &[FeatureMap],
    targets: &TrainingTargets,
  ) -> Result<LossReport, LossError> {
    self.check_shapes(predictions, targets)?;

    let config = self.config;
    let kind = config.iou_loss();
    let area = (config.input_size() as f32).powi(2);
    let noobj_weight = config.noobj_weight();
    let divisor = config.micro_batch() as f32;

    let mut total = LossBreakdown::default();
    let mut scales = Vec::with_capacity(predictions.len());

    for (scale, (pred, target)) in predictions.iter().zip(&targets.scales).enumerate() {
      let spec = config.scale(scale);
      let mut sum = LossBreakdown::default();

      for b in 0..pred.batch() {
        for row in 0..pred.grid() {
          for col in 0..pred.grid() {
            for anchor in 0..pred.anchors() {
              let p = pred.slot(b, row, col, anchor);
              let t = target.slot(b, row, col, anchor);

              if t[4] > 0.0 {
                let slot = Slot {
                  scale,
                  row,
                  col,
                  anchor,
                };
                let predicted = decode_box(spec, &slot, [p[0], p[1], p[2], p[3]]);
                let truth = target.bbox(b, row, col, anchor);
                let weight = 2.0 - truth.w * truth.h / area;
                sum.localization += (1.0 - kind.compute(&predicted, &truth)) * weight;
                sum.objectness += bce_with_logits(p[4], 1.0);
                sum.classification += p[5..]
                  .iter()
                  .zip(&t[5..])
                  .map(|(&x, &y)| bce_with_logits(x, y))
                  .sum::<f32>();
              } else if !target.is_ignored(b, row, col, anchor) {
                sum.objectness += noobj_weight * bce_with_logits(p[4], 0.0);
              }
            }
          }
        }
      }

      let normalized = sum.normalized(divisor);
      debug!(
        "尺度 {} 损失: 定位 {:.4}, 置信度 {:.4}, 分类 {:.4}",
        scale, normalized.localization, normalized.objectness, normalized.classification
      );
      total += normalized;
      scales.push(normalized);
    }

    Ok(LossReport { total, scales })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    bbox::BBox,
    config::Topology,
    iou::IouKind,
    target::{GroundTruth, TargetAssigner},
  };

  fn config(noobj_weight: f32) -> YoloConfig {
    YoloConfig::builder(Topology::Tiny)
      .input_size(64)
      .num_classes(2)
      .batch_size(4)
      .subdivision(2)
      .iou_loss(IouKind::Iou)
      .noobj_weight(noobj_weight)
      .build()
      .unwrap()
  }

  fn predictions(config: &YoloConfig, batch: usize) -> Vec<FeatureMap> {
    (0..config.num_scales())
      .map(|s| FeatureMap::zeros_for(config, s, batch))
      .collect()
  }

  #[test]
  fn stable_bce() {
    assert!((bce_with_logits(0.0, 1.0) - 2f32.ln()).abs() < 1e-6);
    assert!((bce_with_logits(0.0, 0.0) - 2f32.ln()).abs() < 1e-6);
    assert!(bce_with_logits(100.0, 1.0) < 1e-6);
    assert!((bce_with_logits(-100.0, 1.0) - 100.0).abs() < 1e-3);
    assert!(bce_with_logits(-100.0, 0.0).is_finite());
  }

  #[test]
  fn empty_targets_give_objectness_only() {
    let config = config(1.0);
    let preds = predictions(&config, 1);
    let targets = TargetAssigner::new(&config).assign(&[vec![]]);
    let report = YoloLoss::new(&config).compute(&preds, &targets).unwrap();

    // 64 输入: 4x4 与 2x2 网格，共 (16 + 4) * 3 个负样本
    let expected = 60.0 * 2f32.ln() / 2.0;
    assert!((report.total.objectness - expected).abs() < 1e-4);
    assert_eq!(report.total.localization, 0.0);
    assert_eq!(report.total.classification, 0.0);
    assert!((report.total.total - expected).abs() < 1e-4);
    assert_eq!(report.scales.len(), 2);
  }

  #[test]
  fn positive_slot_terms() {
    let config = config(0.0);
    let truth = GroundTruth::new(BBox::new(24.0, 24.0, 23.0, 27.0), 1);
    let targets = TargetAssigner::new(&config).assign(&[vec![truth]]);
    let mut preds = predictions(&config, 1);
    let a = &targets.assignments[0];
    let slot = preds[a.slot.scale].slot_mut(0, a.slot.row, a.slot.col, a.slot.anchor);
    slot[..4].copy_from_slice(&a.offsets);

    let report = YoloLoss::new(&config).compute(&preds, &targets).unwrap();
    // 预测框与真值框重合，定位损失为 0
    assert!(report.total.localization.abs() < 1e-3);
    // 零 logit: 置信度与两个类别各 ln 2，除以小批大小 2
    assert!((report.total.objectness - 2f32.ln() / 2.0).abs() < 1e-5);
    assert!((report.total.classification - 2f32.ln()).abs() < 1e-5);
    assert_eq!(report.scales[1], LossBreakdown::default());
  }

  #[test]
  fn localization_is_weighted_by_box_size() {
    let config = config(0.0);
    let truth = GroundTruth::new(BBox::new(24.0, 24.0, 23.0, 27.0), 0);
    let targets = TargetAssigner::new(&config).assign(&[vec![truth]]);
    let mut preds = predictions(&config, 1);
    let a = &targets.assignments[0];
    // 预测框宽高缩小为一半
    let offsets = [
      a.offsets[0],
      a.offsets[1],
      a.offsets[2] - 2f32.ln(),
      a.offsets[3] - 2f32.ln(),
    ];
    preds[a.slot.scale]
      .slot_mut(0, a.slot.row, a.slot.col, a.slot.anchor)[..4]
      .copy_from_slice(&offsets);

    let report = YoloLoss::new(&config).compute(&preds, &targets).unwrap();
    let weight = 2.0 - 23.0 * 27.0 / (64.0 * 64.0);
    let expected = (1.0 - 0.25) * weight / 2.0;
    assert!((report.total.localization - expected).abs() < 1e-3);
  }

  #[test]
  fn ignored_slots_do_not_count() {
    let config = config(1.0);
    let preds = predictions(&config, 1);
    let mut targets = TargetAssigner::new(&config).assign(&[vec![]]);
    let baseline = YoloLoss::new(&config).compute(&preds, &targets).unwrap();

    let truth = GroundTruth::new(BBox::new(24.0, 24.0, 23.0, 27.0), 0);
    let mut shifted = preds.clone();
    // 让单元 (1, 1) 锚框 0 的预测覆盖真值框
    let a = TargetAssigner::new(&config).assign(&[vec![truth]]).assignments[0].clone();
    shifted[0].slot_mut(0, 1, 1, 1)[..4].copy_from_slice(&crate::codec::encode_box(
      config.scale(0),
      &Slot { anchor: 1, ..a.slot },
      &truth.bbox,
    ));
    targets = TargetAssigner::new(&config)
      .assign_with_predictions(&[vec![truth]], &shifted)
      .unwrap();
    assert!(targets.scales[0].is_ignored(0, 1, 1, 1));

    let report = YoloLoss::new(&config).compute(&shifted, &targets).unwrap();
    // 一个正样本与一个忽略槽位均不再计入负样本损失
    let negatives = report.total.objectness - 2f32.ln() / 2.0;
    assert!((baseline.total.objectness - negatives - 2.0 * 2f32.ln() / 2.0).abs() < 1e-4);
  }

  #[test]
  fn shape_mismatch_is_an_error() {
    let config = config(1.0);
    let targets = TargetAssigner::new(&config).assign(&[vec![], vec![]]);
    let preds = predictions(&config, 1);
    assert!(matches!(
      YoloLoss::new(&config).compute(&preds, &targets),
      Err(LossError::Shape(ShapeError::Scale { scale: 0, .. }))
    ));

    // 类别数不同的配置生成的目标
    let wider = YoloConfig::builder(Topology::Tiny)
      .input_size(64)
      .num_classes(3)
      .build()
      .unwrap();
    let targets = TargetAssigner::new(&wider).assign(&[vec![]]);
    assert!(matches!(
      YoloLoss::new(&config).compute(&preds, &targets),
      Err(LossError::Shape(ShapeError::Attributes {
        scale: 0,
        expected: 7,
        actual: 8
      }))
    ));
  }
}
