// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess.rs - 置信度过滤与按类别非极大值抑制
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

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
  codec::{DecodedBox, Letterbox},
  config::YoloConfig,
  iou::iou,
  model::DetectItem,
};

/// 检测后处理器
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessor {
  confidence_threshold: f32,
  nms_threshold: f32,
  max_detections: Option<usize>,
}

impl PostProcessor {
  pub fn new(confidence_threshold: f32, nms_threshold: f32) -> Self {
    Self {
      confidence_threshold,
      nms_threshold,
      max_detections: None,
    }
  }

  pub fn from_config(config: &YoloConfig) -> Self {
    Self::new(config.confidence_threshold(), config.nms_threshold())
      .with_max_detections(config.max_detections())
  }

  pub fn with_max_detections(mut self, max_detections: Option<usize>) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  pub fn nms_threshold(&self) -> f32 {
    self.nms_threshold
  }

  /// 过滤低置信度候选框，并在每个类别内做贪心 NMS
  ///
  /// 同一类别内按概率降序处理，概率相同的框保持输入顺序。
  /// 输出按类别编号升序拼接；设置了数量上限时改为按概率降序截断。
  pub fn select(&self, candidates: Vec<DecodedBox>) -> Vec<DecodedBox> {
    let total = candidates.len();
    let mut by_class: BTreeMap<usize, Vec<DecodedBox>> = BTreeMap::new();
    for candidate in candidates {
      if candidate.probability >= self.confidence_threshold {
        by_class.entry(candidate.class_id).or_default().push(candidate);
      }
    }

    let mut selected = Vec::new();
    for (_, boxes) in by_class {
      selected.extend(nms(boxes, self.nms_threshold));
    }

    if let Some(limit) = self.max_detections {
      selected.sort_by(|a, b| b.probability.total_cmp(&a.probability));
      selected.truncate(limit);
    }

    debug!("后处理: {} 个候选框 → {} 个检测结果", total, selected.len());
    selected
  }

  /// 将输入像素坐标的检测框映射回原图坐标，退化的框被丢弃
  pub fn fit_to_original(&self, boxes: &[DecodedBox], letterbox: &Letterbox) -> Vec<DetectItem> {
    boxes
      .iter()
      .filter_map(|b| {
        letterbox.undo(&b.bbox).map(|bbox| DetectItem {
          class_id: b.class_id,
          score: b.probability,
          bbox,
        })
      })
      .collect()
  }
}

/// 单一类别的贪心非极大值抑制，IoU 大于 `threshold` 的框被移除
pub fn nms(mut boxes: Vec<DecodedBox>, threshold: f32) -> Vec<DecodedBox> {
  // sort_by 是稳定排序
  boxes.sort_by(|a, b| b.probability.total_cmp(&a.probability));

  let mut kept: Vec<DecodedBox> = Vec::new();
  for candidate in boxes {
    if kept
      .iter()
      .all(|k| iou(&k.bbox, &candidate.bbox) <= threshold)
    {
      kept.push(candidate);
    }
  }
  kept
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bbox::BBox;

  fn candidate(x: f32, y: f32, w: f32, h: f32, class_id: usize, p: f32) -> DecodedBox {
    DecodedBox::from_prediction(BBox::new(x, y, w, h), class_id, p)
  }

  #[test]
  fn removes_overlaps_within_class() {
    let processor = PostProcessor::new(0.25, 0.3);
    let result = processor.select(vec![
      candidate(10.0, 10.0, 10.0, 10.0, 0, 0.9),
      candidate(11.0, 11.0, 10.0, 10.0, 0, 0.8),
      candidate(60.0, 60.0, 10.0, 10.0, 0, 0.7),
      // 与第一个框重叠但类别不同
      candidate(10.0, 10.0, 10.0, 10.0, 1, 0.6),
    ]);
    let probs: Vec<f32> = result.iter().map(|b| b.probability).collect();
    assert_eq!(probs, vec![0.9, 0.7, 0.6]);
  }

  #[test]
  fn confidence_threshold_and_empty_result() {
    let processor = PostProcessor::new(0.5, 0.3);
    assert!(processor.select(Vec::new()).is_empty());
    assert!(
      processor
        .select(vec![candidate(1.0, 1.0, 1.0, 1.0, 0, 0.49)])
        .is_empty()
    );
    assert_eq!(
      processor
        .select(vec![candidate(1.0, 1.0, 1.0, 1.0, 0, 0.5)])
        .len(),
      1
    );
  }

  #[test]
  fn ties_keep_input_order() {
    let processor = PostProcessor::new(0.1, 0.3);
    let mut first = candidate(10.0, 10.0, 10.0, 10.0, 0, 0.8);
    first.objectness = 1.0;
    let second = candidate(10.5, 10.0, 10.0, 10.0, 0, 0.8);
    let result = processor.select(vec![first.clone(), second]);
    assert_eq!(result, vec![first]);
  }

  #[test]
  fn select_is_idempotent() {
    let processor = PostProcessor::new(0.2, 0.45);
    let mut candidates = Vec::new();
    for i in 0..40 {
      let f = i as f32;
      candidates.push(candidate(
        (f * 7.0) % 50.0,
        (f * 3.0) % 40.0,
        10.0 + (f % 5.0),
        12.0,
        i % 3,
        ((i * 37) % 100) as f32 / 100.0,
      ));
    }
    let once = processor.select(candidates);
    let twice = processor.select(once.clone());
    assert_eq!(once, twice);
  }

  #[test]
  fn cap_keeps_highest_probabilities() {
    let processor = PostProcessor::new(0.1, 0.5).with_max_detections(Some(2));
    let result = processor.select(vec![
      candidate(0.0, 0.0, 5.0, 5.0, 0, 0.3),
      candidate(50.0, 0.0, 5.0, 5.0, 1, 0.9),
      candidate(100.0, 0.0, 5.0, 5.0, 2, 0.6),
    ]);
    let classes: Vec<usize> = result.iter().map(|b| b.class_id).collect();
    assert_eq!(classes, vec![1, 2]);
  }

  #[test]
  fn fit_to_original_drops_padding_boxes() {
    let processor = PostProcessor::new(0.1, 0.5);
    let letterbox = Letterbox::new(1216, 608, 608);
    let items = processor.fit_to_original(
      &[
        candidate(200.0, 302.0, 50.0, 30.0, 3, 0.9),
        candidate(200.0, 20.0, 50.0, 30.0, 4, 0.9),
      ],
      &letterbox,
    );
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 3);
    assert!((items[0].bbox.x - 400.0).abs() < 1e-3);
    assert!((items[0].bbox.w - 100.0).abs() < 1e-3);
  }
}
