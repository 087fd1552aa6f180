// 该文件是 Shanan （山南西风） 项目的一部分。
// src/codec.rs - 检测头输出解码、编码与 letterbox 坐标还原
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

use tracing::debug;

use crate::{
  bbox::BBox,
  config::{ScaleSpec, YoloConfig},
  tensor::{FeatureMap, ShapeError},
};

const LOGIT_EPSILON: f32 = 1e-6;

pub fn sigmoid(x: f32) -> f32 {
  if x >= 0.0 {
    1.0 / (1.0 + (-x).exp())
  } else {
    let e = x.exp();
    e / (1.0 + e)
  }
}

/// sigmoid 的反函数，输入会被限制在 (0, 1) 开区间内
pub fn logit(p: f32) -> f32 {
  let p = p.clamp(LOGIT_EPSILON, 1.0 - LOGIT_EPSILON);
  (p / (1.0 - p)).ln()
}

/// 输出槽位在张量中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
  pub scale: usize,
  pub row: usize,
  pub col: usize,
  pub anchor: usize,
}

/// 一个槽位的原始网络输出 (未激活)
#[derive(Debug, Clone, Copy)]
pub struct RawCandidate<'a> {
  pub tx: f32,
  pub ty: f32,
  pub tw: f32,
  pub th: f32,
  pub objectness: f32,
  pub class_logits: &'a [f32],
}

impl<'a> RawCandidate<'a> {
  /// 从 `[tx, ty, tw, th, obj, cls...]` 切片构造
  ///
  /// # Panics
  /// 切片长度小于 5 时 panic
  pub fn from_slot(values: &'a [f32]) -> Self {
    Self {
      tx: values[0],
      ty: values[1],
      tw: values[2],
      th: values[3],
      objectness: values[4],
      class_logits: &values[5..],
    }
  }
}

/// 解码后的候选框 (输入像素坐标)
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBox {
  pub bbox: BBox,
  pub objectness: f32,
  pub class_id: usize,
  /// objectness × max(类别概率)
  pub probability: f32,
  pub slot: Option<Slot>,
}

impl DecodedBox {
  /// 由外部给出的已解码预测构造，例如测试或离线数据
  pub fn from_prediction(bbox: BBox, class_id: usize, probability: f32) -> Self {
    Self {
      bbox,
      objectness: probability,
      class_id,
      probability,
      slot: None,
    }
  }

  /// 以输入尺寸归一化到 [0, 1]
  pub fn normalized(&self, input_size: u32) -> BBox {
    self.bbox.scaled(1.0 / input_size as f32)
  }
}

/// 网格偏移 → 输入像素框
pub fn decode_box(scale: &ScaleSpec, slot: &Slot, t: [f32; 4]) -> BBox {
  let stride = scale.stride as f32;
  let s = scale.xy_scale;
  let (aw, ah) = scale.anchors[slot.anchor];
  let shift = 0.5 * (s - 1.0);

  BBox {
    x: (sigmoid(t[0]) * s - shift + slot.col as f32) * stride,
    y: (sigmoid(t[1]) * s - shift + slot.row as f32) * stride,
    w: t[2].exp() * aw,
    h: t[3].exp() * ah,
  }
}

/// 输入像素框 → 网格偏移，`decode_box` 的逆运算
pub fn encode_box(scale: &ScaleSpec, slot: &Slot, bbox: &BBox) -> [f32; 4] {
  let stride = scale.stride as f32;
  let s = scale.xy_scale;
  let (aw, ah) = scale.anchors[slot.anchor];
  let shift = 0.5 * (s - 1.0);

  [
    logit((bbox.x / stride - slot.col as f32 + shift) / s),
    logit((bbox.y / stride - slot.row as f32 + shift) / s),
    (bbox.w / aw).ln(),
    (bbox.h / ah).ln(),
  ]
}

/// 解码单个槽位：框坐标、objectness 与类别
pub fn decode(scale: &ScaleSpec, slot: Slot, raw: &RawCandidate) -> DecodedBox {
  let bbox = decode_box(scale, &slot, [raw.tx, raw.ty, raw.tw, raw.th]);
  let objectness = sigmoid(raw.objectness);

  let mut class_id = 0usize;
  let mut max_prob = 0.0f32;
  for (c, &l) in raw.class_logits.iter().enumerate() {
    let prob = sigmoid(l);
    if prob > max_prob {
      max_prob = prob;
      class_id = c;
    }
  }

  DecodedBox {
    bbox,
    objectness,
    class_id,
    probability: objectness * max_prob,
    slot: Some(slot),
  }
}

/// 解码一个尺度中第 `batch` 张图像的全部槽位，顺序为 行 → 列 → 锚框
pub fn decode_feature_map(
  config: &YoloConfig,
  scale: usize,
  map: &FeatureMap,
  batch: usize,
) -> Result<Vec<DecodedBox>, ShapeError> {
  map.check_scale(config, scale)?;
  if batch >= map.batch() {
    return Err(ShapeError::BatchIndex {
      index: batch,
      batch: map.batch(),
    });
  }
  let spec = config.scale(scale);
  let grid = map.grid();
  let mut boxes = Vec::with_capacity(grid * grid * map.anchors());

  for row in 0..grid {
    for col in 0..grid {
      for anchor in 0..map.anchors() {
        let raw = RawCandidate::from_slot(map.slot(batch, row, col, anchor));
        let slot = Slot {
          scale,
          row,
          col,
          anchor,
        };
        boxes.push(decode(spec, slot, &raw));
      }
    }
  }
  Ok(boxes)
}

/// 解码全部尺度并按尺度顺序拼接为单一候选列表
pub fn decode_outputs(
  config: &YoloConfig,
  maps: &[FeatureMap],
  batch: usize,
) -> Result<Vec<DecodedBox>, ShapeError> {
  FeatureMap::check_outputs(config, maps)?;

  let mut candidates = Vec::new();
  for (scale, map) in maps.iter().enumerate() {
    candidates.extend(decode_feature_map(config, scale, map, batch)?);
  }
  debug!("解码得到 {} 个候选框", candidates.len());
  Ok(candidates)
}

/// 保持宽高比缩放并居中填充到正方形输入的变换参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  /// 缩放比例 r = min(S / W, S / H)
  pub ratio: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  /// 原始图像宽度
  pub width: f32,
  /// 原始图像高度
  pub height: f32,
}

impl Letterbox {
  pub fn new(width: u32, height: u32, input_size: u32) -> Self {
    let (w, h, s) = (width as f32, height as f32, input_size as f32);
    let ratio = (s / w).min(s / h);
    Self {
      ratio,
      pad_x: (s - w * ratio) * 0.5,
      pad_y: (s - h * ratio) * 0.5,
      width: w,
      height: h,
    }
  }

  /// 原图即为输入尺寸时的恒等变换
  pub fn identity(input_size: u32) -> Self {
    Self::new(input_size, input_size, input_size)
  }

  /// 缩放后图像内容的宽高 (未取整)
  pub fn resized(&self) -> (f32, f32) {
    (self.width * self.ratio, self.height * self.ratio)
  }

  /// 原图像素坐标 → 输入像素坐标
  pub fn apply(&self, bbox: &BBox) -> BBox {
    BBox {
      x: bbox.x * self.ratio + self.pad_x,
      y: bbox.y * self.ratio + self.pad_y,
      w: bbox.w * self.ratio,
      h: bbox.h * self.ratio,
    }
  }

  /// 输入像素坐标 → 原图像素坐标，超出原图的部分被裁剪，裁剪后退化的框返回 `None`
  pub fn undo(&self, bbox: &BBox) -> Option<BBox> {
    let restored = BBox {
      x: (bbox.x - self.pad_x) / self.ratio,
      y: (bbox.y - self.pad_y) / self.ratio,
      w: bbox.w / self.ratio,
      h: bbox.h / self.ratio,
    };
    let clipped = restored.to_corners().clip(self.width, self.height).to_bbox();
    if clipped.is_degenerate() {
      None
    } else {
      Some(clipped)
    }
  }
}
