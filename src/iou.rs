// 该文件是 Shanan （山南西风） 项目的一部分。
// src/iou.rs - IoU 及其变体 (GIoU / DIoU / CIoU)
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

use std::{f32::consts::PI, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bbox::BBox;

/// 面积与距离的下限，避免除零
pub const EPSILON: f32 = 1e-9;

/// 定位损失使用的 IoU 变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IouKind {
  Iou,
  Giou,
  Diou,
  #[default]
  Ciou,
}

#[derive(Error, Debug)]
#[error("未知的 IoU 类型: {0}，可选 iou / giou / diou / ciou")]
pub struct UnknownIouKind(String);

impl FromStr for IouKind {
  type Err = UnknownIouKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "iou" => Ok(IouKind::Iou),
      "giou" => Ok(IouKind::Giou),
      "diou" => Ok(IouKind::Diou),
      "ciou" => Ok(IouKind::Ciou),
      _ => Err(UnknownIouKind(s.to_string())),
    }
  }
}

impl fmt::Display for IouKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      IouKind::Iou => "iou",
      IouKind::Giou => "giou",
      IouKind::Diou => "diou",
      IouKind::Ciou => "ciou",
    };
    f.write_str(name)
  }
}

impl IouKind {
  pub fn compute(&self, a: &BBox, b: &BBox) -> f32 {
    match self {
      IouKind::Iou => iou(a, b),
      IouKind::Giou => giou(a, b),
      IouKind::Diou => diou(a, b),
      IouKind::Ciou => ciou(a, b),
    }
  }
}

/// 交集面积、并集面积与最小外接框
struct Overlap {
  inter: f32,
  union: f32,
  enclose_w: f32,
  enclose_h: f32,
}

fn overlap(a: &BBox, b: &BBox) -> Overlap {
  let ca = a.to_corners();
  let cb = b.to_corners();

  let inter_w = (ca.x2.min(cb.x2) - ca.x1.max(cb.x1)).max(0.0);
  let inter_h = (ca.y2.min(cb.y2) - ca.y1.max(cb.y1)).max(0.0);
  let inter = inter_w * inter_h;
  let union = (a.area() + b.area() - inter).max(EPSILON);

  Overlap {
    inter,
    union,
    enclose_w: (ca.x2.max(cb.x2) - ca.x1.min(cb.x1)).max(0.0),
    enclose_h: (ca.y2.max(cb.y2) - ca.y1.min(cb.y1)).max(0.0),
  }
}

/// 交并比，两个框不相交或任一框退化时为 0
pub fn iou(a: &BBox, b: &BBox) -> f32 {
  if a.is_degenerate() || b.is_degenerate() {
    return 0.0;
  }
  let o = overlap(a, b);
  (o.inter / o.union).clamp(0.0, 1.0)
}

pub fn giou(a: &BBox, b: &BBox) -> f32 {
  let o = overlap(a, b);
  let iou = iou(a, b);
  let enclose = (o.enclose_w * o.enclose_h).max(EPSILON);
  iou - ((enclose - o.union) / enclose).max(0.0)
}

/// 中心点距离平方与外接框对角线平方之比
fn center_penalty(a: &BBox, b: &BBox, o: &Overlap) -> f32 {
  let diagonal = (o.enclose_w * o.enclose_w + o.enclose_h * o.enclose_h).max(EPSILON);
  let dx = a.x - b.x;
  let dy = a.y - b.y;
  (dx * dx + dy * dy) / diagonal
}

pub fn diou(a: &BBox, b: &BBox) -> f32 {
  let o = overlap(a, b);
  iou(a, b) - center_penalty(a, b, &o)
}

pub fn ciou(a: &BBox, b: &BBox) -> f32 {
  let o = overlap(a, b);
  let iou = iou(a, b);

  // atan2 对宽高为 0 的框也有定义
  let angle = b.w.max(0.0).atan2(b.h.max(0.0)) - a.w.max(0.0).atan2(a.h.max(0.0));
  let v = 4.0 / (PI * PI) * angle * angle;
  let alpha = v / (1.0 - iou + v + EPSILON);

  iou - center_penalty(a, b, &o) - alpha * v
}

#[cfg(test)]
mod tests {
  use super::*;

  fn boxes() -> Vec<BBox> {
    vec![
      BBox::new(10.0, 10.0, 8.0, 6.0),
      BBox::new(12.0, 11.0, 8.0, 10.0),
      BBox::new(50.0, 50.0, 4.0, 4.0),
      BBox::new(10.0, 10.0, 2.0, 30.0),
      BBox::new(300.0, 300.0, 40.0, 40.0),
    ]
  }

  #[test]
  fn iou_of_identical_boxes_is_one() {
    for b in boxes() {
      assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
      assert!((ciou(&b, &b) - 1.0).abs() < 1e-5);
    }
  }

  #[test]
  fn iou_is_bounded_and_symmetric() {
    for a in boxes() {
      for b in boxes() {
        let ab = iou(&a, &b);
        assert!((0.0..=1.0).contains(&ab));
        assert!((ab - iou(&b, &a)).abs() < 1e-6);
      }
    }
  }

  #[test]
  fn variants_never_exceed_iou() {
    for a in boxes() {
      for b in boxes() {
        let base = iou(&a, &b);
        assert!(giou(&a, &b) <= base + 1e-6);
        assert!(diou(&a, &b) <= base + 1e-6);
        assert!(ciou(&a, &b) <= base + 1e-6);
      }
    }
  }

  #[test]
  fn known_overlap() {
    // 交集 25，并集 175
    let a = BBox::new(5.0, 5.0, 10.0, 10.0);
    let b = BBox::new(10.0, 10.0, 10.0, 10.0);
    assert!((iou(&a, &b) - 25.0 / 175.0).abs() < 1e-6);
    // 外接框 15x15
    let expected = 25.0 / 175.0 - (225.0 - 175.0) / 225.0;
    assert!((giou(&a, &b) - expected).abs() < 1e-6);

    // 中心距离平方 50，外接框对角线平方 450
    assert!((diou(&a, &b) - (1.0 / 7.0 - 1.0 / 9.0)).abs() < 1e-6);
    // 宽高比相同，v = 0
    assert!((ciou(&a, &b) - diou(&a, &b)).abs() < 1e-6);
  }

  #[test]
  fn ciou_aspect_ratio_term() {
    // 同中心，交集 4，并集 12
    let a = BBox::new(0.0, 0.0, 4.0, 2.0);
    let b = BBox::new(0.0, 0.0, 2.0, 4.0);
    assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    assert!(diou(&a, &b) - 1.0 / 3.0 < 1e-6);

    // v = 4 / π² · (atan(1/2) - atan(2))² ≈ 0.167826, alpha ≈ 0.201111
    assert!((ciou(&a, &b) - 0.299_582).abs() < 1e-5);
    assert!((ciou(&a, &b) - ciou(&b, &a)).abs() < 1e-6);
  }

  #[test]
  fn degenerate_boxes_are_zero_not_nan() {
    let a = BBox::new(5.0, 5.0, 0.0, 10.0);
    let b = BBox::new(5.0, 5.0, 0.0, 0.0);
    assert_eq!(iou(&a, &b), 0.0);
    assert_eq!(iou(&a, &BBox::new(5.0, 5.0, 3.0, 3.0)), 0.0);
    for kind in [IouKind::Giou, IouKind::Diou, IouKind::Ciou] {
      assert!(kind.compute(&a, &b).is_finite());
    }
  }

  #[test]
  fn parse_kind() {
    assert_eq!("CIoU".parse::<IouKind>().unwrap(), IouKind::Ciou);
    assert_eq!("giou".parse::<IouKind>().unwrap(), IouKind::Giou);
    assert!("l2".parse::<IouKind>().is_err());
    assert_eq!(IouKind::Diou.to_string(), "diou");
  }
}
