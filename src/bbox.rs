// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bbox.rs - 边界框表示与转换
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

/// 中心点 + 宽高 表示的边界框
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
  /// 中心点 x 坐标
  pub x: f32,
  /// 中心点 y 坐标
  pub y: f32,
  /// 宽度
  pub w: f32,
  /// 高度
  pub h: f32,
}

/// 左上角 + 右下角 表示的边界框
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Corners {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl BBox {
  pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
    Self { x, y, w, h }
  }

  /// 以原点为中心、只保留形状的框，用于锚框形状匹配
  pub const fn shape(w: f32, h: f32) -> Self {
    Self { x: 0.0, y: 0.0, w, h }
  }

  pub fn area(&self) -> f32 {
    if self.is_degenerate() {
      0.0
    } else {
      self.w * self.h
    }
  }

  pub fn is_degenerate(&self) -> bool {
    !(self.w > 0.0 && self.h > 0.0)
  }

  pub fn to_corners(&self) -> Corners {
    let half_w = self.w * 0.5;
    let half_h = self.h * 0.5;
    Corners {
      x1: self.x - half_w,
      y1: self.y - half_h,
      x2: self.x + half_w,
      y2: self.y + half_h,
    }
  }

  /// 所有坐标同时乘以 `factor`，例如归一化坐标与像素坐标互转
  pub fn scaled(&self, factor: f32) -> Self {
    Self {
      x: self.x * factor,
      y: self.y * factor,
      w: self.w * factor,
      h: self.h * factor,
    }
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.x, self.y, self.w, self.h]
  }
}

impl From<[f32; 4]> for BBox {
  fn from([x, y, w, h]: [f32; 4]) -> Self {
    Self { x, y, w, h }
  }
}

impl Corners {
  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  pub fn to_bbox(&self) -> BBox {
    let w = self.width();
    let h = self.height();
    BBox {
      x: self.x1 + w * 0.5,
      y: self.y1 + h * 0.5,
      w,
      h,
    }
  }

  /// 裁剪到 [0, width] x [0, height]
  pub fn clip(&self, width: f32, height: f32) -> Self {
    Self {
      x1: self.x1.clamp(0.0, width),
      y1: self.y1.clamp(0.0, height),
      x2: self.x2.clamp(0.0, width),
      y2: self.y2.clamp(0.0, height),
    }
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }
}
