// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 检测头输出张量
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

use thiserror::Error;

use crate::config::YoloConfig;

#[derive(Error, Debug, PartialEq)]
pub enum ShapeError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  DataLength { expected: usize, actual: usize },
  #[error("尺度数量不匹配: 期望 {expected}, 实际 {actual}")]
  ScaleCount { expected: usize, actual: usize },
  #[error("尺度 {scale} 形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  Scale {
    scale: usize,
    expected: [usize; 4],
    actual: [usize; 4],
  },
  #[error("尺度 {scale} 每个锚框的属性数不匹配: 期望 {expected}, 实际 {actual}")]
  Attributes {
    scale: usize,
    expected: usize,
    actual: usize,
  },
  #[error("尺度索引 {index} 超出尺度数量 {scales}")]
  ScaleIndex { index: usize, scales: usize },
  #[error("批次索引 {index} 超出批大小 {batch}")]
  BatchIndex { index: usize, batch: usize },
  #[error("批大小不匹配: 期望 {expected}, 实际 {actual}")]
  BatchSize { expected: usize, actual: usize },
}

/// 单个尺度的 NHWC 输出: (batch, grid, grid, anchors * attributes)
///
/// 最后一维按锚框分段，第 `a` 个锚框占据 `[a * attributes, (a + 1) * attributes)`。
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
  batch: usize,
  grid: usize,
  anchors: usize,
  attributes: usize,
  data: Box<[f32]>,
}

impl FeatureMap {
  pub fn new(
    batch: usize,
    grid: usize,
    anchors: usize,
    attributes: usize,
    data: Vec<f32>,
  ) -> Result<Self, ShapeError> {
    let expected = batch * grid * grid * anchors * attributes;
    if data.len() != expected {
      return Err(ShapeError::DataLength {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      batch,
      grid,
      anchors,
      attributes,
      data: data.into_boxed_slice(),
    })
  }

  pub fn zeros(batch: usize, grid: usize, anchors: usize, attributes: usize) -> Self {
    let size = batch * grid * grid * anchors * attributes;
    Self {
      batch,
      grid,
      anchors,
      attributes,
      data: vec![0.0; size].into_boxed_slice(),
    }
  }

  /// 按配置中第 `scale` 个尺度的形状创建全零张量
  pub fn zeros_for(config: &YoloConfig, scale: usize, batch: usize) -> Self {
    Self::zeros(
      batch,
      config.grid_size(scale),
      config.scale(scale).anchors.len(),
      config.attributes(),
    )
  }

  pub fn batch(&self) -> usize {
    self.batch
  }

  pub fn grid(&self) -> usize {
    self.grid
  }

  pub fn anchors(&self) -> usize {
    self.anchors
  }

  pub fn attributes(&self) -> usize {
    self.attributes
  }

  /// [batch, grid, grid, anchors]
  pub fn shape(&self) -> [usize; 4] {
    [self.batch, self.grid, self.grid, self.anchors]
  }

  /// 槽位数 (batch * grid * grid * anchors)
  pub fn num_slots(&self) -> usize {
    self.batch * self.grid * self.grid * self.anchors
  }

  pub fn slot_index(&self, batch: usize, row: usize, col: usize, anchor: usize) -> usize {
    ((batch * self.grid + row) * self.grid + col) * self.anchors + anchor
  }

  pub fn slot(&self, batch: usize, row: usize, col: usize, anchor: usize) -> &[f32] {
    let start = self.slot_index(batch, row, col, anchor) * self.attributes;
    &self.data[start..start + self.attributes]
  }

  pub fn slot_mut(&mut self, batch: usize, row: usize, col: usize, anchor: usize) -> &mut [f32] {
    let start = self.slot_index(batch, row, col, anchor) * self.attributes;
    &mut self.data[start..start + self.attributes]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  /// 校验一组输出与配置的尺度、网格与属性数一致
  pub fn check_outputs(config: &YoloConfig, maps: &[FeatureMap]) -> Result<(), ShapeError> {
    if maps.len() != config.num_scales() {
      return Err(ShapeError::ScaleCount {
        expected: config.num_scales(),
        actual: maps.len(),
      });
    }
    for (scale, map) in maps.iter().enumerate() {
      map.check_scale(config, scale)?;
    }
    Ok(())
  }

  /// 校验单个输出与配置中第 `scale` 个尺度一致
  pub fn check_scale(&self, config: &YoloConfig, scale: usize) -> Result<(), ShapeError> {
    if scale >= config.num_scales() {
      return Err(ShapeError::ScaleIndex {
        index: scale,
        scales: config.num_scales(),
      });
    }
    let grid = config.grid_size(scale);
    let anchors = config.scale(scale).anchors.len();
    let expected = [self.batch, grid, grid, anchors];
    if self.shape() != expected {
      return Err(ShapeError::Scale {
        scale,
        expected,
        actual: self.shape(),
      });
    }
    if self.attributes != config.attributes() {
      return Err(ShapeError::Attributes {
        scale,
        expected: config.attributes(),
        actual: self.attributes,
      });
    }
    Ok(())
  }
}

impl AsRef<[f32]> for FeatureMap {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}
