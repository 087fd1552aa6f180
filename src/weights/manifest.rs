// 该文件是 Shanan （山南西风） 项目的一部分。
// src/weights/manifest.rs - 卷积层读取顺序清单
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

use crate::config::{ANCHORS_PER_SCALE, Topology};

/// 清单格式版本，层顺序变化时递增
pub const MANIFEST_VERSION: u32 = 1;

/// 单个卷积层的参数形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
  pub in_channels: usize,
  pub out_channels: usize,
  pub kernel: usize,
  pub batch_norm: bool,
}

impl ConvSpec {
  pub fn kernel_len(&self) -> usize {
    self.out_channels * self.in_channels * self.kernel * self.kernel
  }

  fn checked_floats(&self) -> Option<usize> {
    let vectors: usize = if self.batch_norm { 4 } else { 1 };
    let kernel = self
      .out_channels
      .checked_mul(self.in_channels)?
      .checked_mul(self.kernel * self.kernel)?;
    vectors.checked_mul(self.out_channels)?.checked_add(kernel)
  }

  /// 该层在权重文件中占用的 f32 数量
  pub fn expected_floats(&self) -> usize {
    let vectors = if self.batch_norm { 4 } else { 1 };
    vectors * self.out_channels + self.kernel_len()
  }
}

/// 权重文件中卷积层的顺序 (即 darknet cfg 中的构建顺序)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerManifest {
  pub topology: Topology,
  pub num_classes: usize,
  pub version: u32,
  layers: Vec<ConvSpec>,
}

#[derive(Default)]
struct ManifestBuilder {
  layers: Vec<ConvSpec>,
}

impl ManifestBuilder {
  fn conv(&mut self, in_channels: usize, out_channels: usize, kernel: usize) -> &mut Self {
    self.layers.push(ConvSpec {
      in_channels,
      out_channels,
      kernel,
      batch_norm: true,
    });
    self
  }

  /// 检测头输出层：无 BN，带偏置
  fn head(&mut self, in_channels: usize, out_channels: usize) -> &mut Self {
    self.layers.push(ConvSpec {
      in_channels,
      out_channels,
      kernel: 1,
      batch_norm: false,
    });
    self
  }

  /// CSPDarknet53 的一个下采样阶段
  fn csp_stage(&mut self, in_channels: usize, out_channels: usize, blocks: usize) -> &mut Self {
    let hidden = out_channels / 2;
    self
      .conv(in_channels, out_channels, 3)
      .conv(out_channels, hidden, 1)
      .conv(out_channels, hidden, 1);
    for _ in 0..blocks {
      self.conv(hidden, hidden, 1).conv(hidden, hidden, 3);
    }
    self.conv(hidden, hidden, 1).conv(out_channels, out_channels, 1)
  }

  /// 1x1 / 3x3 交替的五层卷积
  fn five(&mut self, wide: usize, narrow: usize) -> &mut Self {
    self
      .conv(wide, narrow, 1)
      .conv(narrow, wide, 3)
      .conv(wide, narrow, 1)
      .conv(narrow, wide, 3)
      .conv(wide, narrow, 1)
  }
}

impl LayerManifest {
  pub fn for_topology(topology: Topology, num_classes: usize) -> Self {
    match topology {
      Topology::Standard => Self::yolov4(num_classes),
      Topology::Tiny => Self::yolov4_tiny(num_classes),
    }
  }

  /// 类别数为 0，或总字节数超出 usize 时返回 None
  pub fn checked(topology: Topology, num_classes: usize) -> Option<Self> {
    if num_classes == 0 {
      return None;
    }
    num_classes.checked_add(5)?.checked_mul(ANCHORS_PER_SCALE)?;
    let manifest = Self::for_topology(topology, num_classes);
    manifest
      .layers
      .iter()
      .try_fold(0usize, |total, l| total.checked_add(l.checked_floats()?))?
      .checked_mul(4)?;
    Some(manifest)
  }

  /// YOLOv4: CSPDarknet53 + SPP + PANet，110 个卷积层
  pub fn yolov4(num_classes: usize) -> Self {
    let filters = ANCHORS_PER_SCALE * (5 + num_classes);
    let mut m = ManifestBuilder::default();

    // 第一个阶段的残差块通道数与其它阶段不同
    m.conv(3, 32, 3)
      .conv(32, 64, 3)
      .conv(64, 64, 1)
      .conv(64, 64, 1)
      .conv(64, 32, 1)
      .conv(32, 64, 3)
      .conv(64, 64, 1)
      .conv(128, 64, 1);
    m.csp_stage(64, 128, 2)
      .csp_stage(128, 256, 8)
      .csp_stage(256, 512, 8)
      .csp_stage(512, 1024, 4);

    // SPP
    m.conv(1024, 512, 1).conv(512, 1024, 3).conv(1024, 512, 1);
    m.conv(2048, 512, 1).conv(512, 1024, 3).conv(1024, 512, 1);

    // PANet 自顶向下
    m.conv(512, 256, 1).conv(512, 256, 1).five(512, 256);
    m.conv(256, 128, 1).conv(256, 128, 1).five(256, 128);

    // 检测头，自底向上
    m.conv(128, 256, 3).head(256, filters);
    m.conv(128, 256, 3).five(512, 256);
    m.conv(256, 512, 3).head(512, filters);
    m.conv(256, 512, 3).five(1024, 512);
    m.conv(512, 1024, 3).head(1024, filters);

    Self {
      topology: Topology::Standard,
      num_classes,
      version: MANIFEST_VERSION,
      layers: m.layers,
    }
  }

  /// YOLOv4-tiny，21 个卷积层
  pub fn yolov4_tiny(num_classes: usize) -> Self {
    let filters = ANCHORS_PER_SCALE * (5 + num_classes);
    let mut m = ManifestBuilder::default();

    m.conv(3, 32, 3).conv(32, 64, 3);
    // CSP 块的 route groups=2 只取一半通道
    for channels in [64, 128, 256] {
      let half = channels / 2;
      m.conv(channels, channels, 3)
        .conv(half, half, 3)
        .conv(half, half, 3)
        .conv(channels, channels, 1);
    }
    m.conv(512, 512, 3)
      .conv(512, 256, 1)
      .conv(256, 512, 3)
      .head(512, filters);
    m.conv(256, 128, 1).conv(384, 256, 3).head(256, filters);

    Self {
      topology: Topology::Tiny,
      num_classes,
      version: MANIFEST_VERSION,
      layers: m.layers,
    }
  }

  pub fn layers(&self) -> &[ConvSpec] {
    &self.layers
  }

  pub fn len(&self) -> usize {
    self.layers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.layers.is_empty()
  }

  pub fn expected_floats(&self) -> usize {
    self.layers.iter().map(ConvSpec::expected_floats).sum()
  }

  /// 无 BN 的检测头输出层下标
  pub fn output_layers(&self) -> Vec<usize> {
    self
      .layers
      .iter()
      .enumerate()
      .filter(|(_, l)| !l.batch_norm)
      .map(|(i, _)| i)
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yolov4_matches_published_weights() {
    let manifest = LayerManifest::yolov4(80);
    assert_eq!(manifest.len(), 110);
    assert_eq!(manifest.output_layers(), vec![93, 101, 109]);
    // yolov4.weights: 257717640 字节，其中 20 字节文件头
    assert_eq!(manifest.expected_floats() * 4 + 20, 257_717_640);
  }

  #[test]
  fn yolov4_tiny_matches_published_weights() {
    let manifest = LayerManifest::yolov4_tiny(80);
    assert_eq!(manifest.len(), 21);
    assert_eq!(manifest.output_layers(), vec![17, 20]);
    // yolov4-tiny.weights: 24251276 字节
    assert_eq!(manifest.expected_floats() * 4 + 20, 24_251_276);
  }

  #[test]
  fn head_filters_follow_class_count() {
    let manifest = LayerManifest::for_topology(Topology::Tiny, 2);
    let out = manifest.layers()[17];
    assert_eq!(out.out_channels, 21);
    assert!(!out.batch_norm);
    assert_eq!(out.expected_floats(), 21 + 21 * 512);
  }

  #[test]
  fn checked_rejects_unusable_class_counts() {
    assert_eq!(
      LayerManifest::checked(Topology::Standard, 80),
      Some(LayerManifest::yolov4(80))
    );
    assert!(LayerManifest::checked(Topology::Tiny, 0).is_none());
    assert!(LayerManifest::checked(Topology::Tiny, usize::MAX).is_none());
    // 通道数本身不溢出，但核参数量溢出
    assert!(LayerManifest::checked(Topology::Standard, usize::MAX / 1024).is_none());
  }
}
