// 该文件是 Shanan （山南西风） 项目的一部分。
// src/letterbox.rs - 输入图像 letterbox 预处理
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

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use tracing::debug;

use crate::codec::Letterbox;

/// 填充区域的灰度值
pub const PAD_VALUE: u8 = 128;

/// 保持宽高比缩放到 `input_size` 并以灰色居中填充
///
/// 返回填充后的图像与对应的坐标变换。
pub fn letterbox_image(image: &RgbImage, input_size: u32) -> (RgbImage, Letterbox) {
  let letterbox = Letterbox::new(image.width(), image.height(), input_size);
  let (w, h) = letterbox.resized();
  let (w, h) = ((w.round() as u32).max(1), (h.round() as u32).max(1));

  let resized = imageops::resize(image, w, h, FilterType::Triangle);
  let mut canvas = RgbImage::from_pixel(input_size, input_size, Rgb([PAD_VALUE; 3]));
  let x = (input_size.saturating_sub(w) / 2) as i64;
  let y = (input_size.saturating_sub(h) / 2) as i64;
  imageops::overlay(&mut canvas, &resized, x, y);

  debug!(
    "letterbox: {}x{} → {}x{}, 偏移 ({}, {})",
    image.width(),
    image.height(),
    w,
    h,
    x,
    y
  );
  (canvas, letterbox)
}

/// 转为 [0, 1] 范围的 NHWC 浮点数据
pub fn to_input_tensor(image: &RgbImage) -> Vec<f32> {
  image.as_raw().iter().map(|&v| v as f32 / 255.0).collect()
}
