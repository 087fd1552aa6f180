// 该文件是 Shanan （山南西风） 项目的一部分。
// src/labels.rs - 类别名称与 darknet 标注文件
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

use thiserror::Error;
use tracing::{debug, warn};

use crate::{bbox::BBox, codec::Letterbox, target::GroundTruth};

const UNKNOWN_CLASS: &str = "unknown";

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标注文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("类别名称文件为空")]
  Empty,
  #[error("第 {line} 行格式错误: {reason}")]
  Malformed { line: usize, reason: String },
}

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 类别编号到名称的映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNames {
  names: Vec<String>,
}

impl Default for ClassNames {
  fn default() -> Self {
    Self::coco()
  }
}

impl ClassNames {
  pub fn coco() -> Self {
    Self {
      names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
    }
  }

  /// 每行一个类别名称，忽略空行与首尾空白
  pub fn parse(text: &str) -> Result<Self, LabelError> {
    let names: Vec<String> = text
      .lines()
      .map(str::trim)
      .filter(|l| !l.is_empty())
      .map(str::to_string)
      .collect();
    if names.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(Self { names })
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let names = Self::parse(&std::fs::read_to_string(path)?)?;
    debug!("从 {} 读取 {} 个类别名称", path.display(), names.len());
    Ok(names)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn name(&self, class_id: usize) -> &str {
    self
      .names
      .get(class_id)
      .map(String::as_str)
      .unwrap_or(UNKNOWN_CLASS)
  }
}

pub fn read_class_names(path: impl AsRef<Path>) -> Result<ClassNames, LabelError> {
  ClassNames::from_path(path)
}

/// 解析 darknet 标注：每行 `class cx cy w h`，坐标相对原图归一化
///
/// 返回的真值框已通过 `letterbox` 映射到网络输入像素坐标。
pub fn parse_darknet_labels(
  text: &str,
  letterbox: &Letterbox,
) -> Result<Vec<GroundTruth>, LabelError> {
  let mut truths = Vec::new();
  for (index, line) in text.lines().enumerate() {
    let line_no = index + 1;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.is_empty() {
      continue;
    }
    if fields.len() != 5 {
      return Err(LabelError::Malformed {
        line: line_no,
        reason: format!("需要 5 个字段, 实际 {} 个", fields.len()),
      });
    }

    let class_id: usize = fields[0].parse().map_err(|_| LabelError::Malformed {
      line: line_no,
      reason: format!("类别编号无效: {}", fields[0]),
    })?;
    let mut values = [0.0f32; 4];
    for (v, field) in values.iter_mut().zip(&fields[1..]) {
      *v = field.parse().map_err(|_| LabelError::Malformed {
        line: line_no,
        reason: format!("坐标无效: {}", field),
      })?;
    }

    let [x, y, w, h] = values;
    let original = BBox::new(
      x * letterbox.width,
      y * letterbox.height,
      w * letterbox.width,
      h * letterbox.height,
    );
    if original.is_degenerate() {
      warn!("第 {} 行标注框面积为 0，已跳过", line_no);
      continue;
    }
    truths.push(GroundTruth::new(letterbox.apply(&original), class_id));
  }
  Ok(truths)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_names() {
    let names = ClassNames::coco();
    assert_eq!(names.len(), 80);
    assert_eq!(names.name(0), "person");
    assert_eq!(names.name(79), "toothbrush");
    assert_eq!(names.name(80), "unknown");
  }

  #[test]
  fn parse_names_file() {
    let names = ClassNames::parse("cat\n\n  dog \r\n").unwrap();
    assert_eq!(names.len(), 2);
    assert_eq!(names.name(1), "dog");
    assert!(matches!(ClassNames::parse(" \n"), Err(LabelError::Empty)));
  }

  #[test]
  fn names_file_from_disk() {
    let path = std::env::temp_dir().join(format!("shanan-yolov4-{}.names", std::process::id()));
    std::fs::write(&path, "person\nbicycle\n\ncar\n").unwrap();
    let names = read_class_names(&path);
    let direct = ClassNames::from_path(&path);
    std::fs::remove_file(&path).unwrap();

    let names = names.unwrap();
    assert_eq!(names.len(), 3);
    assert_eq!(names.name(2), "car");
    assert_eq!(direct.unwrap(), names);
    assert!(matches!(read_class_names(&path), Err(LabelError::IoError(_))));
  }

  #[test]
  fn darknet_labels_to_input_pixels() {
    let letterbox = Letterbox::new(1216, 608, 608);
    let truths =
      parse_darknet_labels("2 0.5 0.5 0.25 0.5\n\n0 0.1 0.1 0 0.2\n", &letterbox).unwrap();
    assert_eq!(truths.len(), 1);
    assert_eq!(truths[0].class_id, 2);
    assert_eq!(truths[0].bbox, BBox::new(304.0, 304.0, 152.0, 152.0));
  }

  #[test]
  fn malformed_label_line() {
    let letterbox = Letterbox::identity(416);
    let err = parse_darknet_labels("1 0.5 0.5 0.1\n", &letterbox).unwrap_err();
    assert!(matches!(err, LabelError::Malformed { line: 1, .. }));
    let err =
      parse_darknet_labels("0 0.5 0.5 0.1 0.1\nx 0.5 0.5 0.1 0.1\n", &letterbox).unwrap_err();
    assert!(matches!(err, LabelError::Malformed { line: 2, .. }));
  }
}
