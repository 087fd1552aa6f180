// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - YOLOv4 检测流水线
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

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  bbox::{BBox, Corners},
  codec::{Letterbox, decode_outputs},
  config::{ConfigError, YoloConfig},
  labels::{ClassNames, LabelError},
  loss::{LossError, YoloLoss},
  postprocess::PostProcessor,
  target::TargetAssigner,
  tensor::{FeatureMap, ShapeError},
  weights::{DarknetWeightsBuilder, WeightFile, WeightFormatError},
};

#[derive(Error, Debug)]
pub enum Yolov4Error {
  #[error("配置错误: {0}")]
  ConfigError(#[from] ConfigError),
  #[error("权重文件错误: {0}")]
  WeightsError(#[from] WeightFormatError),
  #[error("张量形状错误: {0}")]
  ShapeError(#[from] ShapeError),
  #[error("损失计算错误: {0}")]
  LossError(#[from] LossError),
  #[error("标注错误: {0}")]
  LabelError(#[from] LabelError),
  #[error("网络前向错误: {0}")]
  NetworkError(Box<dyn std::error::Error + Send + Sync>),
}

/// 产生检测头输出的外部网络
pub trait Network {
  type Input;
  type Error: std::error::Error + Send + Sync + 'static;

  /// 按尺度顺序返回每个检测头的原始输出
  fn forward(&self, input: &Self::Input) -> Result<Vec<FeatureMap>, Self::Error>;
}

/// 原图坐标下的一个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: usize,
  pub score: f32,
  pub bbox: BBox,
}

impl DetectItem {
  pub fn corners(&self) -> Corners {
    self.bbox.to_corners()
  }

  pub fn to_record(&self, names: &ClassNames) -> DetectionRecord {
    DetectionRecord {
      class_id: self.class_id,
      class_name: names.name(self.class_id).to_string(),
      score: self.score,
      bbox: self.corners().to_array(),
    }
  }
}

/// 输出用的检测记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
  pub class_id: usize,
  pub class_name: String,
  pub score: f32,
  /// [x_min, y_min, x_max, y_max]
  pub bbox: [f32; 4],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn records(&self, names: &ClassNames) -> Vec<DetectionRecord> {
    self.items.iter().map(|i| i.to_record(names)).collect()
  }
}

pub struct Yolov4 {
  config: YoloConfig,
  postprocessor: PostProcessor,
  weights: Option<WeightFile>,
}

impl Yolov4 {
  pub fn config(&self) -> &YoloConfig {
    &self.config
  }

  pub fn weights(&self) -> Option<&WeightFile> {
    self.weights.as_ref()
  }

  pub fn assigner(&self) -> TargetAssigner<'_> {
    TargetAssigner::new(&self.config)
  }

  pub fn loss(&self) -> YoloLoss<'_> {
    YoloLoss::new(&self.config)
  }

  /// 对第 `batch` 张图像的检测头输出做解码、NMS，并还原到原图坐标
  pub fn predict(
    &self,
    outputs: &[FeatureMap],
    batch: usize,
    original: (u32, u32),
  ) -> Result<DetectResult, Yolov4Error> {
    let candidates = decode_outputs(&self.config, outputs, batch)?;
    let selected = self.postprocessor.select(candidates);
    let letterbox = Letterbox::new(original.0, original.1, self.config.input_size());
    let items = self.postprocessor.fit_to_original(&selected, &letterbox);
    debug!("图像 {}: {} 个检测结果", batch, items.len());
    Ok(DetectResult {
      items: items.into_boxed_slice(),
    })
  }

  /// 调用外部网络并对批次中每张图像做后处理
  pub fn infer<N: Network>(
    &self,
    network: &N,
    input: &N::Input,
    original: (u32, u32),
  ) -> Result<Vec<DetectResult>, Yolov4Error> {
    let outputs = network
      .forward(input)
      .map_err(|e| Yolov4Error::NetworkError(Box::new(e)))?;
    FeatureMap::check_outputs(&self.config, &outputs)?;
    let batch = outputs.first().map(FeatureMap::batch).unwrap_or(0);
    (0..batch)
      .map(|b| self.predict(&outputs, b, original))
      .collect()
  }
}

pub struct Yolov4Builder {
  config: YoloConfig,
  weights_path: Option<PathBuf>,
}

impl Yolov4Builder {
  pub fn new(config: YoloConfig) -> Self {
    Self {
      config,
      weights_path: None,
    }
  }

  /// 加载 darknet 权重，层结构由配置中的拓扑与类别数决定
  pub fn weights(mut self, path: impl Into<PathBuf>) -> Self {
    self.weights_path = Some(path.into());
    self
  }

  /// 每次构建都得到独立的实例
  pub fn build(&self) -> Result<Yolov4, Yolov4Error> {
    let weights = match &self.weights_path {
      Some(path) => Some(
        DarknetWeightsBuilder::new(path)
          .topology(self.config.topology())
          .num_classes(self.config.num_classes())
          .build()?,
      ),
      None => None,
    };

    info!(
      "YOLOv4 流水线就绪: {:?}, 输入尺寸 {}",
      self.config.topology(),
      self.config.input_size()
    );
    Ok(Yolov4 {
      postprocessor: PostProcessor::from_config(&self.config),
      config: self.config.clone(),
      weights,
    })
  }
}
