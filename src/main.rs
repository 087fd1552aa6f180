// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use shanan_yolov4::{
  FromUrl, Topology, YoloConfig, YoloSettings,
  bbox::BBox,
  codec::{DecodedBox, Letterbox},
  labels::ClassNames,
  postprocess::PostProcessor,
  target::{GroundTruth, TargetAssigner},
  weights::DarknetWeightsBuilder,
};
use tracing::info;
use url::Url;

use args::{Args, Command};

fn load_config(settings: Option<&Path>, tiny: bool) -> Result<YoloConfig> {
  let mut settings = match settings {
    Some(path) => YoloSettings::from_path(path)
      .with_context(|| format!("无法读取配置文件 {}", path.display()))?,
    None => YoloSettings::default(),
  };
  if tiny {
    settings.topology = Some(Topology::Tiny);
  }
  Ok(settings.into_builder().build()?)
}

fn inspect_weights(weights: &str) -> Result<()> {
  let url = Url::parse(weights).with_context(|| format!("无效的权重地址: {}", weights))?;
  let builder = DarknetWeightsBuilder::from_url(&url)?;
  let manifest = builder.manifest()?;
  let file = builder.build()?;

  println!("权重文件: {}", builder.path().display());
  println!(
    "版本: {}.{}.{}",
    file.header.major, file.header.minor, file.header.revision
  );
  println!("已训练图像数: {}", file.header.seen);
  println!("拓扑: {:?}, 类别数: {}", manifest.topology, manifest.num_classes);
  println!("卷积层数: {}", file.layers.len());
  println!("检测头输出层: {:?}", manifest.output_layers());
  println!("参数总数: {}", file.total_floats());
  Ok(())
}

fn assign(ground_truths: Vec<GroundTruth>, tiny: bool, settings: Option<&Path>) -> Result<()> {
  let config = load_config(settings, tiny)?;
  info!(
    "拓扑 {:?}, 输入尺寸 {}",
    config.topology(),
    config.input_size()
  );

  let targets = TargetAssigner::new(&config).assign(&[ground_truths]);
  for a in &targets.assignments {
    let (aw, ah) = config.scale(a.slot.scale).anchors[a.slot.anchor];
    println!(
      "({:.1}, {:.1}, {:.1}x{:.1}) 类别 {} → 尺度 {} (步长 {}), 锚框 {} ({}x{}), 单元 ({}, {}), IoU {:.3}",
      a.ground_truth.bbox.x,
      a.ground_truth.bbox.y,
      a.ground_truth.bbox.w,
      a.ground_truth.bbox.h,
      a.ground_truth.class_id,
      a.slot.scale,
      config.scale(a.slot.scale).stride,
      a.slot.anchor,
      aw,
      ah,
      a.slot.row,
      a.slot.col,
      a.shape_iou
    );
  }
  println!("正样本数: {}", targets.num_positives());
  Ok(())
}

/// 解析 `[[x, y, w, h, class_id, probability], ...]`，类别必须为非负整数
fn parse_candidates(text: &str) -> Result<Vec<DecodedBox>> {
  let raw: Vec<[f32; 6]> = serde_json::from_str(text)?;
  raw
    .into_iter()
    .enumerate()
    .map(|(i, [x, y, w, h, class_id, p])| {
      if !(class_id >= 0.0 && class_id.fract() == 0.0) {
        bail!("第 {} 个候选框的类别 {} 不是非负整数", i, class_id);
      }
      Ok(DecodedBox::from_prediction(
        BBox::new(x, y, w, h),
        class_id as usize,
        p,
      ))
    })
    .collect()
}

fn postprocess(
  candidates: &Path,
  width: u32,
  height: u32,
  settings: Option<&Path>,
  names: Option<&Path>,
) -> Result<()> {
  let config = load_config(settings, false)?;
  let names = match names {
    Some(path) => ClassNames::from_path(path)?,
    None => ClassNames::coco(),
  };

  let text = std::fs::read_to_string(candidates)
    .with_context(|| format!("无法读取候选框文件 {}", candidates.display()))?;
  let boxes = parse_candidates(&text)?;

  let processor = PostProcessor::from_config(&config);
  let selected = processor.select(boxes);
  let letterbox = Letterbox::new(width, height, config.input_size());
  let records: Vec<_> = processor
    .fit_to_original(&selected, &letterbox)
    .iter()
    .map(|item| item.to_record(&names))
    .collect();

  println!("{}", serde_json::to_string_pretty(&records)?);
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let args = Args::parse();

  match args.command {
    Command::InspectWeights { weights } => inspect_weights(&weights),
    Command::Assign {
      ground_truths,
      tiny,
      settings,
    } => assign(ground_truths, tiny, settings.as_deref()),
    Command::Postprocess {
      candidates,
      width,
      height,
      settings,
      names,
    } => postprocess(
      &candidates,
      width,
      height,
      settings.as_deref(),
      names.as_deref(),
    ),
  }
}
