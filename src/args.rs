// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 项目参数配置
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

use clap::{Parser, Subcommand};
use shanan_yolov4::{bbox::BBox, target::GroundTruth};

/// Shanan YOLOv4 工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 解析 darknet 权重文件并输出摘要
  InspectWeights {
    /// 权重文件地址，例如 darknet:///path/yolov4.weights?tiny&classes=80
    #[arg(long, value_name = "URL")]
    weights: String,
  },

  /// 打印每个真值框负责的尺度、锚框与网格单元
  Assign {
    /// 输入像素坐标的真值框: cx,cy,w,h,class
    #[arg(long = "gt", value_name = "CX,CY,W,H,CLASS", value_parser = parse_ground_truth, required = true)]
    ground_truths: Vec<GroundTruth>,

    /// 使用 YOLOv4-tiny 拓扑
    #[arg(long)]
    tiny: bool,

    /// JSON 配置文件
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,
  },

  /// 对已解码候选框做 NMS 并还原到原图坐标
  Postprocess {
    /// 候选框 JSON 文件: [[x, y, w, h, class_id, probability], ...]
    #[arg(long, value_name = "FILE")]
    candidates: PathBuf,

    /// 原图宽度
    #[arg(long)]
    width: u32,

    /// 原图高度
    #[arg(long)]
    height: u32,

    /// JSON 配置文件
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// 类别名称文件，每行一个，缺省为 COCO
    #[arg(long, value_name = "FILE")]
    names: Option<PathBuf>,
  },
}

fn parse_ground_truth(s: &str) -> Result<GroundTruth, String> {
  let fields: Vec<&str> = s.split(',').map(str::trim).collect();
  let [x, y, w, h, class_id] = fields.as_slice() else {
    return Err(format!("需要 5 个以逗号分隔的字段: {}", s));
  };
  let coord = |v: &str| v.parse::<f32>().map_err(|e| format!("坐标 {} 无效: {}", v, e));
  let class_id = class_id
    .parse::<usize>()
    .map_err(|e| format!("类别 {} 无效: {}", class_id, e))?;
  Ok(GroundTruth::new(
    BBox::new(coord(*x)?, coord(*y)?, coord(*w)?, coord(*h)?),
    class_id,
  ))
}
