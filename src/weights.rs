// 该文件是 Shanan （山南西风） 项目的一部分。
// src/weights.rs - darknet 权重文件读取
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

use std::{
  io::{Read, Write},
  path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, config::Topology};

mod manifest;
pub use self::manifest::{ConvSpec, LayerManifest, MANIFEST_VERSION};

const DEFAULT_NUM_CLASSES: usize = 80;
const FLOAT_BYTES: usize = 4;

#[derive(Error, Debug)]
pub enum WeightFormatError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("文件头不完整: 需要 {expected} 字节, 实际 {actual} 字节")]
  Header { expected: usize, actual: usize },
  #[error("第 {layer} 层权重不足: 需要 {expected} 个浮点数, 剩余 {available} 个")]
  Truncated {
    layer: usize,
    expected: usize,
    available: usize,
  },
  #[error("最后一层之后仍有 {0} 字节未读取，权重文件与网络结构不匹配")]
  TrailingBytes(usize),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("URL 参数无效: {0}")]
  InvalidQuery(String),
  #[error("类别数 {0} 无效")]
  InvalidClasses(usize),
}

/// 权重文件头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightHeader {
  pub major: i32,
  pub minor: i32,
  pub revision: i32,
  /// 训练时已见过的图像数
  pub seen: u64,
}

impl WeightHeader {
  /// darknet 0.2 之后 seen 为 64 位
  fn seen_is_wide(major: i32, minor: i32) -> bool {
    major < 1000 && minor < 1000 && major.saturating_mul(10).saturating_add(minor) >= 2
  }

  pub fn byte_len(&self) -> usize {
    if Self::seen_is_wide(self.major, self.minor) {
      20
    } else {
      16
    }
  }

  fn parse(bytes: &[u8]) -> Result<Self, WeightFormatError> {
    let int = |i: usize| -> Option<i32> {
      let chunk = bytes.get(i * 4..i * 4 + 4)?;
      Some(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    };
    let (Some(major), Some(minor), Some(revision)) = (int(0), int(1), int(2)) else {
      return Err(WeightFormatError::Header {
        expected: 12,
        actual: bytes.len(),
      });
    };

    let seen = if Self::seen_is_wide(major, minor) {
      bytes
        .get(12..20)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
    } else {
      bytes
        .get(12..16)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
    };

    let header = WeightHeader {
      major,
      minor,
      revision,
      seen: 0,
    };
    match seen {
      Some(seen) => Ok(WeightHeader { seen, ..header }),
      None => Err(WeightFormatError::Header {
        expected: header.byte_len(),
        actual: bytes.len(),
      }),
    }
  }

  fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
    writer.write_all(&self.major.to_le_bytes())?;
    writer.write_all(&self.minor.to_le_bytes())?;
    writer.write_all(&self.revision.to_le_bytes())?;
    if Self::seen_is_wide(self.major, self.minor) {
      writer.write_all(&self.seen.to_le_bytes())
    } else {
      writer.write_all(&(self.seen as u32).to_le_bytes())
    }
  }
}

impl Default for WeightHeader {
  fn default() -> Self {
    Self {
      major: 0,
      minor: 2,
      revision: 5,
      seen: 0,
    }
  }
}

/// BN 参数，文件中的顺序为 beta (偏置), gamma (缩放), 均值, 方差
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm {
  pub beta: Box<[f32]>,
  pub gamma: Box<[f32]>,
  pub mean: Box<[f32]>,
  pub variance: Box<[f32]>,
}

/// 单个卷积层的参数
#[derive(Debug, Clone, PartialEq)]
pub struct ConvWeights {
  pub spec: ConvSpec,
  pub batch_norm: Option<BatchNorm>,
  /// 仅无 BN 的层有卷积偏置
  pub bias: Option<Box<[f32]>>,
  /// darknet 排布 (out, in, kh, kw)
  pub kernel: Box<[f32]>,
}

impl ConvWeights {
  /// 转换为 (kh, kw, in, out) 排布
  pub fn kernel_hwio(&self) -> Vec<f32> {
    let ConvSpec {
      in_channels: ci,
      out_channels: co,
      kernel: k,
      ..
    } = self.spec;
    let mut out = vec![0.0; self.kernel.len()];
    for o in 0..co {
      for i in 0..ci {
        for y in 0..k {
          for x in 0..k {
            let src = ((o * ci + i) * k + y) * k + x;
            let dst = ((y * k + x) * ci + i) * co + o;
            out[dst] = self.kernel[src];
          }
        }
      }
    }
    out
  }

  fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
    let mut blocks: Vec<&[f32]> = Vec::new();
    if let Some(bn) = &self.batch_norm {
      blocks.extend([&bn.beta[..], &bn.gamma[..], &bn.mean[..], &bn.variance[..]]);
    }
    if let Some(bias) = &self.bias {
      blocks.push(bias);
    }
    blocks.push(&self.kernel);

    for block in blocks {
      for v in block {
        writer.write_all(&v.to_le_bytes())?;
      }
    }
    Ok(())
  }
}

/// 顺序读取 f32 的游标
struct FloatCursor<'a> {
  bytes: &'a [u8],
  offset: usize,
}

impl FloatCursor<'_> {
  fn available(&self) -> usize {
    (self.bytes.len() - self.offset) / FLOAT_BYTES
  }

  fn take(&mut self, count: usize) -> Box<[f32]> {
    let end = self.offset + count * FLOAT_BYTES;
    let values = self.bytes[self.offset..end]
      .chunks_exact(FLOAT_BYTES)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect();
    self.offset = end;
    values
  }
}

/// 完整读入的权重文件，层顺序与清单一致
#[derive(Debug, Clone, PartialEq)]
pub struct WeightFile {
  pub header: WeightHeader,
  pub layers: Vec<ConvWeights>,
}

impl WeightFile {
  /// 一次性读取并解析，任何错误都不会返回部分结果
  pub fn read_from<R: Read>(mut reader: R, manifest: &LayerManifest) -> Result<Self, WeightFormatError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Self::parse(&bytes, manifest)
  }

  pub fn load(path: impl AsRef<Path>, manifest: &LayerManifest) -> Result<Self, WeightFormatError> {
    let path = path.as_ref();
    info!("加载权重文件: {}", path.display());
    let file = std::fs::File::open(path)?;
    Self::read_from(std::io::BufReader::new(file), manifest)
  }

  pub fn parse(bytes: &[u8], manifest: &LayerManifest) -> Result<Self, WeightFormatError> {
    let header = WeightHeader::parse(bytes)?;
    debug!(
      "权重版本 {}.{}.{}, 已训练图像数 {}",
      header.major, header.minor, header.revision, header.seen
    );

    let mut cursor = FloatCursor {
      bytes,
      offset: header.byte_len(),
    };
    let mut layers = Vec::with_capacity(manifest.len());

    for (layer, spec) in manifest.layers().iter().enumerate() {
      let expected = spec.expected_floats();
      let available = cursor.available();
      if available < expected {
        error!("第 {} 层权重不足: 需要 {}, 剩余 {}", layer, expected, available);
        return Err(WeightFormatError::Truncated {
          layer,
          expected,
          available,
        });
      }

      let out = spec.out_channels;
      let (batch_norm, bias) = if spec.batch_norm {
        let beta = cursor.take(out);
        let gamma = cursor.take(out);
        let mean = cursor.take(out);
        let variance = cursor.take(out);
        (
          Some(BatchNorm {
            beta,
            gamma,
            mean,
            variance,
          }),
          None,
        )
      } else {
        (None, Some(cursor.take(out)))
      };
      let kernel = cursor.take(spec.kernel_len());

      debug!(
        "第 {} 层: {} -> {}, {}x{}, BN: {}",
        layer, spec.in_channels, spec.out_channels, spec.kernel, spec.kernel, spec.batch_norm
      );
      layers.push(ConvWeights {
        spec: *spec,
        batch_norm,
        bias,
        kernel,
      });
    }

    let trailing = bytes.len() - cursor.offset;
    if trailing != 0 {
      error!("权重文件末尾多出 {} 字节", trailing);
      return Err(WeightFormatError::TrailingBytes(trailing));
    }

    info!("权重读取完成: {} 层, {} 个参数", layers.len(), manifest.expected_floats());
    Ok(WeightFile { header, layers })
  }

  /// 以 darknet 格式写出
  pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
    self.header.write_to(&mut writer)?;
    for layer in &self.layers {
      layer.write_to(&mut writer)?;
    }
    writer.flush()
  }

  pub fn total_floats(&self) -> usize {
    self.layers.iter().map(|l| l.spec.expected_floats()).sum()
  }
}

/// 通过 `darknet:///path/to/yolov4.weights?tiny&classes=80` 指定权重文件
#[derive(Debug, Clone)]
pub struct DarknetWeightsBuilder {
  path: PathBuf,
  topology: Topology,
  num_classes: usize,
}

impl FromUrlWithScheme for DarknetWeightsBuilder {
  const SCHEME: &'static str = "darknet";
}

impl FromUrl for DarknetWeightsBuilder {
  type Error = WeightFormatError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(WeightFormatError::SchemeMismatch);
    }

    let mut builder = DarknetWeightsBuilder::new(url.path());
    for (k, v) in url.query_pairs() {
      match &*k {
        "tiny" => builder = builder.topology(Topology::Tiny),
        "classes" => {
          let classes = v
            .parse()
            .map_err(|_| WeightFormatError::InvalidQuery(format!("classes={}", v)))?;
          builder = builder.num_classes(classes);
        }
        _ => return Err(WeightFormatError::InvalidQuery(k.into_owned())),
      }
    }
    if let Err(e) = builder.manifest() {
      error!("{}", e);
      return Err(WeightFormatError::InvalidQuery(format!(
        "classes={}",
        builder.num_classes
      )));
    }
    Ok(builder)
  }
}

impl DarknetWeightsBuilder {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      topology: Topology::Standard,
      num_classes: DEFAULT_NUM_CLASSES,
    }
  }

  pub fn topology(mut self, topology: Topology) -> Self {
    self.topology = topology;
    self
  }

  pub fn num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 类别数为 0 或参数总量超出可寻址范围时报错
  pub fn manifest(&self) -> Result<LayerManifest, WeightFormatError> {
    LayerManifest::checked(self.topology, self.num_classes)
      .ok_or(WeightFormatError::InvalidClasses(self.num_classes))
  }

  pub fn build(&self) -> Result<WeightFile, WeightFormatError> {
    WeightFile::load(&self.path, &self.manifest()?)
  }
}
