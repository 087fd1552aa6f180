// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/weights_import.rs - darknet 权重导入测试
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

use std::io::Cursor;

use shanan_yolov4::{
  FromUrl, Topology,
  weights::{DarknetWeightsBuilder, LayerManifest, WeightFile, WeightFormatError},
};
use url::Url;

/// 文件头 0.2.5、seen = 1000，之后第 k 个浮点数的值为 k
fn synthesize(manifest: &LayerManifest) -> Vec<u8> {
  let mut bytes = Vec::new();
  for v in [0i32, 2, 5] {
    bytes.extend_from_slice(&v.to_le_bytes());
  }
  bytes.extend_from_slice(&1000u64.to_le_bytes());
  for k in 0..manifest.expected_floats() {
    bytes.extend_from_slice(&(k as f32).to_le_bytes());
  }
  bytes
}

#[test]
fn tiny_layers_are_read_in_order() {
  let manifest = LayerManifest::yolov4_tiny(1);
  let bytes = synthesize(&manifest);
  let file = WeightFile::read_from(Cursor::new(&bytes), &manifest).unwrap();

  assert_eq!(file.header.seen, 1000);
  assert_eq!(file.layers.len(), 21);

  // 第 0 层: 3 -> 32, 3x3, BN
  let first = &file.layers[0];
  let bn = first.batch_norm.as_ref().unwrap();
  assert_eq!(bn.beta[0], 0.0);
  assert_eq!(bn.gamma[0], 32.0);
  assert_eq!(bn.mean[0], 64.0);
  assert_eq!(bn.variance[31], 127.0);
  assert!(first.bias.is_none());
  assert_eq!(first.kernel.len(), 32 * 3 * 9);
  assert_eq!(first.kernel[0], 128.0);

  // 第 1 层紧接第 0 层
  let second = &file.layers[1];
  assert_eq!(
    second.batch_norm.as_ref().unwrap().beta[0],
    (4 * 32 + 32 * 3 * 9) as f32
  );

  // 检测头输出层只有偏置
  let head = &file.layers[17];
  assert!(head.batch_norm.is_none());
  assert_eq!(head.bias.as_ref().unwrap().len(), 18);
  assert_eq!(head.kernel.len(), 18 * 512);

  let last = file.layers.last().unwrap();
  assert_eq!(
    *last.kernel.last().unwrap(),
    (manifest.expected_floats() - 1) as f32
  );
  assert_eq!(file.total_floats(), manifest.expected_floats());
}

#[test]
fn import_is_deterministic() {
  let manifest = LayerManifest::yolov4_tiny(1);
  let bytes = synthesize(&manifest);
  let a = WeightFile::read_from(Cursor::new(&bytes), &manifest).unwrap();
  let b = WeightFile::read_from(Cursor::new(&bytes), &manifest).unwrap();
  assert_eq!(a, b);

  let mut written = Vec::new();
  a.write_to(&mut written).unwrap();
  assert_eq!(written, bytes);
}

#[test]
fn truncated_file_is_rejected() {
  let manifest = LayerManifest::yolov4_tiny(1);
  let mut bytes = synthesize(&manifest);
  bytes.truncate(bytes.len() - 4);

  let err = WeightFile::read_from(Cursor::new(&bytes), &manifest).unwrap_err();
  let expected = manifest.layers()[20].expected_floats();
  match err {
    WeightFormatError::Truncated {
      layer,
      expected: e,
      available,
    } => {
      assert_eq!(layer, 20);
      assert_eq!(e, expected);
      assert_eq!(available, expected - 1);
    }
    other => panic!("意外的错误: {:?}", other),
  }

  // 只剩半个文件头
  assert!(matches!(
    WeightFile::read_from(Cursor::new(&bytes[..10]), &manifest),
    Err(WeightFormatError::Header { .. })
  ));
}

#[test]
fn trailing_bytes_are_rejected() {
  let manifest = LayerManifest::yolov4_tiny(1);
  let mut bytes = synthesize(&manifest);
  bytes.extend_from_slice(&[0u8; 6]);
  assert!(matches!(
    WeightFile::read_from(Cursor::new(&bytes), &manifest),
    Err(WeightFormatError::TrailingBytes(6))
  ));

  // 类别数不同，层形状也不同
  let other = LayerManifest::yolov4_tiny(2);
  let bytes = synthesize(&manifest);
  assert!(WeightFile::read_from(Cursor::new(&bytes), &other).is_err());
}

#[test]
fn load_from_url() {
  let manifest = LayerManifest::for_topology(Topology::Tiny, 3);
  let path = std::env::temp_dir().join(format!("shanan-yolov4-{}.weights", std::process::id()));
  std::fs::write(&path, synthesize(&manifest)).unwrap();

  let url = Url::parse(&format!("darknet://{}?tiny&classes=3", path.display())).unwrap();
  let builder = DarknetWeightsBuilder::from_url(&url).unwrap();
  let file = builder.build();
  std::fs::remove_file(&path).unwrap();

  let file = file.unwrap();
  assert_eq!(file.layers.len(), manifest.len());
  assert_eq!(file.layers[20].spec.out_channels, 24);

  assert!(matches!(
    WeightFile::load(&path, &manifest),
    Err(WeightFormatError::IoError(_))
  ));
}
