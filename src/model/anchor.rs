// 该文件是 Renlian （人脸） 项目的一部分。
// src/model/anchor.rs - 先验框表
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

use tracing::debug;

const RETINAFACE_INPUT_W: usize = 640;
const RETINAFACE_INPUT_H: usize = 640;
const RETINAFACE_STRIDES: [usize; 3] = [8, 16, 32];
const RETINAFACE_MIN_SIZES: [[usize; 2]; 3] = [[16, 32], [64, 128], [256, 512]];

/// 先验框几何参数，必须与编译模型一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorGeometry {
  pub width: usize,
  pub height: usize,
  pub strides: [usize; 3],
  pub min_sizes: [[usize; 2]; 3],
}

impl Default for AnchorGeometry {
  fn default() -> Self {
    Self {
      width: RETINAFACE_INPUT_W,
      height: RETINAFACE_INPUT_H,
      strides: RETINAFACE_STRIDES,
      min_sizes: RETINAFACE_MIN_SIZES,
    }
  }
}

impl AnchorGeometry {
  /// 每个特征层 2 * ceil(H/s) * ceil(W/s) 个先验框之和
  pub fn anchor_count(&self) -> usize {
    self
      .strides
      .iter()
      .zip(self.min_sizes.iter())
      .map(|(&stride, sizes)| {
        sizes.len() * self.height.div_ceil(stride) * self.width.div_ceil(stride)
      })
      .sum()
  }
}

/// 归一化到模型输入分辨率的先验框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
  pub center_x: f32,
  pub center_y: f32,
  pub base_width: f32,
  pub base_height: f32,
}

/// 按特征层、行、列、尺寸顺序排列的先验框序列，
/// 顺序与模型输出行一一对应
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorTable {
  anchors: Box<[Anchor]>,
}

impl AnchorTable {
  pub fn generate(geometry: &AnchorGeometry) -> Self {
    let width = geometry.width as f64;
    let height = geometry.height as f64;
    let mut anchors = Vec::with_capacity(geometry.anchor_count());

    for (&stride, sizes) in geometry.strides.iter().zip(geometry.min_sizes.iter()) {
      let rows = geometry.height.div_ceil(stride);
      let cols = geometry.width.div_ceil(stride);
      let step = stride as f64;
      for i in 0..rows {
        for j in 0..cols {
          for &size in sizes {
            anchors.push(Anchor {
              center_x: ((j as f64 + 0.5) * step / width) as f32,
              center_y: ((i as f64 + 0.5) * step / height) as f32,
              base_width: (size as f64 / width) as f32,
              base_height: (size as f64 / height) as f32,
            });
          }
        }
      }
    }

    debug!("生成先验框 {} 个", anchors.len());
    Self {
      anchors: anchors.into_boxed_slice(),
    }
  }

  pub fn len(&self) -> usize {
    self.anchors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.anchors.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&Anchor> {
    self.anchors.get(index)
  }

  pub fn as_slice(&self) -> &[Anchor] {
    &self.anchors
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_geometry_has_16800_anchors() {
    let geometry = AnchorGeometry::default();
    assert_eq!(geometry.anchor_count(), 16800);
    assert_eq!(AnchorTable::generate(&geometry).len(), 16800);
  }

  #[test]
  fn generation_is_deterministic() {
    let geometry = AnchorGeometry::default();
    let a = AnchorTable::generate(&geometry);
    let b = AnchorTable::generate(&geometry);
    let bits = |t: &AnchorTable| -> Vec<u32> {
      t.as_slice()
        .iter()
        .flat_map(|a| [a.center_x, a.center_y, a.base_width, a.base_height])
        .map(f32::to_bits)
        .collect()
    };
    assert_eq!(bits(&a), bits(&b));
  }

  fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-7
  }

  #[test]
  fn scan_order_is_row_column_size() {
    let table = AnchorTable::generate(&AnchorGeometry::default());
    let first = table.get(0).unwrap();
    assert!(close(first.center_x, 4.0 / 640.0));
    assert!(close(first.center_y, 4.0 / 640.0));
    assert!(close(first.base_width, 16.0 / 640.0));

    // 同一格子的第二个尺寸
    let second = table.get(1).unwrap();
    assert_eq!(second.center_x, first.center_x);
    assert!(close(second.base_width, 32.0 / 640.0));

    // 下一列
    let third = table.get(2).unwrap();
    assert!(close(third.center_x, 12.0 / 640.0));
    assert_eq!(third.center_y, first.center_y);

    // 第二个特征层从 2 * 80 * 80 开始
    let coarse = table.get(12800).unwrap();
    assert!(close(coarse.center_x, 8.0 / 640.0));
    assert!(close(coarse.base_width, 64.0 / 640.0));
  }

  #[test]
  fn non_divisible_resolution_rounds_up() {
    let geometry = AnchorGeometry {
      width: 100,
      height: 60,
      ..AnchorGeometry::default()
    };
    // ceil(60/8)*ceil(100/8) + ceil(60/16)*ceil(100/16) + ceil(60/32)*ceil(100/32)
    let expected = 2 * (8 * 13 + 4 * 7 + 2 * 4);
    assert_eq!(geometry.anchor_count(), expected);
    assert_eq!(AnchorTable::generate(&geometry).len(), expected);
  }
}
