// 该文件是 Renlian （人脸） 项目的一部分。
// src/model/tile.rs - 滑窗切片规划
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

use crate::model::{Detection, Point};

/// 源图像像素坐标下的裁剪区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
  pub rect: CropRect,
  /// 滑窗的 (行, 列)；整图切片为 None
  pub grid: Option<(usize, usize)>,
}

/// 一次推理调用的切片集合：`rows * cols` 个重叠滑窗，最后是整图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
  rows: usize,
  cols: usize,
  tiles: Vec<Tile>,
}

impl TilePlan {
  /// 只有整图一个切片
  pub fn single(image_width: u32, image_height: u32) -> Self {
    Self {
      rows: 0,
      cols: 0,
      tiles: vec![Tile {
        rect: CropRect {
          x: 0,
          y: 0,
          width: image_width,
          height: image_height,
        },
        grid: None,
      }],
    }
  }

  /// 以模型输入一半为步长的重叠滑窗，外加整图
  pub fn sliding(image_width: u32, image_height: u32, input_width: u32, input_height: u32) -> Self {
    let half_w = input_width.div_ceil(2).max(1) as u64;
    let half_h = input_height.div_ceil(2).max(1) as u64;
    let img_w = image_width as u64;
    let img_h = image_height as u64;

    let rows = (img_h.max(half_h * 2).div_ceil(half_h) - 1) as usize;
    let cols = (img_w.max(half_w * 2).div_ceil(half_w) - 1) as usize;

    let mut tiles = Vec::with_capacity(rows * cols + 1);
    let (r1, c1) = (rows as u64 + 1, cols as u64 + 1);
    for i in 0..rows {
      for j in 0..cols {
        tiles.push(Tile {
          rect: CropRect {
            x: (j as u64 * img_w / c1) as u32,
            y: (i as u64 * img_h / r1) as u32,
            width: (2 * img_w / c1) as u32,
            height: (2 * img_h / r1) as u32,
          },
          grid: Some((i, j)),
        });
      }
    }
    tiles.extend(Self::single(image_width, image_height).tiles);

    debug!(
      "图像 {}x{} 切分为 {}x{} 个滑窗",
      image_width, image_height, rows, cols
    );
    Self { rows, cols, tiles }
  }

  pub fn plan(
    slide: bool,
    image_width: u32,
    image_height: u32,
    input_width: u32,
    input_height: u32,
  ) -> Self {
    if slide {
      Self::sliding(image_width, image_height, input_width, input_height)
    } else {
      Self::single(image_width, image_height)
    }
  }

  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn tiles(&self) -> &[Tile] {
    &self.tiles
  }

  pub fn len(&self) -> usize {
    self.tiles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tiles.is_empty()
  }

  /// 把切片局部归一化坐标映射回整图归一化坐标，整图切片保持不变
  pub fn remap(&self, tile: &Tile, detection: &mut Detection) {
    let Some((row, col)) = tile.grid else {
      return;
    };
    let scale_x = 2.0 / (self.cols as f64 + 1.0);
    let scale_y = 2.0 / (self.rows as f64 + 1.0);
    let offset_x = col as f64 / (self.cols as f64 + 1.0);
    let offset_y = row as f64 / (self.rows as f64 + 1.0);

    let map_x = |x: f32| (x as f64 * scale_x + offset_x) as f32;
    let map_y = |y: f32| (y as f64 * scale_y + offset_y) as f32;

    let bbox = &mut detection.bbox;
    bbox.x = map_x(bbox.x);
    bbox.y = map_y(bbox.y);
    bbox.width = (bbox.width as f64 * scale_x) as f32;
    bbox.height = (bbox.height as f64 * scale_y) as f32;

    for point in detection.landmarks.iter_mut() {
      *point = Point {
        x: map_x(point.x),
        y: map_y(point.y),
      };
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;

  fn detection_at(x: f32, y: f32) -> Detection {
    Detection {
      bbox: BoundingBox {
        x: x - 0.1,
        y: y - 0.1,
        width: 0.2,
        height: 0.2,
      },
      score: 0.9,
      landmarks: [Point { x, y }; 5],
    }
  }

  #[test]
  fn no_slide_gives_whole_image() {
    let plan = TilePlan::plan(false, 1280, 960, 640, 640);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.tiles()[0].grid, None);
    assert_eq!(
      plan.tiles()[0].rect,
      CropRect {
        x: 0,
        y: 0,
        width: 1280,
        height: 960
      }
    );
  }

  #[test]
  fn sliding_tile_count() {
    // rows = ceil(960/320)-1 = 2, cols = ceil(1280/320)-1 = 3
    let plan = TilePlan::sliding(1280, 960, 640, 640);
    assert_eq!((plan.rows(), plan.cols()), (2, 3));
    assert_eq!(plan.len(), 7);
    assert_eq!(plan.tiles()[6].grid, None);
    assert_eq!(plan.tiles()[4].grid, Some((1, 1)));
    assert_eq!(
      plan.tiles()[4].rect,
      CropRect {
        x: 320,
        y: 320,
        width: 640,
        height: 640
      }
    );
  }

  #[test]
  fn small_image_still_has_tiles() {
    let plan = TilePlan::sliding(100, 80, 640, 640);
    assert_eq!((plan.rows(), plan.cols()), (1, 1));
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.tiles()[0].rect.width, 100);
    assert_eq!(plan.tiles()[0].rect.height, 80);
  }

  #[test]
  fn whole_image_tile_is_identity() {
    let plan = TilePlan::sliding(1280, 960, 640, 640);
    let whole = plan.tiles()[plan.len() - 1];
    let mut det = detection_at(0.3, 0.7);
    let before = det.clone();
    plan.remap(&whole, &mut det);
    assert_eq!(det, before);
  }

  #[test]
  fn tile_center_maps_to_crop_center() {
    let (img_w, img_h) = (1280u32, 960u32);
    let plan = TilePlan::sliding(img_w, img_h, 640, 640);
    for tile in &plan.tiles()[..plan.len() - 1] {
      let mut det = detection_at(0.5, 0.5);
      plan.remap(tile, &mut det);
      let rect = tile.rect;
      let expected_x = (rect.x as f32 + rect.width as f32 / 2.0) / img_w as f32;
      let expected_y = (rect.y as f32 + rect.height as f32 / 2.0) / img_h as f32;
      let center = det.bbox.center();
      assert!((center.x - expected_x).abs() < 1e-5);
      assert!((center.y - expected_y).abs() < 1e-5);
      assert!((det.landmarks[0].x - expected_x).abs() < 1e-5);
      assert!((det.landmarks[0].y - expected_y).abs() < 1e-5);
    }
  }

  #[test]
  fn remap_scales_size() {
    let plan = TilePlan::sliding(1280, 960, 640, 640);
    let mut det = detection_at(0.5, 0.5);
    plan.remap(&plan.tiles()[0], &mut det);
    assert!((det.bbox.width - 0.2 * 2.0 / 4.0).abs() < 1e-6);
    assert!((det.bbox.height - 0.2 * 2.0 / 3.0).abs() < 1e-6);
  }
}
