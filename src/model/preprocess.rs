// 该文件是 Renlian （人脸） 项目的一部分。
// src/model/preprocess.rs - 输入预处理
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

use std::borrow::Cow;

use image::{RgbImage, imageops::FilterType};

use crate::{
  executor::{ExecutorError, HostTensor},
  model::TilePlan,
};

/// 按 B、G、R 通道顺序减去的均值
pub const MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];

/// 把每个切片缩放到模型输入大小，转换为 [N, 3, H, W] 的 BGR 平面数据
pub fn blob_from_tiles(
  image: &RgbImage,
  plan: &TilePlan,
  input_width: u32,
  input_height: u32,
) -> Result<HostTensor, ExecutorError> {
  let plane = (input_width * input_height) as usize;
  let mut data = Vec::with_capacity(plan.len() * 3 * plane);

  for tile in plan.tiles() {
    let rect = tile.rect;
    let whole = rect.x == 0
      && rect.y == 0
      && rect.width == image.width()
      && rect.height == image.height();
    let source = if whole {
      Cow::Borrowed(image)
    } else {
      Cow::Owned(
        image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image(),
      )
    };

    let resized = if source.dimensions() == (input_width, input_height) {
      source
    } else {
      Cow::Owned(image::imageops::resize(
        &*source,
        input_width,
        input_height,
        FilterType::Triangle,
      ))
    };

    // RGB 像素，通道 2 是 B
    for (channel, mean) in [2usize, 1, 0].into_iter().zip(MEAN_BGR) {
      data.extend(resized.pixels().map(|p| p.0[channel] as f32 - mean));
    }
  }

  HostTensor::from_f32(
    &[plan.len(), 3, input_height as usize, input_width as usize],
    &data,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn planes_are_bgr_minus_mean() {
    let image = RgbImage::from_pixel(4, 4, Rgb([200, 150, 100]));
    let plan = TilePlan::single(4, 4);
    let blob = blob_from_tiles(&image, &plan, 4, 4).unwrap();
    assert_eq!(blob.shape(), &[1, 3, 4, 4]);
    let values = blob.to_f32().unwrap();
    assert_eq!(values[0], 100.0 - 104.0);
    assert_eq!(values[16], 150.0 - 117.0);
    assert_eq!(values[32], 200.0 - 123.0);
  }

  #[test]
  fn every_tile_becomes_one_row() {
    let image = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
    let plan = TilePlan::sliding(64, 48, 32, 32);
    let blob = blob_from_tiles(&image, &plan, 32, 32).unwrap();
    assert_eq!(blob.batch(), plan.len());
    assert_eq!(blob.shape()[1..], [3, 32, 32]);
    // 纯色图像缩放后保持不变
    let row = blob.row_f32(plan.len() - 1).unwrap();
    assert!(row[..1024].iter().all(|v| (*v - (30.0 - 104.0)).abs() < 1e-4));
  }

  #[test]
  fn tiles_already_at_input_size_are_copied_exactly() {
    let image = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 7]));
    // 半窗 2，3x3 个 4x4 滑窗，最后一个是整图
    let plan = TilePlan::sliding(8, 8, 4, 4);
    let blob = blob_from_tiles(&image, &plan, 4, 4).unwrap();

    let tile = plan.tiles()[4].rect;
    assert_eq!((tile.x, tile.y, tile.width, tile.height), (2, 2, 4, 4));
    let row = blob.row_f32(4).unwrap();
    for y in 0..4u32 {
      for x in 0..4u32 {
        let i = (y * 4 + x) as usize;
        let pixel = image.get_pixel(tile.x + x, tile.y + y).0;
        assert_eq!(row[i], pixel[2] as f32 - 104.0);
        assert_eq!(row[16 + i], pixel[1] as f32 - 117.0);
        assert_eq!(row[32 + i], pixel[0] as f32 - 123.0);
      }
    }

    let whole = RgbImage::from_fn(4, 4, |x, y| Rgb([x as u8, y as u8, 200]));
    let blob = blob_from_tiles(&whole, &TilePlan::single(4, 4), 4, 4).unwrap();
    let row = blob.row_f32(0).unwrap();
    assert_eq!(row[5], 200.0 - 104.0);
    assert_eq!(row[16 + 6], 1.0 - 117.0);
    assert_eq!(row[32 + 7], 3.0 - 123.0);
  }
}
