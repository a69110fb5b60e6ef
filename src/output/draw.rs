// 该文件是 Renlian （人脸） 项目的一部分。
// src/output/draw.rs - 人脸检测结果可视化
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

use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut},
  rect::Rect,
};

use crate::service::FaceDetectionResponse;

const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const LANDMARK_COLOR: [u8; 3] = [255, 0, 0]; // 红色
const LANDMARK_RADIUS: i32 = 3;
const SCORE_BAR_HEIGHT: u32 = 8;

pub struct Draw {
  box_color: [u8; 3],
  landmark_color: [u8; 3],
  landmark_radius: i32,
  score_bar_height: u32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      box_color: BOX_COLOR,
      landmark_color: LANDMARK_COLOR,
      landmark_radius: LANDMARK_RADIUS,
      score_bar_height: SCORE_BAR_HEIGHT,
    }
  }
}

impl Draw {
  /// 框为归一化坐标 (x, y, width, height)，上方画一条分数标签底条
  fn draw_face(&self, image: &mut RgbImage, x: f32, y: f32, width: f32, height: f32) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let left = (x * w) as i32;
    let top = (y * h) as i32;
    let box_w = (width * w) as u32;
    let box_h = (height * h) as u32;

    if box_w == 0 || box_h == 0 {
      return;
    }

    draw_hollow_rect_mut(
      image,
      Rect::at(left, top).of_size(box_w, box_h),
      Rgb(self.box_color),
    );
    draw_filled_rect_mut(
      image,
      Rect::at(left, top - self.score_bar_height as i32).of_size(box_w, self.score_bar_height),
      Rgb(self.box_color),
    );
  }

  pub fn draw_faces_on_image(&self, image: &mut RgbImage, response: &FaceDetectionResponse) {
    let (w, h) = (image.width() as f32, image.height() as f32);

    for bbox in &response.bbox {
      self.draw_face(image, bbox.x, bbox.y, bbox.width, bbox.height);
    }

    for landmark in &response.landmark {
      for point in &landmark.point {
        draw_filled_circle_mut(
          image,
          ((point.x * w) as i32, (point.y * h) as i32),
          self.landmark_radius,
          Rgb(self.landmark_color),
        );
      }
    }
  }

  pub fn draw_faces(&self, image: &RgbImage, response: &FaceDetectionResponse) -> RgbImage {
    let mut image = image.clone();
    self.draw_faces_on_image(&mut image, response);
    image
  }
}

/// 把检测结果以 JSON 形式保存在图像旁边
pub struct Record {
  pub pretty: bool,
}

impl Record {
  pub fn record(
    &self,
    response: &FaceDetectionResponse,
    path: &Path,
  ) -> Result<(), std::io::Error> {
    let data = if self.pretty {
      serde_json::to_vec_pretty(response)?
    } else {
      serde_json::to_vec(response)?
    };
    std::fs::write(path.with_extension("json"), data)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::Point,
    service::{BBox, Landmark},
  };

  fn response() -> FaceDetectionResponse {
    FaceDetectionResponse {
      bbox: vec![BBox {
        x: 0.2,
        y: 0.3,
        width: 0.5,
        height: 0.5,
      }],
      score: vec![0.97],
      landmark: vec![Landmark {
        point: vec![Point { x: 0.5, y: 0.6 }],
      }],
    }
  }

  #[test]
  fn draws_box_and_landmarks() {
    let image = RgbImage::new(100, 100);
    let drawn = Draw::default().draw_faces(&image, &response());

    // 左边框
    assert_eq!(drawn.get_pixel(20, 50), &Rgb(BOX_COLOR));
    // 分数底条
    assert_eq!(drawn.get_pixel(40, 25), &Rgb(BOX_COLOR));
    // 关键点
    assert_eq!(drawn.get_pixel(50, 60), &Rgb(LANDMARK_COLOR));
    assert_eq!(drawn.get_pixel(52, 60), &Rgb(LANDMARK_COLOR));
    // 框内部保持原样
    assert_eq!(drawn.get_pixel(35, 45), &Rgb([0, 0, 0]));
  }

  #[test]
  fn record_writes_json_next_to_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    Record { pretty: false }.record(&response(), &path).unwrap();

    let json = std::fs::read_to_string(dir.path().join("frame.json")).unwrap();
    let back: FaceDetectionResponse = serde_json::from_str(&json).unwrap();
    assert_eq!(back, response());
  }
}
