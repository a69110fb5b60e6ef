// 该文件是 Renlian （人脸） 项目的一部分。
// src/model.rs - 模型
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

use serde::{Deserialize, Serialize};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 归一化坐标下的矩形框，(x, y) 为左上角
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  pub fn area(&self) -> f32 {
    self.width.max(0.0) * self.height.max(0.0)
  }

  pub fn center(&self) -> Point {
    Point {
      x: self.x + self.width / 2.0,
      y: self.y + self.height / 2.0,
    }
  }

  pub fn iou(&self, other: &Self) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = (self.x + self.width).min(other.x + other.width);
    let y2 = (self.y + self.height).min(other.y + other.height);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
  pub x: f32,
  pub y: f32,
}

/// 一个人脸检测结果：框、置信度和五个关键点（双眼、鼻尖、两侧嘴角）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub bbox: BoundingBox,
  pub score: f32,
  pub landmarks: [Point; 5],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

/// 每次调用可调的检测参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
  /// 滑窗切片以保留原始分辨率
  pub slide: bool,
  pub nms_threshold: f32,
  pub score_threshold: f32,
  /// 每个切片在 NMS 之前保留的候选数
  pub keep_before_nms: usize,
  /// NMS 之后保留的最大数量，0 表示不限
  pub top_k: usize,
}

impl Default for DetectionParams {
  fn default() -> Self {
    Self {
      slide: false,
      nms_threshold: 0.5,
      score_threshold: 0.5,
      keep_before_nms: 1000,
      top_k: 100,
    }
  }
}

impl DetectionParams {
  /// 服务端使用的参数：开启滑窗，严格的阈值
  pub fn service() -> Self {
    Self {
      slide: true,
      nms_threshold: 0.1,
      score_threshold: 0.9,
      ..Self::default()
    }
  }
}

mod anchor;
mod decode;
mod preprocess;
mod retinaface;
mod suppress;
mod tile;

pub use self::anchor::{Anchor, AnchorGeometry, AnchorTable};
pub use self::decode::{FaceDecoder, RawTile, VARIANCES, decode_bbox, decode_landmarks};
pub use self::preprocess::{MEAN_BGR, blob_from_tiles};
pub use self::retinaface::{DetectorError, FaceDetector, RetinaFaceBuilder, TensorNames};
pub use self::suppress::{nms, rank_scores};
pub use self::tile::{CropRect, Tile, TilePlan};
