// 该文件是 Renlian （人脸） 项目的一部分。
// src/service.rs - 人脸检测服务
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
  sync::{Mutex, PoisonError},
  time::Instant,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::{
  backend::ExecutionBackend,
  frame::EncodedFrame,
  model::{BoundingBox, DetectResult, DetectionParams, DetectorError, FaceDetector, Model, Point},
};

#[derive(Error, Debug)]
pub enum ServiceError {
  #[error("图像解码错误: {0}")]
  Decode(#[from] image::ImageError),
  #[error("检测错误: {0}")]
  Detect(#[from] DetectorError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceDetectionRequest {
  /// 编码后的图像字节
  pub image: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
  pub point: Vec<Point>,
}

/// 三个等长数组，第 i 项属于同一张人脸，坐标归一化到整图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceDetectionResponse {
  pub bbox: Vec<BBox>,
  pub score: Vec<f32>,
  pub landmark: Vec<Landmark>,
}

impl FaceDetectionResponse {
  pub fn len(&self) -> usize {
    self.bbox.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bbox.is_empty()
  }
}

impl From<BoundingBox> for BBox {
  fn from(bbox: BoundingBox) -> Self {
    Self {
      x: bbox.x,
      y: bbox.y,
      width: bbox.width,
      height: bbox.height,
    }
  }
}

impl From<&DetectResult> for FaceDetectionResponse {
  fn from(result: &DetectResult) -> Self {
    Self {
      bbox: result.items.iter().map(|d| d.bbox.into()).collect(),
      score: result.items.iter().map(|d| d.score).collect(),
      landmark: result
        .items
        .iter()
        .map(|d| Landmark {
          point: d.landmarks.to_vec(),
        })
        .collect(),
    }
  }
}

/// 请求处理器，检测器在请求之间串行使用
pub struct FaceDetectionService<B: ExecutionBackend> {
  detector: Mutex<FaceDetector<B>>,
  params: DetectionParams,
}

impl<B: ExecutionBackend> FaceDetectionService<B> {
  /// 使用服务端参数（滑窗，NMS 0.1，分数 0.9）
  pub fn new(detector: FaceDetector<B>) -> Self {
    Self::with_params(detector, DetectionParams::service())
  }

  pub fn with_params(detector: FaceDetector<B>, params: DetectionParams) -> Self {
    Self {
      detector: Mutex::new(detector),
      params,
    }
  }

  pub fn params(&self) -> &DetectionParams {
    &self.params
  }

  pub fn serve(&self, request: &FaceDetectionRequest) -> Result<FaceDetectionResponse, ServiceError> {
    self.serve_bytes(&request.image)
  }

  fn serve_bytes(&self, bytes: &[u8]) -> Result<FaceDetectionResponse, ServiceError> {
    let start = Instant::now();
    let image = image::load_from_memory(bytes)
      .inspect_err(|e| error!("请求图像无法解码: {}", e))?
      .to_rgb8();

    let result = {
      let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
      detector.detect(&image, &self.params)?
    };

    info!(
      "推理耗时 {:.3} ms，检测到 {} 张人脸",
      start.elapsed().as_secs_f64() * 1000.0,
      result.len()
    );
    Ok(FaceDetectionResponse::from(&result))
  }
}

impl<B: ExecutionBackend> Model for FaceDetectionService<B> {
  type Input = EncodedFrame;
  type Output = FaceDetectionResponse;
  type Error = ServiceError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.serve_bytes(input.data())
  }
}
