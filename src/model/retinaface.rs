// 该文件是 Renlian （人脸） 项目的一部分。
// src/model/retinaface.rs - RetinaFace 人脸检测模型
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

use std::collections::HashMap;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  backend::{BackendError, ExecutionBackend},
  device::DeviceAllocator,
  executor::{ExecutorError, HostTensor, TensorExecutor},
  model::{
    AnchorGeometry, BoundingBox, DetectResult, Detection, DetectionParams, FaceDecoder, RawTile,
    TilePlan, blob_from_tiles, nms,
  },
};

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("执行后端错误: {0}")]
  Backend(#[from] BackendError),
  #[error("执行器错误: {0}")]
  Executor(#[from] ExecutorError),
  #[error("模型缺少张量: {0}")]
  MissingTensor(String),
  #[error("输入张量 {name} 形状应为 {expected:?}, 实际为 {actual:?}")]
  InputShape {
    name: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("输出张量 {name} 有 {actual} 行，先验框有 {expected} 个")]
  AnchorMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
  #[error("输出张量 {name} 长度应为 {expected}, 实际为 {actual}")]
  OutputLength {
    name: String,
    expected: usize,
    actual: usize,
  },
  #[error("图像为空")]
  EmptyImage,
  #[error("图像解码错误: {0}")]
  Decode(#[from] image::ImageError),
}

/// 模型中输入输出张量的名称
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorNames {
  pub input: String,
  pub bbox: String,
  pub score: String,
  pub landmark: String,
}

impl Default for TensorNames {
  fn default() -> Self {
    Self {
      input: "input".to_string(),
      bbox: "bbox".to_string(),
      score: "score".to_string(),
      landmark: "landmark".to_string(),
    }
  }
}

/// RetinaFace 人脸检测器
///
/// 组合执行器、先验框解码、滑窗切片和两级 NMS。执行器的设备缓冲区在调用间复用，
/// 因此 `detect` 需要 `&mut self`。
pub struct FaceDetector<B: ExecutionBackend> {
  executor: TensorExecutor<B>,
  decoder: FaceDecoder,
  names: TensorNames,
}

impl<B: ExecutionBackend> FaceDetector<B> {
  pub fn new(
    backend: B,
    allocator: Box<dyn DeviceAllocator>,
    compiled_batch: usize,
    names: TensorNames,
  ) -> Result<Self, DetectorError> {
    Self::with_geometry(
      backend,
      allocator,
      compiled_batch,
      names,
      AnchorGeometry::default(),
    )
  }

  pub fn with_geometry(
    backend: B,
    allocator: Box<dyn DeviceAllocator>,
    compiled_batch: usize,
    names: TensorNames,
    geometry: AnchorGeometry,
  ) -> Result<Self, DetectorError> {
    let executor = TensorExecutor::new(
      backend,
      allocator,
      compiled_batch,
      &[names.input.as_str()],
      &[
        names.bbox.as_str(),
        names.score.as_str(),
        names.landmark.as_str(),
      ],
    )?;

    let detector = Self {
      executor,
      decoder: FaceDecoder::new(geometry),
      names,
    };
    detector.validate()?;
    info!(
      "人脸检测器就绪，先验框 {} 个，编译批大小 {}",
      detector.decoder.anchors().len(),
      detector.executor.compiled_batch()
    );
    Ok(detector)
  }

  fn validate(&self) -> Result<(), DetectorError> {
    let geometry = self.decoder.geometry();
    let input = self
      .executor
      .input_desc(&self.names.input)
      .ok_or_else(|| DetectorError::MissingTensor(self.names.input.clone()))?;
    let expected = vec![3, geometry.height, geometry.width];
    if input.shape[..] != expected[..] {
      error!("输入张量形状 {:?} 与 {:?} 不一致", input.shape, expected);
      return Err(DetectorError::InputShape {
        name: self.names.input.clone(),
        expected,
        actual: input.shape.to_vec(),
      });
    }

    let anchors = geometry.anchor_count();
    for (name, columns) in [
      (&self.names.bbox, 4usize),
      (&self.names.score, 2),
      (&self.names.landmark, 10),
    ] {
      let desc = self
        .executor
        .output_desc(name)
        .ok_or_else(|| DetectorError::MissingTensor(name.clone()))?;
      let rows = desc.shape.first().copied().unwrap_or(0);
      if rows != anchors {
        error!("输出张量 {} 有 {} 行，先验框有 {} 个", name, rows, anchors);
        return Err(DetectorError::AnchorMismatch {
          name: name.clone(),
          expected: anchors,
          actual: rows,
        });
      }
      if desc.row_elements() != anchors * columns {
        return Err(DetectorError::OutputLength {
          name: name.clone(),
          expected: anchors * columns,
          actual: desc.row_elements(),
        });
      }
    }
    Ok(())
  }

  pub fn executor(&self) -> &TensorExecutor<B> {
    &self.executor
  }

  pub fn decoder(&self) -> &FaceDecoder {
    &self.decoder
  }

  pub fn names(&self) -> &TensorNames {
    &self.names
  }

  fn output(outputs: &HashMap<String, HostTensor>, name: &str) -> Result<Vec<f32>, DetectorError> {
    let tensor = outputs
      .get(name)
      .ok_or_else(|| DetectorError::MissingTensor(name.to_string()))?;
    Ok(tensor.to_f32()?)
  }

  /// 解码字节后检测
  pub fn detect_bytes(
    &mut self,
    bytes: &[u8],
    params: &DetectionParams,
  ) -> Result<DetectResult, DetectorError> {
    let image = image::load_from_memory(bytes)?.to_rgb8();
    self.detect(&image, params)
  }

  pub fn detect(
    &mut self,
    image: &RgbImage,
    params: &DetectionParams,
  ) -> Result<DetectResult, DetectorError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(DetectorError::EmptyImage);
    }

    let geometry = self.decoder.geometry();
    let (input_w, input_h) = (geometry.width as u32, geometry.height as u32);
    let plan = TilePlan::plan(params.slide, width, height, input_w, input_h);
    debug!("图像 {}x{}，切片 {} 个", width, height, plan.len());

    let blob = blob_from_tiles(image, &plan, input_w, input_h)?;
    let inputs = HashMap::from([(self.names.input.clone(), blob)]);

    debug!("执行模型推理");
    let outputs = self.executor.infer(&inputs)?;

    let bbox = Self::output(&outputs, &self.names.bbox)?;
    let score = Self::output(&outputs, &self.names.score)?;
    let landmark = Self::output(&outputs, &self.names.landmark)?;

    let tiles = plan.len();
    let (bbox_row, score_row, landmark_row) = (
      bbox.len() / tiles,
      score.len() / tiles,
      landmark.len() / tiles,
    );

    let mut candidates: Vec<Detection> = Vec::new();
    for (index, tile) in plan.tiles().iter().enumerate() {
      let raw = RawTile {
        bbox: &bbox[index * bbox_row..(index + 1) * bbox_row],
        score: &score[index * score_row..(index + 1) * score_row],
        landmark: &landmark[index * landmark_row..(index + 1) * landmark_row],
      };
      for mut detection in self.decoder.decode_tile(&raw, params)? {
        plan.remap(tile, &mut detection);
        candidates.push(detection);
      }
    }

    let boxes: Vec<BoundingBox> = candidates.iter().map(|d| d.bbox).collect();
    let scores: Vec<f32> = candidates.iter().map(|d| d.score).collect();
    let kept = nms(
      &boxes,
      &scores,
      params.score_threshold,
      params.nms_threshold,
      params.top_k,
    );
    debug!("全局候选 {} 个，保留 {} 个", candidates.len(), kept.len());

    let items: Box<[Detection]> = kept
      .into_iter()
      .map(|index| candidates[index].clone())
      .collect();
    Ok(DetectResult { items })
  }
}

const RETINAFACE_SCHEME: &str = "retinaface";

/// `retinaface:///path/model.onnx?batch=4&input=input&bbox=bbox&score=score&landmark=landmark`
#[derive(Debug, Clone)]
pub struct RetinaFaceBuilder {
  model_path: String,
  batch: usize,
  names: TensorNames,
}

impl FromUrlWithScheme for RetinaFaceBuilder {
  const SCHEME: &'static str = RETINAFACE_SCHEME;
}

impl FromUrl for RetinaFaceBuilder {
  type Error = DetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != RETINAFACE_SCHEME {
      return Err(DetectorError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        RETINAFACE_SCHEME
      )));
    }

    let mut builder = RetinaFaceBuilder {
      model_path: crate::url_path(url),
      batch: 1,
      names: TensorNames::default(),
    };

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "batch" => {
          builder.batch = value
            .parse()
            .map_err(|_| DetectorError::ModelPath(format!("无效的批大小: {}", value)))?;
        }
        "input" => builder.names.input = value.into_owned(),
        "bbox" => builder.names.bbox = value.into_owned(),
        "score" => builder.names.score = value.into_owned(),
        "landmark" => builder.names.landmark = value.into_owned(),
        other => debug!("忽略未知参数: {}", other),
      }
    }
    Ok(builder)
  }
}

impl RetinaFaceBuilder {
  pub fn batch(mut self, batch: usize) -> Self {
    self.batch = batch;
    self
  }

  pub fn names(mut self, names: TensorNames) -> Self {
    self.names = names;
    self
  }

  pub fn model_path(&self) -> &str {
    &self.model_path
  }

  pub fn compiled_batch(&self) -> usize {
    self.batch
  }

  pub fn tensor_names(&self) -> &TensorNames {
    &self.names
  }

  #[cfg(feature = "tract")]
  pub fn build(self) -> Result<FaceDetector<crate::backend::TractBackend>, DetectorError> {
    use crate::{
      backend::TractBackend,
      device::{HostAllocator, HostMemory, TrackedAllocator},
    };

    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let geometry = AnchorGeometry::default();
    let memory = HostMemory::new();
    let backend = TractBackend::load(
      &model_data,
      &[3, geometry.height, geometry.width],
      memory.clone(),
    )?;
    let allocator = TrackedAllocator::new(HostAllocator::new(memory));
    FaceDetector::with_geometry(backend, Box::new(allocator), self.batch, self.names, geometry)
  }
}
