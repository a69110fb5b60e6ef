// 该文件是 Renlian （人脸） 项目的一部分。
// tests/service.rs - 检测服务测试
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

mod common;

use renlian::{
  backend::HostBackend,
  device::{HostAllocator, HostMemory, TrackedAllocator},
  frame::EncodedFrame,
  model::{DetectionParams, FaceDetector, Model, TensorNames},
  service::{FaceDetectionRequest, FaceDetectionService, ServiceError},
};

use common::{SyntheticFaceKernel, close, png_bytes, small_geometry};

fn service(params: DetectionParams) -> FaceDetectionService<HostBackend<SyntheticFaceKernel>> {
  let memory = HostMemory::new();
  let backend = HostBackend::new(SyntheticFaceKernel::new(small_geometry()), memory.clone());
  let allocator = TrackedAllocator::new(HostAllocator::new(memory));
  let detector = FaceDetector::with_geometry(
    backend,
    Box::new(allocator),
    4,
    TensorNames::default(),
    small_geometry(),
  )
  .unwrap();
  FaceDetectionService::with_params(detector, params)
}

#[test]
fn default_service_uses_server_preset() {
  let memory = HostMemory::new();
  let backend = HostBackend::new(SyntheticFaceKernel::new(small_geometry()), memory.clone());
  let detector = FaceDetector::with_geometry(
    backend,
    Box::new(HostAllocator::new(memory)),
    1,
    TensorNames::default(),
    small_geometry(),
  )
  .unwrap();
  let service = FaceDetectionService::new(detector);
  assert_eq!(service.params(), &DetectionParams::service());
}

#[test]
fn request_returns_parallel_arrays() {
  let service = service(DetectionParams {
    slide: false,
    ..DetectionParams::service()
  });
  let request = FaceDetectionRequest {
    image: png_bytes(64, 64),
  };

  let response = service.serve(&request).unwrap();

  assert_eq!(response.len(), 1);
  assert_eq!(response.score.len(), response.bbox.len());
  assert_eq!(response.landmark.len(), response.bbox.len());
  assert_eq!(response.landmark[0].point.len(), 5);
  assert!(close(response.bbox[0].x, 0.3125));
  assert!(close(response.score[0], 0.99));

  let json = serde_json::to_value(&response).unwrap();
  assert_eq!(json["bbox"].as_array().map(Vec::len), Some(1));
  assert_eq!(json["landmark"][0]["point"].as_array().map(Vec::len), Some(5));
}

#[test]
fn repeated_requests_reuse_the_detector() {
  let service = service(DetectionParams::service());
  let request = FaceDetectionRequest {
    image: png_bytes(128, 96),
  };

  let first = service.serve(&request).unwrap();
  let second = service.serve(&request).unwrap();
  assert_eq!(first, second);
}

#[test]
fn malformed_image_is_a_decode_error() {
  let service = service(DetectionParams::service());
  let request = FaceDetectionRequest {
    image: vec![0, 1, 2, 3],
  };

  assert!(matches!(
    service.serve(&request),
    Err(ServiceError::Decode(_))
  ));
}

#[test]
fn service_is_a_model_over_encoded_frames() {
  let service = service(DetectionParams {
    slide: false,
    ..DetectionParams::default()
  });
  let frame = EncodedFrame::new("memory", png_bytes(64, 64));

  let response = service.infer(&frame).unwrap();
  assert_eq!(response.len(), 1);
}
