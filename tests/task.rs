// 该文件是 Renlian （人脸） 项目的一部分。
// tests/task.rs - 任务调度测试
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

use std::sync::{Arc, Mutex, PoisonError};

use tempfile::tempdir;
use thiserror::Error;
use url::Url;

use renlian::{
  FromUrl,
  backend::HostBackend,
  device::{HostAllocator, HostMemory},
  input::InputWrapper,
  model::{DetectionParams, FaceDetector, Model, TensorNames},
  output::{OutputWrapper, Render},
  service::FaceDetectionService,
  task::{ContinuousTask, OneShotTask, RepeatShotTask, Task},
};

use common::{SyntheticFaceKernel, png_bytes, small_geometry};

#[derive(Error, Debug)]
#[error("mock failure at frame {0}")]
struct MockError(u32);

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<u32>>>);

impl Log {
  fn push(&self, value: u32) {
    self.0.lock().unwrap_or_else(PoisonError::into_inner).push(value);
  }

  fn values(&self) -> Vec<u32> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

struct MockModel {
  seen: Log,
  fail_on: Option<u32>,
}

impl Model for MockModel {
  type Input = u32;
  type Output = u32;
  type Error = MockError;

  fn infer(&self, input: &u32) -> Result<u32, MockError> {
    self.seen.push(*input);
    if self.fail_on == Some(*input) {
      return Err(MockError(*input));
    }
    Ok(input * 10)
  }
}

struct MockRender {
  rendered: Log,
}

impl Render<u32, u32> for MockRender {
  type Error = MockError;

  fn render_result(&self, _frame: &u32, result: &u32) -> Result<(), MockError> {
    self.rendered.push(*result);
    Ok(())
  }
}

fn mocks(fail_on: Option<u32>) -> (MockModel, MockRender, Log, Log) {
  let seen = Log::default();
  let rendered = Log::default();
  (
    MockModel {
      seen: seen.clone(),
      fail_on,
    },
    MockRender {
      rendered: rendered.clone(),
    },
    seen,
    rendered,
  )
}

#[test]
fn one_shot_processes_first_frame_only() {
  let (model, render, seen, rendered) = mocks(None);
  OneShotTask.run_task(1..=3u32, model, render).unwrap();
  assert_eq!(seen.values(), vec![1]);
  assert_eq!(rendered.values(), vec![10]);
}

#[test]
fn one_shot_without_input_fails() {
  let (model, render, seen, _) = mocks(None);
  assert!(OneShotTask.run_task(std::iter::empty::<u32>(), model, render).is_err());
  assert!(seen.values().is_empty());
}

#[test]
fn repeat_shot_reuses_one_frame() {
  let (model, render, seen, rendered) = mocks(None);
  RepeatShotTask::default()
    .with_repeat(5)
    .run_task(7..9u32, model, render)
    .unwrap();
  assert_eq!(seen.values(), vec![7; 5]);
  assert_eq!(rendered.values().len(), 5);
}

#[test]
fn continuous_stops_at_frame_number() {
  let (model, render, seen, _) = mocks(None);
  ContinuousTask::default()
    .with_frame_number(Some(2))
    .run_task(1..=5u32, model, render)
    .unwrap();
  assert_eq!(seen.values(), vec![1, 2]);
}

#[test]
fn continuous_drains_input_without_limit() {
  let (model, render, _, rendered) = mocks(None);
  ContinuousTask::default()
    .run_task(1..=4u32, model, render)
    .unwrap();
  assert_eq!(rendered.values(), vec![10, 20, 30, 40]);
}

#[test]
fn model_error_stops_the_task() {
  let (model, render, seen, rendered) = mocks(Some(3));
  let err = ContinuousTask::default()
    .run_task(1..=5u32, model, render)
    .unwrap_err();
  assert!(err.to_string().contains("frame 3"));
  assert_eq!(seen.values(), vec![1, 2, 3]);
  assert_eq!(rendered.values(), vec![10, 20]);
}

#[test]
fn one_shot_pipeline_writes_annotated_image() {
  let dir = tempdir().unwrap();
  let source = dir.path().join("face.png");
  std::fs::write(&source, png_bytes(64, 64)).unwrap();
  let target = dir.path().join("out").join("face.png");

  let input =
    InputWrapper::from_url(&Url::parse(&format!("image://{}", source.display())).unwrap()).unwrap();
  let output =
    OutputWrapper::from_url(&Url::parse(&format!("image://{}", target.display())).unwrap())
      .unwrap();

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
  let service = FaceDetectionService::with_params(
    detector,
    DetectionParams {
      slide: false,
      ..DetectionParams::default()
    },
  );

  OneShotTask
    .run_task(input.into_frames(), service, output)
    .unwrap();

  let written = image::open(&target).unwrap().to_rgb8();
  assert_eq!(written.dimensions(), (64, 64));
  // 关键点全部落在 (28, 28)
  assert_eq!(written.get_pixel(28, 28).0, [255, 0, 0]);
  assert_eq!(written.get_pixel(2, 60).0, [120, 90, 60]);
}
