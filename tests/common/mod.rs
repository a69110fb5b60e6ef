// 该文件是 Renlian （人脸） 项目的一部分。
// tests/common/mod.rs - 集成测试公共部分
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

#![allow(dead_code)]

use std::{
  io::Cursor,
  sync::{Arc, Mutex, PoisonError},
};

use image::{ImageFormat, Rgb, RgbImage};

use renlian::{
  backend::{HostKernel, KernelSignature},
  device::{DeviceAllocator, DevicePtr},
  model::AnchorGeometry,
};

/// y0 = x0 + x1, y1 = 2 * x2，x0 为负时失败
pub struct AffineKernel;

impl HostKernel for AffineKernel {
  fn signature(&self) -> KernelSignature {
    KernelSignature {
      inputs: vec![("x".to_string(), vec![3])],
      outputs: vec![("y".to_string(), vec![2])],
    }
  }

  fn forward(&self, inputs: &[&[f32]], outputs: &mut [Vec<f32>]) -> Result<(), String> {
    let x = inputs[0];
    if x[0] < 0.0 {
      return Err(format!("negative input {}", x[0]));
    }
    outputs[0][0] = x[0] + x[1];
    outputs[0][1] = 2.0 * x[2];
    Ok(())
  }
}

/// 测试用的小尺寸模型几何：64x64 输入，168 个先验框
pub fn small_geometry() -> AnchorGeometry {
  AnchorGeometry {
    width: 64,
    height: 64,
    ..AnchorGeometry::default()
  }
}

/// 第一层 (3, 3) 处的第一个先验框：中心 (0.4375, 0.4375)，边长 0.25
pub const HOT_ANCHOR: usize = (3 * 8 + 3) * 2;

/// 只在一个先验框上给出高分人脸、偏移全为 0 的合成检测模型
pub struct SyntheticFaceKernel {
  pub geometry: AnchorGeometry,
  pub rows: usize,
  pub hot: usize,
  pub score: f32,
}

impl SyntheticFaceKernel {
  pub fn new(geometry: AnchorGeometry) -> Self {
    let rows = geometry.anchor_count();
    Self {
      geometry,
      rows,
      hot: HOT_ANCHOR,
      score: 0.99,
    }
  }

  pub fn with_rows(mut self, rows: usize) -> Self {
    self.rows = rows;
    self
  }
}

impl HostKernel for SyntheticFaceKernel {
  fn signature(&self) -> KernelSignature {
    KernelSignature {
      inputs: vec![(
        "input".to_string(),
        vec![3, self.geometry.height, self.geometry.width],
      )],
      outputs: vec![
        ("bbox".to_string(), vec![self.rows, 4]),
        ("score".to_string(), vec![self.rows, 2]),
        ("landmark".to_string(), vec![self.rows, 10]),
      ],
    }
  }

  fn forward(&self, _inputs: &[&[f32]], outputs: &mut [Vec<f32>]) -> Result<(), String> {
    let score = &mut outputs[1];
    for row in 0..self.rows {
      score[row * 2] = 1.0;
    }
    score[self.hot * 2] = 1.0 - self.score;
    score[self.hot * 2 + 1] = self.score;
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorCall {
  Allocate { size: u64, ptr: Option<DevicePtr> },
  Free { ptr: DevicePtr, released: bool },
}

/// 记录每次调用的分配器包装
pub struct RecordingAllocator<A: DeviceAllocator> {
  inner: A,
  calls: Arc<Mutex<Vec<AllocatorCall>>>,
}

impl<A: DeviceAllocator> RecordingAllocator<A> {
  pub fn new(inner: A) -> (Self, Arc<Mutex<Vec<AllocatorCall>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    (
      Self {
        inner,
        calls: calls.clone(),
      },
      calls,
    )
  }

  fn push(&self, call: AllocatorCall) {
    self
      .calls
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(call);
  }
}

impl<A: DeviceAllocator> DeviceAllocator for RecordingAllocator<A> {
  fn allocate(&mut self, size: u64, alignment: u64) -> Option<DevicePtr> {
    let ptr = self.inner.allocate(size, alignment);
    self.push(AllocatorCall::Allocate { size, ptr });
    ptr
  }

  fn free(&mut self, ptr: DevicePtr) -> bool {
    let released = self.inner.free(ptr);
    self.push(AllocatorCall::Free { ptr, released });
    released
  }
}

pub fn snapshot(calls: &Arc<Mutex<Vec<AllocatorCall>>>) -> Vec<AllocatorCall> {
  calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
  let image = RgbImage::from_pixel(width, height, Rgb([120, 90, 60]));
  let mut bytes = Cursor::new(Vec::new());
  image.write_to(&mut bytes, ImageFormat::Png).unwrap();
  bytes.into_inner()
}

pub fn close(a: f32, b: f32) -> bool {
  (a - b).abs() < 1e-5
}
