// 该文件是 Renlian （人脸） 项目的一部分。
// src/backend/host.rs - 主机内存上的逐行计算后端
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

use tracing::trace;

use crate::{
  backend::{BackendError, DataType, ExecutionBackend, TensorDesc, bytes_to_f32, f32_to_bytes},
  device::{DeviceBuffer, DevicePtr, HostMemory},
};

/// 内核的输入输出张量（名称，不含批维度的形状），全部为 f32
#[derive(Debug, Clone, Default)]
pub struct KernelSignature {
  pub inputs: Vec<(String, Vec<usize>)>,
  pub outputs: Vec<(String, Vec<usize>)>,
}

impl KernelSignature {
  fn find(&self, name: &str) -> Option<&[usize]> {
    self
      .inputs
      .iter()
      .chain(self.outputs.iter())
      .find(|(n, _)| n == name)
      .map(|(_, shape)| shape.as_slice())
  }
}

/// 按批次行独立计算的 CPU 内核
pub trait HostKernel: Send {
  fn signature(&self) -> KernelSignature;

  /// 计算一行，输入与输出按签名顺序排列，输出已按形状清零
  fn forward(&self, inputs: &[&[f32]], outputs: &mut [Vec<f32>]) -> Result<(), String>;
}

/// 在 [`HostMemory`] 上运行 [`HostKernel`] 的执行后端
pub struct HostBackend<K: HostKernel> {
  kernel: K,
  memory: HostMemory,
  signature: KernelSignature,
  batch: usize,
  bindings: HashMap<String, DevicePtr>,
  dispatches: Vec<usize>,
  synchronizations: usize,
}

impl<K: HostKernel> HostBackend<K> {
  pub fn new(kernel: K, memory: HostMemory) -> Self {
    let signature = kernel.signature();
    Self {
      kernel,
      memory,
      signature,
      batch: 0,
      bindings: HashMap::new(),
      dispatches: Vec::new(),
      synchronizations: 0,
    }
  }

  pub fn kernel(&self) -> &K {
    &self.kernel
  }

  /// 每次派发的有效行数
  pub fn dispatch_log(&self) -> &[usize] {
    &self.dispatches
  }

  pub fn synchronizations(&self) -> usize {
    self.synchronizations
  }

  fn bind(&mut self, name: &str, buffer: &DeviceBuffer) -> Result<(), BackendError> {
    if self.signature.find(name).is_none() {
      return Err(BackendError::UnknownTensor(name.to_string()));
    }
    self.bindings.insert(name.to_string(), buffer.ptr());
    Ok(())
  }

  fn binding(&self, name: &str) -> Result<DevicePtr, BackendError> {
    self
      .bindings
      .get(name)
      .copied()
      .ok_or_else(|| BackendError::Unbound(name.to_string()))
  }
}

impl<K: HostKernel> ExecutionBackend for HostBackend<K> {
  fn prepare(&mut self, batch: usize) -> Result<(), BackendError> {
    self.batch = batch;
    Ok(())
  }

  fn tensor_desc(&self, name: &str) -> Option<TensorDesc> {
    self
      .signature
      .find(name)
      .map(|shape| TensorDesc::new(DataType::Float, shape))
  }

  fn bind_input(&mut self, name: &str, buffer: &DeviceBuffer) -> Result<(), BackendError> {
    self.bind(name, buffer)
  }

  fn bind_output(&mut self, name: &str, buffer: &DeviceBuffer) -> Result<(), BackendError> {
    self.bind(name, buffer)
  }

  fn copy_to_device(&mut self, dst: &DeviceBuffer, src: &[u8]) -> Result<(), BackendError> {
    Ok(self.memory.write(dst.ptr(), 0, src)?)
  }

  fn copy_to_host(&mut self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), BackendError> {
    Ok(self.memory.read(src.ptr(), 0, dst)?)
  }

  fn dispatch(&mut self, batch: usize) -> Result<(), BackendError> {
    if batch > self.batch {
      return Err(BackendError::Compute(format!(
        "派发行数 {} 超过编译批大小 {}",
        batch, self.batch
      )));
    }

    let inputs = self
      .signature
      .inputs
      .iter()
      .map(|(name, shape)| Ok((self.binding(name)?, shape.iter().product::<usize>())))
      .collect::<Result<Vec<_>, BackendError>>()?;
    let outputs = self
      .signature
      .outputs
      .iter()
      .map(|(name, shape)| Ok((self.binding(name)?, shape.iter().product::<usize>())))
      .collect::<Result<Vec<_>, BackendError>>()?;

    for row in 0..batch {
      let mut row_inputs = Vec::with_capacity(inputs.len());
      for &(ptr, elements) in &inputs {
        let mut bytes = vec![0u8; elements * 4];
        self.memory.read(ptr, row * elements * 4, &mut bytes)?;
        row_inputs.push(bytes_to_f32(&bytes));
      }
      let views: Vec<&[f32]> = row_inputs.iter().map(Vec::as_slice).collect();
      let mut row_outputs: Vec<Vec<f32>> = outputs
        .iter()
        .map(|&(_, elements)| vec![0.0; elements])
        .collect();

      self
        .kernel
        .forward(&views, &mut row_outputs)
        .map_err(BackendError::Compute)?;

      for (&(ptr, elements), values) in outputs.iter().zip(&row_outputs) {
        if values.len() != elements {
          return Err(BackendError::Compute(format!(
            "内核输出长度 {} 与形状元素数 {} 不一致",
            values.len(),
            elements
          )));
        }
        self
          .memory
          .write(ptr, row * elements * 4, &f32_to_bytes(values))?;
      }
    }

    trace!("主机后端完成 {} 行计算", batch);
    self.dispatches.push(batch);
    Ok(())
  }

  fn synchronize(&mut self) -> Result<(), BackendError> {
    self.synchronizations += 1;
    Ok(())
  }
}
