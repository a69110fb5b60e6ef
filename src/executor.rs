// 该文件是 Renlian （人脸） 项目的一部分。
// src/executor.rs - 分块批量张量执行器
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
  collections::{BTreeMap, HashMap, HashSet},
  ops::Range,
};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  backend::{BackendError, DataType, ExecutionBackend, TensorDesc, bytes_to_f32, f32_to_bytes},
  device::{DeviceAllocator, DeviceBuffer, format_size},
};

const BUFFER_ALIGNMENT: u64 = 256;

#[derive(Error, Debug)]
pub enum ExecutorError {
  #[error("编译批大小必须大于 0")]
  InvalidCompiledBatch,
  #[error("模型中不存在张量: {0}")]
  MissingBinding(String),
  #[error("张量重复绑定: {0}")]
  DuplicateBinding(String),
  #[error("设备内存不足: 张量 {name} 需要 {size} 字节")]
  OutOfDeviceMemory { name: String, size: u64 },
  #[error("没有输入张量")]
  EmptyInput,
  #[error("输入批大小为 0")]
  EmptyBatch,
  #[error("未绑定的输入张量: {0}")]
  UnknownInput(String),
  #[error("缺少输入张量: {0}")]
  MissingInput(String),
  #[error("输入 {name} 的批大小为 {actual}，其他输入为 {expected}")]
  BatchMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
  #[error("张量 {name} 形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    name: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("张量 {name} 类型不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  TypeMismatch {
    name: String,
    expected: DataType,
    actual: DataType,
  },
  #[error("数据长度不匹配: 期望 {expected}, 实际 {actual}")]
  DataLength { expected: usize, actual: usize },
  #[error("执行后端错误: {0}")]
  Backend(#[from] BackendError),
}

/// 主机上的张量，形状第一维为批大小
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
  dtype: DataType,
  shape: Box<[usize]>,
  data: Vec<u8>,
}

impl HostTensor {
  pub fn zeros(dtype: DataType, shape: &[usize]) -> Self {
    let len = shape.iter().product::<usize>() * dtype.size();
    Self {
      dtype,
      shape: shape.into(),
      data: vec![0u8; len],
    }
  }

  pub fn from_f32(shape: &[usize], values: &[f32]) -> Result<Self, ExecutorError> {
    let expected = shape.iter().product::<usize>();
    if expected != values.len() {
      return Err(ExecutorError::DataLength {
        expected,
        actual: values.len(),
      });
    }
    Ok(Self {
      dtype: DataType::Float,
      shape: shape.into(),
      data: f32_to_bytes(values),
    })
  }

  pub fn dtype(&self) -> DataType {
    self.dtype
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn batch(&self) -> usize {
    self.shape.first().copied().unwrap_or(0)
  }

  pub fn row_bytes(&self) -> usize {
    self.shape.iter().skip(1).product::<usize>() * self.dtype.size()
  }

  pub fn bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn bytes_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  fn rows(&self, rows: Range<usize>) -> &[u8] {
    let row_bytes = self.row_bytes();
    &self.data[rows.start * row_bytes..rows.end * row_bytes]
  }

  fn rows_mut(&mut self, rows: Range<usize>) -> &mut [u8] {
    let row_bytes = self.row_bytes();
    &mut self.data[rows.start * row_bytes..rows.end * row_bytes]
  }

  fn ensure_float(&self) -> Result<(), ExecutorError> {
    if self.dtype != DataType::Float {
      return Err(ExecutorError::TypeMismatch {
        name: String::from("<host tensor>"),
        expected: DataType::Float,
        actual: self.dtype,
      });
    }
    Ok(())
  }

  pub fn to_f32(&self) -> Result<Vec<f32>, ExecutorError> {
    self.ensure_float()?;
    Ok(bytes_to_f32(&self.data))
  }

  /// 取第 `row` 个批次行的 f32 数据
  pub fn row_f32(&self, row: usize) -> Result<Vec<f32>, ExecutorError> {
    self.ensure_float()?;
    Ok(bytes_to_f32(self.rows(row..row + 1)))
  }
}

/// 按编译批大小把 `total` 行切成连续的块
pub fn chunk_ranges(total: usize, compiled_batch: usize) -> impl Iterator<Item = Range<usize>> {
  let chunks = if compiled_batch == 0 {
    0
  } else {
    total.div_ceil(compiled_batch)
  };
  (0..chunks).map(move |chunk| {
    let start = chunk * compiled_batch;
    start..(start + compiled_batch).min(total)
  })
}

/// 分块批量张量执行器
///
/// 为每个绑定的输入/输出张量持有一块按编译批大小分配的设备缓冲区，
/// 把任意批大小的输入切成编译批大小的块依次执行，再拼回完整输出。
/// 设备缓冲区在块之间复用，所以 `infer` 需要 `&mut self`，同一实例不能并发调用。
pub struct TensorExecutor<B: ExecutionBackend> {
  backend: B,
  allocator: Box<dyn DeviceAllocator>,
  compiled_batch: usize,
  inputs: BTreeMap<String, DeviceBuffer>,
  outputs: BTreeMap<String, DeviceBuffer>,
  workspace: Option<DeviceBuffer>,
}

impl<B: ExecutionBackend> TensorExecutor<B> {
  pub fn new(
    backend: B,
    allocator: Box<dyn DeviceAllocator>,
    compiled_batch: usize,
    input_names: &[&str],
    output_names: &[&str],
  ) -> Result<Self, ExecutorError> {
    if compiled_batch == 0 {
      return Err(ExecutorError::InvalidCompiledBatch);
    }
    let mut seen = HashSet::new();
    if let Some(name) = input_names
      .iter()
      .chain(output_names)
      .find(|name| !seen.insert(**name))
    {
      return Err(ExecutorError::DuplicateBinding(name.to_string()));
    }

    // 先构造出实例，中途失败时由 Drop 释放已分配的缓冲区
    let mut executor = Self {
      backend,
      allocator,
      compiled_batch,
      inputs: BTreeMap::new(),
      outputs: BTreeMap::new(),
      workspace: None,
    };

    info!("准备执行上下文，编译批大小: {}", compiled_batch);
    executor.backend.prepare(compiled_batch)?;

    let workspace_size = executor.backend.workspace_size();
    if workspace_size > 0 {
      let desc = TensorDesc::new(DataType::UInt8, &[]);
      let workspace = executor.allocate("<workspace>", workspace_size, desc)?;
      let workspace = executor.workspace.insert(workspace);
      executor.backend.bind_workspace(workspace)?;
    }

    for name in input_names {
      let buffer = executor.allocate_for(name)?;
      let buffer = executor.inputs.entry(name.to_string()).or_insert(buffer);
      executor.backend.bind_input(name, buffer)?;
    }
    for name in output_names {
      let buffer = executor.allocate_for(name)?;
      let buffer = executor.outputs.entry(name.to_string()).or_insert(buffer);
      executor.backend.bind_output(name, buffer)?;
    }

    debug!(
      "已绑定输入 {:?}，输出 {:?}",
      executor.inputs.keys().collect::<Vec<_>>(),
      executor.outputs.keys().collect::<Vec<_>>()
    );
    Ok(executor)
  }

  fn allocate_for(&mut self, name: &str) -> Result<DeviceBuffer, ExecutorError> {
    let desc = self
      .backend
      .tensor_desc(name)
      .ok_or_else(|| ExecutorError::MissingBinding(name.to_string()))?;
    let size = (desc.row_bytes() * self.compiled_batch) as u64;
    self.allocate(name, size, desc)
  }

  fn allocate(
    &mut self,
    name: &str,
    size: u64,
    desc: TensorDesc,
  ) -> Result<DeviceBuffer, ExecutorError> {
    match self.allocator.allocate(size, BUFFER_ALIGNMENT) {
      Some(ptr) => Ok(DeviceBuffer::new(ptr, size, desc)),
      None => {
        error!("为张量 {} 分配 {} 设备内存失败", name, format_size(size));
        Err(ExecutorError::OutOfDeviceMemory {
          name: name.to_string(),
          size,
        })
      }
    }
  }

  pub fn compiled_batch(&self) -> usize {
    self.compiled_batch
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  pub fn input_desc(&self, name: &str) -> Option<&TensorDesc> {
    self.inputs.get(name).map(DeviceBuffer::desc)
  }

  pub fn output_desc(&self, name: &str) -> Option<&TensorDesc> {
    self.outputs.get(name).map(DeviceBuffer::desc)
  }

  fn check_inputs(&self, inputs: &HashMap<String, HostTensor>) -> Result<usize, ExecutorError> {
    if inputs.is_empty() {
      return Err(ExecutorError::EmptyInput);
    }
    if let Some(name) = inputs.keys().find(|name| !self.inputs.contains_key(*name)) {
      return Err(ExecutorError::UnknownInput(name.clone()));
    }

    let mut batch = None;
    for (name, buffer) in &self.inputs {
      let tensor = inputs
        .get(name)
        .ok_or_else(|| ExecutorError::MissingInput(name.clone()))?;
      let desc = buffer.desc();
      if tensor.dtype() != desc.dtype {
        return Err(ExecutorError::TypeMismatch {
          name: name.clone(),
          expected: desc.dtype,
          actual: tensor.dtype(),
        });
      }
      if tensor.shape().len() != desc.shape.len() + 1 || tensor.shape()[1..] != desc.shape[..] {
        let mut expected = vec![tensor.batch()];
        expected.extend_from_slice(&desc.shape);
        return Err(ExecutorError::ShapeMismatch {
          name: name.clone(),
          expected,
          actual: tensor.shape().to_vec(),
        });
      }
      match batch {
        None => batch = Some(tensor.batch()),
        Some(expected) if expected != tensor.batch() => {
          return Err(ExecutorError::BatchMismatch {
            name: name.clone(),
            expected,
            actual: tensor.batch(),
          });
        }
        Some(_) => {}
      }
    }

    match batch {
      Some(0) | None => Err(ExecutorError::EmptyBatch),
      Some(batch) => Ok(batch),
    }
  }

  /// 执行一次推理，输出第 r 行严格对应输入第 r 行
  ///
  /// 任意一块失败都会中止整个调用，不返回部分结果。
  pub fn infer(
    &mut self,
    inputs: &HashMap<String, HostTensor>,
  ) -> Result<HashMap<String, HostTensor>, ExecutorError> {
    let total = self.check_inputs(inputs)?;
    let mut outputs: HashMap<String, HostTensor> = HashMap::with_capacity(self.outputs.len());

    debug!(
      "推理批大小 {}，分 {} 块执行",
      total,
      total.div_ceil(self.compiled_batch)
    );

    for rows in chunk_ranges(total, self.compiled_batch) {
      let current = rows.len();

      for (name, buffer) in &self.inputs {
        let tensor = &inputs[name];
        self.backend.copy_to_device(buffer, tensor.rows(rows.clone()))?;
      }

      self.backend.dispatch(current)?;

      for (name, buffer) in &self.outputs {
        let tensor = outputs.entry(name.clone()).or_insert_with(|| {
          let desc = buffer.desc();
          let mut shape = Vec::with_capacity(desc.shape.len() + 1);
          shape.push(total);
          shape.extend_from_slice(&desc.shape);
          HostTensor::zeros(desc.dtype, &shape)
        });
        self.backend.copy_to_host(buffer, tensor.rows_mut(rows.clone()))?;
      }
    }

    self.backend.synchronize()?;
    Ok(outputs)
  }
}

impl<B: ExecutionBackend> Drop for TensorExecutor<B> {
  fn drop(&mut self) {
    let buffers = std::mem::take(&mut self.inputs)
      .into_values()
      .chain(std::mem::take(&mut self.outputs).into_values())
      .chain(self.workspace.take());
    for buffer in buffers {
      self.allocator.free(buffer.ptr());
    }
  }
}
