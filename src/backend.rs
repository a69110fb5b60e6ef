// 该文件是 Renlian （人脸） 项目的一部分。
// src/backend.rs - 执行后端接口
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

use thiserror::Error;

use crate::device::{DeviceBuffer, DeviceError};

mod host;
pub use self::host::{HostBackend, HostKernel, KernelSignature};

#[cfg(feature = "tract")]
mod tract;
#[cfg(feature = "tract")]
pub use self::tract::TractBackend;

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
  Float,
  Half,
  Int8,
  Int32,
  Bool,
  UInt8,
  Fp8,
  BFloat16,
  Int64,
  Int4,
}

impl DataType {
  /// 单个元素占用的字节数（Int4 按字节存储）
  pub const fn size(self) -> usize {
    match self {
      DataType::Float | DataType::Int32 => 4,
      DataType::Half | DataType::BFloat16 => 2,
      DataType::Int8 | DataType::Bool | DataType::UInt8 | DataType::Fp8 | DataType::Int4 => 1,
      DataType::Int64 => 8,
    }
  }
}

/// 编译模型中张量的描述，形状不含批维度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
  pub dtype: DataType,
  pub shape: Box<[usize]>,
}

impl TensorDesc {
  pub fn new(dtype: DataType, shape: &[usize]) -> Self {
    Self {
      dtype,
      shape: shape.into(),
    }
  }

  pub fn row_elements(&self) -> usize {
    self.shape.iter().product()
  }

  pub fn row_bytes(&self) -> usize {
    self.row_elements() * self.dtype.size()
  }
}

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("模型加载错误: {0}")]
  ModelLoad(String),
  #[error("未知张量: {0}")]
  UnknownTensor(String),
  #[error("张量 {0} 未绑定设备缓冲区")]
  Unbound(String),
  #[error("不支持的数据类型: {0:?}")]
  UnsupportedType(DataType),
  #[error("设备内存错误: {0}")]
  Device(#[from] DeviceError),
  #[error("计算执行错误: {0}")]
  Compute(String),
}

/// 执行后端
///
/// 编译模型的运行时能力：查询张量、绑定设备缓冲区、在同一执行流上按序
/// 拷贝与派发计算。派发与拷贝对调用线程可以是异步的，`synchronize` 是唯一的
/// 阻塞点。
pub trait ExecutionBackend: Send {
  /// 以编译批大小固定输入形状，需在查询张量之前调用
  fn prepare(&mut self, batch: usize) -> Result<(), BackendError>;

  fn tensor_desc(&self, name: &str) -> Option<TensorDesc>;

  /// 执行上下文所需的暂存空间字节数
  fn workspace_size(&self) -> u64 {
    0
  }

  fn bind_workspace(&mut self, _buffer: &DeviceBuffer) -> Result<(), BackendError> {
    Ok(())
  }

  fn bind_input(&mut self, name: &str, buffer: &DeviceBuffer) -> Result<(), BackendError>;
  fn bind_output(&mut self, name: &str, buffer: &DeviceBuffer) -> Result<(), BackendError>;

  /// 主机到设备：写入缓冲区起始处
  fn copy_to_device(&mut self, dst: &DeviceBuffer, src: &[u8]) -> Result<(), BackendError>;
  /// 设备到主机：从缓冲区起始处读取 `dst.len()` 字节
  fn copy_to_host(&mut self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), BackendError>;

  /// 在已绑定的缓冲区上派发计算，`batch` 为本块有效行数
  fn dispatch(&mut self, batch: usize) -> Result<(), BackendError>;
  fn synchronize(&mut self) -> Result<(), BackendError>;
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
  values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
  bytes
    .chunks_exact(4)
    .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
    .collect()
}
