// 该文件是 Renlian （人脸） 项目的一部分。
// src/backend/tract.rs - 基于 tract 的 ONNX 执行后端
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

use tracing::{debug, info};
use tract_onnx::prelude::{
  DatumType, Framework, Graph, InferenceFact, InferenceModel, InferenceModelExt, IntoTensor, SimplePlan,
  TValue, TVec, Tensor, TypedFact, TypedOp, tvec,
};

use crate::{
  backend::{BackendError, DataType, ExecutionBackend, TensorDesc, bytes_to_f32, f32_to_bytes},
  device::{DeviceBuffer, DevicePtr, HostMemory},
};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// 在 CPU 上运行 ONNX 模型的后端，设备内存为 [`HostMemory`]
pub struct TractBackend {
  model: Option<InferenceModel>,
  plan: Option<RunnableModel>,
  memory: HostMemory,
  input_shape: Vec<usize>,
  batch: usize,
  inputs: Vec<String>,
  outputs: Vec<String>,
  descs: HashMap<String, TensorDesc>,
  bindings: HashMap<String, DevicePtr>,
}

fn load_error(e: impl std::fmt::Display) -> BackendError {
  BackendError::ModelLoad(e.to_string())
}

fn compute_error(e: impl std::fmt::Display) -> BackendError {
  BackendError::Compute(e.to_string())
}

fn data_type(datum: DatumType) -> Result<DataType, BackendError> {
  match datum {
    DatumType::F32 => Ok(DataType::Float),
    DatumType::F16 => Ok(DataType::Half),
    DatumType::I8 => Ok(DataType::Int8),
    DatumType::I32 => Ok(DataType::Int32),
    DatumType::Bool => Ok(DataType::Bool),
    DatumType::U8 => Ok(DataType::UInt8),
    DatumType::I64 => Ok(DataType::Int64),
    other => Err(BackendError::ModelLoad(format!(
      "不支持的张量类型: {:?}",
      other
    ))),
  }
}

impl TractBackend {
  /// 从 ONNX 字节加载模型，`input_shape` 为不含批维度的输入形状
  pub fn load(bytes: &[u8], input_shape: &[usize], memory: HostMemory) -> Result<Self, BackendError> {
    info!("解析 ONNX 模型，大小: {:.2} MB", bytes.len() as f64 / (1024.0 * 1024.0));
    let model = tract_onnx::onnx()
      .model_for_read(&mut std::io::Cursor::new(bytes))
      .map_err(load_error)?;

    Ok(Self {
      model: Some(model),
      plan: None,
      memory,
      input_shape: input_shape.to_vec(),
      batch: 0,
      inputs: Vec::new(),
      outputs: Vec::new(),
      descs: HashMap::new(),
      bindings: HashMap::new(),
    })
  }

  fn binding(&self, name: &str) -> Result<DevicePtr, BackendError> {
    self
      .bindings
      .get(name)
      .copied()
      .ok_or_else(|| BackendError::Unbound(name.to_string()))
  }

  fn bind(&mut self, name: &str, buffer: &DeviceBuffer) -> Result<(), BackendError> {
    if !self.descs.contains_key(name) {
      return Err(BackendError::UnknownTensor(name.to_string()));
    }
    self.bindings.insert(name.to_string(), buffer.ptr());
    Ok(())
  }
}

impl ExecutionBackend for TractBackend {
  fn prepare(&mut self, batch: usize) -> Result<(), BackendError> {
    let model = self
      .model
      .take()
      .ok_or_else(|| BackendError::ModelLoad("模型已经准备过".to_string()))?;

    let mut shape = vec![batch];
    shape.extend_from_slice(&self.input_shape);
    debug!("固定模型输入形状: {:?}", shape);

    let plan = model
      .with_input_fact(0, InferenceFact::dt_shape(DatumType::F32, shape))
      .map_err(load_error)?
      .into_optimized()
      .map_err(load_error)?
      .into_runnable()
      .map_err(load_error)?;

    let graph = plan.model();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut descs = HashMap::new();
    for (outlets, names) in [
      (graph.input_outlets().map_err(load_error)?, &mut inputs),
      (graph.output_outlets().map_err(load_error)?, &mut outputs),
    ] {
      for outlet in outlets {
        // 输出名记录在出口标签上，输入名即源节点名
        let name = graph
          .outlet_label(*outlet)
          .map(str::to_string)
          .unwrap_or_else(|| graph.node(outlet.node).name.clone());
        let fact = graph.outlet_fact(*outlet).map_err(load_error)?;
        let dims = fact
          .shape
          .as_concrete()
          .ok_or_else(|| BackendError::ModelLoad(format!("张量 {} 形状不是常量", name)))?;
        if dims.first() != Some(&batch) {
          return Err(BackendError::ModelLoad(format!(
            "张量 {} 的批维度 {:?} 与编译批大小 {} 不一致",
            name,
            dims.first(),
            batch
          )));
        }
        let desc = TensorDesc::new(data_type(fact.datum_type)?, &dims[1..]);
        debug!("模型张量 {}: {:?}", name, desc);
        descs.insert(name.clone(), desc);
        names.push(name);
      }
    }

    info!("模型准备完成，输入 {:?}，输出 {:?}", inputs, outputs);
    self.plan = Some(plan);
    self.batch = batch;
    self.inputs = inputs;
    self.outputs = outputs;
    self.descs = descs;
    Ok(())
  }

  fn tensor_desc(&self, name: &str) -> Option<TensorDesc> {
    self.descs.get(name).cloned()
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

  fn dispatch(&mut self, _batch: usize) -> Result<(), BackendError> {
    let plan = self
      .plan
      .as_ref()
      .ok_or_else(|| BackendError::Compute("模型尚未准备".to_string()))?;

    // 计划的批维度是固定的，整块缓冲区都参与计算
    let mut values: TVec<TValue> = tvec![];
    for name in &self.inputs {
      let desc = &self.descs[name];
      if desc.dtype != DataType::Float {
        return Err(BackendError::UnsupportedType(desc.dtype));
      }
      let mut bytes = vec![0u8; desc.row_bytes() * self.batch];
      self.memory.read(self.binding(name)?, 0, &mut bytes)?;
      let mut shape = vec![self.batch];
      shape.extend_from_slice(&desc.shape);
      let tensor = Tensor::from_shape::<f32>(&shape, &bytes_to_f32(&bytes)).map_err(compute_error)?;
      values.push(tensor.into());
    }

    let results = plan.run(values).map_err(compute_error)?;

    for (name, value) in self.outputs.iter().zip(results) {
      let ptr = match self.bindings.get(name) {
        Some(ptr) => *ptr,
        // 未绑定的输出直接丢弃
        None => continue,
      };
      let tensor = value.into_tensor();
      let data = tensor.as_slice::<f32>().map_err(compute_error)?;
      self.memory.write(ptr, 0, &f32_to_bytes(data))?;
    }
    Ok(())
  }

  fn synchronize(&mut self) -> Result<(), BackendError> {
    Ok(())
  }
}
