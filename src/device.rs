// 该文件是 Renlian （人脸） 项目的一部分。
// src/device.rs - 设备内存分配
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

use std::{collections::HashMap, fmt};

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::TensorDesc;

mod host;
pub use self::host::{HostAllocator, HostMemory};

/// 设备地址，不可为空
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(u64);

impl DevicePtr {
  pub const fn new(addr: u64) -> Self {
    Self(addr)
  }

  pub const fn addr(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for DevicePtr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
  #[error("设备内存不足: 申请 {0} 字节")]
  OutOfMemory(u64),
  #[error("无效的设备地址: {0}")]
  InvalidAddress(DevicePtr),
  #[error("设备内存越界访问: 地址 {ptr}, 偏移 {offset}, 长度 {len}, 块大小 {size}")]
  OutOfBounds {
    ptr: DevicePtr,
    offset: usize,
    len: usize,
    size: usize,
  },
}

/// 设备内存分配器
///
/// `allocate` 失败时返回 `None`，调用方不应重试。
pub trait DeviceAllocator: Send {
  fn allocate(&mut self, size: u64, alignment: u64) -> Option<DevicePtr>;
  fn free(&mut self, ptr: DevicePtr) -> bool;
}

impl<A: DeviceAllocator + ?Sized> DeviceAllocator for Box<A> {
  fn allocate(&mut self, size: u64, alignment: u64) -> Option<DevicePtr> {
    (**self).allocate(size, alignment)
  }

  fn free(&mut self, ptr: DevicePtr) -> bool {
    (**self).free(ptr)
  }
}

/// 绑定到某个张量的设备缓冲区，按编译批大小分配
#[derive(Debug)]
pub struct DeviceBuffer {
  ptr: DevicePtr,
  size: u64,
  desc: TensorDesc,
}

impl DeviceBuffer {
  pub fn new(ptr: DevicePtr, size: u64, desc: TensorDesc) -> Self {
    Self { ptr, size, desc }
  }

  pub fn ptr(&self) -> DevicePtr {
    self.ptr
  }

  /// 缓冲区总字节数
  pub fn size(&self) -> u64 {
    self.size
  }

  pub fn desc(&self) -> &TensorDesc {
    &self.desc
  }

  /// 单个批次行的字节数
  pub fn row_bytes(&self) -> usize {
    self.desc.row_bytes()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationAction {
  Allocate,
  Deallocate,
}

impl AllocationAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      AllocationAction::Allocate => "allocate",
      AllocationAction::Deallocate => "deallocate",
    }
  }
}

/// 分配事件，`total` 为事件发生后仍在使用的字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEvent {
  pub action: AllocationAction,
  pub size: u64,
  pub address: DevicePtr,
  pub total: u64,
}

impl AllocationEvent {
  fn emit(&self) {
    info!(
      target: "renlian::device",
      action = self.action.as_str(),
      size = self.size,
      address = %self.address,
      total = self.total,
      "{} {} at {}, total {} in use",
      match self.action {
        AllocationAction::Allocate => "已分配",
        AllocationAction::Deallocate => "已释放",
      },
      format_size(self.size),
      self.address,
      format_size(self.total),
    );
  }
}

/// 记录存活分配的分配器包装
///
/// 维护地址到大小的映射以及存活字节总数，每次分配/释放都会发出一条事件。
/// 析构时释放所有尚未释放的内存。簿记映射不是线程安全的，共享时需外部加锁。
pub struct TrackedAllocator<A: DeviceAllocator> {
  inner: A,
  live: HashMap<DevicePtr, u64>,
  total: u64,
  last_event: Option<AllocationEvent>,
}

impl<A: DeviceAllocator> TrackedAllocator<A> {
  pub fn new(inner: A) -> Self {
    Self {
      inner,
      live: HashMap::new(),
      total: 0,
      last_event: None,
    }
  }

  pub fn live_bytes(&self) -> u64 {
    self.total
  }

  pub fn live_allocations(&self) -> usize {
    self.live.len()
  }

  pub fn last_event(&self) -> Option<&AllocationEvent> {
    self.last_event.as_ref()
  }

  fn record(&mut self, action: AllocationAction, size: u64, address: DevicePtr) {
    self.total = match action {
      AllocationAction::Allocate => self.total + size,
      AllocationAction::Deallocate => self.total.saturating_sub(size),
    };
    let event = AllocationEvent {
      action,
      size,
      address,
      total: self.total,
    };
    event.emit();
    self.last_event = Some(event);
  }
}

impl<A: DeviceAllocator> DeviceAllocator for TrackedAllocator<A> {
  fn allocate(&mut self, size: u64, alignment: u64) -> Option<DevicePtr> {
    match self.inner.allocate(size, alignment) {
      Some(ptr) => {
        self.live.insert(ptr, size);
        self.record(AllocationAction::Allocate, size, ptr);
        Some(ptr)
      }
      None => {
        warn!(target: "renlian::device", size, "设备内存分配失败: {}", format_size(size));
        None
      }
    }
  }

  fn free(&mut self, ptr: DevicePtr) -> bool {
    let released = self.inner.free(ptr);
    if let Some(size) = self.live.remove(&ptr) {
      self.record(AllocationAction::Deallocate, size, ptr);
    }
    released
  }
}

impl<A: DeviceAllocator> Drop for TrackedAllocator<A> {
  fn drop(&mut self) {
    let outstanding: Vec<DevicePtr> = self.live.keys().copied().collect();
    for ptr in outstanding {
      self.free(ptr);
    }
  }
}

/// 以 B / KiB / MiB / GiB 格式化字节数
pub fn format_size(size: u64) -> String {
  const KIB: u64 = 1 << 10;
  const MIB: u64 = 1 << 20;
  const GIB: u64 = 1 << 30;

  if size < KIB {
    format!("{} Bytes", size)
  } else if size < MIB {
    format!("{:.2} KiB", size as f64 / KIB as f64)
  } else if size < GIB {
    format!("{:.2} MiB", size as f64 / MIB as f64)
  } else {
    format!("{:.2} GiB", size as f64 / GIB as f64)
  }
}
