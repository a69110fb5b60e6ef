// 该文件是 Renlian （人脸） 项目的一部分。
// src/device/host.rs - 主机内存模拟的设备
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
  collections::BTreeMap,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::device::{DeviceAllocator, DeviceError, DevicePtr};

// 地址 0 保留为空地址
const BASE_ADDRESS: u64 = 0x1000;

#[derive(Debug)]
struct HostArena {
  next: u64,
  used: u64,
  capacity: Option<u64>,
  blocks: BTreeMap<u64, Box<[u8]>>,
}

/// 主机内存上的“设备”地址空间
///
/// 供 CPU 执行后端使用：分配器在其中分配块，后端通过地址读写。
#[derive(Debug, Clone)]
pub struct HostMemory {
  arena: Arc<Mutex<HostArena>>,
}

impl Default for HostMemory {
  fn default() -> Self {
    Self::new()
  }
}

impl HostMemory {
  pub fn new() -> Self {
    Self::with_limit(None)
  }

  /// 限制可分配的总字节数
  pub fn with_capacity(capacity: u64) -> Self {
    Self::with_limit(Some(capacity))
  }

  fn with_limit(capacity: Option<u64>) -> Self {
    Self {
      arena: Arc::new(Mutex::new(HostArena {
        next: BASE_ADDRESS,
        used: 0,
        capacity,
        blocks: BTreeMap::new(),
      })),
    }
  }

  fn arena(&self) -> MutexGuard<'_, HostArena> {
    self.arena.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn used_bytes(&self) -> u64 {
    self.arena().used
  }

  fn allocate(&self, size: u64, alignment: u64) -> Option<DevicePtr> {
    let mut arena = self.arena();
    if let Some(capacity) = arena.capacity
      && arena.used + size > capacity
    {
      return None;
    }

    let alignment = alignment.max(1);
    let addr = arena.next.div_ceil(alignment) * alignment;
    // 零字节分配仍占用一个地址
    arena.next = addr + size.max(1);
    arena.used += size;
    arena
      .blocks
      .insert(addr, vec![0u8; size as usize].into_boxed_slice());
    Some(DevicePtr::new(addr))
  }

  fn free(&self, ptr: DevicePtr) -> bool {
    let mut arena = self.arena();
    match arena.blocks.remove(&ptr.addr()) {
      Some(block) => {
        arena.used -= block.len() as u64;
        true
      }
      None => false,
    }
  }

  /// 从主机切片写入设备块的 `offset` 处
  pub fn write(&self, ptr: DevicePtr, offset: usize, src: &[u8]) -> Result<(), DeviceError> {
    let mut arena = self.arena();
    let block = arena
      .blocks
      .get_mut(&ptr.addr())
      .ok_or(DeviceError::InvalidAddress(ptr))?;
    let size = block.len();
    let dst = block
      .get_mut(offset..offset + src.len())
      .ok_or(DeviceError::OutOfBounds {
        ptr,
        offset,
        len: src.len(),
        size,
      })?;
    dst.copy_from_slice(src);
    Ok(())
  }

  /// 从设备块的 `offset` 处读到主机切片
  pub fn read(&self, ptr: DevicePtr, offset: usize, dst: &mut [u8]) -> Result<(), DeviceError> {
    let arena = self.arena();
    let block = arena
      .blocks
      .get(&ptr.addr())
      .ok_or(DeviceError::InvalidAddress(ptr))?;
    let src = block
      .get(offset..offset + dst.len())
      .ok_or(DeviceError::OutOfBounds {
        ptr,
        offset,
        len: dst.len(),
        size: block.len(),
      })?;
    dst.copy_from_slice(src);
    Ok(())
  }
}

/// 在 [`HostMemory`] 中分配的分配器
#[derive(Debug, Clone)]
pub struct HostAllocator {
  memory: HostMemory,
}

impl HostAllocator {
  pub fn new(memory: HostMemory) -> Self {
    Self { memory }
  }

  pub fn memory(&self) -> &HostMemory {
    &self.memory
  }
}

impl DeviceAllocator for HostAllocator {
  fn allocate(&mut self, size: u64, alignment: u64) -> Option<DevicePtr> {
    self.memory.allocate(size, alignment)
  }

  fn free(&mut self, ptr: DevicePtr) -> bool {
    self.memory.free(ptr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocations_respect_alignment() {
    let mut allocator = HostAllocator::new(HostMemory::new());
    allocator.allocate(3, 0).unwrap();
    let aligned = allocator.allocate(8, 256).unwrap();
    assert_eq!(aligned.addr() % 256, 0);
    assert_ne!(aligned.addr(), 0);
  }

  #[test]
  fn write_then_read_round_trips_through_the_block() {
    let memory = HostMemory::new();
    let mut allocator = HostAllocator::new(memory.clone());
    let ptr = allocator.allocate(8, 0).unwrap();

    memory.write(ptr, 4, &[1, 2, 3, 4]).unwrap();
    let mut out = [0u8; 8];
    memory.read(ptr, 0, &mut out).unwrap();
    assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
  }

  #[test]
  fn out_of_bounds_access_is_rejected() {
    let memory = HostMemory::new();
    let mut allocator = HostAllocator::new(memory.clone());
    let ptr = allocator.allocate(4, 0).unwrap();

    let err = memory.write(ptr, 2, &[0; 4]).unwrap_err();
    assert!(matches!(err, DeviceError::OutOfBounds { size: 4, .. }));
    assert!(allocator.free(ptr));
    assert!(!allocator.free(ptr));
    assert_eq!(
      memory.read(ptr, 0, &mut [0; 1]).unwrap_err(),
      DeviceError::InvalidAddress(ptr)
    );
  }

  #[test]
  fn capacity_limit_refuses_large_requests() {
    let mut allocator = HostAllocator::new(HostMemory::with_capacity(16));
    assert!(allocator.allocate(12, 0).is_some());
    assert!(allocator.allocate(8, 0).is_none());
  }
}
