// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/gate.rs - 推理调用并发闸门
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

use std::sync::{Condvar, Mutex, MutexGuard};

/// 计数闸门，容量为 1 时即单飞
#[derive(Debug)]
pub struct Gate {
  available: Mutex<usize>,
  released: Condvar,
  capacity: usize,
}

pub struct Permit<'a> {
  gate: &'a Gate,
}

impl Gate {
  pub fn new(capacity: usize) -> Self {
    Self {
      available: Mutex::new(capacity),
      released: Condvar::new(),
      capacity,
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn acquire(&self) -> Permit<'_> {
    let mut available = self.lock();
    while *available == 0 {
      available = self
        .released
        .wait(available)
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
    *available -= 1;
    Permit { gate: self }
  }

  // 许可在 panic 路径上同样归还，锁中毒不影响计数
  fn lock(&self) -> MutexGuard<'_, usize> {
    self
      .available
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl Drop for Permit<'_> {
  fn drop(&mut self) {
    let mut available = self.gate.lock();
    *available += 1;
    drop(available);
    self.gate.released.notify_one();
  }
}
