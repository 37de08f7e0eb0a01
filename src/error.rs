// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 批处理级错误
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

use crate::{config::ConfigError, result::BatchSummary, storage::StorageError};

/// 只有这两类错误会中止整个批次，单图失败都记录在结果中
#[derive(Error, Debug)]
pub enum BatchError {
  #[error("参数错误: {0}")]
  Config(#[from] ConfigError),
  /// `partial` 为已完成分块的汇总，首个分块开始前失败时为 `None`
  #[error("工作目录不可用: {source}")]
  StorageUnavailable {
    source: StorageError,
    partial: Option<Box<BatchSummary>>,
  },
}

impl BatchError {
  pub fn partial(&self) -> Option<&BatchSummary> {
    match self {
      BatchError::StorageUnavailable { partial, .. } => partial.as_deref(),
      BatchError::Config(_) => None,
    }
  }
}
