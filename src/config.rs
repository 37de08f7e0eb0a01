// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 批处理参数与配置文件
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
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const DEFAULT_CHUNK_SIZE: usize = 50;
/// 单次请求过大容易触及传输层限制，默认上限可通过配置调整
pub const DEFAULT_CHUNK_CEILING: usize = 100;
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("置信度阈值必须位于 (0, 1] 区间, 实际为 {0}")]
  InvalidConfidence(f32),
  #[error("分块大小必须为正整数")]
  InvalidChunkSize,
  #[error("分块上限必须为正整数")]
  InvalidChunkCeiling,
  #[error("工作线程数必须为正整数")]
  InvalidWorkers,
  #[error("推理并发数必须为正整数")]
  InvalidDetectConcurrency,
  #[error("无法创建工作线程池: {0}")]
  ThreadPool(String),
  #[error("配置文件读取失败: {0}")]
  ReadError(String),
  #[error("配置文件解析失败: {0}")]
  ParseError(String),
}

/// 已校验的置信度阈值，取值范围 (0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Confidence(f32);

impl Confidence {
  pub fn new(value: f32) -> Result<Self, ConfigError> {
    if value.is_nan() || value <= 0.0 || value > 1.0 {
      return Err(ConfigError::InvalidConfidence(value));
    }
    Ok(Self(value))
  }

  pub fn get(self) -> f32 {
    self.0
  }
}

impl Default for Confidence {
  fn default() -> Self {
    Self(DEFAULT_CONFIDENCE)
  }
}

/// 进程级的批处理策略，启动时确定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
  pub chunk_ceiling: usize,
  /// 分块内的工作线程数
  pub workers: usize,
  /// 同时进入检测能力的调用数
  pub detect_concurrency: usize,
}

impl Default for BatchPolicy {
  fn default() -> Self {
    Self {
      chunk_ceiling: DEFAULT_CHUNK_CEILING,
      workers: 1,
      detect_concurrency: 1,
    }
  }
}

impl BatchPolicy {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.chunk_ceiling == 0 {
      return Err(ConfigError::InvalidChunkCeiling);
    }
    if self.workers == 0 {
      return Err(ConfigError::InvalidWorkers);
    }
    if self.detect_concurrency == 0 {
      return Err(ConfigError::InvalidDetectConcurrency);
    }
    Ok(())
  }

  /// 超过上限的分块大小被压到上限
  pub fn effective_chunk_size(&self, requested: usize) -> Result<usize, ConfigError> {
    self.validate()?;
    if requested == 0 {
      return Err(ConfigError::InvalidChunkSize);
    }
    if requested > self.chunk_ceiling {
      warn!(
        "分块大小 {} 超过上限 {}，已调整为 {}",
        requested, self.chunk_ceiling, self.chunk_ceiling
      );
      return Ok(self.chunk_ceiling);
    }
    Ok(requested)
  }
}

/// 单次批处理请求的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchOptions {
  pub confidence: f32,
  pub chunk_size: usize,
  pub deadline: Option<Duration>,
}

impl Default for BatchOptions {
  fn default() -> Self {
    Self {
      confidence: DEFAULT_CONFIDENCE,
      chunk_size: DEFAULT_CHUNK_SIZE,
      deadline: None,
    }
  }
}

impl BatchOptions {
  pub fn with_confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
    self.chunk_size = chunk_size;
    self
  }

  pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
    self.deadline = deadline;
    self
  }
}

/// 配置文件中的 `[batch]` 表
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
  pub confidence: Option<f32>,
  pub chunk_size: Option<usize>,
  pub chunk_ceiling: Option<usize>,
  pub workers: Option<usize>,
  pub detect_concurrency: Option<usize>,
  pub deadline_secs: Option<u64>,
  pub max_file_size_mb: Option<u64>,
}

/// TOML 配置文件，所有字段可选，命令行参数优先
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
  pub workdir: Option<PathBuf>,
  pub labels: Option<PathBuf>,
  pub font: Option<PathBuf>,
  #[serde(default)]
  pub batch: BatchSettings,
}

impl Settings {
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    info!("加载配置文件: {}", path.display());
    let content =
      std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
    Self::from_toml_str(&content)
  }
}
