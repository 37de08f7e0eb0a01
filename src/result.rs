// 该文件是 Shanan （山南西风） 项目的一部分。
// src/result.rs - 单图结果、分块结果与批次汇总
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

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Serialize, Serializer, ser::SerializeStruct};

use crate::model::Detection;

pub const UNREADABLE_IMAGE: &str = "unreadable_image";
pub const PREDICT_ERROR_PREFIX: &str = "predict_error:";

/// 每张输入图像恰好对应一个结果
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
  Success {
    filename: String,
    detections: Vec<Detection>,
    annotated_ref: Option<PathBuf>,
  },
  SkippedUnreadable {
    filename: String,
  },
  DetectionFailed {
    filename: String,
    reason: String,
  },
}

impl ImageOutcome {
  pub fn filename(&self) -> &str {
    match self {
      ImageOutcome::Success { filename, .. }
      | ImageOutcome::SkippedUnreadable { filename }
      | ImageOutcome::DetectionFailed { filename, .. } => filename,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, ImageOutcome::Success { .. })
  }

  /// 非成功结果为空切片
  pub fn detections(&self) -> &[Detection] {
    match self {
      ImageOutcome::Success { detections, .. } => detections,
      _ => &[],
    }
  }

  /// 对外稳定的错误标签
  pub fn error_tag(&self) -> Option<String> {
    match self {
      ImageOutcome::Success { .. } => None,
      ImageOutcome::SkippedUnreadable { .. } => Some(UNREADABLE_IMAGE.to_string()),
      ImageOutcome::DetectionFailed { reason, .. } => Some(format!("{}{}", PREDICT_ERROR_PREFIX, reason)),
    }
  }

  pub fn class_counts(&self) -> BTreeMap<String, usize> {
    count_classes(self.detections())
  }
}

pub(crate) fn count_classes(detections: &[Detection]) -> BTreeMap<String, usize> {
  let mut counts = BTreeMap::new();
  for detection in detections {
    *counts.entry(detection.class_name.clone()).or_insert(0) += 1;
  }
  counts
}

impl Serialize for ImageOutcome {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      ImageOutcome::Success {
        filename,
        detections,
        annotated_ref,
      } => {
        let mut state = serializer.serialize_struct("ImageOutcome", 6)?;
        state.serialize_field("status", "success")?;
        state.serialize_field("filename", filename)?;
        state.serialize_field("detections_count", &detections.len())?;
        state.serialize_field("class_counts", &count_classes(detections))?;
        state.serialize_field("detections", detections)?;
        state.serialize_field("annotated_image", &annotated_ref.as_ref().map(|p| reference_string(p)))?;
        state.end()
      }
      ImageOutcome::SkippedUnreadable { filename } | ImageOutcome::DetectionFailed { filename, .. } => {
        let status = if matches!(self, ImageOutcome::SkippedUnreadable { .. }) {
          "skipped"
        } else {
          "failed"
        };
        let mut state = serializer.serialize_struct("ImageOutcome", 3)?;
        state.serialize_field("status", status)?;
        state.serialize_field("filename", filename)?;
        state.serialize_field("error", &self.error_tag())?;
        state.end()
      }
    }
  }
}

// 引用路径统一用正斜杠
fn reference_string(path: &std::path::Path) -> String {
  path
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
  /// 从 1 开始
  pub sequence: usize,
  pub outcomes: Vec<ImageOutcome>,
}

impl ChunkResult {
  pub fn len(&self) -> usize {
    self.outcomes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.outcomes.is_empty()
  }

  pub fn stats(&self) -> ChunkStats {
    let mut stats = ChunkStats {
      chunk_number: self.sequence,
      images: self.outcomes.len(),
      ..ChunkStats::default()
    };
    for outcome in &self.outcomes {
      match outcome {
        ImageOutcome::Success { detections, .. } => stats.detections += detections.len(),
        ImageOutcome::SkippedUnreadable { .. } => stats.skipped += 1,
        ImageOutcome::DetectionFailed { .. } => stats.failed += 1,
      }
    }
    stats
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
  pub chunk_number: usize,
  pub images: usize,
  pub detections: usize,
  pub skipped: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
  Complete,
  /// 截止时间已过，后续分块未启动
  DeadlineExceeded,
  /// 调用方请求停止
  Interrupted,
  /// 工作目录失效，后续分块未启动
  StorageUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
  pub batch_id: String,
  pub status: BatchStatus,
  /// 实际使用的阈值与分块大小，分块大小已按上限调整
  pub confidence_threshold: f64,
  pub chunk_size: usize,
  pub total_images: usize,
  pub pending_images: usize,
  pub total_detections: usize,
  pub avg_detections_per_image: f64,
  pub per_class_counts: BTreeMap<String, usize>,
  pub chunks: Vec<ChunkStats>,
  pub images: Vec<ImageOutcome>,
  pub timestamp: String,
}
