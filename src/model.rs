// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测能力与适配层
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
  panic::{AssertUnwindSafe, catch_unwind},
  path::Path,
  sync::Arc,
  time::Instant,
};

use image::DynamicImage;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::{config::Confidence, label::ClassCatalog};

mod command;
mod gate;
pub use self::command::{CommandDetector, CommandDetectorError};
pub use self::gate::{Gate, Permit};

/// 检测能力的原始输出
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawDetection {
  pub class_id: u32,
  pub confidence: f32,
  #[serde(default)]
  pub bbox: Option<[f32; 4]>, // [x_min, y_min, x_max, y_max]，像素坐标
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub class_id: u32,
  pub class_name: String,
  /// 内部保留完整精度，对外输出时保留三位小数
  #[serde(serialize_with = "serialize_confidence")]
  pub confidence: f32,
  pub bbox: Option<[u32; 4]>,
}

impl Detection {
  pub fn reported_confidence(&self) -> f64 {
    round_confidence(self.confidence)
  }
}

pub(crate) fn round_confidence(confidence: f32) -> f64 {
  (confidence as f64 * 1000.0).round() / 1000.0
}

fn serialize_confidence<S: Serializer>(confidence: &f32, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_f64(round_confidence(*confidence))
}

/// 交给检测能力的单张图像，原始字节、落盘路径与解码结果同时提供
#[derive(Debug, Clone, Copy)]
pub struct DetectInput<'a> {
  pub filename: &'a str,
  pub path: &'a Path,
  pub bytes: &'a [u8],
  pub image: &'a DynamicImage,
}

/// 外部目标检测能力，具体模型可随意替换
pub trait Detector {
  type Error: std::fmt::Display;

  fn detect(&self, input: &DetectInput<'_>, confidence: f32) -> Result<Vec<RawDetection>, Self::Error>;

  fn name(&self) -> &str {
    "detector"
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{filename} 推理失败: {cause}")]
pub struct DetectionError {
  pub filename: String,
  pub cause: String,
}

/// 包装检测能力：限制并发、转换输出、把失败变成类型化错误
pub struct DetectionAdapter<D> {
  detector: D,
  catalog: Arc<ClassCatalog>,
  gate: Gate,
}

impl<D: Detector> DetectionAdapter<D> {
  /// `concurrency` 为同时进入检测能力的调用上限，0 按 1 处理
  pub fn new(detector: D, catalog: Arc<ClassCatalog>, concurrency: usize) -> Self {
    Self {
      detector,
      catalog,
      gate: Gate::new(concurrency.max(1)),
    }
  }

  pub fn detector(&self) -> &D {
    &self.detector
  }

  pub fn catalog(&self) -> &ClassCatalog {
    &self.catalog
  }

  pub fn detect(
    &self,
    input: &DetectInput<'_>,
    confidence: Confidence,
  ) -> Result<Vec<Detection>, DetectionError> {
    let threshold = confidence.get();

    let raw = {
      let _permit = self.gate.acquire();
      let now = Instant::now();
      let result = catch_unwind(AssertUnwindSafe(|| self.detector.detect(input, threshold)));
      debug!(
        "{}: {} 推理耗时 {:.2?}",
        input.filename,
        self.detector.name(),
        now.elapsed()
      );
      match result {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => return Err(self.error(input, e.to_string())),
        Err(panic) => return Err(self.error(input, panic_message(panic.as_ref()))),
      }
    };

    let detections: Vec<Detection> = raw
      .into_iter()
      .filter(|item| item.confidence.is_finite() && item.confidence >= threshold)
      .map(|item| self.convert(item))
      .collect();
    debug!("{}: 检测到 {} 个物体", input.filename, detections.len());
    Ok(detections)
  }

  fn convert(&self, item: RawDetection) -> Detection {
    Detection {
      class_id: item.class_id,
      class_name: self.catalog.name(item.class_id).into_owned(),
      confidence: item.confidence.min(1.0),
      bbox: item.bbox.map(clamp_bbox),
    }
  }

  fn error(&self, input: &DetectInput<'_>, cause: String) -> DetectionError {
    DetectionError {
      filename: input.filename.to_string(),
      cause,
    }
  }
}

/// 坐标截断为非负整数，NaN 记为 0
fn clamp_bbox(bbox: [f32; 4]) -> [u32; 4] {
  bbox.map(|v| if v.is_nan() { 0 } else { v.max(0.0) as u32 })
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    format!("panic: {}", message)
  } else if let Some(message) = panic.downcast_ref::<String>() {
    format!("panic: {}", message)
  } else {
    "panic".to_string()
  }
}
