// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task/chunk.rs - 单个分块的处理
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
  path::PathBuf,
  time::Instant,
};

use image::DynamicImage;
use rayon::{ThreadPool, prelude::*};
use tracing::{debug, error, info, warn};

use crate::{
  config::Confidence,
  input::{ImageValidator, UploadedImage},
  model::{DetectInput, Detection, DetectionAdapter, Detector, panic_message},
  output::{Annotator, annotated_target},
  result::{ChunkResult, ImageOutcome},
  storage::WorkStore,
};

/// 依次执行 落盘 → 校验 → 检测 → 标注 → 记录，单张图像的失败不影响其他图像。
///
/// 给定线程池时分块内并行，结果仍按输入顺序排列；进入检测能力的并发由适配层的闸门控制。
pub struct ChunkProcessor<'a, D> {
  adapter: &'a DetectionAdapter<D>,
  validator: &'a ImageValidator,
  annotator: &'a Annotator,
  store: &'a WorkStore,
  pool: Option<&'a ThreadPool>,
}

impl<'a, D: Detector + Sync> ChunkProcessor<'a, D> {
  pub fn new(
    adapter: &'a DetectionAdapter<D>,
    validator: &'a ImageValidator,
    annotator: &'a Annotator,
    store: &'a WorkStore,
  ) -> Self {
    Self {
      adapter,
      validator,
      annotator,
      store,
      pool: None,
    }
  }

  pub fn with_pool(mut self, pool: Option<&'a ThreadPool>) -> Self {
    self.pool = pool;
    self
  }

  pub fn process_chunk(&self, sequence: usize, images: &[UploadedImage], confidence: Confidence) -> ChunkResult {
    let now = Instant::now();
    let outcomes = match self.pool {
      Some(pool) if images.len() > 1 => pool.install(|| {
        images
          .par_iter()
          .map(|image| self.process_guarded(image, confidence))
          .collect()
      }),
      _ => images
        .iter()
        .map(|image| self.process_guarded(image, confidence))
        .collect(),
    };
    debug!("第 {} 块处理完成，耗时: {:.2?}", sequence, now.elapsed());

    ChunkResult { sequence, outcomes }
  }

  fn process_guarded(&self, image: &UploadedImage, confidence: Confidence) -> ImageOutcome {
    match catch_unwind(AssertUnwindSafe(|| self.process_image(image, confidence))) {
      Ok(outcome) => outcome,
      Err(panic) => {
        let reason = panic_message(panic.as_ref());
        error!("{}: 处理过程异常: {}", image.filename, reason);
        ImageOutcome::DetectionFailed {
          filename: image.filename.clone(),
          reason,
        }
      }
    }
  }

  fn process_image(&self, image: &UploadedImage, confidence: Confidence) -> ImageOutcome {
    let filename = image.filename.clone();

    let path = match self.store.save_upload(&image.filename, &image.bytes) {
      Ok(path) => path,
      Err(e) => {
        warn!("{}: 保存上传文件失败: {}", filename, e);
        return ImageOutcome::DetectionFailed {
          filename,
          reason: format!("storage_error: {}", e),
        };
      }
    };

    let Some(decoded) = self.validator.decode(image) else {
      warn!("{}: 图像无法读取，跳过", filename);
      return ImageOutcome::SkippedUnreadable { filename };
    };

    let input = DetectInput {
      filename: &image.filename,
      path: &path,
      bytes: &image.bytes,
      image: &decoded,
    };
    let detections = match self.adapter.detect(&input, confidence) {
      Ok(detections) => detections,
      Err(e) => {
        warn!("{}", e);
        return ImageOutcome::DetectionFailed {
          filename,
          reason: e.cause,
        };
      }
    };

    let annotated_ref = self.annotate(&image.filename, &decoded, &detections);
    info!(
      "{}: 检测到 {} 个对象{}",
      filename,
      detections.len(),
      if annotated_ref.is_some() { "" } else { "（无标注图像）" }
    );

    ImageOutcome::Success {
      filename,
      detections,
      annotated_ref,
    }
  }

  // 标注失败只记录日志，不影响检测结果
  fn annotate(&self, filename: &str, decoded: &DynamicImage, detections: &[Detection]) -> Option<PathBuf> {
    let (target, format) = annotated_target(filename);
    let encoded = match self.annotator.render(decoded, detections, format) {
      Ok(encoded) => encoded,
      Err(e) => {
        warn!("{}: {}", filename, e);
        return None;
      }
    };

    match self.store.save_output(&target, &encoded.bytes) {
      Ok(reference) => Some(reference),
      Err(e) => {
        warn!("{}: 保存标注图像失败: {}", filename, e);
        None
      }
    }
  }
}
