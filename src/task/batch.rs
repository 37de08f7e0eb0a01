// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task/batch.rs - 批次调度
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
  borrow::Cow,
  ops::Range,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Instant,
};

use chrono::Local;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, info, warn};

use crate::{
  aggregate::{Aggregate, BatchAccumulator},
  config::{BatchOptions, BatchPolicy, Confidence, ConfigError},
  error::BatchError,
  input::{ImageValidator, UploadCandidate, UploadedImage},
  label::ClassCatalog,
  model::{DetectionAdapter, Detector},
  output::{Annotator, Draw},
  result::{BatchStatus, BatchSummary, ChunkStats},
  storage::WorkStore,
};

static BATCH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `batch_<日期>_<时间>_<序号>`，同一进程内不会重复
pub fn next_batch_id() -> String {
  let sequence = BATCH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
  format!("batch_{}_{:04}", Local::now().format("%Y%m%d_%H%M%S"), sequence)
}

pub fn chunk_count(total: usize, chunk_size: usize) -> usize {
  if chunk_size == 0 {
    return 0;
  }
  total.div_ceil(chunk_size)
}

/// 每个分块完成后交给观察者的进度
#[derive(Debug, Clone)]
pub struct BatchProgress<'a> {
  pub batch_id: &'a str,
  pub chunk: ChunkStats,
  pub total_chunks: usize,
  /// 截至当前分块的累计统计
  pub aggregate: &'a Aggregate,
}

pub struct BatchCoordinator<D> {
  adapter: DetectionAdapter<D>,
  validator: ImageValidator,
  annotator: Annotator,
  store: WorkStore,
  policy: BatchPolicy,
  pool: Option<ThreadPool>,
}

impl<D: Detector + Sync> BatchCoordinator<D> {
  pub fn new(
    detector: D,
    catalog: Arc<ClassCatalog>,
    draw: Draw,
    store: WorkStore,
    policy: BatchPolicy,
  ) -> Result<Self, ConfigError> {
    policy.validate()?;
    let pool = if policy.workers > 1 {
      let pool = ThreadPoolBuilder::new()
        .num_threads(policy.workers)
        .thread_name(|index| format!("shanan-batch-{}", index))
        .build()
        .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;
      Some(pool)
    } else {
      None
    };

    Ok(Self {
      adapter: DetectionAdapter::new(detector, catalog.clone(), policy.detect_concurrency),
      validator: ImageValidator::default(),
      annotator: Annotator::new(draw, catalog),
      store,
      policy,
      pool,
    })
  }

  pub fn with_validator(mut self, validator: ImageValidator) -> Self {
    self.validator = validator;
    self
  }

  pub fn detector(&self) -> &D {
    self.adapter.detector()
  }

  pub fn store(&self) -> &WorkStore {
    &self.store
  }

  pub fn policy(&self) -> &BatchPolicy {
    &self.policy
  }

  pub fn run_batch(&self, images: &[UploadedImage], options: &BatchOptions) -> Result<BatchSummary, BatchError> {
    let stop = AtomicBool::new(false);
    self.run_batch_with_progress(images, options, &stop, |_| {})
  }

  /// 按输入顺序逐块处理已在内存中的图像。
  ///
  /// 截止时间、停止标志与工作目录只在分块之间检查，已开始的分块总会完成。
  /// 工作目录在首个分块前失效时不返回部分结果。
  pub fn run_batch_with_progress<F>(
    &self,
    images: &[UploadedImage],
    options: &BatchOptions,
    stop: &AtomicBool,
    observer: F,
  ) -> Result<BatchSummary, BatchError>
  where
    F: FnMut(&BatchProgress<'_>),
  {
    self.run_chunks(images.len(), |range| Cow::Borrowed(&images[range]), options, stop, observer)
  }

  /// 与 [`Self::run_batch_with_progress`] 相同，但文件内容在所属分块开始前才读取，
  /// 内存中最多保留一个分块的图像。
  pub fn run_files_with_progress<F>(
    &self,
    files: &[UploadCandidate],
    options: &BatchOptions,
    stop: &AtomicBool,
    observer: F,
  ) -> Result<BatchSummary, BatchError>
  where
    F: FnMut(&BatchProgress<'_>),
  {
    self.run_chunks(
      files.len(),
      |range| Cow::Owned(files[range].iter().map(UploadCandidate::load).collect()),
      options,
      stop,
      observer,
    )
  }

  fn run_chunks<'s, L, F>(
    &self,
    total: usize,
    mut load: L,
    options: &BatchOptions,
    stop: &AtomicBool,
    mut observer: F,
  ) -> Result<BatchSummary, BatchError>
  where
    L: FnMut(Range<usize>) -> Cow<'s, [UploadedImage]>,
    F: FnMut(&BatchProgress<'_>),
  {
    let confidence = Confidence::new(options.confidence)?;
    let chunk_size = self.policy.effective_chunk_size(options.chunk_size)?;

    self.store.check_root().map_err(|source| {
      error!("工作目录不可用: {}", source);
      BatchError::StorageUnavailable { source, partial: None }
    })?;

    let batch_id = next_batch_id();
    let total_chunks = chunk_count(total, chunk_size);
    info!(
      "{}: 共 {} 张图像，分为 {} 块，每块最多 {} 张，置信度阈值 {}",
      batch_id,
      total,
      total_chunks,
      chunk_size,
      confidence.get()
    );

    let processor = super::ChunkProcessor::new(&self.adapter, &self.validator, &self.annotator, &self.store)
      .with_pool(self.pool.as_ref());
    let started = Instant::now();
    let mut accumulator = BatchAccumulator::new(confidence, chunk_size);
    let mut processed = 0usize;
    let mut status = BatchStatus::Complete;

    for (index, start) in (0..total).step_by(chunk_size).enumerate() {
      let sequence = index + 1;

      if let Some(deadline) = options.deadline
        && started.elapsed() >= deadline
      {
        warn!("{}: 超过截止时间 {:.2?}，第 {} 块起未处理", batch_id, deadline, sequence);
        status = BatchStatus::DeadlineExceeded;
        break;
      }
      if stop.load(Ordering::SeqCst) {
        warn!("{}: 收到停止请求，第 {} 块起未处理", batch_id, sequence);
        status = BatchStatus::Interrupted;
        break;
      }
      if let Err(source) = self.store.check_root() {
        error!("{}: 工作目录不可用，第 {} 块起未处理: {}", batch_id, sequence, source);
        let partial = accumulator.finish(
          batch_id,
          BatchStatus::StorageUnavailable,
          total - processed,
          Local::now().to_rfc3339(),
        );
        return Err(BatchError::StorageUnavailable {
          source,
          partial: (index > 0).then(|| Box::new(partial)),
        });
      }

      let chunk = load(start..(start + chunk_size).min(total));
      let result = processor.process_chunk(sequence, &chunk, confidence);
      drop(chunk);
      processed += result.len();
      let stats = accumulator.push(result);
      info!(
        "{}: 第 {}/{} 块完成，{} 张图像，{} 个检测，{} 张跳过，{} 张失败",
        batch_id, sequence, total_chunks, stats.images, stats.detections, stats.skipped, stats.failed
      );

      observer(&BatchProgress {
        batch_id: &batch_id,
        chunk: stats,
        total_chunks,
        aggregate: accumulator.snapshot(),
      });
    }

    let summary = accumulator.finish(batch_id, status, total - processed, Local::now().to_rfc3339());
    info!(
      "{}: 处理了 {} 张图像，共 {} 个检测，平均每张 {:.2} 个，耗时 {:.2?}",
      summary.batch_id,
      summary.total_images,
      summary.total_detections,
      summary.avg_detections_per_image,
      started.elapsed()
    );
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::{DetectInput, RawDetection},
    result::ImageOutcome,
  };
  use image::{DynamicImage, ImageFormat, RgbImage};
  use std::{io::Cursor, time::Duration};
  use tempfile::TempDir;

  struct OnePerImage;

  impl Detector for OnePerImage {
    type Error = String;

    fn detect(&self, _input: &DetectInput<'_>, _confidence: f32) -> Result<Vec<RawDetection>, String> {
      Ok(vec![RawDetection {
        class_id: 0,
        confidence: 0.8,
        bbox: Some([0.0, 0.0, 4.0, 4.0]),
      }])
    }
  }

  fn images(count: usize) -> Vec<UploadedImage> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::new(8, 8))
      .write_to(&mut buffer, ImageFormat::Png)
      .unwrap();
    let bytes = buffer.into_inner();
    (0..count)
      .map(|i| UploadedImage::new(format!("img_{}.png", i), bytes.clone()))
      .collect()
  }

  fn coordinator(dir: &TempDir, policy: BatchPolicy) -> BatchCoordinator<OnePerImage> {
    BatchCoordinator::new(
      OnePerImage,
      Arc::new(ClassCatalog::default()),
      Draw::default(),
      WorkStore::open(dir.path()).unwrap(),
      policy,
    )
    .unwrap()
  }

  #[test]
  fn counts_chunks() {
    assert_eq!(chunk_count(7, 3), 3);
    assert_eq!(chunk_count(6, 3), 2);
    assert_eq!(chunk_count(0, 50), 0);
    assert_eq!(chunk_count(5, 0), 0);
  }

  #[test]
  fn batch_ids_are_unique() {
    let a = next_batch_id();
    let b = next_batch_id();
    assert!(a.starts_with("batch_"));
    assert_ne!(a, b);
  }

  #[test]
  fn splits_into_ordered_chunks() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir, BatchPolicy::default());
    let input = images(7);

    let mut seen = Vec::new();
    let stop = AtomicBool::new(false);
    let summary = coordinator
      .run_batch_with_progress(&input, &BatchOptions::default().with_chunk_size(3), &stop, |p| {
        assert_eq!(p.total_chunks, 3);
        seen.push((p.chunk.chunk_number, p.chunk.images, p.aggregate.total_images));
      })
      .unwrap();

    assert_eq!(seen, [(1, 3, 3), (2, 3, 6), (3, 1, 7)]);
    assert_eq!(summary.status, BatchStatus::Complete);
    assert_eq!(summary.total_images, 7);
    assert_eq!(summary.pending_images, 0);
    assert_eq!(summary.total_detections, 7);
    assert_eq!(summary.avg_detections_per_image, 1.0);
    assert_eq!(summary.per_class_counts["OxygenTank"], 7);
    let names: Vec<_> = summary.images.iter().map(|o| o.filename().to_string()).collect();
    let expected: Vec<_> = input.iter().map(|i| i.filename.clone()).collect();
    assert_eq!(names, expected);
  }

  #[test]
  fn oversized_chunk_is_clamped() {
    let dir = TempDir::new().unwrap();
    let policy = BatchPolicy {
      chunk_ceiling: 2,
      ..BatchPolicy::default()
    };
    let coordinator = coordinator(&dir, policy);
    let summary = coordinator
      .run_batch(&images(5), &BatchOptions::default().with_chunk_size(500))
      .unwrap();
    assert_eq!(summary.chunks.len(), 3);
    assert!(summary.chunks.iter().all(|c| c.images <= 2));
  }

  #[test]
  fn empty_batch_is_complete() {
    let dir = TempDir::new().unwrap();
    let summary = coordinator(&dir, BatchPolicy::default())
      .run_batch(&[], &BatchOptions::default())
      .unwrap();
    assert_eq!(summary.status, BatchStatus::Complete);
    assert_eq!(summary.total_images, 0);
    assert_eq!(summary.avg_detections_per_image, 0.0);
    assert!(summary.chunks.is_empty());
  }

  #[test]
  fn rejects_invalid_options_before_any_work() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir, BatchPolicy::default());
    for confidence in [0.0, 1.5, f32::NAN] {
      let error = coordinator
        .run_batch(&images(1), &BatchOptions::default().with_confidence(confidence))
        .unwrap_err();
      assert!(matches!(error, BatchError::Config(ConfigError::InvalidConfidence(_))));
    }
    let error = coordinator
      .run_batch(&images(1), &BatchOptions::default().with_chunk_size(0))
      .unwrap_err();
    assert!(matches!(error, BatchError::Config(ConfigError::InvalidChunkSize)));
    assert!(!dir.path().join("uploads/img_0.png").exists());
  }

  #[test]
  fn zero_deadline_leaves_everything_pending() {
    let dir = TempDir::new().unwrap();
    let summary = coordinator(&dir, BatchPolicy::default())
      .run_batch(
        &images(4),
        &BatchOptions::default().with_deadline(Some(Duration::ZERO)),
      )
      .unwrap();
    assert_eq!(summary.status, BatchStatus::DeadlineExceeded);
    assert_eq!(summary.total_images, 0);
    assert_eq!(summary.pending_images, 4);
  }

  #[test]
  fn stop_flag_halts_between_chunks() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir, BatchPolicy::default());
    let stop = AtomicBool::new(false);
    let summary = coordinator
      .run_batch_with_progress(&images(5), &BatchOptions::default().with_chunk_size(2), &stop, |_| {
        stop.store(true, Ordering::SeqCst)
      })
      .unwrap();
    assert_eq!(summary.status, BatchStatus::Interrupted);
    assert_eq!(summary.total_images, 2);
    assert_eq!(summary.pending_images, 3);
  }

  #[test]
  fn invalid_policy_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = BatchCoordinator::new(
      OnePerImage,
      Arc::new(ClassCatalog::default()),
      Draw::default(),
      WorkStore::open(dir.path()).unwrap(),
      BatchPolicy {
        workers: 0,
        ..BatchPolicy::default()
      },
    );
    assert!(matches!(result, Err(ConfigError::InvalidWorkers)));
  }

  #[test]
  fn default_ceiling_splits_large_requests() {
    let dir = TempDir::new().unwrap();
    let summary = coordinator(&dir, BatchPolicy::default())
      .run_batch(&images(250), &BatchOptions::default().with_chunk_size(500))
      .unwrap();
    let sizes: Vec<_> = summary.chunks.iter().map(|c| c.images).collect();
    assert_eq!(sizes, [100, 100, 50]);
    assert_eq!(summary.chunk_size, 100);
    assert_eq!(summary.confidence_threshold, 0.25);
    assert_eq!(summary.total_images, 250);
  }

  #[test]
  fn worker_pool_keeps_order() {
    let dir = TempDir::new().unwrap();
    let policy = BatchPolicy {
      workers: 3,
      detect_concurrency: 2,
      ..BatchPolicy::default()
    };
    let input = images(9);
    let summary = coordinator(&dir, policy)
      .run_batch(&input, &BatchOptions::default().with_chunk_size(4))
      .unwrap();
    let names: Vec<_> = summary.images.iter().map(|o| o.filename().to_string()).collect();
    let expected: Vec<_> = input.iter().map(|i| i.filename.clone()).collect();
    assert_eq!(names, expected);
    assert_eq!(summary.total_detections, 9);
  }

  #[test]
  fn files_are_read_when_their_chunk_starts() {
    let source = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    for image in images(3) {
      std::fs::write(source.path().join(&image.filename), &image.bytes).unwrap();
    }
    let files = crate::input::collect_candidates(source.path(), u64::MAX).unwrap();
    let coordinator = coordinator(&work, BatchPolicy::default());

    // 第一块完成后删除尚未读取的文件
    let stop = AtomicBool::new(false);
    let summary = coordinator
      .run_files_with_progress(&files, &BatchOptions::default().with_chunk_size(2), &stop, |p| {
        if p.chunk.chunk_number == 1 {
          std::fs::remove_file(&files[2].path).unwrap();
        }
      })
      .unwrap();

    assert_eq!(summary.total_images, 3);
    assert!(summary.images[0].is_success());
    assert!(summary.images[1].is_success());
    assert!(matches!(summary.images[2], ImageOutcome::SkippedUnreadable { .. }));
  }
}
