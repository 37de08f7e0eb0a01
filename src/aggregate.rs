// 该文件是 Shanan （山南西风） 项目的一部分。
// src/aggregate.rs - 结果统计
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

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
  config::Confidence,
  model::round_confidence,
  result::{BatchStatus, BatchSummary, ChunkResult, ChunkStats, ImageOutcome},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregate {
  pub total_images: usize,
  pub total_detections: usize,
  pub per_class_counts: BTreeMap<String, usize>,
  pub avg_detections_per_image: f64,
}

/// 纯函数：只统计成功结果中的检测，跳过与失败的图像仍计入总数
pub fn aggregate(outcomes: &[ImageOutcome]) -> Aggregate {
  let mut per_class_counts = BTreeMap::new();
  let mut total_detections = 0usize;
  for detection in outcomes.iter().flat_map(ImageOutcome::detections) {
    total_detections += 1;
    *per_class_counts.entry(detection.class_name.clone()).or_insert(0) += 1;
  }

  let total_images = outcomes.len();
  Aggregate {
    total_images,
    total_detections,
    per_class_counts,
    avg_detections_per_image: total_detections as f64 / total_images.max(1) as f64,
  }
}

/// 逐块累积结果，运行中的统计随每个分块增量更新
#[derive(Debug, Clone, Default)]
pub struct BatchAccumulator {
  confidence: Confidence,
  chunk_size: usize,
  chunks: Vec<ChunkStats>,
  outcomes: Vec<ImageOutcome>,
  totals: Aggregate,
}

impl BatchAccumulator {
  pub fn new(confidence: Confidence, chunk_size: usize) -> Self {
    Self {
      confidence,
      chunk_size,
      ..Self::default()
    }
  }

  pub fn push(&mut self, chunk: ChunkResult) -> ChunkStats {
    let stats = chunk.stats();
    for detection in chunk.outcomes.iter().flat_map(ImageOutcome::detections) {
      *self.totals.per_class_counts.entry(detection.class_name.clone()).or_insert(0) += 1;
    }
    self.totals.total_images += stats.images;
    self.totals.total_detections += stats.detections;
    self.totals.avg_detections_per_image =
      self.totals.total_detections as f64 / self.totals.total_images.max(1) as f64;

    self.chunks.push(stats);
    self.outcomes.extend(chunk.outcomes);
    stats
  }

  pub fn chunks(&self) -> &[ChunkStats] {
    &self.chunks
  }

  pub fn outcomes(&self) -> &[ImageOutcome] {
    &self.outcomes
  }

  pub fn snapshot(&self) -> &Aggregate {
    &self.totals
  }

  pub fn finish(
    self,
    batch_id: String,
    status: BatchStatus,
    pending_images: usize,
    timestamp: String,
  ) -> BatchSummary {
    let Aggregate {
      total_images,
      total_detections,
      per_class_counts,
      avg_detections_per_image,
    } = self.totals;

    BatchSummary {
      batch_id,
      status,
      confidence_threshold: round_confidence(self.confidence.get()),
      chunk_size: self.chunk_size,
      total_images,
      pending_images,
      total_detections,
      avg_detections_per_image,
      per_class_counts,
      chunks: self.chunks,
      images: self.outcomes,
      timestamp,
    }
  }
}
