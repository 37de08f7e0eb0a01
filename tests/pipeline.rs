// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 批量检测端到端测试
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
  io::Cursor,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use shanan_batch::{
  BatchError,
  config::{BatchOptions, BatchPolicy, ConfigError},
  input::{UploadedImage, collect_candidates},
  label::ClassCatalog,
  model::{DetectInput, Detector, RawDetection},
  output::Draw,
  result::{BatchStatus, ImageOutcome},
  storage::WorkStore,
  task::BatchCoordinator,
};

/// 文件名含 `fail` 时报错，否则按图像宽度给出检测
#[derive(Default)]
struct FakeDetector {
  calls: AtomicUsize,
}

impl Detector for FakeDetector {
  type Error = String;

  fn detect(&self, input: &DetectInput<'_>, confidence: f32) -> Result<Vec<RawDetection>, String> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if input.filename.contains("fail") {
      return Err("inference backend unavailable".to_string());
    }
    assert!(input.path.is_file());
    let width = input.image.width() as f32;
    Ok(vec![
      RawDetection {
        class_id: 3,
        confidence: 0.92,
        bbox: Some([2.0, 2.0, width / 2.0, width / 2.0]),
      },
      RawDetection {
        class_id: 6,
        confidence: 0.55,
        bbox: Some([width / 2.0, 4.0, width - 1.0, 20.0]),
      },
      // 低于阈值，不应出现在结果中
      RawDetection {
        class_id: 0,
        confidence: confidence / 2.0,
        bbox: None,
      },
    ])
  }
}

fn encode(format: ImageFormat) -> Vec<u8> {
  let mut buffer = Cursor::new(Vec::new());
  DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([30, 60, 90])))
    .write_to(&mut buffer, format)
    .unwrap();
  buffer.into_inner()
}

fn png(name: &str) -> UploadedImage {
  UploadedImage::new(name, encode(ImageFormat::Png))
}

fn coordinator(dir: &TempDir, policy: BatchPolicy) -> BatchCoordinator<FakeDetector> {
  BatchCoordinator::new(
    FakeDetector::default(),
    Arc::new(ClassCatalog::default()),
    Draw::default(),
    WorkStore::open(dir.path()).unwrap(),
    policy,
  )
  .unwrap()
}

#[test]
fn corrupt_image_is_skipped_without_aborting() {
  let dir = TempDir::new().unwrap();
  let coordinator = coordinator(&dir, BatchPolicy::default());
  let images = vec![
    png("a.png"),
    png("b.png"),
    UploadedImage::new("c.jpg", b"\xFF\xD8\xFF\xE0 truncated".to_vec()),
    png("d.png"),
    png("e.png"),
  ];

  let summary = coordinator.run_batch(&images, &BatchOptions::default()).unwrap();
  assert_eq!(summary.status, BatchStatus::Complete);
  assert_eq!(summary.total_images, 5);
  assert_eq!(summary.images.iter().filter(|o| o.is_success()).count(), 4);
  assert_eq!(
    summary.images[2],
    ImageOutcome::SkippedUnreadable {
      filename: "c.jpg".to_string()
    }
  );
  assert_eq!(summary.total_detections, 8);
  assert_eq!(summary.avg_detections_per_image, 8.0 / 5.0);
  assert_eq!(summary.per_class_counts["FireAlarm"], 4);
  assert_eq!(summary.per_class_counts["FireExtinguisher"], 4);
  assert!(!summary.per_class_counts.contains_key("OxygenTank"));

  // 无法读取的图像不会进入检测
  assert_eq!(coordinator.detector().calls.load(Ordering::SeqCst), 4);
}

#[test]
fn detection_failure_is_tagged() {
  let dir = TempDir::new().unwrap();
  let summary = coordinator(&dir, BatchPolicy::default())
    .run_batch(&[png("ok.png"), png("fail.png")], &BatchOptions::default())
    .unwrap();

  assert!(summary.images[0].is_success());
  assert_eq!(
    summary.images[1].error_tag().as_deref(),
    Some("predict_error:inference backend unavailable")
  );
  assert_eq!(summary.total_images, 2);
  assert_eq!(summary.total_detections, 2);
  assert_eq!(summary.chunks[0].failed, 1);

  let json = serde_json::to_value(&summary).unwrap();
  assert_eq!(json["images"][1]["status"], "failed");
  assert_eq!(json["images"][1]["error"], "predict_error:inference backend unavailable");
  assert_eq!(json["status"], "complete");
  assert_eq!(json["confidence_threshold"], 0.25);
  assert_eq!(json["chunk_size"], 50);
}

#[test]
fn duplicate_filenames_each_get_an_outcome() {
  let dir = TempDir::new().unwrap();
  let coordinator = coordinator(&dir, BatchPolicy::default());
  let summary = coordinator
    .run_batch(
      &[png("same.png"), png("same.png"), png("other.png")],
      &BatchOptions::default().with_chunk_size(1),
    )
    .unwrap();

  let names: Vec<_> = summary.images.iter().map(ImageOutcome::filename).collect();
  assert_eq!(names, ["same.png", "same.png", "other.png"]);
  assert!(summary.images.iter().all(ImageOutcome::is_success));
  assert_eq!(summary.total_images, 3);
  assert_eq!(summary.total_detections, 6);
  assert_eq!(coordinator.detector().calls.load(Ordering::SeqCst), 3);
}

#[test]
fn totals_match_chunks() {
  let dir = TempDir::new().unwrap();
  let mut images: Vec<_> = (0..11).map(|i| png(&format!("site/{:02}.png", i))).collect();
  images[4] = UploadedImage::new("site/04.png", Vec::new());
  images[7] = png("site/fail_07.png");

  let summary = coordinator(&dir, BatchPolicy::default())
    .run_batch(&images, &BatchOptions::default().with_chunk_size(4))
    .unwrap();

  assert_eq!(summary.chunks.len(), 3);
  assert_eq!(summary.chunks.iter().map(|c| c.images).sum::<usize>(), 11);
  assert_eq!(
    summary.chunks.iter().map(|c| c.detections).sum::<usize>(),
    summary.total_detections
  );
  assert_eq!(summary.per_class_counts.values().sum::<usize>(), summary.total_detections);
  assert_eq!(summary.total_images, summary.images.len());
  assert_eq!(summary.total_detections, 9 * 2);
  let names: Vec<_> = summary.images.iter().map(|o| o.filename().to_string()).collect();
  let expected: Vec<_> = images.iter().map(|i| i.filename.clone()).collect();
  assert_eq!(names, expected);
}

#[test]
fn annotated_outputs_are_persisted_and_resolvable() {
  let dir = TempDir::new().unwrap();
  let coordinator = coordinator(&dir, BatchPolicy::default());
  let images = vec![
    png("cam1/a.png"),
    UploadedImage::new("b.jpg", encode(ImageFormat::Jpeg)),
  ];
  let summary = coordinator.run_batch(&images, &BatchOptions::default()).unwrap();

  let json = serde_json::to_value(&summary).unwrap();
  assert_eq!(json["images"][0]["annotated_image"], "outputs/cam1/annotated_a.png");
  assert_eq!(json["images"][1]["annotated_image"], "outputs/annotated_b.jpg");
  assert_eq!(json["images"][0]["detections_count"], 2);
  assert_eq!(json["images"][0]["class_counts"]["FireAlarm"], 1);

  let bytes = coordinator.store().read("outputs/cam1/annotated_a.png").unwrap();
  let annotated = image::load_from_memory(&bytes).unwrap();
  assert_eq!((annotated.width(), annotated.height()), (32, 32));
  // 原图未被改动
  assert_eq!(
    coordinator.store().read("uploads/cam1/a.png").unwrap(),
    images[0].bytes
  );
  assert!(coordinator.store().read("../outside.png").is_err());
}

#[test]
fn zero_deadline_returns_empty_partial_summary() {
  let dir = TempDir::new().unwrap();
  let images: Vec<_> = (0..3).map(|i| png(&format!("{}.png", i))).collect();
  let summary = coordinator(&dir, BatchPolicy::default())
    .run_batch(
      &images,
      &BatchOptions::default().with_deadline(Some(std::time::Duration::ZERO)),
    )
    .unwrap();
  assert_eq!(summary.status, BatchStatus::DeadlineExceeded);
  assert_eq!(summary.total_images, 0);
  assert_eq!(summary.pending_images, 3);
  assert!(summary.images.is_empty());

  let json = serde_json::to_value(&summary).unwrap();
  assert_eq!(json["status"], "deadline_exceeded");
}

#[test]
fn stop_flag_keeps_completed_chunks() {
  let dir = TempDir::new().unwrap();
  let coordinator = coordinator(&dir, BatchPolicy::default());
  let images: Vec<_> = (0..6).map(|i| png(&format!("{}.png", i))).collect();
  let stop = AtomicBool::new(false);

  let mut observed = 0;
  let summary = coordinator
    .run_batch_with_progress(&images, &BatchOptions::default().with_chunk_size(2), &stop, |progress| {
      observed += 1;
      if progress.aggregate.total_images >= 4 {
        stop.store(true, Ordering::SeqCst);
      }
    })
    .unwrap();

  assert_eq!(observed, 2);
  assert_eq!(summary.status, BatchStatus::Interrupted);
  assert_eq!(summary.total_images, 4);
  assert_eq!(summary.pending_images, 2);
  assert_eq!(summary.total_detections, 8);
}

#[test]
fn storage_loss_mid_batch_carries_partial_summary() {
  let dir = TempDir::new().unwrap();
  let coordinator = coordinator(&dir, BatchPolicy::default());
  let images: Vec<_> = (0..5).map(|i| png(&format!("{}.png", i))).collect();
  let stop = AtomicBool::new(false);
  let root = coordinator.store().root().to_path_buf();

  let error = coordinator
    .run_batch_with_progress(&images, &BatchOptions::default().with_chunk_size(2), &stop, |_| {
      let _ = std::fs::remove_dir_all(root.join("outputs"));
    })
    .unwrap_err();

  assert!(matches!(error, BatchError::StorageUnavailable { .. }));
  let partial = error.partial().unwrap();
  assert_eq!(partial.status, BatchStatus::StorageUnavailable);
  assert_eq!(partial.total_images, 2);
  assert_eq!(partial.pending_images, 3);
  assert_eq!(partial.chunks.len(), 1);
}

#[test]
fn storage_loss_before_first_chunk_has_no_partial() {
  let dir = TempDir::new().unwrap();
  let coordinator = coordinator(&dir, BatchPolicy::default());
  std::fs::remove_dir_all(coordinator.store().root().join("uploads")).unwrap();

  let error = coordinator
    .run_batch(&[png("a.png")], &BatchOptions::default())
    .unwrap_err();
  assert!(matches!(error, BatchError::StorageUnavailable { partial: None, .. }));
}

#[test]
fn parallel_workers_preserve_order() {
  let dir = TempDir::new().unwrap();
  let policy = BatchPolicy {
    workers: 4,
    detect_concurrency: 2,
    ..BatchPolicy::default()
  };
  let mut images: Vec<_> = (0..17).map(|i| png(&format!("{:02}.png", i))).collect();
  images[5] = png("fail_05.png");

  let summary = coordinator(&dir, policy)
    .run_batch(&images, &BatchOptions::default().with_chunk_size(8))
    .unwrap();

  let names: Vec<_> = summary.images.iter().map(|o| o.filename().to_string()).collect();
  let expected: Vec<_> = images.iter().map(|i| i.filename.clone()).collect();
  assert_eq!(names, expected);
  assert_eq!(summary.chunks.len(), 3);
  assert_eq!(summary.total_detections, 16 * 2);
  assert!(!summary.images[5].is_success());
}

#[test]
fn invalid_confidence_is_rejected_up_front() {
  let dir = TempDir::new().unwrap();
  let coordinator = coordinator(&dir, BatchPolicy::default());
  for confidence in [0.0, 1.5] {
    let error = coordinator
      .run_batch(&[png("a.png")], &BatchOptions::default().with_confidence(confidence))
      .unwrap_err();
    assert!(matches!(error, BatchError::Config(ConfigError::InvalidConfidence(_))));
  }
  assert_eq!(
    coordinator.store().root().join("uploads").read_dir().unwrap().count(),
    0
  );
}

#[test]
fn collected_directory_runs_end_to_end() {
  let input = TempDir::new().unwrap();
  std::fs::create_dir_all(input.path().join("floor2")).unwrap();
  std::fs::write(input.path().join("a.png"), encode(ImageFormat::Png)).unwrap();
  std::fs::write(input.path().join("floor2/b.PNG"), encode(ImageFormat::Png)).unwrap();
  std::fs::write(input.path().join("notes.txt"), b"not an image").unwrap();

  let files = collect_candidates(input.path(), 10 * 1024 * 1024).unwrap();
  let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
  assert_eq!(names, ["a.png", "floor2/b.PNG"]);

  let work = TempDir::new().unwrap();
  let stop = AtomicBool::new(false);
  let summary = coordinator(&work, BatchPolicy::default())
    .run_files_with_progress(&files, &BatchOptions::default(), &stop, |_| {})
    .unwrap();
  assert_eq!(summary.total_images, 2);
  assert!(work.path().join("outputs/floor2/annotated_b.PNG").is_file());
}
