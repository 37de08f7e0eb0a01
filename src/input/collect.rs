// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/collect.rs - 从目录收集待上传图像
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


use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::UploadedImage;

const SUPPORTED_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "tiff", "tif", "webp"];

#[derive(Error, Debug)]
pub enum CollectError {
  #[error("输入目录不存在: {0}")]
  NotADirectory(PathBuf),
}

pub fn is_supported_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| {
      SUPPORTED_EXTENSIONS
        .iter()
        .any(|supported| ext.eq_ignore_ascii_case(supported))
    })
    .unwrap_or(false)
}

/// 目录中找到的待处理文件，内容在所属分块开始前才读取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCandidate {
  /// 相对输入目录的路径，以 `/` 分隔
  pub filename: String,
  pub path: PathBuf,
  pub size: u64,
}

impl UploadCandidate {
  /// 读取失败时内容为空，校验环节会将其记为无法读取
  pub fn load(&self) -> UploadedImage {
    match std::fs::read(&self.path) {
      Ok(bytes) => UploadedImage::new(self.filename.clone(), bytes),
      Err(e) => {
        warn!("无法读取文件 {}: {}", self.path.display(), e);
        UploadedImage::new(self.filename.clone(), Vec::new())
      }
    }
  }
}

/// 递归收集目录下的图像文件，按路径排序。
///
/// 不跟随符号链接，超过 `max_bytes` 的文件被跳过，无法访问的条目只记录警告。
pub fn collect_candidates(directory: &Path, max_bytes: u64) -> Result<Vec<UploadCandidate>, CollectError> {
  if !directory.is_dir() {
    return Err(CollectError::NotADirectory(directory.to_path_buf()));
  }

  let mut candidates = Vec::new();
  for entry in WalkDir::new(directory).follow_links(false) {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) => {
        warn!("无法访问目录条目: {}", e);
        continue;
      }
    };
    if !entry.file_type().is_file() || !is_supported_extension(entry.path()) {
      continue;
    }

    let size = match entry.metadata() {
      Ok(meta) => meta.len(),
      Err(e) => {
        warn!("无法读取文件信息 {}: {}", entry.path().display(), e);
        continue;
      }
    };
    if size > max_bytes {
      warn!(
        "跳过过大的文件: {} ({:.2} MB)",
        entry.path().display(),
        size as f64 / (1024.0 * 1024.0)
      );
      continue;
    }

    debug!("候选文件: {}", entry.path().display());
    candidates.push(UploadCandidate {
      filename: relative_name(directory, entry.path()),
      path: entry.into_path(),
      size,
    });
  }
  candidates.sort_by(|a, b| a.path.cmp(&b.path));

  info!("在 {} 中找到 {} 个图像文件", directory.display(), candidates.len());
  Ok(candidates)
}

fn relative_name(root: &Path, path: &Path) -> String {
  let relative = path.strip_prefix(root).unwrap_or(path);
  relative
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn extension_filter_is_case_insensitive() {
    assert!(is_supported_extension(Path::new("a/b.JPG")));
    assert!(is_supported_extension(Path::new("c.tif")));
    assert!(!is_supported_extension(Path::new("notes.txt")));
    assert!(!is_supported_extension(Path::new("png")));
  }

  #[test]
  fn collects_recursively_in_order() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("b/nested")).unwrap();
    std::fs::write(dir.path().join("z.png"), b"1").unwrap();
    std::fs::write(dir.path().join("a.jpg"), b"2").unwrap();
    std::fs::write(dir.path().join("b/nested/c.bmp"), b"3").unwrap();
    std::fs::write(dir.path().join("b/readme.md"), b"skip").unwrap();
    std::fs::write(dir.path().join("big.png"), vec![0u8; 64]).unwrap();

    let candidates = collect_candidates(dir.path(), 32).unwrap();
    let names: Vec<_> = candidates.iter().map(|c| c.filename.as_str()).collect();
    assert_eq!(names, ["a.jpg", "b/nested/c.bmp", "z.png"]);
    assert_eq!(candidates[0].size, 1);
    assert_eq!(candidates[0].load(), UploadedImage::new("a.jpg", b"2".to_vec()));
  }

  #[test]
  fn vanished_file_loads_as_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.png"), b"1").unwrap();
    let candidates = collect_candidates(dir.path(), 1024).unwrap();
    std::fs::remove_file(dir.path().join("a.png")).unwrap();

    let loaded = candidates[0].load();
    assert_eq!(loaded.filename, "a.png");
    assert!(loaded.is_empty());
  }

  #[cfg(unix)]
  #[test]
  fn symlinks_are_not_followed() {
    let outside = TempDir::new().unwrap();
    std::fs::create_dir_all(outside.path().join("secret")).unwrap();
    std::fs::write(outside.path().join("secret/x.png"), b"1").unwrap();
    std::fs::write(outside.path().join("y.png"), b"1").unwrap();

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.png"), b"1").unwrap();
    std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("linked")).unwrap();
    std::os::unix::fs::symlink(outside.path().join("y.png"), dir.path().join("y.png")).unwrap();

    let candidates = collect_candidates(dir.path(), 1024).unwrap();
    let names: Vec<_> = candidates.iter().map(|c| c.filename.as_str()).collect();
    assert_eq!(names, ["a.png"]);
  }

  #[test]
  fn missing_directory_is_an_error() {
    let dir = TempDir::new().unwrap();
    let result = collect_candidates(&dir.path().join("missing"), 1024);
    assert!(matches!(result, Err(CollectError::NotADirectory(_))));
  }
}
