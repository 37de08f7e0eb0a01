// 该文件是 Shanan （山南西风） 项目的一部分。
// src/storage.rs - 上传与输出工作目录
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
  fs::File,
  io::Write,
  path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

const UPLOADS_DIR: &str = "uploads";
const OUTPUTS_DIR: &str = "outputs";
const ANNOTATED_PREFIX: &str = "annotated_";

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("工作目录不可用 {0}: {1}")]
  RootUnavailable(PathBuf, std::io::Error),
  #[error("文件名无效: {0}")]
  InvalidName(String),
  #[error("路径越出工作目录: {0}")]
  OutsideRoot(String),
  #[error("文件不存在: {0}")]
  NotFound(String),
  #[error("I/O 错误 {0}: {1}")]
  IoError(PathBuf, std::io::Error),
}

/// 以文件名寻址的工作目录，分为 `uploads/` 与 `outputs/` 两部分。
///
/// 同名文件会相互覆盖，且所有读取都被限制在根目录之内。
#[derive(Debug, Clone)]
pub struct WorkStore {
  root: PathBuf,
}

impl WorkStore {
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
    let root = root.into();
    for dir in [UPLOADS_DIR, OUTPUTS_DIR] {
      let path = root.join(dir);
      std::fs::create_dir_all(&path).map_err(|e| StorageError::RootUnavailable(path, e))?;
    }
    let root = root
      .canonicalize()
      .map_err(|e| StorageError::RootUnavailable(root.clone(), e))?;
    debug!("工作目录: {}", root.display());
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// 根目录及其两个子目录仍可访问
  pub fn check_root(&self) -> Result<(), StorageError> {
    for dir in [UPLOADS_DIR, OUTPUTS_DIR] {
      let path = self.root.join(dir);
      match std::fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
          return Err(StorageError::RootUnavailable(
            path,
            std::io::Error::new(std::io::ErrorKind::NotADirectory, "不是目录"),
          ));
        }
        Err(e) => return Err(StorageError::RootUnavailable(path, e)),
      }
    }
    Ok(())
  }

  /// 保存原始上传文件，返回其绝对路径
  pub fn save_upload(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
    let relative = Path::new(UPLOADS_DIR).join(sanitize_name(filename)?);
    self.write(&relative, bytes)?;
    Ok(self.root.join(relative))
  }

  /// 保存标注图像，返回相对根目录的引用路径
  pub fn save_output(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
    let relative = Path::new(OUTPUTS_DIR).join(annotated_name(&sanitize_name(filename)?));
    self.write(&relative, bytes)?;
    Ok(relative)
  }

  /// 将外部给定的路径解析到根目录之内，`..` 或符号链接越界一律拒绝
  pub fn resolve(&self, requested: &str) -> Result<PathBuf, StorageError> {
    let mut relative = PathBuf::new();
    for component in Path::new(requested).components() {
      match component {
        Component::Normal(part) => relative.push(part),
        Component::CurDir => {}
        _ => return Err(StorageError::OutsideRoot(requested.to_string())),
      }
    }
    if relative.as_os_str().is_empty() {
      return Err(StorageError::InvalidName(requested.to_string()));
    }

    let candidate = self.root.join(&relative);
    let resolved = candidate
      .canonicalize()
      .map_err(|_| StorageError::NotFound(requested.to_string()))?;
    if !resolved.starts_with(&self.root) {
      return Err(StorageError::OutsideRoot(requested.to_string()));
    }
    if !resolved.is_file() {
      return Err(StorageError::NotFound(requested.to_string()));
    }
    Ok(resolved)
  }

  pub fn read(&self, requested: &str) -> Result<Vec<u8>, StorageError> {
    let path = self.resolve(requested)?;
    std::fs::read(&path).map_err(|e| StorageError::IoError(path, e))
  }

  fn write(&self, relative: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let path = self.root.join(relative);
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(|e| StorageError::IoError(parent.to_path_buf(), e))?;
    }

    let mut file = File::create(&path).map_err(|e| StorageError::IoError(path.clone(), e))?;
    file
      .write_all(bytes)
      .and_then(|_| file.sync_data())
      .map_err(|e| StorageError::IoError(path.clone(), e))?;
    debug!("写入文件: {} ({} 字节)", path.display(), bytes.len());
    Ok(())
  }
}

/// 只保留普通路径分量，子目录得以保留
fn sanitize_name(filename: &str) -> Result<PathBuf, StorageError> {
  let cleaned: PathBuf = Path::new(filename)
    .components()
    .filter_map(|component| match component {
      Component::Normal(part) => Some(part),
      _ => None,
    })
    .collect();
  if cleaned.as_os_str().is_empty() {
    return Err(StorageError::InvalidName(filename.to_string()));
  }
  Ok(cleaned)
}

fn annotated_name(name: &Path) -> PathBuf {
  let file_name = name
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  name.with_file_name(format!("{}{}", ANNOTATED_PREFIX, file_name))
}
