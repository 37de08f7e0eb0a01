// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 上传图像与可读性校验
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

use std::{io::Cursor, path::Path};

use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use tracing::debug;

mod collect;
pub use self::collect::{CollectError, UploadCandidate, collect_candidates, is_supported_extension};

/// 一次上传中的单张图像，文件名在批内不保证唯一
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
  pub filename: String,
  pub bytes: Vec<u8>,
}

impl UploadedImage {
  pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
    Self {
      filename: filename.into(),
      bytes: bytes.into(),
    }
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

/// 在交给检测能力之前判断图像能否解码。
///
/// 先按内容识别格式做严格解码，失败后再按扩展名做一次宽松解码。
#[derive(Debug, Clone, Default)]
pub struct ImageValidator {
  limits: Limits,
}

impl ImageValidator {
  pub fn with_limits(limits: Limits) -> Self {
    Self { limits }
  }

  pub fn is_readable(&self, image: &UploadedImage) -> bool {
    self.decode(image).is_some()
  }

  /// 解码成功时返回图像，供后续标注复用
  pub fn decode(&self, image: &UploadedImage) -> Option<DynamicImage> {
    if image.is_empty() {
      debug!("{}: 空文件", image.filename);
      return None;
    }

    match self.decode_strict(&image.bytes) {
      Ok(decoded) => return Some(decoded),
      Err(reason) => debug!("{}: 严格解码失败: {}", image.filename, reason),
    }

    match self.decode_lenient(&image.bytes, &image.filename) {
      Ok(decoded) => {
        debug!("{}: 宽松解码成功", image.filename);
        Some(decoded)
      }
      Err(reason) => {
        debug!("{}: 宽松解码失败: {}", image.filename, reason);
        None
      }
    }
  }

  fn decode_strict(&self, bytes: &[u8]) -> Result<DynamicImage, String> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
      .with_guessed_format()
      .map_err(|e| e.to_string())?;
    let format = reader.format().ok_or_else(|| "无法识别图像格式".to_string())?;
    reader.limits(self.limits.clone());

    let (width, height) = reader
      .into_dimensions()
      .map_err(|e| format!("{:?} 头部无效: {}", format, e))?;
    if width == 0 || height == 0 {
      return Err(format!("{:?} 尺寸为零", format));
    }

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(self.limits.clone());
    let decoded = reader.decode().map_err(|e| e.to_string())?;

    if (decoded.width(), decoded.height()) != (width, height) {
      return Err(format!(
        "解码尺寸 {}x{} 与头部 {}x{} 不一致",
        decoded.width(),
        decoded.height(),
        width,
        height
      ));
    }
    Ok(decoded)
  }

  /// 内容无法识别格式时按扩展名提示格式再试，解码限制不放宽
  fn decode_lenient(&self, bytes: &[u8], filename: &str) -> Result<DynamicImage, String> {
    let format = ImageFormat::from_path(Path::new(filename)).map_err(|e| e.to_string())?;
    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(self.limits.clone());
    let decoded = reader.decode().map_err(|e| e.to_string())?;
    if decoded.width() == 0 || decoded.height() == 0 {
      return Err("尺寸为零".to_string());
    }
    Ok(decoded)
  }
}
