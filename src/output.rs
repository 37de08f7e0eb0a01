// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 标注图像渲染与编码
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
  path::{Path, PathBuf},
  sync::Arc,
};

use image::{DynamicImage, ImageFormat};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{label::ClassCatalog, model::Detection};

pub mod draw;
pub use self::draw::{Draw, FontError};

#[derive(Error, Debug)]
#[error("标注图像编码失败 ({format:?}): 主路径 {primary}; 备用路径 {fallback}")]
pub struct RenderError {
  pub format: ImageFormat,
  pub primary: image::ImageError,
  pub fallback: image::ImageError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
  pub bytes: Vec<u8>,
  pub format: ImageFormat,
}

/// 标注图像的编码格式跟随源文件扩展名，不支持编码的格式改存 PNG
pub fn annotated_target(filename: &str) -> (String, ImageFormat) {
  match ImageFormat::from_path(Path::new(filename)) {
    Ok(
      format @ (ImageFormat::Jpeg
      | ImageFormat::Png
      | ImageFormat::Bmp
      | ImageFormat::Gif
      | ImageFormat::Tiff
      | ImageFormat::WebP),
    ) => (filename.to_string(), format),
    _ => {
      let renamed = PathBuf::from(filename).with_extension("png");
      (renamed.to_string_lossy().into_owned(), ImageFormat::Png)
    }
  }
}

/// 在源图像副本上绘制检测结果并编码。
///
/// 主路径按 RGBA 编码，编码器拒绝该颜色布局时转为 RGB 再试一次。
#[derive(Clone)]
pub struct Annotator {
  draw: Draw,
  catalog: Arc<ClassCatalog>,
}

impl Annotator {
  pub fn new(draw: Draw, catalog: Arc<ClassCatalog>) -> Self {
    Self { draw, catalog }
  }

  pub fn render(
    &self,
    image: &DynamicImage,
    detections: &[Detection],
    format: ImageFormat,
  ) -> Result<EncodedImage, RenderError> {
    let mut canvas = image.to_rgba8();
    self.draw.draw_detections(&mut canvas, detections, &self.catalog);
    encode_with_fallback(DynamicImage::ImageRgba8(canvas), format)
  }
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, image::ImageError> {
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, format)?;
  Ok(buffer.into_inner())
}

pub(crate) fn encode_with_fallback(image: DynamicImage, format: ImageFormat) -> Result<EncodedImage, RenderError> {
  let primary = match encode(&image, format) {
    Ok(bytes) => return Ok(EncodedImage { bytes, format }),
    Err(e) => e,
  };
  debug!("{:?} 编码失败，转换为 RGB 后重试: {}", format, primary);

  let converted = DynamicImage::ImageRgb8(image.to_rgb8());
  match encode(&converted, format) {
    Ok(bytes) => Ok(EncodedImage { bytes, format }),
    Err(fallback) => {
      warn!("{:?} 备用编码同样失败: {}", format, fallback);
      Err(RenderError {
        format,
        primary,
        fallback,
      })
    }
  }
}
