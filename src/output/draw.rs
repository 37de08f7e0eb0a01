// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, Rgba, RgbaImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::info;

use crate::{label::ClassCatalog, model::Detection};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（无字体时估算）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

#[derive(Debug, thiserror::Error)]
pub enum FontError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 在图像上绘制检测框与标签。
///
/// 未配置字体时只绘制框和标签底色。
#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
    }
  }
}

impl Draw {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: &Path) -> Result<Self, FontError> {
    info!("加载字体文件: {}", path.display());
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)?;
    Ok(self.with_font(font))
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn draw_detections(&self, image: &mut RgbaImage, detections: &[Detection], catalog: &ClassCatalog) {
    for detection in detections {
      let Some(bbox) = detection.bbox else {
        continue;
      };
      let Rgb([r, g, b]) = catalog.color(detection.class_id);
      let color = Rgba([r, g, b, 255]);
      let label = format!("{} {:.2}", detection.class_name, detection.confidence);
      self.draw_bbox_with_label(image, bbox, &label, color);
    }
  }

  // bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbaImage, bbox: [u32; 4], label: &str, color: Rgba<u8>) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    if w == 0 || h == 0 {
      return;
    }

    let clamp_x = |v: u32| (v as i64).clamp(0, w - 1) as i32;
    let clamp_y = |v: u32| (v as i64).clamp(0, h - 1) as i32;
    let (x_min, y_min) = (clamp_x(bbox[0].min(bbox[2])), clamp_y(bbox[1].min(bbox[3])));
    let (x_max, y_max) = (clamp_x(bbox[0].max(bbox[2])), clamp_y(bbox[1].max(bbox[3])));

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 边框向内加粗
    for t in 0..BOX_THICKNESS {
      let width = (x_max - x_min - 2 * t + 1).max(1) as u32;
      let height = (y_max - y_min - 2 * t + 1).max(1) as u32;
      let rect = Rect::at(x_min + t, y_min + t).of_size(width, height);
      draw_hollow_rect_mut(image, rect, color);
    }

    let scale = PxScale::from(self.font_size);
    let text_width = match &self.font {
      Some(font) => text_size(scale, font, label).0 as i32 + 4,
      None => (label.len() as f32 * self.label_char_width) as i32,
    };
    let text_height = self.label_text_height;

    // 标签放在边框上方，空间不足时贴住顶部
    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = text_width.min(w as i32 - label_x).max(0) as u32;

    if label_width > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width, text_height as u32);
      draw_filled_rect_mut(image, rect, color);

      if let Some(font) = &self.font {
        draw_text_mut(
          image,
          TEXT_COLOR,
          label_x + 2,
          label_y + self.label_text_vertical_padding,
          scale,
          font,
          label,
        );
      }
    }
  }
}
