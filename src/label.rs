// 该文件是 Shanan （山南西风） 项目的一部分。
// src/label.rs - 类别目录
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

use std::{borrow::Cow, collections::BTreeMap, path::Path};

use image::Rgb;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

// 未知类别的调色板大小
const GENERATED_PALETTE_SIZE: u32 = 80;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件解析错误: {0}")]
  ParseError(#[from] toml::de::Error),
  #[error("颜色格式错误: {0}")]
  InvalidColor(String),
  #[error("类别 {0} 重复定义")]
  DuplicateId(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassEntry {
  pub id: u32,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelFile {
  #[serde(rename = "class", default)]
  classes: Vec<ClassEntry>,
}

/// 类别 ID 到名称与颜色的只读映射，启动时加载一次后共享。
#[derive(Debug, Clone)]
pub struct ClassCatalog {
  entries: BTreeMap<u32, (String, Rgb<u8>)>,
}

impl Default for ClassCatalog {
  /// 安全设备 7 类
  fn default() -> Self {
    const SAFETY_CLASSES: [(&str, [u8; 3]); 7] = [
      ("OxygenTank", [0xFF, 0x00, 0x00]),
      ("NitrogenTank", [0x00, 0xFF, 0x00]),
      ("FirstAidBox", [0x00, 0x00, 0xFF]),
      ("FireAlarm", [0xFF, 0xFF, 0x00]),
      ("SafetySwitchPanel", [0xFF, 0x00, 0xFF]),
      ("EmergencyPhone", [0x00, 0xFF, 0xFF]),
      ("FireExtinguisher", [0x80, 0x00, 0x80]),
    ];

    let entries = SAFETY_CLASSES
      .iter()
      .enumerate()
      .map(|(id, (name, color))| (id as u32, (name.to_string(), Rgb(*color))))
      .collect();

    Self { entries }
  }
}

impl ClassCatalog {
  pub fn empty() -> Self {
    Self {
      entries: BTreeMap::new(),
    }
  }

  pub fn from_entries(entries: impl IntoIterator<Item = ClassEntry>) -> Result<Self, LabelError> {
    let mut map = BTreeMap::new();
    for entry in entries {
      let color = match entry.color.as_deref() {
        Some(hex) => parse_hex_color(hex)?,
        None => generated_color(entry.id),
      };
      if map.insert(entry.id, (entry.name, color)).is_some() {
        return Err(LabelError::DuplicateId(entry.id));
      }
    }
    Ok(Self { entries: map })
  }

  /// 从 TOML 标签文件加载，格式为若干 `[[class]]` 表
  pub fn from_toml_str(content: &str) -> Result<Self, LabelError> {
    let file: LabelFile = toml::from_str(content)?;
    Self::from_entries(file.classes)
  }

  pub fn from_toml_file(path: &Path) -> Result<Self, LabelError> {
    info!("加载标签文件: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    let catalog = Self::from_toml_str(&content)?;
    info!("标签文件加载完成，共 {} 个类别", catalog.len());
    Ok(catalog)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, id: u32) -> Option<&str> {
    self.entries.get(&id).map(|(name, _)| name.as_str())
  }

  /// 未登记的 ID 生成 `Class_{id}` 占位名称
  pub fn name(&self, id: u32) -> Cow<'_, str> {
    match self.get(id) {
      Some(name) => Cow::Borrowed(name),
      None => Cow::Owned(format!("Class_{}", id)),
    }
  }

  pub fn color(&self, id: u32) -> Rgb<u8> {
    match self.entries.get(&id) {
      Some((_, color)) => *color,
      None => generated_color(id),
    }
  }

  pub fn entries(&self) -> Vec<ClassEntry> {
    self
      .entries
      .iter()
      .map(|(id, (name, Rgb([r, g, b])))| ClassEntry {
        id: *id,
        name: name.clone(),
        color: Some(format!("#{:02X}{:02X}{:02X}", r, g, b)),
      })
      .collect()
  }
}

fn parse_hex_color(hex: &str) -> Result<Rgb<u8>, LabelError> {
  let digits = hex.strip_prefix('#').unwrap_or(hex);
  if digits.len() != 6 || !digits.is_ascii() {
    return Err(LabelError::InvalidColor(hex.to_string()));
  }
  let channel = |range: std::ops::Range<usize>| {
    u8::from_str_radix(&digits[range], 16).map_err(|_| LabelError::InvalidColor(hex.to_string()))
  };
  Ok(Rgb([channel(0..2)?, channel(2..4)?, channel(4..6)?]))
}

fn generated_color(id: u32) -> Rgb<u8> {
  let hue = ((id % GENERATED_PALETTE_SIZE) as f32 / GENERATED_PALETTE_SIZE as f32) * 360.0;
  hsv_to_rgb(hue, 0.8, 0.9)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
