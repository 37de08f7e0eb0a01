// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 命令行参数与配置合并
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

use std::{path::PathBuf, time::Duration};

use clap::{Args as ClapArgs, Parser, Subcommand};
use url::Url;

use shanan_batch::config::{
  BatchOptions, BatchPolicy, DEFAULT_CHUNK_CEILING, DEFAULT_CHUNK_SIZE, DEFAULT_CONFIDENCE,
  DEFAULT_MAX_FILE_SIZE_MB, Settings,
};

const DEFAULT_WORKDIR: &str = "./work";

/// Shanan 批量目标检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// TOML 配置文件
  #[arg(long, global = true, env = "SHANAN_BATCH_CONFIG", value_name = "TOML")]
  pub config: Option<PathBuf>,
  /// 工作目录，包含 uploads/ 与 outputs/
  #[arg(long, global = true, env = "SHANAN_BATCH_WORKDIR", value_name = "DIR")]
  pub workdir: Option<PathBuf>,
  /// 类别文件
  #[arg(long, global = true, env = "SHANAN_BATCH_LABELS", value_name = "TOML")]
  pub labels: Option<PathBuf>,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 对目录中的图像执行批量检测
  Run(RunArgs),
  /// 从工作目录取回已保存的文件
  Fetch(FetchArgs),
  /// 输出类别表
  Classes,
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
  /// 检测程序，例如 exec:///usr/local/bin/detect?arg=--fp16&timeout_ms=30000
  #[arg(long, env = "SHANAN_BATCH_MODEL", value_name = "URL")]
  pub model: Url,
  /// 输入目录
  #[arg(long, env = "SHANAN_BATCH_INPUT", value_name = "DIR")]
  pub input: PathBuf,
  /// 汇总输出路径，`-` 为标准输出
  #[arg(long, env = "SHANAN_BATCH_OUTPUT", default_value = "-", value_name = "FILE")]
  pub output: String,
  /// 置信度阈值 (0.0, 1.0]
  #[arg(long, env = "SHANAN_BATCH_CONFIDENCE", value_name = "THRESHOLD")]
  pub confidence: Option<f32>,
  /// 每块图像数
  #[arg(long, env = "SHANAN_BATCH_CHUNK_SIZE", value_name = "COUNT")]
  pub chunk_size: Option<usize>,
  /// 每块图像数上限
  #[arg(long, env = "SHANAN_BATCH_CHUNK_CEILING", value_name = "COUNT")]
  pub chunk_ceiling: Option<usize>,
  /// 分块内工作线程数
  #[arg(long, env = "SHANAN_BATCH_WORKERS", value_name = "COUNT")]
  pub workers: Option<usize>,
  /// 同时进行的检测调用数
  #[arg(long, env = "SHANAN_BATCH_DETECT_CONCURRENCY", value_name = "COUNT")]
  pub detect_concurrency: Option<usize>,
  /// 截止时间（秒），超过后不再启动新的分块
  #[arg(long, env = "SHANAN_BATCH_DEADLINE_SECS", value_name = "SECS")]
  pub deadline_secs: Option<u64>,
  /// 标注字体
  #[arg(long, env = "SHANAN_BATCH_FONT", value_name = "TTF")]
  pub font: Option<PathBuf>,
  /// 单个文件大小上限（MB）
  #[arg(long, env = "SHANAN_BATCH_MAX_FILE_SIZE_MB", value_name = "MB")]
  pub max_file_size_mb: Option<u64>,
}

#[derive(ClapArgs, Debug)]
pub struct FetchArgs {
  /// 相对工作目录的路径，例如 outputs/annotated_a.jpg
  pub path: String,
  /// 保存位置，缺省写到标准输出
  #[arg(long, value_name = "FILE")]
  pub dest: Option<PathBuf>,
}

/// 命令行（含环境变量）优先，其次配置文件，最后是默认值
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
  pub workdir: PathBuf,
  pub labels: Option<PathBuf>,
  pub font: Option<PathBuf>,
  pub policy: BatchPolicy,
  pub options: BatchOptions,
  pub max_file_bytes: u64,
}

impl Resolved {
  pub fn common(args: &Args, settings: &Settings) -> Self {
    Self {
      workdir: args
        .workdir
        .clone()
        .or_else(|| settings.workdir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR)),
      labels: args.labels.clone().or_else(|| settings.labels.clone()),
      font: settings.font.clone(),
      policy: BatchPolicy::default(),
      options: BatchOptions::default(),
      max_file_bytes: DEFAULT_MAX_FILE_SIZE_MB * 1024 * 1024,
    }
  }

  pub fn run(args: &Args, run: &RunArgs, settings: &Settings) -> Self {
    let batch = &settings.batch;
    let policy = BatchPolicy {
      chunk_ceiling: run
        .chunk_ceiling
        .or(batch.chunk_ceiling)
        .unwrap_or(DEFAULT_CHUNK_CEILING),
      workers: run.workers.or(batch.workers).unwrap_or(1),
      detect_concurrency: run.detect_concurrency.or(batch.detect_concurrency).unwrap_or(1),
    };
    let options = BatchOptions::default()
      .with_confidence(run.confidence.or(batch.confidence).unwrap_or(DEFAULT_CONFIDENCE))
      .with_chunk_size(run.chunk_size.or(batch.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE))
      .with_deadline(run.deadline_secs.or(batch.deadline_secs).map(Duration::from_secs));
    let max_file_size_mb = run
      .max_file_size_mb
      .or(batch.max_file_size_mb)
      .unwrap_or(DEFAULT_MAX_FILE_SIZE_MB);

    Self {
      font: run.font.clone().or_else(|| settings.font.clone()),
      policy,
      options,
      max_file_bytes: max_file_size_mb.saturating_mul(1024 * 1024),
      ..Self::common(args, settings)
    }
  }
}
