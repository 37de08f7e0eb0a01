// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::{
  io::Write,
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shanan_batch::{
  FromUrl,
  config::Settings,
  input::collect_candidates,
  label::ClassCatalog,
  model::CommandDetector,
  output::Draw,
  result::BatchSummary,
  storage::WorkStore,
  task::BatchCoordinator,
};

use args::{Args, Command, FetchArgs, Resolved, RunArgs};

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  let settings = match &args.config {
    Some(path) => Settings::load(path).with_context(|| format!("无法加载配置文件 {}", path.display()))?,
    None => Settings::default(),
  };

  match &args.command {
    Command::Run(run) => run_batch(&args, run, &settings),
    Command::Fetch(fetch) => fetch_artifact(&Resolved::common(&args, &settings), fetch),
    Command::Classes => print_classes(&Resolved::common(&args, &settings)),
  }
}

fn load_catalog(labels: Option<&Path>) -> Result<ClassCatalog> {
  match labels {
    Some(path) => {
      info!("加载类别文件: {}", path.display());
      ClassCatalog::from_toml_file(path).with_context(|| format!("无法加载类别文件 {}", path.display()))
    }
    None => Ok(ClassCatalog::default()),
  }
}

fn run_batch(args: &Args, run: &RunArgs, settings: &Settings) -> Result<()> {
  let resolved = Resolved::run(args, run, settings);
  info!("检测程序: {}", run.model);
  info!("输入目录: {}", run.input.display());
  info!("工作目录: {}", resolved.workdir.display());

  let catalog = Arc::new(load_catalog(resolved.labels.as_deref())?);
  let draw = match &resolved.font {
    Some(path) => Draw::default()
      .with_font_file(path)
      .with_context(|| format!("无法加载字体 {}", path.display()))?,
    None => Draw::default(),
  };
  let detector = CommandDetector::from_url(&run.model).context("无法创建检测程序")?;
  let store = WorkStore::open(&resolved.workdir)
    .with_context(|| format!("无法打开工作目录 {}", resolved.workdir.display()))?;
  let coordinator = BatchCoordinator::new(detector, catalog, draw, store, resolved.policy)?;

  let files = collect_candidates(&run.input, resolved.max_file_bytes)?;
  info!("共发现 {} 个图像文件", files.len());

  let stop = Arc::new(AtomicBool::new(false));
  {
    let stop = stop.clone();
    ctrlc::set_handler(move || {
      warn!("收到中断信号，当前分块完成后停止");
      stop.store(true, Ordering::SeqCst);
    })
    .context("无法设置中断处理")?;
  }

  let started = std::time::Instant::now();
  let result = coordinator.run_files_with_progress(&files, &resolved.options, &stop, |progress| {
    info!(
      "进度 {}/{}: 累计 {} 张图像，{} 个检测",
      progress.chunk.chunk_number,
      progress.total_chunks,
      progress.aggregate.total_images,
      progress.aggregate.total_detections
    );
  });

  let summary = match result {
    Ok(summary) => summary,
    Err(e) => {
      // 已完成的分块照常输出
      if let Some(partial) = e.partial() {
        write_summary(&run.output, partial)?;
      }
      return Err(e).context("批量检测中止");
    }
  };
  info!("批量检测完成，耗时: {:.2?}", started.elapsed());
  write_summary(&run.output, &summary)
}

fn write_summary(output: &str, summary: &BatchSummary) -> Result<()> {
  let json = serde_json::to_string_pretty(summary)?;
  if output == "-" {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", json)?;
  } else {
    std::fs::write(output, json).with_context(|| format!("无法写入汇总文件 {}", output))?;
    info!("汇总已写入: {}", output);
  }
  Ok(())
}

fn fetch_artifact(resolved: &Resolved, fetch: &FetchArgs) -> Result<()> {
  let store = WorkStore::open(&resolved.workdir)
    .with_context(|| format!("无法打开工作目录 {}", resolved.workdir.display()))?;
  let bytes = store
    .read(&fetch.path)
    .with_context(|| format!("无法读取 {}", fetch.path))?;

  match &fetch.dest {
    Some(dest) => {
      std::fs::write(dest, &bytes).with_context(|| format!("无法写入 {}", dest.display()))?;
      info!("{} -> {} ({} 字节)", fetch.path, dest.display(), bytes.len());
    }
    None => std::io::stdout().lock().write_all(&bytes)?,
  }
  Ok(())
}

fn print_classes(resolved: &Resolved) -> Result<()> {
  let catalog = load_catalog(resolved.labels.as_deref())?;
  let json = serde_json::to_string_pretty(&catalog.entries())?;
  writeln!(std::io::stdout().lock(), "{}", json)?;
  Ok(())
}

