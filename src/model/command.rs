// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/command.rs - 外部程序检测能力
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
  io::Read,
  path::PathBuf,
  process::{Child, Command, ExitStatus, Stdio},
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectInput, Detector, RawDetection},
};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum CommandDetectorError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("程序路径错误: {0}")]
  ProgramPathError(String),
  #[error("参数错误: {0}")]
  InvalidParameter(String),
  #[error("启动检测程序失败: {0}")]
  SpawnError(std::io::Error),
  #[error("检测程序超时 ({0:?})")]
  Timeout(Duration),
  #[error("检测程序退出码 {code:?}: {stderr}")]
  ExitFailure { code: Option<i32>, stderr: String },
  #[error("输出解析失败: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 调用外部检测程序：`<program> [arg..] <image_path> <confidence>`，
/// 标准输出为 `[{class_id, confidence, bbox}]` JSON 数组。
///
/// URL 形式为 `exec:///path/to/program?arg=--device&arg=cpu&timeout_ms=30000`。
#[derive(Debug, Clone)]
pub struct CommandDetector {
  program: PathBuf,
  args: Vec<String>,
  timeout: Duration,
}

impl FromUrlWithScheme for CommandDetector {
  const SCHEME: &'static str = "exec";
}

impl FromUrl for CommandDetector {
  type Error = CommandDetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CommandDetectorError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let program = urlencoding::decode(url.path())
      .map_err(|e| CommandDetectorError::ProgramPathError(e.to_string()))?
      .into_owned();
    if program.is_empty() || program == "/" {
      return Err(CommandDetectorError::ProgramPathError(
        "缺少检测程序路径".to_string(),
      ));
    }

    let mut args = Vec::new();
    let mut timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "arg" => args.push(value.into_owned()),
        "timeout_ms" => {
          let ms: u64 = value
            .parse()
            .map_err(|_| CommandDetectorError::InvalidParameter(format!("timeout_ms={}", value)))?;
          timeout = Duration::from_millis(ms);
        }
        other => {
          return Err(CommandDetectorError::InvalidParameter(format!(
            "未知参数: {}",
            other
          )));
        }
      }
    }

    info!("检测程序: {} {:?} (超时 {:?})", program, args, timeout);
    Ok(Self {
      program: PathBuf::from(program),
      args,
      timeout,
    })
  }
}

impl CommandDetector {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  fn run(&self, input: &DetectInput<'_>, confidence: f32) -> Result<Vec<RawDetection>, CommandDetectorError> {
    debug!("执行检测程序: {} {}", self.program.display(), input.path.display());
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .arg(input.path)
      .arg(confidence.to_string())
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(CommandDetectorError::SpawnError)?;

    // 管道须在等待期间持续读取，否则子进程可能阻塞在写入上
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = match wait_with_timeout(&mut child, self.timeout) {
      Ok(status) => status,
      Err(e) => {
        error!("{}: 检测程序异常，终止进程: {}", input.filename, e);
        let _ = child.kill();
        let _ = child.wait();
        // 子进程派生的后台进程可能仍持有管道，读取线程不再等待
        drop(stdout);
        drop(stderr);
        return Err(e);
      }
    };

    let stdout = join_reader(stdout)?;
    let stderr = join_reader(stderr)?;

    if !status.success() {
      let stderr = String::from_utf8_lossy(&stderr);
      let tail: String = {
        let trimmed = stderr.trim();
        let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL_CHARS);
        trimmed.chars().skip(skip).collect()
      };
      return Err(CommandDetectorError::ExitFailure {
        code: status.code(),
        stderr: tail,
      });
    }

    Ok(serde_json::from_slice(&stdout)?)
  }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus, CommandDetectorError> {
  let started = Instant::now();
  loop {
    if let Some(status) = child.try_wait()? {
      return Ok(status);
    }
    if started.elapsed() >= timeout {
      return Err(CommandDetectorError::Timeout(timeout));
    }
    thread::sleep(POLL_INTERVAL);
  }
}

impl Detector for CommandDetector {
  type Error = CommandDetectorError;

  fn detect(&self, input: &DetectInput<'_>, confidence: f32) -> Result<Vec<RawDetection>, Self::Error> {
    self.run(input, confidence)
  }

  fn name(&self) -> &str {
    "exec"
  }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<std::io::Result<Vec<u8>>> {
  thread::spawn(move || {
    let mut buffer = Vec::new();
    pipe.read_to_end(&mut buffer)?;
    Ok(buffer)
  })
}

fn join_reader(
  handle: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<Vec<u8>, CommandDetectorError> {
  match handle {
    Some(handle) => handle
      .join()
      .map_err(|_| CommandDetectorError::IoError(std::io::Error::other("管道读取线程异常退出")))?
      .map_err(CommandDetectorError::from),
    None => Ok(Vec::new()),
  }
}
