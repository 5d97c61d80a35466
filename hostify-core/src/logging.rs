//! 日志初始化：控制台输出 + 可选的按大小滚动文件输出。
//!
//! 进程入口先调用 [`init_tracing`] 安装全局 subscriber，配置加载前的失败也能被记录；
//! 配置可用后由 [`init`] 挂上文件 sink 并返回 [`LoggingGuard`]，guard 释放时刷新并摘除文件 sink。

use crate::config::size::{format_file_size, parse_file_size};
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BASE_PATH: &str = "logs/hostify.log";
const DEFAULT_MAX_SIZE: &str = "50 MiB";
const DEFAULT_MAX_FILES: usize = 5;
const MAX_SIZE_RANGE: (u64, u64) = (1024, 2 * 1024 * 1024 * 1024);
const MAX_FILES_RANGE: (usize, usize) = (1, 32);

static INSTALL: Once = Once::new();
static ACTIVE_SINK: Mutex<Option<Arc<RotatingFile>>> = Mutex::new(None);

fn active_sink() -> MutexGuard<'static, Option<Arc<RotatingFile>>> {
    ACTIVE_SINK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 校验后的日志参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerSettings {
    pub base_path: PathBuf,
    pub max_size: u64,
    pub max_files: usize,
}

impl LoggerSettings {
    pub fn resolve(config: &ServiceConfig) -> Result<Self> {
        let logger = config.logger.as_ref();
        let base_path = logger
            .map(|l| l.base_path.as_str())
            .unwrap_or(DEFAULT_BASE_PATH);
        if base_path.trim().is_empty() {
            return Err(ServiceError::invalid_config(
                "the logger base path must be non-empty",
            ));
        }

        let size_text = logger
            .and_then(|l| l.max_size.as_deref())
            .unwrap_or(DEFAULT_MAX_SIZE);
        let max_size = parse_file_size(size_text).ok_or_else(|| {
            ServiceError::invalid_config(format!("invalid max file size of the logger: {size_text}"))
        })?;
        let (min, max) = MAX_SIZE_RANGE;
        if !(min..=max).contains(&max_size) {
            return Err(ServiceError::invalid_config(format!(
                "the max file size {size_text} is out of range [{}, {}]",
                format_file_size(min),
                format_file_size(max)
            )));
        }

        let max_files = logger
            .and_then(|l| l.max_files)
            .unwrap_or(DEFAULT_MAX_FILES);
        let (min, max) = MAX_FILES_RANGE;
        if !(min..=max).contains(&max_files) {
            return Err(ServiceError::invalid_config(format!(
                "the max file count {max_files} is out of range [{min}, {max}]"
            )));
        }

        Ok(Self {
            base_path: PathBuf::from(base_path),
            max_size,
            max_files,
        })
    }
}

/// 日志作用域句柄：释放时刷新并关闭文件 sink。
#[derive(Debug)]
pub struct LoggingGuard {
    sink: Option<Arc<RotatingFile>>,
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        {
            let mut active = active_sink();
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &sink)) {
                *active = None;
            }
        }
        sink.close();
    }
}

/// 安装全局 subscriber（控制台 + 尚未挂载的文件 sink），重复调用无效果。
///
/// 进程入口在做任何可能失败的事情之前调用。
pub fn init_tracing() {
    INSTALL.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
        let console = tracing_subscriber::fmt::layer().with_target(false);
        let file = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(ActiveSink);
        if tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file)
            .try_init()
            .is_err()
        {
            tracing::debug!("a global subscriber is already installed");
        }
    });
}

/// 按配置挂上文件 sink。`file_logging` 为 false 时只输出到控制台。
pub fn init(config: &ServiceConfig, file_logging: bool) -> Result<LoggingGuard> {
    init_tracing();
    let settings = LoggerSettings::resolve(config)?;
    let sink = if file_logging {
        let sink = Arc::new(RotatingFile::open(&settings)?);
        *active_sink() = Some(sink.clone());
        Some(sink)
    } else {
        None
    };

    tracing::info!(
        path = %settings.base_path.display(),
        max_size = %format_file_size(settings.max_size),
        max_files = settings.max_files,
        file_logging,
        "logger configured"
    );

    Ok(LoggingGuard { sink })
}

/// 文件 layer 的 writer 工厂：每条记录写入当前挂载的 sink，未挂载时丢弃。
#[derive(Debug, Clone, Copy)]
struct ActiveSink;

impl<'a> MakeWriter<'a> for ActiveSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter(active_sink().clone())
    }
}

struct SinkWriter(Option<Arc<RotatingFile>>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.0 {
            Some(sink) => (&**sink).write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.0 {
            Some(sink) => (&**sink).flush(),
            None => Ok(()),
        }
    }
}

/// 按大小滚动的日志文件：`hostify.log` → `hostify.1.log` → … → `hostify.N.log`。
#[derive(Debug)]
pub struct RotatingFile {
    settings: LoggerSettings,
    state: Mutex<RotatingState>,
}

#[derive(Debug)]
struct RotatingState {
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    pub fn open(settings: &LoggerSettings) -> Result<Self> {
        if let Some(parent) = settings.base_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ServiceError::invalid_config(format!(
                        "failed to create the logging directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let file = open_append(&settings.base_path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            settings: settings.clone(),
            state: Mutex::new(RotatingState {
                file: Some(file),
                written,
            }),
        })
    }

    /// 刷新并摘除文件句柄，之后的写入被丢弃。
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(mut file) = state.file.take() {
                let _ = file.flush();
            }
        }
    }

    fn rotate(&self, state: &mut RotatingState) -> io::Result<()> {
        drop(state.file.take());
        let base = &self.settings.base_path;
        // 从最旧的开始向后挪，最后一个被覆盖
        for index in (1..self.settings.max_files).rev() {
            let src = rotated_path(base, index);
            if src.exists() {
                fs::rename(&src, rotated_path(base, index + 1))?;
            }
        }
        if base.exists() {
            fs::rename(base, rotated_path(base, 1))?;
        }
        state.file = Some(open_append(base)?);
        state.written = 0;
        Ok(())
    }
}

impl Write for &RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink poisoned"))?;
        if state.file.is_none() {
            return Ok(buf.len());
        }
        if state.written > 0 && state.written + buf.len() as u64 > self.settings.max_size {
            self.rotate(&mut state)?;
        }
        let Some(file) = state.file.as_mut() else {
            return Ok(buf.len());
        };
        file.write_all(buf)?;
        state.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock() {
            Ok(mut state) => state.file.as_mut().map_or(Ok(()), |f| f.flush()),
            Err(_) => Ok(()),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `dir/name.ext` → `dir/name.<index>.ext`
fn rotated_path(base: &Path, index: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}.{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{index}"),
    };
    base.with_file_name(name)
}
