//! 日志模块 - 提供文件日志和大小管理功能

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

type SharedFile = Arc<Mutex<Option<BufWriter<File>>>>;

/// 带大小限制的日志写入器
///
/// 超过大小后 `app.log` 重命名为 `app.log.old`，只保留一个备份。
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: SharedFile,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;
        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        // 启动时已超过限制则先轮转
        if let Ok(metadata) = fs::metadata(file_path) {
            if metadata.len() > max_size {
                Self::rotate_log(file_path)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rotate_if_needed(&self, guard: &mut Option<BufWriter<File>>) -> io::Result<()> {
        let size = fs::metadata(&self.file_path).map(|m| m.len()).unwrap_or(0);
        if size <= self.max_size {
            return Ok(());
        }
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        Self::rotate_log(&self.file_path)?;
        *guard = Some(Self::open_file(&self.file_path, self.max_size)?);
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.lock();
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::other("日志文件不可用"));
        };
        let written = writer.write(buf)?;
        writer.flush()?;
        self.rotate_if_needed(&mut guard)?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// 初始化日志
///
/// 配置了日志目录时写入文件（后台线程写入，返回的 guard 需要保持到
/// 进程结束），否则输出到 stderr。`debug` 强制使用 debug 级别。
pub fn init_logging(
    config: &LogConfig,
    log_dir: Option<&Path>,
    debug: bool,
) -> Option<WorkerGuard> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let mut env_filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["opendal=warn", "hyper=warn", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    let file_writer = log_dir
        .filter(|_| config.enabled)
        .and_then(|dir| SizeRotatingWriter::new(dir, config.max_size_mb).ok());

    match file_writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            let subscriber = tracing_subscriber::registry().with(env_filter).with(file_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
            Some(guard)
        }
        None => {
            let console_layer = tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false);
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
            None
        }
    }
}

/// 日志目录（配置目录下的 logs）
pub fn get_log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.tracing_level(), tracing::Level::INFO);

        let config: LogConfig = serde_json::from_str(r#"{"level":"DEBUG","maxSizeMb":1}"#).unwrap();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        assert_eq!(config.max_size_mb, 1);
    }

    #[test]
    fn test_rotating_writer_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let line = vec![b'x'; 64 * 1024];
        for _ in 0..20 {
            writer.write_all(&line).unwrap();
        }
        writer.flush().unwrap();

        let backup = dir.path().join("app.log.old");
        assert!(backup.exists());
        let current = fs::metadata(writer.file_path()).unwrap().len();
        assert!(current <= 1024 * 1024);
    }
}
