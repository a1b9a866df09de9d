//! 进度与结果输出
//!
//! 三种实现：进度条（默认）、安静模式（逐条输出文本消息）和
//! JSON 模式（逐条输出 JSON 消息）。三者共享同一个计数器。

use crate::error::MirrorError;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 可输出的消息
pub trait Message: Send + Sync {
    /// 文本形式
    fn string(&self) -> String;
    /// JSON 形式
    fn json(&self) -> String;
}

/// 复制成功消息
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorMessage {
    pub status: String,
    pub source: String,
    pub target: String,
    pub size: u64,
    pub total_count: u64,
    pub total_size: u64,
}

impl Message for MirrorMessage {
    fn string(&self) -> String {
        format!("`{}` -> `{}`", self.source, self.target)
    }

    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 删除成功消息
#[derive(Debug, Clone, Serialize)]
pub struct RemoveMessage {
    pub status: String,
    pub key: String,
    #[serde(rename = "dryRun")]
    pub dry_run: bool,
}

impl Message for RemoveMessage {
    fn string(&self) -> String {
        if self.dry_run {
            format!("Removed `{}` (dry run)", self.key)
        } else {
            format!("Removed `{}`", self.key)
        }
    }

    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 错误消息
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub status: String,
    pub message: String,
    pub cause: String,
}

impl Message for ErrorMessage {
    fn string(&self) -> String {
        format!("s3mirror: <ERROR> {} {}", self.message, self.cause)
    }

    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 传输统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStat {
    pub status: String,
    pub total: u64,
    pub transferred: u64,
    pub duration: Duration,
    /// 字节/秒
    pub speed: f64,
}

impl Message for AccountStat {
    fn string(&self) -> String {
        format!(
            "Total: {}, Transferred: {}, Speed: {}/s",
            format_bytes(self.total),
            format_bytes(self.transferred),
            format_bytes(self.speed as u64)
        )
    }

    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn format_bytes(n: u64) -> String {
    indicatif::HumanBytes(n).to_string()
}

/// 字节/对象计数器
#[derive(Debug)]
pub struct Accounter {
    current: AtomicU64,
    total: AtomicU64,
    counts: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl Default for Accounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Accounter {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            total: AtomicU64::new(0),
            counts: AtomicU64::new(0),
            started: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.get_or_insert_with(Instant::now);
    }

    pub fn add(&self, n: u64) -> u64 {
        self.current.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn stat(&self) -> AccountStat {
        let elapsed = self
            .started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|s| s.elapsed())
            .unwrap_or_default();
        let transferred = self.current.load(Ordering::SeqCst);
        let secs = elapsed.as_secs_f64();
        AccountStat {
            status: "success".to_string(),
            total: self.total.load(Ordering::SeqCst),
            transferred,
            duration: elapsed,
            speed: if secs > 0.0 { transferred as f64 / secs } else { 0.0 },
        }
    }
}

/// 输出方式
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    pub json: bool,
    pub quiet: bool,
}

/// 进度/结果输出接口
pub trait Status: Send + Sync {
    /// 增加已传输字节数
    fn add(&self, n: u64);
    fn get(&self) -> u64;
    fn set_total(&self, n: u64);
    fn total(&self) -> u64;
    fn add_counts(&self, n: u64);
    fn get_counts(&self) -> u64;
    fn set_caption(&self, caption: &str);
    fn print_msg(&self, msg: &dyn Message);
    fn start(&self);
    fn finish(&self);
    fn error_if(&self, err: &MirrorError, msg: &str);
}

/// 根据输出配置创建 Status
pub fn new_status(output: OutputConfig) -> Arc<dyn Status> {
    if output.json {
        Arc::new(JsonStatus::default())
    } else if output.quiet {
        Arc::new(QuietStatus::default())
    } else {
        Arc::new(ProgressStatus::new())
    }
}

macro_rules! impl_accounting {
    () => {
        fn add(&self, n: u64) {
            self.accounter.add(n);
        }

        fn get(&self) -> u64 {
            self.accounter.current.load(Ordering::SeqCst)
        }

        fn set_total(&self, n: u64) {
            self.accounter.total.store(n, Ordering::SeqCst);
        }

        fn total(&self) -> u64 {
            self.accounter.total.load(Ordering::SeqCst)
        }

        fn add_counts(&self, n: u64) {
            self.accounter.counts.fetch_add(n, Ordering::SeqCst);
        }

        fn get_counts(&self) -> u64 {
            self.accounter.counts.load(Ordering::SeqCst)
        }
    };
}

/// 安静模式：不显示进度条，逐条输出消息
#[derive(Debug, Default)]
pub struct QuietStatus {
    accounter: Accounter,
}

impl Status for QuietStatus {
    impl_accounting!();

    fn set_caption(&self, _caption: &str) {}

    fn print_msg(&self, msg: &dyn Message) {
        println!("{}", msg.string());
    }

    fn start(&self) {
        self.accounter.start();
    }

    fn finish(&self) {
        println!("{}", self.accounter.stat().string());
    }

    fn error_if(&self, err: &MirrorError, msg: &str) {
        tracing::error!("{}: {}", msg, err);
        eprintln!(
            "{}",
            ErrorMessage {
                status: "error".to_string(),
                message: msg.to_string(),
                cause: err.to_string(),
            }
            .string()
        );
    }
}

/// JSON 模式
#[derive(Debug, Default)]
pub struct JsonStatus {
    accounter: Accounter,
}

impl Status for JsonStatus {
    impl_accounting!();

    fn set_caption(&self, _caption: &str) {}

    fn print_msg(&self, msg: &dyn Message) {
        println!("{}", msg.json());
    }

    fn start(&self) {
        self.accounter.start();
    }

    fn finish(&self) {
        println!("{}", self.accounter.stat().json());
    }

    fn error_if(&self, err: &MirrorError, msg: &str) {
        tracing::error!("{}: {}", msg, err);
        let msg = ErrorMessage {
            status: "error".to_string(),
            message: msg.to_string(),
            cause: err.to_string(),
        };
        println!("{}", msg.json());
    }
}

/// 进度条模式，不输出单条消息
pub struct ProgressStatus {
    accounter: Accounter,
    bar: ProgressBar,
}

impl Default for ProgressStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStatus {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {msg} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self {
            accounter: Accounter::new(),
            bar,
        }
    }
}

impl Status for ProgressStatus {
    fn add(&self, n: u64) {
        self.accounter.add(n);
        self.bar.inc(n);
    }

    fn get(&self) -> u64 {
        self.accounter.current.load(Ordering::SeqCst)
    }

    fn set_total(&self, n: u64) {
        self.accounter.total.store(n, Ordering::SeqCst);
        self.bar.set_length(n);
    }

    fn total(&self) -> u64 {
        self.accounter.total.load(Ordering::SeqCst)
    }

    fn add_counts(&self, n: u64) {
        self.accounter.counts.fetch_add(n, Ordering::SeqCst);
    }

    fn get_counts(&self) -> u64 {
        self.accounter.counts.load(Ordering::SeqCst)
    }

    fn set_caption(&self, caption: &str) {
        self.bar.set_message(caption.to_string());
    }

    fn print_msg(&self, _msg: &dyn Message) {}

    fn start(&self) {
        self.accounter.start();
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
        println!("{}", self.accounter.stat().string());
    }

    fn error_if(&self, err: &MirrorError, msg: &str) {
        tracing::error!("{}: {}", msg, err);
        let line = ErrorMessage {
            status: "error".to_string(),
            message: msg.to_string(),
            cause: err.to_string(),
        }
        .string();
        self.bar.suspend(|| eprintln!("{}", line));
    }
}
