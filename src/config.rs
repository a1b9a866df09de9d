//! 应用配置模块
//!
//! 所有配置都保存在配置目录下的 `config.json` 中，每个部分单独解析，
//! 缺失或损坏的部分回退到默认值。

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// 存储类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
}

/// 别名对应的存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    /// 本地存储根目录
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

/// 并行传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelConfig {
    /// 工作者数量上限（至少 2：长任务和短任务通道各一个）
    pub max_workers: usize,
    /// 短任务通道的初始工作者数量
    pub initial_workers: usize,
    /// 每次带宽提升后新增的工作者数量
    pub workers_per_tick: usize,
    /// 带宽采样周期（毫秒）
    pub monitor_period_ms: u64,
    /// 连续多少次带宽未提升后停止扩容
    pub stagnation_limit: u32,
    /// 超过该大小（字节）的对象走长任务通道
    pub large_object_threshold: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            max_workers: 128,
            initial_workers: cores,
            workers_per_tick: cores,
            monitor_period_ms: 4000,
            stagnation_limit: 3,
            large_object_threshold: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl ParallelConfig {
    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms.max(1))
    }
}

fn default_error_exit_status() -> i32 {
    1
}

/// 完整的应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub aliases: BTreeMap<String, StorageConfig>,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// 存在失败任务时的退出码
    #[serde(default = "default_error_exit_status")]
    pub error_exit_status: i32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            aliases: BTreeMap::new(),
            parallel: ParallelConfig::default(),
            log: LogConfig::default(),
            error_exit_status: default_error_exit_status(),
        }
    }
}

impl AppConfig {
    /// 从配置目录加载，逐个部分解析
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        let value = match fs::read_to_string(&config_file) {
            Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(v) => v,
                Err(e) => {
                    warn!("配置文件解析失败，使用默认配置: {:?} ({})", config_file, e);
                    return Self::default();
                }
            },
            Err(_) => {
                debug!("未找到配置文件，使用默认配置: {:?}", config_file);
                return Self::default();
            }
        };

        let mut config = Self::default();
        if let Some(aliases) = value.get("aliases") {
            match serde_json::from_value(aliases.clone()) {
                Ok(a) => config.aliases = a,
                Err(e) => warn!("别名配置无效: {}", e),
            }
        }
        if let Some(parallel) = value.get("parallel") {
            match serde_json::from_value(parallel.clone()) {
                Ok(p) => config.parallel = p,
                Err(e) => warn!("并行配置无效: {}", e),
            }
        }
        if let Some(log) = value.get("log") {
            if let Ok(l) = serde_json::from_value(log.clone()) {
                config.log = l;
            }
        }
        if let Some(status) = value.get("errorExitStatus").and_then(|v| v.as_i64()) {
            config.error_exit_status = status as i32;
        }
        config
    }

    /// 保存到配置目录（保留其他未知字段）
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join("config.json");

        let mut value: serde_json::Value = fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let ours = serde_json::to_value(self).map_err(io::Error::other)?;
        if let (Some(target), serde_json::Value::Object(fields)) = (value.as_object_mut(), ours) {
            for (k, v) in fields {
                target.insert(k, v);
            }
        }

        let content = serde_json::to_string_pretty(&value).map_err(io::Error::other)?;
        fs::write(&config_file, content)
    }
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("s3mirror"))
        .unwrap_or_else(|| PathBuf::from(".s3mirror"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path());
        assert!(config.aliases.is_empty());
        assert_eq!(config.parallel.max_workers, 128);
        assert_eq!(config.error_exit_status, 1);
    }

    #[test]
    fn test_load_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "aliases": {
                    "play": {"type": "s3", "endpoint": "https://play.example.com", "accessKey": "a", "secretKey": "b"}
                },
                "parallel": {"maxWorkers": 16, "stagnationLimit": 5},
                "errorExitStatus": 3
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(dir.path());
        let play = config.aliases.get("play").unwrap();
        assert_eq!(play.typ, StorageType::S3);
        assert_eq!(play.access_key.as_deref(), Some("a"));
        assert_eq!(config.parallel.max_workers, 16);
        assert_eq!(config.parallel.stagnation_limit, 5);
        // 未指定的字段使用默认值
        assert_eq!(config.parallel.monitor_period_ms, 4000);
        assert_eq!(config.error_exit_status, 3);
    }

    #[test]
    fn test_save_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"custom": 42}"#).unwrap();

        let mut config = AppConfig::default();
        config.error_exit_status = 7;
        config.save(dir.path()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["custom"], 42);
        assert_eq!(value["errorExitStatus"], 7);
    }
}
