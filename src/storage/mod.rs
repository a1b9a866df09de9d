pub mod local;
pub mod memory;
pub mod s3;

use crate::config::{AppConfig, StorageConfig, StorageType};
use crate::error::ClientError;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use local::LocalClient;
pub use memory::MemoryClient;
pub use s3::S3Client;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 对象数据流
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;
/// 列举结果流
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<ClientContent, ClientError>> + Send>>;

/// 条目类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    File,
    Folder,
}

/// 列举/查询得到的条目
///
/// `url` 是相对于客户端根路径的 key，使用 `/` 分隔，不带前导 `/`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientContent {
    pub url: String,
    pub size: u64,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub is_delete_marker: bool,
}

impl ClientContent {
    /// 仅包含路径的条目，用作复制/删除的目标
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn file(url: impl Into<String>, size: u64, time: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            size,
            time,
            ..Default::default()
        }
    }

    pub fn folder(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_type: ContentType::Folder,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.content_type == ContentType::Folder
    }
}

/// 目录在列举结果中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirOpt {
    /// 不输出目录
    #[default]
    None,
    /// 目录先于其内容输出
    First,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub recursive: bool,
    pub include_versions: bool,
    pub dir_opt: DirOpt,
}

#[derive(Debug, Clone, Default)]
pub struct StatOptions {
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub storage_class: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
    pub disable_multipart: bool,
    /// 源对象的修改时间，能设置修改时间的后端（本地）写入后保留它
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// 删除整个存储桶（或本地顶层目录）
    pub is_bucket: bool,
}

/// 创建客户端时确定的写入选项，只对目标客户端有意义
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// 新对象的存储类型
    pub storage_class: Option<String>,
    /// 上传时附带校验和，由服务端校验内容
    pub checksum: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub recursive: bool,
    pub prefix: String,
    pub suffix: String,
}

/// 变更事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    ObjectCreated,
    ObjectRemoved,
    BucketCreated,
    BucketRemoved,
}

/// 变更事件，`path` 相对于被监听客户端的根路径
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInfo {
    pub time: DateTime<Utc>,
    pub size: u64,
    pub path: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub user_metadata: BTreeMap<String, String>,
}

/// 一次 watch 调用返回的事件源
pub struct WatchObject {
    pub events: mpsc::Receiver<Vec<EventInfo>>,
    pub errors: mpsc::Receiver<ClientError>,
    /// 取消后停止产生事件
    pub done: CancellationToken,
}

/// 存储客户端抽象接口
#[async_trait]
pub trait Client: Send + Sync {
    /// 客户端地址（用于日志和消息）
    fn url(&self) -> &str;

    /// 同一端点内的客户端可以使用服务端复制
    fn endpoint_id(&self) -> String;

    /// 相对于端点根的完整 key，作为服务端复制的源路径
    fn full_key(&self, key: &str) -> String;

    /// 列举结果是否带有用户元数据；不带时需要逐个 stat 获取
    fn listing_has_metadata(&self) -> bool {
        true
    }

    /// 列举条目
    async fn list(&self, opts: ListOptions) -> Result<ContentStream, ClientError>;

    /// 获取单个条目，空路径表示客户端根路径
    async fn stat(&self, path: &str, opts: StatOptions) -> Result<ClientContent, ClientError>;

    /// 读取对象数据
    async fn get(&self, path: &str, opts: GetOptions) -> Result<ByteStream, ClientError>;

    /// 写入对象，返回写入的字节数
    async fn put(
        &self,
        path: &str,
        data: ByteStream,
        size: u64,
        opts: PutOptions,
    ) -> Result<u64, ClientError>;

    /// 服务端复制（同一端点内），`source_path` 取自源客户端的 `full_key`
    async fn copy(
        &self,
        _source_path: &str,
        _target_path: &str,
        _opts: PutOptions,
    ) -> Result<(), ClientError> {
        Err(ClientError::NotImplemented(format!(
            "{} 不支持服务端复制",
            self.url()
        )))
    }

    /// 批量删除，只返回失败的路径
    async fn remove(&self, paths: Vec<String>, opts: RemoveOptions) -> Vec<(String, ClientError)>;

    /// 创建存储桶（本地为顶层目录）
    async fn make_bucket(&self, bucket: &str, region: &str) -> Result<(), ClientError>;

    /// 监听变更事件
    async fn watch(&self, _opts: WatchOptions) -> Result<WatchObject, ClientError> {
        Err(ClientError::NotImplemented(format!(
            "{} 不支持事件监听",
            self.url()
        )))
    }
}

/// 解析后的地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    /// 别名，本地路径为空
    pub alias: String,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
}

/// 把 `alias/bucket/prefix` 形式的地址拆分开
pub fn resolve_url(config: &AppConfig, url: &str) -> (ResolvedUrl, Option<StorageConfig>) {
    let trimmed = url.trim_end_matches('/');
    let (first, rest) = match trimmed.split_once('/') {
        Some((a, r)) => (a, Some(r)),
        None => (trimmed, None),
    };

    match config.aliases.get(first) {
        Some(storage) => {
            let (bucket, prefix) = match rest {
                Some(r) => match r.split_once('/') {
                    Some((b, p)) => (Some(b.to_string()), Some(p.to_string())),
                    None => (Some(r.to_string()), None),
                },
                None => (None, None),
            };
            (
                ResolvedUrl {
                    alias: first.to_string(),
                    bucket: bucket.filter(|b| !b.is_empty()),
                    prefix: prefix.filter(|p| !p.is_empty()),
                },
                Some(storage.clone()),
            )
        }
        None => (
            ResolvedUrl {
                alias: String::new(),
                bucket: None,
                prefix: Some(url.to_string()),
            },
            None,
        ),
    }
}

/// 根据地址创建客户端
pub async fn new_client(
    config: &AppConfig,
    url: &str,
    write: &WriteOptions,
) -> Result<(ResolvedUrl, Arc<dyn Client>)> {
    let (resolved, storage) = resolve_url(config, url);

    let client: Arc<dyn Client> = match storage {
        None => {
            tracing::info!("初始化本地客户端: {}", url);
            Arc::new(LocalClient::new(url))
        }
        Some(storage) => match storage.typ {
            StorageType::Local => {
                let root = storage
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow!("本地别名 `{}` 缺少 path", resolved.alias))?;
                let mut path = std::path::PathBuf::from(root);
                if let Some(bucket) = &resolved.bucket {
                    path.push(bucket);
                }
                if let Some(prefix) = &resolved.prefix {
                    path.push(prefix);
                }
                tracing::info!("初始化本地客户端: {:?}", path);
                Arc::new(LocalClient::new(path))
            }
            StorageType::S3 => {
                let Some(bucket) = resolved.bucket.as_deref() else {
                    bail!(
                        "`{}` 未指定存储桶，暂不支持镜像整个别名",
                        url
                    );
                };
                tracing::info!("初始化S3客户端: alias={}, bucket={}", resolved.alias, bucket);
                Arc::new(S3Client::new(
                    &storage,
                    bucket,
                    resolved.prefix.as_deref(),
                    write,
                )?)
            }
        },
    };

    Ok((resolved, client))
}

/// 拼接用于显示的完整路径
pub fn join_url(base: &str, key: &str) -> String {
    if key.is_empty() {
        base.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, key)
    } else {
        format!("{}/{}", base, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_alias() -> AppConfig {
        let mut config = AppConfig::default();
        config.aliases.insert(
            "play".to_string(),
            StorageConfig {
                typ: StorageType::S3,
                path: None,
                endpoint: Some("http://127.0.0.1:9000".to_string()),
                region: None,
                access_key: Some("a".to_string()),
                secret_key: Some("b".to_string()),
            },
        );
        config
    }

    #[test]
    fn test_resolve_alias_url() {
        let config = config_with_alias();
        let (resolved, storage) = resolve_url(&config, "play/photos/2024/");
        assert!(storage.is_some());
        assert_eq!(resolved.alias, "play");
        assert_eq!(resolved.bucket.as_deref(), Some("photos"));
        assert_eq!(resolved.prefix.as_deref(), Some("2024"));
    }

    #[test]
    fn test_resolve_local_path() {
        let config = config_with_alias();
        let (resolved, storage) = resolve_url(&config, "/tmp/data");
        assert!(storage.is_none());
        assert!(resolved.alias.is_empty());
        assert_eq!(resolved.prefix.as_deref(), Some("/tmp/data"));
    }

    #[tokio::test]
    async fn test_alias_root_is_rejected() {
        let config = config_with_alias();
        assert!(new_client(&config, "play", &WriteOptions::default()).await.is_err());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("play/bucket", "a/b"), "play/bucket/a/b");
        assert_eq!(join_url("play/bucket/", "a"), "play/bucket/a");
        assert_eq!(join_url("play/bucket", ""), "play/bucket");
    }
}
