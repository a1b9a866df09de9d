//! 镜像任务的生成
//!
//! 把比较器输出的差异消息按照镜像选项转换为复制/删除任务。

use crate::config::ParallelConfig;
use crate::core::difference::{object_difference, DiffMessage, DiffOptions, DiffType};
use crate::core::filter::ExcludeFilter;
use crate::core::urls::Urls;
use crate::error::MirrorError;
use crate::storage::{join_url, Client, ClientContent, StatOptions, WriteOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// 镜像选项，一次运行内不变
#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// 只统计，不修改目标
    pub is_fake: bool,
    /// 覆盖内容不同的目标对象
    pub is_overwrite: bool,
    /// 删除源中不存在的目标对象
    pub is_remove: bool,
    /// 初始同步后持续监听源的变更
    pub is_watch: bool,
    /// 监听模式下跳过初始同步
    pub skip_initial_sync: bool,
    /// 双活模式
    pub active_active: bool,
    /// 比较用户元数据
    pub is_metadata: bool,
    /// 比较修改时间
    pub is_mtime: bool,
    pub exclude: Vec<String>,
    pub older_than: Option<String>,
    pub newer_than: Option<String>,
    pub storage_class: Option<String>,
    /// 上传时附加的用户元数据
    pub user_metadata: BTreeMap<String, String>,
    /// 上传时让服务端校验内容
    pub md5: bool,
    pub disable_multipart: bool,
    /// 创建存储桶时使用的区域
    pub region: String,
    pub parallel: ParallelConfig,
}

impl MirrorOptions {
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            is_metadata: self.is_metadata,
            is_mtime: self.is_mtime,
            active_active: self.active_active,
        }
    }

    /// 创建目标客户端时使用的写入选项
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            storage_class: self.storage_class.clone(),
            checksum: self.md5,
        }
    }

    fn overwrite_allowed(&self) -> bool {
        self.is_overwrite || self.is_fake || self.active_active
    }
}

/// 镜像的一端：别名和对应的客户端
#[derive(Clone)]
pub struct Endpoint {
    pub alias: String,
    pub client: Arc<dyn Client>,
}

impl Endpoint {
    pub fn new(alias: impl Into<String>, client: Arc<dyn Client>) -> Self {
        Self {
            alias: alias.into(),
            client,
        }
    }

    /// 用于消息显示的完整路径
    pub fn display(&self, key: &str) -> String {
        join_url(self.client.url(), key)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("alias", &self.alias)
            .field("url", &self.client.url())
            .finish()
    }
}

/// 根据一条差异消息生成任务，不需要处理时返回 None
pub fn delta_source_target(
    diff: DiffMessage,
    source: &Endpoint,
    target: &Endpoint,
    opts: &MirrorOptions,
    exclude: &ExcludeFilter,
) -> Option<Urls> {
    if let Some(err) = diff.error {
        return Some(Urls::from_error(err));
    }

    let excluded = |key: &Option<String>| key.as_deref().is_some_and(|k| exclude.is_excluded(k));
    if excluded(&diff.first_url) || excluded(&diff.second_url) {
        debug!(
            "排除: {}",
            diff.first_url.as_deref().or(diff.second_url.as_deref()).unwrap_or_default()
        );
        return None;
    }

    match diff.diff {
        DiffType::InNone => None,
        DiffType::InType => {
            let key = diff.second_url.unwrap_or_default();
            Some(Urls::from_error(MirrorError::InvalidTarget(
                target.display(&key),
            )))
        }
        DiffType::InSize | DiffType::InMetadata | DiffType::InMTime | DiffType::InAASourceMTime => {
            let key = diff.second_url.unwrap_or_default();
            if !opts.overwrite_allowed() {
                return Some(Urls::from_error(MirrorError::OverwriteNotAllowed(
                    target.display(&key),
                )));
            }
            let content = diff.first_content?;
            Some(Urls::copy(
                &source.alias,
                content,
                &target.alias,
                ClientContent::new(key),
            ))
        }
        DiffType::InFirst => {
            let content = diff.first_content?;
            let key = content.url.clone();
            Some(Urls::copy(
                &source.alias,
                content,
                &target.alias,
                ClientContent::new(key),
            ))
        }
        DiffType::InSecond => {
            if !opts.is_remove && !opts.is_fake {
                return None;
            }
            let content = diff.second_content?;
            Some(Urls::remove(&target.alias, content))
        }
        DiffType::Unknown => Some(Urls::from_error(MirrorError::UnrecognizedDiffType(
            diff.first_url
                .or(diff.second_url)
                .unwrap_or_else(|| DiffType::Unknown.to_string()),
        ))),
    }
}

/// 比较源和目标，输出需要执行的任务
pub fn prepare_mirror_urls(
    source: Endpoint,
    target: Endpoint,
    opts: MirrorOptions,
    exclude: Arc<ExcludeFilter>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Urls> {
    let (tx, rx) = mpsc::channel(1000);
    let mut diff_rx = object_difference(
        Arc::clone(&source.client),
        Arc::clone(&target.client),
        opts.diff_options(),
        cancel.clone(),
    );

    tokio::spawn(async move {
        loop {
            let diff = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                diff = diff_rx.recv() => match diff {
                    Some(diff) => diff,
                    None => break,
                },
            };
            let Some(urls) = delta_source_target(diff, &source, &target, &opts, &exclude) else {
                continue;
            };
            if tx.send(urls).await.is_err() {
                break;
            }
        }
    });

    rx
}

/// 检查镜像参数
///
/// 非监听模式下源必须是存在的目录（或前缀）。
pub async fn check_mirror_syntax(source: &Endpoint, opts: &MirrorOptions) -> Result<(), MirrorError> {
    if opts.skip_initial_sync && !opts.is_watch {
        return Err(MirrorError::InvalidSource(
            "`--skip-initial-sync` 只能与 `--watch` 一起使用".to_string(),
        ));
    }
    if opts.is_watch || opts.active_active {
        return Ok(());
    }

    match source.client.stat("", StatOptions::default()).await {
        Ok(content) if content.is_dir() => Ok(()),
        Ok(_) => Err(MirrorError::InvalidSource(format!(
            "`{}` 不是目录",
            source.client.url()
        ))),
        Err(e) => {
            error!("无法获取源信息: {} ({})", source.client.url(), e);
            Err(MirrorError::Client(e))
        }
    }
}
