use super::{
    ByteStream, Client, ClientContent, ContentStream, DirOpt, EventInfo, EventType,
    GetOptions, ListOptions, PutOptions, RemoveOptions, StatOptions, WatchObject, WatchOptions,
};
use crate::error::ClientError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 写入中的临时文件后缀，列举和监听时跳过
const TEMP_SUFFIX: &str = ".part.s3mirror";

/// 本地目录客户端
pub struct LocalClient {
    base_path: PathBuf,
    name: String,
}

impl LocalClient {
    /// 不会创建目录，目标目录在第一次写入时创建
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let base_path = path.into();
        let name = base_path.to_string_lossy().to_string();
        Self { base_path, name }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// 相对路径转换为 key，非 UTF-8 路径返回 None
    fn relative_key(base: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(base).ok()?;
        let key = relative.to_str()?.replace('\\', "/");
        Some(key)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    /// 写入临时文件并设置修改时间，返回写入的字节数
    async fn write_temp(
        temp_path: &Path,
        mut data: ByteStream,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<u64, ClientError> {
        let mut file = fs::File::create(temp_path).await?;
        let mut written = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        if let Some(mtime) = mtime {
            set_mtime(temp_path, mtime).await?;
        }
        Ok(written)
    }

    fn content_from_metadata(key: String, metadata: &std::fs::Metadata) -> ClientContent {
        let time = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        if metadata.is_dir() {
            ClientContent {
                time,
                ..ClientContent::folder(key)
            }
        } else {
            ClientContent::file(key, metadata.len(), time)
        }
    }

    /// 把 notify 事件转换为对象事件，目录事件忽略
    async fn convert_event(base: &Path, event: notify::Event) -> Vec<EventInfo> {
        let event_type = match event.kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => EventType::ObjectCreated,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                EventType::ObjectRemoved
            }
            _ => return Vec::new(),
        };

        let mut events = Vec::new();
        for path in event.paths {
            let Some(key) = Self::relative_key(base, &path) else {
                continue;
            };
            if key.is_empty() || key.ends_with(TEMP_SUFFIX) {
                continue;
            }
            match event_type {
                EventType::ObjectCreated => {
                    let Ok(metadata) = fs::metadata(&path).await else {
                        continue;
                    };
                    if metadata.is_dir() {
                        continue;
                    }
                    let content = Self::content_from_metadata(key, &metadata);
                    events.push(EventInfo {
                        time: content.time,
                        size: content.size,
                        path: content.url,
                        event_type,
                        user_metadata: Default::default(),
                    });
                }
                _ => events.push(EventInfo {
                    time: Utc::now(),
                    size: 0,
                    path: key,
                    event_type,
                    user_metadata: Default::default(),
                }),
            }
        }
        events
    }
}

#[async_trait]
impl Client for LocalClient {
    fn url(&self) -> &str {
        &self.name
    }

    fn endpoint_id(&self) -> String {
        "local".to_string()
    }

    fn full_key(&self, key: &str) -> String {
        self.resolve_path(key).to_string_lossy().to_string()
    }

    async fn list(&self, opts: ListOptions) -> Result<ContentStream, ClientError> {
        let base = self.base_path.clone();
        if !base.exists() {
            return Ok(futures::stream::empty().boxed());
        }

        // 使用 spawn_blocking 避免阻塞 async runtime
        let mut entries: Vec<Result<ClientContent, ClientError>> =
            tokio::task::spawn_blocking(move || {
                let mut walker = WalkDir::new(&base).follow_links(false).min_depth(1);
                if !opts.recursive {
                    walker = walker.max_depth(1);
                }
                walker
                    .into_iter()
                    .filter_map(|entry| {
                        let entry = match entry {
                            Ok(e) => e,
                            Err(e) => return Some(Err(ClientError::from(std::io::Error::from(e)))),
                        };
                        let Some(key) = Self::relative_key(&base, entry.path()) else {
                            warn!("跳过非 UTF-8 路径: {:?}", entry.path());
                            return None;
                        };
                        if key.ends_with(TEMP_SUFFIX) {
                            return None;
                        }
                        let metadata = match entry.metadata() {
                            Ok(m) => m,
                            Err(e) => return Some(Err(ClientError::from(std::io::Error::from(e)))),
                        };
                        if metadata.is_dir() && (opts.recursive && opts.dir_opt == DirOpt::None) {
                            return None;
                        }
                        Some(Ok(Self::content_from_metadata(key, &metadata)))
                    })
                    .collect()
            })
            .await
            .map_err(|e| ClientError::Io(e.to_string()))?;

        // walkdir 按文件名排序，与完整 key 的字典序不一致
        entries.sort_by(|a, b| match (a, b) {
            (Ok(a), Ok(b)) => a.url.as_bytes().cmp(b.url.as_bytes()),
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Err(_)) => std::cmp::Ordering::Equal,
        });

        Ok(futures::stream::iter(entries).boxed())
    }

    async fn stat(&self, path: &str, _opts: StatOptions) -> Result<ClientContent, ClientError> {
        let full_path = self.resolve_path(path);
        let metadata = fs::metadata(&full_path).await?;
        Ok(Self::content_from_metadata(
            path.trim_start_matches('/').to_string(),
            &metadata,
        ))
    }

    async fn get(&self, path: &str, _opts: GetOptions) -> Result<ByteStream, ClientError> {
        let full_path = self.resolve_path(path);
        if full_path.is_dir() {
            return Err(ClientError::ObjectAlreadyExistsAsDirectory(path.to_string()));
        }
        let file = fs::File::open(&full_path).await?;
        Ok(ReaderStream::new(file).map_err(ClientError::from).boxed())
    }

    async fn put(
        &self,
        path: &str,
        data: ByteStream,
        _size: u64,
        opts: PutOptions,
    ) -> Result<u64, ClientError> {
        let full_path = self.resolve_path(path);
        if full_path.is_dir() {
            return Err(ClientError::ObjectAlreadyExistsAsDirectory(path.to_string()));
        }
        if !opts.user_metadata.is_empty() {
            debug!("本地存储不保存元数据: {}", path);
        }

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = Self::temp_path(&full_path);
        let result = match Self::write_temp(&temp_path, data, opts.mtime).await {
            Ok(written) => fs::rename(&temp_path, &full_path)
                .await
                .map(|_| written)
                .map_err(ClientError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn copy(
        &self,
        source_path: &str,
        target_path: &str,
        opts: PutOptions,
    ) -> Result<(), ClientError> {
        let from = PathBuf::from(source_path);
        let to = self.resolve_path(target_path);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path(&to);
        let result = async {
            fs::copy(&from, &temp_path).await?;
            if let Some(mtime) = opts.mtime {
                set_mtime(&temp_path, mtime).await?;
            }
            fs::rename(&temp_path, &to).await?;
            Ok::<(), ClientError>(())
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn remove(&self, paths: Vec<String>, opts: RemoveOptions) -> Vec<(String, ClientError)> {
        let mut failed = Vec::new();
        for path in paths {
            let full_path = self.resolve_path(&path);
            let result = if full_path.is_dir() {
                if opts.is_bucket {
                    fs::remove_dir_all(&full_path).await
                } else {
                    fs::remove_dir(&full_path).await
                }
            } else {
                fs::remove_file(&full_path).await
            };
            if let Err(e) = result {
                failed.push((path, ClientError::from(e)));
            }
        }
        failed
    }

    async fn make_bucket(&self, bucket: &str, _region: &str) -> Result<(), ClientError> {
        let full_path = self.resolve_path(bucket);
        if full_path.is_file() {
            return Err(ClientError::ObjectAlreadyExists(bucket.to_string()));
        }
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    async fn watch(&self, opts: WatchOptions) -> Result<WatchObject, ClientError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| ClientError::Backend(e.to_string()))?;

        let mode = if opts.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&self.base_path, mode)
            .map_err(|e| ClientError::Backend(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(100);
        let (error_tx, error_rx) = mpsc::channel(1);
        let done = CancellationToken::new();
        let stop = done.clone();
        let base = self.base_path.clone();

        tokio::spawn(async move {
            // watcher 被 drop 后不再产生事件
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    res = raw_rx.recv() => match res {
                        None => break,
                        Some(Ok(event)) => {
                            let events: Vec<EventInfo> = Self::convert_event(&base, event)
                                .await
                                .into_iter()
                                .filter(|e| e.path.starts_with(&opts.prefix) && e.path.ends_with(&opts.suffix))
                                .collect();
                            if !events.is_empty() && event_tx.send(events).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = error_tx.send(ClientError::Backend(e.to_string())).await;
                            break;
                        }
                    }
                }
            }
            debug!("本地监听结束: {:?}", base);
        });

        Ok(WatchObject {
            events: event_rx,
            errors: error_rx,
            done,
        })
    }
}

async fn set_mtime(path: &Path, mtime: DateTime<Utc>) -> Result<(), ClientError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::from(mtime))
    })
    .await
    .map_err(|e| ClientError::Io(e.to_string()))??;
    Ok(())
}
