//! 内存存储客户端
//!
//! 多个客户端可以共享同一个存储（通过 [`MemoryClient::scoped`]），
//! 共享存储的客户端之间可以使用服务端复制。每次写入和删除都会
//! 记录到变更计数，并向监听者发送事件。

use super::{
    ByteStream, Client, ClientContent, ContentStream, ContentType, EventInfo, EventType,
    GetOptions, ListOptions, PutOptions, RemoveOptions, StatOptions, WatchObject, WatchOptions,
};
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct MemoryObject {
    data: Bytes,
    content: ClientContent,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, MemoryObject>,
    watchers: Vec<mpsc::Sender<Vec<EventInfo>>>,
    /// 列举到第 n 个条目时返回错误
    fail_listing_at: Option<usize>,
    denied: HashSet<String>,
    /// 列举结果不带用户元数据
    bare_listing: bool,
}

struct MemoryStore {
    id: String,
    state: Mutex<MemoryState>,
    mutations: AtomicU64,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MemoryClient {
    store: Arc<MemoryStore>,
    prefix: String,
    name: String,
}

impl MemoryClient {
    pub fn new(name: &str) -> Self {
        Self {
            store: Arc::new(MemoryStore {
                id: name.to_string(),
                state: Mutex::new(MemoryState::default()),
                mutations: AtomicU64::new(0),
            }),
            prefix: String::new(),
            name: format!("mem://{}", name),
        }
    }

    /// 共享同一存储、以 `prefix` 为根的客户端
    pub fn scoped(&self, prefix: &str) -> Self {
        let prefix = format!("{}{}/", self.prefix, prefix.trim_matches('/'));
        Self {
            store: Arc::clone(&self.store),
            name: format!("mem://{}/{}", self.store.id, prefix.trim_end_matches('/')),
            prefix,
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.trim_start_matches('/'))
    }

    /// 插入对象，不计入变更也不触发事件
    pub fn insert(&self, key: &str, data: &[u8], time: DateTime<Utc>) {
        self.insert_with_metadata(key, data, time, BTreeMap::new());
    }

    pub fn insert_with_metadata(
        &self,
        key: &str,
        data: &[u8],
        time: DateTime<Utc>,
        user_metadata: BTreeMap<String, String>,
    ) {
        let full = self.store_key(key);
        let content = ClientContent {
            user_metadata,
            ..ClientContent::file(full.clone(), data.len() as u64, time)
        };
        self.store.lock().objects.insert(
            full,
            MemoryObject {
                data: Bytes::copy_from_slice(data),
                content,
            },
        );
    }

    /// 插入一个目录占位条目
    pub fn insert_folder(&self, key: &str) {
        let full = self.store_key(key);
        self.store.lock().objects.insert(
            full.clone(),
            MemoryObject {
                data: Bytes::new(),
                content: ClientContent::folder(full),
            },
        );
    }

    pub fn fail_listing_at(&self, n: usize) {
        self.store.lock().fail_listing_at = Some(n);
    }

    /// 列举结果不再带用户元数据（与 S3 列举一致），stat 仍然返回完整元数据
    pub fn omit_listing_metadata(&self) {
        self.store.lock().bare_listing = true;
    }

    /// 删除该 key 时返回权限错误
    pub fn deny_remove(&self, key: &str) {
        let full = self.store_key(key);
        self.store.lock().denied.insert(full);
    }

    /// 写入、复制、删除、建桶的总次数
    pub fn mutations(&self) -> u64 {
        self.store.mutations.load(Ordering::SeqCst)
    }

    /// 当前客户端可见的 key（相对路径）
    pub fn keys(&self) -> Vec<String> {
        self.store
            .lock()
            .objects
            .keys()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(|s| s.to_string()))
            .collect()
    }

    pub fn object(&self, key: &str) -> Option<(Bytes, ClientContent)> {
        let full = self.store_key(key);
        self.store.lock().objects.get(&full).map(|o| {
            let mut content = o.content.clone();
            content.url = key.to_string();
            (o.data.clone(), content)
        })
    }

    /// 模拟服务端通知
    pub async fn emit(&self, events: Vec<EventInfo>) {
        let events: Vec<EventInfo> = events
            .into_iter()
            .map(|mut e| {
                e.path = self.store_key(&e.path);
                e
            })
            .collect();
        self.broadcast(events).await;
    }

    /// 关闭所有监听，事件通道随之结束
    pub fn close_watchers(&self) {
        self.store.lock().watchers.clear();
    }

    /// 仍在监听的数量
    pub fn watchers(&self) -> usize {
        let mut state = self.store.lock();
        state.watchers.retain(|w| !w.is_closed());
        state.watchers.len()
    }

    async fn broadcast(&self, events: Vec<EventInfo>) {
        let watchers = {
            let mut state = self.store.lock();
            state.watchers.retain(|w| !w.is_closed());
            state.watchers.clone()
        };
        for watcher in watchers {
            let _ = watcher.send(events.clone()).await;
        }
    }

    fn relative(&self, content: &ClientContent) -> Option<ClientContent> {
        let key = content.url.strip_prefix(&self.prefix)?;
        Some(ClientContent {
            url: key.to_string(),
            ..content.clone()
        })
    }

    fn apply_put(&self, key: &str, data: Bytes, opts: &PutOptions) -> EventInfo {
        let full = self.store_key(key);
        let now = Utc::now();
        let content = ClientContent {
            storage_class: opts.storage_class.clone(),
            user_metadata: opts.user_metadata.clone(),
            ..ClientContent::file(full.clone(), data.len() as u64, now)
        };
        let event = EventInfo {
            time: now,
            size: content.size,
            path: full.clone(),
            event_type: EventType::ObjectCreated,
            user_metadata: opts.user_metadata.clone(),
        };
        self.store
            .lock()
            .objects
            .insert(full, MemoryObject { data, content });
        self.store.mutations.fetch_add(1, Ordering::SeqCst);
        event
    }
}

#[async_trait]
impl Client for MemoryClient {
    fn url(&self) -> &str {
        &self.name
    }

    fn endpoint_id(&self) -> String {
        format!("mem:{}", self.store.id)
    }

    fn full_key(&self, key: &str) -> String {
        self.store_key(key)
    }

    fn listing_has_metadata(&self) -> bool {
        !self.store.lock().bare_listing
    }

    async fn list(&self, opts: ListOptions) -> Result<ContentStream, ClientError> {
        let (entries, fail_at) = {
            let state = self.store.lock();
            let bare = state.bare_listing;
            let entries: Vec<ClientContent> = state
                .objects
                .range(self.prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&self.prefix))
                .filter_map(|(_, o)| self.relative(&o.content))
                .filter(|c| opts.recursive || !c.url.contains('/'))
                .map(|mut c| {
                    if bare {
                        c.user_metadata.clear();
                    }
                    c
                })
                .collect();
            (entries, state.fail_listing_at)
        };

        let mut items: Vec<Result<ClientContent, ClientError>> =
            entries.into_iter().map(Ok).collect();
        if let Some(n) = fail_at {
            items.truncate(n);
            items.push(Err(ClientError::Backend("列举中断".to_string())));
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn stat(&self, path: &str, _opts: StatOptions) -> Result<ClientContent, ClientError> {
        if path.is_empty() {
            return Ok(ClientContent::folder(""));
        }
        let full = self.store_key(path);
        let state = self.store.lock();
        match state.objects.get(&full) {
            Some(o) => self
                .relative(&o.content)
                .ok_or_else(|| ClientError::PathNotFound(path.to_string())),
            None => Err(ClientError::PathNotFound(path.to_string())),
        }
    }

    async fn get(&self, path: &str, _opts: GetOptions) -> Result<ByteStream, ClientError> {
        let full = self.store_key(path);
        let object = self.store.lock().objects.get(&full).cloned();
        match object {
            Some(o) if o.content.content_type == ContentType::Folder => {
                Err(ClientError::ObjectAlreadyExistsAsDirectory(path.to_string()))
            }
            Some(o) => {
                // 分块输出，便于统计传输进度
                let chunks: Vec<Result<Bytes, ClientError>> = o
                    .data
                    .chunks(4096)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(futures::stream::iter(chunks).boxed())
            }
            None => Err(ClientError::ObjectMissing(path.to_string())),
        }
    }

    async fn put(
        &self,
        path: &str,
        mut data: ByteStream,
        _size: u64,
        opts: PutOptions,
    ) -> Result<u64, ClientError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = data.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let written = buf.len() as u64;
        let event = self.apply_put(path, buf.freeze(), &opts);
        self.broadcast(vec![event]).await;
        Ok(written)
    }

    async fn copy(
        &self,
        source_path: &str,
        target_path: &str,
        opts: PutOptions,
    ) -> Result<(), ClientError> {
        let object = self.store.lock().objects.get(source_path).cloned();
        let Some(object) = object else {
            return Err(ClientError::ObjectMissing(source_path.to_string()));
        };
        let event = self.apply_put(target_path, object.data, &opts);
        self.broadcast(vec![event]).await;
        Ok(())
    }

    async fn remove(&self, paths: Vec<String>, opts: RemoveOptions) -> Vec<(String, ClientError)> {
        let mut failed = Vec::new();
        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            for path in paths {
                let full = self.store_key(&path);
                if state.denied.contains(&full) {
                    failed.push((path, ClientError::PathInsufficientPermission(full)));
                    continue;
                }
                if opts.is_bucket {
                    let dir = format!("{}/", full);
                    state.objects.retain(|k, _| k != &full && !k.starts_with(&dir));
                } else if state.objects.remove(&full).is_none() {
                    failed.push((path, ClientError::PathNotFound(full)));
                    continue;
                }
                self.store.mutations.fetch_add(1, Ordering::SeqCst);
                events.push(EventInfo {
                    time: Utc::now(),
                    size: 0,
                    path: full,
                    event_type: if opts.is_bucket {
                        EventType::BucketRemoved
                    } else {
                        EventType::ObjectRemoved
                    },
                    user_metadata: BTreeMap::new(),
                });
            }
        }
        if !events.is_empty() {
            self.broadcast(events).await;
        }
        failed
    }

    async fn make_bucket(&self, bucket: &str, _region: &str) -> Result<(), ClientError> {
        let full = self.store_key(bucket);
        {
            let mut state = self.store.lock();
            if let Some(o) = state.objects.get(&full) {
                if o.content.content_type == ContentType::File {
                    return Err(ClientError::ObjectAlreadyExists(bucket.to_string()));
                }
            }
            state.objects.insert(
                full.clone(),
                MemoryObject {
                    data: Bytes::new(),
                    content: ClientContent::folder(full.clone()),
                },
            );
        }
        self.store.mutations.fetch_add(1, Ordering::SeqCst);
        self.broadcast(vec![EventInfo {
            time: Utc::now(),
            size: 0,
            path: full,
            event_type: EventType::BucketCreated,
            user_metadata: BTreeMap::new(),
        }])
        .await;
        Ok(())
    }

    async fn watch(&self, opts: WatchOptions) -> Result<WatchObject, ClientError> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<EventInfo>>(100);
        {
            let mut state = self.store.lock();
            state.watchers.retain(|w| !w.is_closed());
            state.watchers.push(raw_tx);
        }

        let (event_tx, event_rx) = mpsc::channel(100);
        let (_error_tx, error_rx) = mpsc::channel(1);
        let done = CancellationToken::new();
        let stop = done.clone();
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            loop {
                let events = tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = event_tx.closed() => break,
                    events = raw_rx.recv() => match events {
                        Some(events) => events,
                        None => break,
                    },
                };
                let events: Vec<EventInfo> = events
                    .into_iter()
                    .filter_map(|mut e| {
                        let key = e.path.strip_prefix(&prefix)?.to_string();
                        if !key.starts_with(&opts.prefix) || !key.ends_with(&opts.suffix) {
                            return None;
                        }
                        if !opts.recursive && key.contains('/') {
                            return None;
                        }
                        e.path = key;
                        Some(e)
                    })
                    .collect();
                if !events.is_empty() && event_tx.send(events).await.is_err() {
                    break;
                }
            }
        });

        Ok(WatchObject {
            events: event_rx,
            errors: error_rx,
            done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_scoped_listing() {
        let root = MemoryClient::new("m");
        root.insert("src/a", b"1", Utc::now());
        root.insert("src/b/c", b"22", Utc::now());
        root.insert("srcx", b"333", Utc::now());

        let src = root.scoped("src");
        let keys: Vec<String> = src
            .list(ListOptions {
                recursive: true,
                ..Default::default()
            })
            .await
            .unwrap()
            .map_ok(|c| c.url)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys, vec!["a", "b/c"]);
        assert_eq!(src.endpoint_id(), root.endpoint_id());
    }

    #[tokio::test]
    async fn test_put_counts_mutation_and_notifies() {
        let client = MemoryClient::new("m");
        let mut watch = client
            .watch(WatchOptions {
                recursive: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let data: ByteStream = futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed();
        client.put("x/y", data, 3, PutOptions::default()).await.unwrap();
        assert_eq!(client.mutations(), 1);

        let events = watch.events.recv().await.unwrap();
        assert_eq!(events[0].path, "x/y");
        assert_eq!(events[0].event_type, EventType::ObjectCreated);
        assert_eq!(events[0].size, 3);
    }

    #[tokio::test]
    async fn test_listing_failure_injection() {
        let client = MemoryClient::new("m");
        client.insert("a", b"1", Utc::now());
        client.insert("b", b"1", Utc::now());
        client.fail_listing_at(1);

        let items: Vec<_> = client
            .list(ListOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_closed_watchers_are_pruned() {
        let client = MemoryClient::new("m");
        let opts = WatchOptions {
            recursive: true,
            ..Default::default()
        };
        let first = client.watch(opts.clone()).await.unwrap();
        let mut second = client.watch(opts).await.unwrap();
        assert_eq!(client.watchers(), 2);

        drop(first);
        for _ in 0..100 {
            if client.watchers() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(client.watchers(), 1);

        // 剩下的监听仍然收到事件
        client.make_bucket("b", "us-east-1").await.unwrap();
        let events = second.events.recv().await.unwrap();
        assert_eq!(events[0].event_type, EventType::BucketCreated);
        assert_eq!(events[0].path, "b");
    }
}
