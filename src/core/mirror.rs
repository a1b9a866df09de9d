//! 镜像任务
//!
//! 一次镜像由三部分并发组成：比较源和目标产生初始任务、监听源的
//! 变更事件产生增量任务、消费执行结果并输出状态。任务交给
//! [`ParallelManager`] 执行。
//!
//! 监听和双活模式下由 [`run_mirror`] 负责在出错后重新启动整个任务。

use crate::core::difference::{marked_source_mtime, source_mtime, AA_SOURCE_MTIME_KEY};
use crate::core::filter::{AgeFilter, ExcludeFilter, FilterError};
use crate::core::mirror_url::{check_mirror_syntax, prepare_mirror_urls, Endpoint, MirrorOptions};
use crate::core::parallel::ParallelManager;
use crate::core::status::{MirrorMessage, RemoveMessage, Status};
use crate::core::urls::{TaskKind, Urls};
use crate::core::watch::Watcher;
use crate::error::{ClientError, MirrorError};
use crate::storage::{
    ClientContent, EventInfo, EventType, GetOptions, PutOptions, RemoveOptions, StatOptions,
};
use chrono::{SecondsFormat, Utc};
use futures::{StreamExt, TryStreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 镜像任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Diffing,
    Watching,
    DiffingAndWatching,
    /// 不再产生新任务，等待已入队的任务完成
    Draining,
    Done,
}

/// 一次镜像的结果
#[derive(Debug, Clone, Default)]
pub struct MirrorOutcome {
    /// 存在未被忽略的错误
    pub err_during_mirror: bool,
    /// 需要重新启动任务
    pub retry: bool,
    pub total_objects: u64,
    pub total_bytes: u64,
    pub transferred: u64,
    /// 成功完成的任务数
    pub counts: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct MonitorResult {
    err_during_mirror: bool,
    retry: bool,
    failures: u64,
}

/// 单次镜像任务
pub struct MirrorJob {
    session_id: String,
    opts: MirrorOptions,
    source: Endpoint,
    target: Endpoint,
    status: Arc<dyn Status>,
    parallel: Arc<ParallelManager>,
    status_rx: Mutex<Option<mpsc::Receiver<Urls>>>,
    exclude: Arc<ExcludeFilter>,
    age: AgeFilter,
    total_objects: AtomicU64,
    total_bytes: AtomicU64,
    /// 监听意外结束，需要重新启动
    watch_lost: AtomicBool,
    state: Mutex<JobState>,
    cancel: CancellationToken,
}

impl MirrorJob {
    /// 创建任务，`cancel` 取消后所有生产者停止，已入队的任务尽快结束
    pub fn new(
        source: Endpoint,
        target: Endpoint,
        opts: MirrorOptions,
        status: Arc<dyn Status>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, FilterError> {
        let exclude = Arc::new(ExcludeFilter::new(&opts.exclude)?);
        let age = AgeFilter::parse(opts.older_than.as_deref(), opts.newer_than.as_deref())?;

        let (status_tx, status_rx) = mpsc::channel(1000);
        let parallel = ParallelManager::new(status_tx, opts.parallel.clone());

        Ok(Arc::new(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            opts,
            source,
            target,
            status,
            parallel,
            status_rx: Mutex::new(Some(status_rx)),
            exclude,
            age,
            total_objects: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            watch_lost: AtomicBool::new(false),
            state: Mutex::new(JobState::Idle),
            cancel,
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> JobState {
        *lock(&self.state)
    }

    fn set_state(&self, state: JobState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("[{}] 状态: {:?} -> {:?}", self.session_id, *current, state);
            *current = state;
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 执行镜像，直到所有任务完成（监听模式下直到取消或监听结束）
    pub async fn mirror(self: &Arc<Self>) -> MirrorOutcome {
        let Some(status_rx) = lock(&self.status_rx).take() else {
            warn!("[{}] 镜像任务已经执行过", self.session_id);
            return MirrorOutcome::default();
        };

        info!(
            "[{}] 开始镜像: {} -> {}",
            self.session_id,
            self.source.client.url(),
            self.target.client.url()
        );
        let monitor = tokio::spawn(Arc::clone(self).monitor_mirror_status(status_rx));

        // 先开始监听，避免初始同步期间的变更丢失
        let watcher = if self.opts.is_watch || self.opts.active_active {
            self.prepare_watcher().await
        } else {
            None
        };
        let diffing = !(self.opts.is_watch && self.opts.skip_initial_sync);

        self.set_state(match (diffing, watcher.is_some()) {
            (true, true) => JobState::DiffingAndWatching,
            (true, false) => JobState::Diffing,
            (false, true) => JobState::Watching,
            (false, false) => JobState::Draining,
        });

        let watch_handle = watcher.map(|w| tokio::spawn(Arc::clone(self).watch_mirror(w)));
        if diffing {
            Arc::clone(self).start_mirror().await;
            if watch_handle.is_some() {
                self.set_state(JobState::Watching);
            }
        }
        if let Some(handle) = watch_handle {
            if let Err(e) = handle.await {
                error!("[{}] 监听任务异常退出: {}", self.session_id, e);
            }
        }

        self.set_state(JobState::Draining);
        self.parallel.stop_and_wait().await;
        let result = match monitor.await {
            Ok(result) => result,
            Err(e) => {
                error!("[{}] 状态任务异常退出: {}", self.session_id, e);
                MonitorResult {
                    err_during_mirror: true,
                    ..Default::default()
                }
            }
        };
        self.set_state(JobState::Done);

        let retry = result.retry
            || (self.watch_lost.load(Ordering::SeqCst) && !self.cancel.is_cancelled());
        let outcome = MirrorOutcome {
            err_during_mirror: result.err_during_mirror,
            retry,
            total_objects: self.total_objects.load(Ordering::SeqCst),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            transferred: self.status.get(),
            counts: self.status.get_counts(),
            failures: result.failures,
        };
        info!(
            "[{}] 镜像结束: 对象 {}, 字节 {}, 失败 {}",
            self.session_id, outcome.total_objects, outcome.total_bytes, outcome.failures
        );
        outcome
    }

    async fn prepare_watcher(&self) -> Option<Watcher> {
        let mut watcher = Watcher::new();
        match watcher.join(Arc::clone(&self.source.client), true).await {
            Ok(()) => {
                watcher.seal();
                Some(watcher)
            }
            Err(ClientError::NotImplemented(msg)) => {
                warn!("[{}] 源不支持事件监听，忽略: {}", self.session_id, msg);
                None
            }
            Err(e) => {
                self.queue_urls(Urls::from_error(e.into())).await;
                self.watch_lost.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    /// 消费比较结果，统计总量并入队
    async fn start_mirror(self: Arc<Self>) {
        let mut urls_rx = prepare_mirror_urls(
            self.source.clone(),
            self.target.clone(),
            self.opts.clone(),
            Arc::clone(&self.exclude),
            self.cancel.clone(),
        );
        let now = Utc::now();

        loop {
            let mut urls = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                urls = urls_rx.recv() => match urls {
                    Some(urls) => urls,
                    None => break,
                },
            };

            if urls.error.is_some() {
                self.queue_urls(urls).await;
                continue;
            }

            if let Some(content) = &urls.source_content {
                if self.age.should_skip(content.time, now) {
                    debug!("按年龄跳过: {}", content.url);
                    continue;
                }
                self.total_bytes.fetch_add(content.size, Ordering::SeqCst);
            }
            let total_objects = self.total_objects.fetch_add(1, Ordering::SeqCst) + 1;
            let total_bytes = self.total_bytes.load(Ordering::SeqCst);
            self.status.set_total(total_bytes);
            urls.total_count = total_objects;
            urls.total_size = total_bytes;

            match urls.kind() {
                TaskKind::Copy => self.queue_urls(urls).await,
                TaskKind::Remove if self.opts.is_remove => self.queue_urls(urls).await,
                _ => {}
            }
        }
        debug!("[{}] 初始同步任务已全部入队", self.session_id);
    }

    /// 处理监听到的事件，直到取消或事件源关闭
    async fn watch_mirror(self: Arc<Self>, mut watcher: Watcher) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                events = watcher.events.recv() => match events {
                    Some(events) => {
                        for event in events {
                            self.handle_event(event).await;
                        }
                    }
                    None => {
                        warn!("[{}] 事件源已关闭", self.session_id);
                        self.watch_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                },
                Some(err) = watcher.errors.recv() => {
                    if let ClientError::NotImplemented(msg) = &err {
                        warn!("[{}] 源不支持事件监听，忽略: {}", self.session_id, msg);
                    } else {
                        self.queue_urls(Urls::from_error(err.into())).await;
                        self.watch_lost.store(true, Ordering::SeqCst);
                    }
                    break;
                }
            }
        }
        watcher.stop();
    }

    async fn handle_event(self: &Arc<Self>, event: EventInfo) {
        if self.exclude.is_excluded(&event.path) {
            debug!("排除事件: {}", event.path);
            return;
        }

        match event.event_type {
            EventType::ObjectCreated => self.handle_created(event).await,
            EventType::ObjectRemoved => {
                if !self.opts.is_remove {
                    return;
                }
                self.total_objects.fetch_add(1, Ordering::SeqCst);
                let urls = Urls::remove(&self.target.alias, ClientContent::new(event.path));
                self.queue_urls(urls).await;
            }
            EventType::BucketCreated => {
                let job = Arc::clone(self);
                let bucket = event.path;
                self.parallel
                    .queue_task_with_barrier(
                        async move {
                            match job.target.client.make_bucket(&bucket, &job.opts.region).await {
                                Ok(()) | Err(ClientError::ObjectAlreadyExists(_)) => Urls::default(),
                                Err(e) => Urls::default().with_error(Some(e.into())),
                            }
                        },
                        false,
                    )
                    .await;
            }
            EventType::BucketRemoved => {
                if !self.opts.is_remove {
                    return;
                }
                let job = Arc::clone(self);
                let bucket = event.path;
                self.parallel
                    .queue_task_with_barrier(
                        async move {
                            let opts = RemoveOptions {
                                is_bucket: true,
                                ..Default::default()
                            };
                            let failed = job.target.client.remove(vec![bucket], opts).await;
                            match failed.into_iter().next() {
                                Some((_, e)) => Urls::default().with_error(Some(e.into())),
                                None => Urls::default(),
                            }
                        },
                        false,
                    )
                    .await;
            }
        }
    }

    async fn handle_created(self: &Arc<Self>, event: EventInfo) {
        if self.opts.active_active && marked_source_mtime_in(&event).is_some() {
            debug!("忽略镜像写入产生的事件: {}", event.path);
            return;
        }

        let mut source_content = ClientContent {
            user_metadata: event.user_metadata.clone(),
            ..ClientContent::file(event.path.clone(), event.size, event.time)
        };
        if event.size == 0 {
            match self
                .source
                .client
                .stat(&event.path, StatOptions::default())
                .await
            {
                Ok(content) => source_content = content,
                Err(e) => {
                    let urls = Urls {
                        source_alias: self.source.alias.clone(),
                        source_content: Some(source_content),
                        ..Default::default()
                    };
                    self.queue_urls(urls.with_error(Some(e.into()))).await;
                    return;
                }
            }
        }
        if source_content.is_dir() {
            return;
        }

        if !self.opts.is_overwrite || self.opts.active_active {
            match self
                .target
                .client
                .stat(&event.path, StatOptions::default())
                .await
            {
                Ok(existing) => {
                    if !self.opts.active_active {
                        debug!("目标已存在，跳过: {}", event.path);
                        return;
                    }
                    if source_mtime(&existing) >= source_mtime(&source_content) {
                        debug!("目标不比源旧，跳过: {}", event.path);
                        return;
                    }
                }
                Err(ClientError::PathNotFound(_)) | Err(ClientError::ObjectMissing(_)) => {}
                Err(e) => {
                    let urls = Urls::copy(
                        &self.source.alias,
                        source_content,
                        &self.target.alias,
                        ClientContent::new(event.path),
                    );
                    self.queue_urls(urls.with_error(Some(e.into()))).await;
                    return;
                }
            }
        }

        let size = source_content.size;
        let total_bytes = self.total_bytes.fetch_add(size, Ordering::SeqCst) + size;
        let total_objects = self.total_objects.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.set_total(total_bytes);

        let mut urls = Urls::copy(
            &self.source.alias,
            source_content,
            &self.target.alias,
            ClientContent::new(event.path),
        );
        urls.total_count = total_objects;
        urls.total_size = total_bytes;
        self.queue_urls(urls).await;
    }

    /// 任务入队，大对象走长任务通道
    async fn queue_urls(&self, urls: Urls) {
        let is_long = urls.size() >= self.opts.parallel.large_object_threshold;
        let job = JobRef {
            opts: self.opts.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            status: Arc::clone(&self.status),
            parallel: Arc::clone(&self.parallel),
            cancel: self.cancel.clone(),
        };
        let queued = self
            .parallel
            .queue_task(
                async move {
                    match urls.kind() {
                        _ if urls.error.is_some() => urls,
                        TaskKind::Copy => job.do_mirror(urls).await,
                        TaskKind::Remove => job.do_remove(urls).await,
                        TaskKind::Error => urls,
                    }
                },
                is_long,
            )
            .await;
        if !queued {
            warn!("[{}] 任务管理器已停止，丢弃任务", self.session_id);
        }
    }

    /// 消费执行结果，返回是否出错以及是否需要重试
    async fn monitor_mirror_status(self: Arc<Self>, mut rx: mpsc::Receiver<Urls>) -> MonitorResult {
        let mut result = MonitorResult::default();
        self.status.start();

        while let Some(urls) = rx.recv().await {
            let Some(err) = &urls.error else {
                if urls.source_content.is_some() {
                    self.status.add_counts(1);
                } else if let Some(target) = &urls.target_content {
                    self.status.print_msg(&RemoveMessage {
                        status: "success".to_string(),
                        key: self.target.display(&target.url),
                        dry_run: self.opts.is_fake,
                    });
                    self.status.add_counts(1);
                }
                continue;
            };

            if err.is_cancelled() {
                continue;
            }

            match (&urls.source_content, &urls.target_content) {
                (Some(source), _) => {
                    if err.is_ignored() {
                        debug!("忽略错误: {} ({})", source.url, err);
                        continue;
                    }
                    self.status
                        .error_if(err, &format!("复制 `{}` 失败", self.source.display(&source.url)));
                }
                (None, Some(target)) => {
                    self.status
                        .error_if(err, &format!("删除 `{}` 失败", self.target.display(&target.url)));
                }
                (None, None) => {
                    self.status.error_if(err, "执行镜像操作失败");
                }
            }
            result.err_during_mirror = true;
            result.failures += 1;

            if self.opts.active_active && !result.retry {
                warn!("[{}] 双活模式出错，取消本次镜像并重试", self.session_id);
                result.retry = true;
                self.cancel.cancel();
            }
        }

        self.status.finish();
        result
    }
}

/// 任务执行时需要的上下文
struct JobRef {
    opts: MirrorOptions,
    source: Endpoint,
    target: Endpoint,
    status: Arc<dyn Status>,
    parallel: Arc<ParallelManager>,
    cancel: CancellationToken,
}

impl JobRef {
    /// 复制一个对象
    async fn do_mirror(&self, urls: Urls) -> Urls {
        let (Some(source), Some(target)) = (&urls.source_content, &urls.target_content) else {
            return urls;
        };
        let size = source.size;
        let source_url = self.source.display(&source.url);
        let target_url = self.target.display(&target.url);

        if self.opts.is_fake {
            self.status.add(size);
            self.status.print_msg(&MirrorMessage {
                status: "success".to_string(),
                source: source_url,
                target: target_url,
                size,
                total_count: urls.total_count,
                total_size: urls.total_size,
            });
            return urls;
        }

        self.status.set_caption(&source_url);
        self.status.print_msg(&MirrorMessage {
            status: "success".to_string(),
            source: source_url,
            target: target_url,
            size,
            total_count: urls.total_count,
            total_size: urls.total_size,
        });

        let put_opts = self.put_options(source);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            r = self.transfer(source, &target.url, size, put_opts) => r,
        };
        match result {
            Ok(()) => urls,
            Err(e) => urls.with_error(Some(e.into())),
        }
    }

    fn put_options(&self, source: &ClientContent) -> PutOptions {
        let mut user_metadata = source.user_metadata.clone();
        user_metadata.retain(|k, _| !k.eq_ignore_ascii_case(AA_SOURCE_MTIME_KEY));
        user_metadata.extend(self.opts.user_metadata.clone());
        if self.opts.active_active {
            user_metadata.insert(
                AA_SOURCE_MTIME_KEY.to_string(),
                source_mtime(source).to_rfc3339_opts(SecondsFormat::Nanos, true),
            );
        }
        PutOptions {
            storage_class: self.opts.storage_class.clone(),
            user_metadata,
            disable_multipart: self.opts.disable_multipart,
            mtime: Some(source_mtime(source)),
        }
    }

    async fn transfer(
        &self,
        source: &ClientContent,
        target_key: &str,
        size: u64,
        put_opts: PutOptions,
    ) -> Result<(), ClientError> {
        // 同一端点使用服务端复制
        if self.source.client.endpoint_id() == self.target.client.endpoint_id() {
            let source_path = self.source.client.full_key(&source.url);
            match self.target.client.copy(&source_path, target_key, put_opts.clone()).await {
                Ok(()) => {
                    self.parallel.record_transfer(size);
                    self.status.add(size);
                    return Ok(());
                }
                Err(ClientError::NotImplemented(msg)) => {
                    debug!("服务端复制不可用，改为下载上传: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }

        let reader = self
            .source
            .client
            .get(
                &source.url,
                GetOptions {
                    version_id: source.version_id.clone(),
                },
            )
            .await?;
        let parallel = Arc::clone(&self.parallel);
        let status = Arc::clone(&self.status);
        let reader = reader
            .inspect_ok(move |chunk| {
                let n = chunk.len() as u64;
                parallel.record_transfer(n);
                status.add(n);
            })
            .boxed();
        self.target
            .client
            .put(target_key, reader, size, put_opts)
            .await?;
        Ok(())
    }

    /// 删除一个目标对象，权限错误忽略
    async fn do_remove(&self, urls: Urls) -> Urls {
        let Some(target) = &urls.target_content else {
            return urls;
        };
        if self.opts.is_fake {
            return urls;
        }

        let failed = self
            .target
            .client
            .remove(vec![target.url.clone()], RemoveOptions::default())
            .await;
        for (path, err) in failed {
            let err = MirrorError::from(err);
            if err.is_permission_denied() {
                debug!("无权删除，忽略: {}", path);
                continue;
            }
            return urls.with_error(Some(err));
        }
        urls
    }
}

fn marked_source_mtime_in(event: &EventInfo) -> Option<chrono::DateTime<Utc>> {
    marked_source_mtime(&ClientContent {
        user_metadata: event.user_metadata.clone(),
        ..Default::default()
    })
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 重试间隔：指数增长并加入随机抖动
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// 本次的上限
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling().as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// 执行镜像；监听或双活模式下出错后重新启动
///
/// 返回最后一次运行的结果。
pub async fn run_mirror(
    source: Endpoint,
    target: Endpoint,
    opts: MirrorOptions,
    status: Arc<dyn Status>,
    cancel: CancellationToken,
) -> anyhow::Result<MirrorOutcome> {
    check_mirror_syntax(&source, &opts).await?;

    let mut backoff = RetryBackoff::default();
    loop {
        let job = MirrorJob::new(
            source.clone(),
            target.clone(),
            opts.clone(),
            Arc::clone(&status),
            cancel.child_token(),
        )?;
        let outcome = job.mirror().await;

        let supervised = opts.is_watch || opts.active_active;
        if !supervised || !outcome.retry || cancel.is_cancelled() {
            return Ok(outcome);
        }

        if !outcome.err_during_mirror {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        warn!("镜像将在 {:?} 后重新启动", delay);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(outcome),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParallelConfig;
    use crate::core::status::{new_status, OutputConfig};
    use crate::storage::{Client, MemoryClient};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn quiet() -> Arc<dyn Status> {
        new_status(OutputConfig {
            json: false,
            quiet: true,
        })
    }

    fn options() -> MirrorOptions {
        MirrorOptions {
            parallel: ParallelConfig {
                initial_workers: 2,
                monitor_period_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn scenario() -> (Arc<MemoryClient>, Arc<MemoryClient>) {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let source = MemoryClient::new("src");
        source.insert("a", &[1u8; 5], t);
        source.insert("b", &[2u8; 10], t);
        let target = MemoryClient::new("dst");
        target.insert("b", &[2u8; 10], t);
        target.insert("c", &[3u8; 1], t);
        (Arc::new(source), Arc::new(target))
    }

    async fn run_job(
        source: &Arc<MemoryClient>,
        target: &Arc<MemoryClient>,
        opts: MirrorOptions,
    ) -> MirrorOutcome {
        let job = MirrorJob::new(
            Endpoint::new("src", source.clone()),
            Endpoint::new("dst", target.clone()),
            opts,
            quiet(),
            CancellationToken::new(),
        )
        .unwrap();
        let outcome = job.mirror().await;
        assert_eq!(job.state(), JobState::Done);
        outcome
    }

    async fn wait_for(client: &MemoryClient, key: &str) {
        for _ in 0..500 {
            if client.object(key).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待 `{}` 超时", key);
    }

    async fn wait_watching(job: &Arc<MirrorJob>) {
        for _ in 0..500 {
            if matches!(job.state(), JobState::Watching | JobState::DiffingAndWatching) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("监听未启动");
    }

    #[tokio::test]
    async fn test_copies_only_missing_without_remove() {
        let (source, target) = scenario();
        let outcome = run_job(&source, &target, options()).await;

        assert!(!outcome.err_during_mirror);
        assert_eq!(outcome.total_objects, 1);
        assert_eq!(outcome.total_bytes, 5);
        assert_eq!(target.keys(), vec!["a", "b", "c"]);
        assert_eq!(target.object("a").unwrap().0.as_ref(), &[1u8; 5]);
    }

    #[tokio::test]
    async fn test_remove_extraneous() {
        let (source, target) = scenario();
        let opts = MirrorOptions {
            is_remove: true,
            ..options()
        };
        let outcome = run_job(&source, &target, opts).await;

        assert!(!outcome.err_during_mirror);
        assert_eq!(outcome.total_objects, 2);
        assert_eq!(target.keys(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dry_run_is_idempotent() {
        let (source, target) = scenario();
        let opts = MirrorOptions {
            is_fake: true,
            is_remove: true,
            ..options()
        };
        let first = run_job(&source, &target, opts.clone()).await;
        let second = run_job(&source, &target, opts).await;

        assert_eq!(source.mutations(), 0);
        assert_eq!(target.mutations(), 0);
        assert_eq!(first.total_objects, second.total_objects);
        assert_eq!(first.total_bytes, second.total_bytes);
        assert_eq!(first.total_objects, 2);
        assert_eq!(target.keys(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_overwrite_not_allowed_is_reported() {
        let source = Arc::new(MemoryClient::new("src"));
        source.insert("a", b"longer", Utc::now());
        let target = Arc::new(MemoryClient::new("dst"));
        target.insert("a", b"old", Utc::now());

        let outcome = run_job(&source, &target, options()).await;
        assert!(outcome.err_during_mirror);
        assert_eq!(outcome.failures, 1);
        assert_eq!(target.object("a").unwrap().0.as_ref(), b"old");

        let opts = MirrorOptions {
            is_overwrite: true,
            ..options()
        };
        let outcome = run_job(&source, &target, opts).await;
        assert!(!outcome.err_during_mirror);
        assert_eq!(target.object("a").unwrap().0.as_ref(), b"longer");
    }

    #[tokio::test]
    async fn test_remove_ignores_permission_denied() {
        let source = Arc::new(MemoryClient::new("src"));
        let target = Arc::new(MemoryClient::new("dst"));
        target.insert("x", b"1", Utc::now());
        target.insert("y", b"2", Utc::now());
        target.deny_remove("x");

        let opts = MirrorOptions {
            is_remove: true,
            ..options()
        };
        let outcome = run_job(&source, &target, opts).await;
        assert!(!outcome.err_during_mirror);
        assert_eq!(target.keys(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_server_side_copy_within_endpoint() {
        let store = MemoryClient::new("shared");
        let source = Arc::new(store.scoped("src"));
        let target = Arc::new(store.scoped("dst"));
        source.insert("a", b"hello", Utc::now());
        let opts = MirrorOptions {
            storage_class: Some("STANDARD_IA".to_string()),
            user_metadata: BTreeMap::from([("k".to_string(), "v".to_string())]),
            ..options()
        };

        let outcome = run_job(&source, &target, opts).await;
        assert!(!outcome.err_during_mirror);
        assert_eq!(outcome.transferred, 5);
        let (data, content) = target.object("a").unwrap();
        assert_eq!(data.as_ref(), b"hello");
        assert_eq!(content.storage_class.as_deref(), Some("STANDARD_IA"));
        assert_eq!(content.user_metadata.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_age_filter_skips_recent_objects() {
        let source = Arc::new(MemoryClient::new("src"));
        source.insert("old", b"1", Utc::now() - chrono::Duration::days(10));
        source.insert("new", b"2", Utc::now());
        let target = Arc::new(MemoryClient::new("dst"));

        let opts = MirrorOptions {
            older_than: Some("7d".to_string()),
            ..options()
        };
        let outcome = run_job(&source, &target, opts).await;
        assert_eq!(outcome.total_objects, 1);
        assert_eq!(target.keys(), vec!["old"]);
    }

    #[tokio::test]
    async fn test_watch_copies_new_objects() {
        let source = Arc::new(MemoryClient::new("src"));
        let target = Arc::new(MemoryClient::new("dst"));
        let opts = MirrorOptions {
            is_watch: true,
            skip_initial_sync: true,
            is_remove: true,
            ..options()
        };
        let job = MirrorJob::new(
            Endpoint::new("src", source.clone()),
            Endpoint::new("dst", target.clone()),
            opts,
            quiet(),
            CancellationToken::new(),
        )
        .unwrap();
        let handle = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.mirror().await }
        });
        wait_watching(&job).await;

        source
            .put(
                "new.txt",
                futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"data"))]).boxed(),
                4,
                PutOptions::default(),
            )
            .await
            .unwrap();
        wait_for(&target, "new.txt").await;

        target.insert("gone", b"x", Utc::now());
        source
            .emit(vec![EventInfo {
                time: Utc::now(),
                size: 0,
                path: "gone".to_string(),
                event_type: EventType::ObjectRemoved,
                user_metadata: BTreeMap::new(),
            }])
            .await;
        for _ in 0..500 {
            if target.object("gone").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        job.cancel();
        let outcome = handle.await.unwrap();
        assert!(!outcome.err_during_mirror);
        assert!(!outcome.retry);
        assert_eq!(target.keys(), vec!["new.txt"]);
    }

    #[tokio::test]
    async fn test_watch_bucket_events_run_after_queued_copies() {
        let source = Arc::new(MemoryClient::new("src"));
        let target = Arc::new(MemoryClient::new("dst"));
        source.insert("old/x", &[7u8; 64], Utc::now());
        source.insert("after", b"z", Utc::now());
        target.insert("old/y", b"y", Utc::now());

        let opts = MirrorOptions {
            is_watch: true,
            skip_initial_sync: true,
            is_remove: true,
            ..options()
        };
        let job = MirrorJob::new(
            Endpoint::new("src", source.clone()),
            Endpoint::new("dst", target.clone()),
            opts,
            quiet(),
            CancellationToken::new(),
        )
        .unwrap();
        let handle = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.mirror().await }
        });
        wait_watching(&job).await;

        let event = |path: &str, size: u64, event_type: EventType| EventInfo {
            time: Utc::now(),
            size,
            path: path.to_string(),
            event_type,
            user_metadata: BTreeMap::new(),
        };
        // 删除存储桶要等之前入队的复制完成，之后的复制要等它完成
        source
            .emit(vec![
                event("old/x", 64, EventType::ObjectCreated),
                event("old", 0, EventType::BucketRemoved),
                event("nb", 0, EventType::BucketCreated),
                event("after", 1, EventType::ObjectCreated),
            ])
            .await;
        wait_for(&target, "after").await;

        job.cancel();
        let outcome = handle.await.unwrap();
        assert!(!outcome.err_during_mirror);
        assert_eq!(target.keys(), vec!["after", "nb"]);
        assert!(target.object("nb").unwrap().1.is_dir());
    }

    #[tokio::test]
    async fn test_watch_bucket_removal_needs_remove_flag() {
        let source = Arc::new(MemoryClient::new("src"));
        let target = Arc::new(MemoryClient::new("dst"));
        source.insert("after", b"z", Utc::now());
        target.insert("old/y", b"y", Utc::now());

        let opts = MirrorOptions {
            is_watch: true,
            skip_initial_sync: true,
            ..options()
        };
        let job = MirrorJob::new(
            Endpoint::new("src", source.clone()),
            Endpoint::new("dst", target.clone()),
            opts,
            quiet(),
            CancellationToken::new(),
        )
        .unwrap();
        let handle = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.mirror().await }
        });
        wait_watching(&job).await;

        source
            .emit(vec![
                EventInfo {
                    time: Utc::now(),
                    size: 0,
                    path: "old".to_string(),
                    event_type: EventType::BucketRemoved,
                    user_metadata: BTreeMap::new(),
                },
                EventInfo {
                    time: Utc::now(),
                    size: 1,
                    path: "after".to_string(),
                    event_type: EventType::ObjectCreated,
                    user_metadata: BTreeMap::new(),
                },
            ])
            .await;
        wait_for(&target, "after").await;

        job.cancel();
        handle.await.unwrap();
        assert_eq!(target.keys(), vec!["after", "old/y"]);
    }

    #[tokio::test]
    async fn test_active_active_ignores_marked_events() {
        let source = Arc::new(MemoryClient::new("src"));
        let target = Arc::new(MemoryClient::new("dst"));
        let marked = BTreeMap::from([(
            AA_SOURCE_MTIME_KEY.to_string(),
            Utc::now().to_rfc3339(),
        )]);
        source.insert_with_metadata("replica", b"r", Utc::now(), marked.clone());
        source.insert("fresh", b"f", Utc::now());

        let opts = MirrorOptions {
            is_watch: true,
            skip_initial_sync: true,
            active_active: true,
            ..options()
        };
        let job = MirrorJob::new(
            Endpoint::new("src", source.clone()),
            Endpoint::new("dst", target.clone()),
            opts,
            quiet(),
            CancellationToken::new(),
        )
        .unwrap();
        let handle = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.mirror().await }
        });
        wait_watching(&job).await;

        source
            .emit(vec![
                EventInfo {
                    time: Utc::now(),
                    size: 1,
                    path: "replica".to_string(),
                    event_type: EventType::ObjectCreated,
                    user_metadata: marked,
                },
                EventInfo {
                    time: Utc::now(),
                    size: 1,
                    path: "fresh".to_string(),
                    event_type: EventType::ObjectCreated,
                    user_metadata: BTreeMap::new(),
                },
            ])
            .await;
        wait_for(&target, "fresh").await;
        job.cancel();
        handle.await.unwrap();

        assert_eq!(target.keys(), vec!["fresh"]);
        // 复制出的对象带有源修改时间标记
        let (_, content) = target.object("fresh").unwrap();
        assert!(marked_source_mtime(&content).is_some());
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_mirror_returns_without_watch() {
        let (source, target) = scenario();
        let outcome = run_mirror(
            Endpoint::new("src", source.clone()),
            Endpoint::new("dst", target.clone()),
            options(),
            quiet(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.total_objects, 1);
        assert!(target.object("a").is_some());
    }
}
