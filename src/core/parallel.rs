//! 并行任务管理器
//!
//! 两条任务通道：长任务（大对象）和短任务。所有任务入队前先获取
//! 屏障锁：普通任务持有读锁，屏障任务持有写锁。锁随任务一起传给
//! 工作者，在结果发出后释放，所以屏障任务会等到此前入队的任务全部
//! 完成才开始执行，之后入队的任务也要等它完成。
//!
//! 监控任务周期性采样传输字节数，带宽提升时增加短任务工作者，
//! 连续多次没有提升后停止扩容。

use crate::config::ParallelConfig;
use crate::core::urls::Urls;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// 任务返回执行结果（成功或带错误的 Urls）
pub type TaskFuture = Pin<Box<dyn Future<Output = Urls> + Send>>;

/// 任务通道
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Long,
    Short,
}

enum BarrierGuard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

struct QueuedTask {
    task: TaskFuture,
    guard: BarrierGuard,
}

type LaneReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedTask>>>;

/// 并行任务管理器
pub struct ParallelManager {
    config: ParallelConfig,
    /// 已传输字节数（所有任务共享）
    sent_bytes: AtomicU64,
    workers_num: AtomicUsize,
    growth_stopped: AtomicBool,
    barrier: Arc<RwLock<()>>,
    long_tx: Mutex<Option<mpsc::Sender<QueuedTask>>>,
    short_tx: Mutex<Option<mpsc::Sender<QueuedTask>>>,
    long_rx: LaneReceiver,
    short_rx: LaneReceiver,
    result_tx: Mutex<Option<mpsc::Sender<Urls>>>,
    tracker: TaskTracker,
    stop_monitor: CancellationToken,
}

impl ParallelManager {
    /// 创建管理器并启动初始工作者和监控任务
    pub fn new(result_tx: mpsc::Sender<Urls>, config: ParallelConfig) -> Arc<Self> {
        let (long_tx, long_rx) = mpsc::channel(1);
        let (short_tx, short_rx) = mpsc::channel(1);

        let manager = Arc::new(Self {
            config,
            sent_bytes: AtomicU64::new(0),
            workers_num: AtomicUsize::new(0),
            growth_stopped: AtomicBool::new(false),
            barrier: Arc::new(RwLock::new(())),
            long_tx: Mutex::new(Some(long_tx)),
            short_tx: Mutex::new(Some(short_tx)),
            long_rx: Arc::new(tokio::sync::Mutex::new(long_rx)),
            short_rx: Arc::new(tokio::sync::Mutex::new(short_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            tracker: TaskTracker::new(),
            stop_monitor: CancellationToken::new(),
        });

        // 长任务通道至少一个工作者
        manager.add_worker(Lane::Long);
        for _ in 0..manager.config.initial_workers.max(1) {
            if !manager.add_worker(Lane::Short) {
                break;
            }
        }
        manager.monitor_progress();

        manager
    }

    /// 增加一个工作者，达到上限时返回 false
    ///
    /// 上限至少为 2，保证长短两条通道各有一个工作者。
    pub fn add_worker(&self, lane: Lane) -> bool {
        let max = self.config.max_workers.max(2);
        let reserved = self
            .workers_num
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }

        let result_tx = match lock(&self.result_tx).as_ref() {
            Some(tx) => tx.clone(),
            None => {
                self.workers_num.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
        };
        let rx = match lane {
            Lane::Long => Arc::clone(&self.long_rx),
            Lane::Short => Arc::clone(&self.short_rx),
        };

        self.tracker.spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                let Some(QueuedTask { task, guard }) = next else {
                    break;
                };
                let result = task.await;
                let _ = result_tx.send(result).await;
                // 结果发出后才释放屏障锁
                drop(guard);
            }
        });
        true
    }

    fn monitor_progress(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let stop = self.stop_monitor.clone();
        let period = self.config.monitor_period();
        let limit = self.config.stagnation_limit.max(1);
        let per_tick = self.config.workers_per_tick.max(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // 第一次 tick 立即返回
            ticker.tick().await;

            let mut prev_sent = 0u64;
            let mut max_bandwidth = 0u64;
            let mut stagnation = 0u32;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let sent = manager.sent_bytes.load(Ordering::SeqCst);
                let bandwidth = sent.saturating_sub(prev_sent);
                prev_sent = sent;

                if bandwidth <= max_bandwidth {
                    stagnation += 1;
                    if stagnation >= limit {
                        info!(
                            "带宽不再提升，停止增加工作者: {} 个工作者",
                            manager.workers_num()
                        );
                        manager.growth_stopped.store(true, Ordering::SeqCst);
                        return;
                    }
                    continue;
                }

                stagnation = 0;
                max_bandwidth = bandwidth;
                let mut added = 0;
                for _ in 0..per_tick {
                    if !manager.add_worker(Lane::Short) {
                        break;
                    }
                    added += 1;
                }
                debug!(
                    "带宽 {} B/周期，新增 {} 个工作者，共 {} 个",
                    bandwidth,
                    added,
                    manager.workers_num()
                );
            }
        });
    }

    /// 普通任务入队，与其他普通任务并发执行
    ///
    /// 管理器已停止时返回 false。
    pub async fn queue_task<F>(&self, task: F, is_long: bool) -> bool
    where
        F: Future<Output = Urls> + Send + 'static,
    {
        let guard = BarrierGuard::Shared(Arc::clone(&self.barrier).read_owned().await);
        self.dispatch(Box::pin(task), guard, is_long).await
    }

    /// 屏障任务入队：等待之前的任务全部完成后独占执行
    pub async fn queue_task_with_barrier<F>(&self, task: F, is_long: bool) -> bool
    where
        F: Future<Output = Urls> + Send + 'static,
    {
        let guard = BarrierGuard::Exclusive(Arc::clone(&self.barrier).write_owned().await);
        self.dispatch(Box::pin(task), guard, is_long).await
    }

    async fn dispatch(&self, task: TaskFuture, guard: BarrierGuard, is_long: bool) -> bool {
        let lane = if is_long { &self.long_tx } else { &self.short_tx };
        let sender = lock(lane).clone();
        match sender {
            Some(tx) => tx.send(QueuedTask { task, guard }).await.is_ok(),
            None => false,
        }
    }

    /// 记录传输的字节数，供监控任务计算带宽
    pub fn record_transfer(&self, n: u64) {
        self.sent_bytes.fetch_add(n, Ordering::SeqCst);
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::SeqCst)
    }

    pub fn workers_num(&self) -> usize {
        self.workers_num.load(Ordering::SeqCst)
    }

    pub fn growth_stopped(&self) -> bool {
        self.growth_stopped.load(Ordering::SeqCst)
    }

    /// 关闭任务通道，等待所有已入队的任务完成
    pub async fn stop_and_wait(&self) {
        lock(&self.long_tx).take();
        lock(&self.short_tx).take();
        self.tracker.close();
        self.tracker.wait().await;
        self.stop_monitor.cancel();
        lock(&self.result_tx).take();
        debug!("所有工作者已退出");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ClientContent;
    use std::time::Duration;

    fn config(max_workers: usize, initial: usize) -> ParallelConfig {
        ParallelConfig {
            max_workers,
            initial_workers: initial,
            workers_per_tick: 4,
            monitor_period_ms: 20,
            stagnation_limit: 3,
            large_object_threshold: 1024,
        }
    }

    fn named(key: &str) -> Urls {
        Urls::remove("t", ClientContent::new(key))
    }

    #[tokio::test]
    async fn test_all_results_delivered() {
        let (tx, mut rx) = mpsc::channel(100);
        let manager = ParallelManager::new(tx, config(8, 4));

        for i in 0..20 {
            let key = format!("k{}", i);
            assert!(manager.queue_task(async move { named(&key) }, i % 5 == 0).await);
        }
        manager.stop_and_wait().await;

        let mut keys = Vec::new();
        while let Some(urls) = rx.recv().await {
            keys.push(urls.target_content.unwrap().url);
        }
        keys.sort();
        assert_eq!(keys.len(), 20);
        // 停止后不再接受任务
        assert!(!manager.queue_task(async { named("late") }, false).await);
    }

    #[tokio::test]
    async fn test_worker_ceiling() {
        let (tx, _rx) = mpsc::channel(100);
        let manager = ParallelManager::new(tx, config(3, 10));
        assert_eq!(manager.workers_num(), 3);
        assert!(!manager.add_worker(Lane::Short));
        assert_eq!(manager.workers_num(), 3);
        manager.stop_and_wait().await;
    }

    #[tokio::test]
    async fn test_single_worker_ceiling_still_runs_short_tasks() {
        let (tx, mut rx) = mpsc::channel(100);
        let manager = ParallelManager::new(tx, config(1, 4));
        assert_eq!(manager.workers_num(), 2);

        assert!(manager.queue_task(async { named("s1") }, false).await);
        assert!(manager.queue_task(async { named("s2") }, false).await);
        for _ in 0..2 {
            let got = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
            assert!(matches!(got, Ok(Some(_))));
        }
        manager.stop_and_wait().await;
    }

    #[tokio::test]
    async fn test_monitor_grows_then_stops() {
        let (tx, _rx) = mpsc::channel(100);
        let manager = ParallelManager::new(tx, config(16, 1));
        let start = manager.workers_num();

        // 持续增长的传输量使带宽不断提升
        for i in 1..=4u64 {
            manager.record_transfer(i * 1000);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(manager.workers_num() > start);
        assert!(manager.workers_num() <= 16);

        // 传输停止后连续停滞，扩容结束
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.growth_stopped());
        manager.stop_and_wait().await;
    }

    #[tokio::test]
    async fn test_barrier_is_exclusive() {
        let (tx, mut rx) = mpsc::channel(100);
        let manager = ParallelManager::new(tx, config(8, 8));
        let running = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let task = |exclusive: bool, key: String| {
            let running = Arc::clone(&running);
            let violations = Arc::clone(&violations);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                if exclusive && now != 1 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                if exclusive && running.load(Ordering::SeqCst) != 1 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                running.fetch_sub(1, Ordering::SeqCst);
                named(&key)
            }
        };

        for i in 0..6 {
            assert!(manager.queue_task(task(false, format!("a{}", i)), false).await);
        }
        assert!(manager.queue_task_with_barrier(task(true, "barrier".to_string()), false).await);
        for i in 0..6 {
            assert!(manager.queue_task(task(false, format!("b{}", i)), false).await);
        }
        manager.stop_and_wait().await;

        let mut order = Vec::new();
        while let Some(urls) = rx.recv().await {
            order.push(urls.target_content.unwrap().url);
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        let barrier_pos = order.iter().position(|k| k == "barrier").unwrap();
        assert!(order[..barrier_pos].iter().all(|k| k.starts_with('a')));
        assert!(order[barrier_pos + 1..].iter().all(|k| k.starts_with('b')));
    }
}
