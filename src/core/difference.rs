//! 源和目标的差异比较
//!
//! 两边的列举结果都按 key 字节序排列，比较器对两个有序序列做归并，
//! 每个 key 只产生一条差异消息，消息顺序与 key 顺序一致。

use crate::core::lister::ContentLister;
use crate::error::{ClientError, MirrorError};
use crate::storage::{Client, ClientContent, ContentType, StatOptions};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 双活模式下记录源修改时间的元数据键
pub const AA_SOURCE_MTIME_KEY: &str = "X-Amz-Meta-Mm-Source-Mtime";

/// 差异类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffType {
    /// 两边相同
    InNone,
    /// 只存在于源
    InFirst,
    /// 只存在于目标
    InSecond,
    /// 大小不同
    InSize,
    /// 元数据不同
    InMetadata,
    /// 源比目标新
    InMTime,
    /// 双活模式下源修改时间不一致
    InAASourceMTime,
    /// 一边是文件一边是目录
    InType,
    /// 比较出错
    Unknown,
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiffType::InNone => "none",
            DiffType::InFirst => "only-in-first",
            DiffType::InSecond => "only-in-second",
            DiffType::InSize => "size",
            DiffType::InMetadata => "metadata",
            DiffType::InMTime => "mtime",
            DiffType::InAASourceMTime => "aa-source-mtime",
            DiffType::InType => "type",
            DiffType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// 一条差异消息
#[derive(Debug, Clone)]
pub struct DiffMessage {
    pub first_url: Option<String>,
    pub second_url: Option<String>,
    pub diff: DiffType,
    pub first_content: Option<ClientContent>,
    pub second_content: Option<ClientContent>,
    pub error: Option<MirrorError>,
}

impl DiffMessage {
    fn error(err: MirrorError) -> Self {
        Self {
            first_url: None,
            second_url: None,
            diff: DiffType::Unknown,
            first_content: None,
            second_content: None,
            error: Some(err),
        }
    }
}

/// 比较配置
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// 比较用户元数据
    pub is_metadata: bool,
    /// 比较修改时间，源更新时视为不同
    pub is_mtime: bool,
    /// 双活模式，比较源修改时间标记
    pub active_active: bool,
}

/// 读取双活标记；不存在时使用对象自身的修改时间
pub fn source_mtime(content: &ClientContent) -> DateTime<Utc> {
    marked_source_mtime(content).unwrap_or(content.time)
}

/// 读取双活标记
pub fn marked_source_mtime(content: &ClientContent) -> Option<DateTime<Utc>> {
    content
        .user_metadata
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(AA_SOURCE_MTIME_KEY))
        .and_then(|(_, v)| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn user_metadata_differs(first: &ClientContent, second: &ClientContent) -> bool {
    let strip = |c: &ClientContent| {
        c.user_metadata
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(AA_SOURCE_MTIME_KEY))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect::<Vec<_>>()
    };
    strip(first) != strip(second)
}

/// 比较同一个 key 在两边的条目
pub fn classify(first: &ClientContent, second: &ClientContent, opts: &DiffOptions) -> DiffType {
    if first.content_type != second.content_type {
        return DiffType::InType;
    }
    if first.content_type == ContentType::Folder {
        return DiffType::InNone;
    }

    if first.size != second.size {
        return DiffType::InSize;
    }

    if opts.active_active {
        let first_mtime = source_mtime(first).timestamp();
        let second_mtime = source_mtime(second).timestamp();
        if second_mtime < first_mtime {
            return DiffType::InAASourceMTime;
        }
    }

    if opts.is_mtime && second.time.timestamp() < first.time.timestamp() {
        return DiffType::InMTime;
    }

    if opts.is_metadata && user_metadata_differs(first, second) {
        return DiffType::InMetadata;
    }

    DiffType::InNone
}

/// 启动比较，返回差异消息通道
///
/// 列举出错时发送一条带错误的消息后结束；取消后静默结束。
pub fn object_difference(
    source: Arc<dyn Client>,
    target: Arc<dyn Client>,
    opts: DiffOptions,
    cancel: CancellationToken,
) -> mpsc::Receiver<DiffMessage> {
    let (tx, rx) = mpsc::channel(10000);

    let source_rx = ContentLister::new(Arc::clone(&source))
        .with_cancel(cancel.clone())
        .list();
    let target_rx = ContentLister::new(Arc::clone(&target))
        .with_cancel(cancel.clone())
        .list();

    tokio::spawn(async move {
        let source_url = source.url().to_string();
        let target_url = target.url().to_string();
        info!("开始比较: {} -> {}", source_url, target_url);
        difference_internal(
            Side::new(source_url, source, source_rx),
            Side::new(target_url, target, target_rx),
            &opts,
            &cancel,
            &tx,
        )
        .await;
        debug!("比较结束");
    });

    rx
}

struct Side {
    url: String,
    client: Arc<dyn Client>,
    rx: mpsc::Receiver<Result<ClientContent, ClientError>>,
    current: Option<ClientContent>,
    done: bool,
}

impl Side {
    fn new(
        url: String,
        client: Arc<dyn Client>,
        rx: mpsc::Receiver<Result<ClientContent, ClientError>>,
    ) -> Self {
        Self {
            url,
            client,
            rx,
            current: None,
            done: false,
        }
    }

    /// 列举结果不带用户元数据时，用 stat 的结果补上
    async fn with_metadata(&self, content: &ClientContent) -> ClientContent {
        if self.client.listing_has_metadata() {
            return content.clone();
        }
        let opts = StatOptions {
            version_id: content.version_id.clone(),
        };
        match self.client.stat(&content.url, opts).await {
            Ok(stat) => ClientContent {
                user_metadata: stat.user_metadata,
                ..content.clone()
            },
            Err(e) => {
                warn!("获取元数据失败，按列举结果比较: {} ({})", content.url, e);
                content.clone()
            }
        }
    }

    /// 读取下一个条目；出错时返回错误
    async fn advance(&mut self) -> Result<(), MirrorError> {
        if self.done {
            self.current = None;
            return Ok(());
        }
        match self.rx.recv().await {
            Some(Ok(content)) => {
                self.current = Some(content);
                Ok(())
            }
            Some(Err(e)) => {
                self.current = None;
                self.done = true;
                Err(MirrorError::Listing {
                    url: self.url.clone(),
                    source: e,
                })
            }
            None => {
                self.current = None;
                self.done = true;
                Ok(())
            }
        }
    }
}

async fn difference_internal(
    mut first: Side,
    mut second: Side,
    opts: &DiffOptions,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<DiffMessage>,
) {
    let mut advance_first = true;
    let mut advance_second = true;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        if advance_first {
            if let Err(e) = first.advance().await {
                if !is_cancelled(&e) {
                    let _ = tx.send(DiffMessage::error(e)).await;
                }
                return;
            }
        }
        if advance_second {
            if let Err(e) = second.advance().await {
                if !is_cancelled(&e) {
                    let _ = tx.send(DiffMessage::error(e)).await;
                }
                return;
            }
        }

        let msg = match (&first.current, &second.current) {
            (None, None) => return,
            (Some(f), None) => {
                advance_first = true;
                advance_second = false;
                only_in_first(f)
            }
            (None, Some(s)) => {
                advance_first = false;
                advance_second = true;
                only_in_second(s)
            }
            (Some(f), Some(s)) => match f.url.as_bytes().cmp(s.url.as_bytes()) {
                Ordering::Less => {
                    advance_first = true;
                    advance_second = false;
                    only_in_first(f)
                }
                Ordering::Greater => {
                    advance_first = false;
                    advance_second = true;
                    only_in_second(s)
                }
                Ordering::Equal => {
                    advance_first = true;
                    advance_second = true;
                    let (f, s) = if needs_metadata(f, s, opts) {
                        (first.with_metadata(f).await, second.with_metadata(s).await)
                    } else {
                        (f.clone(), s.clone())
                    };
                    DiffMessage {
                        first_url: Some(f.url.clone()),
                        second_url: Some(s.url.clone()),
                        diff: classify(&f, &s, opts),
                        first_content: Some(f),
                        second_content: Some(s),
                        error: None,
                    }
                }
            },
        };

        if tx.send(msg).await.is_err() {
            return;
        }
    }
}

/// 只有元数据会影响结果时才需要补充元数据
fn needs_metadata(first: &ClientContent, second: &ClientContent, opts: &DiffOptions) -> bool {
    (opts.is_metadata || opts.active_active)
        && first.content_type == ContentType::File
        && second.content_type == ContentType::File
        && first.size == second.size
}

fn is_cancelled(err: &MirrorError) -> bool {
    matches!(
        err,
        MirrorError::Listing {
            source: ClientError::Cancelled,
            ..
        }
    )
}

fn only_in_first(content: &ClientContent) -> DiffMessage {
    DiffMessage {
        first_url: Some(content.url.clone()),
        second_url: None,
        diff: DiffType::InFirst,
        first_content: Some(content.clone()),
        second_content: None,
        error: None,
    }
}

fn only_in_second(content: &ClientContent) -> DiffMessage {
    DiffMessage {
        first_url: None,
        second_url: Some(content.url.clone()),
        diff: DiffType::InSecond,
        first_content: None,
        second_content: Some(content.clone()),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryClient;
    use std::collections::BTreeMap;

    fn file(key: &str, size: u64, secs: i64) -> ClientContent {
        ClientContent::file(key, size, DateTime::from_timestamp(secs, 0).unwrap())
    }

    async fn collect(source: MemoryClient, target: MemoryClient, opts: DiffOptions) -> Vec<DiffMessage> {
        let mut rx = object_difference(
            Arc::new(source),
            Arc::new(target),
            opts,
            CancellationToken::new(),
        );
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_classify() {
        let opts = DiffOptions::default();
        assert_eq!(classify(&file("a", 1, 0), &file("a", 1, 100), &opts), DiffType::InNone);
        assert_eq!(classify(&file("a", 1, 0), &file("a", 2, 0), &opts), DiffType::InSize);
        assert_eq!(
            classify(&file("a", 1, 0), &ClientContent::folder("a"), &opts),
            DiffType::InType
        );

        let mtime = DiffOptions {
            is_mtime: true,
            ..Default::default()
        };
        assert_eq!(classify(&file("a", 1, 100), &file("a", 1, 0), &mtime), DiffType::InMTime);
        assert_eq!(classify(&file("a", 1, 0), &file("a", 1, 100), &mtime), DiffType::InNone);
    }

    #[test]
    fn test_classify_metadata_ignores_aa_marker() {
        let opts = DiffOptions {
            is_metadata: true,
            ..Default::default()
        };
        let mut first = file("a", 1, 0);
        let mut second = file("a", 1, 0);
        second
            .user_metadata
            .insert(AA_SOURCE_MTIME_KEY.to_string(), "2024-01-01T00:00:00Z".to_string());
        assert_eq!(classify(&first, &second, &opts), DiffType::InNone);

        first.user_metadata.insert("color".to_string(), "red".to_string());
        assert_eq!(classify(&first, &second, &opts), DiffType::InMetadata);
    }

    #[test]
    fn test_classify_active_active() {
        let opts = DiffOptions {
            active_active: true,
            ..Default::default()
        };
        let first = file("a", 1, 1_000);
        let mut second = file("a", 1, 2_000);
        // 目标没有标记，按自身修改时间比较
        assert_eq!(classify(&first, &second, &opts), DiffType::InNone);

        let mut meta = BTreeMap::new();
        meta.insert(
            AA_SOURCE_MTIME_KEY.to_string(),
            DateTime::from_timestamp(500, 0).unwrap().to_rfc3339(),
        );
        second.user_metadata = meta;
        assert_eq!(classify(&first, &second, &opts), DiffType::InAASourceMTime);
    }

    #[tokio::test]
    async fn test_merge_join_covers_every_key_in_order() {
        let now = Utc::now();
        let source = MemoryClient::new("src");
        let target = MemoryClient::new("dst");
        source.insert("a", b"1", now);
        source.insert("b", b"22", now);
        source.insert("d", b"4", now);
        target.insert("b", b"2", now);
        target.insert("c", b"3", now);
        target.insert("d", b"4", now);

        let msgs = collect(source, target, DiffOptions::default()).await;
        let summary: Vec<(String, DiffType)> = msgs
            .iter()
            .map(|m| {
                let key = m.first_url.clone().or(m.second_url.clone()).unwrap();
                (key, m.diff)
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a".to_string(), DiffType::InFirst),
                ("b".to_string(), DiffType::InSize),
                ("c".to_string(), DiffType::InSecond),
                ("d".to_string(), DiffType::InNone),
            ]
        );
    }

    #[tokio::test]
    async fn test_deterministic_output() {
        let now = Utc::now();
        let build = || {
            let source = MemoryClient::new("src");
            let target = MemoryClient::new("dst");
            for i in 0..50 {
                source.insert(&format!("k{:03}", i), b"x", now);
                if i % 3 == 0 {
                    target.insert(&format!("k{:03}", i), b"yy", now);
                }
                if i % 7 == 0 {
                    target.insert(&format!("t{:03}", i), b"z", now);
                }
            }
            (source, target)
        };

        let (s1, t1) = build();
        let (s2, t2) = build();
        let first: Vec<_> = collect(s1, t1, DiffOptions::default())
            .await
            .into_iter()
            .map(|m| (m.first_url, m.second_url, m.diff))
            .collect();
        let second: Vec<_> = collect(s2, t2, DiffOptions::default())
            .await
            .into_iter()
            .map(|m| (m.first_url, m.second_url, m.diff))
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 50 + 8);
    }

    #[tokio::test]
    async fn test_listing_error_short_circuits() {
        let now = Utc::now();
        let source = MemoryClient::new("src");
        source.insert("a", b"1", now);
        source.insert("b", b"1", now);
        source.insert("c", b"1", now);
        source.fail_listing_at(1);
        let target = MemoryClient::new("dst");

        let msgs = collect(source, target, DiffOptions::default()).await;
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].diff, DiffType::InFirst);
        assert!(matches!(msgs[1].error, Some(MirrorError::Listing { .. })));
        assert_eq!(msgs[1].diff, DiffType::Unknown);
    }

    #[tokio::test]
    async fn test_metadata_fetched_when_listing_lacks_it() {
        let t = DateTime::from_timestamp(1_000, 0).unwrap();
        let marker = |secs: i64| {
            BTreeMap::from([(
                AA_SOURCE_MTIME_KEY.to_string(),
                DateTime::from_timestamp(secs, 0).unwrap().to_rfc3339(),
            )])
        };
        let source = MemoryClient::new("src");
        source.insert_with_metadata(
            "colored",
            b"1",
            t,
            BTreeMap::from([("color".to_string(), "red".to_string())]),
        );
        source.insert("replicated", b"2", t);
        source.insert("same", b"3", t);
        source.omit_listing_metadata();
        let target = MemoryClient::new("dst");
        target.insert("colored", b"1", t);
        target.insert_with_metadata("replicated", b"2", t, marker(500));
        target.insert_with_metadata("same", b"3", t, marker(1_000));
        target.omit_listing_metadata();

        let metadata = DiffOptions {
            is_metadata: true,
            ..Default::default()
        };
        let diffs: Vec<DiffType> =
            collect(source, target, metadata).await.into_iter().map(|m| m.diff).collect();
        assert_eq!(diffs, vec![DiffType::InMetadata, DiffType::InNone, DiffType::InNone]);
    }

    #[tokio::test]
    async fn test_active_active_marker_fetched_when_listing_lacks_it() {
        let t = DateTime::from_timestamp(1_000, 0).unwrap();
        let marker = |secs: i64| {
            BTreeMap::from([(
                AA_SOURCE_MTIME_KEY.to_string(),
                DateTime::from_timestamp(secs, 0).unwrap().to_rfc3339(),
            )])
        };
        let source = MemoryClient::new("src");
        source.insert("replicated", b"2", t);
        source.insert("same", b"3", t);
        let target = MemoryClient::new("dst");
        // 目标自身时间更新，但标记的源修改时间更旧
        let later = DateTime::from_timestamp(2_000, 0).unwrap();
        target.insert_with_metadata("replicated", b"2", later, marker(500));
        target.insert_with_metadata("same", b"3", later, marker(1_000));
        target.omit_listing_metadata();

        let aa = DiffOptions {
            active_active: true,
            ..Default::default()
        };
        let msgs = collect(source, target, aa).await;
        let diffs: Vec<DiffType> = msgs.iter().map(|m| m.diff).collect();
        assert_eq!(diffs, vec![DiffType::InAASourceMTime, DiffType::InNone]);
        let second = msgs[0].second_content.as_ref().unwrap();
        assert!(marked_source_mtime(second).is_some());
    }
}
