use crate::error::ClientError;
use crate::storage::{Client, ClientContent, DirOpt, ListOptions};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 列举结果通道的缓冲大小
const LISTING_BUFFER: usize = 1000;

/// 内容列举器
///
/// 在后台任务中列举客户端的全部条目，并检查结果是否严格按 key 的
/// 字节序递增。顺序一旦被破坏，发送一个错误并结束。
pub struct ContentLister {
    client: Arc<dyn Client>,
    opts: ListOptions,
    cancel: CancellationToken,
}

impl ContentLister {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            opts: ListOptions {
                recursive: true,
                include_versions: false,
                dir_opt: DirOpt::None,
            },
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, opts: ListOptions) -> Self {
        self.opts = opts;
        self
    }

    /// 创建带取消令牌的列举器
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 开始列举，返回结果通道
    pub fn list(self) -> mpsc::Receiver<Result<ClientContent, ClientError>> {
        let (tx, rx) = mpsc::channel(LISTING_BUFFER);

        tokio::spawn(async move {
            let url = self.client.url().to_string();
            info!("开始列举: {}", url);

            let mut stream = match self.client.list(self.opts.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            // 多版本列举时同一个 key 会连续出现
            let allow_equal = self.opts.include_versions;
            let mut previous: Option<String> = None;
            let mut count = 0u64;

            loop {
                let item = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        let _ = tx.send(Err(ClientError::Cancelled)).await;
                        return;
                    }
                    item = stream.next() => item,
                };
                let Some(item) = item else { break };

                let content = match item {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                if let Some(prev) = &previous {
                    let ordered = if allow_equal {
                        prev.as_bytes() <= content.url.as_bytes()
                    } else {
                        prev.as_bytes() < content.url.as_bytes()
                    };
                    if !ordered {
                        let _ = tx
                            .send(Err(ClientError::UnsortedListing {
                                previous: prev.clone(),
                                current: content.url.clone(),
                            }))
                            .await;
                        return;
                    }
                }
                previous = Some(content.url.clone());
                count += 1;

                if tx.send(Ok(content)).await.is_err() {
                    debug!("列举结果接收端已关闭: {}", url);
                    return;
                }
            }

            info!("列举完成: {}, {} 个条目", url, count);
        });

        rx
    }
}
