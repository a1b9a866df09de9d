use crate::error::ClientError;
use crate::storage::{Client, EventInfo, WatchOptions};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 汇集多个客户端的变更事件
pub struct Watcher {
    pub events: mpsc::Receiver<Vec<EventInfo>>,
    pub errors: mpsc::Receiver<ClientError>,
    events_tx: Option<mpsc::Sender<Vec<EventInfo>>>,
    errors_tx: Option<mpsc::Sender<ClientError>>,
    stops: Vec<CancellationToken>,
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher {
    pub fn new() -> Self {
        let (events_tx, events) = mpsc::channel(1000);
        let (errors_tx, errors) = mpsc::channel(10);
        Self {
            events,
            errors,
            events_tx: Some(events_tx),
            errors_tx: Some(errors_tx),
            stops: Vec::new(),
        }
    }

    /// 开始监听一个客户端，事件转发到汇总通道
    pub async fn join(&mut self, client: Arc<dyn Client>, recursive: bool) -> Result<(), ClientError> {
        let (Some(events_tx), Some(errors_tx)) = (self.events_tx.clone(), self.errors_tx.clone())
        else {
            return Err(ClientError::InvalidArgument("监听已关闭".to_string()));
        };

        let mut object = client
            .watch(WatchOptions {
                recursive,
                ..Default::default()
            })
            .await?;
        info!("开始监听: {}", client.url());
        self.stops.push(object.done.clone());

        let url = client.url().to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(events) = object.events.recv() => {
                        if events_tx.send(events).await.is_err() {
                            break;
                        }
                    }
                    Some(err) = object.errors.recv() => {
                        if errors_tx.send(err).await.is_err() {
                            break;
                        }
                    }
                    else => break,
                }
            }
            object.done.cancel();
            debug!("监听结束: {}", url);
        });
        Ok(())
    }

    /// 不再加入新的客户端；所有已加入的监听结束后汇总通道随之关闭
    pub fn seal(&mut self) {
        self.events_tx.take();
        self.errors_tx.take();
    }

    /// 停止所有监听
    pub fn stop(&self) {
        for stop in &self.stops {
            stop.cancel();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
