use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;
use crate::channel::{ChannelEvent, PushChannel, PushChannelConfig};
use super::client::{QuotaService, UploadApi};
use super::errors::{Result, UploadError};
use super::manager_worker::UploadManagerWorker;
use super::source::FileHandle;
use super::task::UploadTask;
use super::types::{AdmissionReport, ManagerCommand, QueueSummary, UploadConfig, UploadEvent, UploadId};

/// Cloneable handle to the upload queue. All state lives in the worker task.
#[derive(Clone)]
pub struct UploadManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    quota: Option<Arc<dyn QuotaService>>,
}

/// 上传管理器句柄 - 包含管理器和工作线程
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
    pub push_channel: Option<PushChannel>,
}

impl UploadManagerHandle {
    /// Cancels every running transfer and waits for the worker to exit.
    pub async fn shutdown(self) -> Result<()> {
        if let Some(channel) = self.push_channel {
            channel.shutdown().await;
        }

        // 工作线程已经退出时忽略错误
        let _ = self.manager.request(|reply| ManagerCommand::Shutdown { reply }).await;
        drop(self.manager);

        self.worker_handle.await
            .map_err(|err| UploadError::InternalError(format!("Worker panic: {}", err)))
    }
}

impl UploadManager {
    /// A manager without a push channel. Tasks left in `processing` are
    /// confirmed through the polling fallback.
    pub fn new(api: Arc<dyn UploadApi>, quota: Option<Arc<dyn QuotaService>>, config: UploadConfig) -> UploadManagerHandle {
        Self::spawn(api, quota, config, None, None)
    }

    /// A manager fed by a reconnecting push channel.
    pub fn with_push_channel(
        api: Arc<dyn UploadApi>,
        quota: Option<Arc<dyn QuotaService>>,
        config: UploadConfig,
        channel_config: PushChannelConfig,
    ) -> UploadManagerHandle {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let push_channel = PushChannel::spawn(channel_config, channel_tx);

        Self::spawn(api, quota, config, Some(channel_rx), Some(push_channel))
    }

    /// A manager fed by an arbitrary source of channel events.
    pub fn with_channel_events(
        api: Arc<dyn UploadApi>,
        quota: Option<Arc<dyn QuotaService>>,
        config: UploadConfig,
        channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> UploadManagerHandle {
        Self::spawn(api, quota, config, Some(channel_rx), None)
    }

    fn spawn(
        api: Arc<dyn UploadApi>,
        quota: Option<Arc<dyn QuotaService>>,
        config: UploadConfig,
        channel_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
        push_channel: Option<PushChannel>,
    ) -> UploadManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let worker_handle = tokio::spawn(UploadManagerWorker::run(
            api,
            config,
            command_rx,
            channel_rx,
            event_tx.clone(),
        ));

        let manager = Self {
            command_tx,
            event_tx,
            quota,
        };

        UploadManagerHandle {
            manager,
            worker_handle,
            push_channel,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| UploadError::ManagerShutdown)?;

        reply_rx
            .await
            .map_err(|_| UploadError::ManagerShutdown)
    }

    /// Admits `files` and queues the accepted ones.
    ///
    /// Current storage usage is fetched first; when the quota service fails
    /// the batch is admitted without a quota check.
    pub async fn add_files(&self, files: Vec<FileHandle>) -> Result<AdmissionReport> {
        let usage = match &self.quota {
            Some(quota) => match quota.storage_usage().await {
                Ok(usage) => Some(usage),
                Err(err) => {
                    warn!("storage usage unavailable, skipping quota check: {err}");
                    None
                }
            },
            None => None,
        };

        self.request(|reply| ManagerCommand::AddFiles { files, usage, reply }).await
    }

    /// Pause upload task
    pub async fn pause(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Pause { upload_id, reply }).await?
    }

    /// Resume upload, restarting from the first chunk
    pub async fn resume(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Resume { upload_id, reply }).await?
    }

    /// Cancel upload
    pub async fn cancel(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Cancel { upload_id, reply }).await?
    }

    /// Requeue a failed task
    pub async fn retry(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Retry { upload_id, reply }).await?
    }

    pub async fn pause_all(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::PauseAll { reply }).await
    }

    pub async fn resume_all(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ResumeAll { reply }).await
    }

    pub async fn cancel_all(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::CancelAll { reply }).await
    }

    /// Retries every failed task that was not rejected at admission
    pub async fn retry_failed(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::RetryFailed { reply }).await
    }

    /// Get task
    pub async fn get_task(&self, upload_id: UploadId) -> Result<Option<UploadTask>> {
        self.request(|reply| ManagerCommand::GetTask { upload_id, reply }).await
    }

    /// Snapshot of the queue in insertion order
    pub async fn get_all_tasks(&self) -> Result<Vec<UploadTask>> {
        self.request(|reply| ManagerCommand::GetAllTasks { reply }).await
    }

    pub async fn clear_completed(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ClearCompleted { reply }).await
    }

    pub async fn clear_finished(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ClearFinished { reply }).await
    }

    pub async fn summary(&self) -> Result<QueueSummary> {
        self.request(|reply| ManagerCommand::Summary { reply }).await
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 每个订阅者都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }
}
