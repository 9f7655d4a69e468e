use std::sync::Arc;
use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::channel::ProgressMessage;
use crate::utils::retry::RetryPolicy;
use super::chunking::{ChunkPlan, TransferPath};
use super::client::{ChunkUploadResponse, UploadApi};
use super::errors::{Result, UploadError};
use super::source::FileHandle;
use super::types::UploadId;

/// What a transfer run (or a progress poll) tells the manager.
#[derive(Debug)]
pub(crate) struct TransferReport {
    pub upload_id: UploadId,
    pub generation: u64,
    pub kind: ReportKind,
}

#[derive(Debug)]
pub(crate) enum ReportKind {
    /// The server assigned a `photoId`
    Bound { photo_id: String },

    /// Server-confirmed bytes after a chunk batch
    Progress { bytes: u64, observed_at: Instant },

    Finished(Result<TransferOutcome>),

    /// Answer of the polling fallback
    Polled(Result<ProgressMessage>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    /// The server holds the whole file
    Completed,
    /// Every chunk was sent but the server has not confirmed assembly yet
    Processing,
}

/// One transfer run of one task. Never touches the queue, everything goes
/// back to the manager as a [`TransferReport`].
pub(crate) struct UploadWorker {
    pub(crate) api: Arc<dyn UploadApi>,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) retry: RetryPolicy,
    pub(crate) chunk_size: u64,
    pub(crate) chunk_concurrency: usize,
    pub(crate) upload_id: UploadId,
    pub(crate) generation: u64,
    pub(crate) reports: mpsc::UnboundedSender<TransferReport>,
}

impl UploadWorker {
    pub async fn run(self, file: FileHandle) {
        let plan = ChunkPlan::new(self.upload_id, file.size(), self.chunk_size);

        let result = match plan.path() {
            TransferPath::Direct => self.upload_direct(&file).await,
            TransferPath::Chunked { total_chunks } => self.upload_chunked(&file, plan, total_chunks).await,
        };

        match &result {
            Err(err) if err.is_cancelled() => debug!(task = %self.upload_id, "transfer stopped"),
            Err(err) => debug!(task = %self.upload_id, "transfer failed: {err}"),
            Ok(outcome) => debug!(task = %self.upload_id, ?outcome, "transfer finished"),
        }

        self.report(ReportKind::Finished(result));
    }

    fn report(&self, kind: ReportKind) {
        let _ = self.reports.send(TransferReport {
            upload_id: self.upload_id,
            generation: self.generation,
            kind,
        });
    }

    async fn upload_direct(&self, file: &FileHandle) -> Result<TransferOutcome> {
        let data = file.slice(0, file.size()).await?;

        let response = self.retry.run(&self.cancellation_token, || {
            self.api.upload_direct(file.name(), file.mime_type(), data.clone())
        }).await?;

        info!(task = %self.upload_id, photo_id = %response.photo_id, "direct upload finished");
        self.report(ReportKind::Bound { photo_id: response.photo_id });

        Ok(TransferOutcome::Completed)
    }

    async fn upload_chunked(&self, file: &FileHandle, plan: ChunkPlan, total_chunks: u32) -> Result<TransferOutcome> {
        // 初始化不重试
        let init = tokio::select! {
            _ = self.cancellation_token.cancelled() => return Err(UploadError::Cancelled),
            result = self.api.initialize_upload(file.name(), file.mime_type(), file.size()) => result?,
        };

        let photo_id = init.photo_id;
        debug!(task = %self.upload_id, %photo_id, total_chunks, "chunked upload initialized");
        self.report(ReportKind::Bound { photo_id: photo_id.clone() });

        let mut uploaded_chunks = 0;
        for batch in plan.batches(self.chunk_concurrency) {
            let requests = batch.map(|index| self.upload_one_chunk(file, &plan, &photo_id, index, total_chunks));

            // 任意分片失败都会中止整批
            let responses = try_join_all(requests).await?;

            uploaded_chunks = responses
                .iter()
                .map(|response| response.uploaded_chunks)
                .fold(uploaded_chunks, u32::max);

            self.report(ReportKind::Progress {
                bytes: plan.bytes_for_chunks(uploaded_chunks),
                observed_at: Instant::now(),
            });
        }

        if uploaded_chunks >= total_chunks {
            info!(task = %self.upload_id, %photo_id, "all chunks confirmed by server");
            Ok(TransferOutcome::Completed)
        } else {
            debug!(task = %self.upload_id, %photo_id, uploaded_chunks, total_chunks, "waiting for server to confirm");
            Ok(TransferOutcome::Processing)
        }
    }

    async fn upload_one_chunk(
        &self,
        file: &FileHandle,
        plan: &ChunkPlan,
        photo_id: &str,
        index: u32,
        total_chunks: u32,
    ) -> Result<ChunkUploadResponse> {
        if self.cancellation_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let chunk = plan.descriptor(index);
        let data = file.slice(chunk.start, chunk.end).await?;

        let response = self.retry.run(&self.cancellation_token, || {
            self.api.upload_chunk(photo_id, index, total_chunks, data.clone())
        }).await?;

        debug!(task = %self.upload_id, chunk = index, uploaded = response.uploaded_chunks, "chunk uploaded");
        Ok(response)
    }
}

/// Asks the server for the progress of a task stuck in `processing`.
pub(crate) async fn poll_progress(
    api: Arc<dyn UploadApi>,
    photo_id: String,
    upload_id: UploadId,
    generation: u64,
    reports: mpsc::UnboundedSender<TransferReport>,
) {
    let result = api.get_progress(&photo_id).await;
    let _ = reports.send(TransferReport {
        upload_id,
        generation,
        kind: ReportKind::Polled(result),
    });
}
