use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use super::errors::{Result, UploadError};
use super::source::FileHandle;
use super::types::{TaskProgress, UploadId, UploadStatus};

#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: UploadId,
    /// Server-side correlation id, bound once per run
    pub photo_id: Option<String>,
    pub file: FileHandle,
    pub file_name: String,
    pub mime_type: String,
    pub total_bytes: u64,
    pub state: UploadStatus,
    pub uploaded_bytes: u64,
    /// 0..=100
    pub progress: u8,
    /// Bytes per second
    pub speed: f64,
    pub eta: Option<Duration>,
    pub error: Option<String>,
    /// Refused at admission, can never be retried
    pub rejected: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub(crate) cancel_token: Option<CancellationToken>,
    /// Bumped on every run so reports of an abandoned run can be told apart
    pub(crate) generation: u64,
}

impl UploadTask {
    pub fn new(file: FileHandle) -> Self {
        Self {
            id: UploadId::new(),
            photo_id: None,
            file_name: file.name().to_string(),
            mime_type: file.mime_type().to_string(),
            total_bytes: file.size(),
            file,
            state: UploadStatus::Pending,
            uploaded_bytes: 0,
            progress: 0,
            speed: 0.0,
            eta: None,
            error: None,
            rejected: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel_token: None,
            generation: 0,
        }
    }

    /// A task that failed admission.
    pub fn rejected(file: FileHandle, reason: impl Into<String>) -> Self {
        let mut task = Self::new(file);
        task.state = UploadStatus::Failed;
        task.error = Some(reason.into());
        task.rejected = true;
        task
    }

    pub fn is_valid_transition(from: UploadStatus, to: UploadStatus) -> bool {
        use UploadStatus::*;

        match (from, to) {
            (Pending, Uploading | Paused | Cancelled) => true,
            (Uploading, Processing | Completed | Failed | Paused | Cancelled) => true,
            (Processing, Completed | Failed | Cancelled) => true,
            (Failed, Pending | Cancelled) => true,
            (Paused, Pending | Cancelled) => true,
            _ => false,
        }
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&mut self, to: UploadStatus) -> Result<UploadStatus> {
        let from = self.state;
        if !Self::is_valid_transition(from, to) {
            return Err(UploadError::InvalidTransition {
                action: action_name(to),
                state: from,
            });
        }

        self.state = to;
        match to {
            UploadStatus::Completed => {
                self.uploaded_bytes = self.total_bytes;
                self.progress = 100;
                self.completed_at = Some(Utc::now());
                self.clear_rates();
            }
            UploadStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
                self.clear_rates();
            }
            UploadStatus::Failed | UploadStatus::Paused => self.clear_rates(),
            _ => {}
        }

        Ok(from)
    }

    /// Clamped to `total_bytes`.
    pub fn set_uploaded(&mut self, bytes: u64) {
        let bytes = bytes.min(self.total_bytes);
        self.uploaded_bytes = bytes;
        self.progress = percentage(bytes, self.total_bytes);
    }

    /// Returns false when a different id is already bound.
    pub fn bind_photo_id(&mut self, photo_id: String) -> bool {
        match &self.photo_id {
            Some(existing) => *existing == photo_id,
            None => {
                self.photo_id = Some(photo_id);
                true
            }
        }
    }

    /// Back to a fresh `pending` run from chunk 0.
    pub fn reset_for_retry(&mut self) {
        self.uploaded_bytes = 0;
        self.progress = 0;
        self.error = None;
        self.photo_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.clear_rates();
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes - self.uploaded_bytes
    }

    pub fn to_progress(&self) -> TaskProgress {
        TaskProgress {
            upload_id: self.id,
            bytes_uploaded: self.uploaded_bytes,
            total_bytes: self.total_bytes,
            speed: self.speed,
            percentage: self.progress,
            eta: self.eta,
        }
    }

    fn clear_rates(&mut self) {
        self.speed = 0.0;
        self.eta = None;
    }
}

pub fn percentage(uploaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((uploaded as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

fn action_name(to: UploadStatus) -> &'static str {
    match to {
        UploadStatus::Pending => "requeue",
        UploadStatus::Uploading => "start",
        UploadStatus::Processing => "finish transfer of",
        UploadStatus::Completed => "complete",
        UploadStatus::Failed => "fail",
        UploadStatus::Paused => "pause",
        UploadStatus::Cancelled => "cancel",
    }
}
