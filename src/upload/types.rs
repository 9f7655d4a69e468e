use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use crate::utils::retry::RetryPolicy;
use super::chunking::DEFAULT_CHUNK_SIZE;
use super::client::StorageUsage;
use super::errors::Result;
use super::source::FileHandle;
use super::task::UploadTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Admitted, waiting for a slot
    Pending,
    /// Bytes are being transferred
    Uploading,
    /// All bytes sent, waiting for the server to confirm
    Processing,
    Completed,
    /// Retriable
    Failed,
    Paused,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Can still move on its own or be routed progress frames.
    pub fn is_live(self) -> bool {
        !self.is_terminal() && self != Self::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a single task
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub upload_id: UploadId,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub percentage: u8,
    pub eta: Option<Duration>,
}

/// Aggregate view over the whole queue
#[derive(Debug, Clone, Default)]
pub struct QueueSummary {
    pub total_tasks: usize,
    pub pending: usize,
    pub uploading: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub cancelled: usize,

    pub total_bytes: u64,
    pub total_uploaded: u64,

    /// Sum of per-task speeds
    pub overall_speed: f64,
    pub overall_percentage: f64,
    pub overall_eta: Option<Duration>,

    /// Time since the first file of the current session was admitted
    pub elapsed: Option<Duration>,
}

impl QueueSummary {
    /// Nothing left that will move on its own.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.uploading == 0 && self.processing == 0
    }
}

/// A file refused at admission
#[derive(Debug, Clone)]
pub struct RejectedFile {
    pub upload_id: UploadId,
    pub file_name: String,
    pub reason: String,
}

/// Outcome of one `add_files` call
#[derive(Debug, Clone, Default)]
pub struct AdmissionReport {
    pub accepted: Vec<UploadId>,
    pub rejected: Vec<RejectedFile>,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    TaskAdded {
        upload_id: UploadId,
    },

    StateChanged {
        upload_id: UploadId,
        old_state: UploadStatus,
        new_state: UploadStatus,
    },

    Progress(TaskProgress),

    Failed {
        upload_id: UploadId,
        error: String,
    },

    Completed {
        upload_id: UploadId,
        photo_id: Option<String>,
    },

    /// Nothing pending, uploading or processing remains
    AllCompleted {
        total_tasks: usize,
        total_bytes: u64,
        total_duration: Duration,
    },
}

pub enum ManagerCommand {
    AddFiles {
        files: Vec<FileHandle>,
        usage: Option<StorageUsage>,
        reply: oneshot::Sender<AdmissionReport>,
    },

    Pause {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    PauseAll {
        reply: oneshot::Sender<usize>,
    },

    Resume {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    ResumeAll {
        reply: oneshot::Sender<usize>,
    },

    Cancel {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    CancelAll {
        reply: oneshot::Sender<usize>,
    },

    Retry {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    RetryFailed {
        reply: oneshot::Sender<usize>,
    },

    GetTask {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    GetAllTasks {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },

    /// Drop every `Completed` task
    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },

    /// Drop every `Completed` and `Cancelled` task
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },

    Summary {
        reply: oneshot::Sender<QueueSummary>,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Tasks allowed in `Uploading` at once
    pub global_concurrency: usize,

    /// Chunk requests in flight per task
    pub per_task_chunk_concurrency: usize,

    pub chunk_size: u64,

    pub max_file_size: u64,

    /// Speed/ETA sampling and polling-fallback period
    pub sample_interval: Duration,

    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 3,
            per_task_chunk_concurrency: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: super::admission::DEFAULT_MAX_FILE_SIZE,
            sample_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}
