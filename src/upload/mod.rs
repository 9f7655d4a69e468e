pub mod admission;
pub mod chunking;
pub mod client;
pub mod errors;
mod manager;
mod manager_worker;
pub mod source;
pub mod task;
pub mod telemetry;
pub mod types;
mod worker;

pub use client::{HttpUploadApi, QuotaService, StorageUsage, UploadApi};
pub use errors::{Result, UploadError};
pub use manager::{UploadManager, UploadManagerHandle};
pub use source::{FileHandle, FileSource, LocalFile, MemoryFile};
pub use task::UploadTask;
pub use types::{
    AdmissionReport, QueueSummary, RejectedFile, TaskProgress, UploadConfig, UploadEvent, UploadId, UploadStatus,
};
