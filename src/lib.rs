pub mod channel;
pub mod config;
pub mod upload;
pub mod utils;

pub use config::EngineConfig;
pub use upload::{
    FileHandle,
    FileSource,
    HttpUploadApi,
    LocalFile,
    MemoryFile,
    QueueSummary,
    Result,
    UploadApi,
    UploadConfig,
    UploadError,
    UploadEvent,
    UploadId,
    UploadManager,
    UploadManagerHandle,
    UploadStatus,
    UploadTask,
};
