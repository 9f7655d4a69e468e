//! Validation of candidate files before they enter the queue.
//!
//! Checks run per file in a fixed order (type, size, duplicate) and the quota
//! check runs last over everything that survived, accepting or refusing the
//! batch as a whole.

use std::collections::HashSet;
use thiserror::Error;
use super::client::StorageUsage;
use super::source::FileHandle;
use super::task::UploadTask;

/// 100 MiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

pub const IMAGE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/heic",
    "image/heif",
    "image/bmp",
    "image/tiff",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("File is empty")]
    Empty,

    #[error("File is too large ({size} bytes), maximum size is {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("File is already in the upload queue")]
    Duplicate,

    #[error("Storage quota exceeded: {available} bytes available, {requested} bytes requested")]
    QuotaExceeded { available: u64, requested: u64 },
}

#[derive(Debug, Default)]
pub struct Admission {
    pub accepted: Vec<FileHandle>,
    pub rejected: Vec<(FileHandle, RejectReason)>,
}

pub fn is_supported_mime(mime_type: &str) -> bool {
    let mime_type = mime_type.trim().to_ascii_lowercase();
    IMAGE_MIME_TYPES.contains(&mime_type.as_str())
}

fn check_file(file: &FileHandle, max_file_size: u64) -> Result<(), RejectReason> {
    if !is_supported_mime(file.mime_type()) {
        return Err(RejectReason::UnsupportedType(file.mime_type().to_string()));
    }

    let size = file.size();
    if size == 0 {
        return Err(RejectReason::Empty);
    }
    if size > max_file_size {
        return Err(RejectReason::TooLarge { size, max: max_file_size });
    }

    Ok(())
}

/// Splits `files` into accepted and rejected without side effects.
///
/// `queued` is the current queue. Every non-terminal task, failed ones
/// included, takes part in the duplicate guard. Non-terminal tasks that can
/// still upload (everything but admission rejects) count as in-flight bytes.
/// With no `usage` the quota check is skipped.
pub fn admit<'a>(
    files: Vec<FileHandle>,
    queued: impl IntoIterator<Item = &'a UploadTask>,
    usage: Option<&StorageUsage>,
    max_file_size: u64,
) -> Admission {
    let mut seen = HashSet::new();
    let mut in_flight_bytes = 0u64;
    for task in queued {
        if task.state.is_terminal() {
            continue;
        }
        seen.insert((task.file_name.clone(), task.total_bytes));
        if !task.rejected {
            in_flight_bytes += task.total_bytes;
        }
    }

    let mut admission = Admission::default();
    for file in files {
        if let Err(reason) = check_file(&file, max_file_size) {
            admission.rejected.push((file, reason));
            continue;
        }

        // 同一批次里的重复文件也算
        if !seen.insert((file.name().to_string(), file.size())) {
            admission.rejected.push((file, RejectReason::Duplicate));
            continue;
        }

        admission.accepted.push(file);
    }

    if let Some(usage) = usage {
        let batch_bytes: u64 = admission.accepted.iter().map(|file| file.size()).sum();
        let available = usage.available_bytes().saturating_sub(in_flight_bytes);

        if batch_bytes > available {
            let reason = RejectReason::QuotaExceeded { available, requested: batch_bytes };
            for file in admission.accepted.drain(..) {
                admission.rejected.push((file, reason.clone()));
            }
        }
    }

    admission
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::source::MemoryFile;
    use crate::upload::types::UploadStatus;

    const MB: u64 = 1024 * 1024;

    fn file(name: &str, mime: &str, size: u64) -> FileHandle {
        MemoryFile::sized(name, mime, size).handle()
    }

    fn names(files: &[FileHandle]) -> Vec<&str> {
        files.iter().map(|f| f.name()).collect()
    }

    #[test]
    fn test_mime_whitelist_is_case_insensitive() {
        assert!(is_supported_mime("image/JPEG"));
        assert!(is_supported_mime("image/heic"));
        assert!(!is_supported_mime("video/mp4"));
        assert!(!is_supported_mime("application/pdf"));
    }

    #[test]
    fn test_per_file_checks_in_order() {
        let files = vec![
            file("doc.pdf", "application/pdf", 0),
            file("empty.jpg", "image/jpeg", 0),
            file("huge.png", "image/png", 101 * MB),
            file("ok.gif", "image/gif", MB),
        ];

        let admission = admit(files, [], None, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(names(&admission.accepted), vec!["ok.gif"]);

        let reasons: Vec<_> = admission.rejected.iter().map(|(_, r)| r.clone()).collect();
        assert_eq!(reasons[0], RejectReason::UnsupportedType("application/pdf".into()));
        assert_eq!(reasons[1], RejectReason::Empty);
        assert_eq!(reasons[2], RejectReason::TooLarge { size: 101 * MB, max: DEFAULT_MAX_FILE_SIZE });
    }

    #[test]
    fn test_max_size_is_inclusive() {
        let admission = admit(
            vec![file("edge.jpg", "image/jpeg", DEFAULT_MAX_FILE_SIZE)],
            [],
            None,
            DEFAULT_MAX_FILE_SIZE,
        );
        assert_eq!(admission.accepted.len(), 1);
    }

    #[test]
    fn test_duplicate_of_queued_task() {
        let queued = UploadTask::new(file("a.jpg", "image/jpeg", 1000));

        let admission = admit(
            vec![file("a.jpg", "image/jpeg", 1000), file("a.jpg", "image/jpeg", 1001)],
            [&queued],
            None,
            DEFAULT_MAX_FILE_SIZE,
        );

        assert_eq!(admission.accepted.len(), 1);
        assert_eq!(admission.accepted[0].size(), 1001);
        assert_eq!(admission.rejected[0].1, RejectReason::Duplicate);
    }

    #[test]
    fn test_terminal_tasks_do_not_block_duplicates() {
        let mut done = UploadTask::new(file("a.jpg", "image/jpeg", 1000));
        done.state = UploadStatus::Completed;
        let mut cancelled = UploadTask::new(file("b.jpg", "image/jpeg", 1000));
        cancelled.state = UploadStatus::Cancelled;

        let admission = admit(
            vec![file("a.jpg", "image/jpeg", 1000), file("b.jpg", "image/jpeg", 1000)],
            [&done, &cancelled],
            None,
            DEFAULT_MAX_FILE_SIZE,
        );
        assert_eq!(admission.accepted.len(), 2);
    }

    #[test]
    fn test_failed_task_blocks_duplicate() {
        let mut failed = UploadTask::new(file("a.jpg", "image/jpeg", 1000));
        failed.state = UploadStatus::Failed;
        let mut paused = UploadTask::new(file("b.jpg", "image/jpeg", 1000));
        paused.state = UploadStatus::Paused;

        let admission = admit(
            vec![file("a.jpg", "image/jpeg", 1000), file("b.jpg", "image/jpeg", 1000)],
            [&failed, &paused],
            None,
            DEFAULT_MAX_FILE_SIZE,
        );
        assert!(admission.accepted.is_empty());
        assert!(admission.rejected.iter().all(|(_, reason)| *reason == RejectReason::Duplicate));
    }

    #[test]
    fn test_failed_task_counts_against_quota() {
        let usage = StorageUsage {
            storage_used_bytes: 0,
            storage_quota_bytes: 10 * MB,
        };
        let mut failed = UploadTask::new(file("big.jpg", "image/jpeg", 8 * MB));
        failed.state = UploadStatus::Failed;
        let rejected = UploadTask::rejected(file("huge.jpg", "image/jpeg", 9 * MB), "quota");

        let admission = admit(
            vec![file("c.jpg", "image/jpeg", 3 * MB)],
            [&failed, &rejected],
            Some(&usage),
            DEFAULT_MAX_FILE_SIZE,
        );
        assert!(admission.accepted.is_empty());
        assert_eq!(
            admission.rejected[0].1,
            RejectReason::QuotaExceeded { available: 2 * MB, requested: 3 * MB }
        );
    }

    #[test]
    fn test_duplicate_within_batch() {
        let admission = admit(
            vec![file("a.jpg", "image/jpeg", 1000), file("a.jpg", "image/jpeg", 1000)],
            [],
            None,
            DEFAULT_MAX_FILE_SIZE,
        );
        assert_eq!(admission.accepted.len(), 1);
        assert_eq!(admission.rejected.len(), 1);
    }

    #[test]
    fn test_quota_rejects_whole_batch() {
        let usage = StorageUsage {
            storage_used_bytes: 95 * MB,
            storage_quota_bytes: 100 * MB,
        };

        let admission = admit(
            vec![file("a.jpg", "image/jpeg", 3 * MB), file("b.jpg", "image/jpeg", 3 * MB)],
            [],
            Some(&usage),
            DEFAULT_MAX_FILE_SIZE,
        );

        assert!(admission.accepted.is_empty());
        assert_eq!(admission.rejected.len(), 2);
        for (_, reason) in &admission.rejected {
            assert_eq!(*reason, RejectReason::QuotaExceeded { available: 5 * MB, requested: 6 * MB });
        }
    }

    #[test]
    fn test_single_file_over_quota() {
        let usage = StorageUsage {
            storage_used_bytes: 0,
            storage_quota_bytes: 5 * MB,
        };

        let admission = admit(vec![file("a.jpg", "image/jpeg", 6 * MB)], [], Some(&usage), DEFAULT_MAX_FILE_SIZE);

        assert!(admission.accepted.is_empty());
        assert_eq!(admission.rejected.len(), 1);
        assert_eq!(
            admission.rejected[0].1,
            RejectReason::QuotaExceeded { available: 5 * MB, requested: 6 * MB }
        );
    }

    #[test]
    fn test_quota_counts_in_flight_tasks() {
        let usage = StorageUsage {
            storage_used_bytes: 90 * MB,
            storage_quota_bytes: 100 * MB,
        };
        let queued = UploadTask::new(file("big.jpg", "image/jpeg", 8 * MB));

        let admission = admit(
            vec![file("c.jpg", "image/jpeg", 3 * MB)],
            [&queued],
            Some(&usage),
            DEFAULT_MAX_FILE_SIZE,
        );
        assert!(admission.accepted.is_empty());

        let admission = admit(
            vec![file("c.jpg", "image/jpeg", 2 * MB)],
            [&queued],
            Some(&usage),
            DEFAULT_MAX_FILE_SIZE,
        );
        assert_eq!(admission.accepted.len(), 1);
    }

    #[test]
    fn test_rejected_files_do_not_count_against_quota() {
        let usage = StorageUsage {
            storage_used_bytes: 0,
            storage_quota_bytes: 10 * MB,
        };

        let admission = admit(
            vec![file("a.jpg", "image/jpeg", 4 * MB), file("b.mp4", "video/mp4", 50 * MB)],
            [],
            Some(&usage),
            DEFAULT_MAX_FILE_SIZE,
        );
        assert_eq!(names(&admission.accepted), vec!["a.jpg"]);
    }
}
