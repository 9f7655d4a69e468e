use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use super::errors::{Result, UploadError};

/// A byte source with a known length that can be read by range.
#[async_trait]
pub trait FileSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    fn mime_type(&self) -> &str;

    /// Reads `[start, end)`.
    async fn slice(&self, start: u64, end: u64) -> Result<Bytes>;
}

pub type FileHandle = Arc<dyn FileSource>;

/// Guesses an image MIME type from a file extension.
pub fn mime_from_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

fn check_range(start: u64, end: u64, size: u64) -> Result<()> {
    if start > end || end > size {
        return Err(UploadError::internal_error(format!(
            "range {start}..{end} is outside of 0..{size}"
        )));
    }
    Ok(())
}

/// A file on the local disk. Each slice opens its own handle so chunks can be
/// read concurrently.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
    mime_type: String,
}

impl LocalFile {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Validation(format!("Not a file: {}", path.display())));
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::Validation(format!("Unreadable file name: {}", path.display())))?
            .to_string();

        Ok(Self {
            mime_type: mime_from_path(&path).to_string(),
            size: metadata.len(),
            name,
            path,
        })
    }
}

#[async_trait]
impl FileSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn slice(&self, start: u64, end: u64) -> Result<Bytes> {
        check_range(start, end, self.size)?;

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buffer = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buffer).await?;

        Ok(Bytes::from(buffer))
    }
}

/// In-memory file, mostly for tests and callers that already hold the bytes.
#[derive(Clone)]
pub struct MemoryFile {
    name: String,
    mime_type: String,
    data: Bytes,
    /// Reported length, may differ from `data` for size-only checks
    size: u64,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            data,
        }
    }

    /// A file that claims `size` bytes but holds no content. Slicing it fails.
    pub fn sized(name: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: Bytes::new(),
            size,
        }
    }

    pub fn handle(self) -> FileHandle {
        Arc::new(self)
    }
}

impl fmt::Debug for MemoryFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish()
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn slice(&self, start: u64, end: u64) -> Result<Bytes> {
        check_range(start, end, self.data.len() as u64)?;
        Ok(self.data.slice(start as usize..end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_path() {
        assert_eq!(mime_from_path(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_from_path(Path::new("dir/b.heic")), "image/heic");
        assert_eq!(mime_from_path(Path::new("notes.txt")), "application/octet-stream");
        assert_eq!(mime_from_path(Path::new("no_extension")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_local_file_slices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let file = LocalFile::open(&path).await.unwrap();
        assert_eq!(file.name(), "photo.png");
        assert_eq!(file.size(), 10_000);
        assert_eq!(file.mime_type(), "image/png");

        let slice = file.slice(4_000, 6_500).await.unwrap();
        assert_eq!(&slice[..], &data[4_000..6_500]);

        assert!(file.slice(9_000, 10_001).await.is_err());
    }

    #[tokio::test]
    async fn test_local_file_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalFile::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_memory_file_slices() {
        let file = MemoryFile::new("a.jpg", "image/jpeg", vec![1u8, 2, 3, 4, 5]);
        assert_eq!(&file.slice(1, 4).await.unwrap()[..], &[2, 3, 4]);
        assert!(file.slice(3, 9).await.is_err());
    }
}
