//! Readable upload sources

use crate::checkpoint::SourceIdentity;
use crate::{Result, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Random-access source of upload bytes
#[async_trait]
pub trait PartSource: Send + Sync {
    /// Total size in bytes
    fn size(&self) -> u64;

    /// Identity recorded in checkpoints
    fn identity(&self) -> SourceIdentity;

    /// Read exactly `length` bytes at `offset`
    async fn read_part(&self, offset: u64, length: u64) -> Result<Bytes>;

    /// Fail if the source changed since it was opened
    async fn verify_unchanged(&self) -> Result<()> {
        Ok(())
    }
}

/// A local file, reopened for every part so parts can be read concurrently
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

impl FileSource {
    /// Open `path` and record its size and modification time
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(TransferError::InvalidArgument(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            path,
        })
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PartSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn identity(&self) -> SourceIdentity {
        SourceIdentity::LocalFile {
            path: self.path.clone(),
            size: self.size,
            modified: self.modified,
        }
    }

    async fn read_part(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        read_exact(&mut file, length).await
    }

    async fn verify_unchanged(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        if metadata.len() != self.size || modified != self.modified {
            return Err(TransferError::SourceChanged(format!(
                "{} was modified during upload",
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// A seekable reader shared by all part tasks; reads are serialized
pub struct StreamSource<R> {
    reader: tokio::sync::Mutex<R>,
    size: u64,
}

impl<R> StreamSource<R>
where
    R: AsyncRead + AsyncSeek + Send + Unpin,
{
    /// Wrap `reader`, measuring its size by seeking to the end
    pub async fn new(mut reader: R) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0)).await?;
        reader.seek(SeekFrom::Start(0)).await?;
        Ok(Self {
            reader: tokio::sync::Mutex::new(reader),
            size,
        })
    }
}

#[async_trait]
impl<R> PartSource for StreamSource<R>
where
    R: AsyncRead + AsyncSeek + Send + Unpin,
{
    fn size(&self) -> u64 {
        self.size
    }

    fn identity(&self) -> SourceIdentity {
        SourceIdentity::Stream { size: self.size }
    }

    async fn read_part(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        reader.seek(SeekFrom::Start(offset)).await?;
        read_exact(&mut *reader, length).await
    }
}

/// Bytes already in memory
#[derive(Clone, Debug)]
pub struct BytesSource(Bytes);

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }
}

#[async_trait]
impl PartSource for BytesSource {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn identity(&self) -> SourceIdentity {
        SourceIdentity::Stream { size: self.size() }
    }

    async fn read_part(&self, offset: u64, length: u64) -> Result<Bytes> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.size())
            .ok_or(TransferError::LengthMismatch {
                expected: length,
                actual: self.size().saturating_sub(offset),
            })?;
        Ok(self.0.slice(offset as usize..end as usize))
    }
}

async fn read_exact<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, length: u64) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(length as usize);
    let read = reader.take(length).read_to_end(&mut buf).await? as u64;
    if read != length {
        return Err(TransferError::LengthMismatch {
            expected: length,
            actual: read,
        });
    }
    Ok(Bytes::from(buf))
}
