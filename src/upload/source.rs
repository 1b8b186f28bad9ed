//! Random-access data sources
//!
//! Parts are read by offset so that any part can be read again for a retry
//! or a resumed upload without rewinding shared state.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Read-only object content, shared between concurrent part uploads
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Total size in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// A range that runs past the end of the source is an
    /// `UnexpectedEof` error.
    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes>;
}

fn check_range(offset: u64, length: u64, size: u64) -> io::Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("range {offset}+{length} exceeds source of {size} bytes"),
        )),
    }
}

/// In-memory source
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl DataSource for BytesSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        check_range(offset, length, self.len())?;
        let start = usize::try_from(offset)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let end = usize::try_from(offset + length)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(self.data.slice(start..end))
    }
}

/// File on local disk. Each read opens its own handle.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Open `path` and record its current size
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Self {
            path,
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        check_range(offset, length, self.len)?;
        let capacity = usize::try_from(length)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; capacity];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}
