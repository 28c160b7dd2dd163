//! Random-access upload sources

use async_trait::async_trait;
use bucketdeck_core::Chunk;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{ClientError, Result};

/// Bytes an upload reads chunk by chunk.
///
/// Workers read their chunks concurrently, so a read must not depend on a
/// shared cursor.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Total size in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_chunk(&self, chunk: &Chunk) -> Result<Bytes>;
}

/// In-memory source
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        BytesSource { data: data.into() }
    }
}

#[async_trait]
impl ChunkSource for BytesSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_chunk(&self, chunk: &Chunk) -> Result<Bytes> {
        if chunk.end() > self.len() {
            return Err(out_of_range(chunk, self.len()));
        }
        Ok(self.data.slice(chunk.offset as usize..chunk.end() as usize))
    }
}

/// File on disk, opened once per chunk read
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Size is taken when opening; a file that shrinks later fails its reads
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        Ok(FileSource {
            path,
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_chunk(&self, chunk: &Chunk) -> Result<Bytes> {
        if chunk.end() > self.len {
            return Err(out_of_range(chunk, self.len));
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        let mut buffer = vec![0u8; chunk.len as usize];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}

fn out_of_range(chunk: &Chunk, len: u64) -> ClientError {
    ClientError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!(
            "part {} ends at byte {} but the source has {}",
            chunk.part_number,
            chunk.end(),
            len
        ),
    ))
}
