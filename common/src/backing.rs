//! Backing Stream / Backing File Adapter (spec sections 3 and 4.5).
//!
//! A Backing Stream is a seekable byte source of known size and block
//! size. The adapter here opens a path as a regular file (the common case:
//! an ISO9660 image) and, on Linux, probes block-device geometry via ioctl
//! when the path resolves to an optical device node rather than a regular
//! file.

use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::types::CdEmuError;

/// Natural sector size of a CD laid out as raw blocks.
pub const CD_DEV_BLOCK_SIZE: u64 = 512;
/// Natural sector size of an ISO9660 / DVD image.
pub const DVD_DEV_BLOCK_SIZE: u64 = 2048;

/// A random-access byte source backing one logical unit.
///
/// Exclusively owned by its LU while loaded (spec section 3); the only
/// operation the SCSI engine needs is a cancellable, length-bounded read.
pub struct BackingStream {
    file: File,
    pub size: u64,
    pub block_size: u64,
}

impl BackingStream {
    /// Open `path` and determine size and block size, applying the
    /// 2048-byte heuristic from spec section 6: a source that reports a
    /// natural 512-byte block size is treated as 2048-byte blocks when its
    /// size is an exact multiple of 2048 (typical of an ISO image sitting
    /// on a raw block device).
    pub async fn open(path: &Path) -> Result<Self, CdEmuError> {
        let file = File::open(path)
            .await
            .map_err(|e| CdEmuError::BackingFile(format!("{}: {e}", path.display())))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| CdEmuError::BackingFile(format!("{}: {e}", path.display())))?;

        let mut size = metadata.len();
        let mut block_size = CD_DEV_BLOCK_SIZE;

        #[cfg(target_os = "linux")]
        if std::os::unix::fs::FileTypeExt::is_block_device(&metadata.file_type()) {
            if let Some((dev_size, dev_block_size)) = linux::probe_block_device(&file) {
                size = dev_size;
                block_size = dev_block_size;
            } else {
                warn!(path = %path.display(), "failed to probe block device geometry, falling back to file size");
            }
        }

        if size == 0 {
            return Err(CdEmuError::BackingFile(format!(
                "{}: empty backing file",
                path.display()
            )));
        }

        if block_size == CD_DEV_BLOCK_SIZE && size % DVD_DEV_BLOCK_SIZE == 0 {
            block_size = DVD_DEV_BLOCK_SIZE;
        }

        debug!(path = %path.display(), size, block_size, "opened backing stream");

        Ok(Self {
            file,
            size,
            block_size,
        })
    }

    pub fn num_blocks(&self) -> u64 {
        self.size / self.block_size
    }

    /// Read up to `len` bytes starting at `offset`. Mirrors the reference
    /// engine's "errors become short reads" policy (spec section 7,
    /// IOError): on I/O failure this returns an empty vector rather than
    /// an error, so the caller can still complete the SCSI request with
    /// GOOD status and zero bytes produced.
    pub async fn read_at(&mut self, offset: u64, len: u64) -> Vec<u8> {
        if let Err(e) = self.file.seek(SeekFrom::Start(offset)).await {
            warn!(offset, error = %e, "backing stream seek failed");
            return Vec::new();
        }
        let mut buf = vec![0u8; len as usize];
        let mut total = 0usize;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]).await {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    warn!(offset, error = %e, "backing stream read failed");
                    return Vec::new();
                }
            }
        }
        buf.truncate(total);
        buf
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::io::AsRawFd;
    use tokio::fs::File;

    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    nix::ioctl_read!(blkssz_get, 0x12, 104, i32);

    /// Best-effort geometry probe for a Linux block device via
    /// `BLKGETSIZE64`/`BLKSSZGET`. Returns `None` on any ioctl failure so
    /// the caller can fall back to treating the path like a regular file.
    pub fn probe_block_device(file: &File) -> Option<(u64, u64)> {
        let fd = file.as_raw_fd();
        let mut size: u64 = 0;
        let mut sector_size: i32 = 0;
        unsafe {
            blkgetsize64(fd, &mut size).ok()?;
            blkssz_get(fd, &mut sector_size).ok()?;
        }
        Some((size, sector_size as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn regular_file_not_2048_aligned_defaults_to_cd_block_size() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 4097]).unwrap();
        let stream = BackingStream::open(f.path()).await.unwrap();
        assert_eq!(stream.size, 4097);
        assert_eq!(stream.block_size, CD_DEV_BLOCK_SIZE);
    }

    #[tokio::test]
    async fn regular_file_2048_aligned_is_promoted_to_dvd_block_size() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 4096]).unwrap();
        let stream = BackingStream::open(f.path()).await.unwrap();
        assert_eq!(stream.size, 4096);
        assert_eq!(stream.block_size, DVD_DEV_BLOCK_SIZE);
    }

    #[tokio::test]
    async fn read_at_returns_requested_bytes() {
        let mut f = NamedTempFile::new().unwrap();
        let mut data = vec![0u8; 8192];
        data[2048..2056].copy_from_slice(b"sector 0");
        f.write_all(&data).unwrap();

        let mut stream = BackingStream::open(f.path()).await.unwrap();
        let bytes = stream.read_at(2048, 2048).await;
        assert_eq!(&bytes[..8], b"sector 0");
        assert_eq!(bytes.len(), 2048);
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let f = NamedTempFile::new().unwrap();
        let err = BackingStream::open(f.path()).await;
        assert!(err.is_err());
    }
}
