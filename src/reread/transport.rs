//! Device and file access used for diagnostic re-reads.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// An open target.
pub trait TargetHandle: Send {
    /// Positional read. Returns the number of bytes read, which is only
    /// short at end of file.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn close(self: Box<Self>) -> Result<()>;
}

pub trait Transport: Send + Sync {
    fn open(&self, path: &Path, bypass_cache: bool) -> Result<Box<dyn TargetHandle>>;
}

/// Plain file and block device access. A cache-bypass open uses `O_DIRECT`
/// and reads through a buffer aligned to `alignment` bytes.
#[derive(Debug, Clone, Copy)]
pub struct FileTransport {
    alignment: usize,
}

impl FileTransport {
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1).next_power_of_two(),
        }
    }
}

impl Default for FileTransport {
    fn default() -> Self {
        Self::new(4096)
    }
}

struct FileHandle {
    file: File,
    direct: bool,
    alignment: usize,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn direct_flags() -> i32 {
    nix::fcntl::OFlag::O_DIRECT.bits()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn direct_flags() -> i32 {
    0
}

impl Transport for FileTransport {
    fn open(&self, path: &Path, bypass_cache: bool) -> Result<Box<dyn TargetHandle>> {
        use std::os::unix::fs::OpenOptionsExt;

        let mut options = OpenOptions::new();
        options.read(true);
        if bypass_cache {
            options.custom_flags(direct_flags());
        }
        let file = options.open(path).with_context(|| {
            format!(
                "Failed to reopen {} (direct: {})",
                path.display(),
                bypass_cache
            )
        })?;
        debug!(path = %path.display(), direct = bypass_cache, "target reopened");

        Ok(Box::new(FileHandle {
            file,
            direct: bypass_cache,
            alignment: self.alignment,
        }))
    }
}

fn read_full(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Read failed at offset {}", offset))
            }
        }
    }
    Ok(done)
}

impl TargetHandle for FileHandle {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.direct {
            return read_full(&self.file, buf, offset);
        }
        if offset % self.alignment as u64 != 0 || buf.len() % self.alignment != 0 {
            bail!(
                "direct read of {} bytes at offset {} is not {}-byte aligned",
                buf.len(),
                offset,
                self.alignment
            );
        }

        let mut raw = vec![0u8; buf.len() + self.alignment];
        let start = raw.as_ptr().align_offset(self.alignment);
        let aligned = &mut raw[start..start + buf.len()];
        let n = read_full(&self.file, aligned, offset)?;
        buf[..n].copy_from_slice(&aligned[..n]);
        Ok(n)
    }

    fn close(self: Box<Self>) -> Result<()> {
        drop(self.file);
        Ok(())
    }
}
