use super::{TargetGeometry, TargetKind, DEFAULT_FILE_DEVICE_SIZE, DEFAULT_SECTOR_SIZE};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

pub fn probe_target(path: &Path) -> Result<TargetGeometry> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to get metadata for {}", path.display()))?;
    let file_type = metadata.file_type();

    if file_type.is_block_device() {
        let rdev = metadata.rdev();
        let (major, minor) = (
            nix::sys::stat::major(rdev),
            nix::sys::stat::minor(rdev),
        );
        let block_size = logical_block_size(major, minor).unwrap_or(DEFAULT_SECTOR_SIZE);
        let capacity = device_capacity(path).unwrap_or(0);
        return Ok(TargetGeometry {
            kind: TargetKind::BlockDevice,
            block_size,
            capacity,
        });
    }

    if file_type.is_file() {
        let block_size = match metadata.blksize() {
            0 => DEFAULT_SECTOR_SIZE,
            size => size,
        };
        return Ok(TargetGeometry {
            kind: TargetKind::RegularFile,
            block_size,
            capacity: metadata.len(),
        });
    }

    Ok(TargetGeometry {
        kind: TargetKind::Other,
        block_size: DEFAULT_SECTOR_SIZE,
        capacity: 0,
    })
}

/// Default slice alignment for a target: the logical block size of a block
/// device, otherwise a page.
pub fn detect_device_size(path: &Path) -> Result<u64> {
    let geometry = probe_target(path)?;
    Ok(match geometry.kind {
        TargetKind::BlockDevice => geometry.block_size,
        _ => DEFAULT_FILE_DEVICE_SIZE,
    })
}

/// Partitions have no queue directory of their own, so fall back to the
/// parent disk's.
fn logical_block_size(major: u64, minor: u64) -> Option<u64> {
    let base = format!("/sys/dev/block/{}:{}", major, minor);
    read_sys_value(&format!("{}/queue/logical_block_size", base))
        .or_else(|| read_sys_value(&format!("{}/../queue/logical_block_size", base)))
}

fn device_capacity(path: &Path) -> Option<u64> {
    let mut file = File::open(path).ok()?;
    file.seek(SeekFrom::End(0)).ok()
}

fn read_sys_value(path: &str) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_regular_file_geometry() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(&[0u8; 3000])?;
        file.flush()?;

        let geometry = probe_target(file.path())?;
        assert_eq!(geometry.kind, TargetKind::RegularFile);
        assert_eq!(geometry.capacity, 3000);
        assert!(geometry.block_size.is_power_of_two());
        assert!(geometry.supports_direct_io());
        Ok(())
    }

    #[test]
    fn test_character_device_geometry() -> Result<()> {
        let geometry = probe_target(Path::new("/dev/null"))?;
        assert_eq!(geometry.kind, TargetKind::Other);
        assert!(!geometry.supports_direct_io());
        Ok(())
    }

    #[test]
    fn test_device_size_for_file() -> Result<()> {
        let file = NamedTempFile::new()?;
        assert_eq!(detect_device_size(file.path())?, DEFAULT_FILE_DEVICE_SIZE);
        Ok(())
    }

    #[test]
    fn test_missing_target() {
        assert!(probe_target(Path::new("/nonexistent/dtverify")).is_err());
    }
}
