pub mod detector;

pub use detector::{detect_device_size, probe_target};

pub const DEFAULT_SECTOR_SIZE: u64 = 512;
pub const DEFAULT_FILE_DEVICE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    RegularFile,
    BlockDevice,
    /// Character devices, pipes and anything else without a usable
    /// cache-bypass path.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetGeometry {
    pub kind: TargetKind,
    /// Logical block size: the alignment needed for direct I/O and the
    /// default device size for slicing.
    pub block_size: u64,
    /// Size in bytes, 0 when unknown.
    pub capacity: u64,
}

impl TargetGeometry {
    pub fn supports_direct_io(&self) -> bool {
        matches!(self.kind, TargetKind::RegularFile | TargetKind::BlockDevice)
    }
}
