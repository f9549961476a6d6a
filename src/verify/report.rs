use crate::encoding::RequestInfo;
use std::fmt;

/// What part of the block layout the first differing byte belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// Pattern bytes.
    Data,
    /// The fixed prefix string at the start of a block.
    Prefix,
    /// The embedded logical block address.
    BlockAddress { expected: u32, found: u32 },
    /// The structured block tag.
    Tag,
}

impl MismatchKind {
    pub fn name(&self) -> &'static str {
        match self {
            MismatchKind::Data => "data",
            MismatchKind::Prefix => "prefix",
            MismatchKind::BlockAddress { .. } => "block address",
            MismatchKind::Tag => "block tag",
        }
    }
}

/// The first mismatch found in one compare call. Never mutated once the
/// compare that produced it has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchReport {
    /// Byte offset of the first differing byte within the request.
    pub offset: usize,
    /// Size of the request in bytes.
    pub count: usize,
    pub expected: u8,
    pub found: u8,
    pub kind: MismatchKind,
    /// Absolute offset of the first differing byte on the target.
    pub file_offset: u64,
    pub record: u64,
    pub pass: u32,
    pub read_after_write: bool,
}

impl MismatchReport {
    pub(crate) fn new(
        info: &RequestInfo,
        count: usize,
        offset: usize,
        expected: u8,
        found: u8,
        kind: MismatchKind,
    ) -> Self {
        Self {
            offset,
            count,
            expected,
            found,
            kind,
            file_offset: info.offset + offset as u64,
            record: info.record,
            pass: info.pass,
            read_after_write: false,
        }
    }

    /// Start of the request on the target.
    pub fn request_offset(&self) -> u64 {
        self.file_offset - self.offset as u64
    }
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} compare error at byte {} of {} (file offset {}, record {}, pass {}): \
             expected 0x{:02x}, found 0x{:02x}",
            self.kind.name(),
            self.offset,
            self.count,
            self.file_offset,
            self.record,
            self.pass,
            self.expected,
            self.found,
        )?;
        if let MismatchKind::BlockAddress { expected, found } = self.kind {
            write!(f, "; expected lba {}, found lba {}", expected, found)?;
        }
        if self.read_after_write {
            write!(f, " [read-after-write]")?;
        }
        Ok(())
    }
}
