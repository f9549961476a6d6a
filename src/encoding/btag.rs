//! Tagged layout: every full block starts with a structured tag whose
//! correctness is decided by a [`TagCodec`].
//!
//! ```text
//! +-----------------+------------------+------------------------+
//! | tag (tag_size)  | prefix (opt)     | pattern data           |
//! +-----------------+------------------+------------------------+
//! ```
//!
//! The prefix after the tag is only compared when the prefix cross-check
//! is enabled, and only once the tag itself has verified.

use super::prefix::{check_pattern, check_prefix};
use super::{first_diff, EncodingConfig, RequestInfo};
use crate::patterns::PatternBuffer;
use crate::verify::report::{MismatchKind, MismatchReport};

/// Everything a codec needs to build the tag of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagContext {
    pub lba: u64,
    /// Byte offset of the block on the target.
    pub offset: u64,
    pub record: u64,
    pub pass: u32,
}

/// External block-tag codec. Tags are opaque byte blobs of `tag_size()`
/// bytes.
pub trait TagCodec: Send + Sync {
    fn tag_size(&self) -> usize;

    fn encode(&self, context: &TagContext) -> Vec<u8>;

    /// Returns the offset within the tag of the first bad byte.
    fn verify(&self, expected: &[u8], received: &[u8]) -> Result<(), usize>;
}

fn block_context(lba: u64, index: usize, block_size: usize, info: &RequestInfo) -> TagContext {
    TagContext {
        lba: lba + index as u64,
        offset: info.offset + (index * block_size) as u64,
        record: info.record,
        pass: info.pass,
    }
}

pub(crate) fn fill(
    codec: &dyn TagCodec,
    config: &EncodingConfig,
    pattern: &mut PatternBuffer,
    buf: &mut [u8],
    lba: u64,
    info: &RequestInfo,
) {
    let block_size = config.lbdata_size;
    let prefix = config.prefix_bytes();
    let tag_size = codec.tag_size();

    for (index, chunk) in buf.chunks_mut(block_size).enumerate() {
        let mut at = 0;
        if chunk.len() == block_size {
            let tag = codec.encode(&block_context(lba, index, block_size, info));
            chunk[..tag_size].copy_from_slice(&tag[..tag_size]);
            at = tag_size;
        }
        let n = prefix.len().min(chunk.len() - at);
        chunk[at..at + n].copy_from_slice(&prefix[..n]);
        pattern.fill(&mut chunk[at + n..]);
    }
}

pub(crate) fn compare(
    codec: &dyn TagCodec,
    config: &EncodingConfig,
    pattern: &mut PatternBuffer,
    buf: &[u8],
    lba: u64,
    info: &RequestInfo,
) -> Option<MismatchReport> {
    let block_size = config.lbdata_size;
    let prefix = config.prefix_bytes();
    let tag_size = codec.tag_size();
    let count = buf.len();

    for (index, chunk) in buf.chunks(block_size).enumerate() {
        let base = index * block_size;

        if chunk.len() < block_size {
            if let Some(report) = check_prefix(prefix, chunk, base, count, info) {
                return Some(report);
            }
            let n = prefix.len().min(chunk.len());
            return check_pattern(pattern, &chunk[n..], base + n, count, info);
        }

        let expected = codec.encode(&block_context(lba, index, block_size, info));
        let received = &chunk[..tag_size];
        if let Err(at) = codec.verify(&expected[..tag_size], received) {
            let at = at.min(tag_size - 1);
            return Some(MismatchReport::new(
                info,
                count,
                base + at,
                expected[at],
                received[at],
                MismatchKind::Tag,
            ));
        }

        let after_tag = &chunk[tag_size..];
        if config.prefix_cross_check {
            if let Some(report) = check_prefix(prefix, after_tag, base + tag_size, count, info) {
                return Some(report);
            }
        }

        let header = tag_size + prefix.len();
        if let Some(report) = check_pattern(pattern, &chunk[header..], base + header, count, info) {
            return Some(report);
        }
    }
    None
}

const TAG_MAGIC: u32 = 0x4454_4254;
const TAG_SIZE: usize = 32;
const CHECK_OFFSET: usize = 28;

/// Reference codec: magic, lba, byte offset, record, pass and a check word
/// taken from a BLAKE3 hash of the preceding fields. All integers are
/// big-endian.
///
/// ```text
/// 0      4          12         20       24     28      32
/// | magic | lba      | offset   | record | pass | check |
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicTagCodec;

impl BasicTagCodec {
    fn check_word(fields: &[u8]) -> [u8; 4] {
        let hash = blake3::hash(fields);
        let mut word = [0u8; 4];
        word.copy_from_slice(&hash.as_bytes()[..4]);
        word
    }

    /// True when the check word matches the tag's own fields.
    pub fn is_intact(tag: &[u8]) -> bool {
        tag.len() == TAG_SIZE
            && Self::check_word(&tag[..CHECK_OFFSET]) == tag[CHECK_OFFSET..]
    }
}

impl TagCodec for BasicTagCodec {
    fn tag_size(&self) -> usize {
        TAG_SIZE
    }

    fn encode(&self, context: &TagContext) -> Vec<u8> {
        let mut tag = Vec::with_capacity(TAG_SIZE);
        tag.extend_from_slice(&TAG_MAGIC.to_be_bytes());
        tag.extend_from_slice(&context.lba.to_be_bytes());
        tag.extend_from_slice(&context.offset.to_be_bytes());
        tag.extend_from_slice(&(context.record as u32).to_be_bytes());
        tag.extend_from_slice(&context.pass.to_be_bytes());
        let check = Self::check_word(&tag);
        tag.extend_from_slice(&check);
        tag
    }

    fn verify(&self, expected: &[u8], received: &[u8]) -> Result<(), usize> {
        match first_diff(received, expected) {
            Some(at) => Err(at),
            None if !Self::is_intact(received) => Err(CHECK_OFFSET),
            None => Ok(()),
        }
    }
}
