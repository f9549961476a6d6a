//! Typed errors for configuration and slice construction.
//!
//! Data mismatches are not errors: they are reported through
//! [`crate::verify::Verdict`]. The types here cover faults that must stop a
//! run before any I/O is issued.

use thiserror::Error;

/// A configuration fault detected while building a pattern buffer, encoder
/// or workload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("pattern buffer would be empty")]
    EmptyPattern,

    #[error("numeric pattern width must be 1 to 4 bytes, got {0}")]
    PatternWidth(usize),

    #[error("numeric pattern 0x{value:x} does not fit in {width} byte(s)")]
    PatternOverflow { value: u32, width: usize },

    #[error("logical block size must be non-zero")]
    ZeroBlockSize,

    #[error("IOT blocks must be a multiple of 4 bytes, got {0}")]
    IotBlockSize(usize),

    #[error("block header of {header} bytes does not fit in a {block_size} byte block")]
    HeaderTooLarge { header: usize, block_size: usize },

    #[error("timestamps require lbdata or IOT addressing")]
    TimestampsWithoutAddressing,

    #[error("timestamps cannot be combined with block tags")]
    TimestampsWithTags,

    #[error("prefix cross-check requires block tags")]
    CrossCheckWithoutTags,

    #[error("prefix cross-check requires a prefix string")]
    CrossCheckWithoutPrefix,

    #[error("block tags enabled but no tag codec was supplied")]
    MissingTagCodec,

    #[error("tag codec reported a zero-sized tag")]
    ZeroTagSize,

    #[error("request size must be non-zero")]
    ZeroRequestSize,

    #[error("request size {request} is not a multiple of the device size {device}")]
    UnalignedRequest { request: usize, device: u64 },

    #[error(
        "logical block size {block_size} exceeds the request size {request}; \
         embedded addresses and tags would never be checked"
    )]
    BlockExceedsRequest { block_size: usize, request: usize },

    #[error("request size {request} exceeds the slice length {slice}")]
    RequestExceedsSlice { request: usize, slice: u64 },

    #[error("random access requires read-after-write mode")]
    RandomSplitPhase,

    #[error("unknown {field} value '{value}'")]
    UnknownValue { field: &'static str, value: String },
}

/// A failure to partition a data range into worker slices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SliceError {
    #[error("worker count must be non-zero")]
    ZeroWorkers,

    #[error("device size must be non-zero")]
    ZeroDeviceSize,

    #[error(
        "data range of {total_range} bytes is too small for {workers} workers \
         with a device size of {device_size} bytes"
    )]
    TooManyWorkers {
        total_range: u64,
        device_size: u64,
        workers: u64,
    },

    #[error("slice {number} is out of range for {count} slices")]
    SliceOutOfRange { number: u64, count: u64 },
}
