//! Partitioning of a data range into disjoint, device-aligned worker slices.
//!
//! A mismatch only means corruption if no two workers ever touch the same
//! bytes, so every slice is fixed at startup and never overlaps another.

pub mod random;

use crate::error::SliceError;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceDescriptor {
    /// 1-based slice number.
    pub number: u64,
    pub start: u64,
    pub length: u64,
    /// Exclusive upper bound for random offsets in this slice.
    pub random_ceiling: u64,
}

impl SliceDescriptor {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// True when `[offset, offset + len)` lies entirely inside the slice.
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset >= self.start && offset.saturating_add(len) <= self.end()
    }
}

fn round_down(value: u64, multiple: u64) -> u64 {
    value - value % multiple
}

/// Splits `total_range` bytes starting at 0 into `workers` slices.
pub fn make_slices(
    total_range: u64,
    device_size: u64,
    workers: u64,
) -> Result<Vec<SliceDescriptor>, SliceError> {
    make_slices_at(0, total_range, device_size, workers)
}

/// Splits `total_range` bytes starting at `origin` into `workers` slices of
/// equal device-aligned length, the aligned remainder going to the last
/// slice.
pub fn make_slices_at(
    origin: u64,
    total_range: u64,
    device_size: u64,
    workers: u64,
) -> Result<Vec<SliceDescriptor>, SliceError> {
    if workers == 0 {
        return Err(SliceError::ZeroWorkers);
    }
    if device_size == 0 {
        return Err(SliceError::ZeroDeviceSize);
    }

    let base_length = round_down(total_range / workers, device_size);
    if base_length < device_size {
        return Err(SliceError::TooManyWorkers {
            total_range,
            device_size,
            workers,
        });
    }
    let residual = round_down(total_range - base_length * workers, device_size);

    let mut slices = Vec::with_capacity(workers as usize);
    let mut start = origin;
    for number in 1..=workers {
        let length = if number == workers {
            base_length + residual
        } else {
            base_length
        };
        slices.push(SliceDescriptor {
            number,
            start,
            length,
            random_ceiling: start + length,
        });
        start += length;
    }

    debug!(
        total_range,
        device_size,
        workers,
        base_length,
        residual,
        "data range partitioned"
    );
    Ok(slices)
}

/// Derives slice `number` (1-based) of `workers` on its own, as a single
/// worker does when it is not part of a multi-worker run.
pub fn slice_for(
    total_range: u64,
    device_size: u64,
    workers: u64,
    number: u64,
) -> Result<SliceDescriptor, SliceError> {
    if number == 0 || number > workers {
        return Err(SliceError::SliceOutOfRange {
            number,
            count: workers,
        });
    }
    let slices = make_slices(total_range, device_size, workers)?;
    Ok(slices[(number - 1) as usize])
}
