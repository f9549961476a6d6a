use super::SliceDescriptor;
use crate::error::ConfigError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Seeded random request offsets confined to one slice. Offsets are
/// multiples of the request size from the slice start, and a request at any
/// of them ends at or before the slice's random ceiling.
pub struct RandomOffsets {
    rng: ChaCha20Rng,
    start: u64,
    request_size: u64,
    slots: u64,
}

impl RandomOffsets {
    pub fn new(slice: &SliceDescriptor, request_size: u64, seed: u64) -> Result<Self, ConfigError> {
        if request_size == 0 {
            return Err(ConfigError::ZeroRequestSize);
        }
        let span = slice.random_ceiling - slice.start;
        if request_size > span {
            return Err(ConfigError::RequestExceedsSlice {
                request: request_size as usize,
                slice: span,
            });
        }

        // Mix the slice number in so workers sharing a seed diverge.
        let seed = seed ^ slice.number.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Ok(Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            start: slice.start,
            request_size,
            slots: span / request_size,
        })
    }

    pub fn next_offset(&mut self) -> u64 {
        self.start + self.rng.gen_range(0..self.slots) * self.request_size
    }
}

/// Endless; callers bound it with `take`.
impl Iterator for RandomOffsets {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.next_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::super::make_slices;
    use super::*;

    #[test]
    fn test_offsets_stay_inside_slice() {
        let slices = make_slices(1 << 20, 512, 4).unwrap();
        for slice in &slices {
            let offsets = RandomOffsets::new(slice, 4096, 7).unwrap();
            for offset in offsets.take(500) {
                assert!(slice.contains(offset, 4096));
                assert_eq!((offset - slice.start) % 4096, 0);
                assert!(offset + 4096 <= slice.random_ceiling);
            }
        }
    }

    #[test]
    fn test_same_seed_replays_sequence() {
        let slice = make_slices(1 << 16, 512, 1).unwrap()[0];
        let first: Vec<u64> = RandomOffsets::new(&slice, 512, 99)
            .unwrap()
            .take(20)
            .collect();
        let mut again = RandomOffsets::new(&slice, 512, 99).unwrap();
        let replay: Vec<u64> = (0..20).map(|_| again.next_offset()).collect();
        assert_eq!(first, replay);
    }

    #[test]
    fn test_request_larger_than_slice_fails() {
        let slice = make_slices(4096, 512, 2).unwrap()[0];
        assert!(matches!(
            RandomOffsets::new(&slice, 4096, 0),
            Err(ConfigError::RequestExceedsSlice { .. })
        ));
        assert!(matches!(
            RandomOffsets::new(&slice, 0, 0),
            Err(ConfigError::ZeroRequestSize)
        ));
    }
}
