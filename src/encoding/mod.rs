//! Per-block byte layouts applied on top of the pattern stream.
//!
//! Exactly one [`Strategy`] is active for a worker, selected in priority
//! order: tagged, addressed (lbdata or IOT), prefixed, normal. Blocks are
//! `lbdata_size` bytes counted from the start of each request; a trailing
//! block shorter than that carries no address or tag and is compared byte
//! for byte.
//!
//! Only bytes drawn from the pattern stream advance the pattern cursor.
//! Prefix, address, timestamp and tag bytes never do.

pub mod btag;
pub mod lbdata;
pub mod prefix;

use crate::error::ConfigError;
use crate::patterns::PatternBuffer;
use crate::verify::report::{MismatchKind, MismatchReport};
use btag::TagCodec;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Size of the embedded block address.
pub const ADDRESS_SIZE: usize = 4;
/// Size of the optional timestamp following the block address.
pub const STAMP_SIZE: usize = 4;
pub const DEFAULT_LBDATA_SIZE: usize = 512;
pub const DEFAULT_IOT_SEED: u32 = 0x0101_0101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Tagged,
    Addressed { iot: bool },
    Prefixed,
    Normal,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Tagged => write!(f, "btag"),
            Strategy::Addressed { iot: true } => write!(f, "iot"),
            Strategy::Addressed { iot: false } => write!(f, "lbdata"),
            Strategy::Prefixed => write!(f, "prefix"),
            Strategy::Normal => write!(f, "normal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingConfig {
    pub lbdata_size: usize,
    pub prefix: Option<Vec<u8>>,
    pub lbdata: bool,
    pub iot: bool,
    pub iot_seed: u32,
    pub tagged: bool,
    pub timestamps: bool,
    /// Also check the prefix string that follows each block tag.
    pub prefix_cross_check: bool,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            lbdata_size: DEFAULT_LBDATA_SIZE,
            prefix: None,
            lbdata: false,
            iot: false,
            iot_seed: DEFAULT_IOT_SEED,
            tagged: false,
            timestamps: false,
            prefix_cross_check: false,
        }
    }
}

impl EncodingConfig {
    pub fn strategy(&self) -> Strategy {
        if self.tagged {
            Strategy::Tagged
        } else if self.iot || self.lbdata {
            Strategy::Addressed { iot: self.iot }
        } else if self.prefix.is_some() {
            Strategy::Prefixed
        } else {
            Strategy::Normal
        }
    }

    pub fn prefix_bytes(&self) -> &[u8] {
        self.prefix.as_deref().unwrap_or(&[])
    }

    pub(crate) fn stamp_len(&self) -> usize {
        if self.timestamps {
            STAMP_SIZE
        } else {
            0
        }
    }
}

/// Where a request sits in the run, handed to the tag codec and copied into
/// mismatch reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Byte offset of the request on the target.
    pub offset: u64,
    pub record: u64,
    pub pass: u32,
}

/// Block number implied by a byte offset.
pub fn lba_for_offset(offset: u64, lbdata_size: usize) -> u64 {
    offset / lbdata_size as u64
}

#[derive(Clone)]
enum Layout {
    Normal,
    Prefixed,
    Addressed,
    Tagged(Arc<dyn TagCodec>),
}

/// A validated encoding, able to fill write buffers and compare read
/// buffers. Cheap to clone.
#[derive(Clone)]
pub struct Encoder {
    config: EncodingConfig,
    layout: Layout,
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoder")
            .field("strategy", &self.strategy())
            .field("config", &self.config)
            .finish()
    }
}

impl Encoder {
    pub fn new(
        mut config: EncodingConfig,
        codec: Option<Arc<dyn TagCodec>>,
    ) -> Result<Self, ConfigError> {
        if config.prefix.as_ref().is_some_and(|p| p.is_empty()) {
            config.prefix = None;
        }
        let block_size = config.lbdata_size;
        if block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if config.timestamps && config.tagged {
            return Err(ConfigError::TimestampsWithTags);
        }
        if config.timestamps && !(config.lbdata || config.iot) {
            return Err(ConfigError::TimestampsWithoutAddressing);
        }
        if config.prefix_cross_check {
            if !config.tagged {
                return Err(ConfigError::CrossCheckWithoutTags);
            }
            if config.prefix.is_none() {
                return Err(ConfigError::CrossCheckWithoutPrefix);
            }
        }

        let prefix_len = config.prefix_bytes().len();
        let (layout, header) = match config.strategy() {
            Strategy::Tagged => {
                let codec = codec.ok_or(ConfigError::MissingTagCodec)?;
                let tag_size = codec.tag_size();
                if tag_size == 0 {
                    return Err(ConfigError::ZeroTagSize);
                }
                (Layout::Tagged(codec), tag_size + prefix_len)
            }
            Strategy::Addressed { iot } => {
                if iot && block_size % 4 != 0 {
                    return Err(ConfigError::IotBlockSize(block_size));
                }
                (
                    Layout::Addressed,
                    prefix_len + ADDRESS_SIZE + config.stamp_len(),
                )
            }
            Strategy::Prefixed => (Layout::Prefixed, prefix_len),
            Strategy::Normal => (Layout::Normal, 0),
        };
        if header > block_size {
            return Err(ConfigError::HeaderTooLarge { header, block_size });
        }

        Ok(Self { config, layout })
    }

    pub fn config(&self) -> &EncodingConfig {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.config.strategy()
    }

    pub fn lbdata_size(&self) -> usize {
        self.config.lbdata_size
    }

    /// Bytes at the start of every full block that are not pattern bytes.
    fn header_len(&self) -> usize {
        let prefix_len = self.config.prefix_bytes().len();
        match &self.layout {
            Layout::Normal => 0,
            Layout::Prefixed => prefix_len,
            Layout::Addressed => prefix_len + ADDRESS_SIZE + self.config.stamp_len(),
            Layout::Tagged(codec) => codec.tag_size() + prefix_len,
        }
    }

    /// Number of pattern-stream bytes a request of `len` bytes consumes.
    pub fn pattern_consumption(&self, len: usize) -> usize {
        let block_size = self.config.lbdata_size;
        let prefix_len = self.config.prefix_bytes().len();
        match self.strategy() {
            Strategy::Normal => len,
            Strategy::Addressed { iot: true } => 0,
            _ => (0..len)
                .step_by(block_size)
                .map(|start| {
                    let chunk = (len - start).min(block_size);
                    if chunk == block_size {
                        chunk - self.header_len()
                    } else {
                        chunk - prefix_len.min(chunk)
                    }
                })
                .sum(),
        }
    }

    /// Fills a write buffer. Advances the pattern cursor and `lba` past the
    /// request.
    pub fn fill(
        &self,
        pattern: &mut PatternBuffer,
        buf: &mut [u8],
        lba: &mut u64,
        info: &RequestInfo,
    ) {
        match &self.layout {
            Layout::Normal => pattern.fill(buf),
            Layout::Prefixed => prefix::fill(&self.config, pattern, buf),
            Layout::Addressed => lbdata::fill(&self.config, pattern, buf, *lba),
            Layout::Tagged(codec) => {
                btag::fill(codec.as_ref(), &self.config, pattern, buf, *lba, info)
            }
        }
        *lba += (buf.len() / self.config.lbdata_size) as u64;
    }

    /// Compares a read buffer and returns the first mismatch. The pattern
    /// cursor and `lba` advance past the request whatever the outcome, so
    /// the next request continues the stream.
    pub fn compare(
        &self,
        pattern: &mut PatternBuffer,
        buf: &[u8],
        lba: &mut u64,
        info: &RequestInfo,
    ) -> Option<MismatchReport> {
        let start = pattern.checkpoint();
        let result = match &self.layout {
            Layout::Normal => pattern.compare(buf).map(|(offset, expected)| {
                MismatchReport::new(
                    info,
                    buf.len(),
                    offset,
                    expected,
                    buf[offset],
                    MismatchKind::Data,
                )
            }),
            Layout::Prefixed => prefix::compare(&self.config, pattern, buf, info),
            Layout::Addressed => lbdata::compare(&self.config, pattern, buf, *lba, info),
            Layout::Tagged(codec) => {
                btag::compare(codec.as_ref(), &self.config, pattern, buf, *lba, info)
            }
        };
        pattern.restore(start);
        pattern.skip(self.pattern_consumption(buf.len()));
        *lba += (buf.len() / self.config.lbdata_size) as u64;
        result
    }

    /// Byte ranges of a request excluded from comparison.
    pub fn unchecked_ranges(&self, len: usize) -> Vec<Range<usize>> {
        let block_size = self.config.lbdata_size;
        let prefix_len = self.config.prefix_bytes().len();
        let slot = match &self.layout {
            Layout::Addressed if self.config.timestamps => {
                Some((prefix_len + ADDRESS_SIZE, STAMP_SIZE))
            }
            Layout::Tagged(codec) if !self.config.prefix_cross_check && prefix_len > 0 => {
                Some((codec.tag_size(), prefix_len))
            }
            _ => None,
        };
        let Some((at, size)) = slot else {
            return Vec::new();
        };
        (0..len / block_size)
            .map(|block| {
                let base = block * block_size + at;
                base..base + size
            })
            .collect()
    }

    /// Renders what a request should have contained, given the pattern
    /// cursor and `lba` it started at. Unchecked bytes are copied from
    /// `received` so they never show up as differences.
    pub fn expected_image(
        &self,
        pattern: &PatternBuffer,
        received: &[u8],
        lba: u64,
        info: &RequestInfo,
    ) -> Vec<u8> {
        let mut scratch = pattern.clone();
        let mut image = vec![0u8; received.len()];
        let mut lba = lba;
        self.fill(&mut scratch, &mut image, &mut lba, info);
        for range in self.unchecked_ranges(received.len()) {
            image[range.clone()].copy_from_slice(&received[range]);
        }
        image
    }
}

/// Index of the first byte where `found` differs from `expected`.
pub(crate) fn first_diff(found: &[u8], expected: &[u8]) -> Option<usize> {
    found.iter().zip(expected).position(|(a, b)| a != b)
}

#[cfg(test)]
mod tests {
    use super::btag::BasicTagCodec;
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::{
        any, prop_assert, prop_assert_eq, prop_assume, proptest, ProptestConfig,
    };
    use proptest::sample::Index;

    fn pattern() -> PatternBuffer {
        PatternBuffer::from_numeric(0xDEAD_BEEF, 4, 16).unwrap()
    }

    #[test]
    fn test_strategy_priority() {
        let mut config = EncodingConfig {
            prefix: Some(b"pfx".to_vec()),
            ..Default::default()
        };
        assert_eq!(config.strategy(), Strategy::Prefixed);
        config.lbdata = true;
        assert_eq!(config.strategy(), Strategy::Addressed { iot: false });
        config.iot = true;
        assert_eq!(config.strategy(), Strategy::Addressed { iot: true });
        config.tagged = true;
        assert_eq!(config.strategy(), Strategy::Tagged);
    }

    #[test]
    fn test_conflicting_flags_fail_fast() {
        let stamps_alone = EncodingConfig {
            timestamps: true,
            ..Default::default()
        };
        assert_eq!(
            Encoder::new(stamps_alone, None).unwrap_err(),
            ConfigError::TimestampsWithoutAddressing
        );

        let tagged_without_codec = EncodingConfig {
            tagged: true,
            ..Default::default()
        };
        assert_eq!(
            Encoder::new(tagged_without_codec, None).unwrap_err(),
            ConfigError::MissingTagCodec
        );

        let cross_check_without_prefix = EncodingConfig {
            tagged: true,
            prefix_cross_check: true,
            ..Default::default()
        };
        assert_eq!(
            Encoder::new(
                cross_check_without_prefix,
                Some(Arc::new(BasicTagCodec::default()))
            )
            .unwrap_err(),
            ConfigError::CrossCheckWithoutPrefix
        );

        let odd_iot = EncodingConfig {
            iot: true,
            lbdata_size: 510,
            ..Default::default()
        };
        assert_eq!(
            Encoder::new(odd_iot, None).unwrap_err(),
            ConfigError::IotBlockSize(510)
        );

        let big_prefix = EncodingConfig {
            lbdata: true,
            lbdata_size: 8,
            prefix: Some(b"12345".to_vec()),
            ..Default::default()
        };
        assert_eq!(
            Encoder::new(big_prefix, None).unwrap_err(),
            ConfigError::HeaderTooLarge {
                header: 9,
                block_size: 8
            }
        );
    }

    #[test]
    fn test_normal_round_trip_mid_pattern() {
        let encoder = Encoder::new(EncodingConfig::default(), None).unwrap();
        let mut writer = pattern();
        writer.skip(6);
        let mut reader = writer.clone();

        let info = RequestInfo::default();
        let mut buf = vec![0u8; 20];
        let mut lba = 0;
        encoder.fill(&mut writer, &mut buf, &mut lba, &info);

        let mut read_lba = 0;
        assert_eq!(encoder.compare(&mut reader, &buf, &mut read_lba, &info), None);
    }

    #[test]
    fn test_normal_flipped_byte_reports_exact_offset() {
        let encoder = Encoder::new(EncodingConfig::default(), None).unwrap();
        let mut writer = pattern();
        writer.skip(6);
        let mut reader = writer.clone();

        let info = RequestInfo::default();
        let mut buf = vec![0u8; 20];
        let mut lba = 0;
        encoder.fill(&mut writer, &mut buf, &mut lba, &info);
        let expected = buf[7];
        buf[7] ^= 0xff;

        let report = encoder
            .compare(&mut reader, &buf, &mut 0, &info)
            .expect("corruption must be reported");
        assert_eq!(report.offset, 7);
        assert_eq!(report.count, 20);
        assert_eq!(report.expected, expected);
        assert_eq!(report.found, expected ^ 0xff);
        assert_eq!(report.kind, MismatchKind::Data);
        // Cursor still advanced by the whole request.
        assert_eq!(reader.checkpoint(), writer.checkpoint());
    }

    #[test]
    fn test_pattern_consumption_skips_headers() {
        let encoder = Encoder::new(
            EncodingConfig {
                lbdata: true,
                lbdata_size: 16,
                prefix: Some(b"ab".to_vec()),
                timestamps: true,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        // Two full blocks of 16 - (2 + 4 + 4) and a 5 byte tail minus prefix.
        assert_eq!(encoder.pattern_consumption(37), 6 + 6 + 3);
        assert_eq!(encoder.unchecked_ranges(37), vec![6..10, 22..26]);
    }

    #[test]
    fn test_expected_image_matches_fill() {
        let encoder = Encoder::new(
            EncodingConfig {
                lbdata: true,
                lbdata_size: 32,
                prefix: Some(b"XY".to_vec()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let info = RequestInfo {
            offset: 320,
            ..Default::default()
        };
        let start = pattern();
        let mut writer = start.clone();
        let mut buf = vec![0u8; 80];
        let mut lba = 10;
        encoder.fill(&mut writer, &mut buf, &mut lba, &info);
        assert_eq!(lba, 12);

        assert_eq!(encoder.expected_image(&start, &buf, 10, &info), buf);
    }

    #[test]
    fn test_lba_for_offset() {
        assert_eq!(lba_for_offset(5120, 512), 10);
        assert_eq!(lba_for_offset(5119, 512), 9);
    }

    /// One encoder per strategy: 0 normal, 1 prefixed, 2 lbdata, 3 IOT,
    /// 4 tagged. The block size is the smallest multiple of 4 holding the
    /// header plus `extra_words` words.
    fn layout(
        kind: u8,
        prefix: Vec<u8>,
        timestamps: bool,
        cross_check: bool,
        extra_words: usize,
    ) -> Encoder {
        let has_prefix = !prefix.is_empty();
        let prefix_len = prefix.len();
        let mut config = EncodingConfig {
            prefix: Some(prefix),
            ..Default::default()
        };
        let mut codec: Option<Arc<dyn TagCodec>> = None;
        let header = match kind {
            0 => {
                config.prefix = None;
                0
            }
            1 => prefix_len,
            2 | 3 => {
                config.lbdata = kind == 2;
                config.iot = kind == 3;
                config.timestamps = timestamps;
                prefix_len + ADDRESS_SIZE + config.stamp_len()
            }
            _ => {
                config.tagged = true;
                config.prefix_cross_check = cross_check && has_prefix;
                let tag = BasicTagCodec;
                let size = tag.tag_size();
                codec = Some(Arc::new(tag));
                size + prefix_len
            }
        };
        config.lbdata_size = header.div_ceil(4).max(1) * 4 + extra_words * 4;
        Encoder::new(config, codec).unwrap()
    }

    /// Where a single bad byte at `k` must be reported: the byte itself,
    /// or the start of the address field when `k` falls inside one.
    fn reported_offset(encoder: &Encoder, len: usize, k: usize) -> usize {
        let block_size = encoder.lbdata_size();
        let full = len / block_size * block_size;
        if matches!(encoder.strategy(), Strategy::Addressed { .. }) && k < full {
            let field = k / block_size * block_size + encoder.config().prefix_bytes().len();
            if (field..field + ADDRESS_SIZE).contains(&k) {
                return field;
            }
        }
        k
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn compare_accepts_fill_for_every_layout(
            kind in 0u8..5,
            prefix in vec(any::<u8>(), 0..6),
            timestamps in any::<bool>(),
            cross_check in any::<bool>(),
            extra_words in 0usize..24,
            source in vec(any::<u8>(), 1..40),
            skip in 0usize..64,
            start_lba in 0u64..1_000_000,
            blocks in 0usize..4,
            tail in 0usize..128,
        ) {
            let encoder = layout(kind, prefix, timestamps, cross_check, extra_words);
            let block_size = encoder.lbdata_size();
            let len = blocks * block_size + tail % block_size;
            prop_assume!(len > 0);

            let mut writer = PatternBuffer::from_bytes(source).unwrap();
            writer.skip(skip);
            let mut reader = writer.clone();
            let info = RequestInfo {
                offset: start_lba * block_size as u64,
                record: 3,
                pass: 1,
            };

            let mut buf = vec![0u8; len];
            let mut write_lba = start_lba;
            encoder.fill(&mut writer, &mut buf, &mut write_lba, &info);

            let mut read_lba = start_lba;
            prop_assert_eq!(
                encoder.compare(&mut reader, &buf, &mut read_lba, &info),
                None
            );
            prop_assert_eq!(read_lba, write_lba);
            prop_assert_eq!(read_lba, start_lba + blocks as u64);
            prop_assert_eq!(reader.checkpoint(), writer.checkpoint());
        }

        #[test]
        fn single_flipped_byte_is_localized(
            kind in 0u8..5,
            prefix in vec(any::<u8>(), 0..6),
            timestamps in any::<bool>(),
            cross_check in any::<bool>(),
            extra_words in 0usize..24,
            source in vec(any::<u8>(), 1..40),
            skip in 0usize..64,
            start_lba in 0u64..1_000_000,
            blocks in 0usize..4,
            tail in 0usize..128,
            at in any::<Index>(),
            mask in 1u8..=255,
        ) {
            let encoder = layout(kind, prefix, timestamps, cross_check, extra_words);
            let block_size = encoder.lbdata_size();
            let len = blocks * block_size + tail % block_size;
            prop_assume!(len > 0);
            let k = at.index(len);
            prop_assume!(!encoder
                .unchecked_ranges(len)
                .iter()
                .any(|range| range.contains(&k)));

            let mut writer = PatternBuffer::from_bytes(source).unwrap();
            writer.skip(skip);
            let mut reader = writer.clone();
            let info = RequestInfo {
                offset: start_lba * block_size as u64,
                ..Default::default()
            };

            let mut buf = vec![0u8; len];
            let mut write_lba = start_lba;
            encoder.fill(&mut writer, &mut buf, &mut write_lba, &info);
            buf[k] ^= mask;

            let mut read_lba = start_lba;
            let report = encoder.compare(&mut reader, &buf, &mut read_lba, &info);
            prop_assert!(report.is_some());
            let report = report.unwrap();
            prop_assert_eq!(report.offset, reported_offset(&encoder, len, k));
            prop_assert_eq!(report.count, len);
            prop_assert_eq!(read_lba, start_lba + blocks as u64);
            prop_assert_eq!(reader.checkpoint(), writer.checkpoint());
        }
    }
}
