//! Prefixed layout: every block starts with a fixed string, the rest of
//! the block is pattern data.

use super::{first_diff, EncodingConfig, RequestInfo};
use crate::patterns::PatternBuffer;
use crate::verify::report::{MismatchKind, MismatchReport};

pub(crate) fn fill(config: &EncodingConfig, pattern: &mut PatternBuffer, buf: &mut [u8]) {
    let prefix = config.prefix_bytes();
    for chunk in buf.chunks_mut(config.lbdata_size) {
        let n = prefix.len().min(chunk.len());
        chunk[..n].copy_from_slice(&prefix[..n]);
        pattern.fill(&mut chunk[n..]);
    }
}

pub(crate) fn compare(
    config: &EncodingConfig,
    pattern: &mut PatternBuffer,
    buf: &[u8],
    info: &RequestInfo,
) -> Option<MismatchReport> {
    let block_size = config.lbdata_size;
    for (index, chunk) in buf.chunks(block_size).enumerate() {
        let base = index * block_size;
        if let Some(report) = check_prefix(config.prefix_bytes(), chunk, base, buf.len(), info) {
            return Some(report);
        }
        let n = config.prefix_bytes().len().min(chunk.len());
        if let Some(report) = check_pattern(pattern, &chunk[n..], base + n, buf.len(), info) {
            return Some(report);
        }
    }
    None
}

/// Compares the (possibly truncated) prefix at the start of `chunk`.
pub(crate) fn check_prefix(
    prefix: &[u8],
    chunk: &[u8],
    base: usize,
    count: usize,
    info: &RequestInfo,
) -> Option<MismatchReport> {
    let n = prefix.len().min(chunk.len());
    first_diff(&chunk[..n], &prefix[..n]).map(|i| {
        MismatchReport::new(
            info,
            count,
            base + i,
            prefix[i],
            chunk[i],
            MismatchKind::Prefix,
        )
    })
}

/// Compares pattern bytes located at `base` within the request.
pub(crate) fn check_pattern(
    pattern: &mut PatternBuffer,
    data: &[u8],
    base: usize,
    count: usize,
    info: &RequestInfo,
) -> Option<MismatchReport> {
    pattern.compare(data).map(|(i, expected)| {
        MismatchReport::new(info, count, base + i, expected, data[i], MismatchKind::Data)
    })
}

#[cfg(test)]
mod tests {
    use super::super::Encoder;
    use super::*;

    fn encoder() -> Encoder {
        Encoder::new(
            EncodingConfig {
                lbdata_size: 16,
                prefix: Some(b"HDR:".to_vec()),
                ..Default::default()
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_prefix_layout_and_cursor() {
        let encoder = encoder();
        let mut pattern = PatternBuffer::incrementing(256);
        let mut buf = vec![0u8; 40];
        encoder.fill(&mut pattern, &mut buf, &mut 0, &RequestInfo::default());

        assert_eq!(&buf[..4], b"HDR:");
        assert_eq!(&buf[4..16], &(0u8..12).collect::<Vec<_>>()[..]);
        assert_eq!(&buf[16..20], b"HDR:");
        // Pattern continues where the first block stopped.
        assert_eq!(buf[20], 12);
        // Tail block of 8 bytes: full prefix plus 4 pattern bytes.
        assert_eq!(&buf[32..36], b"HDR:");
        assert_eq!(&buf[36..40], &[24, 25, 26, 27]);
    }

    #[test]
    fn test_prefix_mismatch_is_classified() {
        let encoder = encoder();
        let mut writer = PatternBuffer::incrementing(256);
        let mut reader = writer.clone();
        let info = RequestInfo::default();

        let mut buf = vec![0u8; 32];
        encoder.fill(&mut writer, &mut buf, &mut 0, &info);
        buf[18] = b'X';

        let report = encoder.compare(&mut reader, &buf, &mut 0, &info).unwrap();
        assert_eq!(report.offset, 18);
        assert_eq!(report.kind, MismatchKind::Prefix);
        assert_eq!(report.expected, b'R');
    }

    #[test]
    fn test_data_mismatch_after_prefix() {
        let encoder = encoder();
        let mut writer = PatternBuffer::incrementing(256);
        let mut reader = writer.clone();
        let info = RequestInfo::default();

        let mut buf = vec![0u8; 32];
        encoder.fill(&mut writer, &mut buf, &mut 0, &info);
        buf[25] ^= 0x01;

        let report = encoder.compare(&mut reader, &buf, &mut 0, &info).unwrap();
        assert_eq!(report.offset, 25);
        assert_eq!(report.kind, MismatchKind::Data);
        assert_eq!(report.expected, 12 + 25 - 20);
    }
}
