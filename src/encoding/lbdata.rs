//! Addressed layouts: each full block carries its logical block address.
//!
//! Block layout after any prefix:
//!
//! ```text
//! +----------------+----------------+---------------------------+
//! | lba (4, BE)    | stamp (4, opt) | pattern or IOT words      |
//! +----------------+----------------+---------------------------+
//! ```
//!
//! With IOT the whole block body is a run of big-endian words
//! `lba + j * iot_seed`, so word 0 is the address itself and no bytes come
//! from the pattern stream.

use super::prefix::{check_pattern, check_prefix};
use super::{EncodingConfig, RequestInfo, ADDRESS_SIZE, STAMP_SIZE};
use crate::patterns::PatternBuffer;
use crate::verify::report::{MismatchKind, MismatchReport};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Byte `pos` of an IOT block body whose first word is `lba`.
fn iot_byte(lba: u64, seed: u32, pos: usize) -> u8 {
    let word = (lba as u32).wrapping_add(((pos / 4) as u32).wrapping_mul(seed));
    word.to_be_bytes()[pos % 4]
}

fn fill_iot(dst: &mut [u8], lba: u64, seed: u32, from: usize) {
    for (i, byte) in dst.iter_mut().enumerate() {
        *byte = iot_byte(lba, seed, from + i);
    }
}

fn compare_iot(data: &[u8], lba: u64, seed: u32, from: usize) -> Option<(usize, u8)> {
    data.iter().enumerate().find_map(|(i, &found)| {
        let expected = iot_byte(lba, seed, from + i);
        (found != expected).then_some((i, expected))
    })
}

fn stamp_now() -> [u8; STAMP_SIZE] {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    secs.to_be_bytes()
}

pub(crate) fn fill(config: &EncodingConfig, pattern: &mut PatternBuffer, buf: &mut [u8], lba: u64) {
    let block_size = config.lbdata_size;
    let prefix = config.prefix_bytes();
    let mut lba = lba;

    for chunk in buf.chunks_mut(block_size) {
        let full = chunk.len() == block_size;
        let n = prefix.len().min(chunk.len());
        chunk[..n].copy_from_slice(&prefix[..n]);
        let body = &mut chunk[n..];

        if !full {
            if config.iot {
                fill_iot(body, lba, config.iot_seed, 0);
            } else {
                pattern.fill(body);
            }
            break;
        }

        body[..ADDRESS_SIZE].copy_from_slice(&(lba as u32).to_be_bytes());
        let mut at = ADDRESS_SIZE;
        if config.timestamps {
            body[at..at + STAMP_SIZE].copy_from_slice(&stamp_now());
            at += STAMP_SIZE;
        }
        if config.iot {
            fill_iot(&mut body[at..], lba, config.iot_seed, at);
        } else {
            pattern.fill(&mut body[at..]);
        }
        lba += 1;
    }
}

pub(crate) fn compare(
    config: &EncodingConfig,
    pattern: &mut PatternBuffer,
    buf: &[u8],
    lba: u64,
    info: &RequestInfo,
) -> Option<MismatchReport> {
    // IOT data is fully determined by the address, so a whole-buffer compare
    // settles the common case. A timestamp breaks byte identity, so stamped
    // runs always take the block walk.
    if config.iot && !config.timestamps {
        let mut image = vec![0u8; buf.len()];
        fill(config, pattern, &mut image, lba);
        if image == buf {
            return None;
        }
        trace!(lba, len = buf.len(), "IOT fast compare failed, walking blocks");
    }
    walk(config, pattern, buf, lba, info)
}

fn walk(
    config: &EncodingConfig,
    pattern: &mut PatternBuffer,
    buf: &[u8],
    lba: u64,
    info: &RequestInfo,
) -> Option<MismatchReport> {
    let block_size = config.lbdata_size;
    let prefix = config.prefix_bytes();
    let count = buf.len();
    let mut lba = lba;

    for (index, chunk) in buf.chunks(block_size).enumerate() {
        let base = index * block_size;
        if let Some(report) = check_prefix(prefix, chunk, base, count, info) {
            return Some(report);
        }
        let n = prefix.len().min(chunk.len());
        let body = &chunk[n..];
        let body_base = base + n;

        if chunk.len() < block_size {
            return if config.iot {
                compare_iot(body, lba, config.iot_seed, 0).map(|(i, expected)| {
                    MismatchReport::new(
                        info,
                        count,
                        body_base + i,
                        expected,
                        body[i],
                        MismatchKind::Data,
                    )
                })
            } else {
                check_pattern(pattern, body, body_base, count, info)
            };
        }

        // A bad address is reported at the start of the field whichever of
        // its bytes differ.
        let expected_lba = (lba as u32).to_be_bytes();
        let address = &body[..ADDRESS_SIZE];
        if *address != expected_lba {
            let mut found = [0u8; ADDRESS_SIZE];
            found.copy_from_slice(address);
            return Some(MismatchReport::new(
                info,
                count,
                body_base,
                expected_lba[0],
                address[0],
                MismatchKind::BlockAddress {
                    expected: u32::from_be_bytes(expected_lba),
                    found: u32::from_be_bytes(found),
                },
            ));
        }

        let at = ADDRESS_SIZE + config.stamp_len();
        let data = &body[at..];
        let mismatch = if config.iot {
            compare_iot(data, lba, config.iot_seed, at).map(|(i, expected)| {
                MismatchReport::new(
                    info,
                    count,
                    body_base + at + i,
                    expected,
                    data[i],
                    MismatchKind::Data,
                )
            })
        } else {
            check_pattern(pattern, data, body_base + at, count, info)
        };
        if mismatch.is_some() {
            return mismatch;
        }
        lba += 1;
    }
    None
}
