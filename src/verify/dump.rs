//! Side-by-side hex dump of expected and found bytes around a mismatch.

use std::fmt::Write;
use std::ops::Range;

pub const DEFAULT_DUMP_LIMIT: usize = 64;
const BYTES_PER_LINE: usize = 16;

/// Picks the bytes to dump: at most `limit` bytes (and at most `count`),
/// centred on `offset` and shifted back inside the buffer when centring
/// would clip. Always contains `offset`.
pub fn dump_window(offset: usize, count: usize, limit: usize) -> Range<usize> {
    if count == 0 {
        return 0..0;
    }
    let offset = offset.min(count - 1);
    let size = limit.max(1).min(count);
    let mut start = offset.saturating_sub(size / 2);
    let mut end = start + size;
    if end > count {
        end = count;
        start = end - size;
    }
    start..end
}

/// Renders `expected` and `found` over the dump window as alternating
/// `expected:` / `found:` lines, with `*` in front of every differing byte
/// on the found line.
pub fn render(
    expected: &[u8],
    found: &[u8],
    offset: usize,
    limit: usize,
    file_offset: u64,
) -> String {
    let count = expected.len().min(found.len());
    let window = dump_window(offset, count, limit);
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Dumping {} bytes at buffer offset {} (file offset {}), mismatch at buffer offset {}:",
        window.len(),
        window.start,
        file_offset + window.start as u64,
        offset,
    );

    for line_start in window.clone().step_by(BYTES_PER_LINE) {
        let line_end = (line_start + BYTES_PER_LINE).min(window.end);
        let _ = write!(out, "{:08x} expected:", line_start);
        for &byte in &expected[line_start..line_end] {
            let _ = write!(out, " {:02x}", byte);
        }
        out.push('\n');

        let _ = write!(out, "{:08x} found:   ", line_start);
        for i in line_start..line_end {
            let marker = if expected[i] == found[i] { ' ' } else { '*' };
            let _ = write!(out, "{}{:02x}", marker, found[i]);
        }
        out.push('\n');
    }
    out
}
