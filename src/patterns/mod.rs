//! Circular reference-pattern buffer.
//!
//! Every write buffer is filled from a [`PatternBuffer`] and every read
//! buffer is compared against one. The buffer owns its cursor, so a
//! sequence of requests reproduces one continuous pattern stream.

use crate::error::ConfigError;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Where the reference bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSource {
    /// A 1 to 4 byte number, stored in host byte order.
    Numeric { value: u32, width: usize },
    /// The bytes of a user string.
    Text(String),
    /// The contents of a file.
    File(PathBuf),
    /// 0x00, 0x01, ... 0xFF, 0x00, ...
    Incrementing,
}

impl Default for PatternSource {
    fn default() -> Self {
        PatternSource::Numeric {
            value: 0x3902_7654,
            width: 4,
        }
    }
}

impl PatternSource {
    pub fn name(&self) -> String {
        match self {
            PatternSource::Numeric { value, width } => {
                format!("0x{:0w$x}", value, w = width * 2)
            }
            PatternSource::Text(text) => format!("'{}'", text),
            PatternSource::File(path) => path.display().to_string(),
            PatternSource::Incrementing => "incr".to_string(),
        }
    }
}

/// Reads up to the first 4 bytes of `data` as one host-order integer of
/// that width.
fn host_scalar(data: &[u8]) -> u32 {
    let n = data.len().min(4);
    let mut word = [0u8; 4];
    if cfg!(target_endian = "little") {
        word[..n].copy_from_slice(&data[..n]);
    } else {
        word[4 - n..].copy_from_slice(&data[..n]);
    }
    u32::from_ne_bytes(word)
}

/// Saved cursor position, used to replay a request's expected bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternCursor(usize);

#[derive(Debug, Clone)]
pub struct PatternBuffer {
    data: Vec<u8>,
    cursor: usize,
    pattern: u32,
}

impl PatternBuffer {
    /// Builds a buffer of `bufsize` bytes (or `width` if zero) repeating a
    /// numeric pattern.
    pub fn from_numeric(value: u32, width: usize, bufsize: usize) -> Result<Self, ConfigError> {
        if !(1..=4).contains(&width) {
            return Err(ConfigError::PatternWidth(width));
        }
        if width < 4 && value >> (width * 8) != 0 {
            return Err(ConfigError::PatternOverflow { value, width });
        }

        let bytes = value.to_ne_bytes();
        let bytes = if cfg!(target_endian = "little") {
            &bytes[..width]
        } else {
            &bytes[4 - width..]
        };
        let len = if bufsize == 0 { width } else { bufsize };
        let data = bytes.iter().copied().cycle().take(len).collect();
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ConfigError> {
        if data.is_empty() {
            return Err(ConfigError::EmptyPattern);
        }
        let pattern = host_scalar(&data);

        Ok(Self {
            data,
            cursor: 0,
            pattern,
        })
    }

    pub fn from_text(text: &str) -> Result<Self, ConfigError> {
        Self::from_bytes(text.as_bytes().to_vec())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("Failed to read pattern file: {}", path.display()))?;
        Self::from_bytes(data)
            .with_context(|| format!("Invalid pattern file: {}", path.display()))
    }

    /// Builds an incrementing byte pattern of `bufsize` bytes (256 if zero).
    pub fn incrementing(bufsize: usize) -> Self {
        let len = if bufsize == 0 { 256 } else { bufsize };
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let pattern = host_scalar(&data);
        Self {
            data,
            cursor: 0,
            pattern,
        }
    }

    /// `bufsize` only applies to numeric and incrementing sources; text and
    /// file patterns keep their natural length.
    pub fn from_source(source: &PatternSource, bufsize: usize) -> Result<Self> {
        match source {
            PatternSource::Numeric { value, width } => {
                Ok(Self::from_numeric(*value, *width, bufsize)?)
            }
            PatternSource::Text(text) => Ok(Self::from_text(text)?),
            PatternSource::File(path) => Self::from_file(path),
            PatternSource::Incrementing => Ok(Self::incrementing(bufsize)),
        }
    }

    /// The first 1 to 4 bytes of the buffer read as a host-order integer,
    /// for logging.
    pub fn pattern(&self) -> u32 {
        self.pattern
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn checkpoint(&self) -> PatternCursor {
        PatternCursor(self.cursor)
    }

    pub fn restore(&mut self, cursor: PatternCursor) {
        self.cursor = cursor.0 % self.data.len();
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Byte `rel` positions past the cursor, without moving it.
    pub fn peek(&self, rel: usize) -> u8 {
        self.data[(self.cursor + rel % self.data.len()) % self.data.len()]
    }

    pub fn skip(&mut self, n: usize) {
        self.cursor = (self.cursor + n % self.data.len()) % self.data.len();
    }

    /// Copies `dst.len()` bytes from the cursor, wrapping as needed.
    pub fn fill(&mut self, dst: &mut [u8]) {
        let mut done = 0;
        while done < dst.len() {
            let avail = self.data.len() - self.cursor;
            let n = avail.min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&self.data[self.cursor..self.cursor + n]);
            done += n;
            self.skip(n);
        }
    }

    /// Compares `src` against the stream at the cursor and returns the index
    /// of the first differing byte with the byte that was expected there.
    /// The cursor always advances by `src.len()` so the next request
    /// continues the stream.
    pub fn compare(&mut self, src: &[u8]) -> Option<(usize, u8)> {
        let mut done = 0;
        let mut first = None;
        while done < src.len() {
            let avail = self.data.len() - self.cursor;
            let n = avail.min(src.len() - done);
            if first.is_none() {
                first = src[done..done + n]
                    .iter()
                    .zip(&self.data[self.cursor..self.cursor + n])
                    .position(|(a, b)| a != b)
                    .map(|i| (done + i, self.data[self.cursor + i]));
            }
            done += n;
            self.skip(n);
        }
        first
    }
}
