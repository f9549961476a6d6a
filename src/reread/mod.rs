//! Reread diagnosis of a failed compare.
//!
//! The suspect byte range is read again through a fresh handle, through the
//! cache-bypass path when alignment allows, and the new bytes are compared
//! with both the original read and the expected data:
//!
//! | reread equals        | diagnosis                                   |
//! |----------------------|---------------------------------------------|
//! | the original read    | data on the medium is wrong (write fault)   |
//! | the expected data    | the first read was wrong (read fault)       |
//! | neither              | data is inconsistent between reads          |
//!
//! Failures of the reread itself are returned as errors for the caller to
//! log. They never replace the original mismatch report.

pub mod transport;

use crate::encoding::{Encoder, RequestInfo};
use crate::patterns::PatternBuffer;
use crate::storage::TargetGeometry;
use crate::verify::report::MismatchReport;
use crate::verify::{Verdict, Verifier};
use anyhow::{bail, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use transport::{TargetHandle, Transport};

const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Process-wide cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RereadOptions {
    pub enabled: bool,
    /// Keep re-reading until cancelled (or `retry_limit` is reached).
    pub loop_on_error: bool,
    /// Base delay; attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
    /// Maximum attempts when looping, 0 for no limit.
    pub retry_limit: u32,
}

impl Default for RereadOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            loop_on_error: false,
            retry_delay: Duration::from_secs(1),
            retry_limit: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RereadTarget {
    pub path: PathBuf,
    /// Kind and logical block size; the block size is the alignment
    /// required for cache-bypass reads.
    pub geometry: TargetGeometry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    MatchesPreviousRead,
    MatchesExpected,
    MatchesNeither(MismatchReport),
}

impl Diagnosis {
    pub fn summary(&self) -> &'static str {
        match self {
            Diagnosis::MatchesPreviousRead => {
                "reread data matches previous read; likely a write-time fault"
            }
            Diagnosis::MatchesExpected => {
                "reread data matches expected data; likely a one-time read-time fault"
            }
            Diagnosis::MatchesNeither(_) => {
                "reread data matches neither previous read nor expected data; data is inconsistent"
            }
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.summary())?;
        if let Diagnosis::MatchesNeither(report) = self {
            write!(f, " ({})", report)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RereadReport {
    /// Diagnosis of the last completed reread.
    pub diagnosis: Diagnosis,
    pub attempts: u32,
    pub direct: bool,
    pub cancelled: bool,
}

/// A worker-local snapshot of everything needed to rebuild the expected
/// bytes of the failed request.
pub struct RereadSession<'a> {
    pub encoder: Encoder,
    /// Positioned at the cursor the failed request started at.
    pub pattern: PatternBuffer,
    pub lba: u64,
    pub info: RequestInfo,
    pub original: &'a [u8],
}

impl RereadSession<'_> {
    fn classify(&self, reread: &[u8]) -> Diagnosis {
        if reread == self.original {
            return Diagnosis::MatchesPreviousRead;
        }
        let mut verifier = Verifier::rereading(self.encoder.clone(), self.pattern.clone());
        let mut lba = self.lba;
        match verifier.verify(reread, &mut lba, &self.info, false) {
            Verdict::Match => Diagnosis::MatchesExpected,
            Verdict::Mismatch(outcome) => Diagnosis::MatchesNeither(outcome.report),
        }
    }
}

pub struct Diagnostician {
    transport: Box<dyn Transport>,
    target: RereadTarget,
    options: RereadOptions,
    cancel: CancelToken,
}

impl Diagnostician {
    pub fn new(
        transport: Box<dyn Transport>,
        target: RereadTarget,
        options: RereadOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transport,
            target,
            options,
            cancel,
        }
    }

    pub fn options(&self) -> &RereadOptions {
        &self.options
    }

    /// Cache bypass is only attempted on files and block devices, and only
    /// when both offset and size are multiples of the device block size.
    pub fn can_bypass(&self, offset: u64, len: u64) -> bool {
        let geometry = &self.target.geometry;
        let block_size = geometry.block_size;
        geometry.supports_direct_io()
            && block_size > 0
            && offset % block_size == 0
            && len % block_size == 0
    }

    fn reopen(&self, direct: bool) -> Result<(Box<dyn TargetHandle>, bool)> {
        if direct {
            match self.transport.open(&self.target.path, true) {
                Ok(handle) => return Ok((handle, true)),
                Err(e) => debug!(error = %e, "direct reopen failed, using buffered reopen"),
            }
        }
        Ok((self.transport.open(&self.target.path, false)?, false))
    }

    pub fn diagnose(&self, session: &RereadSession<'_>) -> Result<RereadReport> {
        let offset = session.info.offset;
        let len = session.original.len();
        info!(
            path = %self.target.path.display(),
            offset,
            len,
            "rereading miscompared data"
        );

        let (mut handle, direct) = self.reopen(self.can_bypass(offset, len as u64))?;
        let mut result = self.reread_loop(handle.as_mut(), session, direct);
        if direct && result.is_err() {
            if let Err(e) = &result {
                debug!(error = %e, "direct reread failed, retrying buffered");
            }
            Self::close(handle);
            handle = self.transport.open(&self.target.path, false)?;
            result = self.reread_loop(handle.as_mut(), session, false);
        }
        Self::close(handle);
        result
    }

    fn close(handle: Box<dyn TargetHandle>) {
        if let Err(e) = handle.close() {
            warn!(error = %e, "failed to close reread handle");
        }
    }

    fn reread_once(
        &self,
        handle: &mut dyn TargetHandle,
        session: &RereadSession<'_>,
        data: &mut [u8],
    ) -> Result<Diagnosis> {
        let n = handle.read_at(data, session.info.offset)?;
        if n != data.len() {
            bail!("short reread: {} of {} bytes", n, data.len());
        }
        Ok(session.classify(data))
    }

    fn reread_loop(
        &self,
        handle: &mut dyn TargetHandle,
        session: &RereadSession<'_>,
        direct: bool,
    ) -> Result<RereadReport> {
        let mut data = vec![0u8; session.original.len()];
        let mut attempts = 0u32;
        let mut cancelled = false;
        let mut last = None;

        loop {
            attempts += 1;
            match self.reread_once(handle, session, &mut data) {
                Ok(diagnosis) => {
                    info!(attempt = attempts, direct, %diagnosis, "reread diagnosis");
                    last = Some(diagnosis);
                }
                Err(e) if last.is_some() => {
                    warn!(attempt = attempts, error = %e, "reread retry failed, keeping last diagnosis");
                    break;
                }
                Err(e) => return Err(e),
            }

            if !self.options.loop_on_error
                || (self.options.retry_limit > 0 && attempts >= self.options.retry_limit)
            {
                break;
            }
            if self.cancel.is_cancelled() || !self.backoff(attempts) {
                cancelled = true;
                break;
            }
        }

        let Some(diagnosis) = last else {
            bail!("no reread attempt completed");
        };
        Ok(RereadReport {
            diagnosis,
            attempts,
            direct,
            cancelled,
        })
    }

    /// Sleeps `attempt * retry_delay`, waking early on cancellation.
    /// Returns false when cancelled.
    fn backoff(&self, attempt: u32) -> bool {
        let deadline = Instant::now() + self.options.retry_delay * attempt;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(BACKOFF_STEP.min(deadline - now));
        }
    }
}
