//! Read-buffer verification.
//!
//! [`Verifier`] owns a worker's pattern buffer and encoder. Each call to
//! [`Verifier::verify`] compares one request, and on the first mismatch
//! logs the report, renders the dump, fires the trigger and, for random
//! access runs, hands the range to the reread diagnostician.

pub mod dump;
pub mod report;
pub mod trigger;

use crate::encoding::{Encoder, RequestInfo};
use crate::patterns::{PatternBuffer, PatternCursor};
use crate::reread::{Diagnostician, RereadReport, RereadSession};
use dump::DEFAULT_DUMP_LIMIT;
use report::MismatchReport;
use tracing::{debug, error, info, warn};
use trigger::{Trigger, TriggerAction};

/// Guards against re-entering the diagnostician from its own compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyState {
    #[default]
    Idle,
    Verifying,
    Rereading,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessPattern {
    #[default]
    Sequential,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    pub dump: bool,
    pub dump_limit: usize,
    /// Fire the trigger before rendering the dump instead of after.
    pub trigger_before_dump: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            dump: true,
            dump_limit: DEFAULT_DUMP_LIMIT,
            trigger_before_dump: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchOutcome {
    pub report: MismatchReport,
    pub dump: Option<String>,
    pub trigger: Option<TriggerAction>,
    pub reread: Option<RereadReport>,
}

impl MismatchOutcome {
    /// True when a trigger asked for the run to stop.
    pub fn stops_run(&self) -> bool {
        self.trigger.is_some_and(|action| action.stops_run())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch(Box<MismatchOutcome>),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }

    pub fn report(&self) -> Option<&MismatchReport> {
        match self {
            Verdict::Match => None,
            Verdict::Mismatch(outcome) => Some(&outcome.report),
        }
    }
}

pub struct Verifier {
    encoder: Encoder,
    pattern: PatternBuffer,
    options: VerifyOptions,
    access: AccessPattern,
    trigger: Option<Box<dyn Trigger>>,
    diagnostician: Option<Diagnostician>,
    state: VerifyState,
}

impl Verifier {
    pub fn new(encoder: Encoder, pattern: PatternBuffer, options: VerifyOptions) -> Self {
        Self {
            encoder,
            pattern,
            options,
            access: AccessPattern::Sequential,
            trigger: None,
            diagnostician: None,
            state: VerifyState::Idle,
        }
    }

    /// A quiet verifier used inside a reread session: no dump, no trigger,
    /// and no way back into the diagnostician.
    pub(crate) fn rereading(encoder: Encoder, pattern: PatternBuffer) -> Self {
        Self {
            options: VerifyOptions {
                dump: false,
                ..Default::default()
            },
            state: VerifyState::Rereading,
            ..Self::new(encoder, pattern, VerifyOptions::default())
        }
    }

    pub fn with_access(mut self, access: AccessPattern) -> Self {
        self.access = access;
        self
    }

    pub fn with_trigger(mut self, trigger: Box<dyn Trigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_diagnostician(mut self, diagnostician: Diagnostician) -> Self {
        self.diagnostician = Some(diagnostician);
        self
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn pattern(&self) -> &PatternBuffer {
        &self.pattern
    }

    pub fn state(&self) -> VerifyState {
        self.state
    }

    /// Rewinds the pattern stream for a new pass.
    pub fn reset_pass(&mut self) {
        self.pattern.reset();
    }

    /// Verifies one request. `lba` is the block number of the first block
    /// and is advanced past the request, as is the pattern cursor, whether
    /// or not the compare succeeds.
    pub fn verify(
        &mut self,
        buf: &[u8],
        lba: &mut u64,
        info: &RequestInfo,
        read_after_write: bool,
    ) -> Verdict {
        let rereading = self.state == VerifyState::Rereading;
        if !rereading {
            self.state = VerifyState::Verifying;
        }

        let start = self.pattern.checkpoint();
        let start_lba = *lba;
        let verdict = match self.encoder.compare(&mut self.pattern, buf, lba, info) {
            None => Verdict::Match,
            Some(mut report) => {
                report.read_after_write = read_after_write;
                let outcome = if rereading {
                    MismatchOutcome {
                        report,
                        dump: None,
                        trigger: None,
                        reread: None,
                    }
                } else {
                    self.handle_mismatch(report, buf, start, start_lba, info)
                };
                Verdict::Mismatch(Box::new(outcome))
            }
        };

        if !rereading {
            self.state = VerifyState::Idle;
        }
        verdict
    }

    fn handle_mismatch(
        &mut self,
        report: MismatchReport,
        buf: &[u8],
        start: PatternCursor,
        start_lba: u64,
        info: &RequestInfo,
    ) -> MismatchOutcome {
        error!(
            strategy = %self.encoder.strategy(),
            offset = report.offset,
            file_offset = report.file_offset,
            count = report.count,
            expected = report.expected,
            found = report.found,
            "{}",
            report
        );

        let mut snapshot = self.pattern.clone();
        snapshot.restore(start);

        let mut outcome = MismatchOutcome {
            report,
            dump: None,
            trigger: None,
            reread: None,
        };
        if self.options.trigger_before_dump {
            outcome.trigger = self.fire_trigger(&outcome.report);
        }
        if self.options.dump {
            let expected = self
                .encoder
                .expected_image(&snapshot, buf, start_lba, info);
            let text = dump::render(
                &expected,
                buf,
                outcome.report.offset,
                self.options.dump_limit,
                info.offset,
            );
            error!("miscompare dump:\n{}", text);
            outcome.dump = Some(text);
        }
        if !self.options.trigger_before_dump {
            outcome.trigger = self.fire_trigger(&outcome.report);
        }

        outcome.reread = self.reread(snapshot, buf, start_lba, info);
        outcome
    }

    fn fire_trigger(&mut self, report: &MismatchReport) -> Option<TriggerAction> {
        let trigger = self.trigger.as_mut()?;
        let action = trigger.on_miscompare(report);
        info!(?action, "miscompare trigger completed");
        Some(action)
    }

    fn reread(
        &mut self,
        pattern: PatternBuffer,
        buf: &[u8],
        lba: u64,
        info: &RequestInfo,
    ) -> Option<RereadReport> {
        let diagnostician = self.diagnostician.as_ref()?;
        if !diagnostician.options().enabled || self.state != VerifyState::Verifying {
            return None;
        }
        if self.access != AccessPattern::Random {
            debug!("sequential access, skipping reread diagnosis");
            return None;
        }

        self.state = VerifyState::Rereading;
        let session = RereadSession {
            encoder: self.encoder.clone(),
            pattern,
            lba,
            info: *info,
            original: buf,
        };
        let result = diagnostician.diagnose(&session);
        self.state = VerifyState::Verifying;

        match result {
            Ok(report) => {
                warn!(
                    attempts = report.attempts,
                    direct = report.direct,
                    "{}",
                    report.diagnosis
                );
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "reread diagnosis failed");
                None
            }
        }
    }
}
