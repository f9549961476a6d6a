//! Exercise driver: writes every worker slice through the encoder and reads
//! it back through the verifier.
//!
//! Each slice gets its own blocking worker with private pattern buffers, so
//! workers never share cursors or bytes on the target.

use crate::encoding::btag::{BasicTagCodec, TagCodec};
use crate::encoding::{lba_for_offset, Encoder, EncodingConfig, RequestInfo, Strategy};
use crate::error::ConfigError;
use crate::patterns::{PatternBuffer, PatternSource};
use crate::reread::transport::FileTransport;
use crate::reread::{CancelToken, Diagnosis, Diagnostician, RereadOptions, RereadTarget};
use crate::slice::random::RandomOffsets;
use crate::slice::{make_slices, slice_for, SliceDescriptor};
use crate::storage::{detect_device_size, probe_target, TargetGeometry, TargetKind};
use crate::verify::report::MismatchReport;
use crate::verify::trigger::{CommandTrigger, TriggerAction};
use crate::verify::{AccessPattern, Verdict, Verifier, VerifyOptions};
use crate::Result;
use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_SIZE: usize = 64 * 1024;

/// Which phases a pass runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IoMode {
    /// Write each slice, then read it back and verify.
    #[default]
    ReadWrite,
    /// Only write the pattern.
    WriteOnly,
    /// Only verify data left by an earlier write-only run.
    ReadOnly,
}

impl IoMode {
    pub fn writes(&self) -> bool {
        !matches!(self, IoMode::ReadOnly)
    }

    pub fn reads(&self) -> bool {
        !matches!(self, IoMode::WriteOnly)
    }

    fn phases(&self) -> u64 {
        if matches!(self, IoMode::ReadWrite) {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    pub workers: usize,
    /// Bytes of the target to exercise, 0 for the target's current size.
    pub total_range: u64,
    /// Slice alignment, 0 to derive it from the target.
    pub device_size: u64,
    pub request_size: usize,
    pub access: AccessPattern,
    pub mode: IoMode,
    pub passes: u32,
    pub seed: u64,
    /// Mismatches a worker tolerates before it stops, 0 for no limit.
    pub error_limit: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            total_range: 0,
            device_size: 0,
            request_size: DEFAULT_REQUEST_SIZE,
            access: AccessPattern::Sequential,
            mode: IoMode::ReadWrite,
            passes: 1,
            seed: 0,
            error_limit: 1,
        }
    }
}

/// Everything needed to run one exercise against one target.
#[derive(Debug, Clone)]
pub struct ExerciseConfig {
    pub target: PathBuf,
    pub pattern: PatternSource,
    /// Circular buffer size, 0 for the pattern's own length.
    pub pattern_size: usize,
    pub encoding: EncodingConfig,
    pub verify: VerifyOptions,
    pub reread: RereadOptions,
    pub trigger_command: Option<String>,
    pub workload: WorkloadConfig,
    pub progress: bool,
}

impl ExerciseConfig {
    pub fn new(target: PathBuf) -> Self {
        Self {
            target,
            pattern: PatternSource::default(),
            pattern_size: 0,
            encoding: EncodingConfig::default(),
            verify: VerifyOptions::default(),
            reread: RereadOptions::default(),
            trigger_command: None,
            workload: WorkloadConfig::default(),
            progress: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub workers: usize,
    pub records_written: u64,
    pub records_read: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub mismatches: u64,
    pub reports: Vec<MismatchReport>,
    pub diagnoses: Vec<Diagnosis>,
    /// Set when a trigger stopped the run.
    pub trigger_action: Option<TriggerAction>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.mismatches == 0 && !self.cancelled
    }

    fn merge(&mut self, other: RunSummary) {
        self.records_written += other.records_written;
        self.records_read += other.records_read;
        self.bytes_written += other.bytes_written;
        self.bytes_read += other.bytes_read;
        self.mismatches += other.mismatches;
        self.reports.extend(other.reports);
        self.diagnoses.extend(other.diagnoses);
        if self.trigger_action.is_none() {
            self.trigger_action = other.trigger_action;
        }
    }
}

/// Target layout resolved at the start of a run.
#[derive(Debug, Clone)]
struct TargetPlan {
    geometry: TargetGeometry,
    total_range: u64,
    slices: Vec<SliceDescriptor>,
}

pub struct Exerciser {
    config: ExerciseConfig,
    encoder: Encoder,
    pattern: PatternBuffer,
    cancel: CancelToken,
}

impl Exerciser {
    /// Validates the encoding, pattern and request size. The target itself
    /// is not touched until [`Exerciser::run`].
    pub fn new(config: ExerciseConfig, cancel: CancelToken) -> Result<Self> {
        let codec = config
            .encoding
            .tagged
            .then(|| Arc::new(BasicTagCodec) as Arc<dyn TagCodec>);
        let encoder = Encoder::new(config.encoding.clone(), codec)?;
        let pattern = PatternBuffer::from_source(&config.pattern, config.pattern_size)?;

        let workload = &config.workload;
        if workload.request_size == 0 {
            return Err(ConfigError::ZeroRequestSize.into());
        }
        if workload.access == AccessPattern::Random && workload.mode != IoMode::ReadWrite {
            return Err(ConfigError::RandomSplitPhase.into());
        }
        // A block larger than the request would never carry its address or
        // tag, leaving the embedded header unchecked.
        let block_size = encoder.lbdata_size();
        if block_size > workload.request_size
            && matches!(
                encoder.strategy(),
                Strategy::Addressed { .. } | Strategy::Tagged
            )
        {
            return Err(ConfigError::BlockExceedsRequest {
                block_size,
                request: workload.request_size,
            }
            .into());
        }

        Ok(Self {
            config,
            encoder,
            pattern,
            cancel,
        })
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let plan = self.prepare_target()?;
        let workload = &self.config.workload;

        info!(
            target = %self.config.target.display(),
            strategy = %self.encoder.strategy(),
            pattern = %self.config.pattern.name(),
            workers = plan.slices.len(),
            total_range = plan.total_range,
            request_size = workload.request_size,
            "starting exercise"
        );

        let progress = self.progress_bar(plan.total_range)?;
        let stop = CancelToken::new();
        let handles: Vec<_> = plan
            .slices
            .iter()
            .map(|slice| {
                let worker = Worker {
                    slice: *slice,
                    target: self.config.target.clone(),
                    geometry: plan.geometry,
                    encoder: self.encoder.clone(),
                    pattern: self.pattern.clone(),
                    verify: self.config.verify.clone(),
                    reread: self.config.reread.clone(),
                    trigger_command: self.config.trigger_command.clone(),
                    workload: workload.clone(),
                    cancel: self.cancel.clone(),
                    stop: stop.clone(),
                    progress: progress.clone(),
                };
                task::spawn_blocking(move || worker.run())
            })
            .collect();

        let results = futures::future::try_join_all(handles).await?;

        let mut summary = RunSummary {
            workers: plan.slices.len(),
            ..Default::default()
        };
        for result in results {
            summary.merge(result?);
        }
        summary.cancelled = self.cancel.is_cancelled();

        progress.finish_with_message(if summary.passed() {
            "Exercise completed"
        } else {
            "Exercise failed"
        });
        info!(
            mismatches = summary.mismatches,
            bytes_written = summary.bytes_written,
            bytes_read = summary.bytes_read,
            cancelled = summary.cancelled,
            "exercise finished"
        );
        Ok(summary)
    }

    fn prepare_target(&self) -> Result<TargetPlan> {
        let path = &self.config.target;
        let workload = &self.config.workload;

        if !path.exists() {
            if !workload.mode.writes() {
                bail!("Target {} does not exist", path.display());
            }
            File::create(path)
                .with_context(|| format!("Failed to create target {}", path.display()))?;
        }
        let geometry = probe_target(path)?;

        let device_size = match workload.device_size {
            0 => detect_device_size(path)?,
            size => size,
        };
        if workload.request_size as u64 % device_size != 0 {
            return Err(ConfigError::UnalignedRequest {
                request: workload.request_size,
                device: device_size,
            }
            .into());
        }

        let total_range = match workload.total_range {
            0 => geometry.capacity,
            range => range,
        };
        if total_range == 0 {
            bail!(
                "Size of {} is unknown; a data range is required",
                path.display()
            );
        }

        if geometry.kind == TargetKind::RegularFile && geometry.capacity < total_range {
            if !workload.mode.writes() {
                bail!(
                    "Target {} holds {} bytes, fewer than the {} byte data range",
                    path.display(),
                    geometry.capacity,
                    total_range
                );
            }
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            file.set_len(total_range)
                .with_context(|| format!("Failed to extend {}", path.display()))?;
            debug!(total_range, "extended target file");
        }

        let slices = match workload.workers {
            1 => vec![slice_for(total_range, device_size, 1, 1)?],
            workers => make_slices(total_range, device_size, workers as u64)?,
        };
        Ok(TargetPlan {
            geometry,
            total_range,
            slices,
        })
    }

    fn progress_bar(&self, total_range: u64) -> Result<ProgressBar> {
        if !self.config.progress {
            return Ok(ProgressBar::hidden());
        }
        let workload = &self.config.workload;
        let total = total_range * workload.passes as u64 * workload.mode.phases();
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}")?
                .progress_chars("##-"),
        );
        pb.set_message(format!("{} ({})", self.encoder.strategy(), self.config.pattern.name()));
        Ok(pb)
    }
}

/// One slice's worth of work, run on the blocking pool.
struct Worker {
    slice: SliceDescriptor,
    target: PathBuf,
    geometry: TargetGeometry,
    encoder: Encoder,
    pattern: PatternBuffer,
    verify: VerifyOptions,
    reread: RereadOptions,
    trigger_command: Option<String>,
    workload: WorkloadConfig,
    cancel: CancelToken,
    /// Shared by all workers; set when a trigger asks the run to stop.
    stop: CancelToken,
    progress: ProgressBar,
}

impl Worker {
    fn run(self) -> Result<RunSummary> {
        let file = OpenOptions::new()
            .read(true)
            .write(self.workload.mode.writes())
            .open(&self.target)
            .with_context(|| format!("Failed to open {}", self.target.display()))?;

        debug!(
            slice = self.slice.number,
            start = self.slice.start,
            length = self.slice.length,
            "worker started"
        );

        let mut writer = self.pattern.clone();
        let mut verifier = self.verifier();
        let mut buf = vec![0u8; self.workload.request_size];
        let mut summary = RunSummary::default();

        for pass in 1..=self.workload.passes {
            if self.halted() {
                break;
            }
            writer.reset();
            verifier.reset_pass();

            match self.workload.access {
                AccessPattern::Sequential => self.sequential_pass(
                    &file,
                    pass,
                    &mut buf,
                    &mut writer,
                    &mut verifier,
                    &mut summary,
                )?,
                AccessPattern::Random => self.random_pass(
                    &file,
                    pass,
                    &mut buf,
                    &mut writer,
                    &mut verifier,
                    &mut summary,
                )?,
            }
            debug!(slice = self.slice.number, pass, "pass complete");
        }
        Ok(summary)
    }

    fn verifier(&self) -> Verifier {
        let mut verifier = Verifier::new(
            self.encoder.clone(),
            self.pattern.clone(),
            self.verify.clone(),
        )
        .with_access(self.workload.access);

        if let Some(trigger) = self
            .trigger_command
            .as_deref()
            .and_then(|command| CommandTrigger::from_command_line(command, self.target.clone()))
        {
            verifier = verifier.with_trigger(Box::new(trigger));
        }

        if self.reread.enabled {
            if !self.geometry.supports_direct_io() {
                debug!(
                    target = %self.target.display(),
                    "no cache bypass for this target, rereads stay buffered"
                );
            }
            let target = RereadTarget {
                path: self.target.clone(),
                geometry: self.geometry,
            };
            let transport = FileTransport::new(self.geometry.block_size as usize);
            verifier = verifier.with_diagnostician(Diagnostician::new(
                Box::new(transport),
                target,
                self.reread.clone(),
                self.cancel.clone(),
            ));
        }
        verifier
    }

    fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.stop.is_cancelled()
    }

    fn records(&self) -> impl Iterator<Item = (u64, usize)> {
        let request_size = self.workload.request_size as u64;
        let end = self.slice.end();
        (self.slice.start..end)
            .step_by(request_size as usize)
            .map(move |offset| (offset, request_size.min(end - offset) as usize))
    }

    fn sequential_pass(
        &self,
        file: &File,
        pass: u32,
        buf: &mut [u8],
        writer: &mut PatternBuffer,
        verifier: &mut Verifier,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if self.workload.mode.writes() {
            for (record, (offset, len)) in self.records().enumerate() {
                if self.halted() {
                    return Ok(());
                }
                let info = RequestInfo {
                    offset,
                    record: record as u64,
                    pass,
                };
                self.write_record(file, &mut buf[..len], writer, &info, summary)?;
            }
            file.sync_data()
                .with_context(|| format!("Failed to sync {}", self.target.display()))?;
        }

        if self.workload.mode.reads() {
            for (record, (offset, len)) in self.records().enumerate() {
                if self.halted() {
                    return Ok(());
                }
                let info = RequestInfo {
                    offset,
                    record: record as u64,
                    pass,
                };
                if self.read_record(file, &mut buf[..len], verifier, &info, false, summary)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Random offsets may repeat, so each record is read back right after
    /// it is written.
    fn random_pass(
        &self,
        file: &File,
        pass: u32,
        buf: &mut [u8],
        writer: &mut PatternBuffer,
        verifier: &mut Verifier,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let request_size = self.workload.request_size;
        let offsets = RandomOffsets::new(
            &self.slice,
            request_size as u64,
            self.workload.seed.wrapping_add(pass as u64),
        )?;
        let records = (self.slice.length / request_size as u64) as usize;

        for (record, offset) in offsets.take(records).enumerate() {
            if self.halted() {
                break;
            }
            let info = RequestInfo {
                offset,
                record: record as u64,
                pass,
            };
            self.write_record(file, buf, writer, &info, summary)?;
            if self.read_record(file, buf, verifier, &info, true, summary)? {
                break;
            }
        }
        Ok(())
    }

    fn write_record(
        &self,
        file: &File,
        buf: &mut [u8],
        writer: &mut PatternBuffer,
        info: &RequestInfo,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut lba = lba_for_offset(info.offset, self.encoder.lbdata_size());
        self.encoder.fill(writer, buf, &mut lba, info);
        file.write_all_at(buf, info.offset).with_context(|| {
            format!(
                "Write of {} bytes at offset {} failed",
                buf.len(),
                info.offset
            )
        })?;
        summary.records_written += 1;
        summary.bytes_written += buf.len() as u64;
        self.progress.inc(buf.len() as u64);
        Ok(())
    }

    /// Reads and verifies one record. Returns true when the worker should
    /// stop.
    fn read_record(
        &self,
        file: &File,
        buf: &mut [u8],
        verifier: &mut Verifier,
        info: &RequestInfo,
        read_after_write: bool,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        file.read_exact_at(buf, info.offset).with_context(|| {
            format!(
                "Read of {} bytes at offset {} failed",
                buf.len(),
                info.offset
            )
        })?;
        summary.records_read += 1;
        summary.bytes_read += buf.len() as u64;
        self.progress.inc(buf.len() as u64);

        let mut lba = lba_for_offset(info.offset, self.encoder.lbdata_size());
        let outcome = match verifier.verify(buf, &mut lba, info, read_after_write) {
            Verdict::Match => return Ok(false),
            Verdict::Mismatch(outcome) => outcome,
        };

        summary.mismatches += 1;
        let stops_run = outcome.stops_run();
        if let Some(reread) = &outcome.reread {
            summary.diagnoses.push(reread.diagnosis.clone());
        }
        if stops_run {
            summary.trigger_action = outcome.trigger;
        }
        summary.reports.push(outcome.report);

        if stops_run {
            warn!(slice = self.slice.number, "trigger requested the run stop");
            self.stop.cancel();
            return Ok(true);
        }
        let limit = self.workload.error_limit;
        if limit != 0 && summary.mismatches >= limit {
            warn!(
                slice = self.slice.number,
                mismatches = summary.mismatches,
                "error limit reached"
            );
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::report::MismatchKind;
    use tempfile::tempdir;

    fn exercise_config(target: PathBuf) -> ExerciseConfig {
        let mut config = ExerciseConfig::new(target);
        config.progress = false;
        config.workload.workers = 2;
        config.workload.total_range = 64 * 1024;
        config.workload.request_size = 4096;
        config.verify.dump = false;
        config
    }

    #[tokio::test]
    async fn test_sequential_lbdata_run_passes() -> Result<()> {
        let dir = tempdir()?;
        let mut config = exercise_config(dir.path().join("target.dat"));
        config.encoding.lbdata = true;
        config.workload.passes = 2;

        let summary = Exerciser::new(config, CancelToken::new())?.run().await?;
        assert!(summary.passed());
        assert_eq!(summary.workers, 2);
        assert_eq!(summary.bytes_written, 2 * 64 * 1024);
        assert_eq!(summary.bytes_read, 2 * 64 * 1024);
        assert_eq!(summary.records_read, 32);
        Ok(())
    }

    #[tokio::test]
    async fn test_random_tagged_run_passes() -> Result<()> {
        let dir = tempdir()?;
        let mut config = exercise_config(dir.path().join("target.dat"));
        config.encoding.tagged = true;
        config.encoding.prefix = Some(b"host:dtverify".to_vec());
        config.encoding.prefix_cross_check = true;
        config.workload.access = AccessPattern::Random;
        config.workload.seed = 42;

        let summary = Exerciser::new(config, CancelToken::new())?.run().await?;
        assert!(summary.passed());
        assert_eq!(summary.records_written, summary.records_read);
        assert_eq!(summary.records_read, 16);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_run_finds_corruption() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("target.dat");

        let mut config = exercise_config(path.clone());
        config.encoding.iot = true;
        config.workload.mode = IoMode::WriteOnly;
        let summary = Exerciser::new(config.clone(), CancelToken::new())?
            .run()
            .await?;
        assert_eq!(summary.bytes_read, 0);

        let file = OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(&[0xff], 5000 + 600)?;

        config.workload.mode = IoMode::ReadOnly;
        let summary = Exerciser::new(config, CancelToken::new())?.run().await?;
        assert_eq!(summary.mismatches, 1);
        let report = &summary.reports[0];
        assert_eq!(report.file_offset, 5600);
        assert_eq!(report.kind, MismatchKind::Data);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_stops() -> Result<()> {
        let dir = tempdir()?;
        let config = exercise_config(dir.path().join("target.dat"));
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = Exerciser::new(config, cancel)?.run().await?;
        assert!(summary.cancelled);
        assert!(!summary.passed());
        assert_eq!(summary.bytes_written, 0);
        Ok(())
    }

    #[test]
    fn test_invalid_workloads_rejected() {
        let mut config = exercise_config(PathBuf::from("/nonexistent"));
        config.workload.request_size = 0;
        assert!(Exerciser::new(config.clone(), CancelToken::new()).is_err());

        config.workload.request_size = 4096;
        config.workload.access = AccessPattern::Random;
        config.workload.mode = IoMode::ReadOnly;
        let err = Exerciser::new(config, CancelToken::new()).err().unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::RandomSplitPhase)
        );
    }

    #[test]
    fn test_block_larger_than_request_rejected() {
        let mut config = exercise_config(PathBuf::from("/nonexistent"));
        config.encoding.lbdata = true;
        config.encoding.lbdata_size = 8192;
        let err = Exerciser::new(config.clone(), CancelToken::new())
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::BlockExceedsRequest {
                block_size: 8192,
                request: 4096
            })
        );

        config.encoding.lbdata = false;
        config.encoding.tagged = true;
        assert!(Exerciser::new(config.clone(), CancelToken::new()).is_err());

        // Plain and prefixed data has nothing to lose.
        config.encoding.tagged = false;
        config.encoding.prefix = Some(b"pfx".to_vec());
        assert!(Exerciser::new(config, CancelToken::new()).is_ok());
    }

    #[tokio::test]
    async fn test_single_worker_covers_whole_range() -> Result<()> {
        let dir = tempdir()?;
        let mut config = exercise_config(dir.path().join("target.dat"));
        config.workload.workers = 1;
        config.workload.total_range = 64 * 1024 + 100;
        config.encoding.iot = true;

        let summary = Exerciser::new(config, CancelToken::new())?.run().await?;
        assert!(summary.passed());
        assert_eq!(summary.workers, 1);
        // The unaligned tail past the last device-size multiple is left out.
        assert_eq!(summary.bytes_written, 64 * 1024);
        assert_eq!(summary.records_read, 16);
        Ok(())
    }

    #[tokio::test]
    async fn test_unaligned_request_rejected() -> Result<()> {
        let dir = tempdir()?;
        let mut config = exercise_config(dir.path().join("target.dat"));
        config.workload.request_size = 1000;

        let err = Exerciser::new(config, CancelToken::new())?
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnalignedRequest { request: 1000, .. })
        ));
        Ok(())
    }
}
