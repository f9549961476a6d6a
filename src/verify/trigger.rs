//! Miscompare triggers: external actions run once per mismatch report.

use super::report::MismatchReport;
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// What the run should do after a trigger has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Continue,
    Terminate,
    Abort,
}

impl TriggerAction {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => TriggerAction::Continue,
            1 => TriggerAction::Terminate,
            2 => TriggerAction::Abort,
            other => {
                warn!(code = other, "unknown trigger exit status, continuing");
                TriggerAction::Continue
            }
        }
    }

    pub fn stops_run(&self) -> bool {
        !matches!(self, TriggerAction::Continue)
    }
}

pub trait Trigger: Send {
    fn on_miscompare(&mut self, report: &MismatchReport) -> TriggerAction;
}

/// Runs an external program as
/// `program [args...] <target> <file-offset> <request-offset> <count> <kind>`.
#[derive(Debug, Clone)]
pub struct CommandTrigger {
    program: String,
    args: Vec<String>,
    target: PathBuf,
}

impl CommandTrigger {
    pub fn new(program: impl Into<String>, args: Vec<String>, target: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            target,
        }
    }

    /// Splits a command line on whitespace into program and arguments.
    pub fn from_command_line(command: &str, target: PathBuf) -> Option<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect(), target))
    }
}

impl Trigger for CommandTrigger {
    fn on_miscompare(&mut self, report: &MismatchReport) -> TriggerAction {
        info!(program = %self.program, "executing miscompare trigger");
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&self.target)
            .arg(report.file_offset.to_string())
            .arg(report.request_offset().to_string())
            .arg(report.count.to_string())
            .arg(report.kind.name())
            .status();

        match status {
            Ok(status) => match status.code() {
                Some(code) => TriggerAction::from_exit_code(code),
                None => {
                    warn!(program = %self.program, "trigger killed by signal, continuing");
                    TriggerAction::Continue
                }
            },
            Err(e) => {
                warn!(program = %self.program, error = %e, "could not run trigger");
                TriggerAction::Continue
            }
        }
    }
}
