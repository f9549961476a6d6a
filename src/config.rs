use crate::encoding::{EncodingConfig, DEFAULT_IOT_SEED, DEFAULT_LBDATA_SIZE};
use crate::error::ConfigError;
use crate::io::{ExerciseConfig, IoMode, WorkloadConfig, DEFAULT_REQUEST_SIZE};
use crate::patterns::PatternSource;
use crate::reread::RereadOptions;
use crate::verify::dump::DEFAULT_DUMP_LIMIT;
use crate::verify::{AccessPattern, VerifyOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub defaults: DefaultConfig,
    #[serde(default)]
    pub pattern: PatternConfig,
    #[serde(default)]
    pub encoding: EncodingSection,
    #[serde(default)]
    pub verify: VerifySection,
    #[serde(default)]
    pub reread: RereadSection,
    #[serde(default)]
    pub workload: WorkloadSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    #[serde(default = "default_true")]
    pub progress: bool,
}

/// `kind` is one of `numeric`, `text`, `file` or `incr`; only the matching
/// field is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default = "default_pattern_kind")]
    pub kind: String,
    #[serde(default = "default_pattern_value")]
    pub value: u32,
    #[serde(default = "default_pattern_width")]
    pub width: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingSection {
    #[serde(default = "default_lbdata_size")]
    pub lbdata_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub lbdata: bool,
    #[serde(default)]
    pub iot: bool,
    #[serde(default = "default_iot_seed")]
    pub iot_seed: u32,
    #[serde(default)]
    pub tagged: bool,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub prefix_cross_check: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySection {
    #[serde(default = "default_true")]
    pub dump: bool,
    #[serde(default = "default_dump_limit")]
    pub dump_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_command: Option<String>,
    #[serde(default)]
    pub trigger_before_dump: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RereadSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub loop_on_error: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub retry_limit: u32,
}

/// Sizes accept the suffixes understood by [`parse_size`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSection {
    /// 0 uses one worker per CPU.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_zero_size")]
    pub total_range: String,
    #[serde(default = "default_zero_size")]
    pub device_size: String,
    #[serde(default = "default_request_size")]
    pub request_size: String,
    #[serde(default = "default_access")]
    pub access: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_passes")]
    pub passes: u32,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_error_limit")]
    pub error_limit: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            progress: default_true(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            kind: default_pattern_kind(),
            value: default_pattern_value(),
            width: default_pattern_width(),
            text: None,
            file: None,
            buffer_size: 0,
        }
    }
}

impl Default for EncodingSection {
    fn default() -> Self {
        Self {
            lbdata_size: default_lbdata_size(),
            prefix: None,
            lbdata: false,
            iot: false,
            iot_seed: default_iot_seed(),
            tagged: false,
            timestamps: false,
            prefix_cross_check: false,
        }
    }
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            dump: default_true(),
            dump_limit: default_dump_limit(),
            trigger_command: None,
            trigger_before_dump: false,
        }
    }
}

impl Default for RereadSection {
    fn default() -> Self {
        Self {
            enabled: false,
            loop_on_error: false,
            retry_delay_ms: default_retry_delay_ms(),
            retry_limit: 0,
        }
    }
}

impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            workers: 0,
            total_range: default_zero_size(),
            device_size: default_zero_size(),
            request_size: default_request_size(),
            access: default_access(),
            mode: default_mode(),
            passes: default_passes(),
            seed: 0,
            error_limit: default_error_limit(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_pattern_kind() -> String {
    "numeric".to_string()
}

fn default_pattern_value() -> u32 {
    0x3902_7654
}

fn default_pattern_width() -> usize {
    4
}

fn default_lbdata_size() -> usize {
    DEFAULT_LBDATA_SIZE
}

fn default_iot_seed() -> u32 {
    DEFAULT_IOT_SEED
}

fn default_dump_limit() -> usize {
    DEFAULT_DUMP_LIMIT
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_zero_size() -> String {
    "0".to_string()
}

fn default_request_size() -> String {
    format!("{}k", DEFAULT_REQUEST_SIZE / 1024)
}

fn default_access() -> String {
    "sequential".to_string()
}

fn default_mode() -> String {
    "readwrite".to_string()
}

fn default_passes() -> u32 {
    1
}

fn default_error_limit() -> u64 {
    1
}

impl PatternConfig {
    pub fn source(&self) -> Result<PatternSource, ConfigError> {
        match self.kind.to_lowercase().as_str() {
            "numeric" => Ok(PatternSource::Numeric {
                value: self.value,
                width: self.width,
            }),
            "text" => Ok(PatternSource::Text(self.text.clone().unwrap_or_default())),
            "file" => self
                .file
                .clone()
                .map(PatternSource::File)
                .ok_or(ConfigError::UnknownValue {
                    field: "pattern file",
                    value: String::new(),
                }),
            "incr" | "incrementing" => Ok(PatternSource::Incrementing),
            other => Err(ConfigError::UnknownValue {
                field: "pattern kind",
                value: other.to_string(),
            }),
        }
    }

    /// Replaces the section with the given source, keeping the buffer size.
    pub fn set_source(&mut self, source: PatternSource) {
        let buffer_size = self.buffer_size;
        *self = Self {
            buffer_size,
            ..Self::default()
        };
        match source {
            PatternSource::Numeric { value, width } => {
                self.value = value;
                self.width = width;
            }
            PatternSource::Text(text) => {
                self.kind = "text".to_string();
                self.text = Some(text);
            }
            PatternSource::File(path) => {
                self.kind = "file".to_string();
                self.file = Some(path);
            }
            PatternSource::Incrementing => self.kind = "incr".to_string(),
        }
    }
}

impl ConfigFile {
    /// Resolves every section into a runnable configuration for `target`.
    /// Encoder and pattern validation happen when the exerciser is built.
    pub fn exercise_config(&self, target: PathBuf) -> Result<ExerciseConfig> {
        let encoding = &self.encoding;
        let workload = &self.workload;

        Ok(ExerciseConfig {
            target,
            pattern: self.pattern.source()?,
            pattern_size: self.pattern.buffer_size,
            encoding: EncodingConfig {
                lbdata_size: encoding.lbdata_size,
                prefix: encoding.prefix.as_ref().map(|p| p.as_bytes().to_vec()),
                lbdata: encoding.lbdata,
                iot: encoding.iot,
                iot_seed: encoding.iot_seed,
                tagged: encoding.tagged,
                timestamps: encoding.timestamps,
                prefix_cross_check: encoding.prefix_cross_check,
            },
            verify: VerifyOptions {
                dump: self.verify.dump,
                dump_limit: self.verify.dump_limit,
                trigger_before_dump: self.verify.trigger_before_dump,
            },
            reread: RereadOptions {
                enabled: self.reread.enabled,
                loop_on_error: self.reread.loop_on_error,
                retry_delay: Duration::from_millis(self.reread.retry_delay_ms),
                retry_limit: self.reread.retry_limit,
            },
            trigger_command: self
                .verify
                .trigger_command
                .clone()
                .filter(|c| !c.trim().is_empty()),
            workload: WorkloadConfig {
                workers: match workload.workers {
                    0 => num_cpus::get(),
                    n => n,
                },
                total_range: parse_size(&workload.total_range)?,
                device_size: parse_size(&workload.device_size)?,
                request_size: usize::try_from(parse_size(&workload.request_size)?)
                    .context("Request size does not fit in memory")?,
                access: parse_access(&workload.access)?,
                mode: parse_mode(&workload.mode)?,
                passes: workload.passes,
                seed: workload.seed,
                error_limit: workload.error_limit,
            },
            progress: self.defaults.progress,
        })
    }
}

/// Parses a pattern argument: `incr`, `file:<path>`, `text:<string>`, a
/// `0x` hex number of 1 to 8 digits (width taken from the digit count), or
/// any other string used as text.
pub fn parse_pattern(arg: &str) -> Result<PatternSource, ConfigError> {
    if arg.eq_ignore_ascii_case("incr") {
        return Ok(PatternSource::Incrementing);
    }
    if let Some(path) = arg.strip_prefix("file:") {
        return Ok(PatternSource::File(PathBuf::from(path)));
    }
    if let Some(text) = arg.strip_prefix("text:") {
        return Ok(PatternSource::Text(text.to_string()));
    }
    if let Some(hex) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        if hex.is_empty() || hex.len() > 8 {
            return Err(ConfigError::UnknownValue {
                field: "pattern",
                value: arg.to_string(),
            });
        }
        let value = u32::from_str_radix(hex, 16).map_err(|_| ConfigError::UnknownValue {
            field: "pattern",
            value: arg.to_string(),
        })?;
        return Ok(PatternSource::Numeric {
            value,
            width: (hex.len() + 1) / 2,
        });
    }
    if arg.is_empty() {
        return Err(ConfigError::EmptyPattern);
    }
    Ok(PatternSource::Text(arg.to_string()))
}

/// Parses a byte count with an optional suffix: `b` (512-byte blocks), `k`,
/// `m`, `g` or `t` (powers of 1024). A `0x` prefix selects hex.
pub fn parse_size(arg: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::UnknownValue {
        field: "size",
        value: arg.to_string(),
    };
    let trimmed = arg.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).map_err(|_| invalid());
    }

    let lower = trimmed.to_ascii_lowercase();
    let (digits, multiplier) = match lower.chars().last() {
        Some('b') => (&lower[..lower.len() - 1], 512u64),
        Some('k') => (&lower[..lower.len() - 1], 1 << 10),
        Some('m') => (&lower[..lower.len() - 1], 1 << 20),
        Some('g') => (&lower[..lower.len() - 1], 1 << 30),
        Some('t') => (&lower[..lower.len() - 1], 1 << 40),
        _ => (lower.as_str(), 1),
    };
    digits
        .parse::<u64>()
        .map_err(|_| invalid())?
        .checked_mul(multiplier)
        .ok_or_else(invalid)
}

pub fn parse_access(arg: &str) -> Result<AccessPattern, ConfigError> {
    match arg.to_lowercase().as_str() {
        "seq" | "sequential" => Ok(AccessPattern::Sequential),
        "random" => Ok(AccessPattern::Random),
        other => Err(ConfigError::UnknownValue {
            field: "access",
            value: other.to_string(),
        }),
    }
}

pub fn parse_mode(arg: &str) -> Result<IoMode, ConfigError> {
    match arg.to_lowercase().as_str() {
        "readwrite" | "rw" => Ok(IoMode::ReadWrite),
        "write" | "writeonly" => Ok(IoMode::WriteOnly),
        "read" | "readonly" => Ok(IoMode::ReadOnly),
        other => Err(ConfigError::UnknownValue {
            field: "mode",
            value: other.to_string(),
        }),
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        Ok(PathBuf::from(xdg_config_home)
            .join("dtverify")
            .join("config.toml"))
    } else if let Ok(home) = std::env::var("HOME") {
        Ok(PathBuf::from(home)
            .join(".config")
            .join("dtverify")
            .join("config.toml"))
    } else {
        Err(anyhow::anyhow!("Could not determine config directory"))
    }
}

/// Loads the user config, or the built-in defaults when none exists.
pub fn load_config() -> Result<ConfigFile> {
    let config_path = get_config_path()?;
    if config_path.exists() {
        load_config_from(&config_path)
    } else {
        Ok(ConfigFile::default())
    }
}

pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn create_default_config(path: &Path) -> Result<()> {
    let default_config = ConfigFile::default();
    let config_str =
        toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }

    fs::write(path, config_str)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    println!("📝 Created default config file: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_creation() -> Result<()> {
        let temp_dir = tempdir()?;
        let config_path = temp_dir.path().join("dtverify").join("config.toml");

        create_default_config(&config_path)?;
        assert!(config_path.exists());

        let config = load_config_from(&config_path)?;
        assert!(config.defaults.progress);
        assert_eq!(config.pattern.kind, "numeric");
        assert_eq!(config.encoding.lbdata_size, 512);
        assert_eq!(config.workload.request_size, "64k");
        assert_eq!(config.reread.retry_delay_ms, 1000);
        Ok(())
    }

    #[test]
    fn test_partial_config_uses_defaults() -> Result<()> {
        let config: ConfigFile = toml::from_str(
            r#"
            [encoding]
            iot = true
            prefix = "run-7"

            [workload]
            workers = 3
            total_range = "16m"
            access = "random"
            "#,
        )?;

        let exercise = config.exercise_config(PathBuf::from("/tmp/target"))?;
        assert!(exercise.encoding.iot);
        assert_eq!(exercise.encoding.prefix.as_deref(), Some(&b"run-7"[..]));
        assert_eq!(exercise.encoding.iot_seed, DEFAULT_IOT_SEED);
        assert_eq!(exercise.workload.workers, 3);
        assert_eq!(exercise.workload.total_range, 16 << 20);
        assert_eq!(exercise.workload.request_size, 64 * 1024);
        assert_eq!(exercise.workload.access, AccessPattern::Random);
        assert_eq!(exercise.reread.retry_delay, Duration::from_secs(1));
        assert_eq!(exercise.pattern, PatternSource::default());
        Ok(())
    }

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(
            parse_pattern("0x39027654"),
            Ok(PatternSource::Numeric {
                value: 0x3902_7654,
                width: 4
            })
        );
        assert_eq!(
            parse_pattern("0xA5"),
            Ok(PatternSource::Numeric {
                value: 0xa5,
                width: 1
            })
        );
        assert_eq!(
            parse_pattern("0x123"),
            Ok(PatternSource::Numeric {
                value: 0x123,
                width: 2
            })
        );
        assert_eq!(parse_pattern("INCR"), Ok(PatternSource::Incrementing));
        assert_eq!(
            parse_pattern("file:/tmp/p.bin"),
            Ok(PatternSource::File(PathBuf::from("/tmp/p.bin")))
        );
        assert_eq!(
            parse_pattern("text:0xnot"),
            Ok(PatternSource::Text("0xnot".to_string()))
        );
        assert_eq!(
            parse_pattern("hello"),
            Ok(PatternSource::Text("hello".to_string()))
        );
        assert!(parse_pattern("0x123456789").is_err());
        assert!(parse_pattern("0xzz").is_err());
        assert_eq!(parse_pattern(""), Err(ConfigError::EmptyPattern));
    }

    #[test]
    fn test_size_parsing() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("8b"), Ok(4096));
        assert_eq!(parse_size("64k"), Ok(65536));
        assert_eq!(parse_size("64K"), Ok(65536));
        assert_eq!(parse_size("2m"), Ok(2 << 20));
        assert_eq!(parse_size("1g"), Ok(1 << 30));
        assert_eq!(parse_size("0x200"), Ok(512));
        assert!(parse_size("k").is_err());
        assert!(parse_size("12q").is_err());
        assert!(parse_size("99999999999t").is_err());
    }

    #[test]
    fn test_access_and_mode_parsing() {
        assert_eq!(parse_access("SEQ"), Ok(AccessPattern::Sequential));
        assert_eq!(parse_access("random"), Ok(AccessPattern::Random));
        assert!(parse_access("diagonal").is_err());
        assert_eq!(parse_mode("read"), Ok(IoMode::ReadOnly));
        assert_eq!(parse_mode("rw"), Ok(IoMode::ReadWrite));
        assert!(parse_mode("append").is_err());
    }

    #[test]
    fn test_pattern_section_round_trips_source() {
        let mut section = PatternConfig {
            buffer_size: 4096,
            ..Default::default()
        };
        section.set_source(PatternSource::Text("abc".to_string()));
        assert_eq!(section.buffer_size, 4096);
        assert_eq!(section.source(), Ok(PatternSource::Text("abc".to_string())));

        section.set_source(PatternSource::Numeric {
            value: 0xff,
            width: 1,
        });
        assert_eq!(section.kind, "numeric");
        assert_eq!(section.text, None);

        section.kind = "bogus".to_string();
        assert!(section.source().is_err());
    }
}
