//! Data-pattern verification for storage exercisers.
//!
//! Write buffers are filled from a circular [`PatternBuffer`] through an
//! [`Encoder`] (plain, prefixed, block-addressed or tagged), read buffers
//! are checked by a [`Verifier`] that reports the first differing byte,
//! and random-access mismatches can be re-read to tell write faults from
//! read faults. [`Exerciser`] drives all of it over disjoint worker slices.

pub mod config;
pub mod encoding;
pub mod error;
pub mod io;
pub mod patterns;
pub mod reread;
pub mod slice;
pub mod storage;
pub mod verify;

pub use anyhow::{Error, Result};

pub use encoding::btag::{BasicTagCodec, TagCodec, TagContext};
pub use encoding::{Encoder, EncodingConfig, RequestInfo, Strategy};
pub use error::{ConfigError, SliceError};
pub use io::{ExerciseConfig, Exerciser, IoMode, RunSummary, WorkloadConfig};
pub use patterns::{PatternBuffer, PatternSource};
pub use reread::{CancelToken, Diagnosis, Diagnostician, RereadOptions, RereadReport};
pub use slice::{make_slices, SliceDescriptor};
pub use verify::report::{MismatchKind, MismatchReport};
pub use verify::{AccessPattern, Verdict, Verifier, VerifyOptions};
