//! castwatch library
//!
//! A live-stream monitor and recorder: polls a single channel, captures
//! each broadcast with streamlink, validates and remuxes the result with
//! ffmpeg, and keeps watching.

pub mod cli;
pub mod config;
pub mod metadata;
pub mod monitor;
pub mod postprocess;
pub mod probe;
pub mod retry;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod tools;
pub mod validate;

pub use config::{Config, Quality};
pub use metadata::{MetadataResolver, SessionMetadata};
pub use probe::{LivenessProbe, LivenessVerdict, MediaLocator};
pub use session::{CancelToken, SessionContext, SessionLoop, SessionRunOutcome};
pub use storage::StorageManager;
pub use supervisor::{CaptureOutcome, CaptureSupervisor};
pub use validate::{ArtifactValidator, Validity};
