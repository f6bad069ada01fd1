//! # vidrelay-av
//!
//! External transcoding engine integration for vidrelay.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache the path to ffmpeg.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout and
//!   cancellation support for running external processes.
//! - **Transcoding** ([`Transcoder`], [`FfmpegTranscoder`]) -- turn a staged
//!   source file into an HLS manifest plus fixed-duration segments using
//!   codec copy.

pub mod command;
pub mod tools;
pub mod transcode;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use transcode::{
    inspect_output, FfmpegTranscoder, TranscodeJob, TranscodeOutput, Transcoder, MANIFEST_NAME,
};
