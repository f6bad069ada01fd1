//! HLS segmenting of a staged source file.
//!
//! The session core only sees the [`Transcoder`] trait; [`FfmpegTranscoder`]
//! is the production engine and runs ffmpeg with `-c copy`, so nothing is
//! re-encoded. Produces:
//! - `<output_dir>/index.m3u8`: HLS playlist
//! - `<output_dir>/init.mp4`: fMP4 initialization segment
//! - `<output_dir>/seg0000.m4s`, `seg0001.m4s`, ...: media segments

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vidrelay_common::{Error, Result};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// File name of the playlist written into the output directory.
pub const MANIFEST_NAME: &str = "index.m3u8";

/// fMP4 init segment file name.
const INIT_NAME: &str = "init.mp4";

/// Extensions counted as media segments when inspecting output.
const SEGMENT_EXTENSIONS: &[&str] = &["m4s", "ts"];

/// Inputs for one transcode run.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// Staged source file.
    pub input: PathBuf,
    /// Directory that receives the manifest and segments. Must exist.
    pub output_dir: PathBuf,
    /// Target segment length in seconds.
    pub segment_duration: u32,
}

/// What a successful transcode left on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOutput {
    /// Path of the HLS manifest.
    pub manifest: PathBuf,
    /// Number of media segments found next to the manifest.
    pub segments: usize,
}

/// A transcoding engine that turns one input file into HLS output.
///
/// Implementations must stop promptly and return an error once `cancel`
/// fires. Any failure is reported as [`Error::Encoding`].
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Engine name used in log lines.
    fn name(&self) -> &str;

    /// Run the engine for `job`.
    async fn transcode(&self, job: &TranscodeJob, cancel: &CancellationToken) -> Result<TranscodeOutput>;
}

/// Production engine backed by the ffmpeg CLI.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    /// Use an explicit ffmpeg binary.
    pub fn new(ffmpeg: PathBuf, timeout: Duration) -> Self {
        Self { ffmpeg, timeout }
    }

    /// Use the ffmpeg found by tool discovery.
    pub fn from_registry(tools: &ToolRegistry, timeout: Duration) -> Result<Self> {
        let ffmpeg = tools.require("ffmpeg")?;
        Ok(Self::new(ffmpeg.path.clone(), timeout))
    }

    /// Build the ffmpeg invocation for `job` without running it.
    pub fn command(&self, job: &TranscodeJob) -> ToolCommand {
        let seg_pattern = job.output_dir.join("seg%04d.m4s");
        let playlist_path = job.output_dir.join(MANIFEST_NAME);

        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.timeout(self.timeout);
        cmd.args(["-y", "-nostdin", "-i"]);
        cmd.arg(job.input.to_string_lossy().as_ref());
        cmd.args(["-c", "copy", "-f", "hls"]);
        cmd.args(["-hls_time", &job.segment_duration.to_string()]);
        cmd.args(["-hls_segment_type", "fmp4"]);
        cmd.args(["-hls_playlist_type", "vod"]);
        cmd.args(["-hls_segment_filename", &seg_pattern.to_string_lossy()]);
        cmd.args(["-hls_fmp4_init_filename", INIT_NAME]);
        cmd.arg(playlist_path.to_string_lossy().as_ref());
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn transcode(&self, job: &TranscodeJob, cancel: &CancellationToken) -> Result<TranscodeOutput> {
        tracing::info!(
            "HLS segment: {:?} -> {:?} (segment_duration={}s)",
            job.input,
            job.output_dir,
            job.segment_duration
        );

        let mut cmd = self.command(job);
        cmd.cancel_on(cancel.clone());
        cmd.execute().await.map_err(|e| match e {
            Error::Tool { message, .. } => Error::Encoding(format!("ffmpeg {message}")),
            other => Error::Encoding(other.to_string()),
        })?;

        inspect_output(&job.output_dir)
    }
}

/// Verify that `output_dir` holds a usable manifest and at least one segment.
///
/// # Errors
///
/// Returns [`Error::Encoding`] when the manifest is missing, empty, not an
/// M3U playlist, or when no segment files were written.
pub fn inspect_output(output_dir: &Path) -> Result<TranscodeOutput> {
    let manifest = output_dir.join(MANIFEST_NAME);

    let contents = std::fs::read_to_string(&manifest)
        .map_err(|e| Error::Encoding(format!("malformed output: cannot read manifest: {e}")))?;
    if !contents.trim_start().starts_with("#EXTM3U") {
        return Err(Error::Encoding("malformed output: manifest is not an M3U playlist".into()));
    }

    let entries = std::fs::read_dir(output_dir)
        .map_err(|e| Error::Encoding(format!("malformed output: cannot list output: {e}")))?;
    let segments = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SEGMENT_EXTENSIONS.contains(&ext))
        })
        .count();

    if segments == 0 {
        return Err(Error::Encoding("malformed output: no media segments written".into()));
    }

    Ok(TranscodeOutput { manifest, segments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn job(dir: &Path) -> TranscodeJob {
        TranscodeJob {
            input: dir.join("source"),
            output_dir: dir.join("output"),
            segment_duration: 4,
        }
    }

    #[test]
    fn command_uses_codec_copy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FfmpegTranscoder::new(PathBuf::from("/usr/bin/ffmpeg"), Duration::from_secs(60));
        let cmd = engine.command(&job(dir.path()));
        let args = cmd.get_args();

        let copy = args.iter().position(|a| a == "-c").unwrap();
        assert_eq!(args[copy + 1], "copy");
        let time = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[time + 1], "4");
        assert!(args.last().unwrap().ends_with("output/index.m3u8"));
    }

    #[test]
    fn inspect_output_accepts_manifest_and_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), "#EXTM3U\n#EXT-X-ENDLIST\n").unwrap();
        fs::write(dir.path().join("init.mp4"), b"init").unwrap();
        fs::write(dir.path().join("seg0000.m4s"), b"a").unwrap();
        fs::write(dir.path().join("seg0001.m4s"), b"b").unwrap();

        let out = inspect_output(dir.path()).unwrap();
        assert_eq!(out.segments, 2);
        assert_eq!(out.manifest, dir.path().join(MANIFEST_NAME));
    }

    #[test]
    fn inspect_output_rejects_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("seg0000.m4s"), b"a").unwrap();
        let err = inspect_output(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn inspect_output_rejects_garbage_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), "not a playlist").unwrap();
        fs::write(dir.path().join("seg0000.m4s"), b"a").unwrap();
        let err = inspect_output(dir.path()).unwrap_err();
        assert!(err.to_string().contains("not an M3U playlist"));
    }

    #[test]
    fn inspect_output_rejects_no_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), "#EXTM3U\n").unwrap();
        let err = inspect_output(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no media segments"));
    }

    #[tokio::test]
    async fn missing_binary_is_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("output")).unwrap();
        let engine = FfmpegTranscoder::new(
            PathBuf::from("/nonexistent/ffmpeg_xyz"),
            Duration::from_secs(5),
        );
        let err = engine
            .transcode(&job(dir.path()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }
}
