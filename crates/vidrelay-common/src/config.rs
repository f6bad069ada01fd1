//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries the
//! server, session, fetch and tool sections. Every section defaults sensibly
//! so a completely empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::Error;

/// Default user agent sent to source sites when the caller supplies none.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub fetch: FetchConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Check for settings that make the session core unusable.
    ///
    /// Returns the first hard error found. Non-fatal issues are reported by
    /// [`Config::warnings`].
    pub fn validate(&self) -> Result<()> {
        let s = &self.sessions;
        if s.max_concurrent_acquisitions == 0 {
            return Err(Error::Validation(
                "sessions.max_concurrent_acquisitions must be at least 1".into(),
            ));
        }
        if s.segment_duration_secs == 0 {
            return Err(Error::Validation(
                "sessions.segment_duration_secs must be at least 1".into(),
            ));
        }
        if s.idle_timeout_secs == 0 || s.max_session_age_secs == 0 || s.sweep_interval_secs == 0 {
            return Err(Error::Validation(
                "sessions.idle_timeout_secs, max_session_age_secs and sweep_interval_secs must be non-zero"
                    .into(),
            ));
        }
        if s.storage_root.as_os_str().is_empty() {
            return Err(Error::Validation("sessions.storage_root is empty".into()));
        }
        if self.fetch.timeout_secs == 0 || self.fetch.read_timeout_secs == 0 {
            return Err(Error::Validation(
                "fetch.timeout_secs and read_timeout_secs must be non-zero".into(),
            ));
        }
        if self.fetch.max_source_bytes == 0 {
            return Err(Error::Validation("fetch.max_source_bytes must be non-zero".into()));
        }
        Ok(())
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let s = &self.sessions;

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if s.idle_timeout_secs >= s.max_session_age_secs {
            warnings.push(format!(
                "sessions.idle_timeout_secs ({}) >= max_session_age_secs ({}); the idle timer will never fire first",
                s.idle_timeout_secs, s.max_session_age_secs
            ));
        }

        if s.sweep_interval_secs > s.max_session_age_secs {
            warnings.push(format!(
                "sessions.sweep_interval_secs ({}) exceeds max_session_age_secs ({}); sessions may outlive their age ceiling by a full sweep period",
                s.sweep_interval_secs, s.max_session_age_secs
            ));
        }

        if self.fetch.timeout_secs < self.fetch.connect_timeout_secs {
            warnings.push("fetch.timeout_secs is shorter than fetch.connect_timeout_secs".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// Session lifecycle and storage settings. Fixed at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_concurrent_acquisitions: usize,
    pub idle_timeout_secs: u64,
    pub max_session_age_secs: u64,
    pub sweep_interval_secs: u64,
    pub segment_duration_secs: u32,
    pub storage_root: PathBuf,
    /// Delete leftover session directories at startup.
    pub reconcile_on_startup: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_acquisitions: 2,
            idle_timeout_secs: 300,
            max_session_age_secs: 3600,
            sweep_interval_secs: 300,
            segment_duration_secs: 6,
            storage_root: PathBuf::from("/tmp/vidrelay"),
            reconcile_on_startup: true,
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Remote source download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub connect_timeout_secs: u64,
    /// Upper bound on the whole download, headers to last byte.
    pub timeout_secs: u64,
    /// Longest gap allowed between two body chunks.
    pub read_timeout_secs: u64,
    pub max_source_bytes: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            timeout_secs: 600,
            read_timeout_secs: 30,
            max_source_bytes: 8 * 1024 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.into(),
        }
    }
}

impl FetchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Paths and limits for external CLI tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub transcode_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            transcode_timeout_secs: 1800,
        }
    }
}
