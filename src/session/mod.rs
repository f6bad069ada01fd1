//! Transcode session management.
//!
//! A session turns one remote video into a disposable HLS stream:
//!
//! 1. [`SessionManager::create_session`] takes a gate slot, reserves storage,
//!    registers the session and spawns its acquisition pipeline.
//! 2. The pipeline downloads the source, runs the transcoder and marks the
//!    session `Ready` (releasing the slot) or `Failed`.
//! 3. Playback reads ([`SessionManager::manifest`], [`SessionManager::segment`])
//!    touch the session to keep it alive.
//! 4. The janitor deletes it on idle timeout, maximum age, explicit close or
//!    shutdown.

pub mod gate;
pub mod janitor;
pub mod pipeline;
pub mod registry;
pub mod storage;

pub use gate::{AcquisitionSlot, ConcurrencyGate};
pub use janitor::{CleanupReason, Janitor};
pub use pipeline::AcquisitionPipeline;
pub use registry::{SessionFailure, SessionRegistry, SessionState, SessionView};
pub use storage::{SessionPaths, StorageLayout};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vidrelay_av::{FfmpegTranscoder, ToolRegistry, Transcoder};
use vidrelay_common::config::{Config, SessionsConfig};
use vidrelay_common::{Error, Result, SessionId};

use crate::source::{HttpFetcher, SourceRequest};
use self::registry::SessionRecord;

/// Runtime session settings, fixed at startup.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_concurrent_acquisitions: usize,
    pub idle_timeout: Duration,
    pub max_session_age: Duration,
    pub sweep_interval: Duration,
    pub segment_duration_secs: u32,
    pub storage_root: PathBuf,
}

impl SessionSettings {
    pub fn from_config(config: &SessionsConfig) -> Self {
        Self {
            max_concurrent_acquisitions: config.max_concurrent_acquisitions,
            idle_timeout: config.idle_timeout(),
            max_session_age: config.max_session_age(),
            sweep_interval: config.sweep_interval(),
            segment_duration_secs: config.segment_duration_secs,
            storage_root: config.storage_root.clone(),
        }
    }

    /// Reject settings the gate or the timers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_acquisitions == 0
            || self.max_concurrent_acquisitions > Semaphore::MAX_PERMITS
        {
            return Err(Error::Validation(format!(
                "max_concurrent_acquisitions must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_concurrent_acquisitions
            )));
        }
        if self.idle_timeout.is_zero()
            || self.max_session_age.is_zero()
            || self.sweep_interval.is_zero()
        {
            return Err(Error::Validation(
                "idle_timeout, max_session_age and sweep_interval must be non-zero".into(),
            ));
        }
        if self.segment_duration_secs == 0 {
            return Err(Error::Validation("segment_duration_secs must be at least 1".into()));
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(Error::Validation("storage_root is empty".into()));
        }
        Ok(())
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SessionsConfig::default())
    }
}

/// Facade over registry, gate, storage, pipeline and janitor.
pub struct SessionManager {
    settings: SessionSettings,
    registry: Arc<SessionRegistry>,
    gate: ConcurrencyGate,
    storage: StorageLayout,
    pipeline: Arc<AcquisitionPipeline>,
    janitor: Janitor,
}

impl SessionManager {
    /// # Errors
    ///
    /// [`Error::Validation`] if `settings` fail [`SessionSettings::validate`].
    pub fn new(
        settings: SessionSettings,
        fetcher: HttpFetcher,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self> {
        settings.validate()?;
        let registry = Arc::new(SessionRegistry::new());
        let storage = StorageLayout::new(settings.storage_root.clone());
        let gate = ConcurrencyGate::new(settings.max_concurrent_acquisitions);
        let pipeline = Arc::new(AcquisitionPipeline::new(
            Arc::clone(&registry),
            storage.clone(),
            fetcher,
            transcoder,
            settings.segment_duration_secs,
        ));
        let janitor = Janitor::new(
            Arc::clone(&registry),
            storage.clone(),
            settings.idle_timeout,
            settings.max_session_age,
        );

        Ok(Self {
            settings,
            registry,
            gate,
            storage,
            pipeline,
            janitor,
        })
    }

    /// Build a manager backed by the real HTTP fetcher and ffmpeg.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.fetch)?;
        let tools = ToolRegistry::discover(&config.tools);
        let transcoder = FfmpegTranscoder::from_registry(
            &tools,
            Duration::from_secs(config.tools.transcode_timeout_secs),
        )?;
        Self::new(
            SessionSettings::from_config(&config.sessions),
            fetcher,
            Arc::new(transcoder),
        )
    }

    /// Start a new session and return its id as soon as storage is reserved.
    ///
    /// The download and transcode run in the background; use
    /// [`SessionManager::wait_settled`] to block until they finish.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a bad source, [`Error::CapacityExceeded`]
    /// when the gate is full (nothing is allocated in that case), and
    /// [`Error::DuplicateInFlight`] on an id collision with a live session.
    pub async fn create_session(
        &self,
        source: SourceRequest,
        content_id: &str,
        quality: &str,
    ) -> Result<SessionId> {
        source.validate()?;
        let slot = self.gate.try_acquire()?;

        let id = SessionId::generate(&source.url, content_id, quality);
        if self.registry.is_live(&id) {
            return Err(Error::DuplicateInFlight(id.to_string()));
        }

        let paths = self.storage.reserve(&id).await?;
        let cancel = CancellationToken::new();
        let record = SessionRecord::new(
            id.clone(),
            source.clone(),
            content_id,
            quality,
            paths.root.clone(),
            slot,
            cancel.clone(),
        );
        if let Err(e) = self.registry.insert(record) {
            if let Err(rm) = self.storage.remove(&id).await {
                tracing::warn!(session_id = %id, error = %rm, "Failed to release reserved storage");
            }
            return Err(e);
        }

        self.janitor.schedule_idle(id.clone(), cancel.clone());
        self.pipeline.spawn(id.clone(), source, paths, cancel);

        tracing::info!(
            session_id = %id,
            content_id,
            quality,
            in_flight = self.gate.in_flight(),
            "Session created"
        );
        Ok(id)
    }

    /// Snapshot of a session. Does not count as an access.
    pub fn get(&self, id: &SessionId) -> Result<SessionView> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::not_found("session", id))
    }

    /// Manifest path of a ready session; counts as an access.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown or cleaned-up sessions,
    /// [`Error::NotReady`] while acquiring or after failure.
    pub fn manifest(&self, id: &SessionId) -> Result<PathBuf> {
        let manifest = self.registry.ready_output(id)?;
        self.registry.touch(id);
        Ok(manifest)
    }

    /// Path of one segment (or init file) of a ready session; counts as an
    /// access. Anything not servable yet is [`Error::NotFound`].
    pub async fn segment(&self, id: &SessionId, name: &str) -> Result<PathBuf> {
        self.registry.ready_output(id).map_err(|e| match e {
            Error::NotReady(_) => Error::not_found("segment", name),
            other => other,
        })?;

        let path = self.storage.segment_path(id, name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(Error::not_found("segment", name)),
        }

        self.registry.touch(id);
        Ok(path)
    }

    /// Keep a session alive. Unknown or finished sessions are ignored.
    pub fn touch(&self, id: &SessionId) -> bool {
        self.registry.touch(id)
    }

    /// Release a session early. Closing an unknown or already closed
    /// session is a no-op that returns false.
    pub async fn close(&self, id: &SessionId) -> bool {
        self.janitor.cleanup(id, CleanupReason::Closed).await
    }

    pub fn list_active(&self) -> Vec<SessionView> {
        self.registry.list()
    }

    /// Wait until the session has left the acquisition path.
    ///
    /// # Errors
    ///
    /// The recorded [`Error::Fetch`] or [`Error::Encoding`] if the session
    /// failed, [`Error::NotFound`] if it is unknown or was cleaned up.
    pub async fn wait_settled(&self, id: &SessionId) -> Result<SessionView> {
        let mut rx = self
            .registry
            .subscribe(id)
            .ok_or_else(|| Error::not_found("session", id))?;

        let state = *rx
            .wait_for(|state| state.is_settled())
            .await
            .map_err(|_| Error::not_found("session", id))?;

        match state {
            SessionState::Ready => self.get(id),
            SessionState::Failed => {
                let view = self.get(id)?;
                Err(view
                    .failure
                    .map(|f| f.to_error())
                    .unwrap_or_else(|| Error::Internal(format!("session {id} failed"))))
            }
            _ => Err(Error::not_found("session", id)),
        }
    }

    /// One pass of the expiry sweep.
    pub async fn sweep(&self) -> usize {
        self.janitor.sweep().await
    }

    /// Spawn the periodic sweep, stopped by `shutdown`.
    pub fn start_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.janitor
            .clone()
            .start_sweep_task(self.settings.sweep_interval, shutdown)
    }

    /// Delete storage entries that belong to no registered session.
    pub async fn reconcile_storage(&self) -> Result<usize> {
        let live = self.registry.ids();
        let removed = self.storage.reconcile(&live).await?;
        if removed > 0 {
            tracing::info!(removed, root = %self.storage.root().display(), "Reconciled session storage");
        }
        Ok(removed)
    }

    /// Close every session. Returns how many were cleaned up.
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for id in self.registry.ids() {
            if self.janitor.cleanup(&id, CleanupReason::Shutdown).await {
                closed += 1;
            }
        }
        tracing::info!(closed, "Sessions closed for shutdown");
        closed
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Sessions currently holding a gate slot.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn capacity(&self) -> usize {
        self.gate.capacity()
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }
}
