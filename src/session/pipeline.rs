//! Acquisition pipeline: fetch, transcode, finalize.
//!
//! Each session gets one spawned task that walks it from `Created` to
//! `Ready`, or to `Failed` with its storage already wiped. Cancellation
//! (close, expiry, shutdown) stops the task between or during phases; the
//! running fetch or engine process is abandoned and killed.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vidrelay_av::{TranscodeJob, Transcoder};
use vidrelay_common::{Error, Result, SessionId};

use super::registry::{SessionFailure, SessionRegistry, SessionState};
use super::storage::{SessionPaths, StorageLayout};
use crate::source::{HttpFetcher, SourceRequest};

pub struct AcquisitionPipeline {
    registry: Arc<SessionRegistry>,
    storage: StorageLayout,
    fetcher: HttpFetcher,
    transcoder: Arc<dyn Transcoder>,
    segment_duration: u32,
}

impl AcquisitionPipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        storage: StorageLayout,
        fetcher: HttpFetcher,
        transcoder: Arc<dyn Transcoder>,
        segment_duration: u32,
    ) -> Self {
        Self {
            registry,
            storage,
            fetcher,
            transcoder,
            segment_duration,
        }
    }

    /// Run the pipeline for one session on its own task.
    pub fn spawn(
        self: &Arc<Self>,
        id: SessionId,
        source: SourceRequest,
        paths: SessionPaths,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.run(&id, &source, &paths, &cancel).await })
    }

    pub async fn run(
        &self,
        id: &SessionId,
        source: &SourceRequest,
        paths: &SessionPaths,
        cancel: &CancellationToken,
    ) {
        match self.acquire(id, source, paths, cancel).await {
            Ok(()) => {}
            Err(e) if cancel.is_cancelled() => {
                tracing::debug!(session_id = %id, error = %e, "Acquisition abandoned");
                // Whoever cancelled owns cleanup; this only catches late writes.
                if let Err(e) = self.storage.remove(id).await {
                    tracing::debug!(session_id = %id, error = %e, "Late storage removal failed");
                }
            }
            Err(e) => self.fail(id, e).await,
        }
    }

    async fn acquire(
        &self,
        id: &SessionId,
        source: &SourceRequest,
        paths: &SessionPaths,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.registry
            .transition(id, SessionState::Downloading, |_| {})?;

        let started = Instant::now();
        let bytes = self
            .fetcher
            .fetch(source, &paths.staging, cancel)
            .await
            .map_err(|e| match e {
                Error::Fetch(_) => e,
                other => Error::Fetch(other.to_string()),
            })?;
        tracing::info!(
            session_id = %id,
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Source fetched"
        );

        self.registry
            .transition(id, SessionState::Transcoding, |_| {})?;

        let started = Instant::now();
        let job = TranscodeJob {
            input: paths.staging.clone(),
            output_dir: paths.output_dir.clone(),
            segment_duration: self.segment_duration,
        };
        let output = self
            .transcoder
            .transcode(&job, cancel)
            .await
            .map_err(|e| match e {
                Error::Encoding(_) => e,
                other => Error::Encoding(other.to_string()),
            })?;

        if let Err(e) = tokio::fs::remove_file(&paths.staging).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to remove staged source");
        }

        let manifest = output.manifest.clone();
        self.registry
            .transition(id, SessionState::Ready, move |record| {
                record.output = Some(manifest)
            })?;

        tracing::info!(
            session_id = %id,
            engine = self.transcoder.name(),
            segments = output.segments,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session ready"
        );
        Ok(())
    }

    /// Wipe storage first, then mark the session failed, so anyone woken by
    /// the state change sees no leftover files.
    async fn fail(&self, id: &SessionId, err: Error) {
        tracing::error!(session_id = %id, error = %err, "Acquisition failed");

        if let Err(e) = self.storage.remove(id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to remove storage of failed session");
        }

        let failure = SessionFailure::from_error(&err);
        if let Err(e) = self
            .registry
            .transition(id, SessionState::Failed, move |record| {
                record.failure = Some(failure)
            })
        {
            tracing::debug!(session_id = %id, error = %e, "Could not mark session failed");
        }
    }
}
