//! Authoritative in-memory map of session id to session record.
//!
//! Every state change goes through [`SessionRegistry::transition`], which
//! checks the current state under the entry lock before applying the new one.
//! Cleanup is claimed exactly once per session via
//! [`SessionRegistry::claim_cleanup`], so concurrent idle, sweep and close
//! triggers cannot double-release anything.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vidrelay_common::{Error, Result, SessionId};

use super::gate::AcquisitionSlot;
use super::janitor::CleanupReason;
use crate::source::SourceRequest;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Downloading,
    Transcoding,
    Ready,
    Failed,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Downloading => "downloading",
            SessionState::Transcoding => "transcoding",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }

    /// No further transitions or disk writes happen once terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// Still on the acquisition path, i.e. holding a gate slot.
    pub fn is_acquiring(self) -> bool {
        matches!(
            self,
            SessionState::Created | SessionState::Downloading | SessionState::Transcoding
        )
    }

    /// The acquisition pipeline has nothing left to do.
    pub fn is_settled(self) -> bool {
        !self.is_acquiring()
    }

    /// Whether `self -> next` is an edge of the state graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Downloading) | (Downloading, Transcoding) | (Transcoding, Ready) => true,
            (Downloading | Transcoding, Failed) => true,
            (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    /// Machine-readable error code (`fetch_error`, `encoding_error`).
    pub code: String,
    pub message: String,
}

impl SessionFailure {
    pub fn from_error(err: &Error) -> Self {
        let message = match err {
            Error::Fetch(m) | Error::Encoding(m) => m.clone(),
            other => other.to_string(),
        };
        Self {
            code: err.code().to_string(),
            message,
        }
    }

    /// Rebuild the error this failure was recorded from.
    pub fn to_error(&self) -> Error {
        match self.code.as_str() {
            "fetch_error" => Error::Fetch(self.message.clone()),
            "encoding_error" => Error::Encoding(self.message.clone()),
            _ => Error::Internal(self.message.clone()),
        }
    }
}

/// Mutable bookkeeping for one session. Only reachable through the registry.
#[derive(Debug)]
pub struct SessionRecord {
    pub(crate) id: SessionId,
    pub(crate) source: SourceRequest,
    pub(crate) content_id: String,
    pub(crate) quality: String,
    pub(crate) storage_root: PathBuf,
    pub(crate) state: SessionState,
    pub(crate) created_at: Instant,
    pub(crate) created_wall: DateTime<Utc>,
    pub(crate) last_access_at: Instant,
    pub(crate) last_access_wall: DateTime<Utc>,
    /// Manifest path, set on `Ready`.
    pub(crate) output: Option<PathBuf>,
    pub(crate) failure: Option<SessionFailure>,
    slot: Option<AcquisitionSlot>,
    cancel: CancellationToken,
    cleanup_claimed: bool,
    state_tx: watch::Sender<SessionState>,
}

impl SessionRecord {
    pub fn new(
        id: SessionId,
        source: SourceRequest,
        content_id: impl Into<String>,
        quality: impl Into<String>,
        storage_root: PathBuf,
        slot: AcquisitionSlot,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        let wall = Utc::now();
        let (state_tx, _) = watch::channel(SessionState::Created);
        Self {
            id,
            source,
            content_id: content_id.into(),
            quality: quality.into(),
            storage_root,
            state: SessionState::Created,
            created_at: now,
            created_wall: wall,
            last_access_at: now,
            last_access_wall: wall,
            output: None,
            failure: None,
            slot: Some(slot),
            cancel,
            cleanup_claimed: false,
            state_tx,
        }
    }

    fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }

    fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            source_url: self.source.url.clone(),
            content_id: self.content_id.clone(),
            quality: self.quality.clone(),
            state: self.state,
            created_at: self.created_wall,
            last_access_at: self.last_access_wall,
            age_secs: self.created_at.elapsed().as_secs(),
            idle_secs: self.last_access_at.elapsed().as_secs(),
            failure: self.failure.clone(),
            manifest: self.output.clone(),
            storage_root: self.storage_root.clone(),
        }
    }
}

/// Read-only snapshot of a session. Request headers are not exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub source_url: String,
    pub content_id: String,
    pub quality: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SessionFailure>,
    #[serde(skip)]
    pub manifest: Option<PathBuf>,
    #[serde(skip)]
    pub storage_root: PathBuf,
}

/// What a successful cleanup claim hands back to the janitor.
#[derive(Debug)]
pub struct CleanupTicket {
    /// State the session was in when cleanup was claimed.
    pub previous: SessionState,
    /// The gate slot, if the session still held one.
    pub slot: Option<AcquisitionSlot>,
    pub age: Duration,
}

/// Thread-safe session map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created record.
    ///
    /// A `Failed` record with the same id is replaced. Anything else still
    /// alive (including a record whose cleanup is running) is a duplicate.
    pub fn insert(&self, record: SessionRecord) -> Result<()> {
        match self.sessions.entry(record.id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if !existing.state.is_terminal() || existing.cleanup_claimed {
                    return Err(Error::DuplicateInFlight(record.id.to_string()));
                }
                entry.insert(record);
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
        Ok(())
    }

    /// True when `id` names a session that would block a new insert.
    pub fn is_live(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|r| !r.state.is_terminal() || r.cleanup_claimed)
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionView> {
        self.sessions.get(id).map(|r| r.view())
    }

    /// Record a playback access. Returns false if the session is absent or
    /// terminal, in which case nothing changes.
    pub fn touch(&self, id: &SessionId) -> bool {
        let Some(mut record) = self.sessions.get_mut(id) else {
            return false;
        };
        if record.state.is_terminal() || record.cleanup_claimed {
            return false;
        }
        let now = Instant::now();
        if now > record.last_access_at {
            record.last_access_at = now;
            record.last_access_wall = Utc::now();
        }
        true
    }

    /// Move `id` to `to`, then let `update` fill in state-specific fields.
    ///
    /// Settling (`Ready`/`Failed`/`Closed`) drops the gate slot and restarts
    /// the idle clock. Returns the previous state.
    pub fn transition(
        &self,
        id: &SessionId,
        to: SessionState,
        update: impl FnOnce(&mut SessionRecord),
    ) -> Result<SessionState> {
        let mut record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::not_found("session", id))?;

        let from = record.state;
        if record.cleanup_claimed || !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        record.state = to;
        update(&mut *record);
        if to.is_settled() {
            record.slot = None;
            record.last_access_at = Instant::now();
            record.last_access_wall = Utc::now();
        }
        record.state_tx.send_replace(to);

        tracing::debug!(session_id = %id, from = %from, to = %to, "Session state changed");
        Ok(from)
    }

    /// Claim the right to clean up `id`.
    ///
    /// The first caller gets a ticket; the session is marked `Closed` unless
    /// already terminal and its cancellation token fires so any running
    /// pipeline stops writing. Later callers get `None`.
    pub fn claim_cleanup(&self, id: &SessionId) -> Option<CleanupTicket> {
        let mut record = self.sessions.get_mut(id)?;
        if record.cleanup_claimed {
            return None;
        }
        record.cleanup_claimed = true;

        let previous = record.state;
        if !previous.is_terminal() {
            record.state = SessionState::Closed;
            record.state_tx.send_replace(SessionState::Closed);
        }
        record.cancel.cancel();

        Some(CleanupTicket {
            previous,
            slot: record.slot.take(),
            age: record.created_at.elapsed(),
        })
    }

    /// Drop the map entry. Files are the janitor's business.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Snapshot of every session, oldest first.
    pub fn list(&self) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self.sessions.iter().map(|r| r.view()).collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    pub fn ids(&self) -> HashSet<SessionId> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions currently holding a gate slot.
    pub fn acquiring_count(&self) -> usize {
        self.sessions.iter().filter(|r| r.holds_slot()).count()
    }

    /// Sessions due for cleanup. Age is checked for every session; idleness
    /// only once the session has settled.
    pub fn expired(&self, idle: Duration, max_age: Duration) -> Vec<(SessionId, CleanupReason)> {
        self.sessions
            .iter()
            .filter(|r| !r.cleanup_claimed)
            .filter_map(|r| {
                if r.created_at.elapsed() > max_age {
                    Some((r.key().clone(), CleanupReason::MaxAge))
                } else if r.state.is_settled() && r.last_access_at.elapsed() >= idle {
                    Some((r.key().clone(), CleanupReason::Idle))
                } else {
                    None
                }
            })
            .collect()
    }

    /// When the idle timer for `id` should next look at it.
    ///
    /// Acquiring sessions are never idle; their deadline is pushed a full
    /// interval out. `None` means the timer has nothing left to watch.
    pub fn idle_deadline(&self, id: &SessionId, idle: Duration) -> Option<Instant> {
        let record = self.sessions.get(id)?;
        if record.cleanup_claimed {
            return None;
        }
        if record.state.is_acquiring() {
            Some(Instant::now() + idle)
        } else {
            Some(record.last_access_at + idle)
        }
    }

    /// Watch state changes of `id`.
    pub fn subscribe(&self, id: &SessionId) -> Option<watch::Receiver<SessionState>> {
        self.sessions.get(id).map(|r| r.state_tx.subscribe())
    }

    /// Manifest path of a `Ready` session.
    pub fn ready_output(&self, id: &SessionId) -> Result<PathBuf> {
        let record = self
            .sessions
            .get(id)
            .ok_or_else(|| Error::not_found("session", id))?;

        match record.state {
            SessionState::Ready => record
                .output
                .clone()
                .ok_or_else(|| Error::Internal(format!("session {id} is ready without output"))),
            SessionState::Closed => Err(Error::not_found("session", id)),
            SessionState::Failed => {
                let reason = record
                    .failure
                    .as_ref()
                    .map(|f| f.message.as_str())
                    .unwrap_or("unknown error");
                Err(Error::NotReady(format!("session {id} failed: {reason}")))
            }
            state => Err(Error::NotReady(format!("session {id} is {state}"))),
        }
    }
}
