//! Session identifiers.
//!
//! A [`SessionId`] is derived from the content being requested plus a salt,
//! hashed with SHA-256 and truncated to 32 lowercase hex characters. The fixed
//! alphabet makes an id safe to use directly as a directory name.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of hex characters in a session id.
pub const SESSION_ID_LEN: usize = 32;

/// Process-wide counter mixed into the salt so two requests landing in the
/// same clock tick still get distinct ids.
static SALT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier of one transcode session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Derive an id from `(source_url, content_id, quality)` and an explicit salt.
    ///
    /// The same inputs and salt always produce the same id.
    #[must_use]
    pub fn derive(source_url: &str, content_id: &str, quality: &str, salt: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [source_url, content_id, quality, salt] {
            hasher.update(part.as_bytes());
            // Separator so ("ab", "c") and ("a", "bc") hash differently.
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        Self(digest[..SESSION_ID_LEN].to_string())
    }

    /// Derive a fresh id salted with the current time and a process counter.
    ///
    /// Repeated requests for the same content never collide, and never
    /// deduplicate either.
    #[must_use]
    pub fn generate(source_url: &str, content_id: &str, quality: &str) -> Self {
        let now = chrono::Utc::now();
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000));
        let seq = SALT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::derive(source_url, content_id, quality, &format!("{nanos}-{seq}"))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let valid = s.len() == SESSION_ID_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(crate::Error::not_found("session", s))
        }
    }
}

impl TryFrom<String> for SessionId {
    type Error = crate::Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = SessionId::derive("https://cdn/v.mp4", "ep-1", "1080p", "salt");
        let b = SessionId::derive("https://cdn/v.mp4", "ep-1", "1080p", "salt");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), SESSION_ID_LEN);
    }

    #[test]
    fn derive_depends_on_every_part() {
        let base = SessionId::derive("u", "c", "q", "s");
        assert_ne!(base, SessionId::derive("u2", "c", "q", "s"));
        assert_ne!(base, SessionId::derive("u", "c2", "q", "s"));
        assert_ne!(base, SessionId::derive("u", "c", "q2", "s"));
        assert_ne!(base, SessionId::derive("u", "c", "q", "s2"));
    }

    #[test]
    fn field_boundaries_matter() {
        assert_ne!(
            SessionId::derive("ab", "c", "", ""),
            SessionId::derive("a", "bc", "", "")
        );
    }

    #[test]
    fn generate_never_repeats() {
        let a = SessionId::generate("u", "c", "q");
        let b = SessionId::generate("u", "c", "q");
        assert_ne!(a, b);
    }

    #[test]
    fn parse_accepts_only_hex_ids() {
        let id = SessionId::generate("u", "c", "q");
        let parsed: SessionId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("../etc/passwd".parse::<SessionId>().is_err());
        assert!("ABCDEF".parse::<SessionId>().is_err());
        assert!("g".repeat(SESSION_ID_LEN).parse::<SessionId>().is_err());
    }

    #[test]
    fn serde_round_trips_as_plain_string() {
        let id = SessionId::derive("u", "c", "q", "s");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<SessionId>("\"nope\"").is_err());
    }
}
