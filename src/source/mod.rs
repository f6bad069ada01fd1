//! Remote source description and download.
//!
//! Per-site resolvers live outside this crate; whatever they resolve to is
//! handed over as a [`SourceRequest`]: a media URL plus the headers the
//! source site insists on (typically referer and user agent).

mod fetch;

pub use fetch::HttpFetcher;

use std::collections::BTreeMap;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use vidrelay_common::{Error, Result};

/// Headers forwarded to the source when downloading.
///
/// Names are stored lowercase so lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct RequestHeaders(BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for RequestHeaders {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.insert("referer", referer);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.insert("user-agent", user_agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn referer(&self) -> Option<&str> {
        self.get("referer")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.get("user-agent")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RequestHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A playable media URL and the headers needed to fetch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRequest {
    pub url: String,
    #[serde(default)]
    pub headers: RequestHeaders,
}

impl SourceRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: RequestHeaders::new(),
        }
    }

    pub fn with_headers(mut self, headers: RequestHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// Check that the URL is absolute http(s) and every header is valid on
    /// the wire.
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::Validation(format!("invalid source url {:?}: {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "unsupported source url scheme: {}",
                url.scheme()
            )));
        }

        for (name, value) in self.headers.iter() {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Validation(format!("invalid header name: {name:?}")))?;
            HeaderValue::from_str(value)
                .map_err(|_| Error::Validation(format!("invalid value for header {name}")))?;
        }

        Ok(url)
    }
}
