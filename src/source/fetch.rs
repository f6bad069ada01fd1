//! Streaming download of a remote source into a staging file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, USER_AGENT};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use vidrelay_common::config::FetchConfig;
use vidrelay_common::{Error, Result};

use super::SourceRequest;

/// Downloads sources over HTTP with connect, read, overall-time and size
/// limits.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    read_timeout: Duration,
    max_bytes: u64,
    default_user_agent: String,
}

impl HttpFetcher {
    /// Build a fetcher from the `[fetch]` config section.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            read_timeout: config.read_timeout(),
            max_bytes: config.max_source_bytes,
            default_user_agent: config.user_agent.clone(),
        })
    }

    /// Stream `source` into `dest`, returning the number of bytes written.
    ///
    /// Data lands in `<dest>.part` first and is renamed into place only once
    /// the whole body has arrived, so `dest` never holds a truncated file.
    ///
    /// # Errors
    ///
    /// [`Error::Fetch`] on connection failure, non-2xx status, timeout, a
    /// body that stalls longer than the read timeout, cancellation, an empty body, or a body larger than the configured
    /// limit.
    pub async fn fetch(
        &self,
        source: &SourceRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let partial = partial_path(dest);

        let result = tokio::select! {
            r = tokio::time::timeout(self.timeout, self.download(source, &partial)) => match r {
                Ok(r) => r,
                Err(_elapsed) => Err(Error::Fetch(format!("timed out after {:?}", self.timeout))),
            },
            _ = cancel.cancelled() => Err(Error::Fetch("cancelled".into())),
        };

        match result {
            Ok(bytes) => {
                tokio::fs::rename(&partial, dest).await?;
                Ok(bytes)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&partial).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!("Failed to remove partial download {}: {rm}", partial.display());
                    }
                }
                Err(e)
            }
        }
    }

    async fn download(&self, source: &SourceRequest, partial: &Path) -> Result<u64> {
        let mut request = self.client.get(&source.url);
        for (name, value) in source.headers.iter() {
            request = request.header(name, value);
        }
        if source.headers.user_agent().is_none() {
            request = request.header(USER_AGENT, &self.default_user_agent);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("request to {} failed: {e}", source.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("source returned HTTP {}", status.as_u16())));
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(len) = declared {
            if len > self.max_bytes {
                return Err(Error::Fetch(format!(
                    "source is {len} bytes, limit is {}",
                    self.max_bytes
                )));
            }
        }

        let mut file = tokio::fs::File::create(partial).await?;
        let mut written: u64 = 0;
        let mut body = response.bytes_stream();

        loop {
            let next = tokio::time::timeout(self.read_timeout, body.next())
                .await
                .map_err(|_| {
                    Error::Fetch(format!(
                        "source stalled for {:?} after {written} bytes",
                        self.read_timeout
                    ))
                })?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| Error::Fetch(format!("read failed after {written} bytes: {e}")))?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(Error::Fetch(format!(
                    "source exceeded {} byte limit",
                    self.max_bytes
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if written == 0 {
            return Err(Error::Fetch("source returned an empty body".into()));
        }

        tracing::debug!(url = %source.url, bytes = written, "Source downloaded");
        Ok(written)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RequestHeaders;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_bytes: u64, timeout: Duration) -> HttpFetcher {
        let config = FetchConfig {
            connect_timeout_secs: 2,
            timeout_secs: 60,
            read_timeout_secs: 5,
            max_source_bytes: max_bytes,
            user_agent: "vidrelay-test".into(),
        };
        let mut f = HttpFetcher::new(&config).unwrap();
        f.timeout = timeout;
        f
    }

    #[tokio::test]
    async fn downloads_with_caller_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .and(header("referer", "https://site.example/ep/1"))
            .and(header("user-agent", "custom-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("source");
        let source = SourceRequest::new(format!("{}/video.mp4", server.uri())).with_headers(
            RequestHeaders::new()
                .with_referer("https://site.example/ep/1")
                .with_user_agent("custom-agent"),
        );

        let bytes = fetcher(1 << 20, Duration::from_secs(10))
            .fetch(&source, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bytes, 4096);
        assert_eq!(std::fs::read(&dest).unwrap().len(), 4096);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn default_user_agent_applied() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "vidrelay-test"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = SourceRequest::new(format!("{}/v", server.uri()));
        fetcher(1024, Duration::from_secs(10))
            .fetch(&source, &dir.path().join("source"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("source");
        let source = SourceRequest::new(format!("{}/missing.mp4", server.uri()));
        let err = fetcher(1024, Duration::from_secs(10))
            .fetch(&source, &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Fetch(ref m) if m.contains("404")), "{err}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("source");
        let source = SourceRequest::new(format!("{}/big.mp4", server.uri()));
        let err = fetcher(1024, Duration::from_secs(10))
            .fetch(&source, &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Fetch(_)));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = SourceRequest::new(format!("{}/empty", server.uri()));
        let err = fetcher(1024, Duration::from_secs(10))
            .fetch(&source, &dir.path().join("source"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty body"));
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = SourceRequest::new(format!("{}/slow", server.uri()));
        let err = fetcher(1024, Duration::from_millis(200))
            .fetch(&source, &dir.path().join("source"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn cancellation_aborts_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = SourceRequest::new(format!("{}/slow", server.uri()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = fetcher(1024, Duration::from_secs(30))
            .fetch(&source, &dir.path().join("source"), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"), "{err}");
    }

    #[tokio::test]
    async fn stalled_body_hits_read_timeout() {
        // Sends headers and a first chunk, then goes quiet with the
        // connection held open.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\nfirst")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut f = fetcher(1 << 20, Duration::from_secs(20));
        f.read_timeout = Duration::from_millis(300);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("source");
        let source = SourceRequest::new(format!("http://{addr}/stall.mp4"));
        let started = std::time::Instant::now();
        let err = f
            .fetch(&source, &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("stalled"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
