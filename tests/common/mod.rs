//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a [`SessionManager`] over a
//! temporary storage root, a [`wiremock::MockServer`] standing in for the
//! remote source site, and a [`FakeTranscoder`] in place of ffmpeg. The
//! [`TestHarness::with_server`] constructor starts Axum on a random port for
//! HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vidrelay::config::{Config, FetchConfig};
use vidrelay::server::{create_router, AppContext};
use vidrelay::session::{SessionManager, SessionSettings};
use vidrelay::source::{HttpFetcher, SourceRequest};
use vidrelay_av::{inspect_output, TranscodeJob, TranscodeOutput, Transcoder, MANIFEST_NAME};
use vidrelay_common::{Error, Result};

/// Stand-in for ffmpeg that writes a tiny fMP4 HLS tree.
#[derive(Debug, Default)]
pub struct FakeTranscoder {
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeTranscoder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn name(&self) -> &str {
        "fake"
    }

    async fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &CancellationToken,
    ) -> Result<TranscodeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Err(Error::Encoding("cancelled".into())),
        }
        if self.fail {
            return Err(Error::Encoding("fake engine exited with status 1".into()));
        }

        let input = tokio::fs::metadata(&job.input)
            .await
            .map_err(|e| Error::Encoding(format!("missing staged input: {e}")))?;
        assert!(input.len() > 0, "staged input is empty");

        let manifest = format!(
            "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:{d}\n#EXT-X-PLAYLIST-TYPE:VOD\n\
             #EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:{d}.0,\nseg0000.m4s\n#EXTINF:{d}.0,\nseg0001.m4s\n\
             #EXT-X-ENDLIST\n",
            d = job.segment_duration
        );
        tokio::fs::write(job.output_dir.join(MANIFEST_NAME), manifest).await?;
        tokio::fs::write(job.output_dir.join("init.mp4"), b"ftyp-init").await?;
        tokio::fs::write(job.output_dir.join("seg0000.m4s"), vec![1u8; 1024]).await?;
        tokio::fs::write(job.output_dir.join("seg0001.m4s"), vec![2u8; 512]).await?;

        inspect_output(&job.output_dir)
    }
}

/// Session manager plus fake source site over a temporary storage root.
pub struct TestHarness {
    pub manager: Arc<SessionManager>,
    pub transcoder: Arc<FakeTranscoder>,
    pub source: MockServer,
    pub storage_root: PathBuf,
    _dir: TempDir,
}

impl TestHarness {
    /// Harness with default test settings and an instant transcoder.
    pub async fn new() -> Self {
        Self::build(|_| {}, FakeTranscoder::default()).await
    }

    /// Harness with settings tweaked by `configure`.
    pub async fn with_settings(configure: impl FnOnce(&mut SessionSettings)) -> Self {
        Self::build(configure, FakeTranscoder::default()).await
    }

    pub async fn build(
        configure: impl FnOnce(&mut SessionSettings),
        transcoder: FakeTranscoder,
    ) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage_root = dir.path().join("sessions");

        let mut settings = SessionSettings {
            max_concurrent_acquisitions: 2,
            idle_timeout: Duration::from_secs(60),
            max_session_age: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            segment_duration_secs: 4,
            storage_root: storage_root.clone(),
        };
        configure(&mut settings);

        let fetcher = HttpFetcher::new(&FetchConfig {
            connect_timeout_secs: 2,
            timeout_secs: 30,
            read_timeout_secs: 10,
            max_source_bytes: 64 * 1024 * 1024,
            user_agent: "vidrelay-test".into(),
        })
        .expect("failed to build fetcher");

        let transcoder = Arc::new(transcoder);
        let manager = Arc::new(
            SessionManager::new(
                settings,
                fetcher,
                Arc::clone(&transcoder) as Arc<dyn Transcoder>,
            )
            .expect("invalid test settings"),
        );

        Self {
            manager,
            transcoder,
            source: MockServer::start().await,
            storage_root,
            _dir: dir,
        }
    }

    /// Serve `len` bytes at `route` on the fake source, after `delay`.
    pub async fn serve_video(&self, route: &str, len: usize, delay: Duration) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0x47u8; len])
                    .set_delay(delay),
            )
            .mount(&self.source)
            .await;
    }

    /// Answer `route` with a bare status code.
    pub async fn serve_status(&self, route: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.source)
            .await;
    }

    pub fn source_request(&self, route: &str) -> SourceRequest {
        SourceRequest::new(format!("{}{}", self.source.uri(), route))
    }

    pub fn source_url(&self, route: &str) -> String {
        format!("{}{}", self.source.uri(), route)
    }

    /// Names of everything directly under the storage root.
    pub fn storage_entries(&self) -> Vec<String> {
        match std::fs::read_dir(&self.storage_root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server(self) -> (Self, SocketAddr) {
        let ctx = AppContext {
            manager: Arc::clone(&self.manager),
            config: Arc::new(Config::default()),
        };
        let app = create_router(ctx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (self, addr)
    }
}
