//! HLS playback routes. Every successful read keeps the session alive.

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::io::ReaderStream;
use vidrelay_av::MANIFEST_NAME;
use vidrelay_common::{Error, SessionId};

use super::error::AppError;
use super::AppContext;

pub fn hls_routes() -> Router<AppContext> {
    Router::new().route("/:id/:file", get(serve_file))
}

async fn serve_file(
    State(ctx): State<AppContext>,
    Path((id, file)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let id: SessionId = id.parse()?;
    if file == MANIFEST_NAME {
        manifest(&ctx, &id).await
    } else {
        segment(&ctx, &id, &file).await
    }
}

async fn manifest(ctx: &AppContext, id: &SessionId) -> Result<Response, AppError> {
    let path = ctx.manager.manifest(id)?;
    let body = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found("session", id),
        _ => Error::from(e),
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn segment(ctx: &AppContext, id: &SessionId, name: &str) -> Result<Response, AppError> {
    let path = ctx.manager.segment(id, name).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found("segment", name),
        _ => Error::from(e),
    })?;
    let len = file.metadata().await.map(|m| m.len()).ok();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type(name)),
    );
    if let Some(len) = len {
        headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(len));
    }
    Ok(response)
}

fn content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        Some("ts") => "video/mp2t",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        _ => "application/octet-stream",
    }
}
