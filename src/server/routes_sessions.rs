//! Session management API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vidrelay_common::SessionId;

use super::error::AppError;
use super::AppContext;
use crate::session::{SessionState, SessionView};
use crate::source::{RequestHeaders, SourceRequest};

pub fn session_routes() -> Router<AppContext> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(close_session))
        .route("/sessions/:id/touch", post(touch_session))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub url: String,
    #[serde(default)]
    pub content_id: String,
    #[serde(default)]
    pub quality: String,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Block until the session is ready or failed.
    #[serde(default)]
    pub wait: bool,
}

impl CreateSessionRequest {
    fn source(&self) -> SourceRequest {
        let mut headers: RequestHeaders = self.headers.clone().into();
        if let Some(referer) = &self.referer {
            headers.insert("referer", referer.clone());
        }
        if let Some(user_agent) = &self.user_agent {
            headers.insert("user-agent", user_agent.clone());
        }
        SourceRequest::new(self.url.clone()).with_headers(headers)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub id: SessionId,
    pub state: SessionState,
    pub manifest_url: String,
}

async fn create_session(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let id = ctx
        .manager
        .create_session(req.source(), &req.content_id, &req.quality)
        .await?;

    let state = if req.wait {
        ctx.manager.wait_settled(&id).await?.state
    } else {
        ctx.manager.get(&id).map(|v| v.state).unwrap_or(SessionState::Created)
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            manifest_url: format!("/hls/{id}/index.m3u8"),
            id,
            state,
        }),
    ))
}

async fn list_sessions(State(ctx): State<AppContext>) -> Json<Vec<SessionView>> {
    Json(ctx.manager.list_active())
}

async fn get_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let id: SessionId = id.parse()?;
    Ok(Json(ctx.manager.get(&id)?))
}

async fn touch_session(State(ctx): State<AppContext>, Path(id): Path<String>) -> StatusCode {
    if let Ok(id) = id.parse::<SessionId>() {
        ctx.manager.touch(&id);
    }
    StatusCode::NO_CONTENT
}

async fn close_session(State(ctx): State<AppContext>, Path(id): Path<String>) -> StatusCode {
    if let Ok(id) = id.parse::<SessionId>() {
        ctx.manager.close(&id).await;
    }
    StatusCode::NO_CONTENT
}
