//! # sl-api Handlers
//!
//! This module coordinates the flow between HTTP requests and the relay core.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use sl_core::duration::parse_iso8601;
use sl_core::models::{CloseRequest, GatewayEvent, UserId, UserRef};
use sl_core::traits::OperatorAuth;
use sl_core::Relay;
use tracing::{info, warn};

use crate::error::ApiError;

pub const OPERATOR_KEY_HEADER: &str = "X-Operator-Key";
const DEFAULT_SEARCH_LIMIT: usize = 25;
const MAX_SEARCH_LIMIT: usize = 200;

/// State shared across all Actix-web workers.
pub struct AppState {
    pub relay: Arc<Relay>,
    pub auth: Box<dyn OperatorAuth>,
    /// Argon2 hash of the operator key; `None` refuses every operator call.
    pub operator_key_hash: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
pub struct CloseBody {
    pub operator: UserRef,
    /// ISO-8601 delay, e.g. `PT2H`. Absent closes immediately.
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BlockBody {
    pub reason: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn authorize(data: &AppState, req: &HttpRequest) -> Result<(), ApiError> {
    let Some(hash) = data.operator_key_hash.as_ref() else {
        return Err(ApiError::Unauthorized);
    };
    let key = req
        .headers()
        .get(OPERATOR_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    if data.auth.verify_operator_key(key, hash.expose_secret()).await {
        Ok(())
    } else {
        warn!(peer = ?req.peer_addr(), "operator key rejected");
        Err(ApiError::Unauthorized)
    }
}

/// Liveness plus startup state.
pub async fn health(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "ready": data.relay.is_ready() }))
}

/// Ingests one gateway event.
///
/// # Developer Note
/// Events arriving before startup recovery finishes are refused with 503 so
/// the bridge redelivers them instead of racing the recovery pass.
pub async fn ingest_event(
    data: web::Data<AppState>,
    event: web::Json<GatewayEvent>,
) -> Result<HttpResponse, ApiError> {
    // 1. Readiness: recovery must have run.
    data.relay.ensure_ready()?;

    // 2. Dispatch.
    data.relay.handle_event(event.into_inner()).await?;
    Ok(HttpResponse::Accepted().finish())
}

/// Closes a thread now, or schedules it when `after` is given.
pub async fn close_thread(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
    body: web::Json<CloseBody>,
) -> Result<HttpResponse, ApiError> {
    // 1. Security Check
    authorize(&data, &req).await?;

    // 2. Request
    let recipient = UserId(path.into_inner());
    let body = body.into_inner();
    let mut request = CloseRequest::new(body.operator.into()).silent(body.silent);
    if let Some(after) = body.after.as_deref() {
        let after = parse_iso8601(after).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        request = request.after(after);
    }
    if let Some(message) = body.message {
        request = request.message(message);
    }

    // 3. Close
    data.relay.close_thread(recipient, request).await?;
    info!(recipient = %recipient, "operator close accepted");
    Ok(HttpResponse::Accepted().finish())
}

pub async fn cancel_close(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    let cancelled = data.relay.cancel_close(UserId(path.into_inner())).await?;
    Ok(HttpResponse::Ok().json(json!({ "cancelled": cancelled })))
}

pub async fn list_blocks(
    data: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    Ok(HttpResponse::Ok().json(data.relay.blocked().await?))
}

pub async fn block(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
    body: web::Json<BlockBody>,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    let entry = data
        .relay
        .block(UserId(path.into_inner()), &body.reason, body.expires_at)
        .await?;
    Ok(HttpResponse::Created().json(entry))
}

pub async fn unblock(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    let removed = data.relay.unblock(UserId(path.into_inner())).await?;
    Ok(HttpResponse::Ok().json(json!({ "removed": removed })))
}

pub async fn whitelist(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    data.relay.whitelist(UserId(path.into_inner())).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn unwhitelist(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    data.relay.unwhitelist(UserId(path.into_inner())).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn pending_closures(
    data: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    Ok(HttpResponse::Ok().json(data.relay.pending_closures()))
}

pub async fn search_logs(
    data: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ApiError> {
    authorize(&data, &req).await?;
    if query.q.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .min(MAX_SEARCH_LIMIT);
    Ok(HttpResponse::Ok().json(data.relay.search_logs(&query.q, limit).await?))
}
