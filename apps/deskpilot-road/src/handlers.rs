use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    metrics,
    session::{generate_pairing_code, is_valid_pairing_code, SessionRecord, SessionStatus},
    storage::{ClaimError, Registration, StoreError},
    AppState,
};

/// Attempts at finding a free code when the server picks one.
const CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Deserialize)]
pub struct RegisterSessionRequest {
    pub machine_id: String,
    /// Agents normally choose their own code; the server picks one when absent.
    #[serde(default)]
    pub pairing_code: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterSessionResponse {
    pub success: bool,
    pub session: SessionRecord,
}

#[derive(Debug, Deserialize)]
pub struct ClaimSessionRequest {
    pub pairing_code: String,
    pub principal_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimSessionResponse {
    pub success: bool,
    pub owner_id: String,
    pub machine_id: String,
}

#[derive(Debug, Serialize)]
pub struct CodeLookupResponse {
    pub machine_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    reason: &'static str,
}

/// Error response carrying a stable machine-readable reason.
pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
}

impl ApiError {
    fn with_reason(status: StatusCode, reason: &'static str) -> Self {
        Self { status, reason }
    }

    fn internal() -> Self {
        Self::with_reason(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                success: false,
                reason: self.reason,
            }),
        )
            .into_response()
    }
}

/// POST /sessions - Register (upsert) an agent's session
pub async fn register_session(
    State(state): State<AppState>,
    Json(payload): Json<RegisterSessionRequest>,
) -> Result<Json<RegisterSessionResponse>, ApiError> {
    let machine_id = payload.machine_id.trim().to_string();
    if machine_id.is_empty() {
        return Err(ApiError::with_reason(
            StatusCode::BAD_REQUEST,
            "machine_id_required",
        ));
    }

    let chosen = payload.pairing_code.map(|code| code.trim().to_string());
    if let Some(code) = chosen.as_deref() {
        if !is_valid_pairing_code(code) {
            return Err(ApiError::with_reason(
                StatusCode::BAD_REQUEST,
                "invalid_pairing_code",
            ));
        }
    }
    let attempts = if chosen.is_some() { 1 } else { CODE_ATTEMPTS };

    for _ in 0..attempts {
        let registration = Registration {
            machine_id: machine_id.clone(),
            pairing_code: chosen.clone().unwrap_or_else(generate_pairing_code),
            owner_id: payload.owner_id.clone(),
        };
        match state.store.upsert(registration).await {
            Ok(session) => {
                metrics::REGISTRATIONS.with_label_values(&["ok"]).inc();
                debug!(%machine_id, status = session.status.as_str(), "session registered");
                return Ok(Json(RegisterSessionResponse {
                    success: true,
                    session,
                }));
            }
            Err(StoreError::CodeInUse) => {
                debug!(%machine_id, "pairing code collision");
            }
            Err(StoreError::Backend(err)) => {
                error!(%machine_id, error = %err, "failed to register session");
                metrics::REGISTRATIONS.with_label_values(&["error"]).inc();
                return Err(ApiError::internal());
            }
        }
    }

    metrics::REGISTRATIONS
        .with_label_values(&["code_in_use"])
        .inc();
    Err(ApiError::with_reason(
        StatusCode::CONFLICT,
        "pairing_code_in_use",
    ))
}

/// POST /sessions/claim - Bind a session to a principal by pairing code
pub async fn claim_session(
    State(state): State<AppState>,
    Json(payload): Json<ClaimSessionRequest>,
) -> Result<Json<ClaimSessionResponse>, ApiError> {
    let principal_id = payload.principal_id.trim();
    if principal_id.is_empty() {
        return Err(ApiError::with_reason(
            StatusCode::BAD_REQUEST,
            "principal_required",
        ));
    }
    let code = payload.pairing_code.trim();
    if !is_valid_pairing_code(code) {
        return Err(ApiError::with_reason(
            StatusCode::BAD_REQUEST,
            "invalid_pairing_code",
        ));
    }

    match state
        .store
        .claim(code, principal_id, payload.display_name.as_deref())
        .await
    {
        Ok(session) => {
            metrics::CLAIMS.with_label_values(&["claimed"]).inc();
            let owner_id = session.owner_id.clone().unwrap_or_default();
            info!(machine_id = %session.machine_id, %owner_id, "session claimed");
            if let Err(err) = state.relay.notify_claimed(&session.machine_id, &owner_id) {
                // The agent's poll fallback still picks the owner up.
                warn!(machine_id = %session.machine_id, error = %err, "claim notification failed");
            }
            Ok(Json(ClaimSessionResponse {
                success: true,
                owner_id,
                machine_id: session.machine_id,
            }))
        }
        Err(ClaimError::PairingNotFound) => {
            metrics::CLAIMS.with_label_values(&["not_found"]).inc();
            Err(ApiError::with_reason(
                StatusCode::NOT_FOUND,
                "pairing_not_found",
            ))
        }
        Err(ClaimError::AlreadyClaimed) => {
            metrics::CLAIMS
                .with_label_values(&["already_claimed"])
                .inc();
            Err(ApiError::with_reason(StatusCode::CONFLICT, "already_claimed"))
        }
        Err(ClaimError::Backend(err)) => {
            error!(error = %err, "claim failed");
            metrics::CLAIMS.with_label_values(&["error"]).inc();
            Err(ApiError::internal())
        }
    }
}

/// GET /sessions/:machine_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    match state.store.get(&machine_id).await {
        Ok(Some(session)) => Ok(Json(session)),
        Ok(None) => Err(ApiError::with_reason(
            StatusCode::NOT_FOUND,
            "session_not_found",
        )),
        Err(err) => {
            error!(%machine_id, error = %err, "failed to load session");
            Err(ApiError::internal())
        }
    }
}

/// GET /sessions/code/:code - Resolve a pairing code for a connecting controller
pub async fn lookup_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CodeLookupResponse>, ApiError> {
    if !is_valid_pairing_code(&code) {
        return Err(ApiError::with_reason(
            StatusCode::BAD_REQUEST,
            "invalid_pairing_code",
        ));
    }
    match state.store.find_by_code(&code).await {
        Ok(Some(session)) => Ok(Json(CodeLookupResponse {
            machine_id: session.machine_id,
            status: session.status,
        })),
        Ok(None) => Err(ApiError::with_reason(
            StatusCode::NOT_FOUND,
            "pairing_not_found",
        )),
        Err(err) => {
            error!(error = %err, "pairing lookup failed");
            Err(ApiError::internal())
        }
    }
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

pub async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{router, storage::InMemorySessionStore};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> axum::Router {
        router(AppState::new(
            InMemorySessionStore::new(),
            Duration::from_secs(30),
        ))
    }

    async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_then_claim_then_conflict() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/sessions",
            Some(json!({"machine_id": "m-1", "pairing_code": "482913"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["status"], "waiting");

        let (status, body) = send(
            &app,
            "POST",
            "/sessions/claim",
            Some(json!({"pairing_code": "482913", "principal_id": "u-1", "display_name": "Desktop App"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner_id"], "u-1");
        assert_eq!(body["machine_id"], "m-1");

        let (status, body) = send(
            &app,
            "POST",
            "/sessions/claim",
            Some(json!({"pairing_code": "482913", "principal_id": "u-2"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "already_claimed");

        let (status, body) = send(&app, "GET", "/sessions/m-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["device_name"], "Desktop App");
    }

    #[test_timeout::tokio_timeout_test]
    async fn claim_unknown_code_is_404() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/sessions/claim",
            Some(json!({"pairing_code": "123456", "principal_id": "u-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["reason"], "pairing_not_found");
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_codes_are_rejected() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/sessions",
            Some(json!({"machine_id": "m-1", "pairing_code": "12ab56"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "invalid_pairing_code");

        let (status, _) = send(&app, "GET", "/sessions/code/12", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test_timeout::tokio_timeout_test]
    async fn server_picks_a_code_when_none_given() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/sessions",
            Some(json!({"machine_id": "m-9"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let code = body["session"]["pairing_code"].as_str().unwrap().to_string();
        assert!(is_valid_pairing_code(&code));

        let (status, body) = send(&app, "GET", &format!("/sessions/code/{code}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["machine_id"], "m-9");
    }

    #[test_timeout::tokio_timeout_test]
    async fn code_held_by_other_machine_conflicts() {
        let app = app();
        let register = |machine: &str| json!({"machine_id": machine, "pairing_code": "777777"});
        let (status, _) = send(&app, "POST", "/sessions", Some(register("m-1"))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "POST", "/sessions", Some(register("m-2"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "pairing_code_in_use");
    }
}
