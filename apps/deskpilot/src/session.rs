use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Registration attempts before a code collision is reported to the caller.
const REGISTER_ATTEMPTS: usize = 5;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    base_url: Url,
}

impl SessionConfig {
    pub fn new(server_base_url: impl AsRef<str>) -> Result<Self, SessionError> {
        let mut base = server_base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(SessionError::InvalidConfig(
                "session server base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base).map_err(|err| {
            SessionError::InvalidConfig(format!("invalid session server url: {err}"))
        })?;
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Realtime channel for `machine_id`, on the same host as the registry.
    pub fn channel_url(&self, machine_id: &str) -> Result<Url, SessionError> {
        let mut url = self
            .base_url
            .join(&format!("ws/{machine_id}"))
            .map_err(|err| SessionError::InvalidConfig(format!("invalid channel url: {err}")))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SessionError::InvalidConfig("cannot derive websocket scheme".into()))?;
        Ok(url)
    }
}

#[derive(Clone)]
pub struct SessionManager {
    config: Arc<SessionConfig>,
    backend: Arc<dyn SessionBackend>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let backend = Arc::new(ReqwestSessionBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    #[cfg(test)]
    fn with_backend(config: SessionConfig, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Upserts the agent's session under a freshly generated pairing code.
    pub async fn register(
        &self,
        machine_id: &str,
        owner_id: Option<&str>,
    ) -> Result<SessionView, SessionError> {
        self.register_with(machine_id, owner_id, generate_pairing_code)
            .await
    }

    pub async fn register_with(
        &self,
        machine_id: &str,
        owner_id: Option<&str>,
        mut next_code: impl FnMut() -> String,
    ) -> Result<SessionView, SessionError> {
        for attempt in 1..=REGISTER_ATTEMPTS {
            let request = RegisterSessionRequest {
                machine_id: machine_id.to_string(),
                pairing_code: next_code(),
                owner_id: owner_id.map(str::to_string),
            };
            match self
                .backend
                .register_session(self.config.base_url(), &request)
                .await
            {
                Ok(response) => {
                    if !response.success {
                        return Err(SessionError::InvalidResponse(
                            "registration not acknowledged".into(),
                        ));
                    }
                    tracing::debug!(
                        target = "deskpilot::session",
                        machine_id,
                        status = response.session.status.as_str(),
                        attempt,
                        "session registered"
                    );
                    return Ok(response.session);
                }
                Err(SessionError::PairingCodeInUse) => {
                    tracing::debug!(
                        target = "deskpilot::session",
                        machine_id,
                        attempt,
                        "pairing code collision, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(SessionError::PairingCodeInUse)
    }

    pub async fn claim(
        &self,
        pairing_code: &str,
        principal_id: &str,
        display_name: Option<&str>,
    ) -> Result<ClaimedSession, SessionError> {
        let code = validate_pairing_code(pairing_code)?;
        let request = ClaimSessionRequest {
            pairing_code: code,
            principal_id: principal_id.trim().to_string(),
            display_name: display_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
        };
        if request.principal_id.is_empty() {
            return Err(SessionError::InvalidConfig("principal id required".into()));
        }
        self.backend
            .claim_session(self.config.base_url(), &request)
            .await
    }

    pub async fn lookup(&self, pairing_code: &str) -> Result<CodeLookup, SessionError> {
        let code = validate_pairing_code(pairing_code)?;
        self.backend.lookup_code(self.config.base_url(), &code).await
    }

    pub async fn fetch(&self, machine_id: &str) -> Result<SessionView, SessionError> {
        self.backend
            .fetch_session(self.config.base_url(), machine_id)
            .await
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower.starts_with("0.0.0.0")
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}

/// Six ASCII digits, uniformly drawn from 100000..=999999.
pub fn generate_pairing_code() -> String {
    rand::thread_rng()
        .gen_range(100_000..=999_999u32)
        .to_string()
}

fn validate_pairing_code(code: &str) -> Result<String, SessionError> {
    let trimmed = code.trim();
    if trimmed.len() == 6 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        Ok(trimmed.to_string())
    } else {
        Err(SessionError::InvalidPairingCode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub machine_id: String,
    pub pairing_code: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    pub status: SessionStatus,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClaimedSession {
    pub owner_id: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodeLookup {
    pub machine_id: String,
    pub status: SessionStatus,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("pairing code already held by another machine")]
    PairingCodeInUse,
    #[error("no session carries that pairing code")]
    PairingNotFound,
    #[error("session already claimed by another principal")]
    AlreadyClaimed,
    #[error("session not found")]
    SessionNotFound,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("pairing code must be six digits")]
    InvalidPairingCode,
}

#[async_trait]
trait SessionBackend: Send + Sync {
    async fn register_session(
        &self,
        base_url: &Url,
        request: &RegisterSessionRequest,
    ) -> Result<RegisterSessionResponse, SessionError>;

    async fn claim_session(
        &self,
        base_url: &Url,
        request: &ClaimSessionRequest,
    ) -> Result<ClaimedSession, SessionError>;

    async fn lookup_code(&self, base_url: &Url, code: &str) -> Result<CodeLookup, SessionError>;

    async fn fetch_session(
        &self,
        base_url: &Url,
        machine_id: &str,
    ) -> Result<SessionView, SessionError>;
}

struct ReqwestSessionBackend {
    client: reqwest::Client,
}

impl ReqwestSessionBackend {
    fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &Url, path: &str) -> Result<Url, SessionError> {
        base_url
            .join(path)
            .map_err(|err| SessionError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    reason: Option<String>,
}

/// Maps a non-success response onto the registry's stable reasons.
async fn rejection(response: reqwest::Response) -> SessionError {
    let status = response.status();
    let reason = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.reason);
    match (status, reason.as_deref()) {
        (StatusCode::CONFLICT, Some("pairing_code_in_use")) => SessionError::PairingCodeInUse,
        (StatusCode::CONFLICT, _) => SessionError::AlreadyClaimed,
        (StatusCode::NOT_FOUND, Some("session_not_found")) => SessionError::SessionNotFound,
        (StatusCode::NOT_FOUND, _) => SessionError::PairingNotFound,
        (StatusCode::BAD_REQUEST, Some("invalid_pairing_code")) => SessionError::InvalidPairingCode,
        _ => SessionError::HttpStatus(status),
    }
}

#[async_trait]
impl SessionBackend for ReqwestSessionBackend {
    async fn register_session(
        &self,
        base_url: &Url,
        request: &RegisterSessionRequest,
    ) -> Result<RegisterSessionResponse, SessionError> {
        let endpoint = Self::endpoint(base_url, "sessions")?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json::<RegisterSessionResponse>().await?)
    }

    async fn claim_session(
        &self,
        base_url: &Url,
        request: &ClaimSessionRequest,
    ) -> Result<ClaimedSession, SessionError> {
        let endpoint = Self::endpoint(base_url, "sessions/claim")?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json::<ClaimedSession>().await?)
    }

    async fn lookup_code(&self, base_url: &Url, code: &str) -> Result<CodeLookup, SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/code/{code}"))?;
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json::<CodeLookup>().await?)
    }

    async fn fetch_session(
        &self,
        base_url: &Url,
        machine_id: &str,
    ) -> Result<SessionView, SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{machine_id}"))?;
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json::<SessionView>().await?)
    }
}

#[derive(Debug, Serialize)]
struct RegisterSessionRequest {
    machine_id: String,
    pairing_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterSessionResponse {
    success: bool,
    session: SessionView,
}

#[derive(Debug, Serialize)]
struct ClaimSessionRequest {
    pairing_code: String,
    principal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}
