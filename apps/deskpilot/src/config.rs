use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SESSION_SERVER: &str = "127.0.0.1:8080";
const DEFAULT_CLAIM_POLL_SECS: u64 = 5;

/// Deskpilot configuration read from the environment. CLI flags override it.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Registry and relay address.
    pub session_server: String,
    /// Where the agent keeps its identity. `None` uses the platform config dir.
    pub state_file: Option<PathBuf>,
    /// Registry poll interval while the session is unowned.
    pub claim_poll: Duration,
    pub gemini_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let server = env::var("DESKPILOT_SESSION_SERVER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_SERVER.to_string());
        // Prefer IPv4 loopback; some hosts resolve localhost to ::1 first.
        let session_server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        let claim_poll = env::var("DESKPILOT_CLAIM_POLL_SECS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_CLAIM_POLL_SECS);
        Self {
            session_server,
            state_file: non_empty("DESKPILOT_STATE_FILE").map(PathBuf::from),
            claim_poll: Duration::from_secs(claim_poll),
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            anthropic_api_key: non_empty("CLAUDE_API_KEY").or_else(|| non_empty("ANTHROPIC_API_KEY")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_server: DEFAULT_SESSION_SERVER.to_string(),
            state_file: None,
            claim_poll: Duration::from_secs(DEFAULT_CLAIM_POLL_SECS),
            gemini_api_key: None,
            anthropic_api_key: None,
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}
