pub mod app;
pub mod error;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::provider::ProviderId;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "deskpilot",
    about = "Pair a machine with a remote controller and drive it over a relay",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "Base URL of the deskpilot-road registry and relay [env: DESKPILOT_SESSION_SERVER]"
    )]
    pub session_server: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "DESKPILOT_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "DESKPILOT_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent on this machine (default when no subcommand is given)
    Agent(AgentArgs),
    /// Claim a machine by its pairing code
    Claim(ClaimArgs),
    /// Look up which machine a pairing code belongs to
    Lookup(LookupArgs),
    /// Send one command to a paired machine
    Send(SendArgs),
    /// Fetch a screenshot from a paired machine
    Screenshot(ScreenshotArgs),
    /// Let a vision model drive a paired machine until the task is done
    Pilot(PilotArgs),
}

#[derive(Args, Debug, Default)]
pub struct AgentArgs {
    #[arg(
        long = "state-file",
        value_name = "PATH",
        help = "Where to keep the machine identity (defaults to the platform config dir)"
    )]
    pub state_file: Option<PathBuf>,

    #[arg(
        long = "claim-poll-secs",
        value_name = "SECS",
        help = "Registry poll interval while the session is unowned"
    )]
    pub claim_poll_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ClaimArgs {
    /// Six digit pairing code shown by the agent
    pub code: String,

    #[arg(
        long = "principal",
        env = "DESKPILOT_PRINCIPAL",
        help = "Identity that will own the machine"
    )]
    pub principal: String,

    #[arg(long = "name", help = "Display name recorded with the claim")]
    pub display_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct LookupArgs {
    pub code: String,
}

/// Selects the machine to drive.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    #[arg(long = "code", help = "Pairing code of the machine")]
    pub code: Option<String>,

    #[arg(long = "machine", help = "Machine id")]
    pub machine: Option<String>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[arg(
        long = "principal",
        env = "DESKPILOT_PRINCIPAL",
        help = "Owner announced in controller presence"
    )]
    pub principal: Option<String>,

    /// Command as JSON, e.g. '{"type":"click","button":"left"}'
    pub command: String,
}

#[derive(Args, Debug)]
pub struct ScreenshotArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[arg(long = "principal", env = "DESKPILOT_PRINCIPAL")]
    pub principal: Option<String>,

    #[arg(long = "out", value_name = "PATH", default_value = "screenshot.jpg")]
    pub out: PathBuf,

    #[arg(long = "timeout-secs", default_value_t = 15)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug)]
pub struct PilotArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[arg(long = "principal", env = "DESKPILOT_PRINCIPAL")]
    pub principal: Option<String>,

    #[arg(
        long = "provider",
        value_enum,
        help = "Model provider (inferred from --model when omitted)"
    )]
    pub provider: Option<ProviderId>,

    #[arg(long = "model", help = "Provider model name")]
    pub model: Option<String>,

    #[arg(long = "max-iterations", default_value_t = 20)]
    pub max_iterations: u32,

    /// What the model should accomplish
    pub task: String,
}

impl PilotArgs {
    pub fn resolved_provider(&self) -> ProviderId {
        self.provider
            .or_else(|| self.model.as_deref().and_then(ProviderId::for_model))
            .unwrap_or(ProviderId::Gemini)
    }
}
