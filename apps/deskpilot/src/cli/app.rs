use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tokio::signal;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::agent::{AgentOptions, AgentRuntime, ScreenCapture, TracingInputHost};
use crate::channel::WebSocketChannel;
use crate::cli::error::CliError;
use crate::cli::{
    AgentArgs, ClaimArgs, Cli, Command, LookupArgs, PilotArgs, ScreenshotArgs, SendArgs,
    TargetArgs,
};
use crate::config::Config;
use crate::control_loop::{ControlLoop, LoopConfig, LoopOutcome};
use crate::controller::Controller;
use crate::protocol::{Inbound, parse_inbound};
use crate::provider::{
    AdapterRegistry, AnthropicClient, GeminiClient, ProviderClient, ProviderError, ProviderId,
    anthropic, gemini,
};
use crate::session::{SessionConfig, SessionManager};
use crate::state::LocalStateStore;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const AGENT_WAIT: Duration = Duration::from_secs(10);

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_env();
    let server = cli
        .session_server
        .clone()
        .unwrap_or_else(|| config.session_server.clone());
    let sessions = SessionManager::new(SessionConfig::new(&server)?)?;

    match cli.command {
        None => agent(&sessions, &config, AgentArgs::default()).await,
        Some(Command::Agent(args)) => agent(&sessions, &config, args).await,
        Some(Command::Claim(args)) => claim(&sessions, args).await,
        Some(Command::Lookup(args)) => lookup(&sessions, args).await,
        Some(Command::Send(args)) => send(&sessions, args).await,
        Some(Command::Screenshot(args)) => screenshot(&sessions, args).await,
        Some(Command::Pilot(args)) => pilot(&sessions, &config, args).await,
    }
}

async fn agent(sessions: &SessionManager, config: &Config, args: AgentArgs) -> Result<(), CliError> {
    let state_path = match args.state_file.or_else(|| config.state_file.clone()) {
        Some(path) => path,
        None => LocalStateStore::default_path()?,
    };
    let claim_poll = args
        .claim_poll_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(config.claim_poll);

    let mut runtime = AgentRuntime::new(
        sessions.clone(),
        LocalStateStore::new(state_path),
        TracingInputHost,
        screen_capture(),
        AgentOptions { claim_poll },
    )?;
    let view = runtime.register().await?;
    println!("Pairing code: {}", view.pairing_code);
    println!("Machine id:   {}", view.machine_id);

    let url = sessions.config().channel_url(runtime.machine_id())?;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match WebSocketChannel::connect(&url).await {
            Ok(channel) => {
                backoff = INITIAL_BACKOFF;
                info!(%url, "agent connected");
                let served = tokio::select! {
                    result = runtime.serve(&channel) => Some(result),
                    _ = signal::ctrl_c() => None,
                };
                match served {
                    None => {
                        channel.close().await;
                        return Ok(());
                    }
                    Some(Err(err)) => warn!(error = %err, "agent connection failed"),
                    Some(Ok(())) => warn!("relay connection lost"),
                }
            }
            Err(err) => warn!(
                error = %err,
                retry_in_secs = backoff.as_secs(),
                "relay unreachable"
            ),
        }
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = signal::ctrl_c() => return Ok(()),
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(feature = "screen-capture")]
fn screen_capture() -> impl ScreenCapture {
    crate::agent::PrimaryScreenCapture
}

#[cfg(not(feature = "screen-capture"))]
fn screen_capture() -> impl ScreenCapture {
    warn!("built without screen-capture; screenshot requests will go unanswered");
    crate::agent::UnavailableCapture
}

async fn claim(sessions: &SessionManager, args: ClaimArgs) -> Result<(), CliError> {
    let claimed = sessions
        .claim(&args.code, &args.principal, args.display_name.as_deref())
        .await?;
    println!(
        "Claimed machine {} for {}",
        claimed.machine_id, claimed.owner_id
    );
    Ok(())
}

async fn lookup(sessions: &SessionManager, args: LookupArgs) -> Result<(), CliError> {
    let found = sessions.lookup(&args.code).await?;
    println!("{} ({})", found.machine_id, found.status.as_str());
    Ok(())
}

async fn send(sessions: &SessionManager, args: SendArgs) -> Result<(), CliError> {
    let payload: Value = serde_json::from_str(&args.command)
        .map_err(|err| CliError::InvalidArgument(format!("command is not JSON: {err}")))?;
    let Inbound::Command(command) = parse_inbound(&payload)? else {
        return Err(CliError::InvalidArgument(
            "screenshot responses are sent by agents".into(),
        ));
    };

    let (channel, controller) = connect_controller(sessions, &args.target, args.principal).await?;
    controller.send(&command)?;
    println!("Sent {}", command.kind());
    disconnect(channel, controller).await;
    Ok(())
}

async fn screenshot(sessions: &SessionManager, args: ScreenshotArgs) -> Result<(), CliError> {
    let (channel, controller) = connect_controller(sessions, &args.target, args.principal).await?;
    let shot = controller
        .request_screenshot(Duration::from_secs(args.timeout_secs))
        .await;
    disconnect(channel, controller).await;
    let shot = shot?;

    let bytes = STANDARD
        .decode(shot.image.as_bytes())
        .map_err(|err| CliError::InvalidArgument(format!("agent sent invalid base64: {err}")))?;
    std::fs::write(&args.out, &bytes)?;
    match shot.metadata {
        Some(metadata) => println!(
            "Saved {} ({}x{}, scale {})",
            args.out.display(),
            metadata.scaled.width,
            metadata.scaled.height,
            metadata.scale_factor
        ),
        None => println!("Saved {}", args.out.display()),
    }
    Ok(())
}

async fn pilot(sessions: &SessionManager, config: &Config, args: PilotArgs) -> Result<(), CliError> {
    let provider_id = args.resolved_provider();
    let model = args.model.as_deref();
    let provider: Arc<dyn ProviderClient> = match provider_id {
        ProviderId::Gemini => {
            let key = config
                .gemini_api_key
                .clone()
                .ok_or(ProviderError::MissingApiKey(gemini::API_KEY_ENV))?;
            Arc::new(GeminiClient::new(key, model)?)
        }
        ProviderId::Anthropic => {
            let key = config
                .anthropic_api_key
                .clone()
                .ok_or(ProviderError::MissingApiKey(anthropic::API_KEY_ENV))?;
            Arc::new(AnthropicClient::new(key, model)?)
        }
    };

    let (channel, controller) = connect_controller(sessions, &args.target, args.principal).await?;
    let controller = Arc::new(controller);
    let loop_config = LoopConfig {
        max_iterations: args.max_iterations.max(1),
        ..LoopConfig::default()
    };
    let pilot = ControlLoop::new(
        controller.clone(),
        provider,
        &AdapterRegistry::with_defaults(),
        loop_config,
    )?;
    info!(provider = %provider_id, task = %args.task, "pilot starting");
    let outcome = pilot.run(&args.task).await;
    drop(pilot);
    if let Ok(controller) = Arc::try_unwrap(controller) {
        disconnect(channel, controller).await;
    }

    match outcome? {
        LoopOutcome::Done { iterations } => println!("Done after {iterations} iterations"),
        LoopOutcome::IterationLimit { iterations } => {
            println!("Stopped after {iterations} iterations without completion")
        }
    }
    Ok(())
}

async fn resolve_machine(sessions: &SessionManager, target: &TargetArgs) -> Result<String, CliError> {
    match (&target.code, &target.machine) {
        (_, Some(machine)) => Ok(machine.clone()),
        (Some(code), None) => Ok(sessions.lookup(code).await?.machine_id),
        (None, None) => Err(CliError::InvalidArgument("pass --code or --machine".into())),
    }
}

async fn connect_controller(
    sessions: &SessionManager,
    target: &TargetArgs,
    principal: Option<String>,
) -> Result<(Arc<WebSocketChannel>, Controller), CliError> {
    let machine_id = resolve_machine(sessions, target).await?;
    let url = sessions.config().channel_url(&machine_id)?;
    let channel = Arc::new(WebSocketChannel::connect(&url).await?);
    let controller = Controller::attach(channel.clone(), principal)?;
    controller.wait_for_agent(AGENT_WAIT).await?;
    info!(%machine_id, "agent present");
    Ok((channel, controller))
}

async fn disconnect(channel: Arc<WebSocketChannel>, controller: Controller) {
    drop(controller);
    if let Ok(channel) = Arc::try_unwrap(channel) {
        channel.close().await;
    }
}
