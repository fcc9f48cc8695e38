use std::io;
use thiserror::Error;

use crate::agent::AgentError;
use crate::channel::ChannelError;
use crate::control_loop::LoopError;
use crate::correlation::ScreenshotError;
use crate::protocol::CommandError;
use crate::provider::ProviderError;
use crate::session::SessionError;
use crate::state::StateError;
use crate::telemetry::logging::InitError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Channel(#[from] ChannelError),
    #[error("{0}")]
    Agent(#[from] AgentError),
    #[error("{0}")]
    Screenshot(#[from] ScreenshotError),
    #[error("{0}")]
    Provider(#[from] ProviderError),
    #[error("pilot stopped: {0}")]
    Pilot(#[from] LoopError),
    #[error("invalid command: {0}")]
    Command(#[from] CommandError),
    #[error("failed to initialise logging: {0}")]
    Logging(#[from] InitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
