//! Closed-loop control: screenshot, inference, execution, repeat.
//!
//! One run is a single sequential task. Every iteration captures the screen
//! through the agent link, hands it to the provider with the running
//! history, publishes the translated commands in order and then either
//! terminates or paces before the next iteration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channel::ChannelError;
use crate::correlation::ScreenshotError;
use crate::protocol::{CanonicalCommand, ScreenshotResponse};
use crate::provider::{
    ActionAdapter, AdapterRegistry, ProviderClient, ProviderError, ProviderId, ProviderRequest,
    TranslateContext, Turn,
};
use crate::telemetry::PerfGuard;

pub const FOLLOW_UP_PROMPT: &str = "Here is the screen after the previous actions. Continue with the task, or reply DONE if it is complete.";

/// What the loop needs from the agent side of a channel.
#[async_trait]
pub trait AgentLink: Send + Sync {
    async fn capture(&self, timeout: Duration) -> Result<ScreenshotResponse, ScreenshotError>;

    fn dispatch(&self, command: &CanonicalCommand) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Pause after each published command.
    pub settle: Duration,
    /// Pause between iterations.
    pub pacing: Duration,
    pub screenshot_timeout: Duration,
    /// Case-insensitive marker that ends the run.
    pub done_marker: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            settle: Duration::from_secs(1),
            pacing: Duration::from_secs(2),
            screenshot_timeout: Duration::from_secs(15),
            done_marker: "done".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Done { iterations: u32 },
    IterationLimit { iterations: u32 },
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("timed out waiting for a screenshot")]
    ScreenshotTimeout,
    #[error(transparent)]
    Screenshot(ScreenshotError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("no action adapter registered for {0}")]
    NoAdapter(ProviderId),
}

impl From<ScreenshotError> for LoopError {
    fn from(err: ScreenshotError) -> Self {
        match err {
            ScreenshotError::Timeout => LoopError::ScreenshotTimeout,
            other => LoopError::Screenshot(other),
        }
    }
}

/// Mutable state of one run; dropped when the run ends.
#[derive(Debug, Default)]
struct LoopState {
    history: Vec<Turn>,
    iteration: u32,
}

pub struct ControlLoop {
    link: Arc<dyn AgentLink>,
    provider: Arc<dyn ProviderClient>,
    adapter: Arc<dyn ActionAdapter>,
    config: LoopConfig,
}

impl ControlLoop {
    pub fn new(
        link: Arc<dyn AgentLink>,
        provider: Arc<dyn ProviderClient>,
        registry: &AdapterRegistry,
        config: LoopConfig,
    ) -> Result<Self, LoopError> {
        let adapter = registry
            .get(provider.id())
            .ok_or(LoopError::NoAdapter(provider.id()))?;
        Ok(Self {
            link,
            provider,
            adapter,
            config,
        })
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub async fn run(&self, task: &str) -> Result<LoopOutcome, LoopError> {
        let mut state = LoopState::default();
        let marker = self.config.done_marker.to_lowercase();
        info!(
            provider = self.provider.id().as_str(),
            max_iterations = self.config.max_iterations,
            "control loop started"
        );

        while state.iteration < self.config.max_iterations {
            state.iteration += 1;
            let iteration = state.iteration;

            let shot = {
                let _perf = PerfGuard::new("pilot.capture");
                self.link.capture(self.config.screenshot_timeout).await?
            };
            let image_size = shot.metadata.map(|metadata| metadata.scaled);

            let prompt = if iteration == 1 { task } else { FOLLOW_UP_PROMPT };
            let request = ProviderRequest {
                prompt: prompt.to_string(),
                history: std::mem::take(&mut state.history),
                screenshot: Some(shot.image),
                image_size,
            };
            let response = {
                let _perf = PerfGuard::new("pilot.infer");
                self.provider.infer(&request).await?
            };
            state.history = response.history;

            let ctx = TranslateContext { image_size };
            let commands =
                AdapterRegistry::translate_all(self.adapter.as_ref(), &response.function_calls, &ctx);
            debug!(
                iteration,
                calls = response.function_calls.len(),
                commands = commands.len(),
                "provider responded"
            );

            for command in &commands {
                if matches!(command, CanonicalCommand::CaptureScreenshot { .. }) {
                    // Every iteration already starts with a fresh capture.
                    continue;
                }
                self.link.dispatch(command)?;
                sleep(self.config.settle).await;
            }

            if response.text.to_lowercase().contains(&marker) {
                info!(iterations = iteration, "control loop finished");
                return Ok(LoopOutcome::Done {
                    iterations: iteration,
                });
            }
            if iteration < self.config.max_iterations {
                sleep(self.config.pacing).await;
            }
        }

        warn!(
            iterations = state.iteration,
            "control loop stopped at the iteration limit"
        );
        Ok(LoopOutcome::IterationLimit {
            iterations: state.iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CaptureMetadata, Extent, MouseButton, Offset, Target};
    use crate::provider::{FunctionCall, ProviderResponse};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedLink {
        time_out: bool,
        captures: Mutex<u32>,
        dispatched: Mutex<Vec<CanonicalCommand>>,
    }

    #[async_trait]
    impl AgentLink for ScriptedLink {
        async fn capture(&self, _timeout: Duration) -> Result<ScreenshotResponse, ScreenshotError> {
            *self.captures.lock() += 1;
            if self.time_out {
                return Err(ScreenshotError::Timeout);
            }
            Ok(ScreenshotResponse {
                image: "aW1n".into(),
                request_id: None,
                metadata: Some(CaptureMetadata {
                    original: Extent::new(2560, 1600),
                    logical: Extent::new(1280, 800),
                    scaled: Extent::new(1280, 800),
                    scale_factor: 2.0,
                    offset: Offset::default(),
                }),
            })
        }

        fn dispatch(&self, command: &CanonicalCommand) -> Result<(), ChannelError> {
            self.dispatched.lock().push(command.clone());
            Ok(())
        }
    }

    struct ScriptedProvider {
        id: ProviderId,
        replies: Mutex<VecDeque<(String, Vec<FunctionCall>)>>,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(id: ProviderId, replies: Vec<(&str, Vec<FunctionCall>)>) -> Self {
            Self {
                id,
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|(text, calls)| (text.to_string(), calls))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn infer(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.requests.lock().push(request.clone());
            let (text, function_calls) = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| ("still looking".to_string(), Vec::new()));
            let mut history = request.history.clone();
            history.push(Turn::text("user", request.prompt.clone()));
            history.push(Turn::text("model", text.clone()));
            Ok(ProviderResponse {
                text,
                function_calls,
                history,
            })
        }
    }

    fn control_loop(
        link: &Arc<ScriptedLink>,
        provider: &Arc<ScriptedProvider>,
    ) -> ControlLoop {
        ControlLoop::new(
            link.clone(),
            provider.clone(),
            &AdapterRegistry::with_defaults(),
            LoopConfig::default(),
        )
        .unwrap()
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stops_at_the_iteration_bound_without_done() {
        let link = Arc::new(ScriptedLink::default());
        let provider = Arc::new(ScriptedProvider::new(ProviderId::Gemini, Vec::new()));

        let outcome = control_loop(&link, &provider).run("find the file").await.unwrap();

        assert_eq!(outcome, LoopOutcome::IterationLimit { iterations: 20 });
        assert_eq!(*link.captures.lock(), 20);
        assert_eq!(provider.requests.lock().len(), 20);
        assert!(link.dispatched.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn screenshot_timeout_aborts_the_run() {
        let link = Arc::new(ScriptedLink {
            time_out: true,
            ..ScriptedLink::default()
        });
        let provider = Arc::new(ScriptedProvider::new(ProviderId::Gemini, Vec::new()));

        let err = control_loop(&link, &provider).run("anything").await.unwrap_err();

        assert!(matches!(err, LoopError::ScreenshotTimeout));
        assert!(provider.requests.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn done_terminates_after_the_response_actions_run() {
        let link = Arc::new(ScriptedLink::default());
        let provider = Arc::new(ScriptedProvider::new(
            ProviderId::Gemini,
            vec![
                (
                    "Opening the menu",
                    vec![FunctionCall::new("click_at", json!({"x": 500, "y": 500}))],
                ),
                (
                    "All set. Done.",
                    vec![FunctionCall::new("key_combination", json!({"keys": "enter"}))],
                ),
            ],
        ));

        let started = tokio::time::Instant::now();
        let outcome = control_loop(&link, &provider).run("open the menu").await.unwrap();

        assert_eq!(outcome, LoopOutcome::Done { iterations: 2 });
        assert_eq!(
            *link.dispatched.lock(),
            vec![
                CanonicalCommand::Click {
                    button: MouseButton::Left,
                    at: Some(Target::model(500.0, 500.0)),
                },
                CanonicalCommand::KeyCombination {
                    keys: vec!["enter".into()],
                },
            ]
        );
        // Two settles and one pacing gap.
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn later_iterations_carry_history_and_the_follow_up_prompt() {
        let link = Arc::new(ScriptedLink::default());
        let provider = Arc::new(ScriptedProvider::new(
            ProviderId::Anthropic,
            vec![("looking", Vec::new()), ("DONE", Vec::new())],
        ));

        control_loop(&link, &provider).run("check mail").await.unwrap();

        let requests = provider.requests.lock();
        assert_eq!(requests[0].prompt, "check mail");
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[0].image_size, Some(Extent::new(1280, 800)));
        assert_eq!(requests[1].prompt, FOLLOW_UP_PROMPT);
        assert_eq!(requests[1].history.len(), 2);
        assert_eq!(requests[1].history[1].joined_text(), "looking");
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn provider_requested_screenshots_are_not_dispatched() {
        let link = Arc::new(ScriptedLink::default());
        let provider = Arc::new(ScriptedProvider::new(
            ProviderId::Anthropic,
            vec![(
                "done",
                vec![FunctionCall::new("screenshot", json!({"action": "screenshot"}))],
            )],
        ));

        let outcome = control_loop(&link, &provider).run("look").await.unwrap();
        assert_eq!(outcome, LoopOutcome::Done { iterations: 1 });
        assert!(link.dispatched.lock().is_empty());
    }

    #[test_timeout::timeout]
    fn missing_adapter_is_reported_up_front() {
        let link: Arc<dyn AgentLink> = Arc::new(ScriptedLink::default());
        let provider: Arc<dyn ProviderClient> =
            Arc::new(ScriptedProvider::new(ProviderId::Gemini, Vec::new()));
        let result = ControlLoop::new(link, provider, &AdapterRegistry::new(), LoopConfig::default());
        assert!(matches!(result, Err(LoopError::NoAdapter(ProviderId::Gemini))));
    }
}
