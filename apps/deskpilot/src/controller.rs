use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deskpilot_bus::relay::EVENT_COMMAND;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, ChannelEvent, Subscription};
use crate::control_loop::AgentLink;
use crate::correlation::{PendingScreenshots, ScreenshotError};
use crate::presence::{ControllerStatus, derive_controller_status};
use crate::protocol::{
    CanonicalCommand, Inbound, PresencePayload, Role, SCREENSHOT_RESPONSE, ScreenshotResponse,
    parse_inbound,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The controlling side of a machine channel.
pub struct Controller {
    channel: Arc<dyn Channel>,
    pending: Arc<Mutex<PendingScreenshots>>,
    status: watch::Receiver<ControllerStatus>,
    dispatch: JoinHandle<()>,
}

impl Controller {
    /// Announces controller presence and starts consuming the channel.
    pub fn attach(
        channel: Arc<dyn Channel>,
        owner_id: Option<String>,
    ) -> Result<Self, ChannelError> {
        let subscription = channel.subscribe();
        let (status_tx, status) = watch::channel(ControllerStatus::Connecting);
        channel.track(&PresencePayload::new(Role::Controller, owner_id))?;

        let pending = Arc::new(Mutex::new(PendingScreenshots::new()));
        let dispatch = tokio::spawn(dispatch_loop(
            subscription,
            Arc::clone(&pending),
            status_tx,
        ));
        info!(member_id = channel.member_id(), "controller attached");
        Ok(Self {
            channel,
            pending,
            status,
            dispatch,
        })
    }

    pub fn status(&self) -> ControllerStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Waits until an agent is present on the channel.
    pub async fn wait_for_agent(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut status = self.status.clone();
        let outcome = tokio::time::timeout(
            timeout,
            status.wait_for(|status| {
                matches!(
                    status,
                    ControllerStatus::Connected | ControllerStatus::Disconnected
                )
            }),
        )
        .await;
        match outcome {
            Ok(Ok(status)) if *status == ControllerStatus::Connected => Ok(()),
            Ok(_) => Err(ChannelError::Disconnected),
            Err(_) => Err(ChannelError::Connect("no agent joined the channel".into())),
        }
    }

    pub fn send(&self, command: &CanonicalCommand) -> Result<(), ChannelError> {
        debug!(kind = command.kind(), "sending command");
        self.channel.publish(EVENT_COMMAND, command.to_payload())
    }

    /// Asks the agent for a screenshot and waits for the matching response.
    pub async fn request_screenshot(
        &self,
        timeout: Duration,
    ) -> Result<ScreenshotResponse, ScreenshotError> {
        let (request_id, waiter) = self.pending.lock().issue(timeout);
        let request = CanonicalCommand::CaptureScreenshot {
            request_id: Some(request_id.clone()),
        };
        if let Err(err) = self.send(&request) {
            self.pending.lock().expire(&request_id);
            return Err(ScreenshotError::Channel(err.to_string()));
        }
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScreenshotError::Channel("dispatch loop stopped".into())),
            Err(_) => {
                self.pending.lock().expire(&request_id);
                Err(ScreenshotError::Timeout)
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

#[async_trait]
impl AgentLink for Controller {
    async fn capture(&self, timeout: Duration) -> Result<ScreenshotResponse, ScreenshotError> {
        self.request_screenshot(timeout).await
    }

    fn dispatch(&self, command: &CanonicalCommand) -> Result<(), ChannelError> {
        self.send(command)
    }
}

async fn dispatch_loop(
    mut subscription: Subscription,
    pending: Arc<Mutex<PendingScreenshots>>,
    status: watch::Sender<ControllerStatus>,
) {
    let mut sweep = interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                ChannelEvent::PresenceSync(members) => {
                    let next = derive_controller_status(&members);
                    status.send_if_modified(|current| {
                        let changed = *current != next;
                        *current = next;
                        changed
                    });
                }
                ChannelEvent::Broadcast { event, payload, .. } => {
                    if event != EVENT_COMMAND
                        || payload.get("type").and_then(|t| t.as_str()) != Some(SCREENSHOT_RESPONSE)
                    {
                        continue;
                    }
                    match parse_inbound(&payload) {
                        Ok(Inbound::ScreenshotResponse(response)) => {
                            pending.lock().resolve(response);
                        }
                        Ok(Inbound::Command(_)) => {}
                        Err(err) => warn!(error = %err, "malformed screenshot response"),
                    }
                }
                ChannelEvent::Closed => {
                    let _ = status.send(ControllerStatus::Disconnected);
                    pending
                        .lock()
                        .fail_all(ScreenshotError::Channel("channel closed".into()));
                    break;
                }
            },
            _ = sweep.tick() => {
                pending.lock().sweep(Instant::now());
            }
        }
    }
}
