//! Agent side of a machine channel: registers the session, announces
//! presence, tracks connectivity and executes incoming commands.

pub mod capture;
pub mod dispatcher;
pub mod input;

use std::collections::VecDeque;
use std::time::Duration;

use deskpilot_bus::relay::{EVENT_COMMAND, EVENT_SESSION_CLAIMED, RELAY_SENDER};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelError, ChannelEvent, Subscription};
use crate::presence::{ConnectivityStatus, PresenceTracker};
use crate::protocol::{CanonicalCommand, Inbound, PresencePayload, Role, parse_inbound};
use crate::session::{SessionError, SessionManager, SessionView};
use crate::state::{LocalState, LocalStateStore, StateError};
use crate::telemetry::PerfGuard;

#[cfg(feature = "screen-capture")]
pub use capture::PrimaryScreenCapture;
pub use capture::{
    CaptureError, DisplayGeometry, FixedCapture, Frame, ScreenCapture, UnavailableCapture,
    encode_frame,
};
pub use dispatcher::{DispatchError, Dispatcher, MAX_WAIT};
pub use input::{InputAction, InputError, InputHost, RecordingInputHost, TracingInputHost};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// How often the registry is polled while nobody owns the session.
    pub claim_poll: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            claim_poll: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct AgentRuntime<H, C> {
    sessions: SessionManager,
    store: LocalStateStore,
    state: LocalState,
    tracker: PresenceTracker,
    dispatcher: Dispatcher<H>,
    capture: C,
    status: watch::Sender<ConnectivityStatus>,
    options: AgentOptions,
}

impl<H: InputHost, C: ScreenCapture> AgentRuntime<H, C> {
    /// Loads (or mints) the local identity from `store`.
    pub fn new(
        sessions: SessionManager,
        store: LocalStateStore,
        host: H,
        capture: C,
        options: AgentOptions,
    ) -> Result<Self, AgentError> {
        let state = store.load_or_init()?;
        let tracker = PresenceTracker::new(state.owner_id.is_some());
        let (status, _) = watch::channel(tracker.status());
        info!(
            machine_id = %state.machine_id,
            owned = state.owner_id.is_some(),
            state_file = %store.path().display(),
            "agent state loaded"
        );
        Ok(Self {
            sessions,
            store,
            state,
            tracker,
            dispatcher: Dispatcher::new(host),
            capture,
            status,
            options,
        })
    }

    pub fn machine_id(&self) -> &str {
        &self.state.machine_id
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.state.owner_id.as_deref()
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.tracker.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    pub fn dispatcher(&self) -> &Dispatcher<H> {
        &self.dispatcher
    }

    /// Upserts the session under a fresh pairing code, carrying the owner
    /// cached locally.
    pub async fn register(&self) -> Result<SessionView, AgentError> {
        let view = self
            .sessions
            .register(self.machine_id(), self.owner_id())
            .await?;
        info!(machine_id = %view.machine_id, status = view.status.as_str(), "session registered");
        Ok(view)
    }

    pub async fn register_with(
        &self,
        next_code: impl FnMut() -> String,
    ) -> Result<SessionView, AgentError> {
        Ok(self
            .sessions
            .register_with(self.machine_id(), self.owner_id(), next_code)
            .await?)
    }

    /// Serves one channel connection until it closes. Presence is announced
    /// on entry; nothing from an earlier connection is replayed.
    pub async fn serve(&mut self, channel: &dyn Channel) -> Result<(), AgentError> {
        let mut events = channel.subscribe();
        self.announce(channel)?;
        let status = self.tracker.joined();
        self.publish_status(status);

        let mut poll = interval(self.options.claim_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        let mut backlog = VecDeque::new();
        loop {
            let unowned = self.state.owner_id.is_none();
            let event = match backlog.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    event = events.recv() => event,
                    _ = poll.tick(), if unowned => {
                        self.poll_claim(channel).await;
                        continue;
                    }
                },
            };
            match event {
                ChannelEvent::PresenceSync(members) => {
                    let status = self.tracker.sync(members);
                    self.publish_status(status);
                }
                ChannelEvent::Broadcast { from, event, payload } => {
                    let Some(command) = self.handle_broadcast(channel, &from, &event, payload)
                    else {
                        continue;
                    };
                    if !self.run_command(&from, command, &mut events, &mut backlog).await {
                        self.channel_closed();
                        return Ok(());
                    }
                }
                ChannelEvent::Closed => {
                    self.channel_closed();
                    return Ok(());
                }
            }
        }
    }

    fn channel_closed(&mut self) {
        let status = self.tracker.disconnected();
        self.publish_status(status);
        info!(machine_id = %self.state.machine_id, "channel closed");
    }

    /// Executes one command while still listening on the channel. Events
    /// that arrive meanwhile are queued in order. Returns false if the
    /// channel closed before the command finished.
    async fn run_command(
        &mut self,
        from: &str,
        command: CanonicalCommand,
        events: &mut Subscription,
        backlog: &mut VecDeque<ChannelEvent>,
    ) -> bool {
        let _perf = PerfGuard::new("agent.command");
        let execution = self.dispatcher.execute(&command);
        tokio::pin!(execution);
        loop {
            tokio::select! {
                result = &mut execution => {
                    if let Err(err) = result {
                        warn!(from, kind = command.kind(), error = %err, "command failed");
                    }
                    return true;
                }
                event = events.recv() => match event {
                    ChannelEvent::Closed => {
                        debug!(kind = command.kind(), "channel closed mid-command");
                        return false;
                    }
                    other => backlog.push_back(other),
                },
            }
        }
    }

    fn announce(&self, channel: &dyn Channel) -> Result<(), ChannelError> {
        channel.track(&PresencePayload::new(
            Role::Agent,
            self.state.owner_id.clone(),
        ))
    }

    fn publish_status(&self, status: ConnectivityStatus) {
        let changed = self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if changed {
            info!(machine_id = %self.state.machine_id, %status, "connectivity changed");
        }
    }

    /// Applies control events directly and hands back commands that need
    /// the input host.
    fn handle_broadcast(
        &mut self,
        channel: &dyn Channel,
        from: &str,
        event: &str,
        payload: Value,
    ) -> Option<CanonicalCommand> {
        match event {
            EVENT_SESSION_CLAIMED if from != RELAY_SENDER => {
                warn!(from, "ignoring session_claimed from a channel member");
            }
            EVENT_SESSION_CLAIMED => {
                match payload.get("owner_id").and_then(Value::as_str) {
                    Some(owner) => self.adopt_owner(channel, owner),
                    None => warn!(from, "session_claimed without owner_id"),
                }
            }
            EVENT_COMMAND => match parse_inbound(&payload) {
                Ok(Inbound::Command(CanonicalCommand::CaptureScreenshot { request_id })) => {
                    self.answer_capture(channel, request_id);
                }
                Ok(Inbound::Command(command)) => return Some(command),
                Ok(Inbound::ScreenshotResponse(_)) => {
                    trace!(from, "ignoring screenshot response");
                }
                Err(err) => warn!(from, error = %err, "dropping command"),
            },
            other => trace!(from, event = other, "ignoring broadcast"),
        }
        None
    }

    /// Records the first owner. Ownership never changes once set.
    fn adopt_owner(&mut self, channel: &dyn Channel, owner: &str) {
        match self.state.owner_id.as_deref() {
            Some(current) if current == owner => return,
            Some(current) => {
                warn!(
                    machine_id = %self.state.machine_id,
                    owner_id = current,
                    rejected = owner,
                    "session already owned"
                );
                return;
            }
            None => {}
        }
        self.state.owner_id = Some(owner.to_string());
        if let Err(err) = self.store.save(&self.state) {
            warn!(error = %err, "failed to persist owner");
        }
        info!(machine_id = %self.state.machine_id, owner_id = owner, "session claimed");
        let status = self.tracker.set_owner_known(true);
        self.publish_status(status);
        if let Err(err) = self.announce(channel) {
            warn!(error = %err, "failed to re-announce presence");
        }
    }

    fn answer_capture(&mut self, channel: &dyn Channel, request_id: Option<String>) {
        let frame = match self.capture.capture() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(request_id = ?request_id, error = %err, "screenshot unavailable");
                return;
            }
        };
        self.dispatcher.observe(frame.metadata);
        let response = frame.into_response(request_id);
        if let Err(err) = channel.publish(EVENT_COMMAND, response.to_payload()) {
            warn!(error = %err, "failed to publish screenshot");
        }
    }

    async fn poll_claim(&mut self, channel: &dyn Channel) {
        match self.sessions.fetch(&self.state.machine_id).await {
            Ok(view) => {
                if let Some(owner) = view.owner_id.as_deref() {
                    self.adopt_owner(channel, owner);
                }
            }
            Err(err) => debug!(error = %err, "claim poll failed"),
        }
    }
}
