//! Connectivity status derived from presence snapshots.
//!
//! Status is always recomputed from the full member list the relay sends,
//! never from join/leave deltas.

use std::fmt;

use deskpilot_bus::Member;

use crate::protocol::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    WaitingToBeClaimed,
    LinkedWaiting,
    Active,
    Disconnected,
}

impl ConnectivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectivityStatus::WaitingToBeClaimed => "waiting_to_be_claimed",
            ConnectivityStatus::LinkedWaiting => "linked_waiting",
            ConnectivityStatus::Active => "active",
            ConnectivityStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent-side status for a connected channel.
pub fn derive_status(members: &[Member], owner_known: bool) -> ConnectivityStatus {
    let has_controller = members
        .iter()
        .any(|member| Role::of(member) == Some(Role::Controller));
    match (has_controller, owner_known) {
        (true, _) => ConnectivityStatus::Active,
        (false, true) => ConnectivityStatus::LinkedWaiting,
        (false, false) => ConnectivityStatus::WaitingToBeClaimed,
    }
}

#[derive(Debug)]
pub struct PresenceTracker {
    owner_known: bool,
    connected: bool,
    members: Vec<Member>,
    status: ConnectivityStatus,
}

impl PresenceTracker {
    pub fn new(owner_known: bool) -> Self {
        Self {
            owner_known,
            connected: false,
            members: Vec::new(),
            status: ConnectivityStatus::Disconnected,
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// The agent (re)joined its channel. Nothing from before the gap is trusted.
    pub fn joined(&mut self) -> ConnectivityStatus {
        self.connected = true;
        self.members.clear();
        self.recompute()
    }

    pub fn sync(&mut self, members: Vec<Member>) -> ConnectivityStatus {
        self.members = members;
        self.recompute()
    }

    pub fn disconnected(&mut self) -> ConnectivityStatus {
        self.connected = false;
        self.members.clear();
        self.recompute()
    }

    pub fn set_owner_known(&mut self, owner_known: bool) -> ConnectivityStatus {
        self.owner_known = owner_known;
        self.recompute()
    }

    fn recompute(&mut self) -> ConnectivityStatus {
        self.status = if self.connected {
            derive_status(&self.members, self.owner_known)
        } else {
            ConnectivityStatus::Disconnected
        };
        self.status
    }
}

/// Controller-side view of the machine it is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Connecting,
    WaitingForAgent,
    Connected,
    Disconnected,
}

impl ControllerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerStatus::Connecting => "connecting",
            ControllerStatus::WaitingForAgent => "waiting_for_agent",
            ControllerStatus::Connected => "connected",
            ControllerStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn derive_controller_status(members: &[Member]) -> ControllerStatus {
    if members
        .iter()
        .any(|member| Role::of(member) == Some(Role::Agent))
    {
        ControllerStatus::Connected
    } else {
        ControllerStatus::WaitingForAgent
    }
}
