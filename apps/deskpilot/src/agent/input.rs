use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::coords::LogicalPoint;
use crate::keys::KeyCombo;
use crate::protocol::MouseButton;

/// Primitive, already-normalized input for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    MoveTo(LogicalPoint),
    Click(MouseButton),
    DoubleClick(MouseButton),
    Press(MouseButton),
    Release(MouseButton),
    Text(String),
    Keys(KeyCombo),
    /// Wheel notches; positive `dy` scrolls down.
    Scroll { dx: i32, dy: i32 },
    OpenUrl(String),
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("input host unavailable: {0}")]
    Unavailable(String),
    #[error("input host rejected {action}: {reason}")]
    Rejected { action: String, reason: String },
}

/// The native routine that actually drives the mouse, keyboard and browser.
pub trait InputHost: Send {
    fn perform(&mut self, action: &InputAction) -> Result<(), InputError>;
}

/// Logs every action instead of performing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInputHost;

impl InputHost for TracingInputHost {
    fn perform(&mut self, action: &InputAction) -> Result<(), InputError> {
        info!(target: "deskpilot::input", ?action, "input");
        Ok(())
    }
}

/// Keeps every action it receives. Clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct RecordingInputHost {
    actions: Arc<Mutex<Vec<InputAction>>>,
}

impl RecordingInputHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<InputAction> {
        self.actions.lock().clone()
    }

    pub fn take(&self) -> Vec<InputAction> {
        std::mem::take(&mut *self.actions.lock())
    }
}

impl InputHost for RecordingInputHost {
    fn perform(&mut self, action: &InputAction) -> Result<(), InputError> {
        self.actions.lock().push(action.clone());
        Ok(())
    }
}
