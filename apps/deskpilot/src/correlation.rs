//! Correlation of screenshot requests with their responses.
//!
//! One controller keeps at most one request in flight: issuing a new one
//! supersedes whatever is pending. Entries leave the table when answered,
//! superseded, or swept past their deadline; a response for an entry that
//! is gone is discarded.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::ScreenshotResponse;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScreenshotError {
    #[error("screenshot request timed out")]
    Timeout,
    #[error("screenshot request superseded by a newer one")]
    Superseded,
    #[error("channel failed while waiting for a screenshot: {0}")]
    Channel(String),
}

pub type ScreenshotWaiter = oneshot::Receiver<Result<ScreenshotResponse, ScreenshotError>>;

#[derive(Debug)]
struct Pending {
    request_id: String,
    issued_at: Instant,
    deadline: Instant,
    waiter: oneshot::Sender<Result<ScreenshotResponse, ScreenshotError>>,
}

#[derive(Debug, Default)]
pub struct PendingScreenshots {
    entries: VecDeque<Pending>,
}

impl PendingScreenshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opens a new request, superseding any outstanding one.
    pub fn issue(&mut self, timeout: Duration) -> (String, ScreenshotWaiter) {
        for stale in self.entries.drain(..) {
            debug!(request_id = %stale.request_id, "superseding screenshot request");
            let _ = stale.waiter.send(Err(ScreenshotError::Superseded));
        }
        let request_id = Uuid::new_v4().to_string();
        let issued_at = Instant::now();
        let (waiter, rx) = oneshot::channel();
        self.entries.push_back(Pending {
            request_id: request_id.clone(),
            issued_at,
            deadline: issued_at + timeout,
            waiter,
        });
        (request_id, rx)
    }

    /// Hands a response to its waiter. Responses without an id answer the
    /// oldest outstanding request. Returns false when nothing was waiting.
    pub fn resolve(&mut self, response: ScreenshotResponse) -> bool {
        let position = match response.request_id.as_deref() {
            Some(id) => self.entries.iter().position(|entry| entry.request_id == id),
            None => (!self.entries.is_empty()).then_some(0),
        };
        let Some(entry) = position.and_then(|index| self.entries.remove(index)) else {
            debug!(request_id = ?response.request_id, "discarding unmatched screenshot response");
            return false;
        };
        debug!(
            request_id = %entry.request_id,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "screenshot response matched"
        );
        entry.waiter.send(Ok(response)).is_ok()
    }

    /// Fails every entry whose deadline is at or before `now` with `Timeout`.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let (expired, live): (VecDeque<Pending>, VecDeque<Pending>) = self
            .entries
            .drain(..)
            .partition(|entry| entry.deadline <= now);
        self.entries = live;
        let count = expired.len();
        for entry in expired {
            debug!(request_id = %entry.request_id, "screenshot request expired");
            let _ = entry.waiter.send(Err(ScreenshotError::Timeout));
        }
        count
    }

    /// Drops one request without answering it; its waiter has given up.
    pub fn expire(&mut self, request_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.request_id != request_id);
        before != self.entries.len()
    }

    pub fn fail_all(&mut self, error: ScreenshotError) {
        for entry in self.entries.drain(..) {
            let _ = entry.waiter.send(Err(error.clone()));
        }
    }
}
