use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

use super::input::{InputAction, InputError, InputHost};
use crate::coords::Normalizer;
use crate::keys::{KeyCombo, KeyError};
use crate::protocol::{CanonicalCommand, CaptureMetadata, MouseButton, Target};

const BROWSER_HOME: &str = "https://www.google.com";
const SEARCH_URL: &str = "https://www.google.com/search";

/// Longest pause a `wait` command may request.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid key combination: {0}")]
    Keys(#[from] KeyError),
    #[error(transparent)]
    Input(#[from] InputError),
}

/// Turns canonical commands into input-host actions. Coordinates are
/// converted exactly once, here.
pub struct Dispatcher<H> {
    host: H,
    normalizer: Normalizer,
}

impl<H: InputHost> Dispatcher<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            normalizer: Normalizer::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn observe(&mut self, metadata: CaptureMetadata) {
        self.normalizer.observe(metadata);
    }

    pub async fn execute(&mut self, command: &CanonicalCommand) -> Result<(), DispatchError> {
        debug!(kind = command.kind(), "executing command");
        match command {
            CanonicalCommand::Move { to } => self.move_to(*to)?,
            CanonicalCommand::Click { button, at } => {
                self.move_if(*at)?;
                self.host.perform(&InputAction::Click(*button))?;
            }
            CanonicalCommand::DoubleClick { button, at } => {
                self.move_if(*at)?;
                self.host.perform(&InputAction::DoubleClick(*button))?;
            }
            CanonicalCommand::MouseDown { button, at } => {
                self.move_if(*at)?;
                self.host.perform(&InputAction::Press(*button))?;
            }
            CanonicalCommand::MouseUp { button, at } => {
                self.move_if(*at)?;
                self.host.perform(&InputAction::Release(*button))?;
            }
            CanonicalCommand::Type { text } => {
                self.host.perform(&InputAction::Text(text.clone()))?;
            }
            CanonicalCommand::KeyCombination { keys } => {
                let combo = KeyCombo::parse(keys.as_slice())?;
                self.host.perform(&InputAction::Keys(combo))?;
            }
            CanonicalCommand::Scroll { dx, dy, at } => {
                self.move_if(*at)?;
                self.host.perform(&InputAction::Scroll { dx: *dx, dy: *dy })?;
            }
            CanonicalCommand::Drag {
                source,
                destination,
                button,
            } => self.drag(*source, *destination, *button)?,
            CanonicalCommand::Navigate { url } => {
                self.host.perform(&InputAction::OpenUrl(url.clone()))?;
            }
            CanonicalCommand::OpenBrowser { url } => {
                let url = url.clone().unwrap_or_else(|| BROWSER_HOME.to_string());
                self.host.perform(&InputAction::OpenUrl(url))?;
            }
            CanonicalCommand::Search { query } => {
                self.host.perform(&InputAction::OpenUrl(search_url(query)))?;
            }
            CanonicalCommand::Wait { ms } => {
                let requested = Duration::from_millis(*ms);
                if requested > MAX_WAIT {
                    debug!(requested_ms = *ms, "capping wait");
                }
                tokio::time::sleep(requested.min(MAX_WAIT)).await;
            }
            CanonicalCommand::CaptureScreenshot { .. } => {
                debug!("capture requests are answered by the runtime");
            }
        }
        Ok(())
    }

    fn move_to(&mut self, target: Target) -> Result<(), InputError> {
        let point = self.normalizer.to_logical(target);
        self.host.perform(&InputAction::MoveTo(point))
    }

    fn move_if(&mut self, target: Option<Target>) -> Result<(), InputError> {
        match target {
            Some(target) => self.move_to(target),
            None => Ok(()),
        }
    }

    fn drag(
        &mut self,
        source: Option<Target>,
        destination: Target,
        button: MouseButton,
    ) -> Result<(), InputError> {
        self.move_if(source)?;
        self.host.perform(&InputAction::Press(button))?;
        self.move_to(destination)?;
        self.host.perform(&InputAction::Release(button))
    }
}

fn search_url(query: &str) -> String {
    let encoded: String = form_urlencoded::Serializer::new(String::new())
        .append_pair("q", query)
        .finish();
    format!("{SEARCH_URL}?{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::input::RecordingInputHost;
    use crate::coords::LogicalPoint;
    use crate::keys::Key;
    use crate::protocol::{Extent, Offset};

    fn metadata(offset_x: i32) -> CaptureMetadata {
        CaptureMetadata {
            original: Extent::new(2560, 1600),
            logical: Extent::new(1280, 800),
            scaled: Extent::new(1280, 800),
            scale_factor: 2.0,
            offset: Offset { x: offset_x, y: 0 },
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn click_without_coordinates_does_not_move() {
        let host = RecordingInputHost::new();
        let mut dispatcher = Dispatcher::new(host.clone());
        dispatcher
            .execute(&CanonicalCommand::Click {
                button: MouseButton::Left,
                at: None,
            })
            .await
            .unwrap();
        assert_eq!(host.actions(), vec![InputAction::Click(MouseButton::Left)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn model_coordinates_are_converted_once() {
        let host = RecordingInputHost::new();
        let mut dispatcher = Dispatcher::new(host.clone());
        dispatcher.observe(metadata(100));
        dispatcher
            .execute(&CanonicalCommand::Click {
                button: MouseButton::Right,
                at: Some(Target::model(500.0, 500.0)),
            })
            .await
            .unwrap();
        assert_eq!(
            host.actions(),
            vec![
                InputAction::MoveTo(LogicalPoint { x: 740, y: 400 }),
                InputAction::Click(MouseButton::Right),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn drag_presses_moves_and_releases() {
        let host = RecordingInputHost::new();
        let mut dispatcher = Dispatcher::new(host.clone());
        dispatcher.observe(metadata(0));
        dispatcher
            .execute(&CanonicalCommand::Drag {
                source: Some(Target::model(0.0, 0.0)),
                destination: Target::logical(10.0, 20.0),
                button: MouseButton::Left,
            })
            .await
            .unwrap();
        assert_eq!(
            host.actions(),
            vec![
                InputAction::MoveTo(LogicalPoint { x: 0, y: 0 }),
                InputAction::Press(MouseButton::Left),
                InputAction::MoveTo(LogicalPoint { x: 10, y: 20 }),
                InputAction::Release(MouseButton::Left),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn keys_search_and_browser() {
        let host = RecordingInputHost::new();
        let mut dispatcher = Dispatcher::new(host.clone());
        dispatcher
            .execute(&CanonicalCommand::KeyCombination {
                keys: vec!["ctrl".into(), "c".into()],
            })
            .await
            .unwrap();
        dispatcher
            .execute(&CanonicalCommand::Search {
                query: "rust async".into(),
            })
            .await
            .unwrap();
        dispatcher
            .execute(&CanonicalCommand::OpenBrowser { url: None })
            .await
            .unwrap();
        assert_eq!(
            host.actions(),
            vec![
                InputAction::Keys(KeyCombo {
                    modifiers: vec![Key::Control],
                    keys: vec![Key::Char('c')],
                }),
                InputAction::OpenUrl("https://www.google.com/search?q=rust+async".into()),
                InputAction::OpenUrl(BROWSER_HOME.into()),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_keys_are_rejected_without_input() {
        let host = RecordingInputHost::new();
        let mut dispatcher = Dispatcher::new(host.clone());
        let err = dispatcher
            .execute(&CanonicalCommand::KeyCombination {
                keys: vec!["hyper".into()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Keys(_)));
        assert!(host.actions().is_empty());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn wait_sleeps_for_the_requested_time() {
        let mut dispatcher = Dispatcher::new(RecordingInputHost::new());
        let started = tokio::time::Instant::now();
        dispatcher
            .execute(&CanonicalCommand::Wait { ms: 1_500 })
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn long_waits_are_capped() {
        let mut dispatcher = Dispatcher::new(RecordingInputHost::new());
        let started = tokio::time::Instant::now();
        dispatcher
            .execute(&CanonicalCommand::Wait { ms: 86_400_000 })
            .await
            .unwrap();
        assert_eq!(started.elapsed(), MAX_WAIT);
    }
}
