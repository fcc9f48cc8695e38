use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const STATE_FILE: &str = "state.toml";

/// Identity an agent keeps across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl LocalState {
    pub fn fresh() -> Self {
        Self {
            machine_id: Uuid::new_v4().to_string(),
            owner_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unable to determine a config directory")]
    NoConfigDir,
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state file is not valid toml: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for StateError {
    fn from(value: toml::de::Error) -> Self {
        StateError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for StateError {
    fn from(value: toml::ser::Error) -> Self {
        StateError::Toml(value.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct LocalStateStore {
    path: PathBuf,
}

impl LocalStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf, StateError> {
        let dirs = ProjectDirs::from("dev", "deskpilot", "deskpilot").ok_or(StateError::NoConfigDir)?;
        Ok(dirs.config_dir().join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored identity, minting and persisting a new machine id on
    /// first run.
    pub fn load_or_init(&self) -> Result<LocalState, StateError> {
        if self.path.exists() {
            let raw = fs::read_to_string(&self.path).map_err(|source| self.io(source))?;
            let mut state: LocalState = toml::from_str(&raw)?;
            state.owner_id = state.owner_id.filter(|owner| !owner.trim().is_empty());
            if !state.machine_id.trim().is_empty() {
                return Ok(state);
            }
        }
        let state = LocalState::fresh();
        self.save(&state)?;
        Ok(state)
    }

    pub fn save(&self, state: &LocalState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io(source))?;
        }
        let serialized = toml::to_string_pretty(state)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| self.io(source))?;
        file.write_all(serialized.as_bytes())
            .map_err(|source| self.io(source))?;
        Ok(())
    }

    fn io(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_mints_and_persists_a_machine_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStateStore::new(dir.path().join("nested").join(STATE_FILE));

        let first = store.load_or_init().unwrap();
        assert!(Uuid::parse_str(&first.machine_id).is_ok());
        assert_eq!(first.owner_id, None);

        let second = store.load_or_init().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn owner_survives_a_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStateStore::new(dir.path().join(STATE_FILE));
        let mut state = store.load_or_init().unwrap();
        state.owner_id = Some("u-1".into());
        store.save(&state).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("owner_id = \"u-1\""));
        assert_eq!(store.load_or_init().unwrap(), state);
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        fs::write(&path, "machine_id = [").unwrap();
        let err = LocalStateStore::new(path).load_or_init().unwrap_err();
        assert!(matches!(err, StateError::Toml(_)));
    }
}
