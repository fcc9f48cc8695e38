use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(SessionStatus::Waiting),
            "active" => Some(SessionStatus::Active),
            _ => None,
        }
    }

    fn for_owner(owner_id: Option<&str>) -> Self {
        if owner_id.is_some() {
            SessionStatus::Active
        } else {
            SessionStatus::Waiting
        }
    }
}

/// One agent machine's pairing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub machine_id: String,
    pub pairing_code: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    pub status: SessionStatus,
    pub updated_at: i64,
}

impl SessionRecord {
    pub fn new(machine_id: String, pairing_code: String, owner_id: Option<String>) -> Self {
        let owner_id = owner_id.filter(|owner| !owner.trim().is_empty());
        Self {
            status: SessionStatus::for_owner(owner_id.as_deref()),
            machine_id,
            pairing_code,
            owner_id,
            device_name: None,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Rebuilds a record from a redis hash. Empty strings mean "unset".
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let non_empty = |key: &str| {
            fields
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let owner_id = non_empty("owner_id");
        Some(Self {
            machine_id: non_empty("machine_id")?,
            pairing_code: non_empty("pairing_code")?,
            status: non_empty("status")
                .and_then(|raw| SessionStatus::parse(&raw))
                .unwrap_or_else(|| SessionStatus::for_owner(owner_id.as_deref())),
            owner_id,
            device_name: non_empty("device_name"),
            updated_at: non_empty("updated_at")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_default(),
        })
    }

    pub fn is_claimed(&self) -> bool {
        self.owner_id.is_some()
    }
}

/// Six ASCII digits, uniformly drawn from 100000..=999999.
pub fn generate_pairing_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999u32).to_string()
}

pub fn is_valid_pairing_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}
