use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex;
use tracing::debug;

use crate::session::SessionRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("pairing code is held by another machine")]
    CodeInUse,
    #[error("store error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("no session carries that pairing code")]
    PairingNotFound,
    #[error("session is already claimed by another principal")]
    AlreadyClaimed,
    #[error("store error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<redis::RedisError> for ClaimError {
    fn from(err: redis::RedisError) -> Self {
        ClaimError::Backend(err.to_string())
    }
}

/// What an agent sends when it (re)announces itself.
#[derive(Debug, Clone)]
pub struct Registration {
    pub machine_id: String,
    pub pairing_code: String,
    pub owner_id: Option<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upserts keyed by machine id. The previous pairing code, if any, stops
    /// resolving. Fails with `CodeInUse` when another machine holds the code.
    async fn upsert(&self, registration: Registration) -> Result<SessionRecord, StoreError>;

    /// Atomic compare-and-set of the owner. Re-claiming by the current owner
    /// succeeds and refreshes the device name.
    async fn claim(
        &self,
        pairing_code: &str,
        principal_id: &str,
        device_name: Option<&str>,
    ) -> Result<SessionRecord, ClaimError>;

    async fn get(&self, machine_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn find_by_code(&self, pairing_code: &str) -> Result<Option<SessionRecord>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    codes: HashMap<String, String>,
}

/// In-memory store for tests and single-node deployments.
#[derive(Default)]
pub struct InMemorySessionStore {
    state: Mutex<MemoryState>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upsert(&self, registration: Registration) -> Result<SessionRecord, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(holder) = state.codes.get(&registration.pairing_code) {
            if holder != &registration.machine_id {
                return Err(StoreError::CodeInUse);
            }
        }

        let mut record = SessionRecord::new(
            registration.machine_id.clone(),
            registration.pairing_code.clone(),
            registration.owner_id,
        );
        if let Some(previous) = state.sessions.get(&registration.machine_id) {
            if previous.pairing_code != record.pairing_code {
                state.codes.remove(&previous.pairing_code);
            }
            record.device_name = previous.device_name.clone();
        }
        state
            .codes
            .insert(registration.pairing_code, registration.machine_id.clone());
        state
            .sessions
            .insert(registration.machine_id, record.clone());
        Ok(record)
    }

    async fn claim(
        &self,
        pairing_code: &str,
        principal_id: &str,
        device_name: Option<&str>,
    ) -> Result<SessionRecord, ClaimError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let machine_id = state
            .codes
            .get(pairing_code)
            .ok_or(ClaimError::PairingNotFound)?;
        let record = state
            .sessions
            .get_mut(machine_id)
            .filter(|record| record.pairing_code == pairing_code)
            .ok_or(ClaimError::PairingNotFound)?;

        match record.owner_id.as_deref() {
            Some(owner) if owner != principal_id => return Err(ClaimError::AlreadyClaimed),
            _ => {}
        }
        record.owner_id = Some(principal_id.to_string());
        record.status = crate::session::SessionStatus::Active;
        if let Some(name) = device_name.filter(|name| !name.trim().is_empty()) {
            record.device_name = Some(name.trim().to_string());
        }
        record.updated_at = chrono::Utc::now().timestamp();
        Ok(record.clone())
    }

    async fn get(&self, machine_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.state.lock().await.sessions.get(machine_id).cloned())
    }

    async fn find_by_code(&self, pairing_code: &str) -> Result<Option<SessionRecord>, StoreError> {
        let guard = self.state.lock().await;
        Ok(guard
            .codes
            .get(pairing_code)
            .and_then(|machine_id| guard.sessions.get(machine_id))
            .cloned())
    }
}

const SESSION_PREFIX: &str = "deskpilot:session:";
const CODE_PREFIX: &str = "deskpilot:code:";

// KEYS: session hash, code key
// ARGV: machine_id, pairing_code, owner_id, status, updated_at, ttl, code prefix
const UPSERT_LUA: &str = r#"
local holder = redis.call('GET', KEYS[2])
if holder and holder ~= ARGV[1] then
  return 0
end
local previous = redis.call('HGET', KEYS[1], 'pairing_code')
if previous and previous ~= ARGV[2] then
  redis.call('DEL', ARGV[7] .. previous)
end
redis.call('HSET', KEYS[1],
  'machine_id', ARGV[1],
  'pairing_code', ARGV[2],
  'owner_id', ARGV[3],
  'status', ARGV[4],
  'updated_at', ARGV[5])
redis.call('EXPIRE', KEYS[1], ARGV[6])
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[6])
return 1
"#;

// KEYS: code key
// ARGV: principal_id, device_name, updated_at, session prefix, pairing_code
const CLAIM_LUA: &str = r#"
local machine = redis.call('GET', KEYS[1])
if not machine then
  return {'not_found', ''}
end
local session = ARGV[4] .. machine
if redis.call('HGET', session, 'pairing_code') ~= ARGV[5] then
  return {'not_found', ''}
end
local owner = redis.call('HGET', session, 'owner_id')
if owner and owner ~= '' and owner ~= ARGV[1] then
  return {'already_claimed', machine}
end
redis.call('HSET', session, 'owner_id', ARGV[1], 'status', 'active', 'updated_at', ARGV[3])
if ARGV[2] ~= '' then
  redis.call('HSET', session, 'device_name', ARGV[2])
end
return {'claimed', machine}
"#;

/// Redis-backed store. Sessions are hashes so the claim script can
/// compare-and-set the owner field without decoding JSON.
#[derive(Clone)]
pub struct RedisSessionStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
    upsert_script: Arc<Script>,
    claim_script: Arc<Script>,
}

impl RedisSessionStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            ttl_seconds,
            upsert_script: Arc::new(Script::new(UPSERT_LUA)),
            claim_script: Arc::new(Script::new(CLAIM_LUA)),
        })
    }

    async fn load(&self, machine_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(format!("{SESSION_PREFIX}{machine_id}")).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(SessionRecord::from_fields(&fields))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn upsert(&self, registration: Registration) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord::new(
            registration.machine_id,
            registration.pairing_code,
            registration.owner_id,
        );
        let mut conn = self.redis.clone();
        let mut invocation = self.upsert_script.prepare_invoke();
        invocation
            .key(format!("{SESSION_PREFIX}{}", record.machine_id))
            .key(format!("{CODE_PREFIX}{}", record.pairing_code))
            .arg(&record.machine_id)
            .arg(&record.pairing_code)
            .arg(record.owner_id.as_deref().unwrap_or(""))
            .arg(record.status.as_str())
            .arg(record.updated_at)
            .arg(self.ttl_seconds)
            .arg(CODE_PREFIX);
        let stored: i64 = invocation.invoke_async(&mut conn).await?;
        if stored == 0 {
            return Err(StoreError::CodeInUse);
        }
        debug!(machine_id = %record.machine_id, "session upserted");
        // Re-read so a preserved device name is reflected.
        Ok(self.load(&record.machine_id).await?.unwrap_or(record))
    }

    async fn claim(
        &self,
        pairing_code: &str,
        principal_id: &str,
        device_name: Option<&str>,
    ) -> Result<SessionRecord, ClaimError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.claim_script.prepare_invoke();
        invocation
            .key(format!("{CODE_PREFIX}{pairing_code}"))
            .arg(principal_id)
            .arg(device_name.map(str::trim).unwrap_or(""))
            .arg(chrono::Utc::now().timestamp())
            .arg(SESSION_PREFIX)
            .arg(pairing_code);
        let (outcome, machine_id): (String, String) = invocation.invoke_async(&mut conn).await?;
        match outcome.as_str() {
            "claimed" => self
                .load(&machine_id)
                .await
                .map_err(|err| ClaimError::Backend(err.to_string()))?
                .ok_or(ClaimError::PairingNotFound),
            "already_claimed" => Err(ClaimError::AlreadyClaimed),
            _ => Err(ClaimError::PairingNotFound),
        }
    }

    async fn get(&self, machine_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.load(machine_id).await
    }

    async fn find_by_code(&self, pairing_code: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let machine_id: Option<String> = conn.get(format!("{CODE_PREFIX}{pairing_code}")).await?;
        match machine_id {
            Some(machine_id) => Ok(self
                .load(&machine_id)
                .await?
                .filter(|record| record.pairing_code == pairing_code)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    fn registration(machine: &str, code: &str, owner: Option<&str>) -> Registration {
        Registration {
            machine_id: machine.into(),
            pairing_code: code.into(),
            owner_id: owner.map(str::to_string),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_is_idempotent_and_replaces_code() {
        let store = InMemorySessionStore::new();
        store
            .upsert(registration("m-1", "111111", None))
            .await
            .unwrap();
        let record = store
            .upsert(registration("m-1", "222222", None))
            .await
            .unwrap();
        assert_eq!(record.pairing_code, "222222");
        assert_eq!(record.status, SessionStatus::Waiting);
        assert!(store.find_by_code("111111").await.unwrap().is_none());
        assert_eq!(
            store.find_by_code("222222").await.unwrap().unwrap().machine_id,
            "m-1"
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_rejects_code_held_by_other_machine() {
        let store = InMemorySessionStore::new();
        store
            .upsert(registration("m-1", "111111", None))
            .await
            .unwrap();
        let err = store
            .upsert(registration("m-2", "111111", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CodeInUse));
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_with_cached_owner_is_active() {
        let store = InMemorySessionStore::new();
        let record = store
            .upsert(registration("m-1", "111111", Some("u-1")))
            .await
            .unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.owner_id.as_deref(), Some("u-1"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn claim_sets_owner_and_device_name() {
        let store = InMemorySessionStore::new();
        store
            .upsert(registration("m-1", "482913", None))
            .await
            .unwrap();
        let record = store
            .claim("482913", "u-1", Some("Office PC"))
            .await
            .unwrap();
        assert_eq!(record.owner_id.as_deref(), Some("u-1"));
        assert_eq!(record.device_name.as_deref(), Some("Office PC"));
        assert_eq!(record.status, SessionStatus::Active);

        // Device name survives a restart-driven re-register.
        let again = store
            .upsert(registration("m-1", "555555", Some("u-1")))
            .await
            .unwrap();
        assert_eq!(again.device_name.as_deref(), Some("Office PC"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn claim_unknown_code_is_not_found() {
        let store = InMemorySessionStore::new();
        let err = store.claim("000000", "u-1", None).await.unwrap_err();
        assert_eq!(err, ClaimError::PairingNotFound);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_principal_is_rejected_but_owner_may_reclaim() {
        let store = InMemorySessionStore::new();
        store
            .upsert(registration("m-1", "482913", None))
            .await
            .unwrap();
        store.claim("482913", "u-1", None).await.unwrap();

        let err = store.claim("482913", "u-2", None).await.unwrap_err();
        assert_eq!(err, ClaimError::AlreadyClaimed);
        let again = store.claim("482913", "u-1", None).await.unwrap();
        assert_eq!(again.owner_id.as_deref(), Some("u-1"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let store = InMemorySessionStore::new();
        store
            .upsert(registration("m-1", "482913", None))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for idx in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim("482913", &format!("u-{idx}"), None).await
            }));
        }

        let mut winners = Vec::new();
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(record) => winners.push(record.owner_id.unwrap()),
                Err(ClaimError::AlreadyClaimed) => rejected += 1,
                Err(other) => panic!("unexpected claim error {other:?}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(rejected, 15);
        let stored = store.get("m-1").await.unwrap().unwrap();
        assert_eq!(stored.owner_id, Some(winners[0].clone()));
    }
}
