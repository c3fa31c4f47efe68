use std::{
    collections::HashMap,
    env,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    frame::Usage,
    models::WizardStage,
    relay::{RelayOutcome, RelaySummary},
};

/// Last known state of one wizard session, written after every relay that
/// carried a session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub stage: WizardStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub updated_at: i64,
}

impl SessionRecord {
    pub fn from_summary(summary: &RelaySummary) -> Option<Self> {
        let session_id = summary.session_token.clone()?;
        let outcome = match &summary.outcome {
            RelayOutcome::Failed(error) => error.kind().to_owned(),
            other => other.label().to_owned(),
        };
        Some(Self {
            session_id,
            stage: summary.stage,
            upstream_session_id: summary.upstream_session_id.clone(),
            outcome,
            usage: summary.usage.clone(),
            updated_at: unix_timestamp(),
        })
    }
}

pub struct SessionStore {
    backend: StoreBackend,
    ttl: Duration,
}

enum StoreBackend {
    Memory(Mutex<HashMap<String, MemoryItem>>),
    Redis {
        client: redis::Client,
        prefix: String,
    },
}

struct MemoryItem {
    record: SessionRecord,
    expires_at: Instant,
}

impl SessionStore {
    pub fn memory(ttl: Duration) -> Self {
        Self {
            backend: StoreBackend::Memory(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env(ttl: Duration) -> Self {
        let backend = match env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => match redis::Client::open(url.clone()) {
                Ok(client) => {
                    let prefix =
                        env::var("RELAY_REDIS_PREFIX").unwrap_or_else(|_| "relay".to_owned());
                    StoreBackend::Redis { client, prefix }
                }
                Err(error) => {
                    warn!(error = %error, "invalid REDIS_URL, falling back to in-memory session store");
                    StoreBackend::Memory(Mutex::new(HashMap::new()))
                }
            },
            _ => StoreBackend::Memory(Mutex::new(HashMap::new())),
        };

        Self { backend, ttl }
    }

    pub fn kind(&self) -> &'static str {
        match self.backend {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Redis { .. } => "redis",
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let mut guard = store.lock().await;
                let item = guard.get(session_id)?;
                if item.expires_at <= Instant::now() {
                    guard.remove(session_id);
                    return None;
                }
                Some(item.record.clone())
            }
            StoreBackend::Redis { client, prefix } => {
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "failed to get redis connection for session get");
                        return None;
                    }
                };
                let key = format!("{prefix}:session:{session_id}");
                let payload = match connection.get::<_, Option<String>>(&key).await {
                    Ok(payload) => payload?,
                    Err(error) => {
                        warn!(error = %error, "redis get failed for session");
                        return None;
                    }
                };
                match serde_json::from_str::<SessionRecord>(&payload) {
                    Ok(record) => Some(record),
                    Err(error) => {
                        warn!(error = %error, "failed to decode stored session record");
                        None
                    }
                }
            }
        }
    }

    pub async fn put(&self, record: &SessionRecord) {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let now = Instant::now();
                let mut guard = store.lock().await;
                guard.retain(|_, item| item.expires_at > now);
                guard.insert(
                    record.session_id.clone(),
                    MemoryItem {
                        record: record.clone(),
                        expires_at: now + self.ttl,
                    },
                );
            }
            StoreBackend::Redis { client, prefix } => {
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "failed to get redis connection for session put");
                        return;
                    }
                };

                let payload = match serde_json::to_string(record) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(error = %error, "failed to serialize session record");
                        return;
                    }
                };

                let key = format!("{prefix}:session:{}", record.session_id);
                if let Err(error) = connection
                    .set_ex::<_, _, ()>(&key, payload, self.ttl.as_secs().max(1))
                    .await
                {
                    warn!(error = %error, "redis set failed for session");
                }
            }
        }
    }

    /// Stores the record for a finished relay, if it belonged to a session.
    pub async fn record(&self, summary: &RelaySummary) {
        if let Some(record) = SessionRecord::from_summary(summary) {
            self.put(&record).await;
        }
    }
}

fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RelayError;

    fn summary(session_token: Option<&str>, outcome: RelayOutcome) -> RelaySummary {
        RelaySummary {
            request_id: "relay_test".to_owned(),
            stage: WizardStage::Feasibility,
            session_token: session_token.map(str::to_owned),
            upstream_session_id: Some("up-1".to_owned()),
            outcome,
            usage: Some(Usage::new(5, 6)),
            frames: 4,
            malformed: 0,
            elapsed: Duration::from_millis(12),
        }
    }

    #[tokio::test]
    async fn records_are_stored_per_session() {
        let store = SessionStore::memory(Duration::from_secs(60));
        store
            .record(&summary(Some("wizard_1"), RelayOutcome::Completed))
            .await;

        let record = store.get("wizard_1").await.expect("record should exist");
        assert_eq!(record.stage, WizardStage::Feasibility);
        assert_eq!(record.outcome, "completed");
        assert_eq!(record.upstream_session_id.as_deref(), Some("up-1"));
        assert_eq!(record.usage.map(|usage| usage.total_tokens), Some(11));
    }

    #[tokio::test]
    async fn anonymous_relays_are_not_stored() {
        let store = SessionStore::memory(Duration::from_secs(60));
        assert!(SessionRecord::from_summary(&summary(None, RelayOutcome::Completed)).is_none());
        store.record(&summary(None, RelayOutcome::Completed)).await;
        assert!(store.get("").await.is_none());
    }

    #[tokio::test]
    async fn failed_outcome_records_error_kind() {
        let record = SessionRecord::from_summary(&summary(
            Some("wizard_2"),
            RelayOutcome::Failed(RelayError::TransportInterrupted("reset".to_owned())),
        ))
        .expect("record");
        assert_eq!(record.outcome, "transport_interrupted");
    }

    async fn stored_keys(store: &SessionStore) -> Vec<String> {
        let StoreBackend::Memory(map) = &store.backend else {
            panic!("expected memory backend");
        };
        let mut keys = map.lock().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn writes_sweep_expired_records_nobody_reads() {
        let store = SessionStore::memory(Duration::from_millis(20));
        for session in ["wizard_a", "wizard_b", "wizard_c"] {
            store
                .record(&summary(Some(session), RelayOutcome::Completed))
                .await;
        }
        assert_eq!(stored_keys(&store).await.len(), 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        store
            .record(&summary(Some("wizard_d"), RelayOutcome::Completed))
            .await;

        assert_eq!(stored_keys(&store).await, vec!["wizard_d".to_owned()]);
    }

    #[tokio::test]
    async fn expired_records_are_evicted() {
        let store = SessionStore::memory(Duration::ZERO);
        store
            .record(&summary(Some("wizard_3"), RelayOutcome::Completed))
            .await;
        assert!(store.get("wizard_3").await.is_none());
    }
}
