//! Partition manager for session-aware message distribution.
//!
//! Messages with the same partition key always hash to the same partition
//! (`sha256(key) mod partition_count`), and a worker only processes the
//! partitions it owns. Session tracking is in-process only; losing it on
//! restart is fine because partition assignment is deterministic.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::util::{epoch_millis, epoch_secs, nested_value, scalar_string};

/// Strategy for partition assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Hash-based consistent distribution.
    Hash,
    /// Direct key-based assignment (same hashing as `hash`).
    Key,
    /// Time-sliced; not truly round-robin across workers, prefer `hash`.
    RoundRobin,
    /// Sticky sessions: same key, same partition.
    Sticky,
}

/// What to do with a message this worker does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Acknowledge and report a skipped result (fast, possibly lossy if
    /// ownership is misconfigured).
    Ack,
    /// Nack and requeue so another worker picks it up (safe, can loop).
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    pub enabled: bool,
    pub strategy: PartitionStrategy,
    /// Number of logical partitions; should be >= worker count.
    pub partition_count: u32,
    pub partition_key_field: String,
    pub session_key_field: String,
    /// Session affinity TTL in seconds; 0 disables expiry.
    pub sticky_session_ttl: u64,
    pub skip_policy: SkipPolicy,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: PartitionStrategy::Sticky,
            partition_count: 10,
            partition_key_field: "metadata.partition_key".to_string(),
            session_key_field: "metadata.session_id".to_string(),
            sticky_session_ttl: 3600,
            skip_policy: SkipPolicy::Ack,
        }
    }
}

/// A live sticky session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub partition_id: u32,
    pub worker_id: String,
    /// Epoch seconds of the last message.
    pub last_seen: u64,
    pub message_count: u64,
}

pub struct PartitionManager {
    config: PartitionSettings,
    worker_id: String,
    sessions: parking_lot::Mutex<HashMap<String, SessionInfo>>,
    owned: parking_lot::RwLock<BTreeSet<u32>>,
}

impl PartitionManager {
    pub fn new(config: PartitionSettings, worker_id: String) -> Self {
        info!(
            "Partition manager initialized for {} ({:?}, {} partitions)",
            worker_id, config.strategy, config.partition_count
        );
        Self {
            config,
            worker_id,
            sessions: parking_lot::Mutex::new(HashMap::new()),
            owned: parking_lot::RwLock::new(BTreeSet::new()),
        }
    }

    /// `sha256(key) mod partition_count`, over the full digest so any
    /// process computing it independently agrees.
    fn hash_partition(&self, key: &str) -> u32 {
        let digest = Sha256::digest(key.as_bytes());
        let n = self.config.partition_count as u128;
        let remainder = digest
            .iter()
            .fold(0u128, |acc, byte| (acc * 256 + *byte as u128) % n);
        remainder as u32
    }

    /// Partition for a key under the configured strategy.
    pub fn partition_for_key(&self, key: &str) -> u32 {
        match self.config.strategy {
            PartitionStrategy::Hash | PartitionStrategy::Key | PartitionStrategy::Sticky => {
                self.hash_partition(key)
            }
            PartitionStrategy::RoundRobin => {
                (epoch_millis() % self.config.partition_count as u128) as u32
            }
        }
    }

    /// Distribute partitions across `worker_count` workers: worker `w`
    /// owns every partition `p` with `p % worker_count == w`.
    pub fn assign_worker_partitions(&self, worker_count: usize, worker_index: usize) {
        let mut owned = self.owned.write();
        owned.clear();
        for partition in 0..self.config.partition_count {
            if partition as usize % worker_count.max(1) == worker_index {
                owned.insert(partition);
            }
        }
        info!(
            "Worker {} owns partitions {:?} ({} of {} workers)",
            self.worker_id,
            owned,
            worker_index,
            worker_count
        );
    }

    /// Override ownership, for external coordinators.
    pub fn set_assigned_partitions(&self, partitions: BTreeSet<u32>) {
        let mut owned = self.owned.write();
        *owned = partitions;
        info!("Worker {} partitions set to {:?}", self.worker_id, owned);
    }

    pub fn owned_partitions(&self) -> BTreeSet<u32> {
        self.owned.read().clone()
    }

    fn extract_key(&self, message: &Value, field: &str) -> Option<String> {
        nested_value(message, field)
            .filter(|v| !v.is_null())
            .map(scalar_string)
            .filter(|s| !s.is_empty())
    }

    /// Partition for a message, preferring the partition key over the
    /// session id. `None` when the message carries neither.
    pub fn partition_for_message(&self, message: &Value) -> Option<u32> {
        if !self.config.enabled {
            return None;
        }
        let key = self
            .extract_key(message, &self.config.partition_key_field)
            .or_else(|| self.extract_key(message, &self.config.session_key_field));
        match key {
            Some(key) => Some(self.partition_for_key(&key)),
            None => {
                warn!(
                    "No partition key in message {}",
                    message
                        .get("correlation_id")
                        .map(scalar_string)
                        .unwrap_or_default()
                );
                None
            }
        }
    }

    /// Whether this worker owns the message's partition. Messages without
    /// a key, and disabled managers, always process.
    pub fn should_process(&self, message: &Value) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.partition_for_message(message) {
            Some(partition) => self.owned.read().contains(&partition),
            None => true,
        }
    }

    /// Record session activity for a processed message.
    pub fn track_session(&self, message: &Value) {
        let Some(session_id) = self.extract_key(message, &self.config.session_key_field) else {
            return;
        };
        let Some(partition_id) = self.partition_for_message(message) else {
            return;
        };

        let mut sessions = self.sessions.lock();
        let entry = sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionInfo {
                session_id: session_id.clone(),
                partition_id,
                worker_id: self.worker_id.clone(),
                last_seen: 0,
                message_count: 0,
            });
        entry.last_seen = epoch_secs();
        entry.message_count += 1;
        debug!(
            "Session {} tracked on partition {} ({} messages)",
            session_id, partition_id, entry.message_count
        );
    }

    /// Drop sessions idle longer than the sticky TTL.
    pub fn cleanup_expired_sessions(&self) {
        if self.config.sticky_session_ttl == 0 {
            return;
        }
        let cutoff = epoch_secs().saturating_sub(self.config.sticky_session_ttl);
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.last_seen > cutoff);
        let expired = before - sessions.len();
        if expired > 0 {
            info!("Expired {} idle sessions", expired);
        }
    }

    pub fn session_stats(&self) -> Value {
        let sessions = self.sessions.lock();
        let owned = self.owned.read();
        serde_json::json!({
            "active_sessions": sessions.len(),
            "assigned_partitions": owned.len(),
            "partition_ids": owned.iter().collect::<Vec<_>>(),
            "total_messages": sessions.values().map(|s| s.message_count).sum::<u64>(),
        })
    }

    pub fn skip_policy(&self) -> SkipPolicy {
        self.config.skip_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(partition_count: u32) -> PartitionManager {
        let config = PartitionSettings {
            enabled: true,
            partition_count,
            ..Default::default()
        };
        PartitionManager::new(config, "worker-0".to_string())
    }

    fn session_message(session: &str) -> Value {
        json!({
            "correlation_id": "cid",
            "payload": {},
            "metadata": {"session_id": session},
        })
    }

    #[test]
    fn partition_assignment_is_deterministic() {
        let a = manager(4);
        let b = manager(4);
        for key in ["sess-X", "sess-Y", "user-123", ""] {
            assert_eq!(a.partition_for_key(key), b.partition_for_key(key));
        }
        assert!(a.partition_for_key("sess-X") < 4);
    }

    #[test]
    fn worker_ownership_covers_all_partitions_disjointly() {
        let n = 10;
        let workers = 3;
        let mut seen = BTreeSet::new();
        for index in 0..workers {
            let m = manager(n);
            m.assign_worker_partitions(workers, index);
            for p in m.owned_partitions() {
                // Disjoint: no partition owned twice.
                assert!(seen.insert(p), "partition {} owned by two workers", p);
            }
        }
        // Complete: every partition owned by someone.
        assert_eq!(seen, (0..n).collect());
    }

    #[test]
    fn exactly_one_of_two_workers_accepts() {
        let w0 = manager(4);
        w0.assign_worker_partitions(2, 0);
        let w1 = manager(4);
        w1.assign_worker_partitions(2, 1);

        for i in 0..10 {
            let msg = session_message("sess-X");
            let accepted =
                [w0.should_process(&msg), w1.should_process(&msg)];
            assert_eq!(
                accepted.iter().filter(|a| **a).count(),
                1,
                "submission {} accepted by {} workers",
                i,
                accepted.iter().filter(|a| **a).count()
            );
        }
    }

    #[test]
    fn disabled_manager_processes_everything() {
        let m = PartitionManager::new(PartitionSettings::default(), "w".to_string());
        assert!(m.should_process(&session_message("any")));
        assert_eq!(m.partition_for_message(&session_message("any")), None);
    }

    #[test]
    fn message_without_key_processes_everywhere() {
        let m = manager(4);
        m.assign_worker_partitions(2, 0);
        let msg = json!({"correlation_id": "cid", "payload": {}, "metadata": {}});
        assert!(m.should_process(&msg));
    }

    #[test]
    fn partition_key_preferred_over_session() {
        let m = manager(16);
        let msg = json!({
            "payload": {},
            "metadata": {"partition_key": "pk-1", "session_id": "sess-1"},
        });
        assert_eq!(
            m.partition_for_message(&msg),
            Some(m.partition_for_key("pk-1"))
        );
    }

    #[test]
    fn round_robin_stays_in_range() {
        let config = PartitionSettings {
            enabled: true,
            strategy: PartitionStrategy::RoundRobin,
            partition_count: 4,
            ..Default::default()
        };
        let m = PartitionManager::new(config, "w".to_string());
        for _ in 0..20 {
            assert!(m.partition_for_key("ignored") < 4);
        }
    }

    #[test]
    fn session_tracking_and_cleanup() {
        let m = manager(4);
        m.assign_worker_partitions(1, 0);

        m.track_session(&session_message("sess-1"));
        m.track_session(&session_message("sess-1"));
        m.track_session(&session_message("sess-2"));

        let stats = m.session_stats();
        assert_eq!(stats["active_sessions"], 2);
        assert_eq!(stats["total_messages"], 3);

        // Nothing is older than the TTL yet.
        m.cleanup_expired_sessions();
        assert_eq!(m.session_stats()["active_sessions"], 2);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let config = PartitionSettings {
            enabled: true,
            sticky_session_ttl: 0,
            partition_count: 4,
            ..Default::default()
        };
        let m = PartitionManager::new(config, "w".to_string());
        m.track_session(&session_message("sess-1"));
        m.cleanup_expired_sessions();
        assert_eq!(m.session_stats()["active_sessions"], 1);
    }
}
