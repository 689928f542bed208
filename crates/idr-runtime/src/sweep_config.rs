use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use idr_identity::{normalize_ip, sanitize_segment};
use idr_kv::{KvError, KvStore};
use idr_schemas::DeviceUpdate;

/// `agents/<agent_id>/checkers/sweep/<source>.json`
pub fn sweep_config_path(agent_id: &str, source: &str) -> String {
    format!(
        "agents/{}/checkers/sweep/{}.json",
        sanitize_segment(agent_id.trim()),
        sanitize_segment(source.trim())
    )
}

/// Document written for the sweep checker of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepTargets {
    pub source: String,
    /// Unique host addresses, sorted.
    pub hosts: Vec<String>,
}

impl SweepTargets {
    /// Hosts of every available update with a valid IP.
    pub fn from_updates(source: &str, updates: &[DeviceUpdate]) -> Self {
        let hosts: BTreeSet<String> = updates
            .iter()
            .filter(|u| !u.is_retraction())
            .filter_map(|u| normalize_ip(&u.ip))
            .collect();
        Self {
            source: source.to_string(),
            hosts: hosts.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepWrite {
    Written { path: String, hosts: usize, revision: u64 },
    /// No hosts: the document was removed.
    Deleted { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWriteError {
    MissingAgentId { source: String },
    Encode(String),
    Store { path: String, error: KvError },
}

impl fmt::Display for ConfigWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWriteError::MissingAgentId { source } => {
                write!(f, "no agent id for source {source}; sweep config not written")
            }
            ConfigWriteError::Encode(msg) => write!(f, "sweep config encode failed: {msg}"),
            ConfigWriteError::Store { path, error } => write!(f, "sweep config {path}: {error}"),
        }
    }
}

impl std::error::Error for ConfigWriteError {}

/// Writes derived sweep-checker documents to the key-value store.
pub struct SweepConfigWriter<S> {
    store: S,
}

impl<S: KvStore> SweepConfigWriter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Write (or delete, when empty) the sweep targets of `source` for
    /// `agent_id`.
    pub async fn write(
        &self,
        agent_id: &str,
        source: &str,
        updates: &[DeviceUpdate],
    ) -> Result<SweepWrite, ConfigWriteError> {
        if agent_id.trim().is_empty() {
            return Err(ConfigWriteError::MissingAgentId {
                source: source.to_string(),
            });
        }
        let path = sweep_config_path(agent_id, source);
        let targets = SweepTargets::from_updates(source, updates);

        if targets.hosts.is_empty() {
            self.store
                .delete(&path)
                .await
                .map_err(|error| ConfigWriteError::Store { path: path.clone(), error })?;
            return Ok(SweepWrite::Deleted { path });
        }

        let body = serde_json::to_vec(&targets).map_err(|e| ConfigWriteError::Encode(e.to_string()))?;
        let revision = self
            .store
            .put(&path, body)
            .await
            .map_err(|error| ConfigWriteError::Store { path: path.clone(), error })?;
        Ok(SweepWrite::Written {
            path,
            hosts: targets.hosts.len(),
            revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use idr_kv::MemoryKvStore;
    use idr_schemas::{meta, sources};

    fn update(ip: &str) -> DeviceUpdate {
        DeviceUpdate::observed(sources::ARMIS, "default", ip, Utc::now())
    }

    #[test]
    fn path_is_sanitised() {
        assert_eq!(
            sweep_config_path("agent-1", "armis"),
            "agents/agent-1/checkers/sweep/armis.json"
        );
        assert_eq!(
            sweep_config_path("a/b", "armis"),
            "agents/a=2Fb/checkers/sweep/armis.json"
        );
    }

    #[test]
    fn targets_are_unique_sorted_hosts() {
        let mut gone = update("10.0.0.9");
        gone.is_available = false;
        gone.metadata.insert(meta::DELETED.to_string(), "true".to_string());
        let t = SweepTargets::from_updates(
            "armis",
            &[update("10.0.0.2/32"), update("10.0.0.1"), update("10.0.0.2"), update("junk"), gone],
        );
        assert_eq!(t.hosts, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    }

    #[tokio::test]
    async fn write_then_delete_when_empty() {
        let kv = MemoryKvStore::new();
        let w = SweepConfigWriter::new(&kv);

        let out = w.write("agent-1", "armis", &[update("10.0.0.1")]).await.unwrap();
        let path = sweep_config_path("agent-1", "armis");
        assert!(matches!(out, SweepWrite::Written { hosts: 1, .. }));
        let stored: SweepTargets = serde_json::from_slice(&kv.get_raw(&path).unwrap().0).unwrap();
        assert_eq!(stored.hosts, vec!["10.0.0.1".to_string()]);

        let out = w.write("agent-1", "armis", &[]).await.unwrap();
        assert_eq!(out, SweepWrite::Deleted { path: path.clone() });
        assert!(kv.get_raw(&path).is_none());
    }

    #[tokio::test]
    async fn missing_agent_id_aborts_write() {
        let kv = MemoryKvStore::new();
        let w = SweepConfigWriter::new(&kv);
        let err = w.write(" ", "armis", &[update("10.0.0.1")]).await.unwrap_err();
        assert_eq!(
            err,
            ConfigWriteError::MissingAgentId {
                source: "armis".to_string()
            }
        );
        assert!(kv.is_empty());
    }
}
