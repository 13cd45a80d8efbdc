//! Reliability profile -- per-peer link quality read from a TOML file.
//!
//! ```toml
//! [reliability]
//! "agent-b" = 80
//! "agent-c" = 0
//! ```
//!
//! The file is re-read periodically so link quality can be changed on a
//! running agent. Removing an entry restores whatever override the peer had
//! before the profile first listed it, or the node default when it had none.
//! A file that fails to load leaves the last applied values in place.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dgi_protocol::PeerIdentity;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::broker::{Broker, TimerHandle};
use crate::connection_manager::ConnectionManager;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    #[serde(default)]
    pub reliability: BTreeMap<String, i64>,
}

impl NetworkProfile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply every valid entry. Bad entries are logged and skipped.
    pub async fn apply(&self, manager: &ConnectionManager) -> usize {
        let mut applied = 0;
        for (name, &value) in &self.reliability {
            let peer = match PeerIdentity::new(name.as_str()) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!(entry = %name, "profile: skipping entry: {e}");
                    continue;
                }
            };
            match manager.apply_reliability(&peer, value).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(%peer, value, "profile: skipping entry: {e}"),
            }
        }
        tracing::debug!(applied, total = self.reliability.len(), "profile: applied");
        applied
    }

    /// Identities named by well-formed entries.
    fn listed(&self) -> HashSet<PeerIdentity> {
        self.reliability
            .keys()
            .filter_map(|name| PeerIdentity::new(name.as_str()).ok())
            .collect()
    }
}

/// Applies successive versions of a profile and undoes entries that vanish.
#[derive(Debug, Default)]
pub struct ProfileTracker {
    /// Override each listed peer had before the profile touched it.
    baseline: HashMap<PeerIdentity, Option<u8>>,
}

impl ProfileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `profile`, then restore peers the previous version listed but
    /// this one does not. Returns the number of entries applied.
    pub async fn apply(&mut self, profile: &NetworkProfile, manager: &ConnectionManager) -> usize {
        let listed = profile.listed();
        for peer in &listed {
            if !self.baseline.contains_key(peer) {
                let prior = manager.reliability_override(peer).await;
                self.baseline.insert(peer.clone(), prior);
            }
        }

        let applied = profile.apply(manager).await;

        let dropped: Vec<PeerIdentity> = self
            .baseline
            .keys()
            .filter(|peer| !listed.contains(*peer))
            .cloned()
            .collect();
        for peer in dropped {
            match self.baseline.remove(&peer).flatten() {
                Some(prior) => {
                    if let Err(e) = manager.apply_reliability(&peer, i64::from(prior)).await {
                        tracing::warn!(%peer, "profile: restore failed: {e}");
                    }
                }
                None => {
                    manager.clear_reliability(&peer).await;
                }
            }
            tracing::info!(%peer, "profile: entry removed, reliability restored");
        }
        applied
    }
}

/// Reload `path` every `every` on the broker's loop until it stops.
///
/// Returns the handle of the first pending reload.
pub fn schedule_profile_reload(broker: &Broker, path: PathBuf, every: Duration) -> TimerHandle {
    let tracker = Arc::new(Mutex::new(ProfileTracker::new()));
    schedule_reload(broker, path, every, tracker)
}

fn schedule_reload(
    broker: &Broker,
    path: PathBuf,
    every: Duration,
    tracker: Arc<Mutex<ProfileTracker>>,
) -> TimerHandle {
    broker.schedule(every, move |broker| {
        let manager = broker.connection_manager().clone();
        let file = path.clone();
        let state = tracker.clone();
        tokio::spawn(async move {
            match NetworkProfile::load(&file) {
                Ok(profile) => {
                    state.lock().await.apply(&profile, &manager).await;
                }
                Err(e) => tracing::warn!(path = %file.display(), "profile: reload failed: {e}"),
            }
        });
        schedule_reload(broker, path, every, tracker);
    })
}
