//! Connection manager -- thread-safe registry of peer connections.
//!
//! Maps PeerIdentity → ReliableConnection. At most one live connection per
//! identity; creation happens under the write lock so concurrent callers
//! always share the same connection.
//!
//! The host table is bounded by `max_peers`. Unknown sources past the bound
//! are not recorded, so they never get a connection or a socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use dgi_protocol::PeerIdentity;
use tokio::sync::RwLock;

use crate::broker::BrokerShared;
use crate::connection::ReliableConnection;
use crate::error::{BrokerError, ConnectionError};
use crate::reliability::{validate_reliability, LossPolicy, DEFAULT_RELIABILITY};

/// Default bound on known hosts and live connections.
pub const DEFAULT_MAX_PEERS: usize = 1024;

pub(crate) struct ManagerShared {
    connections: RwLock<HashMap<PeerIdentity, Arc<ReliableConnection>>>,
    hosts: RwLock<HashMap<PeerIdentity, SocketAddr>>,
    /// Reliability to apply to connections created later.
    reliability: RwLock<HashMap<PeerIdentity, u8>>,
    default_reliability: u8,
    max_peers: usize,
    pub(crate) loss: LossPolicy,
    broker: OnceLock<Weak<BrokerShared>>,
}

impl ManagerShared {
    pub(crate) fn broker(&self) -> Weak<BrokerShared> {
        self.broker.get().cloned().unwrap_or_default()
    }
}

/// Shared handle to the connection registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerShared>,
}

impl ConnectionManager {
    pub fn new(loss: LossPolicy) -> Self {
        Self::build(loss, DEFAULT_RELIABILITY, DEFAULT_MAX_PEERS)
    }

    /// Create a manager whose new connections start at `reliability`.
    pub fn with_default_reliability(
        loss: LossPolicy,
        reliability: i64,
    ) -> Result<Self, ConnectionError> {
        Self::with_limits(loss, reliability, DEFAULT_MAX_PEERS)
    }

    /// Like `with_default_reliability`, with at most `max_peers` known hosts.
    pub fn with_limits(
        loss: LossPolicy,
        reliability: i64,
        max_peers: usize,
    ) -> Result<Self, ConnectionError> {
        let reliability = validate_reliability(reliability)?;
        Ok(Self::build(loss, reliability, max_peers))
    }

    fn build(loss: LossPolicy, default_reliability: u8, max_peers: usize) -> Self {
        Self {
            inner: Arc::new(ManagerShared {
                connections: RwLock::new(HashMap::new()),
                hosts: RwLock::new(HashMap::new()),
                reliability: RwLock::new(HashMap::new()),
                default_reliability,
                max_peers,
                loss,
                broker: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn from_shared(inner: Arc<ManagerShared>) -> Self {
        Self { inner }
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.inner
    }

    /// Bind the manager to its broker. Only the first attachment sticks.
    pub(crate) fn attach_broker(&self, broker: Weak<BrokerShared>) {
        if self.inner.broker.set(broker).is_err() {
            tracing::warn!("manager: already attached to a broker, ignoring");
        }
    }

    pub fn loss_policy(&self) -> &LossPolicy {
        &self.inner.loss
    }

    pub fn max_peers(&self) -> usize {
        self.inner.max_peers
    }

    /// Record (or update) the network address of a peer.
    ///
    /// A changed address evicts the existing connection; the next send binds
    /// a fresh one to the new address. Returns false when the peer is new and
    /// the host table is full.
    pub async fn put_host(&self, peer: PeerIdentity, addr: SocketAddr) -> bool {
        let previous = {
            let mut hosts = self.inner.hosts.write().await;
            if !hosts.contains_key(&peer) && hosts.len() >= self.inner.max_peers {
                tracing::debug!(
                    %peer,
                    %addr,
                    max = self.inner.max_peers,
                    "manager: host table full"
                );
                return false;
            }
            hosts.insert(peer.clone(), addr)
        };
        match previous {
            None => tracing::debug!(%peer, %addr, "manager: host registered"),
            Some(old) if old != addr => {
                tracing::info!(%peer, %old, new = %addr, "manager: host address changed");
                self.evict_stale(&peer, addr).await;
            }
            Some(_) => {}
        }
        true
    }

    /// Drop the connection for `peer` unless it already targets `addr`.
    async fn evict_stale(&self, peer: &PeerIdentity, addr: SocketAddr) {
        let mut connections = self.inner.connections.write().await;
        if connections.get(peer).is_some_and(|c| c.remote_addr() != addr) {
            if let Some(conn) = connections.remove(peer) {
                conn.close();
                tracing::info!(
                    %peer,
                    old = %conn.remote_addr(),
                    pool_size = connections.len(),
                    "manager: stale connection evicted"
                );
            }
        }
    }

    pub async fn host(&self, peer: &PeerIdentity) -> Option<SocketAddr> {
        self.inner.hosts.read().await.get(peer).copied()
    }

    /// Snapshot of the host table.
    pub async fn hosts(&self) -> HashMap<PeerIdentity, SocketAddr> {
        self.inner.hosts.read().await.clone()
    }

    /// Return the connection for `peer`, creating it if absent.
    pub async fn get_or_create_connection(
        &self,
        peer: &PeerIdentity,
    ) -> Result<Arc<ReliableConnection>, BrokerError> {
        if let Some(conn) = self.inner.connections.read().await.get(peer) {
            return Ok(conn.clone());
        }

        let mut connections = self.inner.connections.write().await;
        // Another caller may have won the race between the two locks.
        if let Some(conn) = connections.get(peer) {
            return Ok(conn.clone());
        }
        if connections.len() >= self.inner.max_peers {
            return Err(BrokerError::ConnectionLimit {
                max: self.inner.max_peers,
            });
        }

        let addr = self
            .host(peer)
            .await
            .ok_or_else(|| BrokerError::UnknownPeer(peer.clone()))?;
        let reliability = self
            .inner
            .reliability
            .read()
            .await
            .get(peer)
            .copied()
            .unwrap_or(self.inner.default_reliability);

        let conn = ReliableConnection::bind(
            peer.clone(),
            addr,
            self.inner.loss.clone(),
            Arc::downgrade(&self.inner),
            self.inner.broker(),
        )
        .await?;
        conn.set_reliability(reliability as i64)?;

        let conn = Arc::new(conn);
        connections.insert(peer.clone(), conn.clone());
        tracing::info!(
            %peer,
            %addr,
            reliability,
            pool_size = connections.len(),
            "manager: connection created"
        );
        Ok(conn)
    }

    /// Look up a connection. Absence is a normal outcome.
    pub async fn find_connection(&self, peer: &PeerIdentity) -> Option<Arc<ReliableConnection>> {
        self.inner.connections.read().await.get(peer).cloned()
    }

    /// Remove and close the connection for `peer`. No-op when absent.
    pub async fn remove_connection(&self, peer: &PeerIdentity) -> Option<Arc<ReliableConnection>> {
        let mut connections = self.inner.connections.write().await;
        let removed = connections.remove(peer);
        if let Some(conn) = &removed {
            conn.close();
            tracing::info!(
                %peer,
                pool_size = connections.len(),
                "manager: connection removed"
            );
        }
        removed
    }

    /// Close and drop every connection.
    pub async fn remove_all(&self) -> usize {
        let drained: Vec<_> = self.inner.connections.write().await.drain().collect();
        for (_, conn) in &drained {
            conn.close();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "manager: all connections removed");
        }
        drained.len()
    }

    /// Snapshot of the identities with a live connection.
    pub async fn list_peers(&self) -> PeerList {
        let mut peers: Vec<PeerIdentity> =
            self.inner.connections.read().await.keys().cloned().collect();
        peers.sort();
        PeerList::new(peers)
    }

    /// Set reliability for `peer` now (if connected) and for any later connection.
    pub async fn apply_reliability(
        &self,
        peer: &PeerIdentity,
        value: i64,
    ) -> Result<(), ConnectionError> {
        let value = validate_reliability(value)?;
        self.inner
            .reliability
            .write()
            .await
            .insert(peer.clone(), value);
        if let Some(conn) = self.find_connection(peer).await {
            conn.set_reliability(value as i64)?;
        }
        Ok(())
    }

    /// The override recorded for `peer`, if any.
    pub async fn reliability_override(&self, peer: &PeerIdentity) -> Option<u8> {
        self.inner.reliability.read().await.get(peer).copied()
    }

    /// Drop the override for `peer` and return a live connection to the default.
    pub async fn clear_reliability(&self, peer: &PeerIdentity) -> bool {
        let removed = self.inner.reliability.write().await.remove(peer).is_some();
        if let Some(conn) = self.find_connection(peer).await {
            if let Err(e) = conn.set_reliability(self.inner.default_reliability as i64) {
                tracing::warn!(%peer, "manager: reliability reset failed: {e}");
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.connections.read().await.is_empty()
    }
}

/// Finite, restartable sequence of peer identities captured at one instant.
#[derive(Debug, Clone)]
pub struct PeerList {
    peers: Arc<[PeerIdentity]>,
    pos: usize,
}

impl PeerList {
    fn new(peers: Vec<PeerIdentity>) -> Self {
        Self {
            peers: peers.into(),
            pos: 0,
        }
    }

    /// A fresh iterator over the same snapshot, starting from the beginning.
    pub fn restart(&self) -> Self {
        Self {
            peers: self.peers.clone(),
            pos: 0,
        }
    }

    pub fn as_slice(&self) -> &[PeerIdentity] {
        &self.peers
    }
}

impl Iterator for PeerList {
    type Item = PeerIdentity;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.peers.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.peers.len() - self.pos;
        (left, Some(left))
    }
}

impl ExactSizeIterator for PeerList {}
