//! Reliable connection -- one UDP endpoint per peer with a simulated loss knob.
//!
//! The connection manager owns every connection. A connection only keeps
//! `Weak` handles back to its manager and broker; they resolve to `None`
//! once the owner is gone.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use dgi_protocol::{Message, MessageCodec, PeerIdentity};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::broker::{Broker, BrokerShared};
use crate::connection_manager::{ConnectionManager, ManagerShared};
use crate::dispatcher::Dispatcher;
use crate::error::ConnectionError;
use crate::reliability::{validate_reliability, LossPolicy};

/// Snapshot of a connection's traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Calls to `send` that reached the loss decision.
    pub attempted: u64,
    /// Datagrams handed to the socket.
    pub sent: u64,
    /// Datagrams discarded by the loss simulation.
    pub dropped: u64,
    /// Datagrams the socket refused.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    attempted: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Transport handle to a single peer.
pub struct ReliableConnection {
    peer: PeerIdentity,
    remote: SocketAddr,
    socket: UdpSocket,
    reliability: AtomicU8,
    loss: LossPolicy,
    closed: AtomicBool,
    /// Serializes sends so frames reach the socket in call order.
    send_lock: Mutex<()>,
    counters: Counters,
    manager: Weak<ManagerShared>,
    broker: Weak<BrokerShared>,
}

impl ReliableConnection {
    /// Bind a fresh socket for `peer` at `remote`.
    ///
    /// The connection inherits the manager's loss policy and the broker the
    /// manager is attached to (if any). Reliability starts at 100.
    pub async fn open(
        peer: PeerIdentity,
        remote: SocketAddr,
        manager: &ConnectionManager,
    ) -> Result<Self, ConnectionError> {
        let shared = manager.shared();
        Self::bind(
            peer,
            remote,
            shared.loss.clone(),
            Arc::downgrade(shared),
            shared.broker(),
        )
        .await
    }

    pub(crate) async fn bind(
        peer: PeerIdentity,
        remote: SocketAddr,
        loss: LossPolicy,
        manager: Weak<ManagerShared>,
        broker: Weak<BrokerShared>,
    ) -> Result<Self, ConnectionError> {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| ConnectionError::Bind {
                peer: peer.clone(),
                source,
            })?;

        tracing::debug!(
            %peer,
            %remote,
            local = ?socket.local_addr().ok(),
            "connection: socket bound"
        );

        Ok(Self {
            peer,
            remote,
            socket,
            reliability: AtomicU8::new(crate::reliability::DEFAULT_RELIABILITY),
            loss,
            closed: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            counters: Counters::default(),
            manager,
            broker,
        })
    }

    /// The socket owned by this connection.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn peer_identity(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn connection_manager(&self) -> Option<ConnectionManager> {
        self.manager.upgrade().map(ConnectionManager::from_shared)
    }

    pub fn broker(&self) -> Option<Broker> {
        self.broker.upgrade().map(Broker::from_shared)
    }

    /// Convenience: the dispatcher of the owning broker.
    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.broker.upgrade().map(|b| b.dispatcher.clone())
    }

    /// Set the delivery percentage. Values outside 0..=100 are rejected
    /// and leave the current value untouched.
    pub fn set_reliability(&self, value: i64) -> Result<(), ConnectionError> {
        let value = validate_reliability(value)?;
        let previous = self.reliability.swap(value, Ordering::Relaxed);
        if previous != value {
            tracing::info!(
                peer = %self.peer,
                from = previous,
                to = value,
                "connection: reliability changed"
            );
        }
        Ok(())
    }

    pub fn reliability(&self) -> u8 {
        self.reliability.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            attempted: self.counters.attempted.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Send one message to the peer.
    ///
    /// A simulated drop returns `Ok(())` exactly like a datagram lost in
    /// transit. Socket errors are returned to the caller.
    pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.peer.clone()));
        }
        let datagram = MessageCodec.encode_datagram(message)?;

        let _guard = self.send_lock.lock().await;
        self.counters.attempted.fetch_add(1, Ordering::Relaxed);

        if !self.loss.should_deliver(self.reliability()) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                peer = %self.peer,
                kind = %message.kind,
                reliability = self.reliability(),
                "connection: simulated drop"
            );
            return Ok(());
        }

        match self.socket.send_to(&datagram, self.remote).await {
            Ok(_) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(source) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    peer = %self.peer,
                    remote = %self.remote,
                    "connection: send failed: {source}"
                );
                Err(ConnectionError::Send {
                    peer: self.peer.clone(),
                    addr: self.remote,
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for ReliableConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableConnection")
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("reliability", &self.reliability())
            .field("closed", &self.is_closed())
            .finish()
    }
}
