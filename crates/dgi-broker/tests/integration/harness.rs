//! Test harness for in-process dgi-broker integration tests.
//!
//! TestAgent binds a broker on 127.0.0.1:0, records every inbound message,
//! and runs the event loop on the test runtime.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dgi_broker::{Broker, BrokerConfig, BrokerError, ConnectionManager, Dispatcher, LossPolicy};
use dgi_protocol::{Message, PeerIdentity};
use tokio::task::JoinHandle;

pub fn peer(name: &str) -> PeerIdentity {
    PeerIdentity::new(name).expect("valid test identity")
}

/// A running in-process agent.
pub struct TestAgent {
    pub broker: Broker,
    inbox: Arc<Mutex<Vec<Message>>>,
    run: Option<JoinHandle<Result<(), BrokerError>>>,
}

#[allow(dead_code)]
impl TestAgent {
    pub async fn spawn(name: &str, loss: LossPolicy) -> Self {
        Self::spawn_with(name, loss, |_| {}).await
    }

    /// Spawn with extra handlers registered before the loop starts.
    pub async fn spawn_with(name: &str, loss: LossPolicy, setup: impl FnOnce(&Dispatcher)) -> Self {
        let dispatcher = Dispatcher::new();
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let recorder = inbox.clone();
        dispatcher.register_read_any(move |m, _| {
            recorder.lock().unwrap().push(m.clone());
            Ok(())
        });
        setup(&dispatcher);

        let config = BrokerConfig {
            identity: peer(name),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            advertise_addr: None,
        };
        let broker = Broker::bind(config, ConnectionManager::new(loss), dispatcher)
            .await
            .expect("bind test broker");

        let runner = broker.clone();
        let run = tokio::spawn(async move { runner.run().await });
        Self {
            broker,
            inbox,
            run: Some(run),
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.broker.identity().clone()
    }

    pub fn addr(&self) -> SocketAddr {
        self.broker.advertise_addr()
    }

    /// Teach this agent where `other` listens.
    pub async fn learn(&self, other: &TestAgent) {
        self.broker
            .connection_manager()
            .put_host(other.identity(), other.addr())
            .await;
    }

    pub fn received(&self, kind: &str) -> Vec<Message> {
        self.inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind.as_str() == kind)
            .cloned()
            .collect()
    }

    /// Poll until at least `n` messages of `kind` arrived, or timeout.
    pub async fn wait_received(
        &self,
        kind: &str,
        n: usize,
        timeout: Duration,
    ) -> anyhow::Result<Vec<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let got = self.received(kind);
            if got.len() >= n {
                return Ok(got);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "timeout waiting for {} {} messages (have {})",
                    n,
                    kind,
                    got.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the broker and wait for its loop to finish.
    pub async fn shutdown(mut self) -> anyhow::Result<Broker> {
        self.broker.stop();
        if let Some(run) = self.run.take() {
            tokio::time::timeout(Duration::from_secs(2), run).await???;
        }
        Ok(self.broker.clone())
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.broker.stop();
    }
}
