//! Orderly shutdown of a running agent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dgi_broker::{BrokerError, BrokerState, LossPolicy};
use dgi_protocol::Message;

use crate::harness::TestAgent;

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let a = TestAgent::spawn("agent-a", LossPolicy::disabled()).await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;
    a.broker
        .send(&b.identity(), Message::new("gm.ping", a.identity(), vec![]))
        .await
        .unwrap();
    let conn = a
        .broker
        .connection_manager()
        .find_connection(&b.identity())
        .await
        .unwrap();

    let broker = a.shutdown().await.unwrap();
    assert_eq!(broker.state(), BrokerState::Stopped);
    assert!(conn.is_closed());
    assert!(broker.connection_manager().is_empty().await);
    assert!(matches!(
        broker.run().await,
        Err(BrokerError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn test_pending_timers_never_fire_after_stop() {
    let a = TestAgent::spawn("agent-a", LossPolicy::disabled()).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = [1u64, 2, 5]
        .into_iter()
        .map(|secs| {
            let fired = fired.clone();
            a.broker.schedule(Duration::from_secs(secs), move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let broker = a.shutdown().await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(handles.iter().all(|h| !h.is_fired()));
    assert!(broker
        .schedule(Duration::ZERO, |_| {})
        .is_cancelled());
}

#[tokio::test]
async fn test_peer_keeps_running_when_other_stops() {
    let a = TestAgent::spawn("agent-a", LossPolicy::disabled()).await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;
    b.learn(&a).await;

    b.shutdown().await.unwrap();

    // Sending into a stopped peer is still a best-effort success locally.
    let result = a
        .broker
        .send(&crate::harness::peer("agent-b"), Message::new("gm.ping", a.identity(), vec![]))
        .await;
    assert!(result.is_ok() || matches!(result, Err(BrokerError::Connection(_))));
    assert_eq!(a.broker.state(), BrokerState::Running);
}
