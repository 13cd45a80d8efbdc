//! Simulated link loss end to end.

use std::time::Duration;

use dgi_broker::profile::schedule_profile_reload;
use dgi_broker::LossPolicy;
use dgi_protocol::Message;

use crate::harness::TestAgent;

#[tokio::test]
async fn test_zero_reliability_delivers_nothing() {
    let a = TestAgent::spawn("agent-a", LossPolicy::seeded(11)).await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;
    a.broker
        .connection_manager()
        .apply_reliability(&b.identity(), 0)
        .await
        .unwrap();

    for _ in 0..50 {
        // Drops are silent: every send reports success.
        a.broker
            .send(&b.identity(), Message::new("sc.marker", a.identity(), vec![]))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(b.received("sc.marker").is_empty());
    let conn = a
        .broker
        .connection_manager()
        .find_connection(&b.identity())
        .await
        .unwrap();
    let stats = conn.stats();
    assert_eq!(stats.attempted, 50);
    assert_eq!(stats.dropped, 50);
    assert_eq!(stats.sent, 0);
}

#[tokio::test]
async fn test_full_reliability_delivers_everything() {
    let a = TestAgent::spawn("agent-a", LossPolicy::seeded(11)).await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;

    for i in 0..20u8 {
        a.broker
            .send(&b.identity(), Message::new("sc.marker", a.identity(), vec![i]))
            .await
            .unwrap();
    }

    b.wait_received("sc.marker", 20, Duration::from_secs(2))
        .await
        .unwrap();
    let conn = a
        .broker
        .connection_manager()
        .find_connection(&b.identity())
        .await
        .unwrap();
    assert_eq!(conn.stats().dropped, 0);
}

#[tokio::test]
async fn test_half_reliability_drops_some() {
    let a = TestAgent::spawn("agent-a", LossPolicy::seeded(0xD61)).await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;
    let conn = a
        .broker
        .connection_manager()
        .get_or_create_connection(&b.identity())
        .await
        .unwrap();
    conn.set_reliability(50).unwrap();

    for _ in 0..400 {
        conn.send(&Message::new("sc.marker", a.identity(), vec![]))
            .await
            .unwrap();
    }
    let stats = conn.stats();
    assert_eq!(stats.attempted, 400);
    assert_eq!(stats.sent + stats.dropped, 400);
    assert!(
        (120..=280).contains(&stats.dropped),
        "dropped {} of 400",
        stats.dropped
    );
}

#[tokio::test]
async fn test_profile_reload_applies_reliability() {
    let a = TestAgent::spawn("agent-a", LossPolicy::seeded(5)).await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;
    let conn = a
        .broker
        .connection_manager()
        .get_or_create_connection(&b.identity())
        .await
        .unwrap();
    assert_eq!(conn.reliability(), 100);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("network.toml");
    std::fs::write(&path, "[reliability]\n\"agent-b\" = 0\n").unwrap();
    schedule_profile_reload(&a.broker, path.clone(), Duration::from_millis(20));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while conn.reliability() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "profile never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Later edits are picked up by the next reload.
    std::fs::write(&path, "[reliability]\n\"agent-b\" = 70\n").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while conn.reliability() != 70 {
        assert!(tokio::time::Instant::now() < deadline, "profile edit never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Dropping the entry puts the link back to the node default.
    std::fs::write(&path, "[reliability]\n").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while conn.reliability() != 100 {
        assert!(tokio::time::Instant::now() < deadline, "removed entry never reverted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
