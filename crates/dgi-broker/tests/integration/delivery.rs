//! Message delivery between agents over loopback UDP.

use std::sync::Arc;
use std::time::Duration;

use dgi_broker::device::{register_desd_handler, Desd, StepRequest, DESD_STEP};
use dgi_broker::{BrokerError, LossPolicy};
use dgi_protocol::Message;

use crate::harness::{peer, TestAgent};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_message_reaches_peer_with_source() {
    let a = TestAgent::spawn("agent-a", LossPolicy::disabled()).await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;

    a.broker
        .send(&b.identity(), Message::new("gm.ping", a.identity(), b"hi".to_vec()))
        .await
        .unwrap();

    let got = b.wait_received("gm.ping", 1, WAIT).await.unwrap();
    assert_eq!(got[0].source, a.identity());
    assert_eq!(got[0].payload, b"hi".to_vec());
    assert_eq!(got[0].reply_to, Some(a.addr()));

    let conn = a
        .broker
        .connection_manager()
        .find_connection(&b.identity())
        .await
        .expect("connection created on first send");
    assert_eq!(conn.stats().sent, 1);
}

#[tokio::test]
async fn test_first_contact_lets_receiver_reply() {
    let b = TestAgent::spawn_with("agent-b", LossPolicy::disabled(), |d| {
        d.register_read_handler("gm.ping", |m, ctx| {
            let broker = ctx.broker().expect("dispatched on a broker");
            let reply = Message::new("gm.pong", broker.identity().clone(), m.payload.clone());
            broker.post(m.source.clone(), reply);
            Ok(())
        });
    })
    .await;
    let a = TestAgent::spawn("agent-a", LossPolicy::disabled()).await;
    // Only A knows B; B learns A from the inbound envelope.
    a.learn(&b).await;

    a.broker
        .send(&b.identity(), Message::new("gm.ping", a.identity(), vec![42]))
        .await
        .unwrap();

    let pong = a.wait_received("gm.pong", 1, WAIT).await.unwrap();
    assert_eq!(pong[0].source, b.identity());
    assert_eq!(pong[0].payload, vec![42]);
    assert_eq!(
        b.broker.connection_manager().host(&a.identity()).await,
        Some(a.addr())
    );
    assert!(b
        .broker
        .connection_manager()
        .find_connection(&a.identity())
        .await
        .is_some());
}

#[tokio::test]
async fn test_send_to_unknown_peer_is_reported() {
    let a = TestAgent::spawn("agent-a", LossPolicy::disabled()).await;
    let err = a
        .broker
        .send(&peer("nobody"), Message::new("gm.ping", a.identity(), vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownPeer(_)));
}

#[tokio::test]
async fn test_write_handler_rewrites_before_send() {
    let a = TestAgent::spawn_with("agent-a", LossPolicy::disabled(), |d| {
        d.register_write_handler("lb.draft", |m, _| {
            m.payload.extend_from_slice(b"+signed");
            Ok(())
        });
    })
    .await;
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    a.learn(&b).await;

    a.broker
        .send(&b.identity(), Message::new("lb.draft", a.identity(), b"draft".to_vec()))
        .await
        .unwrap();

    let got = b.wait_received("lb.draft", 1, WAIT).await.unwrap();
    assert_eq!(got[0].payload, b"draft+signed".to_vec());
}

#[tokio::test]
async fn test_desd_step_over_the_wire() {
    let desd = Arc::new(Desd::with_storage("b-desd", 1.0));
    let device = desd.clone();
    let b = TestAgent::spawn_with("agent-b", LossPolicy::disabled(), move |d| {
        register_desd_handler(d, device);
    })
    .await;
    let a = TestAgent::spawn("agent-a", LossPolicy::disabled()).await;
    a.learn(&b).await;

    for step in [2.0, 0.5] {
        let msg = Message::with_json(DESD_STEP, a.identity(), &StepRequest { step }).unwrap();
        a.broker.send(&b.identity(), msg).await.unwrap();
    }

    b.wait_received(DESD_STEP, 2, WAIT).await.unwrap();
    assert_eq!(desd.storage(), 3.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_posted_sequence_arrives_in_order() {
    let b = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    let target = b.identity();
    let a = TestAgent::spawn_with("agent-a", LossPolicy::disabled(), move |d| {
        d.register_read_handler("sc.go", move |_, ctx| {
            let broker = ctx.broker().expect("dispatched on a broker");
            for i in 0..20u8 {
                let msg = Message::new("sc.seq", broker.identity().clone(), vec![i]);
                broker.post(target.clone(), msg);
            }
            Ok(())
        });
    })
    .await;
    a.learn(&b).await;

    a.broker
        .send(&a.identity(), Message::new("sc.go", a.identity(), vec![]))
        .await
        .unwrap();

    let got = b.wait_received("sc.seq", 20, WAIT).await.unwrap();
    let order: Vec<u8> = got.iter().map(|m| m.payload[0]).collect();
    assert_eq!(order, (0..20u8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_replies_follow_peer_to_new_address() {
    let a = TestAgent::spawn_with("agent-a", LossPolicy::disabled(), |d| {
        d.register_read_handler("gm.ping", |m, ctx| {
            let broker = ctx.broker().expect("dispatched on a broker");
            let reply = Message::new("gm.pong", broker.identity().clone(), m.payload.clone());
            broker.post(m.source.clone(), reply);
            Ok(())
        });
    })
    .await;

    let first = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    first.learn(&a).await;
    first
        .broker
        .send(&a.identity(), Message::new("gm.ping", first.identity(), vec![1]))
        .await
        .unwrap();
    first.wait_received("gm.pong", 1, WAIT).await.unwrap();
    first.shutdown().await.unwrap();

    // Same identity, new port.
    let second = TestAgent::spawn("agent-b", LossPolicy::disabled()).await;
    second.learn(&a).await;
    second
        .broker
        .send(&a.identity(), Message::new("gm.ping", second.identity(), vec![2]))
        .await
        .unwrap();

    let pong = second.wait_received("gm.pong", 1, WAIT).await.unwrap();
    assert_eq!(pong[0].payload, vec![2]);
    let conn = a
        .broker
        .connection_manager()
        .find_connection(&second.identity())
        .await
        .expect("connection to the new address");
    assert_eq!(conn.remote_addr(), second.addr());
}
