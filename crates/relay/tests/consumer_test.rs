//! Consumer sessions against the in-memory broker and procedure, with the
//! reconnect loop running on tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rowbus_core::config::FailurePolicy;
use rowbus_queue::{Broker, MemoryBroker};
use rowbus_relay::{
    DispatchStats, Dispatcher, ReconnectSupervisor, SessionConnector, SessionState, SessionStatus,
};
use rowbus_store::MemoryProcedure;

const QUEUE: &str = "products";
const BACKOFF: Duration = Duration::from_secs(10);

struct Harness {
    broker: MemoryBroker,
    target: MemoryProcedure,
    status: watch::Receiver<SessionStatus>,
    handle: JoinHandle<DispatchStats>,
}

fn start(broker: &MemoryBroker, target: &MemoryProcedure, policy: FailurePolicy) -> Harness {
    let connector = SessionConnector::new(Arc::new(broker.clone()), Arc::new(target.clone()), QUEUE);
    let supervisor = ReconnectSupervisor::new(connector, Dispatcher::new(QUEUE, policy), BACKOFF);
    let status = supervisor.subscribe();
    Harness {
        broker: broker.clone(),
        target: target.clone(),
        status,
        handle: tokio::spawn(supervisor.run()),
    }
}

async fn publish(broker: &MemoryBroker, bodies: &[&str]) {
    let mut publisher = broker.publisher().await.unwrap();
    publisher.declare_queue(QUEUE).await.unwrap();
    for body in bodies {
        publisher.publish(QUEUE, body.as_bytes()).await.unwrap();
    }
    publisher.close().await.unwrap();
}

/// Poll `cond` on the paused clock until it holds or a minute has passed.
async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl Harness {
    async fn wait_listening(&mut self, session: u64) {
        self.status
            .wait_for(|s| s.session == session && s.state == SessionState::Listening)
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn commits_and_acks_each_message_once_in_order() {
    let broker = MemoryBroker::new();
    publish(&broker, &[r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#]).await;
    let h = start(&broker, &MemoryProcedure::new(), FailurePolicy::LeaveUnacked);

    eventually(|| h.broker.acked() == 3).await;

    assert_eq!(
        h.target.committed(),
        vec![
            br#"{"id":1}"#.to_vec(),
            br#"{"id":2}"#.to_vec(),
            br#"{"id":3}"#.to_vec()
        ]
    );
    assert_eq!(h.target.calls(), 3);
    assert!(h.broker.ready(QUEUE).is_empty());
    assert_eq!(h.broker.unacked(QUEUE), 0);
    h.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn failed_procedure_leaves_message_unacked_and_keeps_listening() {
    let broker = MemoryBroker::new();
    let target = MemoryProcedure::new();
    target.reject(br#"{"id":1}"#);
    publish(&broker, &[r#"{"id":1}"#, r#"{"id":2}"#]).await;
    let mut h = start(&broker, &target, FailurePolicy::LeaveUnacked);

    eventually(|| h.target.calls() == 1).await;
    h.wait_listening(1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.status.borrow().session, 1, "no reconnect for a local failure");
    assert_eq!(h.broker.unacked(QUEUE), 1);
    assert_eq!(h.broker.acked(), 0);
    // Prefetch 1: the unacked delivery holds back the next one.
    assert_eq!(h.broker.ready(QUEUE), vec![br#"{"id":2}"#.to_vec()]);
    assert!(h.target.committed().is_empty());
    h.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_reconnects_after_backoff_on_same_queue() {
    let broker = MemoryBroker::new();
    publish(&broker, &[r#"{"id":1}"#]).await;
    let mut h = start(&broker, &MemoryProcedure::new(), FailurePolicy::LeaveUnacked);
    eventually(|| h.broker.acked() == 1).await;
    h.wait_listening(1).await;

    let dropped_at = Instant::now();
    h.broker.drop_connections();
    h.wait_listening(2).await;

    assert!(dropped_at.elapsed() >= BACKOFF);
    assert!(dropped_at.elapsed() < BACKOFF * 2);
    assert_eq!(h.broker.active_consumers(), 1);

    publish(&broker, &[r#"{"id":2}"#]).await;
    eventually(|| h.broker.acked() == 2).await;
    assert_eq!(h.target.committed().len(), 2);
    assert_eq!(h.target.closed(), 1, "first session released its target");
    h.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn unacked_message_is_redelivered_after_reconnect() {
    let broker = MemoryBroker::new();
    let target = MemoryProcedure::new();
    target.reject(br#"{"id":1}"#);
    publish(&broker, &[r#"{"id":1}"#]).await;
    let mut h = start(&broker, &target, FailurePolicy::LeaveUnacked);
    eventually(|| h.target.calls() == 1).await;

    h.broker.drop_connections();
    h.wait_listening(2).await;
    eventually(|| h.target.calls() == 2).await;

    assert_eq!(h.broker.unacked(QUEUE), 1);
    assert_eq!(h.broker.acked(), 0);
    h.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_is_retried_without_limit() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(5);
    let started = Instant::now();
    let mut h = start(&broker, &MemoryProcedure::new(), FailurePolicy::LeaveUnacked);

    h.wait_listening(6).await;

    assert!(started.elapsed() >= BACKOFF * 5);
    assert_eq!(h.broker.connections_opened(), 1);
    h.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn consumer_declares_missing_queue_and_keeps_existing_messages() {
    let broker = MemoryBroker::new();
    let mut h = start(&broker, &MemoryProcedure::new(), FailurePolicy::LeaveUnacked);
    h.wait_listening(1).await;
    assert!(h.broker.queue_exists(QUEUE));

    // The producer's redeclare is idempotent and its messages reach the consumer.
    publish(&broker, &[r#"{"id":7}"#]).await;
    eventually(|| h.broker.acked() == 1).await;
    assert_eq!(h.target.committed(), vec![br#"{"id":7}"#.to_vec()]);
    h.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn durability_mismatch_is_a_session_failure() {
    let broker = MemoryBroker::new();
    broker.declare(QUEUE, false).unwrap();
    let mut h = start(&broker, &MemoryProcedure::new(), FailurePolicy::LeaveUnacked);

    h.status
        .wait_for(|s| s.session == 3 && s.state == SessionState::Terminated)
        .await
        .unwrap();

    assert_eq!(h.broker.active_consumers(), 0);
    h.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn dead_letter_policy_parks_poison_message_and_moves_on() {
    let broker = MemoryBroker::new();
    let target = MemoryProcedure::new();
    target.reject(br#"{"id":"poison"}"#);
    publish(&broker, &[r#"{"id":"poison"}"#, r#"{"id":2}"#]).await;
    let h = start(&broker, &target, FailurePolicy::DeadLetter { max_attempts: 3 });

    eventually(|| h.target.committed().len() == 1).await;

    assert_eq!(h.target.calls(), 4);
    assert_eq!(
        h.broker.ready("products.dead-letter"),
        vec![br#"{"id":"poison"}"#.to_vec()]
    );
    assert_eq!(h.target.committed(), vec![br#"{"id":2}"#.to_vec()]);
    assert_eq!(h.broker.acked(), 2);
    assert_eq!(h.broker.unacked(QUEUE), 0);
    h.handle.abort();
}
