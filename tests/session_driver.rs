//! Sessions running on their own tokio tasks.

mod common;

use common::*;
use courier::config::SessionConfig;
use courier::messaging::{Message, QueueRegistry};
use courier::workloads::amqp::{
    ChannelProxy, CommandOutcome, DriverError, MessageCommand, ProxyEvent, Session, SessionDriver,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn spawn_session(
    queues: &Arc<QueueRegistry>,
    id: &str,
) -> (
    courier::workloads::amqp::SessionClient,
    tokio::task::JoinHandle<Session>,
    mpsc::UnboundedReceiver<ProxyEvent>,
) {
    let (proxy, events) = ChannelProxy::new();
    let session = Session::new(id, SessionConfig::default(), queues.clone(), Box::new(proxy));
    let (client, handle) = SessionDriver::spawn(session);
    (client, handle, events)
}

async fn next_transfer(events: &mut mpsc::UnboundedReceiver<ProxyEvent>) -> courier::workloads::amqp::Delivery {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within timeout")
            .expect("proxy open");
        if let ProxyEvent::Transfer(delivery) = event {
            return delivery;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn producer_enqueue_reaches_waiting_consumer() {
    let queues = Arc::new(QueueRegistry::new());
    let queue = queues.declare("orders");
    let (client, handle, mut events) = spawn_session(&queues, "s1");

    client.command(subscribe("orders", "c1")).await.unwrap();
    client.command(message_credit("c1", 3)).await.unwrap();

    for i in 0..3 {
        queue.enqueue(Message::new(format!("order-{i}")));
    }
    for expected in 1..=3 {
        assert_eq!(next_transfer(&mut events).await.sequence, expected);
    }

    client.acknowledge(vec![1, 3]).await.unwrap();
    drop(client);
    let session = handle.await.unwrap();
    assert!(session.tracker().is_empty());
    assert_eq!(queue.depth(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_one_session_redelivers_to_another() {
    let queues = Arc::new(QueueRegistry::new());
    let queue = queues.declare("q");
    let (c1, h1, mut e1) = spawn_session(&queues, "s1");
    let (c2, h2, mut e2) = spawn_session(&queues, "s2");

    c1.command(subscribe("q", "a")).await.unwrap();
    c1.command(message_credit("a", 1)).await.unwrap();
    queue.enqueue(Message::new("only"));
    let first = next_transfer(&mut e1).await;
    assert!(!first.redelivered);

    c2.command(subscribe("q", "b")).await.unwrap();
    c2.command(message_credit("b", 1)).await.unwrap();

    drop(c1);
    h1.await.unwrap();

    let second = next_transfer(&mut e2).await;
    assert!(second.redelivered);
    assert_eq!(second.message.payload, b"only".to_vec());

    drop(c2);
    h2.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn command_errors_are_returned_to_the_caller() {
    let queues = Arc::new(QueueRegistry::new());
    queues.declare("q");
    let (client, handle, _events) = spawn_session(&queues, "s1");

    let err = client.command(subscribe("missing", "c1")).await.unwrap_err();
    assert!(matches!(err, DriverError::Session(ref e) if e.code() == 404));

    // Non-fatal: the session keeps running.
    assert_eq!(
        client.command(subscribe("q", "c1")).await.unwrap(),
        CommandOutcome::Completed
    );

    let err = client.acknowledge(vec![1]).await.unwrap_err();
    assert!(matches!(err, DriverError::Session(ref e) if e.is_connection_fatal()));
    let session = handle.await.unwrap();
    assert!(session.consumers().is_empty());
    assert!(matches!(
        client.command(MessageCommand::Recover { requeue: true }).await,
        Err(DriverError::Stopped)
    ));
}
