// RPC round trips through the in-memory broker: one client, one or more
// workers on the request queue, and the reply queue shared between calls.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use finance_rpc::rabbitmq::{
    ChannelConfig, ConnectionManager, InMemoryBroker, OutboundEnvelope, QueueSpec, RpcClient,
    RpcError, RpcOptions, RpcWorker, SubscriptionPolicy, Topic, WorkerHandle,
};
use serde_json::{json, Value};
use tokio::time::sleep;

fn manager(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        ChannelConfig::default(),
    ))
}

fn client(broker: &InMemoryBroker) -> RpcClient {
    RpcClient::new(manager(broker))
}

async fn start_worker<F, Fut>(broker: &InMemoryBroker, topic: &Topic, handler: F) -> WorkerHandle
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
{
    // workers run in their own process in production, so give them their
    // own connection
    let connections = manager(broker);
    RpcWorker::bind(&connections, "worker", &topic.request_queue)
        .await
        .expect("worker binds")
        .serve(handler)
        .await
        .expect("worker starts")
}

/// Echo the request back, after `delay_ms` if the request asks for it.
async fn delayed_echo(body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
    let request: Value = serde_json::from_slice(&body)?;
    if let Some(ms) = request["delay_ms"].as_u64() {
        sleep(Duration::from_millis(ms)).await;
    }
    Ok(body)
}

fn body(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

#[tokio::test]
async fn test_call_returns_worker_reply() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let worker = start_worker(&broker, &topic, |_body: Vec<u8>| async {
        Ok::<_, RpcError>(br#"{"total":42}"#.to_vec())
    })
    .await;
    let client = client(&broker);

    let reply = client
        .call(&topic, body(json!({"content": "Incomes"})), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(serde_json::from_slice::<Value>(&reply).unwrap(), json!({"total": 42}));
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.in_flight(&topic.name), 0);
    assert_eq!(client.stats(&topic.name).resolved, 1);
    // the reply consumer goes away with the last call
    assert_eq!(broker.consumer_count(&topic.reply_queue), 0);
    assert!(broker.messages(&topic.reply_queue).is_empty());

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_is_bounded() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let client = client(&broker);
    let timeout = Duration::from_millis(300);

    let started = Instant::now();
    let result = client.call(&topic, body(json!({})), timeout).await;
    let elapsed = started.elapsed();

    match result {
        Err(RpcError::Timeout(after)) => assert_eq!(after, timeout),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(250), "took {:?}", elapsed);
    assert_eq!(client.pending_calls(), 0);
    assert!(!client.subscription_active(&topic.name).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_reply_is_not_misdelivered() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let worker = start_worker(&broker, &topic, delayed_echo).await;
    let client = client(&broker);

    let first = client
        .call(
            &topic,
            body(json!({"n": 1, "delay_ms": 300})),
            Duration::from_millis(100),
        )
        .await;
    assert!(matches!(first, Err(RpcError::Timeout(_))));

    // still waiting when the first reply turns up
    let second = client
        .call(
            &topic,
            body(json!({"n": 2, "delay_ms": 500})),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
    let second: Value = serde_json::from_slice(&second).unwrap();
    assert_eq!(second["n"], 2);

    let stats = client.stats(&topic.name);
    assert_eq!(stats.resolved, 1);
    assert!(stats.orphaned >= 1);

    // the stale reply went back to the queue instead of being dropped
    // a reply seen twice is requeued after a short pause
    sleep(Duration::from_millis(150)).await;
    let leftovers = broker.messages(&topic.reply_queue);
    assert_eq!(leftovers.len(), 1);
    let stale: Value = serde_json::from_slice(&leftovers[0].body).unwrap();
    assert_eq!(stale["n"], 1);
    assert!(!leftovers[0].unacked);
    assert!(leftovers[0].delivery_count >= 1);

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_get_their_own_replies() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let worker = start_worker(&broker, &topic, delayed_echo).await;
    let client = client(&broker);

    let calls: Vec<_> = (0..16u64)
        .map(|i| {
            let client = client.clone();
            let topic = topic.clone();
            // later calls answer first, so replies interleave
            let request = body(json!({"i": i, "delay_ms": (16 - i) * 10}));
            tokio::spawn(async move { client.call(&topic, request, Duration::from_secs(5)).await })
        })
        .collect();

    sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.consumer_count(&topic.reply_queue), 1);

    for (i, call) in calls.into_iter().enumerate() {
        let reply = call.await.unwrap().unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["i"], i as u64);
    }

    assert_eq!(client.stats(&topic.name).resolved, 16);
    assert_eq!(client.stats(&topic.name).orphaned, 0);
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(broker.consumer_count(&topic.reply_queue), 0);

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_reply_is_requeued() {
    let broker = InMemoryBroker::new();
    let topic = Topic::report_builder();
    let worker = start_worker(&broker, &topic, delayed_echo).await;
    let client = client(&broker);

    let call = {
        let client = client.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            client
                .call(&topic, body(json!({"delay_ms": 200})), Duration::from_secs(3))
                .await
        })
    };

    sleep(Duration::from_millis(50)).await;
    broker.inject(
        &topic.reply_queue,
        OutboundEnvelope::new(b"{}".to_vec()).with_correlation_id("belongs-to-someone-else"),
    );

    call.await.unwrap().unwrap();
    sleep(Duration::from_millis(150)).await;

    assert!(client.stats(&topic.name).orphaned >= 1);
    let orphan = broker.get(&topic.reply_queue).expect("orphan kept on the queue");
    assert_eq!(orphan.correlation_id.as_deref(), Some("belongs-to-someone-else"));
    assert!(orphan.delivery_count >= 2);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_reply_without_correlation_id_is_rejected() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let worker = start_worker(&broker, &topic, delayed_echo).await;
    let client = client(&broker);

    let call = {
        let client = client.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            client
                .call(&topic, body(json!({"delay_ms": 100})), Duration::from_secs(3))
                .await
        })
    };

    sleep(Duration::from_millis(30)).await;
    broker.inject(&topic.reply_queue, OutboundEnvelope::new(b"{}".to_vec()));

    call.await.unwrap().unwrap();

    assert_eq!(client.stats(&topic.name).malformed, 1);
    assert_eq!(broker.dead_lettered(&topic.reply_queue), 1);
    assert!(broker.messages(&topic.reply_queue).is_empty());

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_publish_failure_leaves_nothing_behind() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let client = client(&broker);
    broker.set_reject_publishes(true);

    let result = client
        .call(&topic, body(json!({})), Duration::from_secs(1))
        .await;

    assert!(matches!(result, Err(RpcError::PublishError(_))));
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.in_flight(&topic.name), 0);
    assert!(!client.subscription_active(&topic.name).await);
    assert_eq!(broker.consumer_count(&topic.reply_queue), 0);
}

#[tokio::test]
async fn test_reply_ttl_bounds_orphans() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let options = RpcOptions {
        reply_message_ttl: Some(Duration::from_millis(100)),
        ..RpcOptions::default()
    };
    let client = RpcClient::with_options(manager(&broker), options);

    // declares both queues, the reply queue with the short TTL
    let _ = client
        .call(&topic, body(json!({})), Duration::from_millis(20))
        .await;

    broker.inject(
        &topic.reply_queue,
        OutboundEnvelope::new(b"{}".to_vec()).with_correlation_id("nobody"),
    );
    assert_eq!(broker.ready_count(&topic.reply_queue), 1);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.ready_count(&topic.reply_queue), 0);
    assert_eq!(broker.dead_lettered(&topic.reply_queue), 1);
}

#[tokio::test]
async fn test_calls_survive_broker_restart() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    let options = RpcOptions {
        subscription_policy: SubscriptionPolicy::KeepAlive,
        ..RpcOptions::default()
    };
    let client = RpcClient::with_options(manager(&broker), options);

    let worker = start_worker(&broker, &topic, delayed_echo).await;
    client
        .call(&topic, body(json!({"n": 1})), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(client.subscription_active(&topic.name).await);
    let connects = broker.connect_count();

    broker.disconnect_all();
    assert!(!client.subscription_active(&topic.name).await);
    let _ = worker.stop().await;

    let worker = start_worker(&broker, &topic, delayed_echo).await;
    let reply = client
        .call(&topic, body(json!({"n": 2})), Duration::from_secs(2))
        .await
        .unwrap();

    let reply: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["n"], 2);
    // one fresh connection for the client, one for the new worker
    assert_eq!(broker.connect_count(), connects + 2);
    assert_eq!(broker.consumer_count(&topic.reply_queue), 1);

    client.close().await;
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_call_works_with_existing_plain_reply_queue() {
    let broker = InMemoryBroker::new();
    let topic = Topic::currency_aggregator();
    // declared earlier by a deployment that set no TTL on it
    broker.declare(QueueSpec::durable(topic.reply_queue.clone())).unwrap();
    let worker = start_worker(&broker, &topic, delayed_echo).await;
    let client = client(&broker);

    for n in 1..=2 {
        let reply = client
            .call(&topic, body(json!({"n": n})), Duration::from_secs(2))
            .await
            .unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["n"], n);
    }

    assert_eq!(client.stats(&topic.name).resolved, 2);
    assert_eq!(client.pending_calls(), 0);
    assert!(broker.messages(&topic.reply_queue).is_empty());

    worker.stop().await.unwrap();
}
