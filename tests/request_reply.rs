// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{catalog, configs, reply};
use futures_util::{future::join_all, StreamExt};
use rabbitmq_routing::{
    broker::{BrokerConnector, ConsumeOptions},
    envelope::{MessageEnvelope, ReplyEnvelope},
    memory::MemoryBroker,
    AmqpError, ErrorKind, Messaging,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

const REQUESTS: usize = 8;

#[tokio::test]
async fn concurrent_requests_receive_their_own_reply() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();

    let responder = tokio::spawn({
        let broker = broker.clone();
        async move {
            let channel = broker.connect("users").await.unwrap();
            let mut requests = channel
                .consume("app_users_queue", ConsumeOptions::manual_ack("users"))
                .await
                .unwrap();

            let mut held = Vec::new();
            while held.len() < REQUESTS {
                held.push(requests.next().await.unwrap().unwrap());
            }

            // answer newest first
            for request in held.into_iter().rev() {
                let envelope = MessageEnvelope::from_bytes(&request.data).unwrap();
                let answer = ReplyEnvelope::success(json!({ "echo": envelope.data()["id"] }));
                reply(channel.as_ref(), &request, answer).await;
                request.ack().await.unwrap();
            }
        }
    });

    let payloads: Vec<Value> = (0..REQUESTS).map(|i| json!({ "id": i })).collect();
    let replies = join_all(
        payloads
            .iter()
            .map(|payload| messaging.send::<Value, Value>("user.findById", payload)),
    )
    .await;

    for (i, result) in replies.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!({ "echo": i }));
    }

    responder.await.unwrap();
    assert_eq!(messaging.router().client_count(), 1);
    assert_eq!(messaging.router().pending_count(), 0);
}

#[tokio::test]
async fn timed_out_request_leaves_nothing_behind() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();

    let channel = broker.connect("users").await.unwrap();
    let mut requests = channel
        .consume("app_users_queue", ConsumeOptions::manual_ack("users"))
        .await
        .unwrap();

    let result = messaging
        .send_with_timeout::<Value, Value>(
            "user.findById",
            &json!({"id": "slow"}),
            Duration::from_millis(50),
        )
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(
        err,
        AmqpError::Timeout {
            pattern: "user.findById".into(),
            after_ms: 50
        }
    );
    assert_eq!(messaging.router().pending_count(), 0);

    // the late reply resolves nothing
    let slow = requests.next().await.unwrap().unwrap();
    reply(channel.as_ref(), &slow, ReplyEnvelope::success(json!("late"))).await;
    slow.ack().await.unwrap();

    let payload = json!({"id": "fast"});
    let (fresh, _) = tokio::join!(
        messaging.send::<Value, Value>("user.findById", &payload),
        async {
            let request = requests.next().await.unwrap().unwrap();
            reply(channel.as_ref(), &request, ReplyEnvelope::success(json!("fresh"))).await;
            request.ack().await.unwrap();
        }
    );

    assert_eq!(fresh.unwrap(), json!("fresh"));
    // the handle survived the timeout
    assert_eq!(messaging.router().client_count(), 1);
}

#[tokio::test]
async fn remote_failures_surface_as_handler_errors() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();

    let channel = broker.connect("users").await.unwrap();
    let mut requests = channel
        .consume("app_users_queue", ConsumeOptions::manual_ack("users"))
        .await
        .unwrap();

    let payload = json!({"id": "ghost"});
    let (result, _) = tokio::join!(
        messaging.send::<Value, Value>("user.findById", &payload),
        async {
            let request = requests.next().await.unwrap().unwrap();
            reply(channel.as_ref(), &request, ReplyEnvelope::failure("user not found")).await;
            request.ack().await.unwrap();
        }
    );

    let err = result.unwrap_err();
    assert_eq!(err, AmqpError::RemoteError("user not found".into()));
    assert_eq!(err.kind(), ErrorKind::Handler);
}

#[tokio::test]
async fn broken_client_handle_is_replaced() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();

    let first = messaging
        .send_with_timeout::<Value, Value>("user.findById", &json!({}), Duration::from_millis(10))
        .await;
    assert_eq!(first.unwrap_err().kind(), ErrorKind::Timeout);
    let connections = broker.connection_count();

    broker.disconnect_all();

    let channel = broker.connect("users").await.unwrap();
    let mut requests = channel
        .consume("app_users_queue", ConsumeOptions::manual_ack("users"))
        .await
        .unwrap();
    // the request that timed out earlier is still queued
    let stale = requests.next().await.unwrap().unwrap();
    stale.ack().await.unwrap();

    let payload = json!({"id": "u1"});
    let (result, _) = tokio::join!(
        messaging.send::<Value, Value>("user.findById", &payload),
        async {
            let request = requests.next().await.unwrap().unwrap();
            reply(channel.as_ref(), &request, ReplyEnvelope::success(json!("ok"))).await;
            request.ack().await.unwrap();
        }
    );

    assert_eq!(result.unwrap(), json!("ok"));
    assert!(broker.connection_count() > connections);
    assert_eq!(messaging.router().client_count(), 1);
}

#[tokio::test]
async fn undecodable_reply_fails_only_its_own_request() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();

    let channel = broker.connect("users").await.unwrap();
    let mut requests = channel
        .consume("app_users_queue", ConsumeOptions::manual_ack("users"))
        .await
        .unwrap();

    let count_payload = json!({});
    let find_payload = json!({"id": "u1"});
    let (count, user, _) = tokio::join!(
        messaging.send::<Value, u32>("user.count", &count_payload),
        messaging.send::<Value, Value>("user.findById", &find_payload),
        async {
            let mut held = Vec::new();
            while held.len() < 2 {
                held.push(requests.next().await.unwrap().unwrap());
            }

            let (counts, finds): (Vec<_>, Vec<_>) = held.into_iter().partition(|request| {
                MessageEnvelope::from_bytes(&request.data).unwrap().pattern() == "user.count"
            });

            let answer = ReplyEnvelope::success(json!({"not": "a number"}));
            reply(channel.as_ref(), &counts[0], answer).await;
            counts[0].ack().await.unwrap();

            tokio::time::sleep(Duration::from_millis(50)).await;

            reply(channel.as_ref(), &finds[0], ReplyEnvelope::success(json!({"id": "u1"}))).await;
            finds[0].ack().await.unwrap();
        }
    );

    assert_eq!(count.unwrap_err().kind(), ErrorKind::Payload);
    assert_eq!(user.unwrap(), json!({"id": "u1"}));
    assert_eq!(messaging.router().client_count(), 1);
    assert_eq!(messaging.router().pending_count(), 0);
}
