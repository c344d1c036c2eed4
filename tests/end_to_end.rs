// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{catalog, configs, eventually};
use rabbitmq_routing::{
    dispatcher::Dispatcher, handler_fn, memory::MemoryBroker, ConsumerMessage, HandlerError,
    Messaging,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct User {
    id: String,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct FindById {
    id: String,
}

fn spawn(dispatcher: Dispatcher) -> (Arc<Dispatcher>, JoinHandle<()>) {
    let dispatcher = Arc::new(dispatcher);
    let running = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await.unwrap() }
    });
    (dispatcher, running)
}

fn users_service(messaging: &Messaging) -> Dispatcher {
    messaging
        .dispatcher("users")
        .unwrap()
        .register(
            "user.findById",
            handler_fn(|msg: ConsumerMessage| async move {
                let req: FindById = msg.payload()?;
                if req.id != "u1" {
                    return Err(HandlerError::failed("user not found"));
                }
                Ok(Some(json!(User {
                    id: req.id,
                    name: "Ada".to_owned()
                })))
            }),
        )
        .unwrap()
}

#[tokio::test]
async fn emitted_event_reaches_its_consumer_once() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::<ConsumerMessage>::new()));
    let dispatcher = messaging
        .dispatcher("city")
        .unwrap()
        .register(
            "city.updated",
            handler_fn({
                let seen = seen.clone();
                move |msg: ConsumerMessage| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(msg);
                        Ok(None)
                    }
                }
            }),
        )
        .unwrap();
    let (dispatcher, running) = spawn(dispatcher);

    messaging.emit("city.updated", &json!({"id": "c1"})).await;

    assert!(eventually(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].pattern, "city.updated");
        assert_eq!(seen[0].data, json!({"id": "c1"}));
        assert_eq!(seen[0].queue, "app_city_queue");
        assert!(!seen[0].is_request());
    }
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("app_city_queue"), 0);

    dispatcher.shutdown();
    running.await.unwrap();
    messaging.shutdown().await;
}

#[tokio::test]
async fn request_is_answered_by_the_owning_service() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();
    let (dispatcher, running) = spawn(users_service(&messaging));

    let user: User = messaging
        .send("user.findById", &FindById { id: "u1".into() })
        .await
        .unwrap();

    assert_eq!(
        user,
        User {
            id: "u1".into(),
            name: "Ada".into()
        }
    );

    dispatcher.shutdown();
    running.await.unwrap();
    messaging.shutdown().await;
}

#[tokio::test]
async fn handler_failure_is_returned_to_the_caller() {
    let broker = MemoryBroker::new();
    let cfg = rabbitmq_routing::RabbitMQConfigs {
        max_retries: Some(0),
        ..configs()
    };
    let messaging = Messaging::start(cfg, catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();
    let (dispatcher, running) = spawn(users_service(&messaging));

    let result: Result<Value, _> = messaging
        .send("user.findById", &FindById { id: "u2".into() })
        .await;

    assert_eq!(
        result,
        Err(rabbitmq_routing::AmqpError::RemoteError("user not found".into()))
    );
    // dropped, not parked for retry
    assert!(eventually(Duration::from_secs(1), || broker.unacked_count() == 0).await);
    assert_eq!(broker.queue_depth("app_users_dlx"), 0);

    dispatcher.shutdown();
    running.await.unwrap();
}

#[tokio::test]
async fn dispatcher_survives_a_broker_restart() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let dispatcher = messaging
        .dispatcher("city")
        .unwrap()
        .register(
            "city.updated",
            handler_fn({
                let seen = seen.clone();
                move |msg: ConsumerMessage| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(msg.data);
                        Ok(None)
                    }
                }
            }),
        )
        .unwrap();
    let (dispatcher, running) = spawn(dispatcher);

    messaging.emit("city.updated", &json!({"n": 1})).await;
    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 1).await);

    broker.disconnect_all();
    messaging.emit("city.updated", &json!({"n": 2})).await;

    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 2).await);
    assert_eq!(seen.lock().unwrap()[1], json!({"n": 2}));
    assert_eq!(broker.consumer_count("app_city_queue"), 1);

    dispatcher.shutdown();
    running.await.unwrap();
}

#[tokio::test]
async fn request_without_handler_fails_fast() {
    let broker = MemoryBroker::new();
    let messaging = Messaging::start(configs(), catalog(), Arc::new(broker.clone()))
        .await
        .unwrap();
    let (dispatcher, running) = spawn(users_service(&messaging));

    let started = tokio::time::Instant::now();
    let result: Result<Value, _> = messaging
        .send_with_timeout("user.deleteAll", &json!({}), Duration::from_secs(2))
        .await;

    assert_eq!(
        result,
        Err(rabbitmq_routing::AmqpError::RemoteError(
            "no handler for `user.deleteAll`".into()
        ))
    );
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(eventually(Duration::from_secs(1), || broker.unacked_count() == 0).await);

    dispatcher.shutdown();
    running.await.unwrap();
}
