// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use lapin::BasicProperties;
use rabbitmq_routing::{
    broker::{BrokerChannel, Delivery, Publishing},
    envelope::ReplyEnvelope,
    RabbitMQConfigs, ServiceCatalog, ServiceDefinition,
};
use std::time::Duration;

pub fn configs() -> RabbitMQConfigs {
    RabbitMQConfigs {
        app_name: "it".to_owned(),
        reconnect_interval_ms: 20,
        request_timeout_ms: 2000,
        publish_retry_delay_ms: 1,
        message_ttl_ms: 100,
        ..RabbitMQConfigs::default()
    }
}

pub fn catalog() -> ServiceCatalog {
    ServiceCatalog::new()
        .service(ServiceDefinition::with_keys("users", &["user"]))
        .service(ServiceDefinition::new("city"))
        .service(ServiceDefinition::new("notification").subscribe("user.created"))
}

/// Polls `condition` every few milliseconds until it holds or `within` elapses.
pub async fn eventually(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;

    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    condition()
}

/// Answers a request delivery the way a remote consumer would.
pub async fn reply(channel: &dyn BrokerChannel, request: &Delivery, reply: ReplyEnvelope) {
    let reply_to = request.properties.reply_to().clone().unwrap();
    let correlation_id = request.properties.correlation_id().clone().unwrap();

    channel
        .publish(Publishing {
            exchange: String::new(),
            routing_key: reply_to.to_string(),
            payload: reply.to_bytes().unwrap(),
            properties: BasicProperties::default().with_correlation_id(correlation_id),
        })
        .await
        .unwrap();
}
