// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Response Client
//!
//! Emulates a call over the broker. Each [`RpcClient`] talks to one
//! destination queue through its own connection and listens on a private,
//! server-named reply queue. Requests carry `reply_to` and a fresh
//! `correlation_id`; the reply loop hands each reply to the request waiting
//! under that id. Any number of requests can be in flight on one client.

use crate::{
    broker::{BrokerChannel, BrokerConnector, ConsumeOptions, Delivery, PublishStatus, Publishing},
    config::RabbitMQConfigs,
    envelope::{MessageEnvelope, Metadata, ReplyEnvelope},
    errors::AmqpError,
    pending::PendingRequests,
    publisher::message_properties,
    queue::QueueDefinition,
};
use futures_util::StreamExt;
use lapin::types::ShortString;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Client handle for one destination queue.
pub struct RpcClient {
    destination: String,
    source: String,
    reply_queue: String,
    channel: Arc<dyn BrokerChannel>,
    pending: PendingRequests,
    open: Arc<AtomicBool>,
    reply_loop: JoinHandle<()>,
}

impl RpcClient {
    /// Connects, declares the reply queue and starts the reply loop.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        destination: &str,
        cfg: &RabbitMQConfigs,
    ) -> Result<Arc<RpcClient>, AmqpError> {
        let channel = connector
            .connect(&format!("{}-rpc-{}", cfg.app_name, destination))
            .await?;

        let reply_queue = match channel
            .declare_queue(&QueueDefinition::new("").exclusive().delete())
            .await
        {
            Ok(name) => name,
            Err(err) => {
                let _ = channel.close().await;
                return Err(err);
            }
        };

        let pending = PendingRequests::new();
        let open = Arc::new(AtomicBool::new(true));

        channel.on_failure({
            let pending = pending.clone();
            let open = open.clone();
            Arc::new(move |err| {
                warn!(error = err.to_string(), "rpc client connection lost");
                open.store(false, Ordering::SeqCst);
                pending.clear();
            })
        });

        let mut replies = match channel
            .consume(
                &reply_queue,
                ConsumeOptions::auto_ack(&format!("reply-{}", Uuid::new_v4())),
            )
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let _ = channel.close().await;
                return Err(err);
            }
        };

        let reply_loop = tokio::spawn({
            let pending = pending.clone();
            let open = open.clone();
            async move {
                while let Some(result) = replies.next().await {
                    match result {
                        Ok(delivery) => dispatch_reply(&pending, &delivery),
                        Err(err) => error!(error = err.to_string(), "errors consume reply"),
                    }
                }

                debug!("reply stream ended");
                open.store(false, Ordering::SeqCst);
                pending.clear();
            }
        });

        debug!(destination, reply_queue = %reply_queue, "rpc client ready");

        Ok(Arc::new(RpcClient {
            destination: destination.to_owned(),
            source: cfg.app_name.clone(),
            reply_queue,
            channel,
            pending,
            open,
            reply_loop,
        }))
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Requests still waiting for their reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.channel.is_open()
    }

    /// Sends `payload` under `pattern` and waits up to `timeout` for the reply.
    pub async fn send<T, R>(&self, pattern: &str, payload: &T, timeout: Duration) -> Result<R, AmqpError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_open() {
            return Err(AmqpError::ChannelClosed);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let envelope = MessageEnvelope::new(pattern, payload)?
            .with_metadata(Metadata::new(&correlation_id, &self.source));

        let publishing = Publishing {
            exchange: String::new(),
            routing_key: self.destination.clone(),
            payload: envelope.to_bytes()?,
            properties: message_properties(pattern, &self.source)
                .with_reply_to(ShortString::from(self.reply_queue.as_str()))
                .with_correlation_id(ShortString::from(correlation_id.as_str())),
        };

        // removed from the table on every exit path
        let (_slot, reply) = self.pending.register(&correlation_id);

        match self.channel.publish(publishing).await? {
            PublishStatus::Confirmed => {}
            PublishStatus::BackPressure => return Err(AmqpError::BackPressure),
        }

        debug!(pattern, correlation_id = %correlation_id, "request sent");

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(AmqpError::ChannelClosed),
            Err(_) => {
                warn!(pattern, correlation_id = %correlation_id, "request timed out");
                Err(AmqpError::Timeout {
                    pattern: pattern.to_owned(),
                    after_ms: timeout.as_millis(),
                })
            }
        }
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.reply_loop.abort();
        self.pending.clear();
        self.channel.close().await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reply_loop.abort();
    }
}

fn dispatch_reply(pending: &PendingRequests, delivery: &Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id().as_ref() else {
        debug!("reply without correlation id discarded");
        return;
    };

    let reply = match ReplyEnvelope::from_bytes(&delivery.data) {
        Ok(reply) => reply,
        Err(err) => {
            error!(error = err.to_string(), "undecodable reply");
            ReplyEnvelope::failure(&err.to_string())
        }
    };

    if !pending.complete(correlation_id.as_str(), reply) {
        debug!(
            correlation_id = correlation_id.as_str(),
            "reply for unknown or expired request discarded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn declares_a_private_reply_queue() {
        let broker = MemoryBroker::new();
        let client = RpcClient::connect(
            Arc::new(broker.clone()),
            "app_users_queue",
            &RabbitMQConfigs::default(),
        )
        .await
        .unwrap();

        let queue = broker.queue(client.reply_queue()).unwrap();
        assert!(queue.is_exclusive());
        assert!(queue.is_auto_delete());
        assert_eq!(broker.consumer_count(client.reply_queue()), 1);

        client.close().await.unwrap();
        assert!(broker.queue(client.reply_queue()).is_none());
    }

    #[tokio::test]
    async fn broker_failure_closes_the_client() {
        let broker = MemoryBroker::new();
        let client = RpcClient::connect(
            Arc::new(broker.clone()),
            "app_users_queue",
            &RabbitMQConfigs::default(),
        )
        .await
        .unwrap();
        assert!(client.is_open());

        broker.disconnect_all();

        assert!(!client.is_open());
        let result: Result<Value, _> = client
            .send("user.findById", &json!({"id": "u1"}), Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(AmqpError::ChannelClosed));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let broker = MemoryBroker::new();
        let client = RpcClient::connect(
            Arc::new(broker.clone()),
            "app_users_queue",
            &RabbitMQConfigs::default(),
        )
        .await
        .unwrap();

        // no destination queue: the request is dropped by the broker
        let result: Result<Value, _> = client
            .send("user.findById", &json!({"id": "u1"}), Duration::from_millis(20))
            .await;

        assert_eq!(
            result,
            Err(AmqpError::Timeout {
                pattern: "user.findById".into(),
                after_ms: 20
            })
        );
        assert_eq!(client.pending_count(), 0);
    }
}
