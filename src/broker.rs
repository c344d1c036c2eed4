// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The operations the routing layer needs from a topic-exchange broker:
//! connecting, declaring exchanges and queues, binding, publishing with
//! confirmation, consuming with manual acknowledgement and observing channel
//! failure. [`crate::channel`] implements them on top of `lapin`, and
//! [`crate::memory`] provides an in-process broker with the same semantics.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::Stream;
use lapin::BasicProperties;
use std::{fmt, pin::Pin, sync::Arc};

/// Callback fired when the broker reports a connection or channel failure.
pub type FailureHook = Arc<dyn Fn(&AmqpError) + Send + Sync>;

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, AmqpError>> + Send>>;

/// Outcome of a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// The broker accepted the message.
    Confirmed,
    /// The broker could not take the message right now; it may succeed later.
    BackPressure,
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Broker acknowledges on delivery. Only reply queues use this.
    pub no_ack: bool,
}

impl ConsumeOptions {
    pub fn manual_ack(tag: &str) -> Self {
        ConsumeOptions {
            consumer_tag: tag.to_owned(),
            no_ack: false,
        }
    }

    pub fn auto_ack(tag: &str) -> Self {
        ConsumeOptions {
            consumer_tag: tag.to_owned(),
            no_ack: true,
        }
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery. Without `requeue` the broker dead-letters it
    /// when the queue has a dead-letter exchange, and drops it otherwise.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue.
#[derive(Clone)]
pub struct Delivery {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    pub(crate) acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        queue: &str,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        properties: BasicProperties,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            data,
            properties,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One connection plus one channel on it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Asserts an exchange. Identical re-declarations are no-ops.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Asserts a queue and returns its name, which is broker-generated when
    /// the definition's name is empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue. Binding twice with the same key is a no-op.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(&self, publishing: Publishing) -> Result<PublishStatus, AmqpError>;

    /// Bounds the number of unacknowledged deliveries per consumer.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Registers a callback fired on connection or channel failure.
    fn on_failure(&self, hook: FailureHook);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens broker channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}
