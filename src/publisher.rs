// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publishing Channel Manager
//!
//! Owns the single channel a process uses to emit events. The channel is
//! created on first use, discarded as soon as the broker reports a failure,
//! and recreated by the next publish.
//!
//! State transitions:
//!
//! ```text
//! Absent --ensure_ready--> Connecting --ok--> Ready{generation}
//!    ^                         |                  |
//!    +--------- error ---------+                  |
//!    +---- failure hook (same generation) --------+
//!    +---- publish failure / second back-pressure +
//! ```

use crate::{
    broker::{BrokerChannel, BrokerConnector, PublishStatus, Publishing},
    config::RabbitMQConfigs,
    descriptor::TopologyDescriptor,
    envelope::MessageEnvelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the message pattern
pub const AMQP_HEADERS_PATTERN: &str = "x-pattern";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Observable state of the publishing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Absent,
    Connecting,
    Ready { generation: u64 },
}

enum Slot {
    Absent,
    Connecting,
    Ready {
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
    },
}

struct Inner {
    slot: Slot,
    generation: u64,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Builds the properties every outgoing message carries.
pub(crate) fn message_properties(pattern: &str, source: &str) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_current(&mut headers);
    headers.insert(
        ShortString::from(AMQP_HEADERS_PATTERN),
        AMQPValue::LongString(LongString::from(pattern)),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_type(ShortString::from(pattern))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_app_id(ShortString::from(source))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(FieldTable::from(headers))
}

/// Self-healing publisher over one broker channel.
pub struct ChannelPublisher {
    connector: Arc<dyn BrokerConnector>,
    exchange: ExchangeDefinition,
    connection_name: String,
    source: String,
    retry_delay: Duration,
    inner: Arc<Mutex<Inner>>,
    connecting: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ChannelPublisher {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        descriptor: &TopologyDescriptor,
        cfg: &RabbitMQConfigs,
    ) -> Arc<ChannelPublisher> {
        Arc::new(ChannelPublisher {
            connector,
            exchange: ExchangeDefinition::new(descriptor.exchange_name())
                .kind(descriptor.exchange_kind())
                .durable(),
            connection_name: format!("{}-publisher", cfg.app_name),
            source: cfg.app_name.clone(),
            retry_delay: cfg.publish_retry_delay(),
            inner: Arc::new(Mutex::new(Inner {
                slot: Slot::Absent,
                generation: 0,
            })),
            connecting: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> PublisherState {
        match &lock(&self.inner).slot {
            Slot::Absent => PublisherState::Absent,
            Slot::Connecting => PublisherState::Connecting,
            Slot::Ready { generation, .. } => PublisherState::Ready {
                generation: *generation,
            },
        }
    }

    /// Opens the channel ahead of the first publish.
    pub async fn warm_up(&self) -> Result<(), AmqpError> {
        self.ensure_ready().await.map(|_| ())
    }

    /// Publishes `envelope` with publisher confirms.
    ///
    /// Back-pressure is retried once after the configured delay. A second
    /// back-pressure or any other failure discards the channel.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
    ) -> Result<(), AmqpError> {
        let publishing = Publishing {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: envelope.to_bytes()?,
            properties: message_properties(envelope.pattern(), &self.source),
        };

        let (generation, channel) = self.ensure_ready().await?;

        let result = match channel.publish(publishing.clone()).await {
            Ok(PublishStatus::BackPressure) => {
                warn!(routing_key, "broker back-pressure, retrying publish once");
                tokio::time::sleep(self.retry_delay).await;
                channel.publish(publishing).await
            }
            other => other,
        };

        match result {
            Ok(PublishStatus::Confirmed) => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
            Ok(PublishStatus::BackPressure) => {
                error!(routing_key, "broker back-pressure persisted, dropping channel");
                self.teardown(generation);
                Err(AmqpError::BackPressure)
            }
            Err(err) => {
                error!(error = err.to_string(), routing_key, "failure to publish");
                self.teardown(generation);
                Err(err)
            }
        }
    }

    /// Closes the channel. Later publishes fail with `ChannelClosed`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        let _connecting = self.connecting.lock().await;

        let previous = std::mem::replace(&mut lock(&self.inner).slot, Slot::Absent);
        if let Slot::Ready { channel, .. } = previous {
            channel.close().await?;
        }

        debug!("publisher closed");
        Ok(())
    }

    fn ready_channel(&self) -> Option<(u64, Arc<dyn BrokerChannel>)> {
        let mut inner = lock(&self.inner);

        let Slot::Ready {
            generation,
            channel,
        } = &inner.slot
        else {
            return None;
        };

        if channel.is_open() {
            return Some((*generation, channel.clone()));
        }

        debug!(generation, "publishing channel is no longer open");
        inner.slot = Slot::Absent;
        None
    }

    async fn ensure_ready(&self) -> Result<(u64, Arc<dyn BrokerChannel>), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelClosed);
        }

        if let Some(ready) = self.ready_channel() {
            return Ok(ready);
        }

        let _connecting = self.connecting.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelClosed);
        }

        // another caller may have connected while we waited
        if let Some(ready) = self.ready_channel() {
            return Ok(ready);
        }

        lock(&self.inner).slot = Slot::Connecting;

        match self.connect().await {
            Ok(ready) => Ok(ready),
            Err(err) => {
                error!(error = err.to_string(), "failure to open the publishing channel");
                lock(&self.inner).slot = Slot::Absent;
                Err(err)
            }
        }
    }

    async fn connect(&self) -> Result<(u64, Arc<dyn BrokerChannel>), AmqpError> {
        let channel = self.connector.connect(&self.connection_name).await?;

        if let Err(err) = channel.declare_exchange(&self.exchange).await {
            let _ = channel.close().await;
            return Err(err);
        }

        let generation = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.generation
        };

        let state = Arc::downgrade(&self.inner);
        channel.on_failure(Arc::new(move |err| {
            let Some(state) = state.upgrade() else {
                return;
            };

            let mut inner = lock(&state);
            if matches!(inner.slot, Slot::Ready { generation: current, .. } if current == generation)
            {
                warn!(error = err.to_string(), generation, "publishing channel lost");
                inner.slot = Slot::Absent;
            }
        }));

        lock(&self.inner).slot = Slot::Ready {
            generation,
            channel: channel.clone(),
        };
        debug!(generation, "publishing channel ready");

        Ok((generation, channel))
    }

    fn teardown(&self, generation: u64) {
        let mut inner = lock(&self.inner);

        if !matches!(inner.slot, Slot::Ready { generation: current, .. } if current == generation)
        {
            return;
        }

        if let Slot::Ready { channel, .. } = std::mem::replace(&mut inner.slot, Slot::Absent) {
            tokio::spawn(async move {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "discarded channel failed to close");
                }
            });
        }
    }
}
