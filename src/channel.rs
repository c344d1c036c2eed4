// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Opens connections and channels to RabbitMQ with `lapin` and exposes them
//! through the [`BrokerChannel`] abstraction. Every channel is opened in
//! publisher-confirm mode, so a publish only succeeds once the broker has
//! taken responsibility for the message.

use crate::{
    broker::{
        Acknowledger, BrokerChannel, BrokerConnector, ConsumeOptions, Delivery, DeliveryStream,
        FailureHook, PublishStatus, Publishing,
    },
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    uri::AMQPUri,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Opens `lapin` connections to the configured broker.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    uri: AMQPUri,
}

impl LapinConnector {
    pub fn new(uri: AMQPUri) -> Self {
        LapinConnector { uri }
    }

    pub fn from_configs(cfg: &RabbitMQConfigs) -> Self {
        Self::new(cfg.amqp_uri())
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel: Arc<dyn BrokerChannel> =
            Arc::new(LapinChannel::open(self.uri.clone(), connection_name).await?);
        Ok(channel)
    }
}

/// A `lapin` connection with one confirm-mode channel on it.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

impl LapinChannel {
    /// Connects to `uri` and creates a channel with publisher confirms enabled.
    /// The connection is closed again when the channel cannot be set up.
    pub async fn open(uri: AMQPUri, connection_name: &str) -> Result<LapinChannel, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let connection = Connection::connect_uri(uri, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError(err.to_string())
        })?;
        debug!("amqp connected");

        let channel = match Self::confirm_channel(&connection).await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close(200, "channel setup failed").await {
                    warn!(error = close_err.to_string(), "error to close the connection");
                }
                return Err(err);
            }
        };

        Ok(LapinChannel {
            connection,
            channel,
        })
    }

    async fn confirm_channel(connection: &Connection) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })?;
        debug!("channel created");

        Ok(channel)
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("declaring exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("declaring queue: {}", def.name);

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.field_table(),
            )
            .await
            .map(|queue| queue.name().as_str().to_owned())
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn publish(&self, publishing: Publishing) -> Result<PublishStatus, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                &publishing.exchange,
                &publishing.routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &publishing.payload,
                publishing.properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error awaiting publisher confirm");
            AmqpError::PublishingError(err.to_string())
        })?;

        if confirmation.is_nack() {
            return Ok(PublishStatus::BackPressure);
        }

        Ok(PublishStatus::Confirmed)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        let queue = queue.to_owned();
        Ok(Box::pin(consumer.map(move |result| match result {
            Ok(delivery) => {
                let mut converted = Delivery::new(
                    &queue,
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.data,
                    delivery.properties,
                    Arc::new(LapinAcker(delivery.acker)),
                );
                converted.redelivered = delivery.redelivered;
                Ok(converted)
            }
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        })))
    }

    fn on_failure(&self, hook: FailureHook) {
        let on_connection = hook.clone();
        self.connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            on_connection(&AmqpError::ConnectionError(err.to_string()));
        });

        self.channel.on_error(move |err| {
            error!(error = err.to_string(), "amqp channel failure");
            hook(&AmqpError::ChannelError(err.to_string()));
        });
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "closing").await {
                debug!(error = err.to_string(), "channel already gone");
            }
        }

        if self.connection.status().connected() {
            self.connection.close(200, "closing").await.map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })?;
        }

        Ok(())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}
