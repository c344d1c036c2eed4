// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Context
//!
//! [`Messaging`] is built once at startup and passed to whatever needs to
//! emit events, send requests or consume a service queue. Building it
//! installs the topology, so a process that got a `Messaging` knows every
//! exchange, queue and binding exists.

use crate::{
    broker::BrokerConnector,
    channel::LapinConnector,
    config::RabbitMQConfigs,
    descriptor::TopologyDescriptor,
    dispatcher::Dispatcher,
    errors::AmqpError,
    publisher::ChannelPublisher,
    router::MessageRouter,
    routing::{Route, ServiceCatalog},
    topology::TopologyInstaller,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

pub struct Messaging {
    cfg: RabbitMQConfigs,
    descriptor: TopologyDescriptor,
    catalog: ServiceCatalog,
    connector: Arc<dyn BrokerConnector>,
    publisher: Arc<ChannelPublisher>,
    router: MessageRouter,
}

impl Messaging {
    /// Connects to the broker described by `cfg` over AMQP.
    pub async fn connect(cfg: RabbitMQConfigs, catalog: ServiceCatalog) -> Result<Self, AmqpError> {
        let connector = Arc::new(LapinConnector::from_configs(&cfg));
        Self::start(cfg, catalog, connector).await
    }

    /// Installs the topology and prepares the outbound side.
    pub async fn start(
        cfg: RabbitMQConfigs,
        catalog: ServiceCatalog,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, AmqpError> {
        let descriptor = TopologyDescriptor::from_configs(&cfg);
        let table = catalog.routing_table(&descriptor)?;

        TopologyInstaller::new(
            connector.clone(),
            descriptor.clone(),
            catalog.clone(),
            cfg.clone(),
        )
        .install()
        .await?;

        let publisher = ChannelPublisher::new(connector.clone(), &descriptor, &cfg);
        let router = MessageRouter::new(
            table,
            descriptor.clone(),
            publisher.clone(),
            connector.clone(),
            cfg.clone(),
        );

        info!(app = %cfg.app_name, "messaging started");

        Ok(Messaging {
            cfg,
            descriptor,
            catalog,
            connector,
            publisher,
            router,
        })
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.cfg
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn publisher(&self) -> &Arc<ChannelPublisher> {
        &self.publisher
    }

    pub fn route(&self, pattern: &str) -> Result<Route, AmqpError> {
        self.router.route(pattern)
    }

    pub async fn emit<T: Serialize>(&self, pattern: &str, payload: &T) {
        self.router.emit(pattern, payload).await
    }

    pub async fn try_emit<T: Serialize>(&self, pattern: &str, payload: &T) -> Result<(), AmqpError> {
        self.router.try_emit(pattern, payload).await
    }

    pub async fn send<T, R>(&self, pattern: &str, payload: &T) -> Result<R, AmqpError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.router.send(pattern, payload).await
    }

    pub async fn send_with_timeout<T, R>(
        &self,
        pattern: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, AmqpError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.router.send_with_timeout(pattern, payload, timeout).await
    }

    /// Dispatcher consuming the queue of `service`.
    pub fn dispatcher(&self, service: &str) -> Result<Dispatcher, AmqpError> {
        Dispatcher::new(
            service,
            &self.descriptor,
            &self.catalog,
            self.connector.clone(),
            &self.cfg,
        )
    }

    /// Closes client handles and the publishing channel.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;

        if let Err(err) = self.publisher.close().await {
            warn!(error = err.to_string(), "failure to close the publisher");
        }

        info!("messaging stopped");
    }
}
