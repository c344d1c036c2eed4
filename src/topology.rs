// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares the shared exchange, the per-service queues with their retry
//! queues, and the bindings between them.
//!
//! The main components are:
//! - `Topology` trait: registration of exchanges, queues and bindings, then install
//! - `AmqpTopology`: installs a registered topology through a broker channel
//! - `TopologyInstaller`: startup step deriving the whole topology from the
//!   service catalog and installing it over a transient connection

use crate::{
    broker::{BrokerChannel, BrokerConnector},
    config::RabbitMQConfigs,
    consumer_topology::ConsumerTopology,
    descriptor::TopologyDescriptor,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    routing::ServiceCatalog,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, info, warn};

/// Registration of topology components followed by installation.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares everything on the broker: exchanges, then queues, then bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Broker-backed implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Registers the retry queue, service queue and bindings of a consumer.
    pub fn consumer(self, topology: &ConsumerTopology) -> Self {
        let this = self
            .queue(topology.dead_letter_queue_definition())
            .queue(topology.queue_definition());

        topology
            .bindings()
            .into_iter()
            .fold(this, |this, binding| this.queue_binding(binding))
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.contains(&def) {
            self.exchanges.push(def);
        }
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel.declare_queue(def).await?;
            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            self.channel.bind_queue(binding).await?;
        }

        debug!("queues were bound");
        Ok(())
    }
}

/// Startup step asserting the full topology of the deployment.
///
/// Runs once per process over its own connection, which is closed before
/// `install` returns whatever the outcome. Any failure is meant to abort
/// startup; a partially bound topology is never used.
pub struct TopologyInstaller {
    connector: Arc<dyn BrokerConnector>,
    descriptor: TopologyDescriptor,
    catalog: ServiceCatalog,
    cfg: RabbitMQConfigs,
    overrides: HashMap<String, ConsumerTopology>,
}

impl TopologyInstaller {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        descriptor: TopologyDescriptor,
        catalog: ServiceCatalog,
        cfg: RabbitMQConfigs,
    ) -> Self {
        TopologyInstaller {
            connector,
            descriptor,
            catalog,
            cfg,
            overrides: HashMap::default(),
        }
    }

    /// Replaces the derived consumer topology of one service.
    pub fn with_consumer(mut self, topology: ConsumerTopology) -> Self {
        self.overrides.insert(topology.service().to_owned(), topology);
        self
    }

    pub fn exchange_definition(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(self.descriptor.exchange_name())
            .kind(self.descriptor.exchange_kind())
            .durable()
    }

    /// Consumer topologies of every service in the catalog.
    pub fn consumer_topologies(&self) -> Vec<ConsumerTopology> {
        self.catalog
            .services()
            .iter()
            .map(|service| match self.overrides.get(service.name()) {
                Some(topology) => topology.clone(),
                None => ConsumerTopology::for_service(&self.descriptor, service, &self.cfg),
            })
            .collect()
    }

    pub async fn install(&self) -> Result<(), AmqpError> {
        let connection_name = format!("{}-topology", self.cfg.app_name);
        let channel = self.connector.connect(&connection_name).await?;

        let topology = self
            .consumer_topologies()
            .iter()
            .fold(
                AmqpTopology::new(channel.clone()).exchange(self.exchange_definition()),
                |topology, consumer| topology.consumer(consumer),
            );

        let result = topology.install().await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close topology connection");
        }

        match result {
            Ok(()) => {
                info!(
                    exchange = self.descriptor.exchange_name(),
                    services = self.catalog.services().len(),
                    "topology installed"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "topology installation failed");
                Err(err)
            }
        }
    }
}
