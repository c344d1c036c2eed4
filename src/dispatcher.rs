// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Consumes the queue of one service and hands each delivery to the handler
//! registered for its pattern.
//!
//! Handlers are registered explicitly, pattern by pattern. Registration
//! checks the pattern against the bindings of the service queue, so a
//! handler that could never receive anything is a startup error instead of a
//! silent no-op.
//!
//! `run` keeps a consumer alive until `shutdown` is called: when the broker
//! connection goes away it waits for the reconnect interval, re-asserts the
//! queue and starts consuming again.

use crate::{
    broker::{BrokerChannel, BrokerConnector, ConsumeOptions},
    config::RabbitMQConfigs,
    consumer::{consume, HandlerTable},
    consumer_topology::ConsumerTopology,
    descriptor::TopologyDescriptor,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::MessageHandler,
    routing::{topic_matches, ServiceCatalog},
    topology::{AmqpTopology, Topology},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Dispatcher {
    connector: Arc<dyn BrokerConnector>,
    topology: ConsumerTopology,
    exchange: ExchangeDefinition,
    source: String,
    reconnect_interval: Duration,
    handlers: HandlerTable,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    /// Creates the dispatcher of `service`, which must be in the catalog.
    pub fn new(
        service: &str,
        descriptor: &TopologyDescriptor,
        catalog: &ServiceCatalog,
        connector: Arc<dyn BrokerConnector>,
        cfg: &RabbitMQConfigs,
    ) -> Result<Self, AmqpError> {
        let definition = catalog
            .get(service)
            .ok_or_else(|| AmqpError::UnknownService(service.to_owned()))?;

        let (shutdown, _) = watch::channel(false);

        Ok(Dispatcher {
            connector,
            topology: ConsumerTopology::for_service(descriptor, definition, cfg),
            exchange: ExchangeDefinition::new(descriptor.exchange_name())
                .kind(descriptor.exchange_kind())
                .durable(),
            source: cfg.app_name.clone(),
            reconnect_interval: cfg.reconnect_interval(),
            handlers: HandlerTable::default(),
            shutdown,
        })
    }

    /// Replaces the derived consumer topology, e.g. to change the prefetch.
    ///
    /// Queue arguments must stay identical to the installed ones, or the
    /// broker refuses the declaration.
    pub fn with_topology(mut self, topology: ConsumerTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn topology(&self) -> &ConsumerTopology {
        &self.topology
    }

    /// Registers the handler of `pattern`.
    pub fn register(
        mut self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, AmqpError> {
        let routed = self
            .topology
            .binding_patterns()
            .iter()
            .any(|binding| topic_matches(binding, pattern));

        if !routed {
            return Err(AmqpError::UnroutablePattern(
                pattern.to_owned(),
                self.topology.queue_name().to_owned(),
            ));
        }

        if self.handlers.contains_key(pattern) {
            return Err(AmqpError::DuplicateHandler(pattern.to_owned()));
        }

        self.handlers.insert(pattern.to_owned(), handler);
        Ok(self)
    }

    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        patterns
    }

    /// Consumes until `shutdown` is called, reconnecting after failures.
    pub async fn run(&self) -> Result<(), AmqpError> {
        let mut shutdown = self.shutdown.subscribe();

        info!(
            queue = self.topology.queue_name(),
            patterns = self.handlers.len(),
            "starting dispatcher"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.consume_blocking(&mut shutdown).await {
                Ok(()) if *shutdown.borrow() => break,
                Ok(()) => warn!(queue = self.topology.queue_name(), "consumer stream ended"),
                Err(err) => error!(error = err.to_string(), "consumer failure"),
            }

            debug!(
                "reconnecting in {}ms",
                self.reconnect_interval.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(queue = self.topology.queue_name(), "dispatcher stopped");
        Ok(())
    }

    /// Stops `run` after the delivery in progress.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn consume_blocking(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), AmqpError> {
        let channel = self
            .connector
            .connect(&format!("{}-{}", self.source, self.topology.service()))
            .await?;

        let result = self.consume_on(channel.clone(), shutdown).await;

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "consumer channel already gone");
        }

        result
    }

    async fn consume_on(
        &self,
        channel: Arc<dyn BrokerChannel>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AmqpError> {
        AmqpTopology::new(channel.clone())
            .exchange(self.exchange.clone())
            .consumer(&self.topology)
            .install()
            .await?;

        channel.qos(self.topology.prefetch_count()).await?;

        let tag = format!("{}-{}", self.topology.service(), Uuid::new_v4());
        let mut deliveries = channel
            .consume(self.topology.queue_name(), ConsumeOptions::manual_ack(&tag))
            .await?;

        debug!(queue = self.topology.queue_name(), tag = %tag, "consumer started");

        let tracer = global::tracer("amqp consumer");

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = consume(
                            &tracer,
                            &delivery,
                            &self.handlers,
                            &self.topology,
                            channel.as_ref(),
                            &self.source,
                        )
                        .await
                        {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{handler_fn, ConsumerMessage},
        memory::MemoryBroker,
        routing::ServiceDefinition,
    };

    fn dispatcher(service: &str) -> Result<Dispatcher, AmqpError> {
        let cfg = RabbitMQConfigs::default();
        let catalog = ServiceCatalog::new()
            .service(ServiceDefinition::with_keys("users", &["user"]))
            .service(ServiceDefinition::new("notification").subscribe("user.created"));

        Dispatcher::new(
            service,
            &TopologyDescriptor::from_configs(&cfg),
            &catalog,
            Arc::new(MemoryBroker::new()),
            &cfg,
        )
    }

    fn noop() -> Arc<dyn MessageHandler> {
        handler_fn(|_: ConsumerMessage| async { Ok(None) })
    }

    #[test]
    fn accepts_patterns_bound_to_the_queue() {
        let dispatcher = dispatcher("notification")
            .unwrap()
            .register("notification.send", noop())
            .unwrap()
            .register("user.created", noop())
            .unwrap();

        assert_eq!(dispatcher.patterns(), vec!["notification.send", "user.created"]);
    }

    #[test]
    fn rejects_unroutable_patterns() {
        let err = dispatcher("users")
            .unwrap()
            .register("city.updated", noop())
            .err();

        assert_eq!(
            err,
            Some(AmqpError::UnroutablePattern(
                "city.updated".into(),
                "app_users_queue".into()
            ))
        );
    }

    #[test]
    fn rejects_duplicate_handlers() {
        let err = dispatcher("users")
            .unwrap()
            .register("user.findById", noop())
            .unwrap()
            .register("user.findById", noop())
            .err();

        assert_eq!(err, Some(AmqpError::DuplicateHandler("user.findById".into())));
    }

    #[test]
    fn requires_a_known_service() {
        assert_eq!(
            dispatcher("billing").err(),
            Some(AmqpError::UnknownService("billing".into()))
        );
    }

    #[tokio::test]
    async fn shutdown_before_run_returns_immediately() {
        let dispatcher = dispatcher("users").unwrap();
        dispatcher.shutdown();

        dispatcher.run().await.unwrap();
    }
}
