// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Topology
//!
//! Derives, for one service, everything a consumer needs: the queue to read,
//! the prefetch bound and the dead-letter arguments that implement delayed
//! retry without application-side sleeping.
//!
//! A rejected message travels:
//!
//! ```text
//! {prefix}_{service}_queue --reject--> default exchange --> {prefix}_{service}_dlx
//!        ^                                                          |
//!        |                                                   x-message-ttl expires
//!        +---- shared topic exchange <-- "{key}.*" -----------------+
//! ```
//!
//! The installer declares the service queue from the same definition, so the
//! queue arguments are identical on both sides.

use crate::{
    config::RabbitMQConfigs,
    descriptor::TopologyDescriptor,
    queue::{QueueBinding, QueueDefinition},
    routing::ServiceDefinition,
};

/// Consumer-side configuration of one service queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerTopology {
    service: String,
    queue: String,
    dead_letter_queue: String,
    exchange: String,
    retry_routing_key: String,
    binding_patterns: Vec<String>,
    prefetch: u16,
    message_ttl: u32,
    durable: bool,
    max_retries: Option<u32>,
}

impl ConsumerTopology {
    /// Starts from the configured defaults for `service`.
    pub fn for_service(
        descriptor: &TopologyDescriptor,
        service: &ServiceDefinition,
        cfg: &RabbitMQConfigs,
    ) -> Self {
        ConsumerTopology {
            service: service.name().to_owned(),
            queue: descriptor.queue_name(service.name()),
            dead_letter_queue: descriptor.dead_letter_queue_name(service.name()),
            exchange: descriptor.exchange_name().to_owned(),
            retry_routing_key: descriptor.routing_pattern(service.primary_key()),
            binding_patterns: service.binding_patterns(descriptor),
            prefetch: cfg.prefetch,
            message_ttl: cfg.message_ttl_for(service.name()),
            durable: true,
            max_retries: cfg.max_retries,
        }
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Time a rejected message waits before coming back, in milliseconds.
    pub fn message_ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = ttl;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn dead_letter_queue_name(&self) -> &str {
        &self.dead_letter_queue
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    pub fn ttl(&self) -> u32 {
        self.message_ttl
    }

    pub fn retry_limit(&self) -> Option<u32> {
        self.max_retries
    }

    /// Consumers always settle deliveries explicitly.
    pub fn auto_ack(&self) -> bool {
        false
    }

    pub fn binding_patterns(&self) -> &[String] {
        &self.binding_patterns
    }

    /// The service queue. Rejections go to the retry queue.
    pub fn queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new(&self.queue)
            .with_durability(self.durable)
            .dead_letter("", &self.dead_letter_queue)
    }

    /// The retry queue: holds messages for the TTL, then re-publishes them to
    /// the shared exchange under the service's own routing pattern.
    pub fn dead_letter_queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new(&self.dead_letter_queue)
            .with_durability(self.durable)
            .dead_letter(&self.exchange, &self.retry_routing_key)
            .ttl(self.message_ttl)
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.binding_patterns
            .iter()
            .map(|pattern| {
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(pattern)
            })
            .collect()
    }
}
