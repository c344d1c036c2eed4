// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Naming
//!
//! Every queue name, dead-letter queue name and routing pattern used by the
//! installer, the router and the consumers is derived here and nowhere else.
//! A divergence between two derivations silently breaks delivery.

use crate::{config::RabbitMQConfigs, exchange::ExchangeKind};

/// Pure naming rules for the shared exchange and the per-service queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    prefix: String,
    exchange: String,
}

impl TopologyDescriptor {
    pub fn new(prefix: impl Into<String>, exchange: impl Into<String>) -> Self {
        TopologyDescriptor {
            prefix: prefix.into(),
            exchange: exchange.into(),
        }
    }

    pub fn from_configs(cfg: &RabbitMQConfigs) -> Self {
        Self::new(cfg.queue_prefix.clone(), cfg.exchange.clone())
    }

    /// `"{prefix}_{service}_queue"`
    pub fn queue_name(&self, service: &str) -> String {
        format!("{}_{}_queue", self.prefix, service)
    }

    /// `"{prefix}_{service}_dlx"`
    pub fn dead_letter_queue_name(&self, service: &str) -> String {
        format!("{}_{}_dlx", self.prefix, service)
    }

    /// `"{key}.*"`, where `key` is the leading pattern segment a service owns.
    pub fn routing_pattern(&self, key: &str) -> String {
        format!("{}.*", key)
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Topic
    }
}
