// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Service Catalog and Routing Table
//!
//! The catalog lists every logical service known to the deployment: its
//! identifier, the leading pattern segments it owns and any extra patterns its
//! queue subscribes to. The routing table is derived from it once at startup
//! and maps a pattern's leading segment to the owning service.

use crate::{descriptor::TopologyDescriptor, errors::AmqpError};
use std::collections::HashMap;

/// A logical destination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub(crate) name: String,
    pub(crate) keys: Vec<String>,
    pub(crate) extra_patterns: Vec<String>,
}

impl ServiceDefinition {
    /// A service owning the patterns that start with its own name.
    pub fn new(name: &str) -> Self {
        ServiceDefinition {
            name: name.to_owned(),
            keys: vec![name.to_owned()],
            extra_patterns: vec![],
        }
    }

    /// A service reached through leading segments other than its name,
    /// e.g. `users` owning `user.*`.
    pub fn with_keys(name: &str, keys: &[&str]) -> Self {
        ServiceDefinition {
            name: name.to_owned(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            extra_patterns: vec![],
        }
    }

    /// Subscribes the service queue to a pattern owned by another service,
    /// e.g. a notification service listening to `user.created`.
    pub fn subscribe(mut self, pattern: &str) -> Self {
        self.extra_patterns.push(pattern.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key used for the dead-letter routing pattern.
    pub fn primary_key(&self) -> &str {
        self.keys.first().map(String::as_str).unwrap_or(&self.name)
    }

    /// Every routing-key pattern the service queue is bound with.
    pub fn binding_patterns(&self, descriptor: &TopologyDescriptor) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .keys
            .iter()
            .map(|key| descriptor.routing_pattern(key))
            .collect();

        for pattern in &self.extra_patterns {
            if !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }

        patterns
    }
}

/// The fixed list of services of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: Vec<ServiceDefinition>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        ServiceCatalog::default()
    }

    pub fn service(mut self, def: ServiceDefinition) -> Self {
        self.services.push(def);
        self
    }

    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Builds the prefix lookup table.
    ///
    /// Rejects a key claimed by two services, and a subscription that also
    /// matches the retry routing key of another service: retried messages are
    /// republished to the shared exchange, so such a queue would receive a
    /// copy of every retry of that service.
    pub fn routing_table(
        &self,
        descriptor: &TopologyDescriptor,
    ) -> Result<RoutingTable, AmqpError> {
        let mut table = HashMap::new();

        for service in &self.services {
            for key in &service.keys {
                if key.is_empty() || key.contains('.') {
                    return Err(AmqpError::InvalidPattern(key.clone()));
                }

                if let Some(owner) = table.insert(key.clone(), service.name.clone()) {
                    return Err(AmqpError::InvalidConfig(format!(
                        "routing key `{key}` claimed by `{owner}` and `{}`",
                        service.name
                    )));
                }
            }
        }

        for service in &self.services {
            for pattern in &service.extra_patterns {
                let overlapping = self.services.iter().find(|other| {
                    other.name != service.name
                        && topic_matches(pattern, &descriptor.routing_pattern(other.primary_key()))
                });

                if let Some(other) = overlapping {
                    return Err(AmqpError::InvalidConfig(format!(
                        "subscription `{pattern}` of `{}` also matches the retries of `{}`",
                        service.name, other.name
                    )));
                }
            }
        }

        Ok(RoutingTable { table })
    }
}

/// Destination resolved for a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub service: String,
    pub queue: String,
}

/// Static mapping from a pattern's leading segment to a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    table: HashMap<String, String>,
}

impl RoutingTable {
    /// Resolves the service owning `pattern`.
    ///
    /// Fails with `InvalidPattern` when the pattern has no leading segment and
    /// with `UnknownService` when the segment is not in the table. There is no
    /// fallback destination.
    pub fn service_for(&self, pattern: &str) -> Result<&str, AmqpError> {
        let key = service_key(pattern)?;

        self.table
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| AmqpError::UnknownService(key.to_owned()))
    }

    pub fn resolve(
        &self,
        descriptor: &TopologyDescriptor,
        pattern: &str,
    ) -> Result<Route, AmqpError> {
        let service = self.service_for(pattern)?;

        Ok(Route {
            service: service.to_owned(),
            queue: descriptor.queue_name(service),
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Leading segment of a dotted pattern.
pub fn service_key(pattern: &str) -> Result<&str, AmqpError> {
    match pattern.trim().split('.').next() {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(AmqpError::InvalidPattern(pattern.to_owned())),
    }
}

/// Topic exchange matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(binding: &str, routing_key: &str) -> bool {
    let binding: Vec<&str> = binding.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&binding, &key)
}

fn matches_words(binding: &[&str], key: &[&str]) -> bool {
    match binding.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((k, key_rest)) if *word == "*" || word == k => matches_words(rest, key_rest),
            _ => false,
        },
    }
}
