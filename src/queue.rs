// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing queues and their bindings to an exchange, including the
//! dead-letter and TTL arguments the retry loop relies on.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument naming the exchange rejected or expired messages go to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument bounding how long a message may sit in the queue
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Definition of a queue with its configuration parameters.
///
/// An empty name asks the broker to generate one, which is how reply queues
/// for request/response are declared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the durability flag explicitly.
    pub fn with_durability(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    ///
    /// Expired messages are dead-lettered when the queue has a dead-letter
    /// exchange, dropped otherwise.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.arguments.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl.min(i32::MAX as u32) as i32)),
        );
        self
    }

    /// Routes rejected and expired messages to `exchange` with `routing_key`.
    ///
    /// An empty exchange name is the broker's default exchange, where the
    /// routing key is a queue name.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange)),
        );
        self.arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key)),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.arguments
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        FieldTable::from(self.arguments.clone())
    }

    pub fn dead_letter_exchange(&self) -> Option<String> {
        self.string_argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
    }

    pub fn dead_letter_routing_key(&self) -> Option<String> {
        self.string_argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
    }

    pub fn message_ttl(&self) -> Option<u32> {
        match self.arguments.get(AMQP_HEADERS_MESSAGE_TTL) {
            Some(AMQPValue::LongInt(ttl)) if *ttl >= 0 => Some(*ttl as u32),
            _ => None,
        }
    }

    fn string_argument(&self, key: &str) -> Option<String> {
        match self.arguments.get(key) {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            Some(AMQPValue::ShortString(value)) => Some(value.as_str().to_owned()),
            _ => None,
        }
    }
}

/// Binding of a queue to an exchange under a routing-key pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue. The exchange and routing key
    /// are set with [`QueueBinding::exchange`] and [`QueueBinding::routing_key`].
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
