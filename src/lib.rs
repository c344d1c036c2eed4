// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Service-to-service messaging over a shared RabbitMQ topic exchange:
//! topology bootstrap, pattern routing, request/response with correlated
//! replies, a self-healing publishing channel and retries through
//! dead-lettering.

mod consumer;
mod otel;
mod pending;

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod consumer_topology;
pub mod context;
pub mod descriptor;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod router;
pub mod routing;
pub mod topology;

pub use config::RabbitMQConfigs;
pub use context::Messaging;
pub use errors::{AmqpError, ErrorKind};
pub use handler::{handler_fn, ConsumerMessage, HandlerError, MessageHandler};
pub use routing::{ServiceCatalog, ServiceDefinition};
