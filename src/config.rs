// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection parameters and tuning knobs for the messaging layer, read once at
//! startup. Every value has a default so a local broker works out of the box.

use crate::errors::AmqpError;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use std::{collections::HashMap, str::FromStr, time::Duration};

/// Connection and tuning parameters for the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    /// Application name, used as connection name and envelope source
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    /// Delay between consumer reconnection attempts
    pub reconnect_interval_ms: u64,
    /// Default prefetch count for consumers
    pub prefetch: u16,
    /// Default deadline for request/response calls
    pub request_timeout_ms: u64,
    /// Wait before the single publish retry after back-pressure
    pub publish_retry_delay_ms: u64,
    /// Default time a rejected message waits in the retry queue
    pub message_ttl_ms: u32,
    /// Per-service retry delay, keyed by service identifier
    pub message_ttl_overrides: HashMap<String, u32>,
    /// Maximum number of dead-letter round trips, unbounded when `None`
    pub max_retries: Option<u32>,
    pub queue_prefix: String,
    pub exchange: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "rabbitmq-routing".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            heartbeat_secs: 30,
            reconnect_interval_ms: 2000,
            prefetch: 10,
            request_timeout_ms: 5000,
            publish_retry_delay_ms: 50,
            message_ttl_ms: 5000,
            message_ttl_overrides: HashMap::default(),
            max_retries: None,
            queue_prefix: "app".to_owned(),
            exchange: "services".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults for
    /// absent keys. Present but malformed values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RabbitMQConfigs::default();

        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        Ok(RabbitMQConfigs {
            app_name: text("APP_NAME", defaults.app_name),
            host: text("RABBITMQ_HOST", defaults.host),
            port: parse(&lookup, "RABBITMQ_PORT", defaults.port)?,
            user: text("RABBITMQ_USER", defaults.user),
            password: text("RABBITMQ_PASSWORD", defaults.password),
            vhost: text("RABBITMQ_VHOST", defaults.vhost),
            heartbeat_secs: parse(&lookup, "RABBITMQ_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
            reconnect_interval_ms: parse(
                &lookup,
                "RABBITMQ_RECONNECT_INTERVAL_MS",
                defaults.reconnect_interval_ms,
            )?,
            prefetch: parse(&lookup, "RABBITMQ_PREFETCH", defaults.prefetch)?,
            request_timeout_ms: parse(
                &lookup,
                "RABBITMQ_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            )?,
            publish_retry_delay_ms: parse(
                &lookup,
                "RABBITMQ_PUBLISH_RETRY_DELAY_MS",
                defaults.publish_retry_delay_ms,
            )?,
            message_ttl_ms: parse(&lookup, "RABBITMQ_MESSAGE_TTL_MS", defaults.message_ttl_ms)?,
            message_ttl_overrides: match lookup("RABBITMQ_MESSAGE_TTL_OVERRIDES") {
                Some(raw) => parse_overrides(&raw)?,
                None => defaults.message_ttl_overrides,
            },
            max_retries: match lookup("RABBITMQ_MAX_RETRIES") {
                Some(raw) => Some(parse_value("RABBITMQ_MAX_RETRIES", &raw)?),
                None => None,
            },
            queue_prefix: text("RABBITMQ_QUEUE_PREFIX", defaults.queue_prefix),
            exchange: text("RABBITMQ_EXCHANGE", defaults.exchange),
        })
    }

    /// Builds the broker address field by field, so credentials and virtual
    /// host are taken verbatim and never reparsed from a URI string.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_secs),
                ..AMQPQueryString::default()
            },
        }
    }

    /// Retry delay for `service`, honouring per-service overrides.
    pub fn message_ttl_for(&self, service: &str) -> u32 {
        self.message_ttl_overrides
            .get(service)
            .copied()
            .unwrap_or(self.message_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AmqpError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, AmqpError> {
    raw.trim()
        .parse()
        .map_err(|_| AmqpError::InvalidConfig(format!("{key}={raw}")))
}

// "users=5000,notifications=10000"
fn parse_overrides(raw: &str) -> Result<HashMap<String, u32>, AmqpError> {
    let mut overrides = HashMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((service, ttl)) = entry.split_once('=') else {
            return Err(AmqpError::InvalidConfig(format!(
                "RABBITMQ_MESSAGE_TTL_OVERRIDES entry `{entry}`"
            )));
        };

        overrides.insert(
            service.trim().to_owned(),
            parse_value("RABBITMQ_MESSAGE_TTL_OVERRIDES", ttl)?,
        );
    }

    Ok(overrides)
}
