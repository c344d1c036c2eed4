// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Envelopes
//!
//! Every message travels as JSON. Requests and events share
//! [`MessageEnvelope`]; answers to requests travel as [`ReplyEnvelope`].

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Envelope format version written into metadata.
pub const ENVELOPE_VERSION: &str = "1";

/// Optional envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub correlation_id: String,
    pub source: String,
    pub version: String,
}

impl Metadata {
    pub fn new(correlation_id: &str, source: &str) -> Self {
        Metadata {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            correlation_id: correlation_id.to_owned(),
            source: source.to_owned(),
            version: ENVELOPE_VERSION.to_owned(),
        }
    }
}

/// `{"pattern": "<service>.<action>", "data": <payload>}`
///
/// The pattern is both the message type and, for emitted events, the routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pattern: String,
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

impl MessageEnvelope {
    pub fn new<T: Serialize>(pattern: &str, payload: &T) -> Result<Self, AmqpError> {
        Ok(MessageEnvelope {
            pattern: pattern.to_owned(),
            data: serde_json::to_value(payload)?,
            metadata: None,
        })
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AmqpError> {
        serde_json::from_slice(data).map_err(|e| AmqpError::ParsePayloadError(e.to_string()))
    }
}

/// Answer to a request, correlated through the AMQP `correlation_id` property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
    #[serde(default)]
    pub is_disposed: bool,
}

impl ReplyEnvelope {
    pub fn success(response: Value) -> Self {
        ReplyEnvelope {
            response: Some(response),
            err: None,
            is_disposed: true,
        }
    }

    pub fn failure(message: &str) -> Self {
        ReplyEnvelope {
            response: None,
            err: Some(Value::String(message.to_owned())),
            is_disposed: true,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AmqpError> {
        serde_json::from_slice(data).map_err(|e| AmqpError::ParsePayloadError(e.to_string()))
    }

    /// Converts the reply into the caller's result type.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, AmqpError> {
        if let Some(err) = self.err {
            let message = match err {
                Value::String(message) => message,
                other => other.to_string(),
            };
            return Err(AmqpError::RemoteError(message));
        }

        serde_json::from_value(self.response.unwrap_or(Value::Null))
            .map_err(|e| AmqpError::ParsePayloadError(e.to_string()))
    }
}
