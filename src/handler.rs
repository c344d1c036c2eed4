// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Application code plugs in through [`MessageHandler`]. A handler gets the
//! decoded message and returns an optional reply value; the reply is only
//! published when the message was a request.

use crate::envelope::Metadata;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{future::Future, sync::Arc};
use thiserror::Error;

/// Failure reported by a handler. The message is retried through the
/// dead-letter queue; for requests the text is also sent back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// A message delivered to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub pattern: String,
    pub data: Value,
    pub metadata: Option<Metadata>,
    /// Present when the sender waits for a reply.
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    /// Times this message was already rejected on this queue.
    pub attempts: u32,
}

impl ConsumerMessage {
    pub fn new(queue: &str, pattern: &str, data: Value) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            pattern: pattern.to_owned(),
            data,
            metadata: None,
            correlation_id: None,
            redelivered: false,
            attempts: 0,
        }
    }

    /// Deserializes the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| HandlerError::InvalidPayload(err.to_string()))
    }

    pub fn is_request(&self) -> bool {
        self.correlation_id.is_some()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage,
    ) -> Result<Option<Value>, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
{
    async fn exec(
        &self,
        _ctx: &Context,
        msg: &ConsumerMessage,
    ) -> Result<Option<Value>, HandlerError> {
        (self.0)(msg.clone()).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct FindById {
        id: String,
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|msg: ConsumerMessage| async move {
            let req: FindById = msg.payload()?;
            Ok(Some(json!({"id": req.id, "name": "Ada"})))
        });

        let msg = ConsumerMessage::new("app_users_queue", "user.findById", json!({"id": "u1"}));
        let reply = handler.exec(&Context::new(), &msg).await.unwrap();

        assert_eq!(reply, Some(json!({"id": "u1", "name": "Ada"})));
    }

    #[test]
    fn bad_payloads_are_reported() {
        let msg = ConsumerMessage::new("app_users_queue", "user.findById", json!(42));
        assert!(matches!(
            msg.payload::<FindById>(),
            Err(HandlerError::InvalidPayload(_))
        ));
        assert!(!msg.is_request());
    }
}
