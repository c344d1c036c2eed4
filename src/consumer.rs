// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Processing of a single delivery: decode the envelope, find the handler
//! registered for its pattern, run it, publish the reply of a request and
//! settle the delivery with the broker.
//!
//! A failing handler never acks. The delivery is rejected without requeue, so
//! the broker parks it in the service's retry queue and brings it back after
//! the queue TTL. With a retry limit configured, a message that already used
//! up its retries is acknowledged and dropped instead.

use crate::{
    broker::{BrokerChannel, Delivery, PublishStatus, Publishing},
    consumer_topology::ConsumerTopology,
    envelope::{MessageEnvelope, ReplyEnvelope},
    errors::AmqpError,
    handler::{ConsumerMessage, MessageHandler},
    otel,
    publisher::message_properties,
};
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

const DEATH_REASON_REJECTED: &str = "rejected";

pub(crate) type HandlerTable = HashMap<String, Arc<dyn MessageHandler>>;

/// Processes one delivery and settles it.
///
/// Only failures to settle the delivery are returned; handler failures are
/// turned into a reject.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handlers: &HandlerTable,
    topology: &ConsumerTopology,
    channel: &dyn BrokerChannel,
    source: &str,
) -> Result<(), AmqpError> {
    let envelope = match MessageEnvelope::from_bytes(&delivery.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue = %delivery.queue,
                "removing message from queue - reason: undecodable payload"
            );
            return delivery.ack().await;
        }
    };

    let pattern = envelope.pattern().to_owned();
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &pattern);

    debug!("received: {} - exchange: {}", pattern, delivery.exchange);

    let reply_to = reply_address(&delivery.properties);

    let Some(handler) = handlers.get(&pattern) else {
        let msg = "removing message from queue - reason: unsupported pattern";
        span.record_error(&AmqpError::ConsumerError(msg.to_owned()));
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        debug!(pattern = %pattern, "{}", msg);

        if let Some((reply_to, correlation_id)) = &reply_to {
            let reply = ReplyEnvelope::failure(&format!("no handler for `{pattern}`"));
            send_reply(channel, &pattern, reply_to, correlation_id, &reply, source).await;
        }

        return settle_ack(delivery, &mut span).await;
    };

    let attempts = death_count(&delivery.properties, &delivery.queue);

    let msg = ConsumerMessage {
        queue: delivery.queue.clone(),
        pattern: pattern.clone(),
        data: envelope.data().clone(),
        metadata: envelope.metadata().cloned(),
        correlation_id: reply_to.as_ref().map(|(_, id)| id.clone()),
        redelivered: delivery.redelivered,
        attempts,
    };

    match handler.exec(&ctx, &msg).await {
        Ok(response) => {
            debug!("message successfully processed");

            if let Some((reply_to, correlation_id)) = &reply_to {
                let reply = ReplyEnvelope::success(response.unwrap_or(Value::Null));
                send_reply(channel, &pattern, reply_to, correlation_id, &reply, source).await;
            }

            let result = settle_ack(delivery, &mut span).await;
            if result.is_ok() {
                span.set_status(Status::Ok);
            }
            result
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });

            if let Some((reply_to, correlation_id)) = &reply_to {
                let reply = ReplyEnvelope::failure(&err.to_string());
                send_reply(channel, &pattern, reply_to, correlation_id, &reply, source).await;
            }

            if topology.retry_limit().is_some_and(|limit| attempts >= limit) {
                error!(
                    error = err.to_string(),
                    pattern = %pattern,
                    attempts,
                    "too many attempts, dropping message"
                );
                return settle_ack(delivery, &mut span).await;
            }

            warn!(
                error = err.to_string(),
                pattern = %pattern,
                attempts,
                "error whiling handling msg, requeuing for latter"
            );

            delivery.reject(false).await.map_err(|e| {
                error!("error whiling requeuing");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to requeuing msg"),
                });
                e
            })
        }
    }
}

async fn settle_ack<S: Span>(delivery: &Delivery, span: &mut S) -> Result<(), AmqpError> {
    delivery.ack().await.map_err(|e| {
        error!("error whiling ack msg");
        span.record_error(&e);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
        e
    })
}

async fn send_reply(
    channel: &dyn BrokerChannel,
    pattern: &str,
    reply_to: &str,
    correlation_id: &str,
    reply: &ReplyEnvelope,
    source: &str,
) {
    let payload = match reply.to_bytes() {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = err.to_string(), "failure to encode reply");
            return;
        }
    };

    let publishing = Publishing {
        exchange: String::new(),
        routing_key: reply_to.to_owned(),
        payload,
        properties: message_properties(pattern, source)
            .with_correlation_id(ShortString::from(correlation_id)),
    };

    match channel.publish(publishing).await {
        Ok(PublishStatus::Confirmed) => debug!(correlation_id, "reply sent"),
        Ok(PublishStatus::BackPressure) => {
            warn!(correlation_id, "reply refused by broker back-pressure")
        }
        Err(err) => error!(error = err.to_string(), correlation_id, "failure to send reply"),
    }
}

/// `reply_to` and `correlation_id` of a request, `None` for events.
fn reply_address(props: &AMQPProperties) -> Option<(String, String)> {
    let reply_to = props.reply_to().as_ref()?;
    let correlation_id = props.correlation_id().as_ref()?;

    if reply_to.as_str().is_empty() {
        return None;
    }

    Some((reply_to.to_string(), correlation_id.to_string()))
}

/// Number of times the message was rejected from `queue`, read from the
/// broker's `x-death` header.
pub(crate) fn death_count(props: &AMQPProperties, queue: &str) -> u32 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
        return 0;
    };

    deaths
        .as_slice()
        .iter()
        .filter_map(|entry| entry.as_field_table())
        .filter(|entry| {
            text(entry, "queue").as_deref() == Some(queue)
                && text(entry, "reason").as_deref() == Some(DEATH_REASON_REJECTED)
        })
        .filter_map(|entry| match entry.inner().get(AMQP_HEADERS_COUNT) {
            Some(AMQPValue::LongLongInt(count)) => u32::try_from(*count).ok(),
            Some(AMQPValue::LongInt(count)) => u32::try_from(*count).ok(),
            Some(AMQPValue::LongUInt(count)) => Some(*count),
            _ => None,
        })
        .sum()
}

fn text(table: &FieldTable, key: &str) -> Option<String> {
    match table.inner().get(key) {
        Some(AMQPValue::LongString(value)) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        Some(AMQPValue::ShortString(value)) => Some(value.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Acknowledger, MockBrokerChannel},
        config::RabbitMQConfigs,
        descriptor::TopologyDescriptor,
        handler::{handler_fn, HandlerError, MockMessageHandler},
        routing::ServiceDefinition,
    };
    use async_trait::async_trait;
    use lapin::{
        types::{FieldArray, LongLongInt, LongString},
        BasicProperties,
    };
    use opentelemetry::global;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAcker(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.0.lock().unwrap().push("ack");
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
            self.0
                .lock()
                .unwrap()
                .push(if requeue { "requeue" } else { "reject" });
            Ok(())
        }
    }

    fn topology(max_retries: Option<u32>) -> ConsumerTopology {
        ConsumerTopology::for_service(
            &TopologyDescriptor::new("app", "services"),
            &ServiceDefinition::with_keys("users", &["user"]),
            &RabbitMQConfigs::default(),
        )
        .max_retries(max_retries)
    }

    fn delivery(body: &[u8], props: BasicProperties) -> (Delivery, Arc<RecordingAcker>) {
        let acker = Arc::new(RecordingAcker::default());
        let delivery = Delivery::new(
            "app_users_queue",
            "services",
            "user.findById",
            body.to_vec(),
            props,
            acker.clone(),
        );
        (delivery, acker)
    }

    fn request(pattern: &str) -> Vec<u8> {
        MessageEnvelope::new(pattern, &json!({"id": "u1"}))
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    fn x_death(queue: &str, reason: &str, count: i64) -> BasicProperties {
        let mut entry = FieldTable::default();
        entry.insert("queue".into(), AMQPValue::LongString(LongString::from(queue)));
        entry.insert("reason".into(), AMQPValue::LongString(LongString::from(reason)));
        entry.insert(
            AMQP_HEADERS_COUNT.into(),
            AMQPValue::LongLongInt(count as LongLongInt),
        );

        let mut headers = FieldTable::default();
        headers.insert(
            AMQP_HEADERS_X_DEATH.into(),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(entry)])),
        );
        BasicProperties::default().with_headers(headers)
    }

    fn failing() -> HandlerTable {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(HandlerError::failed("db down")));

        let mut handlers = HandlerTable::new();
        handlers.insert("user.findById".to_owned(), Arc::new(handler));
        handlers
    }

    #[tokio::test]
    async fn acks_and_replies_on_success() {
        let mut handlers = HandlerTable::new();
        handlers.insert(
            "user.findById".to_owned(),
            handler_fn(|msg: ConsumerMessage| async move {
                assert!(msg.is_request());
                Ok(Some(json!({"id": "u1", "name": "Ada"})))
            }),
        );

        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().times(1).returning(|publishing| {
            assert_eq!(publishing.exchange, "");
            assert_eq!(publishing.routing_key, "amq.gen-reply");
            assert_eq!(
                publishing.properties.correlation_id().as_ref().map(|c| c.as_str()),
                Some("c-1")
            );
            let reply = ReplyEnvelope::from_bytes(&publishing.payload).unwrap();
            assert_eq!(reply.response, Some(json!({"id": "u1", "name": "Ada"})));
            Ok(PublishStatus::Confirmed)
        });

        let props = BasicProperties::default()
            .with_reply_to("amq.gen-reply".into())
            .with_correlation_id("c-1".into());
        let (delivery, acker) = delivery(&request("user.findById"), props);

        consume(
            &global::tracer("test"),
            &delivery,
            &handlers,
            &topology(None),
            &channel,
            "users-api",
        )
        .await
        .unwrap();

        assert_eq!(*acker.0.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn rejects_failed_events_for_retry() {
        let channel = MockBrokerChannel::new();
        let (delivery, acker) = delivery(&request("user.findById"), BasicProperties::default());

        consume(
            &global::tracer("test"),
            &delivery,
            &failing(),
            &topology(None),
            &channel,
            "users-api",
        )
        .await
        .unwrap();

        assert_eq!(*acker.0.lock().unwrap(), vec!["reject"]);
    }

    #[tokio::test]
    async fn drops_after_the_retry_limit() {
        let channel = MockBrokerChannel::new();
        let props = x_death("app_users_queue", "rejected", 2);
        let (delivery, acker) = delivery(&request("user.findById"), props);

        consume(
            &global::tracer("test"),
            &delivery,
            &failing(),
            &topology(Some(2)),
            &channel,
            "users-api",
        )
        .await
        .unwrap();

        assert_eq!(*acker.0.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn drops_undecodable_and_unknown_messages() {
        let channel = MockBrokerChannel::new();
        let handlers = failing();

        for body in [b"{broken".to_vec(), request("user.deleted")] {
            let (delivery, acker) = delivery(&body, BasicProperties::default());
            consume(
                &global::tracer("test"),
                &delivery,
                &handlers,
                &topology(None),
                &channel,
                "users-api",
            )
            .await
            .unwrap();

            assert_eq!(*acker.0.lock().unwrap(), vec!["ack"]);
        }
    }

    #[tokio::test]
    async fn answers_requests_without_handler_with_an_error() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().times(1).returning(|publishing| {
            assert_eq!(publishing.routing_key, "amq.gen-reply");
            let reply = ReplyEnvelope::from_bytes(&publishing.payload).unwrap();
            assert_eq!(reply.err, Some(json!("no handler for `user.deleteAll`")));
            Ok(PublishStatus::Confirmed)
        });

        let props = BasicProperties::default()
            .with_reply_to("amq.gen-reply".into())
            .with_correlation_id("c-2".into());
        let (delivery, acker) = delivery(&request("user.deleteAll"), props);

        consume(
            &global::tracer("test"),
            &delivery,
            &failing(),
            &topology(None),
            &channel,
            "users-api",
        )
        .await
        .unwrap();

        assert_eq!(*acker.0.lock().unwrap(), vec!["ack"]);
    }

    #[test]
    fn counts_only_rejections_from_the_queue() {
        assert_eq!(death_count(&x_death("app_users_queue", "rejected", 3), "app_users_queue"), 3);
        assert_eq!(death_count(&x_death("app_users_dlx", "expired", 3), "app_users_queue"), 0);
        assert_eq!(death_count(&BasicProperties::default(), "app_users_queue"), 0);
    }
}
