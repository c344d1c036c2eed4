// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living inside the process, implementing the subset of AMQP
//! semantics the routing layer depends on:
//!
//! - idempotent exchange/queue assertion, with mismatching re-declarations rejected;
//! - direct, fanout and topic routing, plus the default exchange;
//! - server-named exclusive queues, removed with their connection;
//! - round-robin delivery to consumers, manual or automatic acknowledgement;
//! - unacknowledged deliveries requeued when their connection goes away;
//! - dead-lettering on reject and on `x-message-ttl` expiry, with `x-death` accounting.
//!
//! Fault injection hooks simulate a broker dropping every connection, refusing
//! connections or applying publish back-pressure. Prefetch is recorded but not
//! enforced.

use crate::{
    broker::{
        Acknowledger, BrokerChannel, BrokerConnector, ConsumeOptions, Delivery, DeliveryStream,
        FailureHook, PublishStatus, Publishing,
    },
    consumer::{AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    routing::topic_matches,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

type Shared = Arc<Mutex<BrokerState>>;
type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    properties: BasicProperties,
    redelivered: bool,
}

struct ConsumerRecord {
    connection: u64,
    no_ack: bool,
    tx: DeliverySender,
}

struct QueueRecord {
    def: QueueDefinition,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerRecord>,
    next_consumer: usize,
}

struct ConnectionRecord {
    open: bool,
    hooks: Vec<FailureHook>,
    prefetch: Option<u16>,
}

struct Unacked {
    connection: u64,
    queue: String,
    message: StoredMessage,
}

struct BrokerState {
    this: Weak<Mutex<BrokerState>>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueRecord>,
    bindings: BTreeSet<QueueBinding>,
    connections: HashMap<u64, ConnectionRecord>,
    unacked: BTreeMap<u64, Unacked>,
    next_id: u64,
    back_pressure: usize,
    failing_connects: usize,
    failing_channels: usize,
    connects: usize,
    published: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, connection: u64) -> Result<(), AmqpError> {
        match self.connections.get(&connection) {
            Some(record) if record.open => Ok(()),
            _ => Err(AmqpError::ChannelClosed),
        }
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<(), AmqpError> {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            }
        } else {
            let Some(def) = self.exchanges.get(exchange) else {
                return Err(AmqpError::PublishingError(format!(
                    "no exchange `{exchange}`"
                )));
            };
            let kind = def.exchange_kind();

            let mut queues: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| b.exchange_name == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    ExchangeKind::Direct | ExchangeKind::Headers => b.routing_key == routing_key,
                })
                .map(|b| b.queue_name.clone())
                .collect();
            queues.dedup();
            queues
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }

        for queue in targets {
            self.enqueue(&queue, message.clone());
        }

        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        let weak = self.this.clone();
        let tag = self.next_id();

        let Some(record) = self.queues.get_mut(queue) else {
            return;
        };

        while !record.consumers.is_empty() {
            let idx = record.next_consumer % record.consumers.len();
            record.next_consumer = idx + 1;

            let consumer = &record.consumers[idx];
            let acker: Arc<dyn Acknowledger> = if consumer.no_ack {
                Arc::new(AutoAcker)
            } else {
                Arc::new(MemoryAcker {
                    state: weak.clone(),
                    tag,
                })
            };

            let mut delivery = Delivery::new(
                queue,
                &message.exchange,
                &message.routing_key,
                message.data.clone(),
                message.properties.clone(),
                acker,
            );
            delivery.redelivered = message.redelivered;

            if consumer.tx.send(Ok(delivery)).is_ok() {
                if !consumer.no_ack {
                    let connection = consumer.connection;
                    self.unacked.insert(
                        tag,
                        Unacked {
                            connection,
                            queue: queue.to_owned(),
                            message,
                        },
                    );
                }
                return;
            }

            record.consumers.remove(idx);
        }

        if let Some(ttl) = record.def.message_ttl() {
            schedule_expiry(weak, queue.to_owned(), message.id, ttl);
        }

        record.ready.push_back(message);
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage, reason: &str) {
        let Some(record) = self.queues.get(queue) else {
            return;
        };

        let Some(exchange) = record.def.dead_letter_exchange() else {
            debug!(queue, reason, "message dropped, no dead-letter exchange");
            return;
        };
        let routing_key = record
            .def
            .dead_letter_routing_key()
            .unwrap_or_else(|| message.routing_key.clone());

        let properties = record_death(&message, queue, reason);
        let id = self.next_id();

        let dead = StoredMessage {
            id,
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            data: message.data,
            properties,
            redelivered: false,
        };

        if let Err(err) = self.route(&exchange, &routing_key, dead) {
            debug!(error = err.to_string(), queue, "dead-lettering failed");
        }
    }

    fn expire(&mut self, queue: &str, id: u64) {
        let Some(record) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = record.ready.iter().position(|m| m.id == id) else {
            return;
        };

        if let Some(message) = record.ready.remove(pos) {
            self.dead_letter(queue, message, "expired");
        }
    }

    fn dispatch_ready(&mut self, queue: &str) {
        let pending: Vec<StoredMessage> = match self.queues.get_mut(queue) {
            Some(record) => record.ready.drain(..).collect(),
            None => return,
        };

        for message in pending {
            self.enqueue(queue, message);
        }
    }

    /// Closes `connection`, returning the failure hooks to fire.
    fn drop_connection(&mut self, connection: u64) -> Vec<FailureHook> {
        let hooks = match self.connections.get_mut(&connection) {
            Some(record) if record.open => {
                record.open = false;
                std::mem::take(&mut record.hooks)
            }
            _ => return vec![],
        };

        for record in self.queues.values_mut() {
            record.consumers.retain(|c| c.connection != connection);
        }
        self.queues.retain(|_, q| q.owner != Some(connection));

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                self.enqueue(&unacked.queue, unacked.message);
            }
        }

        hooks
    }
}

fn schedule_expiry(state: Weak<Mutex<BrokerState>>, queue: String, id: u64, ttl: u32) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    handle.spawn(async move {
        tokio::time::sleep(Duration::from_millis(ttl as u64)).await;
        if let Some(state) = state.upgrade() {
            lock(&state).expire(&queue, id);
        }
    });
}

/// Prepends or bumps the `x-death` entry for (`queue`, `reason`).
fn record_death(message: &StoredMessage, queue: &str, reason: &str) -> BasicProperties {
    let mut headers = message
        .properties
        .headers()
        .as_ref()
        .map(|t| t.inner().clone())
        .unwrap_or_default();

    let mut entries: Vec<AMQPValue> = match headers.get(AMQP_HEADERS_X_DEATH) {
        Some(AMQPValue::FieldArray(arr)) => arr.as_slice().to_vec(),
        _ => vec![],
    };

    let position = entries.iter().position(|entry| match entry {
        AMQPValue::FieldTable(table) => {
            text_field(table, "queue").as_deref() == Some(queue)
                && text_field(table, "reason").as_deref() == Some(reason)
        }
        _ => false,
    });

    let count: LongLongInt = match position {
        Some(pos) => match entries.remove(pos) {
            AMQPValue::FieldTable(table) => match table.inner().get(AMQP_HEADERS_COUNT) {
                Some(AMQPValue::LongLongInt(count)) => *count + 1,
                _ => 1,
            },
            _ => 1,
        },
        None => 1,
    };

    let mut entry = FieldTable::default();
    entry.insert(ShortString::from(AMQP_HEADERS_COUNT), AMQPValue::LongLongInt(count));
    entry.insert(
        ShortString::from("queue"),
        AMQPValue::LongString(LongString::from(queue)),
    );
    entry.insert(
        ShortString::from("reason"),
        AMQPValue::LongString(LongString::from(reason)),
    );
    entry.insert(
        ShortString::from("exchange"),
        AMQPValue::LongString(LongString::from(message.exchange.as_str())),
    );
    entry.insert(
        ShortString::from("routing-keys"),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
            LongString::from(message.routing_key.as_str()),
        )])),
    );
    entries.insert(0, AMQPValue::FieldTable(entry));

    headers.insert(
        ShortString::from(AMQP_HEADERS_X_DEATH),
        AMQPValue::FieldArray(FieldArray::from(entries)),
    );

    message
        .properties
        .clone()
        .with_headers(FieldTable::from(headers))
}

fn text_field(table: &FieldTable, key: &str) -> Option<String> {
    match table.inner().get(key) {
        Some(AMQPValue::LongString(value)) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        Some(AMQPValue::ShortString(value)) => Some(value.as_str().to_owned()),
        _ => None,
    }
}

struct AutoAcker;

#[async_trait]
impl Acknowledger for AutoAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let state = self.state.upgrade().ok_or(AmqpError::AckMessageError)?;
        let mut state = lock(&state);

        match state.unacked.remove(&self.tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError),
        }
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let state = self.state.upgrade().ok_or(AmqpError::NackMessageError)?;
        let mut state = lock(&state);

        let Some(unacked) = state.unacked.remove(&self.tag) else {
            return Err(AmqpError::NackMessageError);
        };

        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            state.enqueue(&unacked.queue, message);
        } else {
            state.dead_letter(&unacked.queue, unacked.message, "rejected");
        }

        Ok(())
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Shared,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|this| {
            Mutex::new(BrokerState {
                this: this.clone(),
                exchanges: HashMap::default(),
                queues: HashMap::default(),
                bindings: BTreeSet::default(),
                connections: HashMap::default(),
                unacked: BTreeMap::default(),
                next_id: 0,
                back_pressure: 0,
                failing_connects: 0,
                failing_channels: 0,
                connects: 0,
                published: 0,
            })
        });

        MemoryBroker { state }
    }

    fn open_channel(&self) -> Result<Arc<MemoryChannel>, AmqpError> {
        let mut state = lock(&self.state);

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let id = state.next_id();
        state.connects += 1;
        state.connections.insert(
            id,
            ConnectionRecord {
                open: true,
                hooks: vec![],
                prefetch: None,
            },
        );

        if state.failing_channels > 0 {
            state.failing_channels -= 1;
            // the connection is released before reporting the failure
            state.drop_connection(id);
            return Err(AmqpError::ChannelError("channel setup refused".to_owned()));
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            connection: id,
        }))
    }

    /// Drops every open connection as a broker restart would, firing the
    /// failure hooks registered on them.
    pub fn disconnect_all(&self) {
        let hooks: Vec<FailureHook> = {
            let mut state = lock(&self.state);
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();

            open.into_iter()
                .flat_map(|id| state.drop_connection(id))
                .collect()
        };

        let err = AmqpError::ConnectionError("connection reset by broker".to_owned());
        for hook in hooks {
            hook(&err);
        }
    }

    /// The next `count` publishes report back-pressure.
    pub fn apply_back_pressure(&self, count: usize) {
        lock(&self.state).back_pressure = count;
    }

    /// The next `count` connection attempts are refused.
    pub fn refuse_connections(&self, count: usize) {
        lock(&self.state).failing_connects = count;
    }

    /// The next `count` connections are accepted but fail to open a channel.
    pub fn refuse_channels(&self, count: usize) {
        lock(&self.state).failing_channels = count;
    }

    /// Connections opened so far.
    pub fn connection_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state)
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    /// Messages accepted by publish so far.
    pub fn published_count(&self) -> usize {
        lock(&self.state).published
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        lock(&self.state).bindings.iter().cloned().collect()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        lock(&self.state).exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        lock(&self.state).queues.get(name).map(|q| q.def.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue` without a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        lock(&self.state).unacked.len()
    }

    /// Removes and returns the oldest waiting message of `queue`.
    pub fn get(&self, queue: &str) -> Option<(Vec<u8>, BasicProperties)> {
        lock(&self.state)
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
            .map(|m| (m.data, m.properties))
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel: Arc<dyn BrokerChannel> = self.open_channel()?;
        debug!(connection_name, "memory broker connection opened");
        Ok(channel)
    }
}

/// A connection/channel pair on a [`MemoryBroker`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
}

impl MemoryChannel {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.broker.state)
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state()
            .connections
            .get(&self.connection)
            .and_then(|c| c.prefetch)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open(self.connection)?;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing == def => Ok(()),
            Some(_) => Err(AmqpError::TopologyMismatch(format!(
                "exchange `{}` exists with different parameters",
                def.name
            ))),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.state();
        state.ensure_open(self.connection)?;

        let mut def = def.clone();
        if def.name.is_empty() {
            def.name = format!("amq.gen-{}", Uuid::new_v4());
        }

        if let Some(existing) = state.queues.get(&def.name) {
            if existing.owner.is_some() && existing.owner != Some(self.connection) {
                return Err(AmqpError::DeclareQueueError(def.name));
            }
            if existing.def != def {
                return Err(AmqpError::TopologyMismatch(format!(
                    "queue `{}` exists with different arguments",
                    def.name
                )));
            }
            return Ok(def.name);
        }

        let name = def.name.clone();
        let owner = def.exclusive.then_some(self.connection);
        state.queues.insert(
            name.clone(),
            QueueRecord {
                def,
                owner,
                ready: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
            },
        );

        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open(self.connection)?;

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> Result<PublishStatus, AmqpError> {
        let mut state = self.state();
        state.ensure_open(self.connection)?;

        if state.back_pressure > 0 {
            state.back_pressure -= 1;
            return Ok(PublishStatus::BackPressure);
        }

        let id = state.next_id();
        let message = StoredMessage {
            id,
            exchange: publishing.exchange.clone(),
            routing_key: publishing.routing_key.clone(),
            data: publishing.payload,
            properties: publishing.properties,
            redelivered: false,
        };

        state.route(&publishing.exchange, &publishing.routing_key, message)?;
        state.published += 1;

        Ok(PublishStatus::Confirmed)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open(self.connection)?;

        if let Some(record) = state.connections.get_mut(&self.connection) {
            record.prefetch = Some(prefetch);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.state();
            state.ensure_open(self.connection)?;

            let Some(record) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };

            record.consumers.push(ConsumerRecord {
                connection: self.connection,
                no_ack: options.no_ack,
                tx,
            });
            state.dispatch_ready(queue);
        }

        debug!(queue, tag = options.consumer_tag, "memory consumer started");

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    fn on_failure(&self, hook: FailureHook) {
        if let Some(record) = self.state().connections.get_mut(&self.connection) {
            record.hooks.push(hook);
        }
    }

    fn is_open(&self) -> bool {
        self.state().ensure_open(self.connection).is_ok()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        // a graceful close does not fire failure hooks
        let _ = self.state().drop_connection(self.connection);
        Ok(())
    }
}
