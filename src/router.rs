// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outbound Router
//!
//! Entry point for producers. A pattern such as `user.findById` is resolved
//! through the routing table to the owning service queue, then either
//! emitted to the shared exchange (fire-and-forget) or sent as a request
//! through the client handle of that queue.
//!
//! The router does not retry. Back-pressure handling lives in the publisher,
//! and a client handle whose connection was lost is evicted so the next send
//! builds a fresh one. Failures scoped to one call, such as a reply that does
//! not decode, leave the handle and its other in-flight requests untouched.

use crate::{
    broker::BrokerConnector,
    client::RpcClient,
    config::RabbitMQConfigs,
    descriptor::TopologyDescriptor,
    envelope::{MessageEnvelope, Metadata},
    errors::AmqpError,
    publisher::ChannelPublisher,
    routing::{Route, RoutingTable},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};
use uuid::Uuid;

type ClientCell = Arc<OnceCell<Arc<RpcClient>>>;
type Clients = HashMap<String, ClientCell>;

fn lock(clients: &Mutex<Clients>) -> MutexGuard<'_, Clients> {
    match clients.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct MessageRouter {
    table: RoutingTable,
    descriptor: TopologyDescriptor,
    publisher: Arc<ChannelPublisher>,
    connector: Arc<dyn BrokerConnector>,
    cfg: RabbitMQConfigs,
    clients: Mutex<Clients>,
}

impl MessageRouter {
    pub fn new(
        table: RoutingTable,
        descriptor: TopologyDescriptor,
        publisher: Arc<ChannelPublisher>,
        connector: Arc<dyn BrokerConnector>,
        cfg: RabbitMQConfigs,
    ) -> Self {
        MessageRouter {
            table,
            descriptor,
            publisher,
            connector,
            cfg,
            clients: Mutex::new(HashMap::default()),
        }
    }

    /// Resolves the destination of `pattern`.
    pub fn route(&self, pattern: &str) -> Result<Route, AmqpError> {
        self.table.resolve(&self.descriptor, pattern)
    }

    /// Publishes an event. Failures are logged, never returned.
    pub async fn emit<T: Serialize>(&self, pattern: &str, payload: &T) {
        if let Err(err) = self.try_emit(pattern, payload).await {
            error!(error = err.to_string(), pattern, "failure to emit event");
        }
    }

    /// Publishes an event to the shared exchange with routing key = `pattern`.
    pub async fn try_emit<T: Serialize>(&self, pattern: &str, payload: &T) -> Result<(), AmqpError> {
        let route = self.route(pattern)?;

        let envelope = MessageEnvelope::new(pattern, payload)?
            .with_metadata(Metadata::new(&Uuid::new_v4().to_string(), &self.cfg.app_name));

        self.publisher
            .publish(self.descriptor.exchange_name(), pattern, &envelope)
            .await?;

        debug!(pattern, service = %route.service, "event emitted");
        Ok(())
    }

    /// Sends a request and waits for the reply with the configured timeout.
    pub async fn send<T, R>(&self, pattern: &str, payload: &T) -> Result<R, AmqpError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.send_with_timeout(pattern, payload, self.cfg.request_timeout())
            .await
    }

    pub async fn send_with_timeout<T, R>(
        &self,
        pattern: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, AmqpError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let route = self.route(pattern)?;
        let client = self.client(&route.queue).await?;

        match client.send(pattern, payload, timeout).await {
            Err(err) if err.is_connection_loss() || !client.is_open() => {
                warn!(error = err.to_string(), queue = %route.queue, "evicting client handle");
                self.evict(&route.queue, &client);
                Err(err)
            }
            result => result,
        }
    }

    /// Client handles currently cached.
    pub fn client_count(&self) -> usize {
        lock(&self.clients)
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Requests waiting for a reply, across every client handle.
    pub fn pending_count(&self) -> usize {
        lock(&self.clients)
            .values()
            .filter_map(|cell| cell.get())
            .map(|client| client.pending_count())
            .sum()
    }

    /// Closes every cached client handle.
    pub async fn shutdown(&self) {
        let cells: Vec<ClientCell> = lock(&self.clients).drain().map(|(_, cell)| cell).collect();

        for client in cells.iter().filter_map(|cell| cell.get()) {
            if let Err(err) = client.close().await {
                warn!(error = err.to_string(), queue = client.destination(), "failure to close client");
            }
        }
    }

    async fn client(&self, queue: &str) -> Result<Arc<RpcClient>, AmqpError> {
        for _ in 0..2 {
            let cell = lock(&self.clients).entry(queue.to_owned()).or_default().clone();

            let client = cell
                .get_or_try_init(|| RpcClient::connect(self.connector.clone(), queue, &self.cfg))
                .await?
                .clone();

            if client.is_open() {
                return Ok(client);
            }

            self.evict(queue, &client);
        }

        Err(AmqpError::ChannelClosed)
    }

    fn evict(&self, queue: &str, client: &Arc<RpcClient>) {
        let mut clients = lock(&self.clients);

        let current = clients
            .get(queue)
            .and_then(|cell| cell.get())
            .is_some_and(|cached| Arc::ptr_eq(cached, client));
        if !current {
            return;
        }

        clients.remove(queue);
        drop(clients);

        let client = client.clone();
        tokio::spawn(async move {
            let _ = client.close().await;
        });
    }
}
