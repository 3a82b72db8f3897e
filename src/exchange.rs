// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchanges
//!
//! This module provides the [`Exchange`] endpoint: a named broker-side
//! routing node with its own dedicated channel and initialization future.
//! Exchanges are declared through the connection, publish and answer RPC
//! requests, participate in bindings, and can host consumers through a
//! private companion queue.

use crate::{
    binding::{self, binding_id, Binding},
    connection::{Connection, ConnectionInner},
    consumer::{ConsumerHandler, ConsumerOptions, RawConsumerHandler},
    errors::AmqpError,
    message::{self, Content, Destination, Message},
    queue::{Queue, QueueOptions},
    ready::ReadyCell,
};
use lapin::{
    options::{ExchangeDeclareOptions, ExchangeDeleteOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error};

/// Constant for the argument naming an alternate exchange for unroutable messages
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges available on the broker.
///
/// The `Custom` variant passes any other exchange type string through
/// untouched (plugin-provided types).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
        }
    }
}

/// Configuration parameters of an exchange declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeOptions {
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub alternate_exchange: Option<String>,
    #[serde(skip, default)]
    pub arguments: FieldTable,
}

impl ExchangeOptions {
    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the declaration passive, checking for existence without creating.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the no_wait flag, making the declaration non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Routes unroutable messages to the named alternate exchange.
    pub fn alternate_exchange(mut self, name: &str) -> Self {
        self.alternate_exchange = Some(name.to_owned());
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.arguments.insert(key, value);
        self
    }
}

/// A named exchange endpoint registered on a connection.
///
/// The handle is cheap to clone; every clone refers to the same registered
/// entity and the same dedicated channel.
#[derive(Debug, Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

#[derive(Debug)]
struct ExchangeInner {
    connection: Weak<ConnectionInner>,
    name: String,
    kind: ExchangeKind,
    options: ExchangeOptions,
    channel: Mutex<Option<Channel>>,
    initialized: ReadyCell<()>,
}

impl Exchange {
    pub(crate) fn create(
        conn: &Arc<ConnectionInner>,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Exchange {
        Exchange {
            inner: Arc::new(ExchangeInner {
                connection: Arc::downgrade(conn),
                name: name.to_owned(),
                kind,
                options,
                channel: Mutex::new(None),
                initialized: ReadyCell::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.inner.kind
    }

    /// Settles once the broker has acknowledged the declaration.
    pub async fn initialized(&self) -> Result<(), AmqpError> {
        self.inner.initialized.wait().await
    }

    pub(crate) fn same_entity(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn channel(&self) -> Result<Channel, AmqpError> {
        self.inner
            .channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(AmqpError::ChannelError)
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>, AmqpError> {
        self.inner
            .connection
            .upgrade()
            .ok_or(AmqpError::ConnectionDropped)
    }

    fn handle(&self) -> Result<Connection, AmqpError> {
        Ok(Connection::from_inner(self.connection()?))
    }

    /// (Re)runs the declaration: waits for the connection, opens a fresh
    /// channel and asserts the exchange. A failed declaration removes the
    /// exchange from the registry so the name is free again.
    pub(crate) fn start_initialize(&self) {
        let inner = self.inner.clone();
        let generation = inner.initialized.reset();

        tokio::spawn(async move {
            match ExchangeInner::declare_on_broker(&inner).await {
                Ok(()) => {
                    if inner.initialized.resolve_for(generation, ()) {
                        debug!(name = inner.name, "exchange declared");
                    }
                }
                Err(err) => {
                    // A declaration superseded by a rebuild must not settle
                    // the newer attempt or free the name.
                    if inner.initialized.reject_for(generation, err.clone()) {
                        error!(
                            error = err.to_string(),
                            name = inner.name,
                            "error to declare the exchange"
                        );
                        if let Some(conn) = inner.connection.upgrade() {
                            conn.remove_exchange(&inner.name);
                        }
                    }
                }
            }
        });
    }

    /// Publishes a payload to this exchange with the given routing key.
    pub async fn publish(
        &self,
        content: impl Into<Content>,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let message = Message::new(content, BasicProperties::default())?;
        self.send(&message, routing_key).await
    }

    /// Publishes a prepared [`Message`] to this exchange.
    pub async fn send(&self, message: &Message, routing_key: &str) -> Result<(), AmqpError> {
        let connection = self.handle()?;
        message
            .send_to(
                &connection,
                &Destination::Exchange(self.inner.name.clone()),
                routing_key,
            )
            .await
    }

    /// Sends a request through this exchange and resolves with the reply
    /// delivered over the broker's direct reply-to pseudo-queue.
    pub async fn rpc(
        &self,
        content: impl Into<Content>,
        routing_key: &str,
    ) -> Result<Message, AmqpError> {
        let conn = self.connection()?;
        let message = Message::new(content, BasicProperties::default())?;
        message::rpc_request(
            &conn,
            &Destination::Exchange(self.inner.name.clone()),
            routing_key,
            message,
        )
        .await
    }

    /// Binds this exchange (as destination) to a source exchange.
    pub fn bind(
        &self,
        source: &Exchange,
        pattern: &str,
        arguments: FieldTable,
    ) -> Result<Binding, AmqpError> {
        let conn = self.connection()?;
        Ok(Binding::declare(
            &conn,
            source.name(),
            Destination::Exchange(self.inner.name.clone()),
            pattern,
            arguments,
        ))
    }

    /// Removes the binding from `source` with the given pattern.
    pub async fn unbind(&self, source: &Exchange, pattern: &str) -> Result<(), AmqpError> {
        let conn = self.connection()?;
        let id = binding_id(
            source.name(),
            &Destination::Exchange(self.inner.name.clone()),
            pattern,
        );
        let binding = conn
            .binding(&id)
            .ok_or(AmqpError::UnknownBinding(id))?;
        binding.delete().await
    }

    /// Deletes the exchange on the broker, dropping its bindings first, and
    /// removes it from the registry.
    pub async fn delete(&self) -> Result<(), AmqpError> {
        self.teardown(true).await
    }

    /// Releases the exchange locally (bindings and channel) without deleting
    /// it on the broker.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.teardown(false).await
    }

    async fn teardown(&self, delete_on_broker: bool) -> Result<(), AmqpError> {
        self.inner.initialized.wait().await?;
        let conn = self.connection()?;

        binding::remove_bindings_containing(
            &conn,
            &Destination::Exchange(self.inner.name.clone()),
        )
        .await?;

        let channel = self.inner.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            if delete_on_broker {
                channel
                    .exchange_delete(&self.inner.name, ExchangeDeleteOptions::default())
                    .await
                    .map_err(|_| AmqpError::DeleteError(self.inner.name.clone()))?;
            }
            if let Err(err) = channel.close(200, "client shutdown").await {
                debug!(
                    error = err.to_string(),
                    name = self.inner.name,
                    "channel already closed"
                );
            }
        }

        conn.remove_exchange(&self.inner.name);
        Ok(())
    }

    /// Name of the private queue backing consumers on this exchange, derived
    /// from the application name, hostname and pid.
    pub fn consumer_queue_name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.inner.name,
            application_name(),
            host_name(),
            std::process::id()
        )
    }

    /// Registers a consumer on this exchange through a private, auto-deleted
    /// companion queue bound to it. The handler acks through the [`Message`].
    pub fn activate_consumer(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumerOptions,
    ) -> Result<Queue, AmqpError> {
        let queue = self.consumer_queue()?;
        queue.activate_consumer(handler, options)?;
        Ok(queue)
    }

    /// Registers a consumer on the companion queue that is acked by the
    /// facade after every delivery.
    pub fn start_consumer(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumerOptions,
    ) -> Result<Queue, AmqpError> {
        let queue = self.consumer_queue()?;
        queue.start_consumer(handler, options)?;
        Ok(queue)
    }

    /// Registers a raw-delivery consumer on the companion queue.
    pub fn start_raw_consumer(
        &self,
        handler: Arc<dyn RawConsumerHandler>,
        options: ConsumerOptions,
    ) -> Result<Queue, AmqpError> {
        let queue = self.consumer_queue()?;
        queue.start_raw_consumer(handler, options)?;
        Ok(queue)
    }

    /// Stops the consumer running on the companion queue.
    pub async fn stop_consumer(&self) -> Result<(), AmqpError> {
        let conn = self.connection()?;
        let queue = conn
            .queue(&self.consumer_queue_name())
            .ok_or(AmqpError::NoConsumerDefined)?;
        queue.stop_consumer().await
    }

    fn consumer_queue(&self) -> Result<Queue, AmqpError> {
        let connection = self.handle()?;
        let queue =
            connection.declare_queue(&self.consumer_queue_name(), QueueOptions::default().auto_delete());
        queue.bind(self, "", FieldTable::default())?;
        Ok(queue)
    }
}

impl ExchangeInner {
    async fn declare_on_broker(inner: &Arc<ExchangeInner>) -> Result<(), AmqpError> {
        let conn = inner
            .connection
            .upgrade()
            .ok_or(AmqpError::ConnectionDropped)?;
        conn.initialized().await?;

        let link = conn.link()?;
        let channel = link
            .create_channel()
            .await
            .map_err(|_| AmqpError::ChannelError)?;

        let mut arguments = inner.options.arguments.clone();
        if let Some(alternate) = &inner.options.alternate_exchange {
            arguments.insert(
                ShortString::from(AMQP_HEADERS_ALTERNATE_EXCHANGE),
                AMQPValue::LongString(LongString::from(alternate.clone())),
            );
        }

        channel
            .exchange_declare(
                &inner.name,
                (&inner.kind).into(),
                ExchangeDeclareOptions {
                    passive: inner.options.passive,
                    durable: inner.options.durable,
                    auto_delete: inner.options.auto_delete,
                    internal: inner.options.internal,
                    nowait: inner.options.no_wait,
                },
                arguments,
            )
            .await
            .map_err(|_| AmqpError::DeclareExchangeError(inner.name.clone()))?;

        *inner.channel.lock().unwrap() = Some(channel);
        Ok(())
    }
}

fn application_name() -> String {
    std::env::var("APPLICATIONNAME")
        .ok()
        .or_else(|| {
            std::env::current_exe().ok().and_then(|path| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
        })
        .unwrap_or_else(|| "rust".to_owned())
}

fn host_name() -> String {
    hostname::get()
        .map(|host| host.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_converts_to_the_library_kind() {
        assert!(matches!(
            lapin::ExchangeKind::from(&ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        ));

        match lapin::ExchangeKind::from(&ExchangeKind::Custom("x-delayed-message".to_owned())) {
            lapin::ExchangeKind::Custom(name) => assert_eq!(name, "x-delayed-message"),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn consumer_queue_name_carries_exchange_and_pid() {
        let exchange = Exchange {
            inner: Arc::new(ExchangeInner {
                connection: Weak::new(),
                name: "events".to_owned(),
                kind: ExchangeKind::Fanout,
                options: ExchangeOptions::default(),
                channel: Mutex::new(None),
                initialized: ReadyCell::new(),
            }),
        };

        let name = exchange.consumer_queue_name();
        assert!(name.starts_with("events."));
        assert!(name.ends_with(&format!(".{}", std::process::id())));
    }
}
