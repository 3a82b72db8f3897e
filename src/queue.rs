// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! This module provides the [`Queue`] endpoint: a named broker-side buffer
//! with its own dedicated channel, initialization future and consumer state
//! machine. A queue can hold at most one registered consumer at a time; the
//! stored handler and options survive connection rebuilds, after which the
//! subscription is re-established with a fresh consumer tag.

use crate::{
    binding::{self, binding_id, Binding},
    connection::{Connection, ConnectionInner},
    consumer::{self, ConsumerHandler, ConsumerOptions, ConsumerShape, RawConsumerHandler},
    errors::AmqpError,
    exchange::Exchange,
    message::{self, Content, Destination, Message},
    ready::ReadyCell,
};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to expire an unused queue
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Configuration parameters of a queue declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub message_ttl: Option<i32>,
    #[serde(default)]
    pub expires: Option<i32>,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub max_length: Option<i32>,
    #[serde(default)]
    pub prefetch: Option<u16>,
    #[serde(skip, default)]
    pub arguments: FieldTable,
}

impl QueueOptions {
    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
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

    /// Sets the message Time-To-Live in milliseconds.
    pub fn message_ttl(mut self, ttl: i32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Expires the queue after the given idle period in milliseconds.
    pub fn expires(mut self, period: i32) -> Self {
        self.expires = Some(period);
        self
    }

    /// Dead-letters rejected or expired messages to the named exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Limits the number of unacked deliveries in flight for consumers.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.arguments.insert(key, value);
        self
    }
}

/// Materializes the option fields carried as `x-` arguments.
fn declare_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = options.arguments.clone();

    if let Some(ttl) = options.message_ttl {
        arguments.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }
    if let Some(period) = options.expires {
        arguments.insert(
            ShortString::from(AMQP_HEADERS_EXPIRES),
            AMQPValue::LongInt(LongInt::from(period)),
        );
    }
    if let Some(exchange) = &options.dead_letter_exchange {
        arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }
    if let Some(max) = options.max_length {
        arguments.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    arguments
}

pub(crate) struct ConsumerSlot {
    pub(crate) shape: ConsumerShape,
    pub(crate) options: ConsumerOptions,
    pub(crate) tag: Option<String>,
    pub(crate) task: Option<JoinHandle<()>>,
}

/// A named queue endpoint registered on a connection.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    connection: Weak<ConnectionInner>,
    name: String,
    options: QueueOptions,
    channel: Mutex<Option<Channel>>,
    initialized: ReadyCell<()>,
    consumer: Mutex<Option<ConsumerSlot>>,
    consumer_initialized: ReadyCell<String>,
}

impl Queue {
    pub(crate) fn create(
        conn: &Arc<ConnectionInner>,
        name: &str,
        options: QueueOptions,
    ) -> Queue {
        Queue {
            inner: Arc::new(QueueInner {
                connection: Arc::downgrade(conn),
                name: name.to_owned(),
                options,
                channel: Mutex::new(None),
                initialized: ReadyCell::new(),
                consumer: Mutex::new(None),
                consumer_initialized: ReadyCell::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Settles once the broker has acknowledged the declaration.
    pub async fn initialized(&self) -> Result<(), AmqpError> {
        self.inner.initialized.wait().await
    }

    /// Settles with the consumer tag once the subscription is active.
    pub async fn consumer_initialized(&self) -> Result<String, AmqpError> {
        self.inner.consumer_initialized.wait().await
    }

    pub(crate) fn same_entity(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn has_consumer(&self) -> bool {
        self.inner.consumer.lock().unwrap().is_some()
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
    /// channel, asserts the queue and applies qos. A failed declaration
    /// removes the queue from the registry so the name is free again.
    pub(crate) fn start_initialize(&self) {
        let inner = self.inner.clone();
        let generation = inner.initialized.reset();

        tokio::spawn(async move {
            match QueueInner::declare_on_broker(&inner).await {
                Ok(()) => {
                    if inner.initialized.resolve_for(generation, ()) {
                        debug!(name = inner.name, "queue declared");
                    }
                }
                Err(err) => {
                    // A declaration superseded by a rebuild must not settle
                    // the newer attempt or free the name.
                    if inner.initialized.reject_for(generation, err.clone()) {
                        error!(
                            error = err.to_string(),
                            name = inner.name,
                            "error to declare the queue"
                        );
                        if let Some(conn) = inner.connection.upgrade() {
                            conn.remove_queue(&inner.name);
                        }
                    }
                }
            }
        });
    }

    /// Publishes a payload straight to this queue (default exchange, queue
    /// name as routing key).
    pub async fn publish(&self, content: impl Into<Content>) -> Result<(), AmqpError> {
        let message = Message::new(content, BasicProperties::default())?;
        self.send(&message).await
    }

    /// Publishes a prepared [`Message`] straight to this queue.
    pub async fn send(&self, message: &Message) -> Result<(), AmqpError> {
        let connection = self.handle()?;
        message
            .send_to(
                &connection,
                &Destination::Queue(self.inner.name.clone()),
                "",
            )
            .await
    }

    /// Sends a request to this queue and resolves with the reply delivered
    /// over the broker's direct reply-to pseudo-queue.
    pub async fn rpc(&self, content: impl Into<Content>) -> Result<Message, AmqpError> {
        let conn = self.connection()?;
        let message = Message::new(content, BasicProperties::default())?;
        message::rpc_request(
            &conn,
            &Destination::Queue(self.inner.name.clone()),
            "",
            message,
        )
        .await
    }

    /// Binds this queue to a source exchange.
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
            Destination::Queue(self.inner.name.clone()),
            pattern,
            arguments,
        ))
    }

    /// Removes the binding from `source` with the given pattern.
    pub async fn unbind(&self, source: &Exchange, pattern: &str) -> Result<(), AmqpError> {
        let conn = self.connection()?;
        let id = binding_id(
            source.name(),
            &Destination::Queue(self.inner.name.clone()),
            pattern,
        );
        let binding = conn
            .binding(&id)
            .ok_or(AmqpError::UnknownBinding(id))?;
        binding.delete().await
    }

    /// Registers a consumer whose handler receives the [`Message`] together
    /// with its ack handle; the caller is responsible for ack/nack/reject
    /// unless `no_ack` is set.
    pub fn activate_consumer(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumerOptions,
    ) -> Result<(), AmqpError> {
        self.register_consumer(ConsumerShape::Activate(handler), options)
    }

    /// Registers a consumer that is acknowledged by the facade after every
    /// delivery, whether or not the handler succeeded.
    pub fn start_consumer(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumerOptions,
    ) -> Result<(), AmqpError> {
        self.register_consumer(ConsumerShape::Processed(handler), options)
    }

    /// Registers a consumer receiving the raw library delivery and channel,
    /// acknowledged by the facade after every delivery.
    pub fn start_raw_consumer(
        &self,
        handler: Arc<dyn RawConsumerHandler>,
        options: ConsumerOptions,
    ) -> Result<(), AmqpError> {
        self.register_consumer(ConsumerShape::Raw(handler), options)
    }

    fn register_consumer(
        &self,
        shape: ConsumerShape,
        options: ConsumerOptions,
    ) -> Result<(), AmqpError> {
        {
            let mut slot = self.inner.consumer.lock().unwrap();
            if slot.is_some() {
                return Err(AmqpError::ConsumerAlreadyDefined);
            }
            *slot = Some(ConsumerSlot {
                shape,
                options,
                tag: None,
                task: None,
            });
        }

        self.start_initialize_consumer();
        Ok(())
    }

    /// Cancels the active subscription and clears the consumer slot.
    pub async fn stop_consumer(&self) -> Result<(), AmqpError> {
        if self.inner.consumer.lock().unwrap().is_none() {
            return Err(AmqpError::NoConsumerDefined);
        }

        let tag = match self.inner.consumer_initialized.wait().await {
            Ok(tag) => tag,
            Err(err) => {
                self.clear_consumer();
                return Err(err);
            }
        };

        self.channel()?
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await
            .map_err(|_| AmqpError::ConsumerError(self.inner.name.clone()))?;

        self.clear_consumer();
        Ok(())
    }

    fn clear_consumer(&self) {
        let slot = self.inner.consumer.lock().unwrap().take();
        if let Some(slot) = slot {
            if let Some(task) = slot.task {
                task.abort();
            }
        }
        self.inner.consumer_initialized.reset();
    }

    /// (Re)establishes the stored subscription on the queue's current
    /// channel; a fresh consumer tag is obtained from the broker.
    pub(crate) fn start_initialize_consumer(&self) {
        let inner = self.inner.clone();
        let generation = inner.consumer_initialized.reset();

        tokio::spawn(async move {
            match QueueInner::consume_on_broker(&inner, generation).await {
                Ok(tag) => {
                    if inner.consumer_initialized.resolve_for(generation, tag.clone()) {
                        debug!(name = inner.name, tag, "consumer started");
                    }
                }
                Err(err) => {
                    if inner.consumer_initialized.reject_for(generation, err.clone()) {
                        error!(
                            error = err.to_string(),
                            name = inner.name,
                            "error to create the consumer"
                        );
                    }
                }
            }
        });
    }

    /// Deletes the queue on the broker, dropping its bindings first, and
    /// removes it from the registry.
    pub async fn delete(&self) -> Result<(), AmqpError> {
        self.teardown(true).await
    }

    /// Releases the queue locally (bindings, consumer and channel) without
    /// deleting it on the broker.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.teardown(false).await
    }

    async fn teardown(&self, delete_on_broker: bool) -> Result<(), AmqpError> {
        self.inner.initialized.wait().await?;
        let conn = self.connection()?;

        binding::remove_bindings_containing(&conn, &Destination::Queue(self.inner.name.clone()))
            .await?;

        self.clear_consumer();

        let channel = self.inner.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            if delete_on_broker {
                channel
                    .queue_delete(&self.inner.name, QueueDeleteOptions::default())
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

        conn.remove_queue(&self.inner.name);
        Ok(())
    }
}

impl QueueInner {
    async fn declare_on_broker(inner: &Arc<QueueInner>) -> Result<(), AmqpError> {
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

        channel
            .queue_declare(
                &inner.name,
                QueueDeclareOptions {
                    passive: inner.options.passive,
                    durable: inner.options.durable,
                    exclusive: inner.options.exclusive,
                    auto_delete: inner.options.auto_delete,
                    nowait: inner.options.no_wait,
                },
                declare_arguments(&inner.options),
            )
            .await
            .map_err(|_| AmqpError::DeclareQueueError(inner.name.clone()))?;

        if let Some(prefetch) = inner.options.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?;
        }

        *inner.channel.lock().unwrap() = Some(channel);
        Ok(())
    }

    async fn consume_on_broker(inner: &Arc<QueueInner>, generation: u64) -> Result<String, AmqpError> {
        inner.initialized.wait().await?;

        if inner.consumer_initialized.generation() != generation {
            // Superseded by a rebuild while the queue was still declaring.
            return Err(AmqpError::ConsumerError(inner.name.clone()));
        }

        let channel = inner
            .channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(AmqpError::ChannelError)?;

        let (shape, options) = {
            let slot = inner.consumer.lock().unwrap();
            let slot = slot.as_ref().ok_or(AmqpError::NoConsumerDefined)?;
            (slot.shape.clone(), slot.options.clone())
        };

        let tag = format!("{}.{}", inner.name, Uuid::new_v4());
        let deliveries = channel
            .basic_consume(
                &inner.name,
                &tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                options.arguments.clone(),
            )
            .await
            .map_err(|_| AmqpError::ConsumerError(inner.name.clone()))?;

        let task = tokio::spawn(consumer::run_consumer(
            inner.name.clone(),
            channel,
            deliveries,
            shape,
            options,
        ));

        let mut slot = inner.consumer.lock().unwrap();
        let superseded = inner.consumer_initialized.generation() != generation;
        match slot.as_mut() {
            Some(slot) if !superseded => {
                if let Some(previous) = slot.task.replace(task) {
                    previous.abort();
                }
                slot.tag = Some(tag.clone());
            }
            // The consumer was stopped or re-initialized while the
            // subscription was in flight; this loop must not run.
            _ => task.abort(),
        }

        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_fields_materialize_as_arguments() {
        let options = QueueOptions::default()
            .message_ttl(60_000)
            .expires(120_000)
            .dead_letter_exchange("dead")
            .max_length(500);

        let arguments = declare_arguments(&options);
        let inner = arguments.inner();

        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(LongInt::from(60_000)))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_EXPIRES)),
            Some(&AMQPValue::LongInt(LongInt::from(120_000)))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("dead")))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongInt(LongInt::from(500)))
        );
    }

    #[test]
    fn plain_options_add_no_arguments() {
        let arguments = declare_arguments(&QueueOptions::default().durable());
        assert!(arguments.inner().is_empty());
    }
}
