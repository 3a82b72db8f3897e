// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumers
//!
//! This module provides the consumer handler traits and the per-delivery
//! dispatch loop shared by every registration shape. Three shapes exist:
//!
//! - `activate_consumer`: the handler receives the [`Message`] with its ack
//!   handle and is responsible for ack/nack/reject itself.
//! - `start_consumer`: the facade acknowledges after every delivery, whether
//!   or not the handler succeeded.
//! - `start_raw_consumer`: the handler receives the raw library delivery and
//!   the channel; the facade acknowledges afterwards.
//!
//! In every shape, when a delivery carries a `reply_to`, the handler's return
//! value is encoded and sent to that reply queue with the request's
//! correlation id. Handler failures are logged; the delivery is not nacked.

use crate::{
    errors::AmqpError,
    message::{Content, Message},
    otel,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicPublishOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error};

/// Handler for consumers receiving the decoded [`Message`] value object.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery. Returning `Ok(Some(content))` answers the
    /// request when it carries a `reply_to`.
    async fn handle(&self, message: Message) -> Result<Option<Content>, AmqpError>;
}

/// Handler for consumers receiving the raw library delivery and channel.
#[async_trait]
pub trait RawConsumerHandler: Send + Sync {
    async fn handle(
        &self,
        delivery: &Delivery,
        channel: &Channel,
    ) -> Result<Option<Content>, AmqpError>;
}

/// Configuration parameters of a consumer subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerOptions {
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_local: bool,
    #[serde(skip, default)]
    pub arguments: FieldTable,
}

impl ConsumerOptions {
    /// Lets the broker consider deliveries settled as soon as they are sent.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    /// Makes this the only consumer allowed on the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Skips deliveries published on this same connection.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }
}

/// The registered callback variant of a queue's consumer slot.
#[derive(Clone)]
pub(crate) enum ConsumerShape {
    Activate(Arc<dyn ConsumerHandler>),
    Processed(Arc<dyn ConsumerHandler>),
    Raw(Arc<dyn RawConsumerHandler>),
}

/// Drains the subscription stream, dispatching every delivery to the stored
/// handler. The loop ends when the subscription is cancelled or its channel
/// dies; a rebuild starts a fresh loop on the reopened channel.
pub(crate) async fn run_consumer(
    queue: String,
    channel: Channel,
    mut deliveries: lapin::Consumer,
    shape: ConsumerShape,
    options: ConsumerOptions,
) {
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) =
                    dispatch(&tracer, &queue, &channel, delivery, &shape, &options).await
                {
                    error!(error = err.to_string(), queue, "error to consume message");
                }
            }
            Err(err) => error!(error = err.to_string(), queue, "error receiving delivery"),
        }
    }

    debug!(queue, "consumer stream ended");
}

async fn dispatch(
    tracer: &BoxedTracer,
    queue: &str,
    channel: &Channel,
    delivery: Delivery,
    shape: &ConsumerShape,
    options: &ConsumerOptions,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, queue);
    let reply_to = delivery.properties.reply_to().clone();
    let correlation_id = delivery.properties.correlation_id().clone();

    let outcome = match shape {
        ConsumerShape::Activate(handler) => handler.handle(Message::from_delivery(delivery)).await,
        ConsumerShape::Processed(handler) => {
            let (message, acker) = Message::from_delivery_parts(delivery);
            let outcome = handler.handle(message).await;
            if !options.no_ack {
                acker
                    .ack(BasicAckOptions { multiple: false })
                    .await
                    .map_err(|_| AmqpError::AckMessageError)?;
            }
            outcome
        }
        ConsumerShape::Raw(handler) => {
            let outcome = handler.handle(&delivery, channel).await;
            if !options.no_ack {
                delivery
                    .acker
                    .ack(BasicAckOptions { multiple: false })
                    .await
                    .map_err(|_| AmqpError::AckMessageError)?;
            }
            outcome
        }
    };

    match outcome {
        Ok(Some(content)) => {
            if let Some(reply_to) = reply_to {
                send_reply(channel, reply_to.as_str(), correlation_id, content).await?;
            }
            span.set_status(Status::Ok);
        }
        Ok(None) => span.set_status(Status::Ok),
        Err(err) => {
            // Handler failures are logged only; the delivery is not nacked.
            error!(error = err.to_string(), queue, "error to handle message");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failed"),
            });
        }
    }

    Ok(())
}

async fn send_reply(
    channel: &Channel,
    reply_to: &str,
    correlation_id: Option<ShortString>,
    content: Content,
) -> Result<(), AmqpError> {
    let (payload, default_type) = content.encode()?;

    let mut properties = BasicProperties::default();
    if let Some(content_type) = default_type {
        properties = properties.with_content_type(content_type.into());
    }
    if let Some(correlation_id) = correlation_id {
        properties = properties.with_correlation_id(correlation_id);
    }

    channel
        .basic_publish(
            "",
            reply_to,
            BasicPublishOptions::default(),
            &payload,
            properties,
        )
        .await
        .map_err(|_| AmqpError::PublishError(reply_to.to_owned()))?
        .await
        .map_err(|_| AmqpError::PublishError(reply_to.to_owned()))?;

    Ok(())
}
