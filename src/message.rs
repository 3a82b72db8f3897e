// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! This module provides the [`Message`] value object exchanged with the
//! broker, the [`Content`] sum type with its encoding rules, and the shared
//! publish path used by exchanges and queues. The publish path recovers from
//! a stale channel by asking the connection supervisor for a rebuild and
//! retransmitting the message once, which yields at-least-once delivery
//! across transient link failures.

use crate::{
    connection::{Connection, ConnectionInner},
    errors::AmqpError,
    otel,
};
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicRejectOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Content type set on JSON-encoded payloads when the caller did not pick one
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Pseudo-queue delivering replies straight to the requesting channel
pub const DIRECT_REPLY_TO_QUEUE: &str = "amq.rabbitmq.reply-to";

/// A message payload before encoding.
///
/// Strings are sent as their UTF-8 bytes, byte buffers pass through verbatim,
/// and any JSON value is serialized with `content_type` defaulting to
/// `application/json`.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl Content {
    pub(crate) fn encode(self) -> Result<(Vec<u8>, Option<&'static str>), AmqpError> {
        match self {
            Content::Bytes(bytes) => Ok((bytes, None)),
            Content::Text(text) => Ok((text.into_bytes(), None)),
            Content::Json(value) => serde_json::to_vec(&value)
                .map(|bytes| (bytes, Some(JSON_CONTENT_TYPE)))
                .map_err(|_| AmqpError::ParsePayloadError),
        }
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_owned())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Bytes(value)
    }
}

impl From<&[u8]> for Content {
    fn from(value: &[u8]) -> Self {
        Content::Bytes(value.to_vec())
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Content::Json(value)
    }
}

/// A publish target: an exchange routed by key, or a queue reached through
/// the default exchange with the queue name as routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Exchange(String),
    Queue(String),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Exchange(name) | Destination::Queue(name) => name,
        }
    }

    pub(crate) fn kind_label(&self) -> &'static str {
        match self {
            Destination::Exchange(_) => "exchange",
            Destination::Queue(_) => "queue",
        }
    }
}

/// Delivery metadata attached to received messages.
#[derive(Debug, Clone)]
pub struct DeliveryFields {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// A message sent to or received from the broker.
///
/// Received messages additionally carry delivery metadata and the ack handle
/// bound to the delivering channel.
#[derive(Debug)]
pub struct Message {
    content: Vec<u8>,
    properties: BasicProperties,
    fields: Option<DeliveryFields>,
    acker: Option<Acker>,
}

impl Message {
    /// Builds an outgoing message, applying the content encoding rules.
    pub fn new(content: impl Into<Content>, properties: BasicProperties) -> Result<Message, AmqpError> {
        let (bytes, default_type) = content.into().encode()?;

        let properties = match default_type {
            Some(content_type) if properties.content_type().is_none() => {
                properties.with_content_type(content_type.into())
            }
            _ => properties,
        };

        Ok(Message {
            content: bytes,
            properties,
            fields: None,
            acker: None,
        })
    }

    /// Marks the message as persistent (delivery mode 2), so a durable queue
    /// keeps it across broker restarts.
    pub fn persistent(mut self) -> Self {
        let properties = std::mem::take(&mut self.properties);
        self.properties = properties.with_delivery_mode(2);
        self
    }

    /// The raw payload bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// Delivery metadata; `None` for messages built locally.
    pub fn fields(&self) -> Option<&DeliveryFields> {
        self.fields.as_ref()
    }

    /// Decodes the payload: `application/json` payloads are parsed, anything
    /// else is returned as the UTF-8 string of the bytes. The raw buffer
    /// stays available through [`Message::content`].
    pub fn get_content(&self) -> Result<Content, AmqpError> {
        let is_json = self
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str() == JSON_CONTENT_TYPE)
            .unwrap_or(false);

        if is_json {
            serde_json::from_slice(&self.content)
                .map(Content::Json)
                .map_err(|_| AmqpError::ParsePayloadError)
        } else {
            Ok(Content::Text(
                String::from_utf8_lossy(&self.content).into_owned(),
            ))
        }
    }

    /// Acknowledges the delivery on its originating channel.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker
                .ack(BasicAckOptions { multiple: false })
                .await
                .map_err(|_| AmqpError::AckMessageError),
            None => Err(AmqpError::MessageNotDelivered),
        }
    }

    /// Negatively acknowledges the delivery, optionally requeueing it.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue,
                })
                .await
                .map_err(|_| AmqpError::NackMessageError),
            None => Err(AmqpError::MessageNotDelivered),
        }
    }

    /// Rejects the delivery, optionally requeueing it.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker
                .reject(BasicRejectOptions { requeue })
                .await
                .map_err(|_| AmqpError::RejectMessageError),
            None => Err(AmqpError::MessageNotDelivered),
        }
    }

    /// Publishes this message to the destination, retransmitting once after a
    /// connection rebuild when the first attempt fails on a stale channel.
    pub async fn send_to(
        &self,
        connection: &Connection,
        destination: &Destination,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let conn = connection.internals();

        match attempt_publish(conn, destination, routing_key, &self.content, &self.properties).await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    destination = destination.name(),
                    "publish failed, rebuilding connection before retransmit"
                );
                conn.rebuild_all(&err).await?;
                attempt_publish(conn, destination, routing_key, &self.content, &self.properties)
                    .await
            }
        }
    }

    /// Wraps a delivery, keeping the ack handle on the message.
    pub(crate) fn from_delivery(delivery: Delivery) -> Message {
        let (mut message, acker) = Message::from_delivery_parts(delivery);
        message.acker = Some(acker);
        message
    }

    /// Wraps a delivery, handing the ack handle back to the caller.
    pub(crate) fn from_delivery_parts(delivery: Delivery) -> (Message, Acker) {
        let Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
        } = delivery;

        let message = Message {
            content: data,
            properties,
            fields: Some(DeliveryFields {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                delivery_tag,
                redelivered,
            }),
            acker: None,
        };

        (message, acker)
    }
}

/// Resolves the destination to its live channel and concrete publish address,
/// gating on the entity's initialization.
pub(crate) async fn publish_target(
    conn: &Arc<ConnectionInner>,
    destination: &Destination,
    routing_key: &str,
) -> Result<(Channel, String, String), AmqpError> {
    match destination {
        Destination::Exchange(name) => {
            let exchange = conn
                .exchange(name)
                .ok_or_else(|| AmqpError::UnknownExchange(name.clone()))?;
            exchange.initialized().await?;
            Ok((exchange.channel()?, name.clone(), routing_key.to_owned()))
        }
        Destination::Queue(name) => {
            let queue = conn
                .queue(name)
                .ok_or_else(|| AmqpError::UnknownQueue(name.clone()))?;
            queue.initialized().await?;
            Ok((queue.channel()?, String::new(), name.clone()))
        }
    }
}

async fn attempt_publish(
    conn: &Arc<ConnectionInner>,
    destination: &Destination,
    routing_key: &str,
    payload: &[u8],
    properties: &BasicProperties,
) -> Result<(), AmqpError> {
    let (channel, exchange, key) = publish_target(conn, destination, routing_key).await?;

    let mut properties = otel::inject_current_context(properties.clone());
    if properties.message_id().is_none() {
        properties = properties.with_message_id(Uuid::new_v4().to_string().into());
    }

    channel
        .basic_publish(
            &exchange,
            &key,
            BasicPublishOptions::default(),
            payload,
            properties,
        )
        .await
        .map_err(|_| AmqpError::PublishError(destination.name().to_owned()))?
        .await
        .map_err(|_| AmqpError::PublishError(destination.name().to_owned()))?;

    Ok(())
}

/// Runs one RPC round-trip over the broker's direct reply-to pseudo-queue:
/// subscribe, publish the request with `reply_to` set, resolve with the first
/// delivery and cancel the subscription.
pub(crate) async fn rpc_request(
    conn: &Arc<ConnectionInner>,
    destination: &Destination,
    routing_key: &str,
    message: Message,
) -> Result<Message, AmqpError> {
    let (channel, exchange, key) = publish_target(conn, destination, routing_key).await?;

    let reply_tag = format!("reply.{}", Uuid::new_v4());
    let mut replies = channel
        .basic_consume(
            DIRECT_REPLY_TO_QUEUE,
            &reply_tag,
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| AmqpError::RpcError(err.to_string()))?;

    let properties = otel::inject_current_context(
        message
            .properties
            .clone()
            .with_reply_to(DIRECT_REPLY_TO_QUEUE.into())
            .with_correlation_id(Uuid::new_v4().to_string().into()),
    );

    channel
        .basic_publish(
            &exchange,
            &key,
            BasicPublishOptions::default(),
            &message.content,
            properties,
        )
        .await
        .map_err(|err| AmqpError::RpcError(err.to_string()))?
        .await
        .map_err(|err| AmqpError::RpcError(err.to_string()))?;

    let reply = loop {
        match replies.next().await {
            Some(Ok(delivery)) => break delivery,
            Some(Err(err)) => return Err(AmqpError::RpcError(err.to_string())),
            None => return Err(AmqpError::RpcError("reply subscription closed".to_owned())),
        }
    };

    if let Err(err) = channel
        .basic_cancel(&reply_tag, BasicCancelOptions::default())
        .await
    {
        error!(
            error = err.to_string(),
            "error to cancel the reply subscription"
        );
    }

    // Replies arrive on a no-ack subscription, so the ack handle is dropped.
    let (reply, _acker) = Message::from_delivery_parts(reply);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_payload_is_utf8_and_round_trips() {
        let message = Message::new("hello", BasicProperties::default()).unwrap();

        assert_eq!(message.content(), "hello".as_bytes());
        assert!(message.properties().content_type().is_none());
        assert_eq!(
            message.get_content().unwrap(),
            Content::Text("hello".to_owned())
        );
    }

    #[test]
    fn json_payload_defaults_content_type_and_round_trips() {
        let value = json!({"a": 1, "b": [2, 3]});
        let message = Message::new(value.clone(), BasicProperties::default()).unwrap();

        assert_eq!(
            message.properties().content_type().as_ref().unwrap().as_str(),
            JSON_CONTENT_TYPE
        );
        assert_eq!(message.get_content().unwrap(), Content::Json(value));
    }

    #[test]
    fn json_payload_keeps_caller_content_type() {
        let message = Message::new(
            json!([1, 2]),
            BasicProperties::default().with_content_type("application/x-custom".into()),
        )
        .unwrap();

        assert_eq!(
            message.properties().content_type().as_ref().unwrap().as_str(),
            "application/x-custom"
        );
    }

    #[test]
    fn persistent_marks_delivery_mode_two() {
        let message = Message::new("x", BasicProperties::default())
            .unwrap()
            .persistent();

        assert_eq!(message.properties().delivery_mode(), &Some(2));
    }

    #[test]
    fn byte_payload_passes_through_verbatim() {
        let bytes = vec![0u8, 159, 146, 150];
        let message = Message::new(bytes.clone(), BasicProperties::default()).unwrap();

        assert_eq!(message.content(), bytes.as_slice());
        assert!(message.properties().content_type().is_none());
    }

    #[tokio::test]
    async fn ack_requires_a_delivery() {
        let message = Message::new("x", BasicProperties::default()).unwrap();

        assert_eq!(message.ack().await, Err(AmqpError::MessageNotDelivered));
    }
}
