// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by every facade operation. The
//! `AmqpError` enum covers connection and channel failures, declaration
//! failures for exchanges, queues and bindings, publishing and RPC failures,
//! and the consumer state-machine errors.

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// Variants are `Clone` because a single settled initialization future fans
/// the same outcome out to every observer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker, carrying the last
    /// transport error observed by the reconnect loop
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// An operation required a live broker link but none is present
    #[error("connection is not established")]
    NotConnected,

    /// The owning connection handle was dropped while an entity was still in use
    #[error("connection was dropped")]
    ConnectionDropped,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a source exchange to a destination
    #[error("failure to bind `{0}` to `{1}`")]
    BindError(String, String),

    /// Error removing the binding between a source and a destination
    #[error("failure to unbind `{0}` from `{1}`")]
    UnbindError(String, String),

    /// An exchange name was referenced but is not in the registry
    #[error("exchange `{0}` is not declared")]
    UnknownExchange(String),

    /// A queue name was referenced but is not in the registry
    #[error("queue `{0}` is not declared")]
    UnknownQueue(String),

    /// A binding id was referenced but is not in the registry
    #[error("binding `{0}` is not declared")]
    UnknownBinding(String),

    /// Error publishing a message to the named endpoint
    #[error("failure to publish to `{0}`")]
    PublishError(String),

    /// Error deleting the named exchange or queue on the broker
    #[error("failure to delete `{0}`")]
    DeleteError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Ack/nack/reject was called on a message that was never delivered
    #[error("message was not received from the broker")]
    MessageNotDelivered,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A consumer registration was attempted while one is already registered
    #[error("consumer already defined")]
    ConsumerAlreadyDefined,

    /// `stop_consumer` was called without a registered consumer
    #[error("no consumer defined")]
    NoConsumerDefined,

    /// Error creating or running a consumer on the named queue
    #[error("failure to consume from `{0}`")]
    ConsumerError(String),

    /// Error performing an RPC round-trip
    #[error("rpc request failed: {0}")]
    RpcError(String),
}
