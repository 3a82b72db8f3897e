// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Declarative, self-healing topology layer over an AMQP 0-9-1 broker.
//!
//! An application declares exchanges, queues and bindings on a
//! [`connection::Connection`] and publishes or consumes against those named
//! endpoints. The connection supervises the broker link: when it drops, the
//! link is re-established according to the reconnect strategy and every
//! registered entity is re-declared in place, while publishes and consumer
//! registrations issued in the meantime gate on the entity's initialization.

mod otel;
mod ready;

pub mod binding;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod topology;
