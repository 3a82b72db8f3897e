// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Records
//!
//! This module provides the declarative records describing an application's
//! broker-side layout: exchanges, queues and the bindings between them. A
//! [`Topology`] is consumed by `Connection::declare_topology`, which registers
//! every entity and materializes it on the broker. The records are
//! serde-derivable so a whole topology can be loaded from configuration.

use crate::{
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
};
use serde::{Deserialize, Serialize};

/// A declared set of exchanges, queues and bindings.
///
/// Declaration order is exchanges, then queues, then bindings; their
/// broker-side completion settles independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub exchanges: Vec<ExchangeDefinition>,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn binding(mut self, def: BindingDefinition) -> Self {
        self.bindings.push(def);
        self
    }
}

/// Declarative description of one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub options: ExchangeOptions,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::default(),
            options: ExchangeOptions::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn options(mut self, options: ExchangeOptions) -> Self {
        self.options = options;
        self
    }
}

/// Declarative description of one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default)]
    pub options: QueueOptions,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            options: QueueOptions::default(),
        }
    }

    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }
}

/// Declarative description of one binding edge.
///
/// The source is always an exchange, declared implicitly with default options
/// when it is not part of the topology. The destination is the exchange named
/// by `exchange` when set, otherwise the queue named by `queue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingDefinition {
    pub source: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub pattern: String,
}

impl BindingDefinition {
    /// Binds a queue to a source exchange.
    pub fn to_queue(source: &str, queue: &str, pattern: &str) -> BindingDefinition {
        BindingDefinition {
            source: source.to_owned(),
            exchange: None,
            queue: Some(queue.to_owned()),
            pattern: pattern.to_owned(),
        }
    }

    /// Binds a destination exchange to a source exchange.
    pub fn to_exchange(source: &str, exchange: &str, pattern: &str) -> BindingDefinition {
        BindingDefinition {
            source: source.to_owned(),
            exchange: Some(exchange.to_owned()),
            queue: None,
            pattern: pattern.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_deserializes_from_json() {
        let raw = serde_json::json!({
            "exchanges": [{"name": "e1", "type": "topic"}],
            "queues": [{"name": "q1"}],
            "bindings": [{"source": "e1", "queue": "q1", "pattern": "k.#"}]
        });

        let topology: Topology = serde_json::from_value(raw).unwrap();

        assert_eq!(topology.exchanges[0].name, "e1");
        assert_eq!(topology.exchanges[0].kind, ExchangeKind::Topic);
        assert_eq!(topology.queues[0].name, "q1");
        assert_eq!(topology.bindings[0].queue.as_deref(), Some("q1"));
        assert_eq!(topology.bindings[0].pattern, "k.#");
    }

    #[test]
    fn exchange_kind_defaults_to_direct() {
        let raw = serde_json::json!({"exchanges": [{"name": "plain"}]});

        let topology: Topology = serde_json::from_value(raw).unwrap();

        assert_eq!(topology.exchanges[0].kind, ExchangeKind::Direct);
    }
}
