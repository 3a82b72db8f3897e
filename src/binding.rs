// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bindings
//!
//! A [`Binding`] is one routing edge from a source exchange to a destination
//! queue or exchange, parameterized by a pattern and an argument table. Each
//! binding registers itself under a stable identity key, owns its own
//! initialization future, and knows how to remove itself from the broker and
//! the registry.

use crate::{
    connection::ConnectionInner,
    errors::AmqpError,
    message::Destination,
    ready::ReadyCell,
};
use futures_util::future::join_all;
use lapin::{
    options::{ExchangeBindOptions, ExchangeUnbindOptions, QueueBindOptions},
    types::FieldTable,
};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Stable identity key of a binding within one connection.
pub(crate) fn binding_id(source: &str, destination: &Destination, pattern: &str) -> String {
    format!(
        "[{}]to{}[{}]{}",
        source,
        destination.kind_label(),
        destination.name(),
        pattern
    )
}

/// One (source exchange → destination, pattern, args) edge.
#[derive(Debug, Clone)]
pub struct Binding {
    inner: Arc<BindingInner>,
}

#[derive(Debug)]
struct BindingInner {
    connection: Weak<ConnectionInner>,
    source: String,
    destination: Destination,
    pattern: String,
    arguments: FieldTable,
    initialized: ReadyCell<()>,
}

impl Binding {
    /// Registers the binding (replacing any previous entry with the same
    /// identity) and starts materializing it on the broker.
    pub(crate) fn declare(
        conn: &Arc<ConnectionInner>,
        source: &str,
        destination: Destination,
        pattern: &str,
        arguments: FieldTable,
    ) -> Binding {
        let binding = Binding {
            inner: Arc::new(BindingInner {
                connection: Arc::downgrade(conn),
                source: source.to_owned(),
                destination,
                pattern: pattern.to_owned(),
                arguments,
                initialized: ReadyCell::new(),
            }),
        };

        conn.register_binding(binding.clone());
        binding.start_initialize();
        binding
    }

    pub fn id(&self) -> String {
        binding_id(
            &self.inner.source,
            &self.inner.destination,
            &self.inner.pattern,
        )
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn pattern(&self) -> &str {
        &self.inner.pattern
    }

    /// Settles once the broker has acknowledged the binding.
    pub async fn initialized(&self) -> Result<(), AmqpError> {
        self.inner.initialized.wait().await
    }

    /// (Re)runs the broker-side bind. A failed bind removes the binding from
    /// the registry so the edge can be redeclared.
    pub(crate) fn start_initialize(&self) {
        let inner = self.inner.clone();
        let generation = inner.initialized.reset();

        tokio::spawn(async move {
            match BindingInner::bind_on_broker(&inner).await {
                Ok(()) => {
                    if inner.initialized.resolve_for(generation, ()) {
                        debug!(
                            source = inner.source,
                            destination = inner.destination.name(),
                            pattern = inner.pattern,
                            "binding created"
                        );
                    }
                }
                Err(err) => {
                    // A bind superseded by a rebuild must not settle the
                    // newer attempt or drop the registry entry.
                    if inner.initialized.reject_for(generation, err.clone()) {
                        error!(
                            error = err.to_string(),
                            source = inner.source,
                            destination = inner.destination.name(),
                            "error to bind to the destination"
                        );
                        if let Some(conn) = inner.connection.upgrade() {
                            let doomed = Binding {
                                inner: inner.clone(),
                            };
                            conn.remove_binding_if(&doomed.id(), &doomed);
                        }
                    }
                }
            }
        });
    }

    /// Removes the binding from the broker and the registry.
    pub async fn delete(&self) -> Result<(), AmqpError> {
        self.inner.initialized.wait().await?;

        let conn = self
            .inner
            .connection
            .upgrade()
            .ok_or(AmqpError::ConnectionDropped)?;

        match &self.inner.destination {
            Destination::Queue(name) => {
                if let Some(queue) = conn.queue(name) {
                    queue
                        .channel()?
                        .queue_unbind(
                            name,
                            &self.inner.source,
                            &self.inner.pattern,
                            self.inner.arguments.clone(),
                        )
                        .await
                        .map_err(|_| {
                            AmqpError::UnbindError(self.inner.source.clone(), name.clone())
                        })?;
                }
            }
            Destination::Exchange(name) => {
                if let Some(exchange) = conn.exchange(name) {
                    exchange
                        .channel()?
                        .exchange_unbind(
                            name,
                            &self.inner.source,
                            &self.inner.pattern,
                            ExchangeUnbindOptions::default(),
                            self.inner.arguments.clone(),
                        )
                        .await
                        .map_err(|_| {
                            AmqpError::UnbindError(self.inner.source.clone(), name.clone())
                        })?;
                }
            }
        }

        conn.remove_binding_if(&self.id(), self);
        Ok(())
    }

    pub(crate) fn same_entity(&self, other: &Binding) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this binding has `target` as its source or destination.
    pub(crate) fn touches(&self, target: &Destination) -> bool {
        if self.inner.destination == *target {
            return true;
        }
        matches!(target, Destination::Exchange(name) if *name == self.inner.source)
    }
}

impl BindingInner {
    async fn bind_on_broker(inner: &Arc<BindingInner>) -> Result<(), AmqpError> {
        let conn = inner
            .connection
            .upgrade()
            .ok_or(AmqpError::ConnectionDropped)?;

        match &inner.destination {
            Destination::Queue(name) => {
                let queue = conn
                    .queue(name)
                    .ok_or_else(|| AmqpError::UnknownQueue(name.clone()))?;
                queue.initialized().await?;
                queue
                    .channel()?
                    .queue_bind(
                        name,
                        &inner.source,
                        &inner.pattern,
                        QueueBindOptions::default(),
                        inner.arguments.clone(),
                    )
                    .await
                    .map_err(|_| AmqpError::BindError(inner.source.clone(), name.clone()))
            }
            Destination::Exchange(name) => {
                let exchange = conn
                    .exchange(name)
                    .ok_or_else(|| AmqpError::UnknownExchange(name.clone()))?;
                exchange.initialized().await?;
                exchange
                    .channel()?
                    .exchange_bind(
                        name,
                        &inner.source,
                        &inner.pattern,
                        ExchangeBindOptions::default(),
                        inner.arguments.clone(),
                    )
                    .await
                    .map_err(|_| AmqpError::BindError(inner.source.clone(), name.clone()))
            }
        }
    }
}

/// Deletes every registered binding whose source or destination is `target`.
/// Used by exchange and queue delete/close before the endpoint itself goes.
pub(crate) async fn remove_bindings_containing(
    conn: &Arc<ConnectionInner>,
    target: &Destination,
) -> Result<(), AmqpError> {
    let touched: Vec<Binding> = conn.bindings_snapshot(|binding| binding.touches(target));

    let results = join_all(touched.iter().map(|binding| binding.delete())).await;
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unwired(source: &str, destination: Destination, pattern: &str) -> Binding {
        Binding {
            inner: Arc::new(BindingInner {
                connection: Weak::new(),
                source: source.to_owned(),
                destination,
                pattern: pattern.to_owned(),
                arguments: FieldTable::default(),
                initialized: ReadyCell::new(),
            }),
        }
    }

    #[test]
    fn identity_key_distinguishes_destination_kind() {
        let to_queue = unwired("e1", Destination::Queue("q1".to_owned()), "k");
        let to_exchange = unwired("e1", Destination::Exchange("q1".to_owned()), "k");

        assert_eq!(to_queue.id(), "[e1]toqueue[q1]k");
        assert_eq!(to_exchange.id(), "[e1]toexchange[q1]k");
    }

    #[test]
    fn touches_matches_source_and_destination() {
        let binding = unwired("orders", Destination::Queue("audit".to_owned()), "#");

        assert!(binding.touches(&Destination::Exchange("orders".to_owned())));
        assert!(binding.touches(&Destination::Queue("audit".to_owned())));
        assert!(!binding.touches(&Destination::Queue("orders".to_owned())));
        assert!(!binding.touches(&Destination::Exchange("audit".to_owned())));
    }
}
