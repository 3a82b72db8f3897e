// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Single-assignment settlement cells backing the `initialized` futures of
//! connections, exchanges, queues, bindings and consumers.
//!
//! A `ReadyCell` starts pending, settles exactly once per generation with
//! either a value or an [`AmqpError`], and fans that outcome out to any number
//! of observers. A rebuild starts a new generation by resetting the cell back
//! to pending; observers that already saw a settlement keep it, observers that
//! arrive afterwards wait for the new one. Settling can be bound to the
//! generation the settling task was started for, so a task superseded by a
//! rebuild cannot clobber the outcome of its successor.

use crate::errors::AmqpError;
use tokio::sync::watch;

type CellState<T> = (u64, Option<Result<T, AmqpError>>);

#[derive(Debug)]
pub(crate) struct ReadyCell<T> {
    tx: watch::Sender<CellState<T>>,
}

impl<T: Clone> ReadyCell<T> {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel((0, None));
        ReadyCell { tx }
    }

    /// Starts a new generation: the cell is pending again. Returns the new
    /// generation token for [`ReadyCell::resolve_for`]/[`ReadyCell::reject_for`].
    pub(crate) fn reset(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|state| {
            state.0 += 1;
            state.1 = None;
            generation = state.0;
        });
        generation
    }

    pub(crate) fn generation(&self) -> u64 {
        self.tx.borrow().0
    }

    /// Settles the current generation unconditionally.
    pub(crate) fn resolve(&self, value: T) {
        self.tx.send_modify(|state| state.1 = Some(Ok(value)));
    }

    /// Settles the current generation unconditionally.
    pub(crate) fn reject(&self, err: AmqpError) {
        self.tx.send_modify(|state| state.1 = Some(Err(err)));
    }

    /// Settles only when `generation` is still current and unsettled; a task
    /// superseded by a newer reset observes `false` and must stand down.
    pub(crate) fn resolve_for(&self, generation: u64, value: T) -> bool {
        self.settle_for(generation, Ok(value))
    }

    /// Rejects only when `generation` is still current and unsettled.
    pub(crate) fn reject_for(&self, generation: u64, err: AmqpError) -> bool {
        self.settle_for(generation, Err(err))
    }

    fn settle_for(&self, generation: u64, outcome: Result<T, AmqpError>) -> bool {
        let mut settled = false;
        self.tx.send_if_modified(|state| {
            if state.0 == generation && state.1.is_none() {
                state.1 = Some(outcome.clone());
                settled = true;
                true
            } else {
                false
            }
        });
        settled
    }

    /// Fast path: the settlement of the current generation, if any.
    pub(crate) fn try_get(&self) -> Option<Result<T, AmqpError>> {
        self.tx.borrow().1.clone()
    }

    /// Waits until the current generation settles.
    pub(crate) async fn wait(&self) -> Result<T, AmqpError> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(settled) = rx.borrow().1.clone() {
                return settled;
            }
            if rx.changed().await.is_err() {
                // The owning entity is gone; nothing can settle this anymore.
                return Err(AmqpError::ConnectionDropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_every_observer() {
        let cell = std::sync::Arc::new(ReadyCell::<u32>::new());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        cell.resolve(7);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(7));
        }
    }

    #[tokio::test]
    async fn rejection_is_cloned_to_observers() {
        let cell = ReadyCell::<()>::new();
        cell.reject(AmqpError::NotConnected);

        assert_eq!(cell.wait().await, Err(AmqpError::NotConnected));
        assert_eq!(cell.try_get(), Some(Err(AmqpError::NotConnected)));
    }

    #[tokio::test]
    async fn reset_starts_a_pending_generation() {
        let cell = ReadyCell::<u32>::new();
        cell.resolve(1);
        assert_eq!(cell.wait().await, Ok(1));

        cell.reset();
        assert_eq!(cell.try_get(), None);

        cell.resolve(2);
        assert_eq!(cell.wait().await, Ok(2));
    }

    #[tokio::test]
    async fn superseded_generation_cannot_settle() {
        let cell = ReadyCell::<u32>::new();

        let stale = cell.reset();
        let current = cell.reset();

        assert!(!cell.resolve_for(stale, 1));
        assert_eq!(cell.try_get(), None);

        assert!(cell.resolve_for(current, 2));
        assert_eq!(cell.wait().await, Ok(2));
        assert!(!cell.reject_for(current, AmqpError::NotConnected));
    }
}
