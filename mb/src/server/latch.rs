//! Cancellable synchronization primitives for the coordination server
//!
//! Counting latches release once a known number of participants checked in;
//! the gate is the single-fire run start signal. Every wait can be released
//! early through a shared [`CancelToken`] so a failing handler never leaves
//! its peers parked forever, and can optionally be bounded by a phase
//! timeout. Without a timeout a silent peer stalls its waiters: that is the
//! documented default of the system this mirrors.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Why a latch or gate wait ended without the condition being met
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("Wait cancelled by a failing peer")]
    Cancelled,

    #[error("Wait timed out")]
    TimedOut,
}

/// Broadcast cancellation shared by every waiter of one run
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Release every current and future waiter. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // Resolves immediately if already cancelled
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

async fn bounded<F>(wait: F, cancel: &CancelToken, timeout: Option<Duration>) -> Result<(), WaitError>
where
    F: Future<Output = ()>,
{
    match timeout {
        None => {
            tokio::select! {
                _ = wait => Ok(()),
                _ = cancel.cancelled() => Err(WaitError::Cancelled),
            }
        }
        Some(limit) => {
            tokio::select! {
                _ = wait => Ok(()),
                _ = cancel.cancelled() => Err(WaitError::Cancelled),
                _ = tokio::time::sleep(limit) => Err(WaitError::TimedOut),
            }
        }
    }
}

/// A counting latch: releases once `count` participants checked in
#[derive(Debug, Clone)]
pub struct Latch {
    tx: watch::Sender<usize>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        let (tx, _rx) = watch::channel(count);
        Self { tx }
    }

    /// Record one participant; saturates at zero.
    pub fn count_down(&self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }

    pub fn remaining(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until the count reaches zero, the token cancels, or the
    /// optional timeout elapses.
    pub async fn wait(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<(), WaitError> {
        let mut rx = self.tx.subscribe();
        let wait = async move {
            let _ = rx.wait_for(|count| *count == 0).await;
        };
        bounded(wait, cancel, timeout).await
    }
}

/// The single-fire run start gate
#[derive(Debug, Clone)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<(), WaitError> {
        let mut rx = self.tx.subscribe();
        let wait = async move {
            let _ = rx.wait_for(|open| *open).await;
        };
        bounded(wait, cancel, timeout).await
    }
}
