//! Watch results and the close-once channel that carries them
//!
//! A watch is a producer task feeding a consumer handle. The producer holds a
//! [`WatchSender`], the consumer a [`ChannelWatcher`]. The channel has room
//! for a single result, so a slow consumer holds the producer back.
//!
//! Lifecycle is tracked in one [`WatchState`] cell shared by both halves:
//!
//! - `Open`: results flow
//! - `Draining`: the consumer asked to stop, the producer has not exited yet
//! - `Closed`: the producer is gone and nothing more will be delivered
//!
//! Only a stop request passes through `Draining`. A producer that finishes on
//! its own takes the channel from `Open` straight to `Closed`.
//!
//! Every transition is a conditional update of that cell, so a stop racing
//! with the producer's own exit is harmless, as is stopping twice.

use crate::{RegistryError, Result, Service};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// Kind of change reported by a watcher
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change delivered by a watcher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResult {
    pub action: Action,
    pub service: Service,
}

impl WatchResult {
    pub fn new(action: Action, service: Service) -> Self {
        Self { action, service }
    }
}

/// Lifecycle of a watch stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    Open,
    Draining,
    Closed,
}

/// Blocking retrieval of registry changes
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Wait for the next change. Once the stream is closed every call
    /// returns [`RegistryError::StreamClosed`].
    async fn next(&self) -> Result<WatchResult>;

    /// Stop the watch and release the upstream subscription. Safe to call
    /// more than once.
    fn stop(&self);
}

/// Create a connected producer/consumer pair
pub fn channel() -> (WatchSender, ChannelWatcher) {
    let (results_tx, results_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(WatchState::Open);
    let state = Arc::new(state_tx);

    let sender = WatchSender {
        results: results_tx,
        state: state.clone(),
        state_rx,
    };
    let watcher = ChannelWatcher {
        results: Mutex::new(results_rx),
        state,
        stopped: AtomicBool::new(false),
    };
    (sender, watcher)
}

/// Producer half of a watch channel
pub struct WatchSender {
    results: mpsc::Sender<WatchResult>,
    state: Arc<watch::Sender<WatchState>>,
    state_rx: watch::Receiver<WatchState>,
}

impl WatchSender {
    /// Hand a result to the consumer, waiting until there is room for it.
    /// Returns `false` once the consumer has stopped or gone away.
    pub async fn send(&mut self, result: WatchResult) -> bool {
        if self.is_stopped() {
            return false;
        }

        tokio::select! {
            biased;
            _ = until_stopping(&mut self.state_rx) => false,
            sent = self.results.send(result) => sent.is_ok(),
        }
    }

    /// Resolves when the consumer asks the watch to stop
    pub async fn stopped(&mut self) {
        until_stopping(&mut self.state_rx).await
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.borrow() != WatchState::Open || self.results.is_closed()
    }
}

impl Drop for WatchSender {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == WatchState::Closed {
                return false;
            }
            *state = WatchState::Closed;
            true
        });
        debug!("Watch channel closed");
    }
}

async fn until_stopping(state: &mut watch::Receiver<WatchState>) {
    // Sender half lives as long as either side; an error means both are gone.
    let _ = state.wait_for(|state| *state != WatchState::Open).await;
}

/// Consumer half of a watch channel
pub struct ChannelWatcher {
    results: Mutex<mpsc::Receiver<WatchResult>>,
    state: Arc<watch::Sender<WatchState>>,
    stopped: AtomicBool,
}

impl ChannelWatcher {
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }
}

#[async_trait]
impl Watcher for ChannelWatcher {
    async fn next(&self) -> Result<WatchResult> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RegistryError::StreamClosed);
        }

        let mut state = self.state.subscribe();
        let mut results = self.results.lock().await;

        tokio::select! {
            biased;
            _ = state.wait_for(|_| self.stopped.load(Ordering::Acquire)) => {
                Err(RegistryError::StreamClosed)
            }
            result = results.recv() => result.ok_or(RegistryError::StreamClosed),
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.state.send_if_modified(|state| {
            if *state != WatchState::Open {
                return false;
            }
            *state = WatchState::Draining;
            true
        });
        debug!("Watch stop requested");
    }
}

impl Drop for ChannelWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(action: Action, name: &str) -> WatchResult {
        WatchResult::new(action, Service::new(name))
    }

    #[test]
    fn test_action_strings() {
        assert_eq!(Action::Create.to_string(), "create");
        assert_eq!(Action::Update.as_str(), "update");
        assert_eq!(serde_json::to_string(&Action::Delete).unwrap(), "\"delete\"");
    }

    #[tokio::test]
    async fn test_results_arrive_in_order() {
        let (mut sender, watcher) = channel();

        let producer = tokio::spawn(async move {
            for name in ["a", "b", "c"] {
                assert!(sender.send(result(Action::Create, name)).await);
            }
        });

        for name in ["a", "b", "c"] {
            let next = watcher.next().await.unwrap();
            assert_eq!(next.service.name, name);
        }
        producer.await.unwrap();

        assert!(matches!(watcher.next().await, Err(RegistryError::StreamClosed)));
        assert_eq!(watcher.state(), WatchState::Closed);
    }

    #[tokio::test]
    async fn test_producer_is_held_back_by_consumer() {
        let (mut sender, watcher) = channel();

        assert!(sender.send(result(Action::Create, "first")).await);
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            sender.send(result(Action::Update, "second")),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(watcher.next().await.unwrap().service.name, "first");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut sender, watcher) = channel();

        watcher.stop();
        watcher.stop();
        assert_eq!(watcher.state(), WatchState::Draining);

        assert!(!sender.send(result(Action::Create, "late")).await);
        drop(sender);

        assert_eq!(watcher.state(), WatchState::Closed);
        assert!(matches!(watcher.next().await, Err(RegistryError::StreamClosed)));
        assert!(matches!(watcher.next().await, Err(RegistryError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_stop_wakes_blocked_consumer() {
        let (mut sender, watcher) = channel();
        let watcher = Arc::new(watcher);

        let waiting = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.stop();

        let outcome = waiting.await.unwrap();
        assert!(matches!(outcome, Err(RegistryError::StreamClosed)));

        sender.stopped().await;
        assert!(sender.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_racing_producer_exit() {
        for _ in 0..32 {
            let (sender, watcher) = channel();
            let exit = tokio::spawn(async move { drop(sender) });
            watcher.stop();
            exit.await.unwrap();
            watcher.stop();

            assert_eq!(watcher.state(), WatchState::Closed);
            assert!(matches!(watcher.next().await, Err(RegistryError::StreamClosed)));
        }
    }

    #[tokio::test]
    async fn test_buffered_result_survives_producer_exit() {
        let (mut sender, watcher) = channel();
        assert!(sender.send(result(Action::Delete, "gone")).await);
        assert_eq!(watcher.state(), WatchState::Open);
        drop(sender);
        assert_eq!(watcher.state(), WatchState::Closed);

        let last = watcher.next().await.unwrap();
        assert_eq!(last.action, Action::Delete);
        assert!(matches!(watcher.next().await, Err(RegistryError::StreamClosed)));
    }
}
