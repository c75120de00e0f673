//! Live mailbox connections keyed by channel
//!
//! The registry is owned by whoever runs the channels (the orchestrator).
//! Each channel has its own async lock, so opening a slow connection for
//! one channel never waits on another.

use super::store::MailStore;
use helpdesk_common::types::ChannelId;
use helpdesk_common::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Lifecycle of a channel's mailbox connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Idle,
    Polling,
}

#[derive(Default)]
struct Slot {
    store: Option<Arc<dyn MailStore>>,
}

/// Connection registry
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<Slot>>>>,
    states: Mutex<HashMap<ChannelId, ConnectionState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, channel_id: ChannelId) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(channel_id).or_default().clone()
    }

    pub fn state(&self, channel_id: ChannelId) -> ConnectionState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel_id)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn set_state(&self, channel_id: ChannelId, state: ConnectionState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let previous = states.insert(channel_id, state);
        if previous != Some(state) {
            debug!(%channel_id, ?state, "Connection state changed");
        }
    }

    /// Snapshot of every known channel's state
    pub fn states(&self) -> HashMap<ChannelId, ConnectionState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Return the cached connection, or open one with `open`.
    ///
    /// Concurrent callers for the same channel wait for the first open and
    /// then share its result.
    pub async fn connect<F, Fut>(&self, channel_id: ChannelId, open: F) -> Result<Arc<dyn MailStore>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn MailStore>>>,
    {
        let slot = self.slot(channel_id);
        let mut slot = slot.lock().await;

        if let Some(store) = &slot.store {
            return Ok(store.clone());
        }

        self.set_state(channel_id, ConnectionState::Connecting);
        match open().await {
            Ok(store) => {
                slot.store = Some(store.clone());
                self.set_state(channel_id, ConnectionState::Connected);
                info!(%channel_id, "Mailbox connected");
                Ok(store)
            }
            Err(e) => {
                self.set_state(channel_id, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Probe the cached connection; a failing one is dropped.
    ///
    /// Returns false when there is no live connection afterwards.
    pub async fn health_check(&self, channel_id: ChannelId) -> bool {
        let slot = self.slot(channel_id);
        let mut slot = slot.lock().await;

        let Some(store) = slot.store.clone() else {
            return false;
        };

        match store.noop().await {
            Ok(()) => true,
            Err(e) => {
                warn!(%channel_id, error = %e, "Mailbox health check failed; dropping connection");
                slot.store = None;
                self.set_state(channel_id, ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Log out and forget the channel's connection
    pub async fn close(&self, channel_id: ChannelId) {
        let slot = self.slot(channel_id);
        let store = slot.lock().await.store.take();

        if let Some(store) = store {
            if let Err(e) = store.logout().await {
                debug!(%channel_id, error = %e, "Logout failed while closing connection");
            }
        }
        self.set_state(channel_id, ConnectionState::Disconnected);
    }

    pub async fn close_all(&self) {
        let ids: Vec<ChannelId> = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.close(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMailbox;
    use helpdesk_common::Error;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_second_connect_returns_cached() {
        let registry = ConnectionRegistry::new();
        let channel_id = Uuid::new_v4();
        let opens = AtomicUsize::new(0);
        let counter = &opens;

        for _ in 0..2 {
            registry
                .connect(channel_id, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FakeMailbox::new()) as Arc<dyn MailStore>)
                })
                .await
                .unwrap();
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state(channel_id), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_disconnected() {
        let registry = ConnectionRegistry::new();
        let channel_id = Uuid::new_v4();

        let result = registry
            .connect(channel_id, || async {
                Err::<Arc<dyn MailStore>, _>(Error::Connection("refused".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(registry.state(channel_id), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_health_check_drops_broken_connection() {
        let registry = ConnectionRegistry::new();
        let channel_id = Uuid::new_v4();
        let mailbox = Arc::new(FakeMailbox::new());
        let cached = mailbox.clone();
        registry
            .connect(channel_id, || async move { Ok(cached as Arc<dyn MailStore>) })
            .await
            .unwrap();

        assert!(registry.health_check(channel_id).await);
        mailbox.set_broken(true);
        assert!(!registry.health_check(channel_id).await);
        assert_eq!(registry.state(channel_id), ConnectionState::Disconnected);
        assert!(!registry.health_check(channel_id).await);
    }

    #[tokio::test]
    async fn test_close_logs_out() {
        let registry = ConnectionRegistry::new();
        let channel_id = Uuid::new_v4();
        let mailbox = Arc::new(FakeMailbox::new());
        let cached = mailbox.clone();
        registry
            .connect(channel_id, || async move { Ok(cached as Arc<dyn MailStore>) })
            .await
            .unwrap();

        registry.close_all().await;
        assert!(mailbox.logged_out());
        assert_eq!(registry.state(channel_id), ConnectionState::Disconnected);
    }
}
