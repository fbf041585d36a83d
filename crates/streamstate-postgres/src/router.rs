//! Fans notifications from one connection out to any number of listeners.
//!
//! Each listener owns an unbounded queue drained by its own task, so a slow handler
//! delays only its own messages. Removing a listener aborts its task; payloads still
//! queued for it are dropped.

use crate::client::{ListenerId, NotificationHandler, StoreClientError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Clone, Debug, Default)]
pub struct NotificationRouter {
    inner: Arc<Mutex<RouterState>>,
}

#[derive(Debug, Default)]
struct RouterState {
    next_listener_id: u64,
    channels: HashMap<String, BTreeMap<u64, ListenerSlot>>,
}

#[derive(Debug)]
struct ListenerSlot {
    sender: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl Drop for ListenerSlot {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of [`NotificationRouter::register`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registered {
    pub listener: ListenerId,
    /// True when no other listener was attached to the channel before this one.
    pub first_on_channel: bool,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called from within a Tokio runtime.
    pub fn register(
        &self,
        channel: &str,
        handler: NotificationHandler,
    ) -> Result<Registered, StoreClientError> {
        let mut state = self.lock()?;

        state.next_listener_id += 1;
        let id = state.next_listener_id;

        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                handler(payload);
            }
        });

        let listeners = state.channels.entry(channel.to_string()).or_default();
        let first_on_channel = listeners.is_empty();
        listeners.insert(id, ListenerSlot { sender, task });

        Ok(Registered {
            listener: ListenerId {
                channel: channel.to_string(),
                id,
            },
            first_on_channel,
        })
    }

    /// Returns `None` for unknown listeners, otherwise whether the channel has no
    /// listeners left.
    pub fn unregister(&self, listener: &ListenerId) -> Result<Option<bool>, StoreClientError> {
        let removed = {
            let mut state = self.lock()?;
            let Some(listeners) = state.channels.get_mut(&listener.channel) else {
                return Ok(None);
            };
            let Some(slot) = listeners.remove(&listener.id) else {
                return Ok(None);
            };
            let channel_empty = listeners.is_empty();
            if channel_empty {
                state.channels.remove(&listener.channel);
            }
            (slot, channel_empty)
        };

        let (slot, channel_empty) = removed;
        drop(slot);
        Ok(Some(channel_empty))
    }

    /// Queues `payload` for every listener on `channel`, returning how many were reached.
    pub fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let Ok(state) = self.inner.lock() else {
            warn!(channel, "notification router lock poisoned; dropping notification");
            return 0;
        };
        let Some(listeners) = state.channels.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, slot) in listeners {
            if slot.sender.send(payload.to_string()).is_ok() {
                delivered += 1;
            } else {
                warn!(channel, listener_id = id, "listener task has stopped");
            }
        }
        delivered
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .map(|state| state.channels.get(channel).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .lock()
            .map(|state| state.channels.keys().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Drops every listener, e.g. after the underlying connection has closed.
    pub fn clear(&self) {
        let drained = match self.inner.lock() {
            Ok(mut state) => std::mem::take(&mut state.channels),
            Err(_) => return,
        };
        drop(drained);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RouterState>, StoreClientError> {
        self.inner
            .lock()
            .map_err(|_| StoreClientError::Backend("notification router mutex poisoned".to_string()))
    }
}
