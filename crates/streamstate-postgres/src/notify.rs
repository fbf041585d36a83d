//! Publish/subscribe over the store's notification mechanism.
//!
//! Routing is keyed by logical channel: the listener attached for a channel looks up
//! whichever callback is registered for that channel when a payload arrives, so
//! re-subscribing swaps the callback without touching the listener.
//!
//! After `unsubscribe` returns the removed callback is never invoked again. A payload
//! whose delivery started before the registration was removed may still finish
//! running the old callback.

use crate::client::{ListenerId, NotificationHandler, StoreClient, StoreClientError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use streamstate::{MessageCallback, StreamStateError, StreamStateResult, normalize_channel};
use tracing::debug;

/// Sends `message` on the normalized form of `channel`.
///
/// Notification delivery is not observable from the sender, so the receiver count is
/// always reported as `0`.
pub async fn publish<C>(client: &C, channel: &str, message: &str) -> StreamStateResult<u64>
where
    C: StoreClient + ?Sized,
{
    let hashed_channel = normalize_channel(channel);
    client
        .notify(&hashed_channel, message)
        .await
        .map_err(StoreClientError::into_state_error)?;
    Ok(0)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Registration {
    hashed_channel: String,
    listener: ListenerId,
}

#[derive(Default)]
struct RegistryState {
    callbacks: HashMap<String, MessageCallback>,
    registrations: HashMap<String, Registration>,
}

/// Per-subscriber bookkeeping: logical channel to callback, and logical channel to
/// hashed channel plus listener teardown handle.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner
            .lock()
            .map(|state| state.callbacks.contains_key(channel))
            .unwrap_or(false)
    }

    pub fn hashed_channel(&self, channel: &str) -> Option<String> {
        self.inner.lock().ok().and_then(|state| {
            state
                .registrations
                .get(channel)
                .map(|registration| registration.hashed_channel.clone())
        })
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .lock()
            .map(|state| state.callbacks.keys().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Invokes the callback currently registered for `channel`, outside the lock.
    fn deliver(&self, channel: &str, payload: String) {
        let callback = match self.inner.lock() {
            Ok(state) => state.callbacks.get(channel).cloned(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    /// Stores `callback` and reports whether a listener is already attached.
    fn replace_callback(
        &self,
        channel: &str,
        callback: MessageCallback,
    ) -> StreamStateResult<bool> {
        let mut state = self.lock()?;
        state.callbacks.insert(channel.to_string(), callback);
        Ok(state.registrations.contains_key(channel))
    }

    /// Records the listener for `channel`. Returns a listener that lost a concurrent
    /// attach and must be torn down by the caller.
    fn attach(
        &self,
        channel: &str,
        registration: Registration,
    ) -> StreamStateResult<Option<ListenerId>> {
        let mut state = self.lock()?;
        if !state.callbacks.contains_key(channel) || state.registrations.contains_key(channel) {
            return Ok(Some(registration.listener));
        }
        state.registrations.insert(channel.to_string(), registration);
        Ok(None)
    }

    fn forget_unattached(&self, channel: &str) {
        if let Ok(mut state) = self.inner.lock()
            && !state.registrations.contains_key(channel)
        {
            state.callbacks.remove(channel);
        }
    }

    fn remove(&self, channel: &str) -> StreamStateResult<Option<Registration>> {
        let mut state = self.lock()?;
        state.callbacks.remove(channel);
        Ok(state.registrations.remove(channel))
    }

    fn lock(&self) -> StreamStateResult<std::sync::MutexGuard<'_, RegistryState>> {
        self.inner.lock().map_err(|_| {
            StreamStateError::Store(Box::new(StoreClientError::Backend(
                "subscription registry mutex poisoned".to_string(),
            )))
        })
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

/// Subscribe half of the notification emulation.
#[derive(Clone, Debug)]
pub struct ChannelSubscriptions<C> {
    client: C,
    registry: SubscriptionRegistry,
}

impl<C> ChannelSubscriptions<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            registry: SubscriptionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C> ChannelSubscriptions<C>
where
    C: StoreClient,
{
    pub async fn subscribe(&self, channel: &str, callback: MessageCallback) -> StreamStateResult<()> {
        let hashed_channel = normalize_channel(channel);

        if self.registry.replace_callback(channel, callback)? {
            debug!(channel, "replaced callback on existing subscription");
            return Ok(());
        }

        let routes = self.registry.clone();
        let logical_channel = channel.to_string();
        let handler: NotificationHandler =
            Arc::new(move |payload| routes.deliver(&logical_channel, payload));

        let listener = match self.client.listen(&hashed_channel, handler).await {
            Ok(listener) => listener,
            Err(err) => {
                self.registry.forget_unattached(channel);
                return Err(err.into_state_error());
            }
        };

        let stale = self.registry.attach(
            channel,
            Registration {
                hashed_channel: hashed_channel.clone(),
                listener,
            },
        )?;
        if let Some(stale) = stale {
            self.client
                .unlisten(&stale)
                .await
                .map_err(StoreClientError::into_state_error)?;
        }

        debug!(channel, hashed_channel = %hashed_channel, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, channel: &str) -> StreamStateResult<()> {
        let Some(registration) = self.registry.remove(channel)? else {
            return Ok(());
        };
        self.client
            .unlisten(&registration.listener)
            .await
            .map_err(StoreClientError::into_state_error)?;
        debug!(channel, hashed_channel = %registration.hashed_channel, "unsubscribed");
        Ok(())
    }
}
