use crate::client::StoreClient;
use crate::config::TableName;
use crate::kv::KeyValueEmulation;
use crate::notify::{self, ChannelSubscriptions, SubscriptionRegistry};
use crate::postgres::PostgresStoreClient;
use async_trait::async_trait;
use std::sync::Arc;
use streamstate::{
    MessageCallback, Publisher, SetOptions, StreamStateResult, Subscriber,
};

/// [`Publisher`] over a row table and the store's notify mechanism.
#[derive(Clone, Debug)]
pub struct PostgresPublisher<C = Arc<PostgresStoreClient>> {
    kv: KeyValueEmulation<C>,
}

impl<C> PostgresPublisher<C> {
    pub fn new(client: C, table: TableName) -> Self {
        Self {
            kv: KeyValueEmulation::new(client, table),
        }
    }

    pub fn key_value(&self) -> &KeyValueEmulation<C> {
        &self.kv
    }
}

impl<C> PostgresPublisher<C>
where
    C: StoreClient,
{
    pub async fn purge_expired(&self) -> StreamStateResult<u64> {
        self.kv.purge_expired().await
    }
}

#[async_trait]
impl<C> Publisher for PostgresPublisher<C>
where
    C: StoreClient,
{
    /// The connection is owned by the caller and already established.
    async fn connect(&self) -> StreamStateResult<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StreamStateResult<u64> {
        notify::publish(self.kv.client(), channel, message).await
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> StreamStateResult<()> {
        self.kv.set(key, value, options).await
    }

    async fn get(&self, key: &str) -> StreamStateResult<Option<String>> {
        self.kv.get(key).await
    }

    async fn incr(&self, key: &str) -> StreamStateResult<i64> {
        self.kv.incr(key).await
    }
}

/// [`Subscriber`] with its own subscription registry; instances never share state.
#[derive(Clone, Debug)]
pub struct PostgresSubscriber<C = Arc<PostgresStoreClient>> {
    subscriptions: ChannelSubscriptions<C>,
}

impl<C> PostgresSubscriber<C> {
    pub fn new(client: C) -> Self {
        Self {
            subscriptions: ChannelSubscriptions::new(client),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        self.subscriptions.registry()
    }
}

#[async_trait]
impl<C> Subscriber for PostgresSubscriber<C>
where
    C: StoreClient,
{
    /// The connection is owned by the caller and already established.
    async fn connect(&self) -> StreamStateResult<()> {
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        on_message: MessageCallback,
    ) -> StreamStateResult<()> {
        self.subscriptions.subscribe(channel, on_message).await
    }

    async fn unsubscribe(&self, channel: &str) -> StreamStateResult<()> {
        self.subscriptions.unsubscribe(channel).await
    }
}

/// Builds a publisher/subscriber pair sharing `client`.
pub fn create_adapters<C>(
    client: C,
    table: TableName,
) -> (PostgresPublisher<C>, PostgresSubscriber<C>)
where
    C: StoreClient + Clone,
{
    (
        PostgresPublisher::new(client.clone(), table),
        PostgresSubscriber::new(client),
    )
}
