use crate::client::{ListenerId, NotificationHandler, StoreClient, StoreClientError};
use crate::config::{PostgresConfig, TableName, quote_identifier, redact_url};
use crate::router::NotificationRouter;
use crate::schema;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, error, info};

/// [`StoreClient`] over a single `tokio-postgres` connection.
///
/// The connection is driven by a background task that forwards asynchronous
/// notifications into a [`NotificationRouter`], so every listener shares the one
/// connection. `LISTEN` is issued when the first listener attaches to a channel and
/// `UNLISTEN` when the last one leaves.
pub struct PostgresStoreClient {
    client: tokio_postgres::Client,
    router: NotificationRouter,
    listen_lock: AsyncMutex<()>,
    driver: JoinHandle<()>,
}

impl PostgresStoreClient {
    /// TLS is not supported; connections use `NoTls`.
    pub async fn connect(url: &str) -> Result<Self, StoreClientError> {
        let (client, mut connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|err| {
                StoreClientError::Unavailable(format!(
                    "postgres connect to {} failed: {err}",
                    redact_url(url)
                ))
            })?;

        let router = NotificationRouter::new();
        let dispatch = router.clone();
        let driver = tokio::spawn(async move {
            let messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            futures::pin_mut!(messages);
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        let delivered =
                            dispatch.dispatch(notification.channel(), notification.payload());
                        debug!(
                            channel = notification.channel(),
                            delivered, "notification received"
                        );
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice.message(), "postgres notice");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "postgres connection error");
                        break;
                    }
                }
            }
            dispatch.clear();
            debug!("postgres connection driver stopped");
        });

        info!(url = %redact_url(url), "connected to postgres");
        Ok(Self {
            client,
            router,
            listen_lock: AsyncMutex::new(()),
            driver,
        })
    }

    pub async fn connect_with_config(config: &PostgresConfig) -> Result<Self, StoreClientError> {
        Self::connect(&config.url).await
    }

    pub async fn connect_from_env() -> Result<Self, StoreClientError> {
        let config = PostgresConfig::from_env()?;
        Self::connect_with_config(&config).await
    }

    /// Creates the backing table when it does not exist. The adapters never call this.
    pub async fn create_table_if_missing(&self, table: &TableName) -> Result<(), StoreClientError> {
        self.client
            .batch_execute(&schema::create_table_statement(table))
            .await
            .map_err(map_pg_error)
    }

    pub async fn drop_table(&self, table: &TableName) -> Result<(), StoreClientError> {
        self.client
            .batch_execute(&schema::drop_table_statement(table))
            .await
            .map_err(map_pg_error)
    }

    pub async fn truncate_table(&self, table: &TableName) -> Result<(), StoreClientError> {
        self.client
            .batch_execute(&format!("TRUNCATE TABLE {}", table.quoted()))
            .await
            .map_err(map_pg_error)
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.router
    }
}

impl Drop for PostgresStoreClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl std::fmt::Debug for PostgresStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStoreClient")
            .field("closed", &self.client.is_closed())
            .field("channels", &self.router.channels())
            .finish()
    }
}

#[async_trait]
impl StoreClient for PostgresStoreClient {
    async fn upsert(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
        expire_seconds: Option<i64>,
    ) -> Result<(), StoreClientError> {
        self.client
            .execute(
                &schema::upsert_statement(table),
                &[&key, &value, &expire_seconds],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn select_live(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError> {
        let statement = format!(
            "SELECT value FROM {table} WHERE key = $1 \
             AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)",
            table = table.quoted()
        );
        let row = self
            .client
            .query_opt(&statement, &[&key])
            .await
            .map_err(map_pg_error)?;
        row.map(|row| row.try_get::<_, String>(0).map_err(map_pg_error))
            .transpose()
    }

    async fn insert_if_absent(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
    ) -> Result<bool, StoreClientError> {
        // The conflict branch only fires for expired rows; a live row yields no
        // RETURNING row, which is how the caller learns it lost the insert.
        let statement = format!(
            "INSERT INTO {table} AS existing (key, value, expires_at) VALUES ($1, $2, NULL) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = NULL \
             WHERE existing.expires_at IS NOT NULL AND existing.expires_at <= CURRENT_TIMESTAMP \
             RETURNING value",
            table = table.quoted()
        );
        let row = self
            .client
            .query_opt(&statement, &[&key, &value])
            .await
            .map_err(map_pg_error)?;
        Ok(row.is_some())
    }

    async fn increment(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError> {
        let statement = format!(
            "UPDATE {table} SET value = (value::bigint + 1)::text WHERE key = $1 RETURNING value",
            table = table.quoted()
        );
        let row = self
            .client
            .query_opt(&statement, &[&key])
            .await
            .map_err(map_pg_error)?;
        row.map(|row| row.try_get::<_, String>(0).map_err(map_pg_error))
            .transpose()
    }

    async fn delete_expired(&self, table: &TableName) -> Result<u64, StoreClientError> {
        let statement = format!(
            "DELETE FROM {table} WHERE expires_at IS NOT NULL AND expires_at <= CURRENT_TIMESTAMP",
            table = table.quoted()
        );
        self.client
            .execute(&statement, &[])
            .await
            .map_err(map_pg_error)
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreClientError> {
        self.client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &payload])
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn listen(
        &self,
        channel: &str,
        handler: NotificationHandler,
    ) -> Result<ListenerId, StoreClientError> {
        let _guard = self.listen_lock.lock().await;
        let registered = self.router.register(channel, handler)?;
        if registered.first_on_channel {
            let statement = format!("LISTEN {}", quote_identifier(channel));
            if let Err(err) = self.client.batch_execute(&statement).await {
                self.router.unregister(&registered.listener)?;
                return Err(map_pg_error(err));
            }
            debug!(channel, "listening");
        }
        Ok(registered.listener)
    }

    async fn unlisten(&self, listener: &ListenerId) -> Result<(), StoreClientError> {
        let _guard = self.listen_lock.lock().await;
        if self.router.unregister(listener)? == Some(true) {
            let statement = format!("UNLISTEN {}", quote_identifier(&listener.channel));
            self.client
                .batch_execute(&statement)
                .await
                .map_err(map_pg_error)?;
            debug!(channel = %listener.channel, "stopped listening");
        }
        Ok(())
    }
}

pub(crate) fn map_pg_error(err: tokio_postgres::Error) -> StoreClientError {
    if let Some(state) = err.code() {
        let message = err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| err.to_string());
        if *state == SqlState::INVALID_TEXT_REPRESENTATION {
            return StoreClientError::InvalidInteger(message);
        }
        if *state == SqlState::NUMERIC_VALUE_OUT_OF_RANGE {
            return StoreClientError::IntegerOutOfRange(message);
        }
        return StoreClientError::Database {
            code: state.code().to_string(),
            message,
        };
    }

    let io_failure = std::error::Error::source(&err)
        .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
    if err.is_closed() || io_failure {
        return StoreClientError::Unavailable(err.to_string());
    }
    StoreClientError::Backend(err.to_string())
}
