use crate::config::TableName;
use async_trait::async_trait;
use std::sync::Arc;
use streamstate::StreamStateError;

/// Called with the payload of each notification that arrives on a listened channel.
pub type NotificationHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Teardown handle for one `listen` call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId {
    pub channel: String,
    pub id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreClientError {
    #[error("stored value is not an integer: {0}")]
    InvalidInteger(String),
    #[error("integer out of range: {0}")]
    IntegerOutOfRange(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error {code}: {message}")]
    Database { code: String, message: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StoreClientError {
    pub fn is_integer_conversion(&self) -> bool {
        matches!(self, Self::InvalidInteger(_) | Self::IntegerOutOfRange(_))
    }

    pub fn into_state_error(self) -> StreamStateError {
        match self {
            Self::Unavailable(message) => StreamStateError::StoreUnavailable(message),
            Self::InvalidInput(message) => StreamStateError::InvalidInput(message),
            other => StreamStateError::Store(Box::new(other)),
        }
    }

    /// Like [`Self::into_state_error`], but both integer-conversion kinds collapse into
    /// [`StreamStateError::NotAnInteger`].
    pub fn into_counter_error(self) -> StreamStateError {
        if self.is_integer_conversion() {
            StreamStateError::NotAnInteger
        } else {
            self.into_state_error()
        }
    }
}

/// Row-store and notification primitives the emulations are built from.
///
/// Every method is a single statement against the store; atomicity of each call is
/// the store's responsibility.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// `INSERT .. ON CONFLICT (key) DO UPDATE SET value, expires_at`.
    ///
    /// `expire_seconds` is relative to the store's own clock, so rows written by
    /// processes with skewed clocks expire consistently. `None` stores no expiry.
    async fn upsert(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
        expire_seconds: Option<i64>,
    ) -> Result<(), StoreClientError>;

    /// Value of the row for `key` unless it is missing or expired.
    async fn select_live(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError>;

    /// Inserts `value` without expiry when no live row exists; an expired row is
    /// overwritten in the same statement. Returns whether this call wrote the row.
    async fn insert_if_absent(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
    ) -> Result<bool, StoreClientError>;

    /// `SET value = (value::bigint + 1)::text`, returning the new value or `None` when
    /// no row matched.
    async fn increment(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError>;

    /// Physically removes expired rows, returning how many were deleted.
    async fn delete_expired(&self, table: &TableName) -> Result<u64, StoreClientError>;

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreClientError>;

    async fn listen(
        &self,
        channel: &str,
        handler: NotificationHandler,
    ) -> Result<ListenerId, StoreClientError>;

    /// Unknown or already removed listeners are a no-op.
    async fn unlisten(&self, listener: &ListenerId) -> Result<(), StoreClientError>;
}

#[async_trait]
impl<T> StoreClient for Arc<T>
where
    T: StoreClient + ?Sized,
{
    async fn upsert(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
        expire_seconds: Option<i64>,
    ) -> Result<(), StoreClientError> {
        (**self).upsert(table, key, value, expire_seconds).await
    }

    async fn select_live(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError> {
        (**self).select_live(table, key).await
    }

    async fn insert_if_absent(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
    ) -> Result<bool, StoreClientError> {
        (**self).insert_if_absent(table, key, value).await
    }

    async fn increment(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError> {
        (**self).increment(table, key).await
    }

    async fn delete_expired(&self, table: &TableName) -> Result<u64, StoreClientError> {
        (**self).delete_expired(table).await
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreClientError> {
        (**self).notify(channel, payload).await
    }

    async fn listen(
        &self,
        channel: &str,
        handler: NotificationHandler,
    ) -> Result<ListenerId, StoreClientError> {
        (**self).listen(channel, handler).await
    }

    async fn unlisten(&self, listener: &ListenerId) -> Result<(), StoreClientError> {
        (**self).unlisten(listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_counter_error_integer_kinds_expected_not_an_integer() {
        for error in [
            StoreClientError::InvalidInteger("invalid input syntax for type bigint: \"DONE\"".into()),
            StoreClientError::IntegerOutOfRange("bigint out of range".into()),
        ] {
            assert!(error.is_integer_conversion());
            assert!(matches!(
                error.into_counter_error(),
                StreamStateError::NotAnInteger
            ));
        }
    }

    #[test]
    fn into_state_error_unavailable_expected_store_unavailable() {
        let error = StoreClientError::Unavailable("connection closed".to_string());
        assert!(matches!(
            error.into_counter_error(),
            StreamStateError::StoreUnavailable(message) if message == "connection closed"
        ));
    }

    #[test]
    fn into_state_error_database_expected_passed_through_unchanged() {
        let error = StoreClientError::Database {
            code: "42P01".to_string(),
            message: "relation \"missing\" does not exist".to_string(),
        };
        let StreamStateError::Store(inner) = error.into_state_error() else {
            panic!("expected passthrough store error");
        };
        let inner = inner
            .downcast_ref::<StoreClientError>()
            .expect("inner error should be the client error");
        assert!(matches!(inner, StoreClientError::Database { code, .. } if code == "42P01"));
    }

    #[test]
    fn into_state_error_integer_kind_outside_counter_expected_not_translated() {
        let error = StoreClientError::InvalidInteger("x".to_string());
        assert!(matches!(error.into_state_error(), StreamStateError::Store(_)));
    }
}
