use crate::client::{ListenerId, NotificationHandler, StoreClient, StoreClientError};
use crate::config::TableName;
use crate::router::NotificationRouter;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::num::IntErrorKind;
use std::sync::{Arc, Mutex};

/// In-memory [`StoreClient`] reproducing the statement semantics of the Postgres client:
/// conflict-guarded inserts, the `bigint` increment expression with its cast failures,
/// read-time expiry filtering and notify/listen fan-out.
#[derive(Clone, Debug, Default)]
pub struct MockStore {
    inner: Arc<Mutex<MockStoreState>>,
    router: NotificationRouter,
}

#[derive(Debug, Default)]
struct MockStoreState {
    tables: BTreeMap<String, BTreeMap<String, MockRow>>,
    notifications: Vec<(String, String)>,
    statements: Vec<String>,
    unavailable: bool,
    vanish_before_increment: usize,
    clock_offset: TimeDelta,
}

impl MockStoreState {
    /// The store's clock, which may be skewed from the caller's.
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        now.checked_add_signed(self.clock_offset).unwrap_or(now)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockRow {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MockRow {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails with [`StoreClientError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Deletes the target row right before the next `count` increment statements run,
    /// as a concurrent reclamation pass would.
    pub fn vanish_rows_before_increment(&self, count: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state.vanish_before_increment = count;
        }
    }

    /// Skews the store's clock relative to the process clock.
    pub fn set_clock_offset(&self, offset: TimeDelta) {
        if let Ok(mut state) = self.inner.lock() {
            state.clock_offset = offset;
        }
    }

    pub fn insert_row(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
        expires_at: Option<DateTime<Utc>>,
    ) {
        if let Ok(mut state) = self.inner.lock() {
            state.tables.entry(table.to_string()).or_default().insert(
                key.to_string(),
                MockRow {
                    value: value.to_string(),
                    expires_at,
                },
            );
        }
    }

    /// Raw row, including rows that are logically expired.
    pub fn row(&self, table: &TableName, key: &str) -> Option<MockRow> {
        let state = self.inner.lock().ok()?;
        state.tables.get(&table.to_string())?.get(key).cloned()
    }

    pub fn row_count(&self, table: &TableName) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.tables.get(&table.to_string()).map(BTreeMap::len))
            .unwrap_or(0)
    }

    /// `(channel, payload)` pairs in the order they were sent.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .map(|state| state.notifications.clone())
            .unwrap_or_default()
    }

    /// `LISTEN`/`UNLISTEN` statements in the order they were issued.
    pub fn listen_statements(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|state| state.statements.clone())
            .unwrap_or_default()
    }

    pub fn listened_channels(&self) -> Vec<String> {
        self.router.channels()
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.router.listener_count(channel)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockStoreState>, StoreClientError> {
        let state = self
            .inner
            .lock()
            .map_err(|_| StoreClientError::Backend("mock store mutex poisoned".to_string()))?;
        if state.unavailable {
            return Err(StoreClientError::Unavailable(
                "mock store connection closed".to_string(),
            ));
        }
        Ok(state)
    }
}

fn parse_bigint(value: &str) -> Result<i64, StoreClientError> {
    value.trim().parse::<i64>().map_err(|err| match err.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            StoreClientError::IntegerOutOfRange(format!("value \"{value}\" is out of range for type bigint"))
        }
        _ => StoreClientError::InvalidInteger(format!(
            "invalid input syntax for type bigint: \"{value}\""
        )),
    })
}

#[async_trait]
impl StoreClient for MockStore {
    async fn upsert(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
        expire_seconds: Option<i64>,
    ) -> Result<(), StoreClientError> {
        let mut state = self.lock()?;
        let expires_at = match expire_seconds {
            Some(seconds) => Some(
                TimeDelta::try_seconds(seconds)
                    .and_then(|delta| state.now().checked_add_signed(delta))
                    .ok_or_else(|| StoreClientError::Database {
                        code: "22008".to_string(),
                        message: "timestamp out of range".to_string(),
                    })?,
            ),
            None => None,
        };
        state.tables.entry(table.to_string()).or_default().insert(
            key.to_string(),
            MockRow {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn select_live(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError> {
        let state = self.lock()?;
        let now = state.now();
        Ok(state
            .tables
            .get(&table.to_string())
            .and_then(|rows| rows.get(key))
            .filter(|row| row.is_live(now))
            .map(|row| row.value.clone()))
    }

    async fn insert_if_absent(
        &self,
        table: &TableName,
        key: &str,
        value: &str,
    ) -> Result<bool, StoreClientError> {
        let mut state = self.lock()?;
        let now = state.now();
        let rows = state.tables.entry(table.to_string()).or_default();
        if rows.get(key).is_some_and(|row| row.is_live(now)) {
            return Ok(false);
        }
        rows.insert(
            key.to_string(),
            MockRow {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn increment(
        &self,
        table: &TableName,
        key: &str,
    ) -> Result<Option<String>, StoreClientError> {
        let mut state = self.lock()?;
        let vanish = state.vanish_before_increment > 0;
        if vanish {
            state.vanish_before_increment -= 1;
        }
        let Some(rows) = state.tables.get_mut(&table.to_string()) else {
            return Ok(None);
        };
        if vanish {
            rows.remove(key);
        }
        let Some(row) = rows.get_mut(key) else {
            return Ok(None);
        };

        let next = parse_bigint(&row.value)?
            .checked_add(1)
            .ok_or_else(|| StoreClientError::IntegerOutOfRange("bigint out of range".to_string()))?;
        row.value = next.to_string();
        Ok(Some(row.value.clone()))
    }

    async fn delete_expired(&self, table: &TableName) -> Result<u64, StoreClientError> {
        let mut state = self.lock()?;
        let now = state.now();
        let Some(rows) = state.tables.get_mut(&table.to_string()) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, row| row.is_live(now));
        Ok((before - rows.len()) as u64)
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreClientError> {
        {
            let mut state = self.lock()?;
            state
                .notifications
                .push((channel.to_string(), payload.to_string()));
        }
        self.router.dispatch(channel, payload);
        Ok(())
    }

    async fn listen(
        &self,
        channel: &str,
        handler: NotificationHandler,
    ) -> Result<ListenerId, StoreClientError> {
        let mut state = self.lock()?;
        let registered = self.router.register(channel, handler)?;
        if registered.first_on_channel {
            state.statements.push(format!("LISTEN {channel}"));
        }
        Ok(registered.listener)
    }

    async fn unlisten(&self, listener: &ListenerId) -> Result<(), StoreClientError> {
        let mut state = self.lock()?;
        if self.router.unregister(listener)? == Some(true) {
            state.statements.push(format!("UNLISTEN {}", listener.channel));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bigint_sentinel_expected_invalid_integer() {
        assert!(matches!(
            parse_bigint("DONE"),
            Err(StoreClientError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_bigint("99999999999999999999"),
            Err(StoreClientError::IntegerOutOfRange(_))
        ));
        assert_eq!(parse_bigint(" 41 ").expect("padded integer should parse"), 41);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn insert_if_absent_expired_row_expected_revived_without_expiry() {
        let store = MockStore::new();
        let table = TableName::default();
        store.insert_row(&table, "k", "7", Some(Utc::now() - TimeDelta::seconds(5)));

        assert!(
            store
                .insert_if_absent(&table, "k", "1")
                .await
                .expect("insert should succeed")
        );
        assert_eq!(
            store.row(&table, "k"),
            Some(MockRow {
                value: "1".to_string(),
                expires_at: None,
            })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unavailable_expected_every_call_fails() {
        let store = MockStore::new();
        let table = TableName::default();
        store.set_unavailable(true);
        assert!(matches!(
            store.select_live(&table, "k").await,
            Err(StoreClientError::Unavailable(_))
        ));
        assert!(matches!(
            store.notify("chan", "x").await,
            Err(StoreClientError::Unavailable(_))
        ));

        store.set_unavailable(false);
        assert_eq!(
            store
                .select_live(&table, "k")
                .await
                .expect("select should succeed"),
            None
        );
    }
}
