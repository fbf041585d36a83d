use crate::client::{StoreClient, StoreClientError};
use crate::config::TableName;
use chrono::{DateTime, TimeDelta, Utc};
use streamstate::{SetOptions, StreamStateError, StreamStateResult};
use tracing::debug;

/// Rounds of insert-then-increment before `incr` gives up on a row that keeps
/// disappearing between the two statements.
const MAX_INCR_ATTEMPTS: usize = 3;

/// Value stored by the `incr` that creates a counter.
const INITIAL_COUNTER_VALUE: &str = "1";

/// `get`/`set`/`incr` over a `key | value | expires_at` table.
///
/// Expiry is lazy: rows past `expires_at` stay in the table but are invisible to reads.
#[derive(Clone, Debug)]
pub struct KeyValueEmulation<C> {
    client: C,
    table: TableName,
}

impl<C> KeyValueEmulation<C> {
    pub fn new(client: C, table: TableName) -> Self {
        Self { client, table }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C> KeyValueEmulation<C>
where
    C: StoreClient,
{
    pub async fn set(&self, key: &str, value: &str, options: SetOptions) -> StreamStateResult<()> {
        let expiry = expire_seconds(Utc::now(), options)?;
        self.client
            .upsert(&self.table, key, value, expiry)
            .await
            .map_err(StoreClientError::into_state_error)
    }

    pub async fn get(&self, key: &str) -> StreamStateResult<Option<String>> {
        self.client
            .select_live(&self.table, key)
            .await
            .map_err(StoreClientError::into_state_error)
    }

    /// Insert-if-absent, else one atomic update expression. Never read-then-write.
    pub async fn incr(&self, key: &str) -> StreamStateResult<i64> {
        for attempt in 1..=MAX_INCR_ATTEMPTS {
            let inserted = self
                .client
                .insert_if_absent(&self.table, key, INITIAL_COUNTER_VALUE)
                .await
                .map_err(StoreClientError::into_counter_error)?;
            if inserted {
                return Ok(1);
            }

            let updated = self
                .client
                .increment(&self.table, key)
                .await
                .map_err(StoreClientError::into_counter_error)?;
            match updated {
                Some(value) => {
                    return value
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| StreamStateError::NotAnInteger);
                }
                None => debug!(key, attempt, "counter row vanished before increment; retrying"),
            }
        }

        Err(StreamStateError::Store(Box::new(StoreClientError::Backend(
            format!("counter {key} disappeared on every increment attempt"),
        ))))
    }

    /// Physically deletes rows whose expiry has passed.
    pub async fn purge_expired(&self) -> StreamStateResult<u64> {
        self.client
            .delete_expired(&self.table)
            .await
            .map_err(StoreClientError::into_state_error)
    }
}

/// Relative expiry handed to the store. The deadline itself is computed on the store's
/// clock; `now` only bounds the value to a representable timestamp.
fn expire_seconds(now: DateTime<Utc>, options: SetOptions) -> StreamStateResult<Option<i64>> {
    let Some(seconds) = options.expire_seconds else {
        return Ok(None);
    };
    let out_of_range =
        || StreamStateError::InvalidInput(format!("expiry of {seconds}s is out of range"));

    let seconds = i64::try_from(seconds).map_err(|_| out_of_range())?;
    let delta = TimeDelta::try_seconds(seconds).ok_or_else(out_of_range)?;
    now.checked_add_signed(delta).ok_or_else(out_of_range)?;
    Ok(Some(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_seconds_without_expiry_expected_none() {
        assert_eq!(
            expire_seconds(Utc::now(), SetOptions::default()).expect("expiry should compute"),
            None
        );
    }

    #[test]
    fn expire_seconds_expected_relative_value_passed_through() {
        let now = Utc::now();
        assert_eq!(
            expire_seconds(now, SetOptions::expire_in(90)).expect("expiry should compute"),
            Some(90)
        );
        assert_eq!(
            expire_seconds(now, SetOptions::expire_in(0)).expect("expiry should compute"),
            Some(0)
        );
    }

    #[test]
    fn expire_seconds_huge_value_expected_invalid_input() {
        let result = expire_seconds(Utc::now(), SetOptions::expire_in(u64::MAX));
        assert!(matches!(result, Err(StreamStateError::InvalidInput(_))));

        let past_calendar = SetOptions::expire_in(i64::MAX as u64 / 1000);
        let result = expire_seconds(Utc::now(), past_calendar);
        assert!(matches!(result, Err(StreamStateError::InvalidInput(_))));
    }
}
