use crate::client::StoreClient;
use crate::config::TableName;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodically deletes expired rows. Reads already ignore them; this only reclaims
/// space. Abort the returned handle to stop it.
pub fn spawn_expiry_reaper<C>(client: C, table: TableName, interval: Duration) -> JoinHandle<()>
where
    C: StoreClient + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(table = %table, interval_ms = interval.as_millis() as u64, "expiry reaper started");
        loop {
            ticker.tick().await;
            match client.delete_expired(&table).await {
                Ok(0) => {}
                Ok(deleted) => debug!(table = %table, deleted, "reclaimed expired rows"),
                Err(err) => warn!(table = %table, error = %err, "expired row reclamation failed"),
            }
        }
    })
}
