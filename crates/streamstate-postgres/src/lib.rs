#![doc = r#"
Postgres-backed adapters for the `streamstate` capability traits.

Operation mapping:

| Capability method | Postgres statement |
| --- | --- |
| `Publisher::set` | `INSERT ... VALUES ($1, $2, CURRENT_TIMESTAMP + $3::bigint * INTERVAL '1 second') ON CONFLICT (key) DO UPDATE` |
| `Publisher::get` | `SELECT value ... WHERE expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP` |
| `Publisher::incr` (new or expired key) | `INSERT ... ON CONFLICT (key) DO UPDATE ... WHERE expires_at <= CURRENT_TIMESTAMP` |
| `Publisher::incr` (live key) | `UPDATE ... SET value = (value::bigint + 1)::text RETURNING value` |
| `Publisher::publish` | `SELECT pg_notify($1, $2)` |
| `Subscriber::subscribe` | `LISTEN "<hashed channel>"` (first listener per channel) |
| `Subscriber::unsubscribe` | `UNLISTEN "<hashed channel>"` (last listener per channel) |
| `PostgresPublisher::purge_expired` | `DELETE ... WHERE expires_at <= CURRENT_TIMESTAMP` |

Implementation notes:
- Channel names pass through `streamstate::normalize_channel` before reaching the server.
- Expiry deadlines and reads both use the server clock. Expired rows are filtered at read time; `spawn_expiry_reaper` reclaims them in the background.
- A failed integer cast in `incr` surfaces as `StreamStateError::NotAnInteger`.
- `publish` always reports `0` receivers.
"#]

pub mod adapter;
pub mod client;
pub mod config;
pub mod kv;
pub mod notify;
pub mod postgres;
pub mod reaper;
pub mod router;
pub mod schema;
pub mod testing;

pub use adapter::{PostgresPublisher, PostgresSubscriber, create_adapters};
pub use client::{ListenerId, NotificationHandler, StoreClient, StoreClientError};
pub use config::{DEFAULT_POSTGRES_URL, DEFAULT_TABLE_NAME, PostgresConfig, TableName};
pub use kv::KeyValueEmulation;
pub use notify::{ChannelSubscriptions, SubscriptionRegistry, publish};
pub use postgres::PostgresStoreClient;
pub use reaper::spawn_expiry_reaper;
pub use router::{NotificationRouter, Registered};
pub use testing::{MockRow, MockStore};
