use crate::config::TableName;

pub fn create_table_statement(table: &TableName) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         key TEXT PRIMARY KEY, \
         value TEXT NOT NULL, \
         expires_at TIMESTAMPTZ)",
        table.quoted()
    )
}

/// Expiry is computed from the server's `CURRENT_TIMESTAMP`; a `NULL` third parameter
/// stores no expiry.
pub fn upsert_statement(table: &TableName) -> String {
    format!(
        "INSERT INTO {table} (key, value, expires_at) \
         VALUES ($1, $2, CURRENT_TIMESTAMP + $3::bigint * INTERVAL '1 second') \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        table = table.quoted()
    )
}

pub fn drop_table_statement(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {}", table.quoted())
}
