//! SQLite-backed storage
//!
//! Three tables back the payment core: the donation ledger (terminal
//! rows, never rewritten), in-flight pending payments, and the
//! single-row derivation counter. The schema is applied on every open
//! and is safe to re-apply.

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Handle to the donation store. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the store at `database_url` and bring the schema up to date
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let path = storage_path(database_url).to_string();

        // A file-backed store may point into a data dir that does not
        // exist on first boot
        if path != ":memory:" {
            if let Some(parent) = Path::new(&path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        info!("Opening donation store at {}", path);
        let conn = Connection::open(&path)?;
        Self::apply_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the ledger, pending payment, and counter tables with
    /// their indexes. Every statement is a no-op when the object
    /// already exists.
    fn apply_schema(conn: &Connection) -> anyhow::Result<()> {
        debug!("Applying donation store schema");

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS donations (
                id TEXT PRIMARY KEY,
                amount_usd REAL NOT NULL,
                display_name TEXT NOT NULL,
                payment_id TEXT UNIQUE NOT NULL,
                payment_method TEXT NOT NULL,
                message TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS pending_payments (
                address TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                expected_amount_btc REAL NOT NULL,
                expected_amount_usd REAL NOT NULL,
                exchange_rate REAL NOT NULL,
                derivation_index INTEGER NOT NULL,
                player_name TEXT,
                use_player_name BOOLEAN NOT NULL DEFAULT 0,
                message TEXT,
                status TEXT NOT NULL,
                txid TEXT,
                detected_at DATETIME,
                scheduled_job_id TEXT,
                created_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_session ON pending_payments(session_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_session_amount ON pending_payments(session_id, expected_amount_usd)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_payments(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_status_expires ON pending_payments(status, expires_at)",
            [],
        )?;

        Ok(())
    }

    /// Shared handle to the underlying connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Release this handle. SQLite closes the connection once the last
    /// clone drops.
    pub async fn close(&self) {
        debug!("Donation store handle released");
    }
}

/// Strip the `sqlite:` scheme, leaving a filesystem path or `:memory:`
fn storage_path(url: &str) -> &str {
    url.strip_prefix("sqlite:").unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_strips_scheme() {
        assert_eq!(storage_path("sqlite:donations.db"), "donations.db");
        assert_eq!(storage_path("sqlite::memory:"), ":memory:");
        assert_eq!(storage_path("/var/lib/donations.db"), "/var/lib/donations.db");
    }

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let count: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_schema_is_reapplicable() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        Database::apply_schema(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('donations', 'pending_payments', 'counters')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
