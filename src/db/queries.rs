//! Database queries

use super::{Database, DonationModel, PaymentStatus, PendingPaymentModel};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::info;

const PENDING_COLUMNS: &str = "address, session_id, expected_amount_btc, expected_amount_usd, exchange_rate, derivation_index, player_name, use_player_name, message, status, txid, detected_at, scheduled_job_id, created_at, expires_at";

fn map_pending_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingPaymentModel> {
    let status_str: String = row.get(9)?;
    let status = PaymentStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown payment status: {}", status_str).into(),
        )
    })?;
    Ok(PendingPaymentModel {
        address: row.get(0)?,
        session_id: row.get(1)?,
        expected_amount_btc: row.get(2)?,
        expected_amount_usd: row.get(3)?,
        exchange_rate: row.get(4)?,
        derivation_index: row.get(5)?,
        player_name: row.get(6)?,
        use_player_name: row.get::<_, i32>(7)? != 0,
        message: row.get(8)?,
        status,
        txid: row.get(10)?,
        detected_at: row.get(11)?,
        scheduled_job_id: row.get(12)?,
        created_at: row.get(13)?,
        expires_at: row.get(14)?,
    })
}

/// Derivation counter queries
pub struct CounterQueries<'a> {
    db: &'a Database,
}

impl<'a> CounterQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Atomically read-increment the derivation counter and return the
    /// prior value. The counter row is created lazily on first use.
    /// The held connection lock is the serialization point that makes
    /// every handed-out index unique.
    pub async fn next_derivation_index(&self) -> Result<i64> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO counters (key, value) VALUES ('next_derivation_index', 0)",
            [],
        )?;
        let value: i64 = conn.query_row(
            "SELECT value FROM counters WHERE key = 'next_derivation_index'",
            [],
            |row| row.get(0),
        )?;
        conn.execute(
            "UPDATE counters SET value = value + 1 WHERE key = 'next_derivation_index'",
            [],
        )?;
        Ok(value)
    }
}

/// Pending payment queries
pub struct PendingPaymentQueries<'a> {
    db: &'a Database,
}

impl<'a> PendingPaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new pending payment. Fails if the address already has a
    /// row (addresses are single-use).
    pub async fn insert(&self, payment: &PendingPaymentModel) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO pending_payments (address, session_id, expected_amount_btc, expected_amount_usd, exchange_rate, derivation_index, player_name, use_player_name, message, status, txid, detected_at, scheduled_job_id, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            rusqlite::params![
                &payment.address,
                &payment.session_id,
                payment.expected_amount_btc,
                payment.expected_amount_usd,
                payment.exchange_rate,
                payment.derivation_index,
                payment.player_name.as_deref(),
                payment.use_player_name,
                payment.message.as_deref(),
                payment.status.as_str(),
                payment.txid.as_deref(),
                payment.detected_at.map(|d| d.to_rfc3339()),
                payment.scheduled_job_id.as_deref(),
                &payment.created_at.to_rfc3339(),
                &payment.expires_at.to_rfc3339(),
            ],
        )?;
        info!(
            "DB: Inserted pending payment: address={}, session={}, usd={}, index={}",
            payment.address,
            payment.session_id,
            payment.expected_amount_usd,
            payment.derivation_index
        );
        Ok(())
    }

    /// Get a pending payment by address
    pub async fn get_by_address(&self, address: &str) -> Result<Option<PendingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_payments WHERE address = ?1",
            PENDING_COLUMNS
        ))?;
        let result = stmt
            .query_row(rusqlite::params![address], map_pending_row)
            .optional()?;
        Ok(result)
    }

    /// Find the unexpired, non-terminal payment matching (session,
    /// amount). This is the idempotency key for address generation.
    pub async fn find_active_by_session(
        &self,
        session_id: &str,
        amount_usd: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_payments WHERE session_id = ?1 AND expected_amount_usd = ?2 AND status IN ('initialized', 'pending') AND expires_at > ?3 ORDER BY created_at DESC LIMIT 1",
            PENDING_COLUMNS
        ))?;
        let result = stmt
            .query_row(
                rusqlite::params![session_id, amount_usd, now.to_rfc3339()],
                map_pending_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Record the transaction first seen for this address and upgrade
    /// `initialized` to `pending`. A repeat call with the same txid is
    /// a no-op, so `detected_at` keeps the first observation time.
    pub async fn attach_txid(&self, address: &str, txid: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let updated = conn.execute(
            r#"
            UPDATE pending_payments
            SET txid = ?1, detected_at = ?2,
                status = CASE status WHEN 'initialized' THEN 'pending' ELSE status END
            WHERE address = ?3 AND status IN ('initialized', 'pending')
              AND (txid IS NULL OR txid != ?1)
            "#,
            rusqlite::params![txid, now.to_rfc3339(), address],
        )?;
        if updated > 0 {
            info!("DB: Attached txid {} to pending payment {}", txid, address);
        }
        Ok(())
    }

    /// Update status unconditionally (terminal transitions)
    pub async fn set_status(&self, address: &str, status: PaymentStatus) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE pending_payments SET status = ?1 WHERE address = ?2",
            rusqlite::params![status.as_str(), address],
        )?;
        info!(
            "DB: Updated pending payment status: address={}, status={}",
            address,
            status.as_str()
        );
        Ok(())
    }

    /// Client-signalled expiry: only an `initialized` row owned by the
    /// session transitions; anything else is a no-op. Returns whether a
    /// row changed.
    pub async fn mark_expired_if_initialized(
        &self,
        address: &str,
        session_id: &str,
    ) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE pending_payments SET status = 'expired' WHERE address = ?1 AND session_id = ?2 AND status = 'initialized'",
            rusqlite::params![address, session_id],
        )?;
        if updated > 0 {
            info!("DB: Marked pending payment expired: address={}", address);
        }
        Ok(updated > 0)
    }

    /// Persist the scheduled monitor job id on the row
    pub async fn set_job_id(&self, address: &str, job_id: &str) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE pending_payments SET scheduled_job_id = ?1 WHERE address = ?2",
            rusqlite::params![job_id, address],
        )?;
        Ok(())
    }

    /// All non-terminal payments still inside their window, for
    /// startup reconciliation
    pub async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<PendingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_payments WHERE status IN ('initialized', 'pending') AND expires_at > ?1 ORDER BY created_at ASC",
            PENDING_COLUMNS
        ))?;
        let rows = stmt.query_map(rusqlite::params![now.to_rfc3339()], map_pending_row)?;
        let mut payments = Vec::new();
        for row in rows {
            payments.push(row?);
        }
        Ok(payments)
    }

    /// Expire every row with the given status whose window has closed.
    /// Returns the number of rows transitioned.
    pub async fn expire_overdue(
        &self,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE pending_payments SET status = 'expired' WHERE status = ?1 AND expires_at <= ?2",
            rusqlite::params![status.as_str(), now.to_rfc3339()],
        )?;
        Ok(updated)
    }

    /// Delete confirmed rows; the donation ledger is the authoritative
    /// record once confirmation lands.
    pub async fn delete_confirmed(&self) -> Result<usize> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM pending_payments WHERE status = 'confirmed'",
            [],
        )?;
        Ok(deleted)
    }

    /// Delete expired rows created before the cutoff
    pub async fn delete_expired_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM pending_payments WHERE status = 'expired' AND created_at <= ?1",
            rusqlite::params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    /// Delete a pending payment by address
    pub async fn delete(&self, address: &str) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "DELETE FROM pending_payments WHERE address = ?1",
            rusqlite::params![address],
        )?;
        info!("DB: Deleted pending payment: address={}", address);
        Ok(())
    }
}

/// Donation ledger queries
pub struct DonationQueries<'a> {
    db: &'a Database,
}

impl<'a> DonationQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a donation, deduplicated by `payment_id`.
    ///
    /// Returns `true` when the row was inserted and `false` when a
    /// donation for this payment already exists. Concurrent writers
    /// race on the unique index; the first wins and the second sees
    /// `false` without mutating anything.
    pub async fn create(
        &self,
        payment_id: &str,
        payment_method: &str,
        amount_usd: f64,
        display_name: &str,
        message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO donations (id, amount_usd, display_name, payment_id, payment_method, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                amount_usd,
                display_name,
                payment_id,
                payment_method,
                message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if inserted > 0 {
            info!(
                "DB: Created donation: payment_id={}, usd={}, name={}",
                payment_id, amount_usd, display_name
            );
        }
        Ok(inserted > 0)
    }

    /// Get a donation by its payment reference
    pub async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<DonationModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, amount_usd, display_name, payment_id, payment_method, message, created_at FROM donations WHERE payment_id = ?1",
        )?;
        let result = stmt
            .query_row(rusqlite::params![payment_id], |row| {
                Ok(DonationModel {
                    id: row.get(0)?,
                    amount_usd: row.get(1)?,
                    display_name: row.get(2)?,
                    payment_id: row.get(3)?,
                    payment_method: row.get(4)?,
                    message: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .optional()?;
        Ok(result)
    }

    /// Most recent donations, newest first
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<DonationModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, amount_usd, display_name, payment_id, payment_method, message, created_at FROM donations ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit], |row| {
            Ok(DonationModel {
                id: row.get(0)?,
                amount_usd: row.get(1)?,
                display_name: row.get(2)?,
                payment_id: row.get(3)?,
                payment_method: row.get(4)?,
                message: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut donations = Vec::new();
        for row in rows {
            donations.push(row?);
        }
        Ok(donations)
    }
}
