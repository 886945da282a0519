//! Pacing ledger on the `pacing_ledger` table.
//!
//! Shared by every scheduler that points at the same database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::scheduler::pacing::{PacingLedger, SlotLease};
use crate::store::libsql_backend::{LibSqlBackend, fmt_ts, query_err, ts_col};

#[async_trait]
impl PacingLedger for LibSqlBackend {
    async fn get(&self, mailbox_id: Uuid) -> Result<Option<SlotLease>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT next_slot, expires_at FROM pacing_ledger WHERE mailbox_id = ?1",
                params![mailbox_id.to_string()],
            )
            .await
            .map_err(|e| query_err("ledger_get", e))?;

        match rows.next().await.map_err(|e| query_err("ledger_get", e))? {
            Some(row) => Ok(Some(SlotLease {
                next_slot: ts_col(&row, 0)?,
                expires_at: ts_col(&row, 1)?,
            })),
            None => Ok(None),
        }
    }

    async fn set(&self, mailbox_id: Uuid, lease: &SlotLease) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO pacing_ledger (mailbox_id, next_slot, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(mailbox_id) DO UPDATE SET next_slot = excluded.next_slot, expires_at = excluded.expires_at",
                params![
                    mailbox_id.to_string(),
                    fmt_ts(lease.next_slot),
                    fmt_ts(lease.expires_at)
                ],
            )
            .await
            .map_err(|e| query_err("ledger_set", e))?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        mailbox_id: Uuid,
        expected: Option<&SlotLease>,
        lease: &SlotLease,
    ) -> Result<bool, DatabaseError> {
        let changed = match expected {
            None => self
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO pacing_ledger (mailbox_id, next_slot, expires_at) VALUES (?1, ?2, ?3)",
                    params![
                        mailbox_id.to_string(),
                        fmt_ts(lease.next_slot),
                        fmt_ts(lease.expires_at)
                    ],
                )
                .await
                .map_err(|e| query_err("ledger_cas", e))?,
            Some(current) => self
                .conn()
                .execute(
                    "UPDATE pacing_ledger SET next_slot = ?2, expires_at = ?3
                     WHERE mailbox_id = ?1 AND next_slot = ?4 AND expires_at = ?5",
                    params![
                        mailbox_id.to_string(),
                        fmt_ts(lease.next_slot),
                        fmt_ts(lease.expires_at),
                        fmt_ts(current.next_slot),
                        fmt_ts(current.expires_at)
                    ],
                )
                .await
                .map_err(|e| query_err("ledger_cas", e))?,
        };
        Ok(changed > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM pacing_ledger WHERE expires_at <= ?1",
                params![fmt_ts(now)],
            )
            .await
            .map_err(|e| query_err("ledger_purge", e))
    }
}
