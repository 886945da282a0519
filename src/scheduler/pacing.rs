//! Per-mailbox send pacing.
//!
//! The ledger stores, per mailbox, the next free send slot as a lease with
//! an expiry. A group of candidates reserves a run of slots with a single
//! compare-and-set so two schedulers can never hand out the same slot.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::PacingPolicy;
use crate::error::DatabaseError;

/// Next free send slot for one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLease {
    pub next_slot: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SlotLease {
    /// A lease for `next_slot` that stays valid for `ttl` past the later of `now` and the slot.
    pub fn new(next_slot: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            next_slot,
            expires_at: next_slot.max(now) + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// First slot a new group may use: the stored slot, or `now` if it is
    /// missing, expired or already in the past.
    pub fn anchor(lease: Option<&SlotLease>, now: DateTime<Utc>) -> DateTime<Utc> {
        match lease {
            Some(lease) if !lease.is_expired(now) => lease.next_slot.max(now),
            _ => now,
        }
    }
}

/// Shared store of per-mailbox slot leases.
#[async_trait]
pub trait PacingLedger: Send + Sync {
    /// Stored lease, expired or not.
    async fn get(&self, mailbox_id: Uuid) -> Result<Option<SlotLease>, DatabaseError>;

    /// Unconditional write.
    async fn set(&self, mailbox_id: Uuid, lease: &SlotLease) -> Result<(), DatabaseError>;

    /// Write `lease` only if the stored value still equals `expected`
    /// (`None` meaning no entry). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        mailbox_id: Uuid,
        expected: Option<&SlotLease>,
        lease: &SlotLease,
    ) -> Result<bool, DatabaseError>;

    /// Drop leases that expired before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;
}

/// Process-local ledger.
#[derive(Default)]
pub struct MemoryPacingLedger {
    leases: Mutex<HashMap<Uuid, SlotLease>>,
}

impl MemoryPacingLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PacingLedger for MemoryPacingLedger {
    async fn get(&self, mailbox_id: Uuid) -> Result<Option<SlotLease>, DatabaseError> {
        Ok(self.leases.lock().await.get(&mailbox_id).copied())
    }

    async fn set(&self, mailbox_id: Uuid, lease: &SlotLease) -> Result<(), DatabaseError> {
        self.leases.lock().await.insert(mailbox_id, *lease);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        mailbox_id: Uuid,
        expected: Option<&SlotLease>,
        lease: &SlotLease,
    ) -> Result<bool, DatabaseError> {
        let mut leases = self.leases.lock().await;
        if leases.get(&mailbox_id) != expected {
            return Ok(false);
        }
        leases.insert(mailbox_id, *lease);
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired(now));
        Ok((before - leases.len()) as u64)
    }
}

/// Gap to leave after a send for a campaign with the given fixed interval.
pub fn pacing_gap<R: Rng>(policy: &PacingPolicy, interval_minutes: u32, rng: &mut R) -> Duration {
    match policy {
        PacingPolicy::Fixed => Duration::minutes(i64::from(interval_minutes.max(1))),
        PacingPolicy::Randomized { min, max } => {
            let secs = rng.gen_range(min.as_secs()..=max.as_secs().max(min.as_secs()));
            Duration::seconds(secs as i64)
        }
    }
}

/// Lay out consecutive slots starting at `anchor`.
///
/// Returns one slot per gap and the next free slot after the last one.
pub fn assign_slots(anchor: DateTime<Utc>, gaps: &[Duration]) -> (Vec<DateTime<Utc>>, DateTime<Utc>) {
    let mut cursor = anchor;
    let mut slots = Vec::with_capacity(gaps.len());
    for gap in gaps {
        slots.push(cursor);
        cursor += *gap;
    }
    (slots, cursor)
}

/// Relative delay until `slot`, floored at zero.
pub fn delay_until(slot: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (slot - now).to_std().unwrap_or(std::time::Duration::ZERO)
}
