//! Ownership reconciliation for single-holder standards (ERC721, CryptoPunks).
//!
//! Each message carries a batch of transfers. Only the newest transfer per
//! token matters for the owner table, and it only lands if it is newer than
//! what the store already holds. Replaying a block, or receiving blocks out of
//! order, therefore never moves ownership backwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::etl::event::{TransferEvent, Version};
use crate::storage::{NftStore, OwnerRecord, StoreError, TokenKey};

/// Outcome counts for one reconciled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Winners older than the stored owner.
    pub stale: usize,
    /// Winners equal to the stored owner (replays).
    pub unchanged: usize,
}

impl ReconcileSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

pub struct OwnershipReconciler {
    store: Arc<dyn NftStore>,
}

impl OwnershipReconciler {
    pub fn new(store: Arc<dyn NftStore>) -> Self {
        Self { store }
    }

    /// Latest event per token key, in first-seen key order.
    ///
    /// Ties on version keep the earlier event.
    pub fn winners(events: &[TransferEvent]) -> Vec<&TransferEvent> {
        let mut order: Vec<TokenKey> = Vec::new();
        let mut latest: HashMap<TokenKey, &TransferEvent> = HashMap::new();

        for event in events {
            let key = event.key();
            match latest.get(&key) {
                Some(current) if current.version() >= event.version() => {}
                Some(_) => {
                    latest.insert(key, event);
                }
                None => {
                    order.push(key);
                    latest.insert(key, event);
                }
            }
        }

        order.iter().filter_map(|key| latest.get(key).copied()).collect()
    }

    /// Applies one standard's transfers to the owner table.
    pub async fn reconcile(&self, events: &[TransferEvent]) -> Result<ReconcileSummary, StoreError> {
        let mut summary = ReconcileSummary::default();
        if events.is_empty() {
            return Ok(summary);
        }

        let winners = Self::winners(events);
        let keys: Vec<TokenKey> = winners.iter().map(|event| event.key()).collect();

        let existing: HashMap<TokenKey, Version> = self
            .store
            .find_owners(&keys)
            .await?
            .into_iter()
            .map(|owner| (owner.key(), owner.version))
            .collect();

        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for winner in winners {
            let incoming = winner.version();
            match existing.get(&winner.key()) {
                None => inserts.push(OwnerRecord::from_event(winner)),
                Some(stored) if *stored > incoming => summary.stale += 1,
                Some(stored) if *stored == incoming => summary.unchanged += 1,
                Some(_) => updates.push(OwnerRecord::from_event(winner)),
            }
        }

        if !inserts.is_empty() {
            summary.inserted = self.store.upsert_owners(&inserts).await?;
        }
        if !updates.is_empty() {
            summary.updated = self.store.upsert_owners(&updates).await?;
        }

        // A concurrent writer may have landed a newer owner between the read
        // and the guarded write; those rows count as stale.
        summary.stale += inserts.len().saturating_sub(summary.inserted);
        summary.stale += updates.len().saturating_sub(summary.updated);

        tracing::debug!(
            target: "nftwatch::reconcile",
            events = events.len(),
            keys = keys.len(),
            inserted = summary.inserted,
            updated = summary.updated,
            stale = summary.stale,
            unchanged = summary.unchanged,
            "Reconciled owners"
        );

        Ok(summary)
    }
}
