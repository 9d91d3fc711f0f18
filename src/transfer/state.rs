//! Transfer Registry: authoritative in-memory state per transfer id

use super::types::{TransferFilter, TransferId, TransferPage, TransferRecord, TransferStatus};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct Entries {
    records: HashMap<TransferId, TransferRecord>,
    /// Submission order
    order: Vec<TransferId>,
}

/// Why a status update was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRejected {
    UnknownTransfer,
    AlreadyTerminal,
    /// `Waiting` after the transfer already started.
    BackToWaiting,
    BytesWentBackwards { current: u64, proposed: u64 },
}

pub struct TransferRegistry {
    entries: RwLock<Entries>,
    events: broadcast::Sender<TransferRecord>,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(Entries::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Every accepted change, as the full record after the change.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferRecord> {
        self.events.subscribe()
    }

    fn publish(&self, record: TransferRecord) {
        // No subscribers is fine
        let _ = self.events.send(record);
    }

    /// Register a transfer. An existing record with the same id is replaced.
    pub fn insert(&self, record: TransferRecord) {
        {
            let mut entries = self.write();
            if !entries.records.contains_key(&record.id) {
                entries.order.push(record.id.clone());
            }
            entries.records.insert(record.id.clone(), record.clone());
        }
        debug!("transfer_registered: {} -> {}", record.id, record.key);
        self.publish(record);
    }

    /// Apply a status change. Terminal records never change again, a started
    /// transfer never returns to `Waiting` and `bytes_uploaded` never
    /// decreases. Progress is clamped to the reported total.
    pub fn update_status(&self, id: &str, status: TransferStatus) -> Result<(), UpdateRejected> {
        let record = {
            let mut entries = self.write();
            let record = entries
                .records
                .get_mut(id)
                .ok_or(UpdateRejected::UnknownTransfer)?;
            if record.status.is_terminal() {
                return Err(UpdateRejected::AlreadyTerminal);
            }
            if status == TransferStatus::Waiting && record.status != TransferStatus::Waiting {
                return Err(UpdateRejected::BackToWaiting);
            }
            let status = match status {
                TransferStatus::Uploading {
                    bytes_uploaded,
                    total_bytes,
                    speed,
                    ..
                } => TransferStatus::uploading(bytes_uploaded, total_bytes, speed),
                other => other,
            };
            if let (Some(current), Some(proposed)) =
                (record.status.bytes_uploaded(), status.bytes_uploaded())
            {
                if proposed < current {
                    return Err(UpdateRejected::BytesWentBackwards { current, proposed });
                }
            }
            record.status = status;
            record.clone()
        };

        match &record.status {
            TransferStatus::Error { message, code } => {
                warn!("transfer_status: {} -> error code={} {}", record.id, code, message)
            }
            TransferStatus::Uploading { .. } => {}
            other => info!("transfer_status: {} -> {}", record.id, other),
        }
        self.publish(record);
        Ok(())
    }

    /// Record the shareable URL; ignored once the transfer is terminal.
    pub fn set_url(&self, id: &str, url: String) -> bool {
        let record = {
            let mut entries = self.write();
            match entries.records.get_mut(id) {
                Some(record) if !record.status.is_terminal() => {
                    record.url = Some(url);
                    record.clone()
                }
                _ => return false,
            }
        };
        self.publish(record);
        true
    }

    pub fn get(&self, id: &str) -> Option<TransferRecord> {
        self.read().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-based page of records matching `filter`, in submission order.
    pub fn page(&self, filter: TransferFilter, page: usize, page_size: usize) -> TransferPage {
        let page_size = page_size.max(1);
        let entries = self.read();
        let matching: Vec<&TransferRecord> = entries
            .order
            .iter()
            .filter_map(|id| entries.records.get(id))
            .filter(|record| filter.matches(&record.status))
            .collect();

        TransferPage {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(page.saturating_mul(page_size))
                .take(page_size)
                .cloned()
                .collect(),
            page,
            page_size,
        }
    }

    /// Ids of transfers that have not reached a terminal state.
    pub fn active_ids(&self) -> Vec<TransferId> {
        let entries = self.read();
        entries
            .order
            .iter()
            .filter(|id| {
                entries
                    .records
                    .get(*id)
                    .is_some_and(|r| !r.status.is_terminal())
            })
            .cloned()
            .collect()
    }

    /// Remove one terminal record. Active transfers cannot be removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.write();
        match entries.records.get(id) {
            Some(record) if record.status.is_terminal() => {
                entries.records.remove(id);
                entries.order.retain(|other| other != id);
                true
            }
            _ => false,
        }
    }

    /// Drop every terminal record, returning the removed ids.
    pub fn clear_completed(&self) -> Vec<TransferId> {
        let mut entries = self.write();
        let Entries { records, order } = &mut *entries;
        let mut removed = Vec::new();
        order.retain(|id| {
            let terminal = records.get(id).is_some_and(|r| r.status.is_terminal());
            if terminal {
                records.remove(id);
                removed.push(id.clone());
            }
            !terminal
        });
        if !removed.is_empty() {
            info!("transfer_registry: cleared {} completed transfers", removed.len());
        }
        removed
    }

    /// Load persisted terminal records, skipping ids already present.
    pub fn restore(&self, history: Vec<TransferRecord>) -> usize {
        let mut entries = self.write();
        let mut restored = 0;
        for record in history {
            if !record.status.is_terminal() || entries.records.contains_key(&record.id) {
                continue;
            }
            entries.order.push(record.id.clone());
            entries.records.insert(record.id.clone(), record);
            restored += 1;
        }
        restored
    }
}
