use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use log::warn;

use crate::types::{Entry, ObjectId};

/// Per-object record while a resolution is outstanding.
///
/// `destination: None` means a plain lookup is in flight; `Some(entry)` means
/// the object is migrating out to `entry.server`. The record is owned
/// exclusively by the [`InTransitTable`].
#[derive(Debug, Clone, Copy)]
pub struct TransitRecord {
    pub destination: Option<Entry>,
    pub admitted_at: Instant,
}

/// The per-object concurrency-control structure.
///
/// Tracks objects currently being looked up or migrated out, plus objects
/// being received (pending ack). The table is the per-key serialization
/// point: completions for the same object are ordered by the
/// migration-wins-over-stale-lookup rule in [`complete_if_lookup`], not by
/// any global lock over the resolution path.
///
/// [`complete_if_lookup`]: InTransitTable::complete_if_lookup
pub struct InTransitTable {
    records: Mutex<HashMap<ObjectId, TransitRecord>>,
    receiving: Mutex<HashMap<ObjectId, Entry>>,
}

impl InTransitTable {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            receiving: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a plain-lookup record iff the object has no record yet.
    ///
    /// Returns whether this caller is the first and therefore responsible for
    /// issuing the store GET; later concurrent callers get `false` and simply
    /// wait for the completion callback. This is the coalescing mechanism.
    pub fn begin_lookup_if_absent(&self, id: ObjectId) -> bool {
        let mut records = self.records.lock().expect("transit mutex poisoned");
        if records.contains_key(&id) {
            return false;
        }
        records.insert(
            id,
            TransitRecord {
                destination: None,
                admitted_at: Instant::now(),
            },
        );
        true
    }

    /// Unconditionally installs a migrating-out record.
    ///
    /// May overwrite a concurrent plain-lookup record (migration always
    /// wins). Must not be issued while the object is already migrating
    /// elsewhere; that indicates a caller bug upstream, so it is logged
    /// rather than silently absorbed.
    pub fn begin_migrate_out(&self, id: ObjectId, destination: Entry) {
        let mut records = self.records.lock().expect("transit mutex poisoned");
        if let Some(previous) = records.get(&id) {
            if let Some(prior_dest) = previous.destination {
                warn!(
                    "object {} migrating to {} while already migrating to {}",
                    id, destination.server, prior_dest.server
                );
            }
        }
        records.insert(
            id,
            TransitRecord {
                destination: Some(destination),
                admitted_at: Instant::now(),
            },
        );
    }

    /// Removes the record only if it is a plain lookup.
    ///
    /// If a migration supervened since the lookup was admitted, the
    /// migration's record is left untouched and `false` is returned: a stale
    /// lookup completion must never clear a live migration.
    pub fn complete_if_lookup(&self, id: ObjectId) -> bool {
        let mut records = self.records.lock().expect("transit mutex poisoned");
        match records.get(&id) {
            Some(record) if record.destination.is_none() => {
                records.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Removes the record unconditionally (ack received, ownership settled).
    pub fn complete_migration(&self, id: ObjectId) -> Option<TransitRecord> {
        let mut records = self.records.lock().expect("transit mutex poisoned");
        records.remove(&id)
    }

    /// The destination entry if the object is migrating out of this server.
    pub fn migrating_out(&self, id: ObjectId) -> Option<Entry> {
        let records = self.records.lock().expect("transit mutex poisoned");
        records.get(&id).and_then(|record| record.destination)
    }

    /// Marks an inbound migration: the ownership write is in flight and the
    /// ack has not yet been dispatched to the old owner.
    pub fn begin_receiving(&self, id: ObjectId, entry: Entry) {
        let mut receiving = self.receiving.lock().expect("receiving mutex poisoned");
        receiving.insert(id, entry);
    }

    /// Clears the inbound-migration mark once the ack has actually been
    /// dispatched (accepted by the transport), not merely queued.
    pub fn finish_receiving(&self, id: ObjectId) -> bool {
        let mut receiving = self.receiving.lock().expect("receiving mutex poisoned");
        receiving.remove(&id).is_some()
    }

    /// The local entry for an object still pending its inbound-migration ack.
    pub fn receiving_entry(&self, id: ObjectId) -> Option<Entry> {
        let receiving = self.receiving.lock().expect("receiving mutex poisoned");
        receiving.get(&id).copied()
    }

    pub fn is_receiving(&self, id: ObjectId) -> bool {
        self.receiving_entry(id).is_some()
    }
}

impl Default for InTransitTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> ObjectId {
        ObjectId::from_u128(n)
    }

    #[test]
    fn first_lookup_wins_later_callers_coalesce() {
        let table = InTransitTable::new();
        assert!(table.begin_lookup_if_absent(id(1)));
        assert!(!table.begin_lookup_if_absent(id(1)));
        assert!(table.begin_lookup_if_absent(id(2)));
    }

    #[test]
    fn complete_if_lookup_removes_plain_lookup() {
        let table = InTransitTable::new();
        table.begin_lookup_if_absent(id(1));
        assert!(table.complete_if_lookup(id(1)));
        // Gone now, so a second completion is a no-op.
        assert!(!table.complete_if_lookup(id(1)));
        assert!(table.begin_lookup_if_absent(id(1)));
    }

    #[test]
    fn migration_overrides_lookup_and_survives_stale_completion() {
        let table = InTransitTable::new();
        table.begin_lookup_if_absent(id(1));
        table.begin_migrate_out(id(1), Entry::new(7, 3.0));

        // The lookup's late completion must not clear the migration record.
        assert!(!table.complete_if_lookup(id(1)));
        assert_eq!(table.migrating_out(id(1)), Some(Entry::new(7, 3.0)));

        let record = table.complete_migration(id(1)).expect("record present");
        assert_eq!(record.destination, Some(Entry::new(7, 3.0)));
        assert_eq!(table.migrating_out(id(1)), None);
    }

    #[test]
    fn receiving_set_tracks_pending_acks() {
        let table = InTransitTable::new();
        assert!(!table.is_receiving(id(9)));
        table.begin_receiving(id(9), Entry::new(2, 1.5));
        assert_eq!(table.receiving_entry(id(9)), Some(Entry::new(2, 1.5)));
        assert!(table.finish_receiving(id(9)));
        assert!(!table.finish_receiving(id(9)));
        assert!(!table.is_receiving(id(9)));
    }
}
