//! Boundary to the transient presence store.
//!
//! The durable store is authoritative; the transient store is a cache for
//! short-lived presence state, so presence-only updates can skip disk
//! entirely. Any durable write purges the transient entry for the same
//! contact. The production implementation lives in shared memory and is
//! owned by another component; the engine only depends on this trait.

use std::collections::HashMap;
use std::sync::Mutex;

use cardbox_core::{ContactId, Detail, Timestamp};

pub trait TransientStore: Send + Sync {
    /// Replaces the transient details held for a contact.
    fn set_transient_details(
        &self,
        contact_id: ContactId,
        last_modified: Timestamp,
        details: Vec<Detail>,
    );

    /// Drops the entries for the given contacts, if present.
    fn remove_transient_details(&self, ids: &[ContactId]);

    /// Returns the stored entry for a contact.
    fn transient_details(&self, contact_id: ContactId) -> Option<(Timestamp, Vec<Detail>)>;

    /// Timestamps of every held entry, for readers that must prefer
    /// transient data when it is newer than durable data.
    fn populate_timestamps(&self) -> Vec<(ContactId, Timestamp)>;
}

/// Process-local implementation, used by default and in tests.
#[derive(Default)]
pub struct MemoryTransientStore {
    entries: Mutex<HashMap<ContactId, (Timestamp, Vec<Detail>)>>,
}

impl TransientStore for MemoryTransientStore {
    fn set_transient_details(
        &self,
        contact_id: ContactId,
        last_modified: Timestamp,
        details: Vec<Detail>,
    ) {
        self.entries
            .lock()
            .expect("Locking failed")
            .insert(contact_id, (last_modified, details));
    }

    fn remove_transient_details(&self, ids: &[ContactId]) {
        let mut entries = self.entries.lock().expect("Locking failed");
        for id in ids {
            entries.remove(id);
        }
    }

    fn transient_details(&self, contact_id: ContactId) -> Option<(Timestamp, Vec<Detail>)> {
        self.entries
            .lock()
            .expect("Locking failed")
            .get(&contact_id)
            .cloned()
    }

    fn populate_timestamps(&self) -> Vec<(ContactId, Timestamp)> {
        self.entries
            .lock()
            .expect("Locking failed")
            .iter()
            .map(|(id, (ts, _))| (*id, *ts))
            .collect()
    }
}
