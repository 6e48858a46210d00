//! Concurrent identity → record index.
//!
//! Memory-only: lives for the process lifetime and is rebuilt by a full
//! rescan at startup. Shared between the ingestion loop (writer) and HTTP
//! handlers (readers) behind an `Arc`.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::crypto::Identity;
use crate::record::FileRecord;

#[derive(Default)]
pub struct MetadataStore {
    records: RwLock<HashMap<Identity, FileRecord>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `identity`.
    pub fn put(&self, identity: Identity, record: FileRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(identity, record);
    }

    /// `None` when the identity is not live.
    pub fn get(&self, identity: &Identity) -> Option<FileRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    /// Remove and return the record, if any.
    pub fn delete(&self, identity: &Identity) -> Option<FileRecord> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(identity)
    }

    /// Visit a point-in-time snapshot of every live record.
    ///
    /// The lock is released before the visitor runs, so the visitor may call
    /// back into the store. Mutations racing with the visit are not reflected.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&FileRecord),
    {
        for record in self.snapshot() {
            visitor(&record);
        }
    }

    pub fn snapshot(&self) -> Vec<FileRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
