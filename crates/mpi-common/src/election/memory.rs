//! In-process lock backend
//!
//! Clones share one record, so several coordinators in the same process
//! contend exactly as separate replicas would against a Lease. Used for
//! deterministic election tests and for running without a cluster.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::lock::{LockBackend, LockError, LockName, LockRecord, VersionedRecord};

#[derive(Debug, Default)]
struct Slot {
    current: Option<VersionedRecord>,
    next_version: u64,
}

impl Slot {
    fn store(&mut self, record: &LockRecord) -> VersionedRecord {
        self.next_version += 1;
        let versioned = VersionedRecord {
            record: record.clone(),
            version: self.next_version.to_string(),
        };
        self.current = Some(versioned.clone());
        versioned
    }
}

/// Compare-and-swap lock record held in memory
#[derive(Clone, Debug)]
pub struct MemoryLock {
    name: LockName,
    slot: Arc<Mutex<Slot>>,
}

impl MemoryLock {
    /// Create an empty lock record
    pub fn new(name: LockName) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Current record, if any
    pub fn snapshot(&self) -> Option<VersionedRecord> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }
}

#[async_trait]
impl LockBackend for MemoryLock {
    fn lock_name(&self) -> LockName {
        self.name.clone()
    }

    async fn get(&self) -> Result<Option<VersionedRecord>, LockError> {
        Ok(self.snapshot())
    }

    async fn create(&self, record: &LockRecord) -> Result<VersionedRecord, LockError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.current.is_some() {
            return Err(LockError::Conflict);
        }
        Ok(slot.store(record))
    }

    async fn update(
        &self,
        expected_version: &str,
        record: &LockRecord,
    ) -> Result<VersionedRecord, LockError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match &slot.current {
            Some(current) if current.version == expected_version => Ok(slot.store(record)),
            _ => Err(LockError::Conflict),
        }
    }
}
