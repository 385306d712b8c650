//! Memory slave interface and the default implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::memory::codes;
use crate::memory::transaction::Transaction;

/// Serves register-access transactions.
///
/// A slave must call [`Transaction::complete`] exactly once for every
/// transaction it has accepted, success or failure; a missed completion is
/// caught by the master's timeout.
pub trait MemorySlave: Send + Sync {
    /// Minimum access size in bytes.
    fn min_access(&self) -> u32;

    /// Maximum transaction size in bytes.
    fn max_access(&self) -> u32;

    /// Base address of the served window.
    fn address(&self) -> u64 {
        0
    }

    /// Serve one transaction; may complete inline or defer.
    fn do_transaction(&self, txn: Arc<Transaction>);
}

/// Default slave behaviour for concrete slaves to delegate to.
///
/// Reports construction-time access bounds, rejects every transaction
/// with `UNSUPPORTED`, and tracks accepted transactions through weak
/// references so a deferring slave can look them up by id later. Weak
/// entries that no longer upgrade are evicted during lookup.
pub struct SlaveCore {
    min: u32,
    max: u32,
    tracked: Mutex<HashMap<u32, Weak<Transaction>>>,
}

impl SlaveCore {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Record a transaction this slave has accepted.
    pub fn add_transaction(&self, txn: &Arc<Transaction>) {
        self.tracked
            .lock()
            .unwrap()
            .insert(txn.id(), Arc::downgrade(txn));
    }

    /// Look up a tracked transaction, sweeping dead entries.
    pub fn get_transaction(&self, id: u32) -> Option<Arc<Transaction>> {
        let mut tracked = self.tracked.lock().unwrap();
        tracked.retain(|_, weak| weak.strong_count() > 0);
        tracked.get(&id).and_then(Weak::upgrade)
    }

    /// Drop a tracked transaction after final completion handling.
    pub fn del_transaction(&self, id: u32) {
        self.tracked.lock().unwrap().remove(&id);
    }

    /// Live tracked entries.
    pub fn tracked_count(&self) -> usize {
        let mut tracked = self.tracked.lock().unwrap();
        tracked.retain(|_, weak| weak.strong_count() > 0);
        tracked.len()
    }
}

impl MemorySlave for SlaveCore {
    fn min_access(&self) -> u32 {
        self.min
    }

    fn max_access(&self) -> u32 {
        self.max
    }

    fn do_transaction(&self, txn: Arc<Transaction>) {
        txn.complete(codes::UNSUPPORTED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::transaction::AccessKind;

    fn txn(size: u32) -> Arc<Transaction> {
        Transaction::new(0, size, AccessKind::Read, vec![0; size as usize], None)
    }

    #[test]
    fn test_default_rejects_with_unsupported() {
        let slave = SlaveCore::new(4, 1024);
        assert_eq!(slave.min_access(), 4);
        assert_eq!(slave.max_access(), 1024);
        assert_eq!(slave.address(), 0);

        let t = txn(4);
        slave.do_transaction(t.clone());
        assert!(t.done());
        assert_eq!(t.error(), codes::UNSUPPORTED);
    }

    #[test]
    fn test_tracking_and_lookup() {
        let slave = SlaveCore::new(4, 1024);
        let t = txn(4);
        slave.add_transaction(&t);

        let found = slave.get_transaction(t.id()).unwrap();
        assert_eq!(found.id(), t.id());
        assert!(slave.get_transaction(t.id() + 1).is_none());

        slave.del_transaction(t.id());
        assert!(slave.get_transaction(t.id()).is_none());
    }

    #[test]
    fn test_dead_weak_entries_are_swept() {
        let slave = SlaveCore::new(4, 1024);
        let id = {
            let t = txn(4);
            slave.add_transaction(&t);
            t.id()
        };
        // The strong reference is gone; lookup evicts the corpse.
        assert!(slave.get_transaction(id).is_none());
        assert_eq!(slave.tracked_count(), 0);
    }
}
