//! Memory master: issues transactions and waits on their completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{DaqError, Result};
use crate::memory::codes;
use crate::memory::slave::MemorySlave;
use crate::memory::transaction::{AccessKind, DoneSignal, Transaction};

/// Default wait budget for transaction completion.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

struct MasterShared {
    slave: RwLock<Option<Arc<dyn MemorySlave>>>,
    pending: Mutex<HashMap<u32, Arc<Transaction>>>,
    signal: Arc<DoneSignal>,
    timeout: Mutex<Duration>,
    error: AtomicU32,
}

/// Initiates register transactions against a single connected slave.
///
/// For one master, `req_transaction` order equals `do_transaction`
/// dispatch order; completion order is arbitrary.
pub struct MemoryMaster {
    shared: Arc<MasterShared>,
}

impl MemoryMaster {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MasterShared {
                slave: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                signal: DoneSignal::new(),
                timeout: Mutex::new(DEFAULT_TIMEOUT),
                error: AtomicU32::new(0),
            }),
        }
    }

    /// Connect the serving slave, replacing any previous one.
    pub fn set_slave(&self, slave: Arc<dyn MemorySlave>) {
        *self.shared.slave.write().unwrap() = Some(slave);
    }

    fn slave(&self) -> Result<Arc<dyn MemorySlave>> {
        self.shared
            .slave
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| DaqError::Unsupported("no slave connected".to_string()))
    }

    /// Minimum access size of the connected slave.
    pub fn min_access(&self) -> Result<u32> {
        Ok(self.slave()?.min_access())
    }

    /// Maximum access size of the connected slave.
    pub fn max_access(&self) -> Result<u32> {
        Ok(self.slave()?.max_access())
    }

    /// Base address of the connected slave.
    pub fn address(&self) -> Result<u64> {
        Ok(self.slave()?.address())
    }

    /// Completion wait budget.
    pub fn timeout(&self) -> Duration {
        *self.shared.timeout.lock().unwrap()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.shared.timeout.lock().unwrap() = timeout.max(Duration::from_micros(1));
    }

    /// Sticky error accumulated from completed transactions.
    pub fn error(&self) -> u32 {
        self.shared.error.load(Ordering::Acquire)
    }

    /// Reset the sticky error.
    pub fn set_error(&self, error: u32) {
        self.shared.error.store(error, Ordering::Release);
    }

    /// Issue a transaction and return its id.
    ///
    /// Writes carry `data` (at least `size` bytes); reads allocate an
    /// owned, zero-filled payload of `size` bytes. The size is validated
    /// against the slave's access window before anything is dispatched.
    pub fn req_transaction(
        &self,
        address: u64,
        size: u32,
        data: Option<&[u8]>,
        kind: AccessKind,
    ) -> Result<u32> {
        let slave = self.slave()?;
        let (min, max) = (slave.min_access(), slave.max_access());
        if size < min || size > max {
            return Err(DaqError::SizeRange { size, min, max });
        }

        let payload = match (kind.is_write(), data) {
            (true, Some(data)) => {
                if data.len() < size as usize {
                    return Err(DaqError::Protocol(format!(
                        "write data {} shorter than size {}",
                        data.len(),
                        size
                    )));
                }
                data[..size as usize].to_vec()
            }
            (true, None) => {
                return Err(DaqError::Protocol("write without data".to_string()));
            }
            (false, _) => vec![0u8; size as usize],
        };

        let txn = Transaction::new(
            address,
            size,
            kind,
            payload,
            Some(self.shared.signal.clone()),
        );
        let id = txn.id();
        self.shared.pending.lock().unwrap().insert(id, txn.clone());

        // Dispatch with no master lock held; the slave may complete inline.
        slave.do_transaction(txn);
        Ok(id)
    }

    /// Look up a pending transaction.
    pub fn get_transaction(&self, id: u32) -> Option<Arc<Transaction>> {
        self.shared.pending.lock().unwrap().get(&id).cloned()
    }

    /// Pending transaction count.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Wait for transaction `id` to complete (`0` waits for all pending).
    ///
    /// When the budget expires the affected transactions are forcibly
    /// completed with the `TIMEOUT` code; the call itself returns `Ok` and
    /// observers read the error off the transaction or the sticky master
    /// error.
    pub fn wait_transaction(&self, id: u32) -> Result<()> {
        let timeout = self.timeout();
        let deadline = Instant::now() + timeout;

        let mut timed_out = false;
        let mut guard = self.shared.signal.mtx.lock().unwrap();
        loop {
            let all_done = {
                let pending = self.shared.pending.lock().unwrap();
                if id != 0 {
                    pending.get(&id).map(|t| t.done()).unwrap_or(true)
                } else {
                    pending.values().all(|t| t.done())
                }
            };
            if all_done {
                break;
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                timed_out = true;
                break;
            };
            let (g, _) = self.shared.signal.cv.wait_timeout(guard, remaining).unwrap();
            guard = g;
        }
        // Completion re-takes the signal mutex; it must be free before any
        // forced completions below.
        drop(guard);

        if timed_out {
            let targets: Vec<Arc<Transaction>> = {
                let pending = self.shared.pending.lock().unwrap();
                if id != 0 {
                    pending.get(&id).cloned().into_iter().collect()
                } else {
                    pending.values().cloned().collect()
                }
            };
            for txn in targets {
                if !txn.done() {
                    tracing::warn!(id = txn.id(), "transaction timed out");
                    txn.complete(codes::TIMEOUT);
                }
            }
        }

        self.retire(id);
        Ok(())
    }

    /// Release a transaction's pending-map record.
    pub fn end_transaction(&self, id: u32) {
        self.retire(id);
    }

    /// Remove finished records, folding their errors into the sticky error.
    fn retire(&self, id: u32) {
        let mut pending = self.shared.pending.lock().unwrap();
        let retired: Vec<Arc<Transaction>> = if id != 0 {
            pending.remove(&id).into_iter().collect()
        } else {
            let done: Vec<u32> = pending
                .iter()
                .filter(|(_, t)| t.done())
                .map(|(id, _)| *id)
                .collect();
            done.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        drop(pending);
        for txn in retired {
            let error = txn.error();
            if error != 0 {
                self.shared.error.fetch_or(error, Ordering::AcqRel);
            }
        }
    }
}

impl Default for MemoryMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryMaster {
    fn drop(&mut self) {
        // Nothing must stay blocked on a dying master.
        let pending: Vec<Arc<Transaction>> = {
            let mut map = self.shared.pending.lock().unwrap();
            map.drain().map(|(_, t)| t).collect()
        };
        for txn in pending {
            if !txn.done() {
                txn.complete(codes::CANCELED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ram::RamSlave;
    use crate::memory::slave::SlaveCore;

    /// A slave that accepts and never completes.
    struct SilentSlave {
        core: SlaveCore,
    }

    impl SilentSlave {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: SlaveCore::new(4, 4096),
            })
        }
    }

    impl MemorySlave for SilentSlave {
        fn min_access(&self) -> u32 {
            self.core.min_access()
        }
        fn max_access(&self) -> u32 {
            self.core.max_access()
        }
        fn do_transaction(&self, txn: Arc<Transaction>) {
            self.core.add_transaction(&txn);
        }
    }

    fn ram_master() -> MemoryMaster {
        let master = MemoryMaster::new();
        master.set_slave(RamSlave::new(0, 0x1000, 4, 1024));
        master
    }

    #[test]
    fn test_no_slave_is_unsupported() {
        let master = MemoryMaster::new();
        assert!(master.min_access().is_err());
        let result = master.req_transaction(0, 4, None, AccessKind::Read);
        assert!(matches!(result, Err(DaqError::Unsupported(_))));
    }

    #[test]
    fn test_size_range_validation() {
        let master = ram_master();
        let small = master.req_transaction(0, 2, Some(&[0; 2]), AccessKind::Write);
        assert!(matches!(small, Err(DaqError::SizeRange { .. })));
        let large = master.req_transaction(0, 2048, None, AccessKind::Read);
        assert!(matches!(large, Err(DaqError::SizeRange { .. })));
    }

    #[test]
    fn test_write_read_round_trip() {
        let master = ram_master();
        let wid = master
            .req_transaction(0x100, 4, Some(&[1, 2, 3, 4]), AccessKind::Write)
            .unwrap();
        master.wait_transaction(wid).unwrap();
        assert_eq!(master.error(), 0);

        let rid = master.req_transaction(0x100, 4, None, AccessKind::Read).unwrap();
        let txn = master.get_transaction(rid).unwrap();
        master.wait_transaction(rid).unwrap();
        assert_eq!(txn.error(), 0);
        assert_eq!(txn.copy_data(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_timeout_forces_completion() {
        let master = MemoryMaster::new();
        master.set_slave(SilentSlave::new());
        master.set_timeout(Duration::from_millis(10));

        let start = Instant::now();
        let id = master
            .req_transaction(0x100, 4, Some(&[0, 0, 0, 0]), AccessKind::Write)
            .unwrap();
        let txn = master.get_transaction(id).unwrap();
        master.wait_transaction(id).unwrap();

        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(txn.error(), codes::TIMEOUT);
        assert_eq!(master.error() & codes::TIMEOUT, codes::TIMEOUT);
    }

    #[test]
    fn test_wait_all_pending() {
        let master = ram_master();
        for i in 0..4u64 {
            master
                .req_transaction(i * 4, 4, Some(&[i as u8; 4]), AccessKind::Post)
                .unwrap();
        }
        master.wait_transaction(0).unwrap();
        assert_eq!(master.pending_count(), 0);
        assert_eq!(master.error(), 0);
    }

    #[test]
    fn test_end_transaction_releases_record() {
        let master = MemoryMaster::new();
        master.set_slave(SilentSlave::new());
        let id = master.req_transaction(0, 4, None, AccessKind::Read).unwrap();
        assert!(master.get_transaction(id).is_some());
        master.end_transaction(id);
        assert!(master.get_transaction(id).is_none());
    }

    #[test]
    fn test_drop_cancels_pending() {
        let master = MemoryMaster::new();
        master.set_slave(SilentSlave::new());
        let id = master.req_transaction(0, 4, None, AccessKind::Read).unwrap();
        let txn = master.get_transaction(id).unwrap();
        drop(master);
        assert!(txn.done());
        assert_eq!(txn.error(), codes::CANCELED);
    }
}
