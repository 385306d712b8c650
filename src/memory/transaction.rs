//! Register-access transactions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DaqError, Result};

/// Process-wide transaction id counter. Ids are globally unique across
/// masters to simplify diagnostics; 0 is reserved and skipped on wrap.
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    loop {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Access type of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Plain register read.
    Read,
    /// Register write whose completion the caller observes.
    Write,
    /// Posted write: completion is not awaited before the next access.
    Post,
    /// Read issued to check a preceding write.
    Verify,
}

impl AccessKind {
    /// Data flows master → slave.
    pub fn is_write(self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::Post)
    }

    /// Data flows slave → master.
    pub fn is_read(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::Verify)
    }
}

/// Wakes waiters on the owning master when any transaction completes.
pub(crate) struct DoneSignal {
    pub(crate) mtx: Mutex<()>,
    pub(crate) cv: Condvar,
}

impl DoneSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            mtx: Mutex::new(()),
            cv: Condvar::new(),
        })
    }
}

struct TxnState {
    error: u32,
    done: bool,
    end_time: Option<Instant>,
}

/// One in-flight register access.
///
/// Shared between the issuing master and the serving slave; reclaimed
/// when both let go. A transaction is pending exactly once between
/// construction and [`complete`](Self::complete).
pub struct Transaction {
    id: u32,
    address: u64,
    size: u32,
    kind: AccessKind,
    data: Mutex<Vec<u8>>,
    state: Mutex<TxnState>,
    cv: Condvar,
    start_time: Instant,
    signal: Option<Arc<DoneSignal>>,
}

impl Transaction {
    pub(crate) fn new(
        address: u64,
        size: u32,
        kind: AccessKind,
        data: Vec<u8>,
        signal: Option<Arc<DoneSignal>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            address,
            size,
            kind,
            data: Mutex::new(data),
            state: Mutex::new(TxnState {
                error: 0,
                done: false,
                end_time: None,
            }),
            cv: Condvar::new(),
            start_time: Instant::now(),
            signal,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn kind(&self) -> AccessKind {
        self.kind
    }

    /// In-band error code; 0 while pending or on success.
    pub fn error(&self) -> u32 {
        self.state.lock().unwrap().error
    }

    pub fn done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Completion timestamp, once complete.
    pub fn end_time(&self) -> Option<Instant> {
        self.state.lock().unwrap().end_time
    }

    /// Copy bytes out of the transaction payload (slave side of a write).
    pub fn get_data(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        if offset + dst.len() > data.len() {
            return Err(DaqError::Protocol(format!(
                "transaction data read {}+{} exceeds {}",
                offset,
                dst.len(),
                data.len()
            )));
        }
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    /// Copy bytes into the transaction payload (slave side of a read).
    pub fn set_data(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if offset + src.len() > data.len() {
            return Err(DaqError::Protocol(format!(
                "transaction data write {}+{} exceeds {}",
                offset,
                src.len(),
                data.len()
            )));
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Snapshot the payload (caller side, after a read completes).
    pub fn copy_data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Complete the transaction with an in-band error code (0 = success).
    ///
    /// Exactly-once: repeated completions are detected and ignored.
    pub fn complete(&self, error: u32) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done {
                tracing::debug!(id = self.id, "repeated completion ignored");
                return;
            }
            state.done = true;
            state.error = error;
            state.end_time = Some(Instant::now());
        }
        self.cv.notify_all();
        if let Some(signal) = &self.signal {
            let _guard = signal.mtx.lock().unwrap();
            signal.cv.notify_all();
        }
    }

    /// Wait for completion; `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (_state, result) = self
            .cv
            .wait_timeout_while(state, timeout, |s| !s.done)
            .unwrap();
        !result.timed_out()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("done", &self.done())
            .field("error", &format_args!("{:#010x}", self.error()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let a = Transaction::new(0, 4, AccessKind::Read, vec![0; 4], None);
        let b = Transaction::new(0, 4, AccessKind::Read, vec![0; 4], None);
        assert_ne!(a.id(), 0);
        assert_ne!(b.id(), 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_complete_exactly_once() {
        let txn = Transaction::new(0x100, 4, AccessKind::Write, vec![1, 2, 3, 4], None);
        assert!(!txn.done());

        txn.complete(0);
        assert!(txn.done());
        assert_eq!(txn.error(), 0);
        assert!(txn.end_time().is_some());

        // Second completion must not overwrite the first.
        txn.complete(crate::memory::codes::TIMEOUT);
        assert_eq!(txn.error(), 0);
    }

    #[test]
    fn test_data_windows() {
        let txn = Transaction::new(0, 4, AccessKind::Write, vec![10, 20, 30, 40], None);

        let mut out = [0u8; 2];
        txn.get_data(1, &mut out).unwrap();
        assert_eq!(out, [20, 30]);

        txn.set_data(2, &[99]).unwrap();
        assert_eq!(txn.copy_data(), vec![10, 20, 99, 40]);

        assert!(txn.get_data(3, &mut [0u8; 2]).is_err());
        assert!(txn.set_data(4, &[1]).is_err());
    }

    #[test]
    fn test_wait_blocks_until_complete() {
        let txn = Transaction::new(0, 4, AccessKind::Read, vec![0; 4], None);
        assert!(!txn.wait(Duration::from_millis(10)));

        let txn2 = txn.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            txn2.complete(0);
        });
        assert!(txn.wait(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_access_kind_direction() {
        assert!(AccessKind::Write.is_write());
        assert!(AccessKind::Post.is_write());
        assert!(AccessKind::Read.is_read());
        assert!(AccessKind::Verify.is_read());
        assert!(!AccessKind::Read.is_write());
    }
}
