//! RAM-backed memory slave.
//!
//! Completes every access inline against a plain byte array. Stands in
//! for hardware during development and testing; the optional corruption
//! hook emulates a device that stores a different value than was written,
//! which is what read-after-write verification exists to catch.

use std::sync::{Arc, Mutex};

use crate::memory::codes;
use crate::memory::slave::{MemorySlave, SlaveCore};
use crate::memory::transaction::Transaction;

pub struct RamSlave {
    core: SlaveCore,
    base: u64,
    mem: Mutex<Vec<u8>>,
    corrupt: Mutex<Option<(u64, u8)>>,
}

impl RamSlave {
    /// A `size`-byte register window starting at `base`.
    pub fn new(base: u64, size: usize, min: u32, max: u32) -> Arc<Self> {
        Arc::new(Self {
            core: SlaveCore::new(min, max),
            base,
            mem: Mutex::new(vec![0u8; size]),
            corrupt: Mutex::new(None),
        })
    }

    /// XOR `mask` into the byte at `address` after every write, emulating
    /// hardware that echoes back a different value.
    pub fn corrupt_at(&self, address: u64, mask: u8) {
        *self.corrupt.lock().unwrap() = Some((address, mask));
    }

    /// Stop corrupting writes.
    pub fn clear_corruption(&self) {
        *self.corrupt.lock().unwrap() = None;
    }

    /// Snapshot `len` bytes starting at `address`.
    pub fn snapshot(&self, address: u64, len: usize) -> Vec<u8> {
        let mem = self.mem.lock().unwrap();
        let offset = (address - self.base) as usize;
        mem[offset..offset + len].to_vec()
    }

    /// Transactions served so far (deferred-lookup bookkeeping reuse).
    pub fn tracked_count(&self) -> usize {
        self.core.tracked_count()
    }
}

impl MemorySlave for RamSlave {
    fn min_access(&self) -> u32 {
        self.core.min_access()
    }

    fn max_access(&self) -> u32 {
        self.core.max_access()
    }

    fn address(&self) -> u64 {
        self.base
    }

    fn do_transaction(&self, txn: Arc<Transaction>) {
        self.core.add_transaction(&txn);

        let size = txn.size() as usize;
        let mut mem = self.mem.lock().unwrap();
        let Some(offset) = txn
            .address()
            .checked_sub(self.base)
            .map(|o| o as usize)
            .filter(|o| o + size <= mem.len())
        else {
            drop(mem);
            txn.complete(codes::ADDRESS);
            self.core.del_transaction(txn.id());
            return;
        };

        let result = if txn.kind().is_write() {
            let status = txn.get_data(0, &mut mem[offset..offset + size]);
            if status.is_ok() {
                if let Some((addr, mask)) = *self.corrupt.lock().unwrap() {
                    if let Some(rel) = addr.checked_sub(self.base).map(|o| o as usize) {
                        if rel >= offset && rel < offset + size {
                            mem[rel] ^= mask;
                        }
                    }
                }
            }
            status
        } else {
            txn.set_data(0, &mem[offset..offset + size])
        };
        drop(mem);

        match result {
            Ok(()) => txn.complete(codes::OK),
            Err(_) => txn.complete(codes::PROTOCOL),
        }
        self.core.del_transaction(txn.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::transaction::AccessKind;

    fn write_txn(address: u64, data: &[u8]) -> Arc<Transaction> {
        Transaction::new(
            address,
            data.len() as u32,
            AccessKind::Write,
            data.to_vec(),
            None,
        )
    }

    fn read_txn(address: u64, size: u32) -> Arc<Transaction> {
        Transaction::new(address, size, AccessKind::Read, vec![0; size as usize], None)
    }

    #[test]
    fn test_write_then_read() {
        let ram = RamSlave::new(0x1000, 64, 1, 64);
        let w = write_txn(0x1010, &[0xDE, 0xAD]);
        ram.do_transaction(w.clone());
        assert_eq!(w.error(), codes::OK);

        let r = read_txn(0x1010, 2);
        ram.do_transaction(r.clone());
        assert_eq!(r.copy_data(), vec![0xDE, 0xAD]);
        assert_eq!(ram.snapshot(0x1010, 2), vec![0xDE, 0xAD]);
    }

    #[test]
    fn test_out_of_window_is_address_error() {
        let ram = RamSlave::new(0x1000, 16, 1, 64);
        let below = write_txn(0xFF0, &[1]);
        ram.do_transaction(below.clone());
        assert_eq!(below.error(), codes::ADDRESS);

        let beyond = read_txn(0x100C, 8);
        ram.do_transaction(beyond.clone());
        assert_eq!(beyond.error(), codes::ADDRESS);
    }

    #[test]
    fn test_corruption_hook() {
        let ram = RamSlave::new(0, 16, 1, 16);
        ram.corrupt_at(0, 0x01);

        let w = write_txn(0, &[0x05]);
        ram.do_transaction(w);
        assert_eq!(ram.snapshot(0, 1), vec![0x04]);

        ram.clear_corruption();
        let w2 = write_txn(0, &[0x05]);
        ram.do_transaction(w2);
        assert_eq!(ram.snapshot(0, 1), vec![0x05]);
    }
}
