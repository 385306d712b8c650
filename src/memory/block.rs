//! Register blocks: shadow memory with coalesced access scheduling.
//!
//! A [`Block`] owns the shadow bytes of one contiguous register window
//! and schedules the memory transactions that keep it in sync: staged
//! writes coalesce into the fewest transactions the slave's access bounds
//! allow, and write verification reads the span back and compares it
//! against a private reference copy.

use std::sync::{Arc, Mutex};

use crate::error::{DaqError, Result};
use crate::memory::master::MemoryMaster;
use crate::memory::slave::MemorySlave;
use crate::memory::transaction::AccessKind;
use crate::memory::variable::{Mode, Variable};
use crate::memory::{code_to_error, codes};

fn align_down(value: usize, to: usize) -> usize {
    value / to * to
}

fn align_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Largest per-transaction chunk that stays min-access aligned.
fn chunk_limit(min_access: usize, max_access: usize) -> usize {
    align_down(max_access, min_access).max(min_access)
}

struct BlockState {
    shadow: Vec<u8>,
    /// Reference copy taken at flush time, compared by verify.
    verify_ref: Vec<u8>,
    /// Bytes covered by verify-enabled variables.
    verify_mask: Vec<u8>,
    dirty: Vec<bool>,
    stale: bool,
    variables: Vec<Arc<Variable>>,
}

/// Shadow-memory buffer owning a contiguous register window.
pub struct Block {
    master: MemoryMaster,
    base: u64,
    min_access: usize,
    max_access: usize,
    state: Mutex<BlockState>,
}

impl Block {
    /// Create a block over `slave`, windowed from `base` (aligned down to
    /// the slave's minimum access size). The window starts empty and grows
    /// as variables attach.
    pub fn new(slave: Arc<dyn MemorySlave>, base: u64) -> Result<Self> {
        let master = MemoryMaster::new();
        master.set_slave(slave);
        let min_access = master.min_access()?.max(1) as usize;
        let max_access = master.max_access()? as usize;
        Ok(Self {
            master,
            base: base / min_access as u64 * min_access as u64,
            min_access,
            max_access,
            state: Mutex::new(BlockState {
                shadow: Vec::new(),
                verify_ref: Vec::new(),
                verify_mask: Vec::new(),
                dirty: Vec::new(),
                stale: true,
                variables: Vec::new(),
            }),
        })
    }

    /// Aligned base address of the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Current window length in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().shadow.len()
    }

    pub fn min_access(&self) -> usize {
        self.min_access
    }

    pub fn max_access(&self) -> usize {
        self.max_access
    }

    /// Shadow content is unknown; the next typed read refreshes first.
    pub fn is_stale(&self) -> bool {
        self.state.lock().unwrap().stale
    }

    /// Invalidate the shadow.
    pub fn set_stale(&self) {
        self.state.lock().unwrap().stale = true;
    }

    /// Completion budget for the transactions this block issues.
    pub fn set_timeout(&self, timeout: std::time::Duration) {
        self.master.set_timeout(timeout);
    }

    /// Attached variables.
    pub fn variables(&self) -> Vec<Arc<Variable>> {
        self.state.lock().unwrap().variables.clone()
    }

    /// Byte range of `var` relative to the window base.
    fn var_span(&self, var: &Variable) -> Result<(usize, usize)> {
        let abs = var
            .offset()
            .checked_sub(self.base)
            .ok_or_else(|| DaqError::Unsupported(format!(
                "variable {} below block base {:#x}",
                var.name(),
                self.base
            )))? as usize;
        Ok((
            abs + var.low_byte() as usize,
            abs + var.high_byte() as usize,
        ))
    }

    /// Attach a variable, growing the window to cover it.
    ///
    /// Overlapping an existing variable is rejected unless both sides set
    /// the overlap flag.
    pub fn add_variable(&self, var: Arc<Variable>) -> Result<()> {
        let (low, high) = self.var_span(&var)?;

        let mut state = self.state.lock().unwrap();
        for existing in &state.variables {
            let (elow, ehigh) = self.var_span(existing)?;
            let disjoint = high < elow || low > ehigh;
            if !disjoint && !(var.overlap_en() && existing.overlap_en()) {
                return Err(DaqError::Unsupported(format!(
                    "variable {} overlaps {} without overlap consent",
                    var.name(),
                    existing.name()
                )));
            }
        }

        let needed = align_up(high + 1, self.min_access);
        if needed > state.shadow.len() {
            state.shadow.resize(needed, 0);
            state.verify_ref.resize(needed, 0);
            state.verify_mask.resize(needed, 0);
            state.dirty.resize(needed, false);
        }
        if var.verify_en() {
            for byte in &mut state.verify_mask[low..=high] {
                *byte = 0xFF;
            }
        }
        state.variables.push(var);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------

    fn stage(&self, var: &Variable, image: &[u8]) -> Result<()> {
        if var.mode() == Mode::RO {
            return Err(DaqError::Unsupported(format!(
                "variable {} is read-only",
                var.name()
            )));
        }
        let (low, high) = self.var_span(var)?;
        let bit_base = (var.offset() - self.base) as usize * 8;

        let mut state = self.state.lock().unwrap();
        if high >= state.shadow.len() {
            return Err(DaqError::Unsupported(format!(
                "variable {} not attached to this block",
                var.name()
            )));
        }
        var.insert(&mut state.shadow, bit_base, image);
        for flag in &mut state.dirty[low..=high] {
            *flag = true;
        }
        Ok(())
    }

    fn fetch(&self, var: &Variable) -> Result<Vec<u8>> {
        if self.is_stale() {
            self.update()?;
        }
        let (_, high) = self.var_span(var)?;
        let bit_base = (var.offset() - self.base) as usize * 8;
        let state = self.state.lock().unwrap();
        if high >= state.shadow.len() {
            return Err(DaqError::Unsupported(format!(
                "variable {} not attached to this block",
                var.name()
            )));
        }
        Ok(var.extract(&state.shadow, bit_base))
    }

    pub fn set_uint(&self, var: &Variable, value: u64) -> Result<()> {
        self.stage(var, &var.encode_uint(value)?)
    }

    pub fn get_uint(&self, var: &Variable) -> Result<u64> {
        Ok(var.decode_uint(&self.fetch(var)?))
    }

    pub fn set_int(&self, var: &Variable, value: i64) -> Result<()> {
        self.stage(var, &var.encode_int(value)?)
    }

    pub fn get_int(&self, var: &Variable) -> Result<i64> {
        Ok(var.decode_int(&self.fetch(var)?))
    }

    pub fn set_bool(&self, var: &Variable, value: bool) -> Result<()> {
        self.stage(var, &var.encode_bool(value)?)
    }

    pub fn get_bool(&self, var: &Variable) -> Result<bool> {
        Ok(var.decode_bool(&self.fetch(var)?))
    }

    pub fn set_float(&self, var: &Variable, value: f32) -> Result<()> {
        self.stage(var, &var.encode_float(value)?)
    }

    pub fn get_float(&self, var: &Variable) -> Result<f32> {
        Ok(var.decode_float(&self.fetch(var)?))
    }

    pub fn set_double(&self, var: &Variable, value: f64) -> Result<()> {
        self.stage(var, &var.encode_double(value)?)
    }

    pub fn get_double(&self, var: &Variable) -> Result<f64> {
        Ok(var.decode_double(&self.fetch(var)?))
    }

    pub fn set_fixed(&self, var: &Variable, value: f64) -> Result<()> {
        self.stage(var, &var.encode_fixed(value)?)
    }

    pub fn get_fixed(&self, var: &Variable) -> Result<f64> {
        Ok(var.decode_fixed(&self.fetch(var)?))
    }

    pub fn set_string(&self, var: &Variable, value: &str) -> Result<()> {
        self.stage(var, &var.encode_string(value)?)
    }

    pub fn get_string(&self, var: &Variable) -> Result<String> {
        Ok(var.decode_string(&self.fetch(var)?))
    }

    pub fn set_bytes(&self, var: &Variable, value: &[u8]) -> Result<()> {
        self.stage(var, &var.encode_bytes(value)?)
    }

    pub fn get_bytes(&self, var: &Variable) -> Result<Vec<u8>> {
        self.fetch(var)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Flush staged writes.
    ///
    /// The dirty span is combined into a single write transaction aligned
    /// to the minimum access size, or several ordered ones when it
    /// exceeds the maximum. When any attached variable asks for
    /// verification, the span is read back afterwards and compared.
    pub fn flush(&self) -> Result<()> {
        self.write_dirty(AccessKind::Write)
    }

    /// Flush staged writes as posted transactions: dispatched in order,
    /// completion not awaited, no verification pass.
    pub fn post(&self) -> Result<()> {
        self.write_dirty(AccessKind::Post)
    }

    fn write_dirty(&self, kind: AccessKind) -> Result<()> {
        let (lo, hi, data, verify) = {
            let mut state = self.state.lock().unwrap();
            let Some(first) = state.dirty.iter().position(|&d| d) else {
                return Ok(());
            };
            let last = state.dirty.iter().rposition(|&d| d).expect("first exists");
            let lo = align_down(first, self.min_access);
            let hi = align_up(last + 1, self.min_access).min(state.shadow.len());
            for flag in &mut state.dirty[lo..hi] {
                *flag = false;
            }
            let data = state.shadow[lo..hi].to_vec();
            state.verify_ref[lo..hi].copy_from_slice(&data);
            let verify = kind == AccessKind::Write
                && state.variables.iter().any(|v| v.verify_en());
            (lo, hi, data, verify)
        };

        let limit = chunk_limit(self.min_access, self.max_access);
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(limit);
            let address = self.base + (lo + offset) as u64;
            let id = self.master.req_transaction(
                address,
                chunk as u32,
                Some(&data[offset..offset + chunk]),
                kind,
            )?;
            if kind == AccessKind::Write {
                self.wait_checked(id)?;
            } else {
                // Posted: dispatch ordered, completion not awaited.
                self.master.end_transaction(id);
            }
            offset += chunk;
        }

        if verify {
            self.verify_span(lo, hi)?;
        }
        Ok(())
    }

    /// Refresh the whole window from the slave.
    pub fn update(&self) -> Result<()> {
        let len = self.size();
        if len == 0 {
            self.state.lock().unwrap().stale = false;
            return Ok(());
        }

        let limit = chunk_limit(self.min_access, self.max_access);
        let mut offset = 0usize;
        while offset < len {
            let chunk = (len - offset).min(limit);
            let id = self.master.req_transaction(
                self.base + offset as u64,
                chunk as u32,
                None,
                AccessKind::Read,
            )?;
            let txn = self
                .master
                .get_transaction(id)
                .ok_or_else(|| DaqError::Protocol("transaction vanished".to_string()))?;
            self.wait_checked(id)?;
            let data = txn.copy_data();
            let mut state = self.state.lock().unwrap();
            for (i, byte) in data.iter().enumerate().take(chunk) {
                // Staged-but-unflushed bytes keep their pending value.
                if !state.dirty[offset + i] {
                    state.shadow[offset + i] = *byte;
                }
            }
            offset += chunk;
        }
        self.state.lock().unwrap().stale = false;
        Ok(())
    }

    /// Read `[lo, hi)` back and compare against the reference copy within
    /// the verify mask.
    fn verify_span(&self, lo: usize, hi: usize) -> Result<()> {
        let limit = chunk_limit(self.min_access, self.max_access);
        let mut offset = lo;
        while offset < hi {
            let chunk = (hi - offset).min(limit);
            let id = self.master.req_transaction(
                self.base + offset as u64,
                chunk as u32,
                None,
                AccessKind::Verify,
            )?;
            let txn = self
                .master
                .get_transaction(id)
                .ok_or_else(|| DaqError::Protocol("transaction vanished".to_string()))?;
            self.wait_checked(id)?;
            let actual = txn.copy_data();

            let state = self.state.lock().unwrap();
            for i in 0..chunk {
                let at = offset + i;
                if state.verify_mask[at] == 0 {
                    continue;
                }
                let expected = state.verify_ref[at] & state.verify_mask[at];
                let got = actual[i] & state.verify_mask[at];
                if expected != got {
                    self.master.set_error(codes::VERIFY);
                    return Err(DaqError::VerifyMismatch {
                        offset: at,
                        expected,
                        actual: got,
                    });
                }
            }
            offset += chunk;
        }
        Ok(())
    }

    fn wait_checked(&self, id: u32) -> Result<()> {
        let txn = self.master.get_transaction(id);
        self.master.wait_transaction(id)?;
        if let Some(txn) = txn {
            let code = txn.error();
            if code != 0 {
                return Err(code_to_error(code, self.master.timeout()));
            }
        }
        Ok(())
    }
}
