//! Flash (NVM) controller interface, plus a RAM-backed model of it.

use crate::protocol::WORD_SIZE;

/// Blocks to erase, in units of the controller's erase block
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EraseRegion {
    pub first_block: u32,
    pub blocks: u32,
}

/// Status of an asynchronous erase
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OpStatus {
    Pending,
    Completed,
    Error,
}

/// Operations the bootloader needs from the flash controller.
pub trait Nvm {
    /// Token for an in-flight erase
    type Handle: Copy + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Start an asynchronous erase, fails if the controller rejects the request.
    fn begin_erase(&mut self, region: EraseRegion) -> Result<Self::Handle, Self::Error>;

    /// Poll an erase started with [`begin_erase`](Nvm::begin_erase).
    fn poll_status(&mut self, handle: Self::Handle) -> OpStatus;

    /// Start programming one word; bytes are in memory order.
    fn program_word(&mut self, address: u32, word: [u8; WORD_SIZE]);

    /// True once the current word program has finished.
    fn write_cycle_complete(&mut self) -> bool;

    /// Clear any latched write error, returning whether one was set.
    fn clear_latched_error(&mut self) -> bool;
}

/// Errors reported by [`MemoryFlash`]
#[derive(Copy, Clone, Debug, PartialEq, thiserror::Error)]
pub enum MemoryFlashError {
    #[error("erase request rejected")]
    Rejected,
}

/// Flash model held in RAM.
///
/// Programming clears bits like real NOR flash, so writing over
/// unerased words is visible. Erases complete after a configurable number
/// of status polls.
#[derive(Clone, Debug)]
pub struct MemoryFlash {
    base: u32,
    block_size: u32,
    memory: std::vec::Vec<u8>,

    erase_polls: u32,
    write_polls: u32,
    reject_erase: bool,
    fail_erase: bool,

    next_handle: u32,
    pending: Option<(u32, u32, EraseRegion)>,
    busy: u32,
    latched_error: bool,
    writes: std::vec::Vec<(u32, [u8; WORD_SIZE])>,
}

impl MemoryFlash {
    /// Create an erased flash of `size` bytes starting at `base`.
    pub fn new(base: u32, size: usize, block_size: u32) -> Self {
        Self {
            base,
            block_size,
            memory: vec![0xff; size],
            erase_polls: 0,
            write_polls: 0,
            reject_erase: false,
            fail_erase: false,
            next_handle: 0,
            pending: None,
            busy: 0,
            latched_error: false,
            writes: std::vec::Vec::new(),
        }
    }

    /// Number of status polls an erase stays pending
    pub fn with_erase_latency(mut self, polls: u32) -> Self {
        self.erase_polls = polls;
        self
    }

    /// Number of polls a word program stays busy
    pub fn with_write_latency(mut self, polls: u32) -> Self {
        self.write_polls = polls;
        self
    }

    /// Refuse every erase request
    pub fn rejecting_erase(mut self) -> Self {
        self.reject_erase = true;
        self
    }

    /// Accept erase requests but report an error on completion
    pub fn failing_erase(mut self) -> Self {
        self.fail_erase = true;
        self
    }

    pub fn contents(&self) -> &[u8] {
        &self.memory
    }

    /// Every word programmed so far, in order
    pub fn writes(&self) -> &[(u32, [u8; WORD_SIZE])] {
        &self.writes
    }

    /// Read back `len` bytes at `address`, if in range
    pub fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let offset = address.checked_sub(self.base)? as usize;
        self.memory.get(offset..offset.checked_add(len)?)
    }

    fn erase(&mut self, region: EraseRegion) {
        let start = (region.first_block as usize).saturating_mul(self.block_size as usize);
        let len = (region.blocks as usize).saturating_mul(self.block_size as usize);
        let end = start.saturating_add(len).min(self.memory.len());

        if let Some(span) = self.memory.get_mut(start..end) {
            span.iter_mut().for_each(|b| *b = 0xff);
        }
    }
}

impl Nvm for MemoryFlash {
    type Handle = u32;
    type Error = MemoryFlashError;

    fn begin_erase(&mut self, region: EraseRegion) -> Result<u32, MemoryFlashError> {
        if self.reject_erase || self.pending.is_some() {
            return Err(MemoryFlashError::Rejected);
        }

        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.pending = Some((handle, self.erase_polls, region));

        Ok(handle)
    }

    fn poll_status(&mut self, handle: u32) -> OpStatus {
        match self.pending {
            Some((h, _, _)) if h != handle => OpStatus::Error,
            Some((h, 0, region)) => {
                self.pending = None;
                if self.fail_erase {
                    return OpStatus::Error;
                }
                self.erase(region);
                trace!("erase {} completed", h);
                OpStatus::Completed
            }
            Some((h, polls, region)) => {
                self.pending = Some((h, polls - 1, region));
                OpStatus::Pending
            }
            None => OpStatus::Error,
        }
    }

    fn program_word(&mut self, address: u32, word: [u8; WORD_SIZE]) {
        self.writes.push((address, word));
        self.busy = self.write_polls;

        let offset = match address.checked_sub(self.base) {
            Some(o) => o as usize,
            None => {
                self.latched_error = true;
                return;
            }
        };
        match self.memory.get_mut(offset..offset + WORD_SIZE) {
            Some(cells) => cells.iter_mut().zip(word.iter()).for_each(|(c, w)| *c &= w),
            None => self.latched_error = true,
        }
    }

    fn write_cycle_complete(&mut self) -> bool {
        if self.busy == 0 {
            return true;
        }
        self.busy -= 1;
        false
    }

    fn clear_latched_error(&mut self) -> bool {
        core::mem::replace(&mut self.latched_error, false)
    }
}
