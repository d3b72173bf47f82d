//! The block backend capability the SCSI dispatcher reads and writes against

use core::fmt::Debug;

/// Size, in bytes, of a single logical block.
///
/// Fixed by this crate's SCSI dispatcher: every READ/WRITE handler moves data
/// in units of this size, and `READ CAPACITY (10)` always reports it as the
/// block length.
pub const BLOCK_SIZE: usize = 512;

/// A single logical unit's backing store.
///
/// The dispatcher never interprets block contents; it only moves whole
/// 512-byte blocks between the host and whatever `read_block`/`write_block`
/// are wired to (flash, RAM, a file, ...).
pub trait BlockDevice {
    /// Backend-specific error, e.g. a flash program/erase failure.
    type Error: Debug;

    /// Total number of addressable 512-byte blocks. Read once at
    /// [`MassStorage::new`](crate::storage::MassStorage::new) time.
    fn block_count(&self) -> u32;

    /// Reads the block at `lba` into `dst`.
    fn read_block(&mut self, lba: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;

    /// Writes `src` to the block at `lba`.
    fn write_block(&mut self, lba: u32, src: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
}
