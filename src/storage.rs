//! Initialization façade and SCSI-to-block-backend dispatcher.
//!
//! This is where the SCSI command set touches the [BlockDevice] capability:
//! [Scsi] only parses a CBWCB into a [ScsiCommand]; [MassStorage] owns the
//! sense store, the identity strings, and the per-transaction progress
//! needed to stream blocks in and out across many endpoint packets.
//!
//! [BlockDevice]: crate::block::BlockDevice
//! [Scsi]: crate::subclass::scsi::Scsi
//! [ScsiCommand]: crate::subclass::scsi::ScsiCommand

use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::fmt::debug;
use crate::sense::{asc, ascq, key, SenseData};
use crate::subclass::scsi::{Scsi, ScsiCommand};
use crate::subclass::Command;
use crate::transport::bbb::{BulkOnly, BulkOnlyError};
use core::borrow::BorrowMut;
use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::UsbError;

const VENDOR_ID_LEN: usize = 8;
const PRODUCT_ID_LEN: usize = 16;
const REVISION_LEN: usize = 4;

/// SPC-3 standard INQUIRY response template: peripheral qualifier/device
/// type 0, removable, SPC-2 response format, vendor/product/revision
/// fields space-padded pending [Identity] overlay.
const INQUIRY_TEMPLATE: [u8; 36] = [
    0x00, 0x80, 0x05, 0x02, 0x20, 0x00, 0x80, 0x00, // bytes 0-7
    b' ', b' ', b' ', b' ', b' ', b' ', b' ', b' ', // vendor id (8)
    b' ', b' ', b' ', b' ', b' ', b' ', b' ', b' ', // product id (16)
    b' ', b' ', b' ', b' ', b' ', b' ', b' ', b' ', //
    b' ', b' ', b' ', b' ', // revision (4)
];

/// Minimal MODE SENSE (6) parameter header: no block descriptor, no cache
/// control/write-protect pages.
const MODE_SENSE_6_RESPONSE: [u8; 4] = [0x03, 0x00, 0x00, 0x00];

/// Failure kinds from [`MassStorage::new`].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MassStorageError {
    /// `packet_size` wasn't one of 8, 16, 32, 64.
    InvalidPacketSize,
    /// Propagated from [`BulkOnly::new`](crate::transport::bbb::BulkOnly::new).
    Transport(BulkOnlyError),
}

/// Vendor id / product id / revision, space-padded and truncated per SPC-3
/// INQUIRY field widths.
struct Identity {
    vendor_id: [u8; VENDOR_ID_LEN],
    product_id: [u8; PRODUCT_ID_LEN],
    revision: [u8; REVISION_LEN],
}

impl Identity {
    fn new(vendor_id: &str, product_id: &str, revision: &str) -> Self {
        let mut id = Identity {
            vendor_id: [b' '; VENDOR_ID_LEN],
            product_id: [b' '; PRODUCT_ID_LEN],
            revision: [b' '; REVISION_LEN],
        };
        pad_into(&mut id.vendor_id, vendor_id);
        pad_into(&mut id.product_id, product_id);
        pad_into(&mut id.revision, revision);
        id
    }
}

fn pad_into(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let len = core::cmp::min(bytes.len(), dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

/// Bookkeeping for a READ/WRITE that spans more bytes than fit in one IO
/// buffer flush. Bytes moved so far within the *current* command; reset to
/// zero whenever that command reaches `pass()`/`fail()`.
#[derive(Default)]
struct TransferProgress {
    offset: usize,
}

/// A single-LUN SCSI-over-Bulk-Only-Transport mass storage device, backed by
/// a [BlockDevice].
///
/// [BlockDevice]: crate::block::BlockDevice
pub struct MassStorage<'alloc, Bus, Buf, D>
where
    Bus: UsbBus,
    Buf: BorrowMut<[u8]>,
    D: BlockDevice,
{
    scsi: Scsi<BulkOnly<'alloc, Bus, Buf>>,
    device: D,
    sense: SenseData,
    progress: TransferProgress,
    staging: [u8; BLOCK_SIZE],
    identity: Identity,
}

impl<'alloc, Bus, Buf, D> MassStorage<'alloc, Bus, Buf, D>
where
    Bus: UsbBus + 'alloc,
    Buf: BorrowMut<[u8]>,
    D: BlockDevice,
{
    /// Allocates the Bulk-Only endpoints and wires up the SCSI dispatcher.
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `packet_size` - Maximum USB packet size. Allowed values: 8, 16, 32, 64
    /// * `vendor_id`, `product_id`, `revision` - copied, space-padded and
    ///   truncated to 8/16/4 ASCII bytes for the INQUIRY response
    /// * `device` - the backing [BlockDevice]
    /// * `buf` - the underlying IO buffer. Must fit at least a CBW and a
    ///   single packet; fitting at least one 512-byte block avoids
    ///   unnecessary packet-sized round trips through the dispatcher
    ///
    /// [UsbBusAllocator]: usb_device::bus::UsbBusAllocator
    /// [BlockDevice]: crate::block::BlockDevice
    pub fn new(
        alloc: &'alloc UsbBusAllocator<Bus>,
        packet_size: u16,
        vendor_id: &str,
        product_id: &str,
        revision: &str,
        device: D,
        buf: Buf,
    ) -> Result<Self, MassStorageError> {
        if !matches!(packet_size, 8 | 16 | 32 | 64) {
            return Err(MassStorageError::InvalidPacketSize);
        }

        let scsi =
            Scsi::new(alloc, packet_size, 0, buf).map_err(MassStorageError::Transport)?;

        Ok(MassStorage {
            scsi,
            device,
            sense: SenseData::good(),
            progress: TransferProgress::default(),
            staging: [0u8; BLOCK_SIZE],
            identity: Identity::new(vendor_id, product_id, revision),
        })
    }

    /// Drives the underlying transport and dispatches any ready SCSI command
    /// against the block backend.
    ///
    /// Must be called from the same non-reentrant context (poll loop or
    /// interrupt priority) every time, exactly like
    /// [`Scsi::poll`](crate::subclass::scsi::Scsi::poll).
    pub fn poll(&mut self) -> Result<(), UsbError> {
        let device = &mut self.device;
        let sense = &mut self.sense;
        let progress = &mut self.progress;
        let staging = &mut self.staging;
        let identity = &self.identity;

        self.scsi
            .poll(|command| dispatch(command, device, sense, progress, staging, identity))
    }

    /// Returns the current sense triple, mainly useful for tests.
    pub fn sense(&self) -> SenseData {
        self.sense
    }
}

fn dispatch<'alloc, Bus, Buf, D>(
    mut command: Command<ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
    device: &mut D,
    sense: &mut SenseData,
    progress: &mut TransferProgress,
    staging: &mut [u8; BLOCK_SIZE],
    identity: &Identity,
) where
    Bus: UsbBus + 'alloc,
    Buf: BorrowMut<[u8]>,
    D: BlockDevice,
{
    debug!("usb: storage: Command: {}", command.kind);

    match command.kind {
        ScsiCommand::TestUnitReady | ScsiCommand::PreventAllowMediumRemoval { .. } => {
            // Leave `sense` untouched: REQUEST SENSE must still report the
            // last failing command's sense triple across an intervening
            // TEST UNIT READY/PREVENT ALLOW MEDIUM REMOVAL.
            command.pass();
        }
        ScsiCommand::RequestSense { alloc_len, .. } => {
            let response = sense.to_request_sense_bytes();
            let len = core::cmp::min(response.len(), alloc_len as usize);
            let _ = command.try_write_data_all(&response[..len]);
            command.pass();
        }
        ScsiCommand::Inquiry { evpd: false, .. } => {
            let mut response = INQUIRY_TEMPLATE;
            response[8..16].copy_from_slice(&identity.vendor_id);
            response[16..32].copy_from_slice(&identity.product_id);
            response[32..36].copy_from_slice(&identity.revision);
            let _ = command.try_write_data_all(&response);
            command.pass();
        }
        ScsiCommand::Inquiry { evpd: true, .. } => {
            // Vital Product Data pages are not implemented.
            sense.set(key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, ascq::NA);
            command.fail();
        }
        ScsiCommand::ModeSense6 { .. } => {
            let _ = command.try_write_data_all(&MODE_SENSE_6_RESPONSE);
            command.pass();
        }
        ScsiCommand::ReadCapacity10 => {
            let mut response = [0u8; 8];
            let last_lba = device.block_count().saturating_sub(1);
            response[0..4].copy_from_slice(&last_lba.to_be_bytes());
            response[4..8].copy_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
            let _ = command.try_write_data_all(&response);
            command.pass();
        }
        ScsiCommand::ReportLuns { alloc_len } => {
            // One LUN (LUN 0): an 8-byte header followed by one 8-byte entry.
            let mut response = [0u8; 16];
            response[0..4].copy_from_slice(&8u32.to_be_bytes());
            let len = core::cmp::min(response.len(), alloc_len as usize);
            let _ = command.try_write_data_all(&response[..len]);
            command.pass();
        }
        ScsiCommand::SendDiagnostic => {
            sense.set_good();
            command.pass();
        }
        ScsiCommand::Read { lba, len } => {
            read_blocks(command, device, sense, progress, lba as u32, len as u32);
        }
        ScsiCommand::Write { lba, len } => {
            write_blocks(
                command,
                device,
                sense,
                progress,
                staging,
                lba as u32,
                len as u32,
            );
        }
        _ => {
            sense.set(
                key::ILLEGAL_REQUEST,
                asc::INVALID_COMMAND_OPERATION_CODE,
                ascq::NA,
            );
            command.fail();
        }
    }
}

fn out_of_range(lba: u32, blocks: u32, block_count: u32) -> bool {
    match lba.checked_add(blocks) {
        Some(end) => end > block_count,
        None => true,
    }
}

fn read_blocks<'alloc, Bus, Buf, D>(
    mut command: Command<ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
    device: &mut D,
    sense: &mut SenseData,
    progress: &mut TransferProgress,
    lba: u32,
    blocks: u32,
) where
    Bus: UsbBus + 'alloc,
    Buf: BorrowMut<[u8]>,
    D: BlockDevice,
{
    if out_of_range(lba, blocks, device.block_count()) {
        sense.set(key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, ascq::NA);
        command.fail();
        return;
    }

    let total = blocks as usize * BLOCK_SIZE;

    // The CDB's block count disagrees with what the host announced in the
    // CBW: neither side can be satisfied, so this is a phase error rather
    // than a command we could just run to completion or fail outright.
    if progress.offset == 0 && command.data_transfer_len() as usize != total {
        command.fail_phase();
        return;
    }

    if progress.offset >= total {
        command.pass();
        progress.offset = 0;
        return;
    }

    let block_index = (progress.offset / BLOCK_SIZE) as u32;
    let block_offset = progress.offset % BLOCK_SIZE;

    let mut block = [0u8; BLOCK_SIZE];
    match device.read_block(lba + block_index, &mut block) {
        Ok(()) => match command.write_data(&block[block_offset..]) {
            Ok(count) => {
                progress.offset += count;
                if progress.offset == total {
                    command.pass();
                    progress.offset = 0;
                }
            }
            Err(_) => { /* not ready for more data yet; retried on next poll */ }
        },
        Err(_) => {
            sense.set(key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, ascq::NA);
            command.fail();
            progress.offset = 0;
        }
    }
}

fn write_blocks<'alloc, Bus, Buf, D>(
    mut command: Command<ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
    device: &mut D,
    sense: &mut SenseData,
    progress: &mut TransferProgress,
    staging: &mut [u8; BLOCK_SIZE],
    lba: u32,
    blocks: u32,
) where
    Bus: UsbBus + 'alloc,
    Buf: BorrowMut<[u8]>,
    D: BlockDevice,
{
    if out_of_range(lba, blocks, device.block_count()) {
        sense.set(key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, ascq::NA);
        command.fail();
        return;
    }

    let total = blocks as usize * BLOCK_SIZE;

    // See the matching comment in `read_blocks`.
    if progress.offset == 0 && command.data_transfer_len() as usize != total {
        command.fail_phase();
        return;
    }

    if progress.offset >= total {
        command.pass();
        progress.offset = 0;
        return;
    }

    let block_index = (progress.offset / BLOCK_SIZE) as u32;
    let block_offset = progress.offset % BLOCK_SIZE;

    match command.read_data(&mut staging[block_offset..]) {
        Ok(count) => {
            progress.offset += count;
            if count > 0 && progress.offset % BLOCK_SIZE == 0 {
                if let Err(_) = device.write_block(lba + block_index, staging) {
                    sense.set(
                        key::MEDIUM_ERROR,
                        asc::PERIPHERAL_DEVICE_WRITE_FAULT,
                        ascq::NA,
                    );
                    command.fail();
                    progress.offset = 0;
                    return;
                }
            }
            if progress.offset == total {
                command.pass();
                progress.offset = 0;
            }
        }
        Err(_) => { /* not enough data yet; retried on next poll */ }
    }
}
