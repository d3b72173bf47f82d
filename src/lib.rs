//! USB Mass Storage (Bulk-Only Transport, SCSI) device class for [usb-device]
//!
//! # Subclasses
//! * [SCSI] - SCSI transparent command set, dispatched against a [BlockDevice]
//!
//! # Transports
//! * [Bulk Only]
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `bbb` | Include Bulk Only Transport           |
//! | `scsi` | Include SCSI subclass                 |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [SCSI]: crate::subclass::scsi
//! [Bulk Only]: crate::transport::bbb
//! [BlockDevice]: crate::block::BlockDevice

#![no_std]

pub(crate) mod fmt;

#[cfg(feature = "bbb")]
pub(crate) mod buffer;
pub mod block;
pub mod sense;
#[cfg(all(feature = "bbb", feature = "scsi"))]
pub mod storage;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
