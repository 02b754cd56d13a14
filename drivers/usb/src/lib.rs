//! # xHCI host-controller driver
//!
//! Drives a PCI-attached xHCI controller on behalf of an upstream USB bus
//! layer in a pre-OS firmware environment. The environment supplies PCI
//! configuration/MMIO/DMA access and a stall/task-priority service through
//! the traits in [`env`]; everything else (rings, device contexts, the DMA
//! pool, port polling) lives here.
//!
//! [1]: https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf

#![no_std]

extern crate alloc;

pub mod env;
pub mod mem;
pub mod usb;
pub mod xhci;

/// Firmware-level status space shared by every fallible operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
	InvalidParameter,
	Unsupported,
	OutOfResources,
	DeviceError,
	Timeout,
	NotFound,
	NotReady,
	AlreadyStarted,
}

pub type Result<T> = core::result::Result<T, Error>;

pub use crate::xhci::{Capability, HcState, ResetAttributes, RouteString, TransferFailure, Xhci};
