//! Typed access to the controller's register planes.
//!
//! All five planes live in BAR 0 and are reached through the fallible
//! [`PciIo`] memory operations; a failed read is folded into an all-ones
//! sentinel so a torn-off device is distinguishable from a valid zero.
//! 64-bit registers are always accessed as two 32-bit halves, low half
//! first, for controllers that reject 64-bit single-cycle MMIO.

use super::errata::Errata;
use crate::env::{Firmware, PciIo};
use crate::{Error, Result};
use log::{debug, error};

// Capability registers, offset 0 from BAR 0.
pub const XHC_CAPLENGTH_OFFSET: u32 = 0x00;
pub const XHC_HCIVERSION_OFFSET: u32 = 0x02;
pub const XHC_HCSPARAMS1_OFFSET: u32 = 0x04;
pub const XHC_HCSPARAMS2_OFFSET: u32 = 0x08;
pub const XHC_HCSPARAMS3_OFFSET: u32 = 0x0c;
pub const XHC_HCCPARAMS_OFFSET: u32 = 0x10;
pub const XHC_DBOFF_OFFSET: u32 = 0x14;
pub const XHC_RTSOFF_OFFSET: u32 = 0x18;

// Operational registers, offset CAPLENGTH.
pub const XHC_USBCMD_OFFSET: u32 = 0x0000;
pub const XHC_USBSTS_OFFSET: u32 = 0x0004;
pub const XHC_PAGESIZE_OFFSET: u32 = 0x0008;
pub const XHC_DNCTRL_OFFSET: u32 = 0x0014;
pub const XHC_CRCR_OFFSET: u32 = 0x0018;
pub const XHC_DCBAAP_OFFSET: u32 = 0x0030;
pub const XHC_CONFIG_OFFSET: u32 = 0x0038;
pub const XHC_PORTSC_OFFSET: u32 = 0x0400;

// Runtime registers, offset RTSOFF. Interrupter registers repeat every 32
// bytes.
pub const XHC_MFINDEX_OFFSET: u32 = 0x00;
pub const XHC_IMAN_OFFSET: u32 = 0x20;
pub const XHC_IMOD_OFFSET: u32 = 0x24;
pub const XHC_ERSTSZ_OFFSET: u32 = 0x28;
pub const XHC_ERSTBA_OFFSET: u32 = 0x30;
pub const XHC_ERDP_OFFSET: u32 = 0x38;

pub const XHC_USBCMD_RUN: u32 = 1 << 0;
pub const XHC_USBCMD_RESET: u32 = 1 << 1;
pub const XHC_USBCMD_INTE: u32 = 1 << 2;
pub const XHC_USBCMD_HSEE: u32 = 1 << 3;

pub const XHC_USBSTS_HALT: u32 = 1 << 0;
pub const XHC_USBSTS_HSE: u32 = 1 << 2;
pub const XHC_USBSTS_CNR: u32 = 1 << 11;
pub const XHC_USBSTS_HCE: u32 = 1 << 12;

pub const XHC_PAGESIZE_MASK: u32 = 0xffff;
pub const XHC_CRCR_RCS: u32 = 1 << 0;

pub const XHC_PORTSC_CCS: u32 = 1 << 0;
pub const XHC_PORTSC_PED: u32 = 1 << 1;
pub const XHC_PORTSC_OCA: u32 = 1 << 3;
pub const XHC_PORTSC_RESET: u32 = 1 << 4;
pub const XHC_PORTSC_PLS: u32 = 0xf << 5;
pub const XHC_PORTSC_PP: u32 = 1 << 9;
pub const XHC_PORTSC_PS: u32 = 0xf << 10;
pub const XHC_PORTSC_LWS: u32 = 1 << 16;
pub const XHC_PORTSC_CSC: u32 = 1 << 17;
pub const XHC_PORTSC_PEC: u32 = 1 << 18;
pub const XHC_PORTSC_WRC: u32 = 1 << 19;
pub const XHC_PORTSC_OCC: u32 = 1 << 20;
pub const XHC_PORTSC_PRC: u32 = 1 << 21;
pub const XHC_PORTSC_PLC: u32 = 1 << 22;
pub const XHC_PORTSC_CEC: u32 = 1 << 23;

pub const XHC_IMAN_IP: u32 = 1 << 0;
pub const XHC_IMAN_IE: u32 = 1 << 1;

pub const XHC_CAP_USB_LEGACY: u8 = 0x01;
pub const XHC_CAP_USB_DEBUG: u8 = 0x0a;
pub const XHC_CAP_SUPPORTED_PROTOCOL: u8 = 0x02;
pub const XHC_DC_DCCTRL: u32 = 0x20;

pub const USBLEGSP_BIOS_SEMAPHORE: u32 = 1 << 16;
pub const USBLEGSP_OS_SEMAPHORE: u32 = 1 << 24;

// PCI configuration space.
pub const PCI_VENDOR_ID_OFFSET: u32 = 0x00;
pub const PCI_DEVICE_ID_OFFSET: u32 = 0x02;
pub const PCI_COMMAND_OFFSET: u32 = 0x04;
pub const PCI_CLASSCODE_OFFSET: u32 = 0x09;
pub const PCI_SBRN_OFFSET: u32 = 0x60;
pub const PCI_COMMAND_SERR: u16 = 1 << 8;

// Class code of an xHCI controller: serial bus / USB / xHCI.
pub const PCI_CLASS_SERIAL: u8 = 0x0c;
pub const PCI_CLASS_SERIAL_USB: u8 = 0x03;
pub const PCI_IF_XHCI: u8 = 0x30;

/// Timeouts (ms) set by experience.
pub const XHC_RESET_TIMEOUT: usize = 1000;
pub const XHC_GENERIC_TIMEOUT: usize = 10;
pub const XHC_1_MILLISECOND: usize = 1000;

/// The register planes of one controller, bound to its environment.
pub struct Regs<E> {
	pub env: E,
	pub errata: Errata,
	cap_length: u32,
	dboff: u32,
	rtsoff: u32,
	ext_cap_base: u32,
	pub usb_leg_sup_offset: Option<u32>,
	pub debug_cap_offset: Option<u32>,
}

impl<E: PciIo + Firmware> Regs<E> {
	pub fn new(env: E) -> Result<Self> {
		let vendor = env.config_read16(PCI_VENDOR_ID_OFFSET).unwrap_or(0xffff);
		let device = env.config_read16(PCI_DEVICE_ID_OFFSET).unwrap_or(0xffff);
		let errata = Errata::for_device(vendor, device);
		if errata.any() {
			debug!("applying controller errata for {:04x}:{:04x}", vendor, device);
		}

		let mut regs = Self {
			env,
			errata,
			cap_length: 0,
			dboff: 0,
			rtsoff: 0,
			ext_cap_base: 0,
			usb_leg_sup_offset: None,
			debug_cap_offset: None,
		};
		regs.cap_length = regs.read_cap8(XHC_CAPLENGTH_OFFSET).into();
		if regs.cap_length == 0xff {
			return Err(Error::DeviceError);
		}
		debug!(
			"interface version {:#06x}",
			regs.read_cap16(XHC_HCIVERSION_OFFSET)
		);
		regs.dboff = regs.read_cap(XHC_DBOFF_OFFSET) & !0x3;
		regs.rtsoff = regs.read_cap(XHC_RTSOFF_OFFSET) & !0x1f;
		let hccparams = regs.read_cap(XHC_HCCPARAMS_OFFSET);
		regs.ext_cap_base = (hccparams >> 16) << 2;
		regs.usb_leg_sup_offset = regs.capability_addr(XHC_CAP_USB_LEGACY);
		regs.debug_cap_offset = regs.capability_addr(XHC_CAP_USB_DEBUG);
		Ok(regs)
	}

	pub fn read_cap8(&self, offset: u32) -> u8 {
		self.env.mem_read8(offset.into()).unwrap_or(0xff)
	}

	pub fn read_cap16(&self, offset: u32) -> u16 {
		self.env.mem_read16(offset.into()).unwrap_or(0xffff)
	}

	pub fn read_cap(&self, offset: u32) -> u32 {
		self.env.mem_read32(offset.into()).unwrap_or(0xffff_ffff)
	}

	pub fn read_op(&self, offset: u32) -> u32 {
		self.env
			.mem_read32((self.cap_length + offset).into())
			.unwrap_or(0xffff_ffff)
	}

	pub fn write_op(&self, offset: u32, value: u32) {
		if self.env.mem_write32((self.cap_length + offset).into(), value).is_err() {
			error!("op reg {:#x} write failed", offset);
		}
	}

	pub fn read_op64(&self, offset: u32) -> u64 {
		let lo = self.read_op(offset);
		let hi = self.read_op(offset + 4);
		(hi as u64) << 32 | lo as u64
	}

	pub fn write_op64(&self, offset: u32, value: u64) {
		self.write_op(offset, value as u32);
		self.write_op(offset + 4, (value >> 32) as u32);
	}

	pub fn read_rt(&self, offset: u32) -> u32 {
		self.env
			.mem_read32((self.rtsoff + offset).into())
			.unwrap_or(0xffff_ffff)
	}

	pub fn write_rt(&self, offset: u32, value: u32) {
		if self.env.mem_write32((self.rtsoff + offset).into(), value).is_err() {
			error!("runtime reg {:#x} write failed", offset);
		}
	}

	pub fn read_rt64(&self, offset: u32) -> u64 {
		let lo = self.read_rt(offset);
		let hi = self.read_rt(offset + 4);
		(hi as u64) << 32 | lo as u64
	}

	pub fn write_rt64(&self, offset: u32, value: u64) {
		self.write_rt(offset, value as u32);
		self.write_rt(offset + 4, (value >> 32) as u32);
	}

	/// Doorbell array; index 0 is the command ring.
	pub fn write_db(&self, index: u8, value: u32) {
		let offset = self.dboff + u32::from(index) * 4;
		if self.env.mem_write32(offset.into(), value).is_err() {
			error!("doorbell {} write failed", index);
		}
	}

	pub fn read_ext_cap(&self, offset: u32) -> u32 {
		self.env.mem_read32(offset.into()).unwrap_or(0xffff_ffff)
	}

	pub fn write_ext_cap(&self, offset: u32, value: u32) {
		if self.env.mem_write32(offset.into(), value).is_err() {
			error!("ext cap reg {:#x} write failed", offset);
		}
	}

	pub fn set_op_bit(&self, offset: u32, bit: u32) {
		self.write_op(offset, self.read_op(offset) | bit);
	}

	pub fn clear_op_bit(&self, offset: u32, bit: u32) {
		self.write_op(offset, self.read_op(offset) & !bit);
	}

	pub fn set_rt_bit(&self, offset: u32, bit: u32) {
		self.write_rt(offset, self.read_rt(offset) | bit);
	}

	pub fn clear_rt_bit(&self, offset: u32, bit: u32) {
		self.write_rt(offset, self.read_rt(offset) & !bit);
	}

	pub fn op_bit_set(&self, offset: u32, bit: u32) -> bool {
		self.read_op(offset) & bit == bit
	}

	/// Poll an operational register until the masked bits are all set (or
	/// all clear), in 1 ms steps bounded by `timeout_ms`.
	pub fn wait_op_bit(&self, offset: u32, bit: u32, want_set: bool, timeout_ms: usize) -> Result<()> {
		let want = if want_set { bit } else { 0 };
		for _ in 0..=timeout_ms {
			if self.read_op(offset) & bit == want {
				return Ok(());
			}
			self.env.stall(XHC_1_MILLISECOND);
		}
		Err(Error::Timeout)
	}

	pub fn portsc_offset(port: u8) -> u32 {
		XHC_PORTSC_OFFSET + 0x10 * u32::from(port)
	}

	pub fn is_halted(&self) -> bool {
		self.op_bit_set(XHC_USBSTS_OFFSET, XHC_USBSTS_HALT)
	}

	/// Host system error or internal controller error; either one makes
	/// every further operation fail fast.
	pub fn is_sys_error(&self) -> bool {
		let status = self.read_op(XHC_USBSTS_OFFSET);
		status & (XHC_USBSTS_HSE | XHC_USBSTS_HCE) != 0
	}

	pub fn halt(&self, timeout_ms: usize) -> Result<()> {
		self.clear_op_bit(XHC_USBCMD_OFFSET, XHC_USBCMD_RUN);
		self.wait_op_bit(XHC_USBSTS_OFFSET, XHC_USBSTS_HALT, true, timeout_ms)
	}

	pub fn run(&self, timeout_ms: usize) -> Result<()> {
		self.set_op_bit(XHC_USBCMD_OFFSET, XHC_USBCMD_RUN);
		self.wait_op_bit(XHC_USBSTS_OFFSET, XHC_USBSTS_HALT, false, timeout_ms)
	}

	/// Whether the debug capability has an active connection; resetting the
	/// controller would tear it down.
	pub fn debug_cap_active(&self) -> bool {
		match self.debug_cap_offset {
			Some(offset) => {
				(self.read_ext_cap(offset) & 0xff) == u32::from(XHC_CAP_USB_DEBUG)
					&& self.read_ext_cap(offset + XHC_DC_DCCTRL) & 1 != 0
			}
			None => false,
		}
	}

	pub fn reset(&self, timeout_ms: usize) -> Result<()> {
		if !self.is_halted() {
			self.halt(timeout_ms)?;
		}
		if self.debug_cap_active() {
			return Ok(());
		}

		self.set_op_bit(XHC_USBCMD_OFFSET, XHC_USBCMD_RESET);
		// Some controllers accept no MMIO access at all for a short window
		// after HCRST is set; touching a register earlier makes the wait
		// below time out.
		self.env.stall(XHC_1_MILLISECOND);
		if self.errata.hang_after_reset {
			self.env.stall(XHC_1_MILLISECOND);
		}
		self.wait_op_bit(XHC_USBCMD_OFFSET, XHC_USBCMD_RESET, false, timeout_ms)?;
		self.wait_op_bit(XHC_USBSTS_OFFSET, XHC_USBSTS_CNR, false, timeout_ms)?;

		// HCRST clears HSEE; carry the PCI command register's SERR# enable
		// back into it.
		self.propagate_serr_enable();
		Ok(())
	}

	fn propagate_serr_enable(&self) {
		if let Ok(command) = self.env.config_read16(PCI_COMMAND_OFFSET) {
			if command & PCI_COMMAND_SERR != 0 {
				self.set_op_bit(XHC_USBCMD_OFFSET, XHC_USBCMD_HSEE);
			}
		}
	}

	/// Walk the extended-capability list for a capability id.
	pub fn capability_addr(&self, cap_id: u8) -> Option<u32> {
		if self.ext_cap_base == 0 {
			return None;
		}
		let mut offset = self.ext_cap_base;
		loop {
			let header = self.read_ext_cap(offset);
			if header == 0xffff_ffff {
				return None;
			}
			if header as u8 == cap_id {
				return Some(offset);
			}
			let next = (header >> 8) as u8;
			if next == 0 {
				return None;
			}
			offset += u32::from(next) << 2;
		}
	}

	/// Locate a supported-protocol capability by major revision (2 or 3).
	pub fn supported_protocol_addr(&self, major: u8) -> Option<u32> {
		if self.ext_cap_base == 0 {
			return None;
		}
		let mut offset = self.ext_cap_base;
		loop {
			let header = self.read_ext_cap(offset);
			if header == 0xffff_ffff {
				return None;
			}
			if header as u8 == XHC_CAP_SUPPORTED_PROTOCOL && (header >> 24) as u8 == major {
				return Some(offset);
			}
			let next = (header >> 8) as u8;
			if next == 0 {
				return None;
			}
			offset += u32::from(next) << 2;
		}
	}

	pub fn set_bios_ownership(&self) {
		let Some(offset) = self.usb_leg_sup_offset else { return };
		debug!("taking BIOS ownership of the controller");
		let value = self.read_ext_cap(offset);
		self.write_ext_cap(
			offset,
			(value & !USBLEGSP_OS_SEMAPHORE) | USBLEGSP_BIOS_SEMAPHORE,
		);
	}

	pub fn clear_bios_ownership(&self) {
		let Some(offset) = self.usb_leg_sup_offset else { return };
		debug!("handing the controller to the OS");
		let value = self.read_ext_cap(offset);
		self.write_ext_cap(
			offset,
			(value & !USBLEGSP_BIOS_SEMAPHORE) | USBLEGSP_OS_SEMAPHORE,
		);
	}
}
