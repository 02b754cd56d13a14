//! Environment the driver runs in.
//!
//! The firmware owning the PCI device hands the driver two capabilities: the
//! PCI I/O interface of the controller ([`PciIo`]) and the boot services it
//! needs for timing and serialization ([`Firmware`]). Both are object-safe so
//! tests can substitute a scripted controller model.

use crate::Result;
use core::ptr::NonNull;

/// Opaque token identifying a bus-master mapping. Mappings are released in
/// LIFO order relative to the tokens handed out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MapToken(pub usize);

/// PCI I/O interface of the bound controller: configuration space, the BAR 0
/// MMIO window, and bus-master common-buffer memory.
///
/// MMIO reads are fallible; the register layer turns failures into an
/// all-ones sentinel so callers can tell a dead plane from a valid zero.
pub trait PciIo {
	fn config_read8(&self, offset: u32) -> Result<u8>;
	fn config_read16(&self, offset: u32) -> Result<u16>;
	fn config_read32(&self, offset: u32) -> Result<u32>;

	fn mem_read8(&self, offset: u64) -> Result<u8>;
	fn mem_read16(&self, offset: u64) -> Result<u16>;
	fn mem_read32(&self, offset: u64) -> Result<u32>;
	fn mem_write32(&self, offset: u64, value: u32) -> Result<()>;

	/// Allocate page-aligned host memory suitable for a bus-master
	/// common-buffer mapping.
	fn allocate_pages(&self, pages: usize) -> Result<NonNull<u8>>;
	/// Release pages from a prior [`PciIo::allocate_pages`]. Any page-aligned
	/// subrange of an allocation may be released independently.
	fn free_pages(&self, ptr: NonNull<u8>, pages: usize);
	/// Map host memory for bus-master read+write, returning the device
	/// address the controller must use.
	fn map(&self, host: NonNull<u8>, bytes: usize) -> Result<(u64, MapToken)>;
	fn unmap(&self, token: MapToken);

	/// Enable 64-bit DMA addressing (dual address cycles).
	fn enable_dual_address_cycle(&self) -> Result<()>;
	/// Push posted writes out to the device.
	fn flush(&self);

	fn save_attributes(&self);
	fn restore_attributes(&self);
}

/// Firmware task-priority level. Raising to [`Tpl::NOTIFY`] serializes the
/// driver against its own timer callback and re-entrant bus calls.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Tpl(pub usize);

impl Tpl {
	pub const APPLICATION: Tpl = Tpl(4);
	pub const CALLBACK: Tpl = Tpl(8);
	pub const NOTIFY: Tpl = Tpl(16);
}

/// Boot services the driver depends on. There is no sleep primitive in this
/// environment; every wait is a bounded busy-poll built on [`Firmware::stall`].
pub trait Firmware {
	/// Busy-wait for at least `us` microseconds.
	fn stall(&self, us: usize);
	/// Raise the task priority level, returning the previous one.
	fn raise_tpl(&self, tpl: Tpl) -> Tpl;
	fn restore_tpl(&self, tpl: Tpl);
}

impl<T: PciIo + ?Sized> PciIo for &T {
	fn config_read8(&self, offset: u32) -> Result<u8> {
		(**self).config_read8(offset)
	}

	fn config_read16(&self, offset: u32) -> Result<u16> {
		(**self).config_read16(offset)
	}

	fn config_read32(&self, offset: u32) -> Result<u32> {
		(**self).config_read32(offset)
	}

	fn mem_read8(&self, offset: u64) -> Result<u8> {
		(**self).mem_read8(offset)
	}

	fn mem_read16(&self, offset: u64) -> Result<u16> {
		(**self).mem_read16(offset)
	}

	fn mem_read32(&self, offset: u64) -> Result<u32> {
		(**self).mem_read32(offset)
	}

	fn mem_write32(&self, offset: u64, value: u32) -> Result<()> {
		(**self).mem_write32(offset, value)
	}

	fn allocate_pages(&self, pages: usize) -> Result<NonNull<u8>> {
		(**self).allocate_pages(pages)
	}

	fn free_pages(&self, ptr: NonNull<u8>, pages: usize) {
		(**self).free_pages(ptr, pages)
	}

	fn map(&self, host: NonNull<u8>, bytes: usize) -> Result<(u64, MapToken)> {
		(**self).map(host, bytes)
	}

	fn unmap(&self, token: MapToken) {
		(**self).unmap(token)
	}

	fn enable_dual_address_cycle(&self) -> Result<()> {
		(**self).enable_dual_address_cycle()
	}

	fn flush(&self) {
		(**self).flush()
	}

	fn save_attributes(&self) {
		(**self).save_attributes()
	}

	fn restore_attributes(&self) {
		(**self).restore_attributes()
	}
}

impl<T: Firmware + ?Sized> Firmware for &T {
	fn stall(&self, us: usize) {
		(**self).stall(us)
	}

	fn raise_tpl(&self, tpl: Tpl) -> Tpl {
		(**self).raise_tpl(tpl)
	}

	fn restore_tpl(&self, tpl: Tpl) {
		(**self).restore_tpl(tpl)
	}
}

/// Convenience alias for the full set of environment capabilities.
pub trait Env: PciIo + Firmware {}

impl<T: PciIo + Firmware + ?Sized> Env for T {}
