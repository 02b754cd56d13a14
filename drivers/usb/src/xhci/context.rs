//! Device-slot context blocks, the DCBAA and scratchpad memory.
//!
//! Controllers advertise either 32- or 64-byte context entries through
//! `HCCPARAMS.CSZ`; the wrappers here observe that once and hand out the
//! matching typed view, so a single code path serves both layouts.

use crate::env::PciIo;
use crate::mem::{pages_for, AlignedBuffer, Pool};
use crate::Result;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;
use xhci::context::{
	Device32Byte, Device64Byte, DeviceHandler, Input32Byte, Input64Byte, InputHandler,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContextSize {
	/// 32-byte context entries (`CSZ` = 0).
	Small,
	/// 64-byte context entries (`CSZ` = 1).
	Large,
}

impl ContextSize {
	pub fn from_csz(csz: bool) -> Self {
		if csz {
			Self::Large
		} else {
			Self::Small
		}
	}
}

/// Pool-backed input context (input control + slot + 31 endpoint contexts).
pub struct InputContext {
	ptr: NonNull<u8>,
	dev: u64,
	size: ContextSize,
}

impl InputContext {
	pub fn new<E: PciIo>(pool: &mut Pool, env: &E, size: ContextSize) -> Result<Self> {
		let bytes = match size {
			ContextSize::Small => size_of::<Input32Byte>(),
			ContextSize::Large => size_of::<Input64Byte>(),
		};
		let ptr = pool.alloc(env, bytes, false)?;
		let dev = pool.host_to_device(ptr.as_ptr(), bytes);
		Ok(Self { ptr, dev, size })
	}

	pub fn device_addr(&self) -> u64 {
		self.dev
	}

	pub fn bytes(&self) -> usize {
		match self.size {
			ContextSize::Small => size_of::<Input32Byte>(),
			ContextSize::Large => size_of::<Input64Byte>(),
		}
	}

	pub fn zero(&mut self) {
		unsafe { core::ptr::write_bytes(self.ptr.as_ptr(), 0, self.bytes()) }
	}

	/// Carry the controller-maintained slot context of an output context
	/// into this input context, the starting point of every reconfiguration
	/// command.
	pub fn copy_slot_from(&mut self, output: &DeviceContext) {
		debug_assert!(self.size == output.size);
		let entry = match self.size {
			ContextSize::Small => 32,
			ContextSize::Large => 64,
		};
		unsafe {
			// The slot context sits after the input control context here,
			// and first in the output context.
			core::ptr::copy_nonoverlapping(
				output.ptr.as_ptr(),
				self.ptr.as_ptr().add(entry),
				entry,
			);
		}
	}

	/// Typed view matching the controller's context size.
	pub fn handler(&mut self) -> &mut dyn InputHandler {
		// The pool memory is 64-byte aligned and at least as large as the
		// widest layout for this context size.
		unsafe {
			match self.size {
				ContextSize::Small => &mut *(self.ptr.as_ptr() as *mut Input32Byte),
				ContextSize::Large => &mut *(self.ptr.as_ptr() as *mut Input64Byte),
			}
		}
	}

	pub fn free<E: PciIo>(self, pool: &mut Pool, env: &E) {
		let bytes = self.bytes();
		pool.free(env, self.ptr, bytes);
	}
}

/// Pool-backed output device context. The controller owns its contents;
/// software only reads it.
pub struct DeviceContext {
	ptr: NonNull<u8>,
	dev: u64,
	size: ContextSize,
}

impl DeviceContext {
	pub fn new<E: PciIo>(pool: &mut Pool, env: &E, size: ContextSize) -> Result<Self> {
		let bytes = match size {
			ContextSize::Small => size_of::<Device32Byte>(),
			ContextSize::Large => size_of::<Device64Byte>(),
		};
		let ptr = pool.alloc(env, bytes, false)?;
		let dev = pool.host_to_device(ptr.as_ptr(), bytes);
		Ok(Self { ptr, dev, size })
	}

	pub fn device_addr(&self) -> u64 {
		self.dev
	}

	pub fn bytes(&self) -> usize {
		match self.size {
			ContextSize::Small => size_of::<Device32Byte>(),
			ContextSize::Large => size_of::<Device64Byte>(),
		}
	}

	pub fn handler(&self) -> &dyn DeviceHandler {
		unsafe {
			match self.size {
				ContextSize::Small => &*(self.ptr.as_ptr() as *const Device32Byte),
				ContextSize::Large => &*(self.ptr.as_ptr() as *const Device64Byte),
			}
		}
	}

	pub fn free<E: PciIo>(self, pool: &mut Pool, env: &E) {
		let bytes = self.bytes();
		pool.free(env, self.ptr, bytes);
	}
}

/// Device Context Base Address Array plus the scratchpad buffers the
/// controller parks in entry 0.
pub struct Dcbaa {
	buf: NonNull<u8>,
	dev: u64,
	entries: usize,
	scratch_array: Option<AlignedBuffer>,
	scratch_pages: Vec<AlignedBuffer>,
}

impl Dcbaa {
	pub fn new<E: PciIo>(
		pool: &mut Pool,
		env: &E,
		max_slots: u8,
		scratch_count: usize,
		page_size: usize,
	) -> Result<Self> {
		let entries = usize::from(max_slots) + 1;
		let buf = pool.alloc(env, entries * 8, false)?;
		let dev = pool.host_to_device(buf.as_ptr(), entries * 8);
		let mut dcbaa = Self {
			buf,
			dev,
			entries,
			scratch_array: None,
			scratch_pages: Vec::new(),
		};

		if scratch_count > 0 {
			// Scratchpads are page_size blocks on page_size boundaries; the
			// pointer array itself also sits on a page_size boundary.
			let array = AlignedBuffer::new(env, pages_for(scratch_count * 8), page_size)?;
			for index in 0..scratch_count {
				let page = AlignedBuffer::new(env, page_size / crate::mem::PAGE_SIZE, page_size)?;
				unsafe {
					(array.host.as_ptr() as *mut u64)
						.add(index)
						.write_volatile(page.device);
				}
				dcbaa.scratch_pages.push(page);
			}
			dcbaa.set(0, array.device);
			dcbaa.scratch_array = Some(array);
		}
		Ok(dcbaa)
	}

	pub fn device_addr(&self) -> u64 {
		self.dev
	}

	pub fn set(&mut self, slot: u8, context: u64) {
		debug_assert!(usize::from(slot) < self.entries);
		unsafe {
			(self.buf.as_ptr() as *mut u64)
				.add(slot.into())
				.write_volatile(context);
		}
	}

	pub fn get(&self, slot: u8) -> u64 {
		debug_assert!(usize::from(slot) < self.entries);
		unsafe { (self.buf.as_ptr() as *const u64).add(slot.into()).read_volatile() }
	}

	pub fn release<E: PciIo>(self, pool: &mut Pool, env: &E) {
		// Mappings go back in LIFO order relative to their creation.
		for page in self.scratch_pages.into_iter().rev() {
			page.release(env);
		}
		if let Some(array) = self.scratch_array {
			array.release(env);
		}
		pool.free(env, self.buf, self.entries * 8);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::mem::testing::TestIo;
	use xhci::context::InputControlHandler;

	#[test]
	fn input_context_sizes_follow_csz() {
		let io = TestIo::new();
		let mut pool = Pool::new(&io).unwrap();
		let small = InputContext::new(&mut pool, &io, ContextSize::Small).unwrap();
		let large = InputContext::new(&mut pool, &io, ContextSize::Large).unwrap();
		assert_eq!(small.bytes(), 33 * 32);
		assert_eq!(large.bytes(), 33 * 64);
	}

	#[test]
	fn add_context_flags_land_in_dword() {
		let io = TestIo::new();
		let mut pool = Pool::new(&io).unwrap();
		let mut input = InputContext::new(&mut pool, &io, ContextSize::Small).unwrap();
		input.zero();
		input.handler().control_mut().set_add_context_flag(0);
		input.handler().control_mut().set_add_context_flag(1);
		// A0|A1 is the second dword of the input control context.
		let raw = unsafe { (input.ptr.as_ptr() as *const u32).add(1).read() };
		assert_eq!(raw, 0b11);
	}

	#[test]
	fn dcbaa_entry_zero_points_at_scratchpads() {
		let io = TestIo::new();
		let mut pool = Pool::new(&io).unwrap();
		let dcbaa = Dcbaa::new(&mut pool, &io, 8, 2, crate::mem::PAGE_SIZE).unwrap();
		let array = dcbaa.scratch_array.as_ref().unwrap();
		assert_eq!(dcbaa.get(0), array.device);
		for (i, page) in dcbaa.scratch_pages.iter().enumerate() {
			let entry = unsafe { (array.host.as_ptr() as *const u64).add(i).read() };
			assert_eq!(entry, page.device);
			assert_eq!(page.device % crate::mem::PAGE_SIZE as u64, 0);
		}
	}
}
