//! Transfer, command and event rings.
//!
//! A transfer ring is a single segment whose last slot is a Link TRB back to
//! the base with the toggle-cycle bit set; the producer cycle state (PCS)
//! flips every time the enqueue pointer crosses it. The event ring is
//! hardware-produced; software tracks the consumer cycle state (CCS) and
//! derives the hardware enqueue position by scanning cycle bits.

use crate::env::PciIo;
use crate::mem::Pool;
use crate::Result;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};
use xhci::ring::trb;

pub const CMD_RING_TRB_NUMBER: usize = 64;
pub const TR_RING_TRB_NUMBER: usize = 64;
pub const EVENT_RING_TRB_NUMBER: usize = 128;
pub const ERST_NUMBER: usize = 1;

pub const TRB_LEN: usize = 16;

pub const TRB_TYPE_NORMAL: u8 = 1;
pub const TRB_TYPE_SETUP_STAGE: u8 = 2;
pub const TRB_TYPE_DATA_STAGE: u8 = 3;
pub const TRB_TYPE_STATUS_STAGE: u8 = 4;
pub const TRB_TYPE_ISOCH: u8 = 5;
pub const TRB_TYPE_LINK: u8 = 6;
pub const TRB_TYPE_TRANS_EVENT: u8 = 32;
pub const TRB_TYPE_COMMAND_COMPLT_EVENT: u8 = 33;
pub const TRB_TYPE_PORT_STATUS_CHANGE_EVENT: u8 = 34;
pub const TRB_TYPE_HOST_CONTROLLER_EVENT: u8 = 37;

pub const TRB_COMPLETION_SUCCESS: u8 = 1;
pub const TRB_COMPLETION_DATA_BUFFER_ERROR: u8 = 2;
pub const TRB_COMPLETION_BABBLE_ERROR: u8 = 3;
pub const TRB_COMPLETION_USB_TRANSACTION_ERROR: u8 = 4;
pub const TRB_COMPLETION_TRB_ERROR: u8 = 5;
pub const TRB_COMPLETION_STALL_ERROR: u8 = 6;
pub const TRB_COMPLETION_SHORT_PACKET: u8 = 13;

/// Raw view of one TRB slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Trb(pub [u32; 4]);

impl Trb {
	pub fn cycle(&self) -> bool {
		self.0[3] & 1 != 0
	}

	pub fn trb_type(&self) -> u8 {
		((self.0[3] >> 10) & 0x3f) as u8
	}

	pub fn is_link(&self) -> bool {
		self.trb_type() == TRB_TYPE_LINK
	}

	// Event TRBs share these field positions.
	pub fn pointer(&self) -> u64 {
		(self.0[1] as u64) << 32 | self.0[0] as u64
	}

	pub fn completion_code(&self) -> u8 {
		(self.0[2] >> 24) as u8
	}

	/// Residual transfer length of a transfer event.
	pub fn residual(&self) -> u32 {
		self.0[2] & 0x00ff_ffff
	}

	pub fn slot_id(&self) -> u8 {
		(self.0[3] >> 24) as u8
	}

	pub fn endpoint_id(&self) -> u8 {
		((self.0[3] >> 16) & 0x1f) as u8
	}

	pub fn port_id(&self) -> u8 {
		(self.0[0] >> 24) as u8
	}
}

pub struct TransferRing {
	base: NonNull<u8>,
	base_dev: u64,
	trb_count: usize,
	enqueue: usize,
	dequeue: usize,
	cycle_state: bool,
}

impl TransferRing {
	pub fn new<E: PciIo>(pool: &mut Pool, env: &E, trb_count: usize) -> Result<Self> {
		let base = pool.alloc(env, trb_count * TRB_LEN, true)?;
		let base_dev = pool.host_to_device(base.as_ptr(), trb_count * TRB_LEN);
		let mut ring = Self {
			base,
			base_dev,
			trb_count,
			enqueue: 0,
			dequeue: 0,
			cycle_state: true,
		};
		// Terminal Link TRB pointing back to the base, toggling the
		// controller's cycle interpretation. Its own cycle bit starts clear,
		// matching the freshly zeroed producer slots.
		let link = *trb::Link::new()
			.set_ring_segment_pointer(base_dev)
			.set_toggle_cycle();
		ring.write_trb(trb_count - 1, Trb(link.into_raw()));
		Ok(ring)
	}

	fn slot(&self, index: usize) -> *mut [u32; 4] {
		debug_assert!(index < self.trb_count);
		unsafe { self.base.as_ptr().add(index * TRB_LEN) as *mut [u32; 4] }
	}

	pub fn read_trb(&self, index: usize) -> Trb {
		Trb(unsafe { self.slot(index).read_volatile() })
	}

	fn write_trb(&mut self, index: usize, trb: Trb) {
		unsafe { self.slot(index).write_volatile(trb.0) }
	}

	pub fn trb_count(&self) -> usize {
		self.trb_count
	}

	pub fn base_dev(&self) -> u64 {
		self.base_dev
	}

	pub fn cycle_state(&self) -> bool {
		self.cycle_state
	}

	pub fn enqueue_dev(&self) -> u64 {
		self.base_dev + (self.enqueue * TRB_LEN) as u64
	}

	pub fn dequeue_dev(&self) -> u64 {
		self.base_dev + (self.dequeue * TRB_LEN) as u64
	}

	pub fn contains(&self, dev: u64) -> bool {
		dev >= self.base_dev && dev < self.base_dev + (self.trb_count * TRB_LEN) as u64
	}

	pub fn index_of(&self, dev: u64) -> usize {
		debug_assert!(self.contains(dev));
		((dev - self.base_dev) as usize) / TRB_LEN
	}

	/// Advance the enqueue pointer past every TRB the producer already owns,
	/// crossing (and re-cycling) the Link TRB as needed, then clear the slot
	/// it lands on.
	pub fn sync(&mut self) {
		let mut index = self.enqueue;
		for _ in 0..self.trb_count {
			let trb = self.read_trb(index);
			if trb.cycle() != self.cycle_state {
				break;
			}
			index += 1;
			if index == self.trb_count - 1 {
				let mut link = self.read_trb(index);
				debug_assert!(link.is_link());
				if self.cycle_state {
					link.0[3] |= 1;
				} else {
					link.0[3] &= !1;
				}
				self.write_trb(index, link);
				self.cycle_state = !self.cycle_state;
				index = 0;
			}
		}
		self.enqueue = index;

		// Scrub the stale slot contents but leave its cycle bit alone; the
		// controller must keep seeing it as not-yet-owned.
		let mut trb = self.read_trb(index);
		trb.0[0] = 0;
		trb.0[1] = 0;
		trb.0[2] = 0;
		trb.0[3] &= 1;
		self.write_trb(index, trb);
	}

	/// Post one TRB at the enqueue position and hand it to the controller.
	/// Returns the TRB's device address, which completion events refer to.
	pub fn enqueue(&mut self, mut raw: [u32; 4]) -> u64 {
		self.sync();
		let index = self.enqueue;
		let dev = self.base_dev + (index * TRB_LEN) as u64;

		// Commit the payload before flipping the cycle bit; the controller
		// may fetch the TRB the moment the cycle matches its own state.
		let staged_cycle = raw[3] & !1 | u32::from(!self.cycle_state);
		self.write_trb(index, Trb([raw[0], raw[1], raw[2], staged_cycle]));
		fence(Ordering::Release);
		raw[3] = raw[3] & !1 | u32::from(self.cycle_state);
		unsafe {
			(self.slot(index) as *mut u32).add(3).write_volatile(raw[3]);
		}
		dev
	}

	/// After a Stop Endpoint + Set TR Dequeue sequence the controller's view
	/// starts over at the enqueue pointer.
	pub fn recycle(&mut self) {
		self.dequeue = self.enqueue;
	}

	pub fn free<E: PciIo>(self, pool: &mut Pool, env: &E) {
		pool.free(env, self.base, self.trb_count * TRB_LEN);
	}
}

pub struct EventRing {
	base: NonNull<u8>,
	base_dev: u64,
	erst: NonNull<u8>,
	erst_dev: u64,
	trb_count: usize,
	dequeue: usize,
	cycle_state: bool,
	interrupter: u8,
}

impl EventRing {
	pub fn new<E: PciIo>(pool: &mut Pool, env: &E, interrupter: u8) -> Result<Self> {
		let bytes = EVENT_RING_TRB_NUMBER * TRB_LEN;
		let base = pool.alloc(env, bytes, true)?;
		let base_dev = pool.host_to_device(base.as_ptr(), bytes);

		let erst = pool.alloc(env, ERST_NUMBER * TRB_LEN, false)?;
		let erst_dev = pool.host_to_device(erst.as_ptr(), ERST_NUMBER * TRB_LEN);
		// Single segment table entry: {base, size, reserved}.
		unsafe {
			let entry = erst.as_ptr() as *mut u32;
			entry.write_volatile(base_dev as u32);
			entry.add(1).write_volatile((base_dev >> 32) as u32);
			entry.add(2).write_volatile(EVENT_RING_TRB_NUMBER as u32);
			entry.add(3).write_volatile(0);
		}

		Ok(Self {
			base,
			base_dev,
			erst,
			erst_dev,
			trb_count: EVENT_RING_TRB_NUMBER,
			dequeue: 0,
			cycle_state: true,
			interrupter,
		})
	}

	pub fn interrupter(&self) -> u8 {
		self.interrupter
	}

	pub fn base_dev(&self) -> u64 {
		self.base_dev
	}

	pub fn erst_dev(&self) -> u64 {
		self.erst_dev
	}

	pub fn trb_count(&self) -> usize {
		self.trb_count
	}

	fn slot(&self, index: usize) -> *mut [u32; 4] {
		debug_assert!(index < self.trb_count);
		unsafe { self.base.as_ptr().add(index * TRB_LEN) as *mut [u32; 4] }
	}

	pub fn read_trb(&self, index: usize) -> Trb {
		fence(Ordering::Acquire);
		Trb(unsafe { self.slot(index).read_volatile() })
	}

	pub fn dequeue_index(&self) -> usize {
		self.dequeue
	}

	pub fn dequeue_dev(&self) -> u64 {
		self.base_dev + (self.dequeue * TRB_LEN) as u64
	}

	pub fn index_of(&self, dev: u64) -> Option<usize> {
		let span = (self.trb_count * TRB_LEN) as u64;
		if dev < self.base_dev || dev >= self.base_dev + span {
			return None;
		}
		Some(((dev - self.base_dev) as usize) / TRB_LEN)
	}

	pub fn next_index(&self, index: usize) -> usize {
		(index + 1) % self.trb_count
	}

	/// Where the controller will write its next event, derived by following
	/// cycle bits from the software dequeue pointer.
	pub fn hw_enqueue(&self) -> usize {
		let mut index = self.dequeue;
		let mut expected = self.cycle_state;
		for _ in 0..self.trb_count {
			if self.read_trb(index).cycle() != expected {
				break;
			}
			index = self.next_index(index);
			if index == 0 {
				expected = !expected;
			}
		}
		index
	}

	/// Pop the event at the dequeue pointer, if the controller has produced
	/// one. The consumer cycle state flips on wrap-around.
	pub fn pop(&mut self) -> Option<Trb> {
		let trb = self.read_trb(self.dequeue);
		if trb.cycle() != self.cycle_state {
			return None;
		}
		self.advance();
		Some(trb)
	}

	fn advance(&mut self) {
		self.dequeue = self.next_index(self.dequeue);
		if self.dequeue == 0 {
			self.cycle_state = !self.cycle_state;
		}
	}

	/// Move the consumer cursor up to `target`, flipping CCS on each wrap.
	pub fn advance_to(&mut self, target: usize) {
		for _ in 0..self.trb_count {
			if self.dequeue == target {
				break;
			}
			self.advance();
		}
	}

	pub fn free<E: PciIo>(self, pool: &mut Pool, env: &E) {
		pool.free(env, self.base, self.trb_count * TRB_LEN);
		pool.free(env, self.erst, ERST_NUMBER * TRB_LEN);
	}
}
