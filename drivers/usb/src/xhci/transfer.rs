//! The URB engine: builds transfer TRBs, polls completions off the event
//! rings and carries the asynchronous interrupt-transfer list.

use super::ring::{
	Trb, TRB_COMPLETION_BABBLE_ERROR, TRB_COMPLETION_DATA_BUFFER_ERROR,
	TRB_COMPLETION_SHORT_PACKET, TRB_COMPLETION_STALL_ERROR, TRB_COMPLETION_SUCCESS,
	TRB_COMPLETION_USB_TRANSACTION_ERROR, TRB_LEN, TRB_TYPE_COMMAND_COMPLT_EVENT,
	TRB_TYPE_DATA_STAGE, TRB_TYPE_ISOCH, TRB_TYPE_NORMAL, TRB_TYPE_TRANS_EVENT,
};
use super::reg::{XHC_ERDP_OFFSET, XHC_GENERIC_TIMEOUT};
use super::Xhci;
use crate::env::{Firmware, PciIo, Tpl};
use crate::mem::Pool;
use crate::usb::{DeviceRequest, Direction, Speed, TransferResult};
use crate::{Error, Result};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use log::{debug, error, trace};
use xhci::ring::trb::transfer::{self, TransferType};

/// Interrupter (and event ring) assignment per transfer class.
pub const CMD_INTER: usize = 0;
pub const CTRL_INTER: usize = 1;
pub const BULK_INTER: usize = 2;
pub const INT_INTER: usize = 3;
pub const INT_INTER_ASYNC: usize = 4;
pub const EVENT_RING_COUNT: usize = 5;

/// Synchronous completion polling step, in microseconds.
pub const XHC_SYNC_POLL_INTERVAL: usize = 20 * 1000;

/// A single Normal TRB moves at most this much data.
const TRB_MAX_DATA: usize = 0x1_0000;

/// Callback invoked for every completed round of an asynchronous interrupt
/// transfer.
pub type AsyncCallback = Box<dyn FnMut(&[u8], TransferResult)>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum TransferClass {
	Command,
	Control,
	Bulk,
	IntSync,
	IntAsync,
}

impl TransferClass {
	pub fn interrupter(self) -> usize {
		match self {
			Self::Command => CMD_INTER,
			Self::Control => CTRL_INTER,
			Self::Bulk => BULK_INTER,
			Self::IntSync => INT_INTER,
			Self::IntAsync => INT_INTER_ASYNC,
		}
	}
}

/// Staging buffer in pool memory; the controller only ever sees pool-owned
/// addresses, never the caller's.
pub(super) struct Bounce {
	ptr: NonNull<u8>,
	dev: u64,
	len: usize,
}

impl Bounce {
	pub fn new<E: PciIo>(pool: &mut Pool, env: &E, len: usize) -> Result<Self> {
		let ptr = pool.alloc(env, len, false)?;
		let dev = pool.host_to_device(ptr.as_ptr(), len);
		Ok(Self { ptr, dev, len })
	}

	pub fn dev_at(&self, offset: usize) -> u64 {
		debug_assert!(offset < self.len);
		self.dev + offset as u64
	}

	pub fn copy_in(&mut self, data: &[u8]) {
		debug_assert!(data.len() <= self.len);
		unsafe {
			core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
		}
	}

	pub fn copy_out(&self, data: &mut [u8], count: usize) {
		let count = count.min(self.len).min(data.len());
		unsafe {
			core::ptr::copy_nonoverlapping(self.ptr.as_ptr(), data.as_mut_ptr(), count);
		}
	}

	pub fn as_slice(&self, count: usize) -> &[u8] {
		let count = count.min(self.len);
		unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), count) }
	}

	pub fn free<E: PciIo>(self, pool: &mut Pool, env: &E) {
		pool.free(env, self.ptr, self.len);
	}
}

/// Endpoint identity a URB targets, in bus-driver terms.
#[derive(Clone, Copy, Debug)]
pub(super) struct EndpointInfo {
	pub dev_addr: u8,
	pub ep_num: u8,
	pub direction: Direction,
	pub speed: Speed,
	pub max_packet: usize,
}

/// One USB request block: the software side of a transfer from submission
/// through event consumption.
pub(super) struct Urb {
	pub ep: EndpointInfo,
	pub class: TransferClass,
	pub request: Option<DeviceRequest>,
	pub bounce: Option<Bounce>,
	pub data_len: usize,
	/// Device-address range of the transfer ring the TRBs sit on.
	pub ring_base_dev: u64,
	pub ring_trbs: usize,
	pub trb_start: u64,
	pub trb_end: u64,
	pub trb_num: usize,
	/// Event-ring index to start scanning from.
	pub evt_start: usize,
	pub result: TransferResult,
	pub completed: usize,
	/// The completion event matching the last TRB, once seen.
	pub event: Option<Trb>,
	pub callback: Option<AsyncCallback>,
	pub polling_interval: usize,
}

impl Urb {
	pub fn new(
		ep: EndpointInfo,
		class: TransferClass,
		request: Option<DeviceRequest>,
		data_len: usize,
	) -> Self {
		Self {
			ep,
			class,
			request,
			bounce: None,
			data_len,
			ring_base_dev: 0,
			ring_trbs: 0,
			trb_start: 0,
			trb_end: 0,
			trb_num: 0,
			evt_start: 0,
			result: TransferResult::empty(),
			completed: 0,
			event: None,
			callback: None,
			polling_interval: 0,
		}
	}

	pub fn dci(&self) -> u8 {
		endpoint_to_dci(self.ep.ep_num, self.ep.direction)
	}

	fn owns_trb(&self, dev: u64) -> bool {
		dev >= self.ring_base_dev && dev < self.ring_base_dev + (self.ring_trbs * TRB_LEN) as u64
	}

	pub fn free<E: PciIo>(self, pool: &mut Pool, env: &E) {
		if let Some(bounce) = self.bounce {
			bounce.free(pool, env);
		}
	}
}

/// Map an endpoint number and direction onto a Device Context Index.
pub fn endpoint_to_dci(ep_num: u8, direction: Direction) -> u8 {
	if ep_num == 0 {
		1
	} else {
		2 * ep_num + if direction == Direction::In { 1 } else { 0 }
	}
}

impl<E: PciIo + Firmware> Xhci<E> {
	pub(super) fn ring_doorbell(&self, slot_id: u8, dci: u8) {
		if slot_id == 0 {
			self.regs.write_db(0, 0);
		} else {
			self.regs.write_db(slot_id, dci.into());
		}
	}

	/// Lay the URB's TRBs onto its endpoint's transfer ring. Re-invoked on
	/// the same URB to arm the next round of an async interrupt transfer.
	pub(super) fn build_transfer_trbs(&mut self, urb: &mut Urb) -> Result<()> {
		let slot_id = self.bus_addr_to_slot_id(urb.ep.dev_addr);
		if slot_id == 0 {
			return Err(Error::DeviceError);
		}
		let dci = urb.dci();
		let interrupter = urb.class.interrupter();

		urb.trb_num = 0;
		urb.event = None;
		urb.evt_start = self.event_rings[interrupter].hw_enqueue();

		let data_dev: Option<(u64, usize)> = urb
			.bounce
			.as_ref()
			.filter(|_| urb.data_len > 0)
			.map(|b| (b.dev_at(0), urb.data_len));

		let ring = self.slots[usize::from(slot_id)].rings[usize::from(dci) - 1]
			.as_mut()
			.ok_or(Error::DeviceError)?;
		urb.ring_base_dev = ring.base_dev();
		urb.ring_trbs = ring.trb_count();

		match urb.class {
			TransferClass::Control => {
				let request = urb.request.as_ref().ok_or(Error::InvalidParameter)?;

				let mut setup = transfer::SetupStage::new();
				setup
					.set_request_type(request.request_type)
					.set_request(request.request)
					.set_value(request.value)
					.set_index(request.index)
					.set_length(request.length)
					.set_interrupter_target(interrupter as u16)
					.set_interrupt_on_completion();
				setup.set_transfer_type(match (data_dev.is_some(), urb.ep.direction) {
					(false, _) => TransferType::No,
					(true, Direction::In) => TransferType::In,
					(true, Direction::Out) => TransferType::Out,
				});
				urb.trb_start = ring.enqueue(transfer::Allowed::SetupStage(setup).into_raw());
				urb.trb_num += 1;

				if let Some((dev, len)) = data_dev {
					let mut data = transfer::DataStage::new();
					data.set_data_buffer_pointer(dev)
						.set_trb_transfer_length(len as u32)
						.set_interrupter_target(interrupter as u16)
						.set_interrupt_on_short_packet()
						.set_interrupt_on_completion()
						.set_direction(match urb.ep.direction {
							Direction::In => transfer::Direction::In,
							Direction::Out => transfer::Direction::Out,
						});
					ring.enqueue(transfer::Allowed::DataStage(data).into_raw());
					urb.trb_num += 1;
				}

				let mut status = transfer::StatusStage::new();
				status
					.set_interrupter_target(interrupter as u16)
					.set_interrupt_on_completion();
				// Status stage runs opposite to the data stage; with no data
				// stage the direction bit stays clear.
				if data_dev.is_some() && urb.ep.direction == Direction::Out {
					status.set_direction();
				}
				urb.trb_end = ring.enqueue(transfer::Allowed::StatusStage(status).into_raw());
				urb.trb_num += 1;
				ring.sync();
			}
			TransferClass::Bulk | TransferClass::IntSync | TransferClass::IntAsync => {
				let (dev, len) = data_dev.ok_or(Error::InvalidParameter)?;
				let mut offset = 0;
				let mut first = None;
				let mut last = 0;
				while offset < len {
					let chunk = (len - offset).min(TRB_MAX_DATA);
					let mut normal = transfer::Normal::new();
					normal
						.set_data_buffer_pointer(dev + offset as u64)
						.set_trb_transfer_length(chunk as u32)
						.set_td_size(0)
						.set_interrupter_target(interrupter as u16)
						.set_interrupt_on_short_packet()
						.set_interrupt_on_completion();
					let id = ring.enqueue(transfer::Allowed::Normal(normal).into_raw());
					first.get_or_insert(id);
					last = id;
					urb.trb_num += 1;
					offset += chunk;
				}
				urb.trb_start = first.ok_or(Error::InvalidParameter)?;
				urb.trb_end = last;
				ring.sync();
			}
			TransferClass::Command => return Err(Error::InvalidParameter),
		}
		Ok(())
	}

	/// Scan the URB's event ring for completions and fold them into the URB.
	///
	/// `Err(NotReady)` means the controller has not finished the URB yet;
	/// the scan restarts from the URB's recorded start position every call,
	/// so the result is recomputed from scratch each time.
	pub(super) fn check_urb_result(&mut self, urb: &mut Urb) -> Result<()> {
		urb.completed = 0;
		urb.result = TransferResult::empty();

		if self.regs.is_halted() || self.regs.is_sys_error() {
			urb.result |= TransferResult::SYSTEM;
			return Err(Error::DeviceError);
		}

		let interrupter = urb.class.interrupter();
		let mut status = Err(Error::NotReady);
		let mut start_done = false;
		let mut end_done = false;

		let er = &self.event_rings[interrupter];
		let enqueue = er.hw_enqueue();
		let moved = er.dequeue_index() != enqueue;
		let mut index = urb.evt_start;

		for _ in 0..er.trb_count() {
			if index == enqueue {
				break;
			}
			let event = er.read_trb(index);
			index = er.next_index(index);

			match event.trb_type() {
				TRB_TYPE_TRANS_EVENT | TRB_TYPE_COMMAND_COMPLT_EVENT => {}
				_ => continue,
			}
			let pointer = event.pointer();

			match event.completion_code() {
				TRB_COMPLETION_STALL_ERROR => {
					error!("transfer stalled");
					urb.result |= TransferResult::STALL;
					urb.event = Some(event);
					status = Err(Error::DeviceError);
					break;
				}
				TRB_COMPLETION_BABBLE_ERROR => {
					error!("transfer babble");
					urb.result |= TransferResult::BABBLE;
					urb.event = Some(event);
					status = Err(Error::DeviceError);
					break;
				}
				TRB_COMPLETION_DATA_BUFFER_ERROR => {
					error!("transfer data buffer error");
					urb.result |= TransferResult::BUFFER;
					urb.event = Some(event);
					status = Err(Error::DeviceError);
					break;
				}
				TRB_COMPLETION_USB_TRANSACTION_ERROR => {
					error!("usb transaction error");
					urb.result |= TransferResult::TRANSACTION;
					urb.event = Some(event);
					status = Err(Error::DeviceError);
					break;
				}
				TRB_COMPLETION_SUCCESS | TRB_COMPLETION_SHORT_PACKET => {
					if urb.owns_trb(pointer) {
						if event.completion_code() == TRB_COMPLETION_SHORT_PACKET {
							debug!("short packet, residual {}", event.residual());
						}
						// Transferred bytes of this TD = TRB length field
						// minus the event's residual.
						let trb = self.read_ring_trb(pointer);
						match trb.trb_type() {
							TRB_TYPE_DATA_STAGE | TRB_TYPE_NORMAL | TRB_TYPE_ISOCH => {
								let posted = trb.0[2] & 0x1_ffff;
								urb.completed +=
									posted.saturating_sub(event.residual()) as usize;
							}
							_ => {}
						}
					}
				}
				code => {
					error!("transfer completion error {}", code);
					urb.result |= TransferResult::TIMEOUT;
					urb.event = Some(event);
					status = Err(Error::DeviceError);
					break;
				}
			}

			// Only the first and last TRB of the block decide completion.
			if pointer == urb.trb_start {
				start_done = true;
			}
			if pointer == urb.trb_end {
				end_done = true;
				urb.event = Some(event);
			}
			if start_done && end_done {
				status = Ok(());
				break;
			}
		}

		if status == Err(Error::NotReady) {
			urb.result |= TransferResult::TIMEOUT;
		}

		self.event_rings[interrupter].advance_to(enqueue);
		if moved {
			let dequeue = self.event_rings[interrupter].dequeue_dev();
			// Bit 3 acknowledges the batch (event handler busy).
			self.regs
				.write_rt64(XHC_ERDP_OFFSET + 32 * interrupter as u32, dequeue | 1 << 3);
		}
		status
	}

	fn read_ring_trb(&self, dev: u64) -> Trb {
		let host = self.pool.device_to_host(dev, TRB_LEN) as *const [u32; 4];
		Trb(unsafe { host.read_volatile() })
	}

	/// Ring the doorbell and poll the URB to completion.
	pub(super) fn exec_transfer(&mut self, urb: &mut Urb, timeout_ms: usize) -> Result<()> {
		let (slot_id, dci) = if urb.class == TransferClass::Command {
			(0, 0)
		} else {
			let slot_id = self.bus_addr_to_slot_id(urb.ep.dev_addr);
			if slot_id == 0 {
				return Err(Error::DeviceError);
			}
			(slot_id, urb.dci())
		};

		// Timeout zero follows the upstream convention: poll until done.
		let loops = if timeout_ms == 0 {
			u32::MAX as usize
		} else {
			timeout_ms * 1000 / XHC_SYNC_POLL_INTERVAL + 1
		};

		trace!(
			"executing {:?} urb, {} TRBs on slot {} dci {}",
			urb.class,
			urb.trb_num,
			slot_id,
			dci
		);
		self.ring_doorbell(slot_id, dci);

		for _ in 0..loops {
			match self.check_urb_result(urb) {
				Err(Error::NotReady) => self.regs.env.stall(XHC_SYNC_POLL_INTERVAL),
				other => return other,
			}
		}
		urb.result = TransferResult::TIMEOUT;
		Err(Error::Timeout)
	}

	/// Remove the timed-out URB's TRBs from its endpoint: Stop Endpoint,
	/// then Set TR Dequeue past the dangling block. If the URB actually
	/// finished between the timeout and the stop, reports `AlreadyStarted`
	/// and leaves the (successful) URB result intact.
	pub(super) fn dequeue_trb_from_endpoint(&mut self, urb: &mut Urb) -> Result<()> {
		let slot_id = self.bus_addr_to_slot_id(urb.ep.dev_addr);
		if slot_id == 0 {
			return Err(Error::DeviceError);
		}
		let dci = urb.dci();

		self.stop_endpoint(slot_id, dci)?;
		let finished = self.check_urb_result(urb).is_ok();
		self.set_tr_dequeue(slot_id, dci)?;

		if finished {
			Err(Error::AlreadyStarted)
		} else {
			Ok(())
		}
	}

	/// Register a new asynchronous interrupt transfer and arm its first
	/// round.
	pub(super) fn insert_async_int_transfer(
		&mut self,
		ep: EndpointInfo,
		data_len: usize,
		polling_interval: usize,
		callback: Option<AsyncCallback>,
	) -> Result<()> {
		let mut urb = Urb::new(ep, TransferClass::IntAsync, None, data_len);
		urb.polling_interval = polling_interval;
		urb.callback = callback;
		urb.bounce = Some(Bounce::new(&mut self.pool, &self.regs.env, data_len)?);
		if let Err(e) = self.build_transfer_trbs(&mut urb) {
			urb.free(&mut self.pool, &self.regs.env);
			return Err(e);
		}
		let slot_id = self.bus_addr_to_slot_id(urb.ep.dev_addr);
		let dci = urb.dci();
		debug!(
			"async interrupt transfer on slot {} dci {}, every {} ms",
			slot_id, dci, urb.polling_interval
		);
		self.async_urbs.insert(urb);
		self.ring_doorbell(slot_id, dci);
		Ok(())
	}

	/// Remove the asynchronous transfer registered for this endpoint.
	pub(super) fn del_async_int_transfer(&mut self, dev_addr: u8, ep_addr: u8) -> Result<()> {
		let direction = if ep_addr & 0x80 != 0 { Direction::In } else { Direction::Out };
		let ep_num = ep_addr & 0x0f;

		let handle = self
			.async_urbs
			.iter()
			.find(|(_, urb)| {
				urb.ep.dev_addr == dev_addr
					&& urb.ep.ep_num == ep_num
					&& urb.ep.direction == direction
			})
			.map(|(handle, _)| handle);
		match handle {
			Some(handle) => {
				if let Some(urb) = self.async_urbs.remove(handle) {
					urb.free(&mut self.pool, &self.regs.env);
				}
				Ok(())
			}
			None => Err(Error::NotFound),
		}
	}

	pub(super) fn del_all_async_int_transfers(&mut self) {
		for handle in self.async_urbs.handles() {
			if let Some(urb) = self.async_urbs.remove(handle) {
				urb.free(&mut self.pool, &self.regs.env);
			}
		}
	}

	/// Periodic monitor: sweep the async list, deliver finished rounds and
	/// re-arm the URBs. Driven from the firmware's ~50 ms poll timer.
	pub fn poll_async_transfers(&mut self) {
		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);

		for handle in self.async_urbs.handles() {
			// The URB leaves the arena while it is being serviced so the
			// engine can borrow it freely.
			let Some(mut urb) = self.async_urbs.remove(handle) else { continue };

			// Device may be gone; keep the registration, skip the round.
			if self.bus_addr_to_slot_id(urb.ep.dev_addr) == 0 {
				self.async_urbs.insert(urb);
				continue;
			}

			match self.check_urb_result(&mut urb) {
				Err(Error::NotReady) => {
					self.async_urbs.insert(urb);
					continue;
				}
				_ => {}
			}

			// Copy out before the URB is rebuilt; the callback gets its own
			// snapshot. An allocation failure just skips this round's data.
			let mut snapshot: Option<Vec<u8>> = None;
			if urb.result.is_empty() {
				let completed = urb.completed.min(urb.data_len);
				if let Some(bounce) = urb.bounce.as_ref() {
					snapshot = Some(bounce.as_slice(completed).to_vec());
				}
			}

			let result = urb.result;
			let completed = urb.completed;

			// Re-arm for the next interval on success; errors leave the
			// ring untouched for the bus driver to recover.
			if result.is_empty() {
				if self.build_transfer_trbs(&mut urb).is_ok() {
					let slot_id = self.bus_addr_to_slot_id(urb.ep.dev_addr);
					let dci = urb.dci();
					self.ring_doorbell(slot_id, dci);
				}
			}

			if let Some(callback) = urb.callback.as_mut() {
				// Callbacks may need to run below the notify tier; drop to
				// the caller's level for the duration.
				self.regs.env.restore_tpl(old_tpl);
				let data = snapshot.as_deref().unwrap_or(&[]);
				trace!("async interrupt callback, {} bytes", completed);
				callback(data, result);
				self.regs.env.raise_tpl(Tpl::NOTIFY);
			}

			self.async_urbs.insert(urb);
		}

		self.regs.env.restore_tpl(old_tpl);
	}

	/// Synchronous one-shot transfer shared by the control, bulk and
	/// interrupt entry points: stage data in, execute, recover, stage out.
	pub(super) fn transfer(
		&mut self,
		ep: EndpointInfo,
		class: TransferClass,
		request: Option<DeviceRequest>,
		data: Option<&mut [u8]>,
		timeout_ms: usize,
	) -> (Result<()>, TransferResult, usize) {
		let data_len = data.as_ref().map_or(0, |d| d.len());
		let mut urb = Urb::new(ep, class, request, data_len);

		if data_len > 0 {
			let mut bounce = match Bounce::new(&mut self.pool, &self.regs.env, data_len) {
				Ok(b) => b,
				Err(e) => return (Err(e), TransferResult::SYSTEM, 0),
			};
			if ep.direction == Direction::Out {
				if let Some(out) = data.as_ref() {
					bounce.copy_in(out);
				}
			}
			urb.bounce = Some(bounce);
		}

		if let Err(e) = self.build_transfer_trbs(&mut urb) {
			urb.free(&mut self.pool, &self.regs.env);
			return (Err(e), TransferResult::SYSTEM, 0);
		}

		let mut status = self.exec_transfer(&mut urb, timeout_ms);

		if status == Err(Error::Timeout) {
			// Pull the dangling TRBs off the ring. The URB may win the race
			// and complete while the endpoint stops; that is a success.
			match self.dequeue_trb_from_endpoint(&mut urb) {
				Err(Error::AlreadyStarted) => {
					debug!("pending URB finished before the endpoint stopped");
					status = Ok(());
				}
				Err(e) => error!("failed to dequeue timed-out TRBs: {:?}", e),
				Ok(()) => {}
			}
		}

		// A halted endpoint stays halted until it is reset and its dequeue
		// pointer moves past the offending TD.
		if urb
			.result
			.intersects(TransferResult::STALL | TransferResult::BABBLE | TransferResult::TRANSACTION)
		{
			if let Err(e) = self.recover_halted_endpoint(&urb) {
				error!("failed to recover halted endpoint: {:?}", e);
			}
		}

		if ep.direction == Direction::In {
			if let (Some(data), Some(bounce)) = (data, urb.bounce.as_ref()) {
				bounce.copy_out(data, urb.completed);
			}
		}

		let result = urb.result;
		let completed = urb.completed;
		urb.free(&mut self.pool, &self.regs.env);
		self.regs.env.flush();
		(status, result, completed)
	}

	pub(super) fn recover_halted_endpoint(&mut self, urb: &Urb) -> Result<()> {
		let slot_id = self.bus_addr_to_slot_id(urb.ep.dev_addr);
		if slot_id == 0 {
			return Err(Error::DeviceError);
		}
		let dci = urb.dci();
		debug!("recovering halted endpoint, slot {} dci {}", slot_id, dci);

		self.reset_endpoint(slot_id, dci)?;
		self.set_tr_dequeue(slot_id, dci)?;
		self.ring_doorbell(slot_id, dci);
		Ok(())
	}

	fn reset_endpoint(&mut self, slot_id: u8, dci: u8) -> Result<()> {
		use xhci::ring::trb::command;
		let cmd = *command::ResetEndpoint::new()
			.set_endpoint_id(dci)
			.set_slot_id(slot_id);
		self.cmd_transfer(command::Allowed::ResetEndpoint(cmd), XHC_GENERIC_TIMEOUT)
			.map(|_| ())
	}

	fn stop_endpoint(&mut self, slot_id: u8, dci: u8) -> Result<()> {
		use xhci::ring::trb::command;
		let cmd = *command::StopEndpoint::new()
			.set_endpoint_id(dci)
			.set_slot_id(slot_id);
		self.cmd_transfer(command::Allowed::StopEndpoint(cmd), XHC_GENERIC_TIMEOUT)
			.map(|_| ())
	}

	/// Point the endpoint's hardware dequeue at the ring's enqueue position
	/// with the current producer cycle state.
	fn set_tr_dequeue(&mut self, slot_id: u8, dci: u8) -> Result<()> {
		use xhci::ring::trb::command;
		let (pointer, cycle) = {
			let ring = self.slots[usize::from(slot_id)].rings[usize::from(dci) - 1]
				.as_ref()
				.ok_or(Error::DeviceError)?;
			(ring.enqueue_dev(), ring.cycle_state())
		};
		let mut cmd = command::SetTrDequeuePointer::new();
		cmd.set_new_tr_dequeue_pointer(pointer)
			.set_endpoint_id(dci)
			.set_slot_id(slot_id);
		if cycle {
			cmd.set_dequeue_cycle_state();
		}
		self.cmd_transfer(command::Allowed::SetTrDequeuePointer(cmd), XHC_GENERIC_TIMEOUT)?;
		if let Some(ring) = self.slots[usize::from(slot_id)].rings[usize::from(dci) - 1].as_mut() {
			ring.recycle();
		}
		Ok(())
	}
}
