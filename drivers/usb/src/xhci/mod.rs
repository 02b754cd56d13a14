//! # xHCI controller driver
//!
//! One [`Xhci`] instance drives one PCI controller. Bring-up snapshots the
//! capability registers, takes BIOS ownership, resets the controller and
//! programs the schedule (DCBAA, command ring, one event ring per transfer
//! class); afterwards the public operations mirror the generic USB 2/3
//! host-controller interface the upstream bus layer consumes.
//!
//! [1]: https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf

mod command;
mod context;
mod device;
mod errata;
mod port;
pub mod reg;
pub mod ring;
mod transfer;

use crate::env::{Firmware, PciIo, Tpl};
use crate::mem::Pool;
use crate::usb::{
	request_type, DataDirection, DeviceDescriptor, DeviceRequest, Direction, HubDescriptor,
	RequestKind, Recipient, Speed, TransferResult, DESC_CONFIGURATION, DESC_DEVICE, DESC_HUB,
	DESC_HUB_SUPER_SPEED, REQ_GET_DESCRIPTOR, REQ_GET_STATUS, REQ_SET_ADDRESS,
	REQ_SET_CONFIGURATION, REQ_SET_INTERFACE,
};
use crate::{Error, Result};
use alloc::boxed::Box;
use arena::Arena;
use context::{ContextSize, Dcbaa};
use core::mem;
use device::Slot;
use log::{debug, error, info, warn};
use reg::{
	Regs, XHC_CONFIG_OFFSET, XHC_CRCR_OFFSET, XHC_CRCR_RCS, XHC_DCBAAP_OFFSET,
	XHC_ERDP_OFFSET, XHC_ERSTBA_OFFSET, XHC_ERSTSZ_OFFSET, XHC_GENERIC_TIMEOUT,
	XHC_HCCPARAMS_OFFSET, XHC_HCSPARAMS1_OFFSET, XHC_HCSPARAMS2_OFFSET, XHC_IMAN_IE,
	XHC_IMAN_IP, XHC_IMAN_OFFSET, XHC_PAGESIZE_OFFSET, XHC_PORTSC_PED, XHC_PORTSC_RESET,
	XHC_RESET_TIMEOUT, XHC_USBCMD_INTE, XHC_USBCMD_OFFSET, XHC_USBSTS_HALT,
	XHC_USBSTS_OFFSET, PCI_CLASSCODE_OFFSET, PCI_CLASS_SERIAL, PCI_CLASS_SERIAL_USB,
	PCI_IF_XHCI, PCI_SBRN_OFFSET,
};
use ring::{EventRing, TransferRing, CMD_RING_TRB_NUMBER, ERST_NUMBER};
use transfer::{EndpointInfo, TransferClass, Urb, EVENT_RING_COUNT};

pub use device::RouteString;
pub use transfer::AsyncCallback;

/// Root-hub capability summary reported to the bus layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Capability {
	pub max_speed: Speed,
	pub port_number: u8,
	pub is_64_bit_capable: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HcState {
	Halt,
	Operational,
	Suspend,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResetAttributes {
	Global,
	HostController,
	GlobalWithDebug,
	HostWithDebug,
}

/// A failed transfer: the firmware-level status plus the USB-level result
/// bits and however many bytes made it across before things went wrong.
#[derive(Debug)]
pub struct TransferFailure {
	pub error: Error,
	pub result: TransferResult,
	pub completed: usize,
}

impl TransferFailure {
	fn system(error: Error) -> Self {
		Self { error, result: TransferResult::SYSTEM, completed: 0 }
	}
}

/// One controller instance and everything it owns.
pub struct Xhci<E: PciIo + Firmware> {
	regs: Regs<E>,
	context_size: ContextSize,
	max_slots_en: u8,
	max_ports: u8,
	max_interrupters: u16,
	page_size: usize,
	scratchpad_count: usize,
	port_power_control: bool,
	support_64bit_dma: bool,
	revision: (u8, u8),
	pool: Pool,
	dcbaa: Dcbaa,
	cmd_ring: TransferRing,
	event_rings: [EventRing; EVENT_RING_COUNT],
	slots: Box<[Slot]>,
	async_urbs: Arena<Urb>,
}

fn install_event_ring<E: PciIo + Firmware>(regs: &Regs<E>, ring: &EventRing) {
	let stride = 32 * u32::from(ring.interrupter());
	regs.write_rt(XHC_ERSTSZ_OFFSET + stride, ERST_NUMBER as u32);
	regs.write_rt64(XHC_ERDP_OFFSET + stride, ring.dequeue_dev());
	regs.write_rt64(XHC_ERSTBA_OFFSET + stride, ring.erst_dev());
	regs.set_rt_bit(XHC_IMAN_OFFSET + stride, XHC_IMAN_IE);
}

/// Program the controller's schedule from scratch: CONFIG, the DCBAA with
/// its scratchpads, the command ring and the five per-class event rings.
/// The controller must be halted.
fn build_schedule<E: PciIo + Firmware>(
	regs: &Regs<E>,
	pool: &mut Pool,
	max_slots_en: u8,
	scratchpad_count: usize,
	page_size: usize,
	max_interrupters: u16,
) -> Result<(Dcbaa, TransferRing, [EventRing; EVENT_RING_COUNT])> {
	regs.write_op(XHC_CONFIG_OFFSET, max_slots_en.into());

	let dcbaa = Dcbaa::new(pool, &regs.env, max_slots_en, scratchpad_count, page_size)?;
	regs.write_op64(XHC_DCBAAP_OFFSET, dcbaa.device_addr());
	debug!("DCBAA at {:#x}", dcbaa.device_addr());

	let cmd_ring = TransferRing::new(pool, &regs.env, CMD_RING_TRB_NUMBER)?;
	// The initial cycle state the controller adopts must match the ring's
	// producer cycle state, or it would treat the empty ring as full.
	regs.write_op64(XHC_CRCR_OFFSET, cmd_ring.base_dev() | u64::from(XHC_CRCR_RCS));
	debug!("command ring at {:#x}", cmd_ring.base_dev());

	// The driver polls; interrupt delivery stays off, pending bits cleared.
	regs.clear_op_bit(XHC_USBCMD_OFFSET, XHC_USBCMD_INTE);
	for index in 0..max_interrupters {
		let stride = 32 * u32::from(index);
		regs.clear_rt_bit(XHC_IMAN_OFFSET + stride, XHC_IMAN_IE);
		regs.set_rt_bit(XHC_IMAN_OFFSET + stride, XHC_IMAN_IP);
	}

	let mut make = |interrupter: u8| -> Result<EventRing> {
		let ring = EventRing::new(pool, &regs.env, interrupter)?;
		install_event_ring(regs, &ring);
		Ok(ring)
	};
	let event_rings = [make(0)?, make(1)?, make(2)?, make(3)?, make(4)?];

	Ok((dcbaa, cmd_ring, event_rings))
}

impl<E: PciIo + Firmware> Xhci<E> {
	/// Bind to the controller behind `env`, reset it and bring it to the
	/// running state with an empty schedule.
	pub fn new(env: E) -> Result<Self> {
		let prog_if = env.config_read8(PCI_CLASSCODE_OFFSET)?;
		let subclass = env.config_read8(PCI_CLASSCODE_OFFSET + 1)?;
		let class = env.config_read8(PCI_CLASSCODE_OFFSET + 2)?;
		if (class, subclass, prog_if) != (PCI_CLASS_SERIAL, PCI_CLASS_SERIAL_USB, PCI_IF_XHCI) {
			return Err(Error::Unsupported);
		}
		let sbrn = env.config_read8(PCI_SBRN_OFFSET).unwrap_or(0);
		env.save_attributes();

		let regs = Regs::new(env)?;

		let hcsparams1 = regs.read_cap(XHC_HCSPARAMS1_OFFSET);
		let hcsparams2 = regs.read_cap(XHC_HCSPARAMS2_OFFSET);
		let hccparams = regs.read_cap(XHC_HCCPARAMS_OFFSET);
		if hcsparams1 == 0xffff_ffff {
			regs.env.restore_attributes();
			return Err(Error::DeviceError);
		}

		let max_slots = hcsparams1 as u8;
		let max_interrupters = ((hcsparams1 >> 8) & 0x7ff) as u16;
		let max_ports = (hcsparams1 >> 24) as u8;
		let scratchpad_count =
			(((hcsparams2 >> 21 & 0x1f) << 5) | (hcsparams2 >> 27 & 0x1f)) as usize;
		let ac64 = hccparams & 1 != 0;
		let context_size = ContextSize::from_csz(hccparams & 1 << 2 != 0);
		let port_power_control = hccparams & 1 << 3 != 0;

		let page_bits = regs.read_op(XHC_PAGESIZE_OFFSET);
		if page_bits & !reg::XHC_PAGESIZE_MASK != 0 || page_bits & reg::XHC_PAGESIZE_MASK == 0 {
			error!("bad PAGESIZE register {:#x}", page_bits);
			regs.env.restore_attributes();
			return Err(Error::DeviceError);
		}
		let page_size = 1usize << (31 - (page_bits & reg::XHC_PAGESIZE_MASK).leading_zeros() + 12);

		info!(
			"xHCI {}.{}: {} ports, {} slots, {} scratchpads, page size {}, {:?} contexts",
			sbrn >> 4,
			sbrn & 0xf,
			max_ports,
			max_slots,
			scratchpad_count,
			page_size,
			context_size,
		);
		if let Some(offset) = regs.supported_protocol_addr(2) {
			debug!("USB2 supported-protocol capability at {:#x}", offset);
		}
		if let Some(offset) = regs.supported_protocol_addr(3) {
			debug!("USB3 supported-protocol capability at {:#x}", offset);
		}

		let mut support_64bit_dma = false;
		if ac64 {
			match regs.env.enable_dual_address_cycle() {
				Ok(()) => support_64bit_dma = true,
				Err(e) => warn!("64-bit capable controller without 64-bit DMA: {:?}", e),
			}
		}

		regs.set_bios_ownership();

		if let Err(e) = regs.reset(XHC_RESET_TIMEOUT) {
			error!("controller reset failed: {:?}", e);
			regs.env.restore_attributes();
			return Err(e);
		}
		debug_assert!(regs.is_halted());

		let mut pool = match Pool::new(&regs.env) {
			Ok(pool) => pool,
			Err(e) => {
				regs.env.restore_attributes();
				return Err(e);
			}
		};
		let (dcbaa, cmd_ring, event_rings) = match build_schedule(
			&regs,
			&mut pool,
			max_slots,
			scratchpad_count,
			page_size,
			max_interrupters,
		) {
			Ok(schedule) => schedule,
			Err(e) => {
				pool.release(&regs.env);
				regs.env.restore_attributes();
				return Err(e);
			}
		};

		let mut xhc = Self {
			regs,
			context_size,
			max_slots_en: max_slots,
			max_ports,
			max_interrupters,
			page_size,
			scratchpad_count,
			port_power_control,
			support_64bit_dma,
			revision: (sbrn >> 4, sbrn & 0xf),
			pool,
			dcbaa,
			cmd_ring,
			event_rings,
			slots: (0..=255).map(|_| Slot::new()).collect(),
			async_urbs: Arena::new(),
		};

		xhc.regs.run(XHC_GENERIC_TIMEOUT)?;

		if xhc.regs.errata.no_psce_on_reset {
			// Kick every port once so attached devices produce a connect
			// status change.
			for port in 0..xhc.max_ports {
				let offset = Regs::<E>::portsc_offset(port);
				let state = xhc.regs.read_op(offset) & !XHC_PORTSC_PED;
				xhc.regs.write_op(offset, state | XHC_PORTSC_RESET);
			}
		}

		Ok(xhc)
	}

	pub fn get_capability(&self) -> Capability {
		Capability {
			max_speed: Speed::Super,
			port_number: self.max_ports,
			is_64_bit_capable: self.support_64bit_dma,
		}
	}

	/// Serial-bus release number from PCI configuration space, as
	/// major/minor.
	pub fn revision(&self) -> (u8, u8) {
		self.revision
	}

	pub fn state(&self) -> HcState {
		if self.regs.op_bit_set(XHC_USBSTS_OFFSET, XHC_USBSTS_HALT) {
			HcState::Halt
		} else {
			HcState::Operational
		}
	}

	pub fn set_state(&mut self, state: HcState) -> Result<()> {
		if self.state() == state {
			return Ok(());
		}
		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = match state {
			HcState::Halt => self.regs.halt(XHC_GENERIC_TIMEOUT),
			HcState::Operational => {
				if self.regs.is_sys_error() || !self.regs.is_halted() {
					Err(Error::DeviceError)
				} else {
					self.regs.run(XHC_GENERIC_TIMEOUT)
				}
			}
			HcState::Suspend => Err(Error::Unsupported),
		};
		self.regs.env.flush();
		self.regs.env.restore_tpl(old_tpl);
		debug!("set state {:?}: {:?}", state, result);
		result
	}

	/// Reset the controller and rebuild its schedule. Every slot and every
	/// registered asynchronous transfer is gone afterwards.
	pub fn reset(&mut self, attributes: ResetAttributes) -> Result<()> {
		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = self.reset_locked(attributes);
		self.regs.env.flush();
		self.regs.env.restore_tpl(old_tpl);
		debug!("reset {:?}: {:?}", attributes, result);
		result
	}

	fn reset_locked(&mut self, attributes: ResetAttributes) -> Result<()> {
		match attributes {
			ResetAttributes::Global | ResetAttributes::HostController => {}
			ResetAttributes::GlobalWithDebug | ResetAttributes::HostWithDebug => {
				return Err(Error::Unsupported);
			}
		}

		// A live debug-capability connection would be severed by a reset;
		// leave the controller alone.
		if self.regs.debug_cap_active() {
			return Ok(());
		}

		if !self.regs.is_halted() {
			self.regs.halt(XHC_GENERIC_TIMEOUT).map_err(|_| Error::DeviceError)?;
		}
		self.regs.reset(XHC_RESET_TIMEOUT)?;

		self.del_all_async_int_transfers();
		for index in 1..self.slots.len() {
			device::release_slot(&mut self.slots[index], &mut self.pool, &self.regs.env);
			self.slots[index] = Slot::new();
		}

		let (dcbaa, cmd_ring, event_rings) = build_schedule(
			&self.regs,
			&mut self.pool,
			self.max_slots_en,
			self.scratchpad_count,
			self.page_size,
			self.max_interrupters,
		)?;
		let old = mem::replace(&mut self.dcbaa, dcbaa);
		old.release(&mut self.pool, &self.regs.env);
		let old = mem::replace(&mut self.cmd_ring, cmd_ring);
		old.free(&mut self.pool, &self.regs.env);
		let old = mem::replace(&mut self.event_rings, event_rings);
		for ring in old {
			ring.free(&mut self.pool, &self.regs.env);
		}
		Ok(())
	}

	/// Submit a control transfer. Several standard requests double as
	/// controller commands on xHCI and are hooked here: SET_ADDRESS turns
	/// into address bookkeeping, descriptor reads feed Evaluate Context /
	/// Configure Endpoint, and hub GET_STATUS drives port reconciliation
	/// behind hubs.
	pub fn control_transfer(
		&mut self,
		dev_addr: u8,
		speed: Speed,
		max_packet0: usize,
		request: &DeviceRequest,
		direction: DataDirection,
		mut data: Option<&mut [u8]>,
		timeout_ms: usize,
	) -> core::result::Result<usize, TransferFailure> {
		let data_len = data.as_ref().map_or(0, |d| d.len());
		let invalid = || TransferFailure::system(Error::InvalidParameter);

		match direction {
			DataDirection::NoData if data_len != 0 => return Err(invalid()),
			DataDirection::In | DataDirection::Out if data_len == 0 => return Err(invalid()),
			_ => {}
		}
		if !matches!(max_packet0, 8 | 16 | 32 | 64 | 512) {
			return Err(invalid());
		}
		if speed == Speed::Low && max_packet0 != 8 {
			return Err(invalid());
		}
		if speed == Speed::Super && max_packet0 != 512 {
			return Err(invalid());
		}

		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = self.control_locked(
			dev_addr,
			speed,
			max_packet0,
			request,
			direction,
			data.as_deref_mut(),
			timeout_ms,
		);
		self.regs.env.restore_tpl(old_tpl);
		if let Err(failure) = &result {
			error!(
				"control transfer failed: {:?}, usb result {:?}",
				failure.error, failure.result
			);
		}
		result
	}

	fn control_locked(
		&mut self,
		dev_addr: u8,
		speed: Speed,
		max_packet0: usize,
		request: &DeviceRequest,
		direction: DataDirection,
		mut data: Option<&mut [u8]>,
		timeout_ms: usize,
	) -> core::result::Result<usize, TransferFailure> {
		if self.regs.is_halted() || self.regs.is_sys_error() {
			return Err(TransferFailure::system(Error::DeviceError));
		}
		let slot_id = self.bus_addr_to_slot_id(dev_addr);
		if slot_id == 0 {
			return Err(TransferFailure::system(Error::DeviceError));
		}
		let slot_index = usize::from(slot_id);

		// SET_ADDRESS never reaches the wire: the controller already
		// assigned an address during Address Device. Only the mapping
		// between the two address spaces is recorded.
		if request.request == REQ_SET_ADDRESS
			&& request.request_type
				== request_type(DataDirection::NoData, RequestKind::Standard, Recipient::Device)
		{
			for slot in self.slots.iter_mut() {
				if !slot.enabled && slot.slot_id == 0 && slot.bus_dev_addr == request.value as u8
				{
					slot.bus_dev_addr = 0;
				}
			}
			if self.slots[slot_index].xhci_dev_addr == 0 {
				return Err(TransferFailure::system(Error::DeviceError));
			}
			self.slots[slot_index].bus_dev_addr = request.value as u8;
			return Ok(0);
		}

		let ep = EndpointInfo {
			dev_addr,
			ep_num: 0,
			direction: match direction {
				DataDirection::In => Direction::In,
				DataDirection::Out | DataDirection::NoData => Direction::Out,
			},
			speed,
			max_packet: max_packet0,
		};
		let (status, result, completed) =
			self.transfer(ep, TransferClass::Control, Some(*request), data.as_deref_mut(), timeout_ms);
		if let Err(error) = status {
			return Err(TransferFailure { error, result, completed });
		}

		if let Err(error) =
			self.control_hooks(slot_id, speed, max_packet0, request, data, completed, timeout_ms)
		{
			return Err(TransferFailure { error, result, completed });
		}
		Ok(completed)
	}

	/// Post-transfer interception of the requests whose side effects the
	/// controller needs mirrored into its contexts.
	#[allow(clippy::too_many_arguments)]
	fn control_hooks(
		&mut self,
		slot_id: u8,
		speed: Speed,
		max_packet0: usize,
		request: &DeviceRequest,
		data: Option<&mut [u8]>,
		completed: usize,
		timeout_ms: usize,
	) -> Result<()> {
		let slot_index = usize::from(slot_id);
		let std_in_device =
			request_type(DataDirection::In, RequestKind::Standard, Recipient::Device);
		let class_in_device =
			request_type(DataDirection::In, RequestKind::Class, Recipient::Device);

		if request.request == REQ_GET_DESCRIPTOR
			&& (request.request_type == std_in_device || request.request_type == class_in_device)
		{
			let data = match data {
				Some(data) => data,
				None => return Ok(()),
			};
			let descriptor_type = (request.value >> 8) as u8;
			let data_len = data.len();

			if descriptor_type == DESC_DEVICE
				&& (data_len == 18 || (speed == Speed::Full && data_len == 8))
			{
				let Some(desc) = DeviceDescriptor::parse(data) else { return Ok(()) };
				self.slots[slot_index].dev_desc = Some(desc);
				self.slots[slot_index].conf_desc =
					(0..desc.num_configurations).map(|_| None).collect();
				return self.evaluate_context(slot_id, desc.max_packet0());
			}

			if descriptor_type == DESC_CONFIGURATION && data_len >= 9 {
				// Only a full-length read is worth caching; short probes
				// precede it.
				let declared = u16::from_le_bytes([data[2], data[3]]);
				if data_len == usize::from(declared) {
					let index = usize::from(request.value as u8);
					let num_interfaces = data[4];
					let slot = &mut self.slots[slot_index];
					if index < slot.conf_desc.len() {
						slot.conf_desc[index] = Some(data.to_vec());
						slot.active_alternate = alloc::vec![0; num_interfaces.into()];
					}
				}
				return Ok(());
			}

			if (descriptor_type == DESC_HUB || descriptor_type == DESC_HUB_SUPER_SPEED)
				&& data_len > 2
			{
				let Some(hub) = HubDescriptor::parse(data) else { return Ok(()) };
				if hub.num_ports > 15 {
					warn!("hub reports {} ports, only 15 are routable", hub.num_ports);
				}
				let multi_tt = self.slots[slot_index]
					.dev_desc
					.map_or(false, |d| d.protocol == 2);
				return self.config_hub_context(
					slot_id,
					hub.num_ports.min(15),
					hub.tt_think_time(),
					multi_tt,
				);
			}
			return Ok(());
		}

		if request.request == REQ_SET_CONFIGURATION
			&& request.request_type
				== request_type(DataDirection::NoData, RequestKind::Standard, Recipient::Device)
		{
			let wanted = request.value as u8;
			let config = self.slots[slot_index].conf_desc.iter().flatten().find_map(|bytes| {
				crate::usb::ConfigDescriptor::parse(bytes)
					.filter(|c| c.configuration_value == wanted)
					.map(|_| bytes.clone())
			});
			if let Some(bytes) = config {
				self.set_config_cmd(slot_id, speed, &bytes)?;
				self.slots[slot_index].active_configuration = wanted;
			}
			return Ok(());
		}

		if request.request == REQ_SET_INTERFACE
			&& request.request_type
				== request_type(
					DataDirection::NoData,
					RequestKind::Standard,
					Recipient::Interface,
				) {
			let active = self.slots[slot_index].active_configuration;
			let config = self.slots[slot_index].conf_desc.iter().flatten().find_map(|bytes| {
				crate::usb::ConfigDescriptor::parse(bytes)
					.filter(|c| c.configuration_value == active)
					.map(|_| bytes.clone())
			});
			if let Some(bytes) = config {
				self.set_interface(slot_id, speed, &bytes, request)?;
			}
			return Ok(());
		}

		if request.request == REQ_GET_STATUS
			&& request.request_type
				== request_type(DataDirection::In, RequestKind::Class, Recipient::Other)
		{
			let Some(data) = data else { return Ok(()) };
			if completed < 4 || data.len() < 4 {
				return Ok(());
			}
			// This is a hub answering for one of its downstream ports:
			// translate, acknowledge the change bits on the wire, then
			// reconcile that port as if we had polled it ourselves.
			let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
			let status = port::translate_hub_port_status(speed, raw);

			let hub_addr = self.slots[slot_index].bus_dev_addr;
			for (hw, selector) in port::HUB_CLEAR_MAP {
				if raw & hw == hw {
					let clear = DeviceRequest::clear_hub_port_feature(selector, request.index);
					let _ = self.control_locked(
						hub_addr,
						speed,
						max_packet0,
						&clear,
						DataDirection::NoData,
						None,
						timeout_ms,
					);
				}
			}

			let hub_route = self.slots[slot_index].route;
			if let Err(e) =
				self.poll_port_status_change(hub_route, request.index as u8, &status)
			{
				debug!("hub port reconciliation failed: {:?}", e);
			}

			data[..2].copy_from_slice(&status.status.bits().to_le_bytes());
			data[2..4].copy_from_slice(&status.change.bits().to_le_bytes());
			return Ok(());
		}

		Ok(())
	}

	pub fn bulk_transfer(
		&mut self,
		dev_addr: u8,
		ep_addr: u8,
		speed: Speed,
		max_packet: usize,
		data: &mut [u8],
		data_toggle: u8,
		timeout_ms: usize,
	) -> core::result::Result<usize, TransferFailure> {
		if data.is_empty() || data_toggle > 1 {
			return Err(TransferFailure::system(Error::InvalidParameter));
		}
		let too_big = match speed {
			Speed::Low => true,
			Speed::Full => max_packet > 64,
			Speed::High => max_packet > 512,
			Speed::Super => max_packet > 1024,
		};
		if too_big {
			return Err(TransferFailure::system(Error::InvalidParameter));
		}
		self.simple_transfer(dev_addr, ep_addr, speed, max_packet, TransferClass::Bulk, data, timeout_ms)
	}

	pub fn sync_interrupt_transfer(
		&mut self,
		dev_addr: u8,
		ep_addr: u8,
		speed: Speed,
		max_packet: usize,
		data: &mut [u8],
		data_toggle: u8,
		timeout_ms: usize,
	) -> core::result::Result<usize, TransferFailure> {
		if data.is_empty() || data_toggle > 1 {
			return Err(TransferFailure::system(Error::InvalidParameter));
		}
		let bad = match speed {
			Speed::Low => max_packet != 8,
			Speed::Full => max_packet > 64,
			Speed::High => max_packet > 3072,
			Speed::Super => false,
		};
		if bad {
			return Err(TransferFailure::system(Error::InvalidParameter));
		}
		self.simple_transfer(
			dev_addr,
			ep_addr,
			speed,
			max_packet,
			TransferClass::IntSync,
			data,
			timeout_ms,
		)
	}

	fn simple_transfer(
		&mut self,
		dev_addr: u8,
		ep_addr: u8,
		speed: Speed,
		max_packet: usize,
		class: TransferClass,
		data: &mut [u8],
		timeout_ms: usize,
	) -> core::result::Result<usize, TransferFailure> {
		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = (|| {
			if self.regs.is_halted() || self.regs.is_sys_error() {
				return Err(TransferFailure::system(Error::DeviceError));
			}
			if self.bus_addr_to_slot_id(dev_addr) == 0 {
				return Err(TransferFailure::system(Error::DeviceError));
			}
			let ep = EndpointInfo {
				dev_addr,
				ep_num: ep_addr & 0x0f,
				direction: if ep_addr & 0x80 != 0 { Direction::In } else { Direction::Out },
				speed,
				max_packet,
			};
			let (status, result, completed) =
				self.transfer(ep, class, None, Some(data), timeout_ms);
			match status {
				Ok(()) => Ok(completed),
				Err(error) => Err(TransferFailure { error, result, completed }),
			}
		})();
		self.regs.env.restore_tpl(old_tpl);
		if let Err(failure) = &result {
			error!(
				"{:?} transfer failed: {:?}, usb result {:?}",
				class, failure.error, failure.result
			);
		}
		result
	}

	/// Register (or deregister) a periodic interrupt-IN transfer. New
	/// registrations start their first round immediately; rounds complete
	/// from [`Xhci::poll_async_transfers`].
	pub fn async_interrupt_transfer(
		&mut self,
		dev_addr: u8,
		ep_addr: u8,
		speed: Speed,
		max_packet: usize,
		is_new_transfer: bool,
		data_toggle: u8,
		polling_interval_ms: usize,
		data_len: usize,
		callback: Option<AsyncCallback>,
	) -> Result<()> {
		if ep_addr & 0x80 == 0 {
			return Err(Error::InvalidParameter);
		}
		if is_new_transfer
			&& (data_len == 0 || data_toggle > 1 || !(1..=255).contains(&polling_interval_ms))
		{
			return Err(Error::InvalidParameter);
		}

		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = (|| {
			if !is_new_transfer {
				// Deregistration can come after detach; the disabled slot
				// entry still carries the address mapping.
				if !self.slots.iter().any(|s| s.bus_dev_addr == dev_addr && s.slot_id != 0) {
					return Err(Error::InvalidParameter);
				}
				return self.del_async_int_transfer(dev_addr, ep_addr);
			}

			if self.regs.is_halted() || self.regs.is_sys_error() {
				return Err(Error::DeviceError);
			}
			if self.bus_addr_to_slot_id(dev_addr) == 0 {
				return Err(Error::DeviceError);
			}
			let ep = EndpointInfo {
				dev_addr,
				ep_num: ep_addr & 0x0f,
				direction: Direction::In,
				speed,
				max_packet,
			};
			self.insert_async_int_transfer(ep, data_len, polling_interval_ms, callback)
		})();
		self.regs.env.flush();
		self.regs.env.restore_tpl(old_tpl);
		result
	}

	/// Isochronous transfers are not supported by this driver.
	pub fn isochronous_transfer(
		&mut self,
		_dev_addr: u8,
		_ep_addr: u8,
		_speed: Speed,
		_max_packet: usize,
		_data: &mut [u8],
	) -> core::result::Result<usize, TransferFailure> {
		Err(TransferFailure::system(Error::Unsupported))
	}

	/// Asynchronous isochronous transfers are not supported either.
	pub fn async_isochronous_transfer(
		&mut self,
		_dev_addr: u8,
		_ep_addr: u8,
		_speed: Speed,
		_max_packet: usize,
		_data_len: usize,
		_callback: Option<AsyncCallback>,
	) -> Result<()> {
		Err(Error::Unsupported)
	}

	/// Exit-boot-services duty: quiesce DMA, hand the controller to the OS
	/// and put the PCI attributes back. Best effort by design.
	pub fn exit_boot_services(&mut self) {
		let _ = self.regs.halt(XHC_GENERIC_TIMEOUT);
		self.regs.clear_bios_ownership();
		self.regs.env.restore_attributes();
	}

	/// Orderly driver stop: tear down every slot, halt and release all
	/// resources.
	pub fn stop(mut self) {
		for slot_id in 1..=255u8 {
			let slot = &self.slots[usize::from(slot_id)];
			if slot.enabled && slot.slot_id != 0 {
				if let Err(e) = self.disable_slot_cmd(slot_id) {
					warn!("failed to disable slot {} on stop: {:?}", slot_id, e);
				}
			}
		}
		let _ = self.regs.halt(XHC_GENERIC_TIMEOUT);
		self.regs.clear_bios_ownership();
		self.del_all_async_int_transfers();

		let Self { regs, mut pool, dcbaa, cmd_ring, event_rings, mut slots, .. } = self;
		for slot in slots.iter_mut() {
			device::release_slot(slot, &mut pool, &regs.env);
		}
		dcbaa.release(&mut pool, &regs.env);
		cmd_ring.free(&mut pool, &regs.env);
		for ring in event_rings {
			ring.free(&mut pool, &regs.env);
		}
		pool.release(&regs.env);
		regs.env.restore_attributes();
	}

	// Introspection used by diagnostics and the test suite.

	/// Slot id currently assigned to a topological position, if any.
	pub fn slot_at_route(&self, route: RouteString) -> Option<u8> {
		match self.route_to_slot_id(route) {
			0 => None,
			id => Some(id),
		}
	}

	/// Controller-assigned USB address of a slot, 0 when unaddressed.
	pub fn slot_xhci_address(&self, slot_id: u8) -> u8 {
		self.slots[usize::from(slot_id)].xhci_dev_addr
	}

	pub fn slot_enabled(&self, slot_id: u8) -> bool {
		self.slots[usize::from(slot_id)].enabled
	}

	/// Raw DCBAA entry for a slot.
	pub fn dcbaa_entry(&self, slot_id: u8) -> u64 {
		self.dcbaa.get(slot_id)
	}

	/// Number of asynchronous interrupt transfers currently registered.
	pub fn async_transfer_count(&self) -> usize {
		self.async_urbs.len()
	}
}
