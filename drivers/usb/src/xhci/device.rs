//! Device-slot lifecycle: the slot table, slot-id lookups, and the command
//! sequences that create, configure and tear down slots.

use super::context::{DeviceContext, InputContext};
use super::reg::XHC_GENERIC_TIMEOUT;
use super::ring::{TransferRing, TR_RING_TRB_NUMBER};
use super::transfer::endpoint_to_dci;
use super::Xhci;
use crate::env::{Firmware, PciIo};
use crate::mem::Pool;
use crate::usb::{DeviceDescriptor, DeviceRequest, EndpointDescriptor, EndpointKind, Speed};
use crate::{Error, Result};
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use xhci::context::{
	DeviceHandler, EndpointHandler, EndpointType, InputControlHandler, InputHandler, SlotHandler,
};
use xhci::ring::trb::command;

/// Hierarchical position of a device: a 20-bit route string, the root port
/// it hangs off and its hub tier.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct RouteString(u32);

impl RouteString {
	pub fn from_raw(raw: u32) -> Self {
		Self(raw)
	}

	pub fn raw(self) -> u32 {
		self.0
	}

	pub fn route(self) -> u32 {
		self.0 & 0xf_ffff
	}

	pub fn root_port(self) -> u8 {
		(self.0 >> 20) as u8
	}

	pub fn tier(self) -> u8 {
		(self.0 >> 28) as u8
	}

	fn pack(route: u32, root_port: u8, tier: u8) -> Self {
		Self((route & 0xf_ffff) | u32::from(root_port) << 20 | u32::from(tier) << 28)
	}

	/// Position of a child device. A zero parent is the root hub itself and
	/// `port` is zero-based; below a hub `port` is the one-based downstream
	/// port number. Ports beyond 15 are truncated into the 4-bit tier slot.
	pub fn child(self, port: u8) -> Self {
		if self.0 == 0 {
			return Self::pack(0, port + 1, 1);
		}
		let nibble = u32::from(port.min(15));
		let shift = 4 * (u32::from(self.tier()) - 1);
		let route = self.route() | nibble.checked_shl(shift).unwrap_or(0);
		Self::pack(route, self.root_port(), self.tier() + 1)
	}
}

/// Per-slot software state, mirroring what the controller tracks in its
/// device context.
pub(super) struct Slot {
	pub enabled: bool,
	pub slot_id: u8,
	pub route: RouteString,
	pub parent_route: RouteString,
	/// Address the controller assigned through Address Device.
	pub xhci_dev_addr: u8,
	/// Address the bus driver believes the device has; recorded when its
	/// SET_ADDRESS request is hooked.
	pub bus_dev_addr: u8,
	pub input: Option<InputContext>,
	pub output: Option<DeviceContext>,
	/// Transfer rings indexed by DCI - 1.
	pub rings: [Option<TransferRing>; 31],
	pub dev_desc: Option<DeviceDescriptor>,
	/// Raw configuration descriptors, indexed by configuration index.
	pub conf_desc: Vec<Option<Vec<u8>>>,
	pub active_configuration: u8,
	pub active_alternate: Vec<u8>,
}

impl Slot {
	pub fn new() -> Self {
		Self {
			enabled: false,
			slot_id: 0,
			route: RouteString::default(),
			parent_route: RouteString::default(),
			xhci_dev_addr: 0,
			bus_dev_addr: 0,
			input: None,
			output: None,
			rings: core::array::from_fn(|_| None),
			dev_desc: None,
			conf_desc: Vec::new(),
			active_configuration: 0,
			active_alternate: Vec::new(),
		}
	}
}

/// Free everything a slot entry owns back into the pool, leaving the entry
/// disabled but with its address bookkeeping intact.
pub(super) fn release_slot<E: PciIo>(slot: &mut Slot, pool: &mut Pool, env: &E) {
	for ring in slot.rings.iter_mut() {
		if let Some(ring) = ring.take() {
			ring.free(pool, env);
		}
	}
	if let Some(input) = slot.input.take() {
		input.free(pool, env);
	}
	if let Some(output) = slot.output.take() {
		output.free(pool, env);
	}
	slot.dev_desc = None;
	slot.conf_desc.clear();
	slot.active_alternate.clear();
	slot.enabled = false;
}

/// Populate one endpoint's input context from its descriptor, allocating the
/// transfer ring on first use. Tracks the highest DCI touched.
fn init_endpoint_context<E: PciIo>(
	pool: &mut Pool,
	env: &E,
	slot: &mut Slot,
	speed: Speed,
	ep: &EndpointDescriptor,
	max_dci: &mut u8,
) -> Result<()> {
	let dci = endpoint_to_dci(ep.number(), ep.direction());
	if dci > *max_dci {
		*max_dci = dci;
	}

	let kind = ep.kind();
	if kind == EndpointKind::Control {
		debug!("control endpoint in configuration, ignoring");
		return Ok(());
	}

	// Isochronous endpoints get a context but never a ring; transfers to
	// them are rejected at submission.
	let ring_state = if kind == EndpointKind::Isochronous {
		None
	} else {
		if slot.rings[usize::from(dci) - 1].is_none() {
			let ring = TransferRing::new(pool, env, TR_RING_TRB_NUMBER)?;
			slot.rings[usize::from(dci) - 1] = Some(ring);
		}
		let ring = slot.rings[usize::from(dci) - 1].as_ref().ok_or(Error::DeviceError)?;
		Some((ring.base_dev(), ring.cycle_state()))
	};

	let handler = slot.input.as_mut().ok_or(Error::DeviceError)?.handler();
	handler.control_mut().set_add_context_flag(dci.into());
	let ctx = handler.device_mut().endpoint_mut(dci.into());
	ctx.set_max_packet_size(ep.max_packet_size);
	ctx.set_max_burst_size(0);

	match kind {
		EndpointKind::Bulk => {
			ctx.set_endpoint_type(match ep.direction() {
				crate::usb::Direction::In => EndpointType::BulkIn,
				crate::usb::Direction::Out => EndpointType::BulkOut,
			});
			ctx.set_error_count(3);
			ctx.set_average_trb_length(0x1000);
		}
		EndpointKind::Interrupt => {
			ctx.set_endpoint_type(match ep.direction() {
				crate::usb::Direction::In => EndpointType::InterruptIn,
				crate::usb::Direction::Out => EndpointType::InterruptOut,
			});
			ctx.set_error_count(3);
			ctx.set_average_trb_length(0x1000);
			match speed {
				// Full/low-speed interrupt intervals are frame counts the
				// controller cannot take directly; pin the service interval
				// at 2^6 microframes (8 ms).
				Speed::Full | Speed::Low => {
					ctx.set_interval(6);
					ctx.set_max_endpoint_service_time_interval_payload_low(
						ep.max_packet_size,
					);
				}
				Speed::High => {
					ctx.set_interval(ep.interval.saturating_sub(1).min(15));
					ctx.set_max_endpoint_service_time_interval_payload_low(
						ep.max_packet_size,
					);
				}
				// Super-speed interrupt endpoints run at the slowest
				// service interval with a two-byte ESIT payload.
				Speed::Super => {
					ctx.set_interval(0x0f);
					ctx.set_max_endpoint_service_time_interval_payload_low(2);
				}
			}
		}
		EndpointKind::Isochronous => {
			ctx.set_endpoint_type(match ep.direction() {
				crate::usb::Direction::In => EndpointType::IsochIn,
				crate::usb::Direction::Out => EndpointType::IsochOut,
			});
			ctx.set_error_count(0);
		}
		EndpointKind::Control => unreachable!(),
	}

	if let Some((base, cycle)) = ring_state {
		ctx.set_tr_dequeue_pointer(base);
		if cycle {
			ctx.set_dequeue_cycle_state();
		} else {
			ctx.clear_dequeue_cycle_state();
		}
	}
	Ok(())
}

impl<E: PciIo + Firmware> Xhci<E> {
	/// Slot id the bus-level device address maps to, or 0.
	pub(super) fn bus_addr_to_slot_id(&self, bus_addr: u8) -> u8 {
		self.slots
			.iter()
			.find(|s| s.enabled && s.slot_id != 0 && s.bus_dev_addr == bus_addr)
			.map_or(0, |s| s.slot_id)
	}

	/// Slot id owning the controller-assigned device address, or 0.
	pub(super) fn xhci_addr_to_slot_id(&self, xhci_addr: u8) -> u8 {
		self.slots
			.iter()
			.find(|s| s.enabled && s.slot_id != 0 && s.xhci_dev_addr == xhci_addr)
			.map_or(0, |s| s.slot_id)
	}

	/// Slot id of the device at a topological position, or 0.
	pub(super) fn route_to_slot_id(&self, route: RouteString) -> u8 {
		self.slots
			.iter()
			.find(|s| s.enabled && s.slot_id != 0 && s.route == route)
			.map_or(0, |s| s.slot_id)
	}

	/// Assign and address a slot for a newly attached device.
	pub(super) fn initialize_device_slot(
		&mut self,
		parent_route: RouteString,
		parent_port: u8,
		route: RouteString,
		speed: Speed,
	) -> Result<()> {
		let event = self.cmd_transfer(
			command::Allowed::EnableSlot(*command::EnableSlot::new().set_slot_type(0)),
			XHC_GENERIC_TIMEOUT,
		)?;
		let slot_id = event.slot_id();
		if slot_id == 0 || slot_id > self.max_slots_en {
			error!("controller returned bad slot id {}", slot_id);
			return Err(Error::DeviceError);
		}
		info!("slot {} enabled for route {:#x}", slot_id, route.raw());

		// TT fields inherit down the hub chain: a full/low-speed device
		// behind a high-speed hub latches that hub as its translator,
		// everything deeper just copies the parent's translator.
		let mut ctx_speed = speed.context_speed();
		let mut tt_hub_slot = 0;
		let mut tt_port = 0;
		if route.route() != 0 {
			let parent_slot = self.route_to_slot_id(parent_route);
			if parent_slot == 0 {
				return Err(Error::DeviceError);
			}
			let parent = self.slots[usize::from(parent_slot)]
				.output
				.as_ref()
				.ok_or(Error::DeviceError)?
				.handler();
			let parent_slot_ctx = parent.slot();
			let parent_speed = parent_slot_ctx.speed();
			let parent_tt_hub = parent_slot_ctx.parent_hub_slot_id();
			let parent_tt_port = parent_slot_ctx.parent_port_number();

			if parent_tt_hub == 0 && parent_tt_port == 0 {
				if parent_speed == Speed::High.context_speed()
					&& (speed == Speed::Full || speed == Speed::Low)
				{
					tt_port = parent_port;
					tt_hub_slot = parent_slot;
				}
			} else {
				tt_port = parent_tt_port;
				tt_hub_slot = parent_tt_hub;
				if speed == Speed::High {
					ctx_speed = parent_speed;
				}
			}
		}

		// Scrub whatever a previous occupant left in the entry.
		release_slot(&mut self.slots[usize::from(slot_id)], &mut self.pool, &self.regs.env);
		self.slots[usize::from(slot_id)] = Slot::new();

		let mut input = InputContext::new(&mut self.pool, &self.regs.env, self.context_size)?;
		let ep0_ring = match TransferRing::new(&mut self.pool, &self.regs.env, TR_RING_TRB_NUMBER)
		{
			Ok(ring) => ring,
			Err(e) => {
				input.free(&mut self.pool, &self.regs.env);
				return Err(e);
			}
		};
		let output = match DeviceContext::new(&mut self.pool, &self.regs.env, self.context_size) {
			Ok(output) => output,
			Err(e) => {
				input.free(&mut self.pool, &self.regs.env);
				ep0_ring.free(&mut self.pool, &self.regs.env);
				return Err(e);
			}
		};

		input.zero();
		{
			let handler = input.handler();
			handler.control_mut().set_add_context_flag(0);
			handler.control_mut().set_add_context_flag(1);

			let slot_ctx = handler.device_mut().slot_mut();
			slot_ctx.set_route_string(route.route());
			slot_ctx.set_speed(ctx_speed);
			slot_ctx.set_context_entries(1);
			slot_ctx.set_root_hub_port_number(route.root_port());
			slot_ctx.set_parent_hub_slot_id(tt_hub_slot);
			slot_ctx.set_parent_port_number(tt_port);

			let ep0 = handler.device_mut().endpoint_mut(1);
			ep0.set_endpoint_type(EndpointType::Control);
			ep0.set_max_packet_size(speed.default_max_packet());
			ep0.set_max_burst_size(0);
			ep0.set_average_trb_length(8);
			ep0.set_error_count(3);
			ep0.set_tr_dequeue_pointer(ep0_ring.base_dev());
			ep0.set_dequeue_cycle_state();
		}

		let input_addr = input.device_addr();
		self.dcbaa.set(slot_id, output.device_addr());

		{
			let slot = &mut self.slots[usize::from(slot_id)];
			slot.enabled = true;
			slot.slot_id = slot_id;
			slot.route = route;
			slot.parent_route = parent_route;
			slot.input = Some(input);
			slot.output = Some(output);
			slot.rings[0] = Some(ep0_ring);
		}

		let cmd = *command::AddressDevice::new()
			.set_input_context_pointer(input_addr)
			.set_slot_id(slot_id);
		if let Err(e) = self.cmd_transfer(command::Allowed::AddressDevice(cmd), XHC_GENERIC_TIMEOUT)
		{
			error!("Address Device failed for slot {}: {:?}", slot_id, e);
			let _ = self.disable_slot_cmd(slot_id);
			return Err(e);
		}

		let address = self.slots[usize::from(slot_id)]
			.output
			.as_ref()
			.ok_or(Error::DeviceError)?
			.handler()
			.slot()
			.usb_device_address();
		self.slots[usize::from(slot_id)].xhci_dev_addr = address;
		debug!("slot {} addressed as {}", slot_id, address);
		Ok(())
	}

	/// Disable a slot, taking its downstream children with it. The entry
	/// keeps its address mapping so outstanding async transfers can still
	/// be deregistered by bus address.
	pub(super) fn disable_slot_cmd(&mut self, slot_id: u8) -> Result<()> {
		let route = self.slots[usize::from(slot_id)].route;
		for child in 1..=255u8 {
			if child == slot_id {
				continue;
			}
			let entry = &self.slots[usize::from(child)];
			if entry.enabled && entry.slot_id != 0 && entry.parent_route == route {
				if let Err(e) = self.disable_slot_cmd(child) {
					warn!("failed to disable child slot {}: {:?}", child, e);
					self.slots[usize::from(child)].slot_id = 0;
				}
			}
		}

		info!("disabling slot {}", slot_id);
		let cmd = *command::DisableSlot::new().set_slot_id(slot_id);
		let status = self
			.cmd_transfer(command::Allowed::DisableSlot(cmd), XHC_GENERIC_TIMEOUT)
			.map(|_| ());

		// Resources go back regardless; a failed command leaves the
		// controller owning nothing we still need.
		self.dcbaa.set(slot_id, 0);
		release_slot(&mut self.slots[usize::from(slot_id)], &mut self.pool, &self.regs.env);
		status
	}

	/// Correct EP0's max packet size once the real device descriptor is
	/// known.
	pub(super) fn evaluate_context(&mut self, slot_id: u8, max_packet0: u32) -> Result<()> {
		let input_addr = {
			let slot = &mut self.slots[usize::from(slot_id)];
			if !slot.enabled {
				return Err(Error::DeviceError);
			}
			let input = slot.input.as_mut().ok_or(Error::DeviceError)?;
			input.zero();
			let handler = input.handler();
			handler.control_mut().set_add_context_flag(1);
			handler
				.device_mut()
				.endpoint_mut(1)
				.set_max_packet_size(max_packet0 as u16);
			input.device_addr()
		};

		debug!("evaluate context, slot {} max packet {}", slot_id, max_packet0);
		let cmd = *command::EvaluateContext::new()
			.set_input_context_pointer(input_addr)
			.set_slot_id(slot_id);
		self.cmd_transfer(command::Allowed::EvaluateContext(cmd), XHC_GENERIC_TIMEOUT)
			.map(|_| ())
	}

	/// Configure every endpoint of the active configuration.
	pub(super) fn set_config_cmd(
		&mut self,
		slot_id: u8,
		speed: Speed,
		config: &[u8],
	) -> Result<()> {
		let groups = crate::usb::interfaces(config);

		let input_addr = {
			let slot = &mut self.slots[usize::from(slot_id)];
			if !slot.enabled {
				return Err(Error::DeviceError);
			}
			let output = slot.output.as_ref().ok_or(Error::DeviceError)?;
			let input = slot.input.as_mut().ok_or(Error::DeviceError)?;
			input.zero();
			input.copy_slot_from(output);

			let mut max_dci = 0;
			for (intf, endpoints) in &groups {
				let active = slot
					.active_alternate
					.get(usize::from(intf.interface_number))
					.copied()
					.unwrap_or(0);
				if intf.alternate_setting != active {
					continue;
				}
				for ep in endpoints {
					init_endpoint_context(
						&mut self.pool,
						&self.regs.env,
						slot,
						speed,
						ep,
						&mut max_dci,
					)?;
				}
			}

			let handler = slot.input.as_mut().ok_or(Error::DeviceError)?.handler();
			handler.control_mut().set_add_context_flag(0);
			handler.device_mut().slot_mut().set_context_entries(max_dci.max(1));
			slot.input.as_ref().ok_or(Error::DeviceError)?.device_addr()
		};

		debug!("configure endpoint, slot {}", slot_id);
		let cmd = *command::ConfigureEndpoint::new()
			.set_input_context_pointer(input_addr)
			.set_slot_id(slot_id);
		self.cmd_transfer(command::Allowed::ConfigureEndpoint(cmd), XHC_GENERIC_TIMEOUT)
			.map(|_| ())
	}

	/// Move one interface to a different alternate setting: drop the old
	/// setting's endpoints, add the new one's.
	pub(super) fn set_interface(
		&mut self,
		slot_id: u8,
		speed: Speed,
		config: &[u8],
		request: &DeviceRequest,
	) -> Result<()> {
		let if_num = request.index as u8;
		let alternate = request.value as u8;
		let groups = crate::usb::interfaces(config);

		let current = self.slots[usize::from(slot_id)]
			.active_alternate
			.get(usize::from(if_num))
			.copied()
			.unwrap_or(0);
		if current == alternate {
			return Ok(());
		}

		let old = groups
			.iter()
			.find(|(i, _)| i.interface_number == if_num && i.alternate_setting == current);
		let new = groups
			.iter()
			.find(|(i, _)| i.interface_number == if_num && i.alternate_setting == alternate)
			.ok_or(Error::InvalidParameter)?;

		let input_addr = {
			let slot = &mut self.slots[usize::from(slot_id)];
			if !slot.enabled {
				return Err(Error::DeviceError);
			}
			let output = slot.output.as_ref().ok_or(Error::DeviceError)?;
			let input = slot.input.as_mut().ok_or(Error::DeviceError)?;
			input.zero();
			input.copy_slot_from(output);

			if let Some((_, old_eps)) = old {
				let handler = input.handler();
				for ep in old_eps {
					let dci = endpoint_to_dci(ep.number(), ep.direction());
					handler.control_mut().set_drop_context_flag(dci.into());
				}
			}

			let mut max_dci = 0;
			for ep in &new.1 {
				init_endpoint_context(
					&mut self.pool,
					&self.regs.env,
					slot,
					speed,
					ep,
					&mut max_dci,
				)?;
			}
			// Endpoints of untouched interfaces keep their rings; the slot
			// must still cover them.
			for (index, ring) in self.slots[usize::from(slot_id)].rings.iter().enumerate() {
				if ring.is_some() {
					max_dci = max_dci.max(index as u8 + 1);
				}
			}

			let slot = &mut self.slots[usize::from(slot_id)];
			let handler = slot.input.as_mut().ok_or(Error::DeviceError)?.handler();
			handler.control_mut().set_add_context_flag(0);
			handler.device_mut().slot_mut().set_context_entries(max_dci.max(1));
			slot.input.as_ref().ok_or(Error::DeviceError)?.device_addr()
		};

		debug!("set interface {} alternate {}, slot {}", if_num, alternate, slot_id);
		let cmd = *command::ConfigureEndpoint::new()
			.set_input_context_pointer(input_addr)
			.set_slot_id(slot_id);
		self.cmd_transfer(command::Allowed::ConfigureEndpoint(cmd), XHC_GENERIC_TIMEOUT)?;

		let slot = &mut self.slots[usize::from(slot_id)];
		if slot.active_alternate.len() <= usize::from(if_num) {
			slot.active_alternate.resize(usize::from(if_num) + 1, 0);
		}
		slot.active_alternate[usize::from(if_num)] = alternate;
		Ok(())
	}

	/// Mark a slot as a hub so the controller routes split transactions
	/// through it. Multi-TT stays off even when the hub advertises it.
	pub(super) fn config_hub_context(
		&mut self,
		slot_id: u8,
		num_ports: u8,
		ttt: u8,
		multi_tt: bool,
	) -> Result<()> {
		if multi_tt {
			debug!("hub requests multi-TT, forcing it off");
		}
		let input_addr = {
			let slot = &mut self.slots[usize::from(slot_id)];
			if !slot.enabled {
				return Err(Error::DeviceError);
			}
			let output = slot.output.as_ref().ok_or(Error::DeviceError)?;
			let input = slot.input.as_mut().ok_or(Error::DeviceError)?;
			input.zero();
			input.copy_slot_from(output);

			let handler = input.handler();
			handler.control_mut().set_add_context_flag(0);
			let slot_ctx = handler.device_mut().slot_mut();
			slot_ctx.set_hub();
			slot_ctx.set_number_of_ports(num_ports);
			slot_ctx.set_tt_think_time(ttt);
			slot_ctx.clear_multi_tt();
			input.device_addr()
		};

		debug!("configure hub slot context, slot {} ports {}", slot_id, num_ports);
		let cmd = *command::ConfigureEndpoint::new()
			.set_input_context_pointer(input_addr)
			.set_slot_id(slot_id);
		self.cmd_transfer(command::Allowed::ConfigureEndpoint(cmd), XHC_GENERIC_TIMEOUT)
			.map(|_| ())
	}
}
