//! Root-hub port operations and the port-state reconciliation that turns
//! connect/disconnect observations into slot lifecycle actions.

use super::device::RouteString;
use super::reg::{
	Regs, XHC_GENERIC_TIMEOUT, XHC_PORTSC_CCS, XHC_PORTSC_CEC, XHC_PORTSC_CSC, XHC_PORTSC_LWS,
	XHC_PORTSC_OCA, XHC_PORTSC_OCC, XHC_PORTSC_PEC, XHC_PORTSC_PED, XHC_PORTSC_PLC,
	XHC_PORTSC_PLS, XHC_PORTSC_PP, XHC_PORTSC_PRC, XHC_PORTSC_PS, XHC_PORTSC_RESET,
	XHC_PORTSC_WRC,
};
use super::Xhci;
use crate::env::{Firmware, PciIo, Tpl};
use crate::usb::{PortChange, PortFeature, PortState, PortStatus, Speed};
use crate::{Error, Result};
use log::{debug, trace};

/// Status-change bits (and PED) are write-1-to-clear; mask them off before
/// any read-modify-write of PORTSC.
const PORTSC_W1C: u32 = XHC_PORTSC_PED
	| XHC_PORTSC_CSC
	| XHC_PORTSC_PEC
	| XHC_PORTSC_WRC
	| XHC_PORTSC_OCC
	| XHC_PORTSC_PRC
	| XHC_PORTSC_PLC
	| XHC_PORTSC_CEC;

const PORT_STATE_MAP: [(u32, PortState); 4] = [
	(XHC_PORTSC_CCS, PortState::CONNECTION),
	(XHC_PORTSC_PED, PortState::ENABLE),
	(XHC_PORTSC_OCA, PortState::OVERCURRENT),
	(XHC_PORTSC_RESET, PortState::RESET),
];

const PORT_CHANGE_MAP: [(u32, PortChange); 4] = [
	(XHC_PORTSC_CSC, PortChange::C_CONNECTION),
	(XHC_PORTSC_PEC, PortChange::C_ENABLE),
	(XHC_PORTSC_OCC, PortChange::C_OVERCURRENT),
	(XHC_PORTSC_PRC, PortChange::C_RESET),
];

const PORT_CLEAR_MAP: [(u32, PortFeature); 4] = [
	(XHC_PORTSC_CSC, PortFeature::ConnectChange),
	(XHC_PORTSC_PEC, PortFeature::EnableChange),
	(XHC_PORTSC_OCC, PortFeature::OverCurrentChange),
	(XHC_PORTSC_PRC, PortFeature::ResetChange),
];

// A hub reports its downstream ports in the USB hub encoding, which differs
// from PORTSC: wPortStatus in the low half, wPortChange in the high half.
const HUB_PORT_CCS: u32 = 1 << 0;
const HUB_PORT_PED: u32 = 1 << 1;
const HUB_PORT_OCA: u32 = 1 << 3;
const HUB_PORT_RESET: u32 = 1 << 4;
const HUB_PORT_CSC: u32 = 1 << 16;
const HUB_PORT_PEC: u32 = 1 << 17;
const HUB_PORT_OCC: u32 = 1 << 19;
const HUB_PORT_PRC: u32 = 1 << 20;
const HUB_PORT_BHRC: u32 = 1 << 21;

const HUB_STATE_MAP: [(u32, PortState); 4] = [
	(HUB_PORT_CCS, PortState::CONNECTION),
	(HUB_PORT_PED, PortState::ENABLE),
	(HUB_PORT_OCA, PortState::OVERCURRENT),
	(HUB_PORT_RESET, PortState::RESET),
];

const HUB_CHANGE_MAP: [(u32, PortChange); 4] = [
	(HUB_PORT_CSC, PortChange::C_CONNECTION),
	(HUB_PORT_PEC, PortChange::C_ENABLE),
	(HUB_PORT_OCC, PortChange::C_OVERCURRENT),
	(HUB_PORT_PRC, PortChange::C_RESET),
];

/// Hub change bits and the CLEAR_FEATURE selector that acknowledges each.
pub(super) const HUB_CLEAR_MAP: [(u32, u16); 5] = [
	(HUB_PORT_CSC, 16),  // C_PORT_CONNECTION
	(HUB_PORT_PEC, 17),  // C_PORT_ENABLE
	(HUB_PORT_OCC, 19),  // C_PORT_OVER_CURRENT
	(HUB_PORT_PRC, 20),  // C_PORT_RESET
	(HUB_PORT_BHRC, 29), // C_BH_PORT_RESET
];

/// Translate a hub's GET_STATUS port response into the abstract form.
pub(super) fn translate_hub_port_status(hub_speed: Speed, raw: u32) -> PortStatus {
	let mut status = PortStatus::default();

	if hub_speed == Speed::Super {
		// Super-speed hubs report the attached device speed in bits 10..12;
		// zero means another super-speed device.
		if (raw & XHC_PORTSC_PS) >> 10 == 0 {
			status.status |= PortState::SUPER_SPEED;
		}
	} else if raw & (1 << 9) != 0 {
		status.status |= PortState::LOW_SPEED;
	} else if raw & (1 << 10) != 0 {
		status.status |= PortState::HIGH_SPEED;
	}

	for (hw, state) in HUB_STATE_MAP {
		if raw & hw == hw {
			status.status |= state;
		}
	}
	for (hw, change) in HUB_CHANGE_MAP {
		if raw & hw == hw {
			status.change |= change;
		}
	}
	status
}

fn read_portsc<E: PciIo + Firmware>(regs: &Regs<E>, port: u8) -> u32 {
	regs.read_op(Regs::<E>::portsc_offset(port))
}

impl<E: PciIo + Firmware> Xhci<E> {
	fn check_port(&self, port: u8) -> Result<()> {
		if port >= self.max_ports {
			return Err(Error::InvalidParameter);
		}
		Ok(())
	}

	/// Current state of a root-hub port. Every observed change bit is
	/// acknowledged on the spot, so the bus driver sees each change exactly
	/// once; connect/disconnect edges feed straight into slot bring-up and
	/// teardown.
	pub fn get_root_hub_port_status(&mut self, port: u8) -> Result<PortStatus> {
		self.check_port(port)?;
		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = self.port_status_locked(port);
		self.regs.env.flush();
		self.regs.env.restore_tpl(old_tpl);
		result
	}

	fn port_status_locked(&mut self, port: u8) -> Result<PortStatus> {
		let state = read_portsc(&self.regs, port);
		let mut status = PortStatus::default();

		match (state & XHC_PORTSC_PS) >> 10 {
			2 => status.status |= PortState::LOW_SPEED,
			3 => status.status |= PortState::HIGH_SPEED,
			4 | 5 => status.status |= PortState::SUPER_SPEED,
			_ => {}
		}

		for (hw, bit) in PORT_STATE_MAP {
			if state & hw == hw {
				status.status |= bit;
			}
		}
		// Link state 3 is U3: suspended.
		if (state & XHC_PORTSC_PLS) >> 5 == 3 {
			status.status |= PortState::SUSPEND;
		}
		for (hw, bit) in PORT_CHANGE_MAP {
			if state & hw == hw {
				status.change |= bit;
			}
		}

		for (hw, feature) in PORT_CLEAR_MAP {
			if state & hw == hw {
				self.clear_port_feature_locked(port, feature)?;
			}
		}

		// Reconcile attach/detach on this port; devices behind hubs are
		// handled by the control-transfer hook instead.
		if self
			.poll_port_status_change(RouteString::default(), port, &status)
			.is_err()
		{
			// Initialization failed; drop the reset-change report so the
			// bus retries with a fresh reset.
			status.change &= !PortChange::C_RESET;
		}
		Ok(status)
	}

	pub fn set_root_hub_port_feature(&mut self, port: u8, feature: PortFeature) -> Result<()> {
		self.check_port(port)?;
		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = self.set_port_feature_locked(port, feature);
		self.regs.env.flush();
		self.regs.env.restore_tpl(old_tpl);
		debug!("set port {} feature {:?}: {:?}", port, feature, result);
		result
	}

	fn set_port_feature_locked(&mut self, port: u8, feature: PortFeature) -> Result<()> {
		let offset = Regs::<E>::portsc_offset(port);
		let state = read_portsc(&self.regs, port) & !PORTSC_W1C;

		match feature {
			PortFeature::Enable => {
				// Only the controller can enable a port; software may merely
				// disable it.
			}
			PortFeature::Suspend => {
				self.regs.write_op(offset, state | XHC_PORTSC_LWS);
				self.regs
					.write_op(offset, (state & !XHC_PORTSC_PLS) | 3 << 5 | XHC_PORTSC_LWS);
			}
			PortFeature::Reset => {
				// The controller must be running for a port reset to make
				// progress.
				if self.regs.is_halted() {
					self.regs.run(XHC_GENERIC_TIMEOUT)?;
				}
				self.regs.write_op(offset, state | XHC_PORTSC_RESET);
				let _ = self
					.regs
					.wait_op_bit(offset, XHC_PORTSC_PRC, true, XHC_GENERIC_TIMEOUT);
			}
			PortFeature::Power => {
				if self.port_power_control {
					self.regs.write_op(offset, state | XHC_PORTSC_PP);
				}
			}
			PortFeature::Owner => {}
			_ => return Err(Error::InvalidParameter),
		}
		Ok(())
	}

	pub fn clear_root_hub_port_feature(&mut self, port: u8, feature: PortFeature) -> Result<()> {
		self.check_port(port)?;
		let old_tpl = self.regs.env.raise_tpl(Tpl::NOTIFY);
		let result = self.clear_port_feature_locked(port, feature);
		self.regs.env.flush();
		self.regs.env.restore_tpl(old_tpl);
		result
	}

	fn clear_port_feature_locked(&mut self, port: u8, feature: PortFeature) -> Result<()> {
		let offset = Regs::<E>::portsc_offset(port);
		let state = read_portsc(&self.regs, port) & !PORTSC_W1C;

		match feature {
			PortFeature::Enable => {
				self.regs
					.write_op(offset, (state & !XHC_PORTSC_RESET) | XHC_PORTSC_PED);
			}
			PortFeature::Suspend => {
				self.regs.write_op(offset, state | XHC_PORTSC_LWS);
				self.regs.write_op(offset, state & !XHC_PORTSC_PLS);
			}
			PortFeature::Reset | PortFeature::Owner | PortFeature::SuspendChange => {
				// Reset is write-1-to-set; there is no owner bit; suspend
				// change is not tracked by the root hub.
			}
			PortFeature::Power => {
				if self.port_power_control {
					self.regs.write_op(offset, state & !XHC_PORTSC_PP);
				}
			}
			PortFeature::ConnectChange => {
				self.regs.write_op(offset, state | XHC_PORTSC_CSC);
			}
			PortFeature::EnableChange => {
				self.regs.write_op(offset, state | XHC_PORTSC_PEC);
			}
			PortFeature::OverCurrentChange => {
				self.regs.write_op(offset, state | XHC_PORTSC_OCC);
			}
			PortFeature::ResetChange => {
				self.regs.write_op(offset, state | XHC_PORTSC_PRC);
			}
		}
		Ok(())
	}

	/// Reconcile one port's observed status into slot state: a connected,
	/// enabled port with no slot gets a device slot initialized; a
	/// disconnected port with a slot tears it (and its children) down.
	///
	/// `port` is zero-based for root ports and the one-based downstream
	/// port number when `parent_route` names a hub.
	pub(super) fn poll_port_status_change(
		&mut self,
		parent_route: RouteString,
		port: u8,
		status: &PortStatus,
	) -> Result<()> {
		let route = parent_route.child(port);
		trace!(
			"port poll, route {:#x} status {:?} change {:?}",
			route.raw(),
			status.status,
			status.change
		);

		if status.status.contains(PortState::CONNECTION | PortState::ENABLE) {
			let speed = if status.status.contains(PortState::LOW_SPEED) {
				Speed::Low
			} else if status.status.contains(PortState::HIGH_SPEED) {
				Speed::High
			} else if status.status.contains(PortState::SUPER_SPEED) {
				Speed::Super
			} else {
				Speed::Full
			};
			if self.route_to_slot_id(route) == 0 {
				self.initialize_device_slot(parent_route, port, route, speed)?;
			}
		} else if !status.status.contains(PortState::CONNECTION) {
			let slot_id = self.route_to_slot_id(route);
			if slot_id != 0 {
				self.disable_slot_cmd(slot_id)?;
			}
		}
		Ok(())
	}
}
