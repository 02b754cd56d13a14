//! Controller command submission over the command ring.

use super::ring::Trb;
use super::transfer::{TransferClass, Urb};
use super::Xhci;
use crate::env::{Firmware, PciIo};
use crate::usb::{Direction, Speed};
use crate::{Error, Result};
use log::{error, trace};
use xhci::ring::trb::command;

impl<E: PciIo + Firmware> Xhci<E> {
	/// Post one command TRB, ring the command doorbell and wait for its
	/// completion event. Returns the Command Completion TRB on success.
	pub(super) fn cmd_transfer(&mut self, cmd: command::Allowed, timeout_ms: usize) -> Result<Trb> {
		if self.regs.is_halted() || self.regs.is_sys_error() {
			error!("command submitted while the controller is dead");
			return Err(Error::DeviceError);
		}

		trace!("command {:?}", cmd);
		let ep = super::transfer::EndpointInfo {
			dev_addr: 0,
			ep_num: 0,
			direction: Direction::Out,
			speed: Speed::Full,
			max_packet: 0,
		};
		let mut urb = Urb::new(ep, TransferClass::Command, None, 0);
		urb.evt_start = self.event_rings[TransferClass::Command.interrupter()].hw_enqueue();
		urb.ring_base_dev = self.cmd_ring.base_dev();
		urb.ring_trbs = self.cmd_ring.trb_count();

		let id = self.cmd_ring.enqueue(cmd.into_raw());
		urb.trb_start = id;
		urb.trb_end = id;
		urb.trb_num = 1;
		self.cmd_ring.sync();

		self.exec_transfer(&mut urb, timeout_ms)?;
		urb.event.ok_or(Error::DeviceError)
	}
}
