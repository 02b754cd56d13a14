//! Scripted controller model backing the integration tests.
//!
//! Implements the driver's environment traits over an in-memory register
//! file. DMA memory is identity-mapped process memory, so the model can
//! follow the rings the driver builds: doorbell 0 executes the command ring
//! and endpoint doorbells consume transfer TRBs according to per-endpoint
//! scripts, posting completion events into whichever event ring the TRB's
//! interrupter target selects.

#![allow(dead_code)]

use driver_usb::env::{Firmware, MapToken, PciIo, Tpl};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::collections::HashMap;
use std::ptr::NonNull;

pub const CAP_LENGTH: u64 = 0x40;
pub const OP_BASE: u64 = CAP_LENGTH;
pub const RT_BASE: u64 = 0x2000;
pub const DB_BASE: u64 = 0x3000;
pub const EXT_CAP_BASE: u64 = 0x500;

const TRB_TYPE_NORMAL: u8 = 1;
const TRB_TYPE_SETUP: u8 = 2;
const TRB_TYPE_DATA: u8 = 3;
const TRB_TYPE_STATUS: u8 = 4;
const TRB_TYPE_LINK: u8 = 6;
pub const TRB_TYPE_ENABLE_SLOT: u8 = 9;
pub const TRB_TYPE_DISABLE_SLOT: u8 = 10;
pub const TRB_TYPE_ADDRESS_DEVICE: u8 = 11;
pub const TRB_TYPE_CONFIGURE_ENDPOINT: u8 = 12;
pub const TRB_TYPE_EVALUATE_CONTEXT: u8 = 13;
pub const TRB_TYPE_RESET_ENDPOINT: u8 = 14;
pub const TRB_TYPE_STOP_ENDPOINT: u8 = 15;
pub const TRB_TYPE_SET_TR_DEQUEUE: u8 = 16;
const TRB_TYPE_TRANSFER_EVENT: u8 = 32;
const TRB_TYPE_COMMAND_COMPLETION: u8 = 33;

pub const COMP_SUCCESS: u8 = 1;
pub const COMP_BABBLE: u8 = 3;
pub const COMP_TRANSACTION: u8 = 4;
pub const COMP_STALL: u8 = 6;
pub const COMP_SHORT_PACKET: u8 = 13;

const PORTSC_CCS: u32 = 1 << 0;
const PORTSC_PED: u32 = 1 << 1;
const PORTSC_PR: u32 = 1 << 4;
const PORTSC_PP: u32 = 1 << 9;
const PORTSC_CSC: u32 = 1 << 17;
const PORTSC_PEC: u32 = 1 << 18;
const PORTSC_WRC: u32 = 1 << 19;
const PORTSC_OCC: u32 = 1 << 20;
const PORTSC_PRC: u32 = 1 << 21;
const PORTSC_PLC: u32 = 1 << 22;
const PORTSC_CEC: u32 = 1 << 23;
const PORTSC_W1C: u32 = PORTSC_CSC | PORTSC_PEC | PORTSC_WRC | PORTSC_OCC | PORTSC_PRC
	| PORTSC_PLC | PORTSC_CEC;

/// How the model answers the next doorbell on one endpoint.
#[derive(Clone, Debug)]
pub enum Behavior {
	/// Complete every TRB of the block with the given code; optional
	/// payload is written into IN data buffers.
	Complete { code: u8, data: Option<Vec<u8>> },
	/// Consume nothing; the transfer stays pending.
	Ignore,
}

/// Everything the model observed, in order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
	Command(u8),
	Doorbell { slot: u8, dci: u8 },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TransferRecord {
	pub slot: u8,
	pub dci: u8,
	pub trb_types: [u8; 8],
	pub trb_count: usize,
	pub data_lengths: [u32; 8],
	pub data_pointers: [u64; 8],
}

#[derive(Default)]
struct Interrupter {
	erstsz: u32,
	erstba: u64,
	erdp: u64,
	iman: u32,
	imod: u32,
	enqueue: usize,
	cycle: bool,
}

struct State {
	usbcmd: u32,
	usbsts: u32,
	config: u32,
	crcr: u64,
	dcbaap: u64,
	dnctrl: u32,
	portsc: Vec<u32>,
	usblegsup: u32,
	interrupters: Vec<Interrupter>,
	// Command-ring consumer.
	cmd_dequeue: u64,
	cmd_cycle: bool,
	// Per-endpoint transfer-ring consumers, learned from the contexts the
	// driver hands over.
	ep_cursor: HashMap<(u8, u8), (u64, bool)>,
	scripts: HashMap<(u8, u8), VecDeque<Behavior>>,
	max_slots: u8,
	next_slot: u8,
	next_address: u8,
	ops: Vec<Op>,
	transfers: Vec<TransferRecord>,
	configure_flags: Vec<(u8, u32, u32)>,
	tpl_depth: usize,
	resets: usize,
}

pub struct MockXhci {
	state: RefCell<State>,
	config_space: RefCell<BTreeMap<u32, u8>>,
}

fn read128(addr: u64) -> [u32; 4] {
	unsafe { (addr as *const [u32; 4]).read_volatile() }
}

fn write32(addr: u64, value: u32) {
	unsafe { (addr as *mut u32).write_volatile(value) }
}

fn read64(addr: u64) -> u64 {
	unsafe { (addr as *const u64).read_volatile() }
}

impl MockXhci {
	pub fn new(ports: usize, max_slots: u8) -> Self {
		let mut config = BTreeMap::new();
		// Vendor/device without any errata attached.
		config.insert(0x00, 0x34);
		config.insert(0x01, 0x12);
		config.insert(0x02, 0x78);
		config.insert(0x03, 0x56);
		// PCI command: memory space + bus master + SERR# enable.
		config.insert(0x04, 0x06);
		config.insert(0x05, 0x01);
		// Class code: serial bus / USB / xHCI.
		config.insert(0x09, 0x30);
		config.insert(0x0a, 0x03);
		config.insert(0x0b, 0x0c);
		// Serial bus release number 3.0.
		config.insert(0x60, 0x30);

		let interrupters = (0..8).map(|_| Interrupter { cycle: true, ..Default::default() }).collect();
		Self {
			state: RefCell::new(State {
				usbcmd: 0,
				usbsts: 1, // halted
				config: 0,
				crcr: 0,
				dcbaap: 0,
				dnctrl: 0,
				portsc: vec![PORTSC_PP; ports],
				usblegsup: 1 | 1 << 16, // capability id 1, BIOS owned
				interrupters,
				cmd_dequeue: 0,
				cmd_cycle: true,
				ep_cursor: HashMap::new(),
				scripts: HashMap::new(),
				max_slots,
				next_slot: 1,
				next_address: 1,
				ops: Vec::new(),
				transfers: Vec::new(),
				configure_flags: Vec::new(),
				tpl_depth: 0,
				resets: 0,
			}),
			config_space: RefCell::new(config),
		}
	}

	// ---- test-facing controls ----

	pub fn attach(&self, port: usize, speed_bits: u32) {
		let mut s = self.state.borrow_mut();
		s.portsc[port] = PORTSC_PP | PORTSC_CCS | PORTSC_PED | PORTSC_CSC | (speed_bits << 10);
	}

	pub fn detach(&self, port: usize) {
		let mut s = self.state.borrow_mut();
		s.portsc[port] = PORTSC_PP | PORTSC_CSC;
	}

	pub fn portsc(&self, port: usize) -> u32 {
		self.state.borrow().portsc[port]
	}

	pub fn script(&self, slot: u8, dci: u8, behavior: Behavior) {
		self.state
			.borrow_mut()
			.scripts
			.entry((slot, dci))
			.or_default()
			.push_back(behavior);
	}

	pub fn ops(&self) -> Vec<Op> {
		self.state.borrow().ops.clone()
	}

	pub fn transfers(&self) -> Vec<TransferRecord> {
		self.state.borrow().transfers.clone()
	}

	/// `(slot, drop flags, add flags)` of every Configure Endpoint command.
	pub fn configure_flags(&self) -> Vec<(u8, u32, u32)> {
		self.state.borrow().configure_flags.clone()
	}

	pub fn commands(&self) -> Vec<u8> {
		self.state
			.borrow()
			.ops
			.iter()
			.filter_map(|op| match op {
				Op::Command(ty) => Some(*ty),
				Op::Doorbell { .. } => None,
			})
			.collect()
	}

	pub fn reset_count(&self) -> usize {
		self.state.borrow().resets
	}

	pub fn crcr(&self) -> u64 {
		self.state.borrow().crcr
	}

	pub fn dcbaap(&self) -> u64 {
		self.state.borrow().dcbaap
	}

	pub fn config_reg(&self) -> u32 {
		self.state.borrow().config
	}

	pub fn usbcmd(&self) -> u32 {
		self.state.borrow().usbcmd
	}

	pub fn erstba(&self, interrupter: usize) -> u64 {
		self.state.borrow().interrupters[interrupter].erstba
	}

	pub fn iman(&self, interrupter: usize) -> u32 {
		self.state.borrow().interrupters[interrupter].iman
	}

	pub fn bios_owned(&self) -> bool {
		let v = self.state.borrow().usblegsup;
		v & 1 << 16 != 0 && v & 1 << 24 == 0
	}

	pub fn os_owned(&self) -> bool {
		let v = self.state.borrow().usblegsup;
		v & 1 << 24 != 0
	}

	pub fn tpl_depth(&self) -> usize {
		self.state.borrow().tpl_depth
	}

	// ---- controller model ----

	fn mmio_read(&self, offset: u64) -> u32 {
		let s = self.state.borrow();
		match offset {
			0x00 => (CAP_LENGTH as u32) | 0x0100 << 16, // CAPLENGTH | HCIVERSION
			0x04 => {
				// HCSPARAMS1: slots | interrupters | ports
				let slots = u32::from(s.max_slots);
				let ports = s.portsc.len() as u32;
				slots | 8 << 8 | ports << 24
			}
			0x08 => {
				// HCSPARAMS2: two scratchpad buffers (lo bits 27..31).
				2 << 27
			}
			0x0c => 0,
			0x10 => {
				// HCCPARAMS: AC64, no CSZ, PPC, ext caps.
				let ext = (EXT_CAP_BASE as u32) >> 2;
				1 | 1 << 3 | ext << 16
			}
			0x14 => DB_BASE as u32,
			0x18 => RT_BASE as u32,
			_ if offset >= DB_BASE => 0,
			_ if offset >= RT_BASE => {
				let rel = offset - RT_BASE;
				if rel < 0x20 {
					return 0;
				}
				let index = ((rel - 0x20) / 32) as usize;
				let reg = (rel - 0x20) % 32;
				let ir = &s.interrupters[index];
				match reg {
					0x00 => ir.iman,
					0x04 => ir.imod,
					0x08 => ir.erstsz,
					0x10 => ir.erstba as u32,
					0x14 => (ir.erstba >> 32) as u32,
					0x18 => ir.erdp as u32,
					0x1c => (ir.erdp >> 32) as u32,
					_ => 0,
				}
			}
			_ if offset >= EXT_CAP_BASE && offset < EXT_CAP_BASE + 8 => {
				if offset == EXT_CAP_BASE {
					s.usblegsup
				} else {
					0
				}
			}
			_ if offset >= OP_BASE => {
				let rel = offset - OP_BASE;
				match rel {
					0x00 => s.usbcmd,
					0x04 => s.usbsts,
					0x08 => 0x0001, // 4 KiB pages
					0x14 => s.dnctrl,
					0x18 => s.crcr as u32,
					0x1c => (s.crcr >> 32) as u32,
					0x30 => s.dcbaap as u32,
					0x34 => (s.dcbaap >> 32) as u32,
					0x38 => s.config,
					_ if rel >= 0x400 => {
						let port = ((rel - 0x400) / 0x10) as usize;
						if (rel - 0x400) % 0x10 == 0 && port < s.portsc.len() {
							s.portsc[port]
						} else {
							0
						}
					}
					_ => 0,
				}
			}
			_ => 0,
		}
	}

	fn mmio_write(&self, offset: u64, value: u32) {
		if offset >= DB_BASE {
			let index = ((offset - DB_BASE) / 4) as u8;
			self.doorbell(index, value);
			return;
		}

		let mut s = self.state.borrow_mut();
		if offset >= RT_BASE {
			let rel = offset - RT_BASE;
			if rel < 0x20 {
				return;
			}
			let index = ((rel - 0x20) / 32) as usize;
			let reg = (rel - 0x20) % 32;
			let ir = &mut s.interrupters[index];
			match reg {
				0x00 => ir.iman = value & !1, // IP is write-1-to-clear
				0x04 => ir.imod = value,
				0x08 => ir.erstsz = value,
				0x10 => ir.erstba = (ir.erstba & !0xffff_ffff) | u64::from(value),
				0x14 => ir.erstba = (ir.erstba & 0xffff_ffff) | u64::from(value) << 32,
				0x18 => ir.erdp = (ir.erdp & !0xffff_ffff) | u64::from(value),
				0x1c => ir.erdp = (ir.erdp & 0xffff_ffff) | u64::from(value) << 32,
				_ => {}
			}
			return;
		}
		if offset >= EXT_CAP_BASE && offset < EXT_CAP_BASE + 8 {
			if offset == EXT_CAP_BASE {
				// Semaphore bits only.
				s.usblegsup = (s.usblegsup & !(1 << 16 | 1 << 24)) | (value & (1 << 16 | 1 << 24));
			}
			return;
		}
		if offset < OP_BASE {
			return;
		}

		let rel = offset - OP_BASE;
		match rel {
			0x00 => {
				// Host controller reset completes instantly.
				if value & 1 << 1 != 0 {
					s.resets += 1;
					s.usbcmd = 0;
					s.usbsts = 1;
					s.crcr = 0;
					s.dcbaap = 0;
					s.cmd_dequeue = 0;
					s.cmd_cycle = true;
					for ir in s.interrupters.iter_mut() {
						*ir = Interrupter { cycle: true, ..Default::default() };
					}
					return;
				}
				s.usbcmd = value;
				if value & 1 != 0 {
					s.usbsts &= !1;
				} else {
					s.usbsts |= 1;
				}
			}
			0x14 => s.dnctrl = value,
			0x18 => {
				s.crcr = (s.crcr & !0xffff_ffff) | u64::from(value);
				s.cmd_dequeue = s.crcr & !0x3f;
				s.cmd_cycle = s.crcr & 1 != 0;
			}
			0x1c => {
				s.crcr = (s.crcr & 0xffff_ffff) | u64::from(value) << 32;
				s.cmd_dequeue = s.crcr & !0x3f;
			}
			0x30 => s.dcbaap = (s.dcbaap & !0xffff_ffff) | u64::from(value),
			0x34 => s.dcbaap = (s.dcbaap & 0xffff_ffff) | u64::from(value) << 32,
			0x38 => s.config = value,
			_ if rel >= 0x400 => {
				let port = ((rel - 0x400) / 0x10) as usize;
				if (rel - 0x400) % 0x10 != 0 || port >= s.portsc.len() {
					return;
				}
				let old = s.portsc[port];
				let mut new = old & !PORTSC_W1C | (old & PORTSC_W1C & !(value & PORTSC_W1C));
				// PED is write-1-to-disable.
				if value & PORTSC_PED != 0 {
					new &= !PORTSC_PED;
				}
				if value & PORTSC_PR != 0 && old & PORTSC_CCS != 0 {
					// Reset completes on the spot: port enabled, change set.
					new |= PORTSC_PED | PORTSC_PRC;
				}
				new = (new & !PORTSC_PP) | (value & PORTSC_PP);
				s.portsc[port] = new;
			}
			_ => {}
		}
	}

	fn post_event(&self, s: &mut State, interrupter: usize, trb: [u32; 4]) {
		let erstba = s.interrupters[interrupter].erstba;
		assert_ne!(erstba, 0, "event ring {} not installed", interrupter);
		let base = read64(erstba);
		let size = (read128(erstba)[2] & 0xffff) as usize;

		let ir = &mut s.interrupters[interrupter];
		let slot = base + (ir.enqueue * 16) as u64;
		let cycle = u32::from(ir.cycle);
		write32(slot, trb[0]);
		write32(slot + 4, trb[1]);
		write32(slot + 8, trb[2]);
		write32(slot + 12, trb[3] & !1 | cycle);
		ir.enqueue += 1;
		if ir.enqueue == size {
			ir.enqueue = 0;
			ir.cycle = !ir.cycle;
		}
	}

	fn doorbell(&self, index: u8, value: u32) {
		if index == 0 {
			self.run_commands();
		} else {
			let dci = value as u8;
			self.state
				.borrow_mut()
				.ops
				.push(Op::Doorbell { slot: index, dci });
			self.run_endpoint(index, dci);
		}
	}

	fn run_commands(&self) {
		let mut s = self.state.borrow_mut();
		loop {
			let trb = read128(s.cmd_dequeue);
			if trb[3] & 1 != u32::from(s.cmd_cycle) {
				break;
			}
			let trb_type = ((trb[3] >> 10) & 0x3f) as u8;
			if trb_type == TRB_TYPE_LINK {
				let target = (u64::from(trb[1]) << 32 | u64::from(trb[0])) & !0xf;
				if trb[3] & 1 << 1 != 0 {
					s.cmd_cycle = !s.cmd_cycle;
				}
				s.cmd_dequeue = target;
				continue;
			}

			let cmd_addr = s.cmd_dequeue;
			s.cmd_dequeue += 16;
			s.ops.push(Op::Command(trb_type));

			let mut code = COMP_SUCCESS;
			let mut slot_id = (trb[3] >> 24) as u8;
			match trb_type {
				TRB_TYPE_ENABLE_SLOT => {
					slot_id = s.next_slot;
					s.next_slot += 1;
				}
				TRB_TYPE_ADDRESS_DEVICE => {
					let input = u64::from(trb[1]) << 32 | u64::from(trb[0]);
					// Capture EP0's ring from the input context and write
					// the assigned address into the output slot context.
					let ep0 = input + 2 * 32;
					let dequeue = read64(ep0 + 8);
					s.ep_cursor.insert((slot_id, 1), (dequeue & !0xf, dequeue & 1 != 0));

					let output = read64(s.dcbaap + u64::from(slot_id) * 8);
					if output != 0 {
						let address = s.next_address;
						s.next_address += 1;
						let dword3 = read128(output)[3];
						write32(output + 12, dword3 & !0xff | u32::from(address));
					} else {
						code = 9; // slot not enabled
					}
				}
				TRB_TYPE_CONFIGURE_ENDPOINT => {
					let input = u64::from(trb[1]) << 32 | u64::from(trb[0]);
					let control = read128(input);
					let add_flags = control[1];
					s.configure_flags.push((slot_id, control[0], add_flags));
					for dci in 2..32u8 {
						if add_flags & 1 << dci != 0 {
							let ep = input + (1 + u64::from(dci)) * 32;
							let dequeue = read64(ep + 8);
							if dequeue & !0xf != 0 {
								s.ep_cursor
									.insert((slot_id, dci), (dequeue & !0xf, dequeue & 1 != 0));
							}
						}
					}
				}
				TRB_TYPE_SET_TR_DEQUEUE => {
					let pointer = u64::from(trb[1]) << 32 | u64::from(trb[0]);
					let dci = ((trb[3] >> 16) & 0x1f) as u8;
					s.ep_cursor
						.insert((slot_id, dci), (pointer & !0xf, pointer & 1 != 0));
				}
				TRB_TYPE_DISABLE_SLOT
				| TRB_TYPE_EVALUATE_CONTEXT
				| TRB_TYPE_RESET_ENDPOINT
				| TRB_TYPE_STOP_ENDPOINT => {}
				_ => {}
			}

			let event = [
				cmd_addr as u32,
				(cmd_addr >> 32) as u32,
				u32::from(code) << 24,
				u32::from(TRB_TYPE_COMMAND_COMPLETION) << 10 | u32::from(slot_id) << 24,
			];
			self.post_event(&mut s, 0, event);
		}
	}

	fn run_endpoint(&self, slot: u8, dci: u8) {
		let mut s = self.state.borrow_mut();
		let Some(&(mut cursor, mut cycle)) = s.ep_cursor.get(&(slot, dci)) else { return };

		let behavior = s
			.scripts
			.get_mut(&(slot, dci))
			.and_then(|q| q.pop_front())
			.unwrap_or(Behavior::Ignore);
		if matches!(behavior, Behavior::Ignore) {
			return;
		}

		// Collect the posted block of TRBs.
		let mut trbs = Vec::new();
		loop {
			let trb = read128(cursor);
			if trb[3] & 1 != u32::from(cycle) {
				break;
			}
			let trb_type = ((trb[3] >> 10) & 0x3f) as u8;
			if trb_type == TRB_TYPE_LINK {
				if trb[3] & 1 << 1 != 0 {
					cycle = !cycle;
				}
				cursor = (u64::from(trb[1]) << 32 | u64::from(trb[0])) & !0xf;
				continue;
			}
			trbs.push((cursor, trb));
			cursor += 16;
		}
		s.ep_cursor.insert((slot, dci), (cursor, cycle));

		let mut record = TransferRecord { slot, dci, ..Default::default() };
		for (i, (_, trb)) in trbs.iter().enumerate().take(8) {
			record.trb_types[i] = ((trb[3] >> 10) & 0x3f) as u8;
			record.trb_count = i + 1;
			record.data_lengths[i] = trb[2] & 0x1_ffff;
			record.data_pointers[i] = u64::from(trb[1]) << 32 | u64::from(trb[0]);
		}
		s.transfers.push(record);

		let Behavior::Complete { code, data } = behavior else { return };
		let payload = data.unwrap_or_default();
		let mut fed = 0usize;

		for (addr, trb) in &trbs {
			let trb_type = ((trb[3] >> 10) & 0x3f) as u8;
			let interrupter = ((trb[2] >> 22) & 0x3ff) as usize;
			let length = (trb[2] & 0x1_ffff) as usize;
			let mut residual = 0usize;

			if matches!(trb_type, TRB_TYPE_DATA | TRB_TYPE_NORMAL) && !payload.is_empty() {
				let buffer = u64::from(trb[1]) << 32 | u64::from(trb[0]);
				let chunk = (payload.len() - fed).min(length);
				unsafe {
					std::ptr::copy_nonoverlapping(
						payload[fed..].as_ptr(),
						buffer as *mut u8,
						chunk,
					);
				}
				residual = length - chunk;
				fed += chunk;
			}

			let event_code = if code == COMP_SUCCESS && residual != 0 {
				COMP_SHORT_PACKET
			} else {
				code
			};
			let event = [
				*addr as u32,
				(addr >> 32) as u32,
				u32::from(event_code) << 24 | residual as u32,
				u32::from(TRB_TYPE_TRANSFER_EVENT) << 10
					| u32::from(dci) << 16
					| u32::from(slot) << 24,
			];
			self.post_event(&mut s, interrupter, event);
			if event_code != COMP_SUCCESS && event_code != COMP_SHORT_PACKET {
				// Errors halt the endpoint; nothing further completes.
				break;
			}
		}
	}
}

impl PciIo for MockXhci {
	fn config_read8(&self, offset: u32) -> driver_usb::Result<u8> {
		Ok(*self.config_space.borrow().get(&offset).unwrap_or(&0))
	}

	fn config_read16(&self, offset: u32) -> driver_usb::Result<u16> {
		let lo = self.config_read8(offset)?;
		let hi = self.config_read8(offset + 1)?;
		Ok(u16::from(hi) << 8 | u16::from(lo))
	}

	fn config_read32(&self, offset: u32) -> driver_usb::Result<u32> {
		let lo = self.config_read16(offset)?;
		let hi = self.config_read16(offset + 2)?;
		Ok(u32::from(hi) << 16 | u32::from(lo))
	}

	fn mem_read8(&self, offset: u64) -> driver_usb::Result<u8> {
		let word = self.mmio_read(offset & !3);
		Ok((word >> ((offset & 3) * 8)) as u8)
	}

	fn mem_read16(&self, offset: u64) -> driver_usb::Result<u16> {
		let word = self.mmio_read(offset & !3);
		Ok((word >> ((offset & 2) * 8)) as u16)
	}

	fn mem_read32(&self, offset: u64) -> driver_usb::Result<u32> {
		Ok(self.mmio_read(offset))
	}

	fn mem_write32(&self, offset: u64, value: u32) -> driver_usb::Result<()> {
		self.mmio_write(offset, value);
		Ok(())
	}

	fn allocate_pages(&self, pages: usize) -> driver_usb::Result<NonNull<u8>> {
		let layout = std::alloc::Layout::from_size_align(pages * 4096, 4096).unwrap();
		let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
		Ok(NonNull::new(ptr).unwrap())
	}

	fn free_pages(&self, _ptr: NonNull<u8>, _pages: usize) {
		// Sub-ranges of an allocation may be returned independently, so the
		// model leaks instead of tracking split frees.
	}

	fn map(&self, host: NonNull<u8>, _bytes: usize) -> driver_usb::Result<(u64, MapToken)> {
		Ok((host.as_ptr() as u64, MapToken(host.as_ptr() as usize)))
	}

	fn unmap(&self, _token: MapToken) {}

	fn enable_dual_address_cycle(&self) -> driver_usb::Result<()> {
		Ok(())
	}

	fn flush(&self) {}

	fn save_attributes(&self) {}

	fn restore_attributes(&self) {}
}

impl Firmware for MockXhci {
	fn stall(&self, _us: usize) {}

	fn raise_tpl(&self, _tpl: Tpl) -> Tpl {
		let mut s = self.state.borrow_mut();
		s.tpl_depth += 1;
		Tpl::APPLICATION
	}

	fn restore_tpl(&self, _tpl: Tpl) {
		let mut s = self.state.borrow_mut();
		s.tpl_depth -= 1;
	}
}

/// Standard bring-up helper: attach the mock, wire one device on `port` and
/// give it the bus address `addr`.
pub fn enumerate_device(
	xhc: &mut driver_usb::Xhci<&MockXhci>,
	mock: &MockXhci,
	port: usize,
	speed_bits: u32,
	speed: driver_usb::usb::Speed,
	addr: u8,
) -> u8 {
	mock.attach(port, speed_bits);
	let status = xhc.get_root_hub_port_status(port as u8).unwrap();
	assert!(status.status.contains(driver_usb::usb::PortState::CONNECTION));

	let route = driver_usb::RouteString::default().child(port as u8);
	let slot = xhc.slot_at_route(route).expect("no slot for attached device");

	// The bus driver's SET_ADDRESS is hooked, not forwarded.
	let request = driver_usb::usb::DeviceRequest {
		request_type: 0,
		request: driver_usb::usb::REQ_SET_ADDRESS,
		value: addr.into(),
		index: 0,
		length: 0,
	};
	xhc.control_transfer(
		0,
		speed,
		speed.default_max_packet().into(),
		&request,
		driver_usb::usb::DataDirection::NoData,
		None,
		1,
	)
	.expect("SET_ADDRESS hook failed");
	slot
}
