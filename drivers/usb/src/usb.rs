//! USB wire-level types shared with the upstream bus driver: standard
//! requests, descriptors, port status words and transfer results.

use alloc::vec::Vec;
use bitflags::bitflags;

// https://wiki.osdev.org/USB#GET_DESCRIPTOR
pub const REQ_GET_STATUS: u8 = 0;
pub const REQ_CLEAR_FEATURE: u8 = 1;
pub const REQ_SET_FEATURE: u8 = 3;
pub const REQ_SET_ADDRESS: u8 = 5;
pub const REQ_GET_DESCRIPTOR: u8 = 6;
pub const REQ_SET_DESCRIPTOR: u8 = 7;
pub const REQ_GET_CONFIGURATION: u8 = 8;
pub const REQ_SET_CONFIGURATION: u8 = 9;
pub const REQ_GET_INTERFACE: u8 = 10;
pub const REQ_SET_INTERFACE: u8 = 11;
pub const REQ_SYNC_FRAME: u8 = 12;

pub const DESC_DEVICE: u8 = 1;
pub const DESC_CONFIGURATION: u8 = 2;
pub const DESC_STRING: u8 = 3;
pub const DESC_INTERFACE: u8 = 4;
pub const DESC_ENDPOINT: u8 = 5;
pub const DESC_HUB: u8 = 0x29;
pub const DESC_HUB_SUPER_SPEED: u8 = 0x2a;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Speed {
	Full,
	Low,
	High,
	Super,
}

impl Speed {
	/// Speed field of the xHCI slot context.
	pub fn context_speed(self) -> u8 {
		match self {
			Speed::Full => 1,
			Speed::Low => 2,
			Speed::High => 3,
			Speed::Super => 4,
		}
	}

	/// Default control-endpoint max packet size before the device descriptor
	/// is known.
	pub fn default_max_packet(self) -> u16 {
		match self {
			Speed::Super => 512,
			Speed::High => 64,
			Speed::Full | Speed::Low => 8,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
	Out,
	In,
}

/// Data-stage direction of a control transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataDirection {
	NoData,
	Out,
	In,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestKind {
	Standard,
	Class,
	Vendor,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Recipient {
	Device,
	Interface,
	Endpoint,
	Other,
}

/// Compose a `bmRequestType` byte.
pub fn request_type(dir: DataDirection, kind: RequestKind, recipient: Recipient) -> u8 {
	let d = match dir {
		DataDirection::In => 0x80,
		DataDirection::Out | DataDirection::NoData => 0,
	};
	let k = match kind {
		RequestKind::Standard => 0,
		RequestKind::Class => 1 << 5,
		RequestKind::Vendor => 2 << 5,
	};
	let r = match recipient {
		Recipient::Device => 0,
		Recipient::Interface => 1,
		Recipient::Endpoint => 2,
		Recipient::Other => 3,
	};
	d | k | r
}

/// The 8-byte setup packet of a control transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(C)]
pub struct DeviceRequest {
	pub request_type: u8,
	pub request: u8,
	pub value: u16,
	pub index: u16,
	pub length: u16,
}

impl DeviceRequest {
	/// CLEAR_FEATURE aimed at a hub's downstream port.
	pub fn clear_hub_port_feature(selector: u16, port: u16) -> Self {
		Self {
			request_type: request_type(
				DataDirection::NoData,
				RequestKind::Class,
				Recipient::Other,
			),
			request: REQ_CLEAR_FEATURE,
			value: selector,
			index: port,
			length: 0,
		}
	}
}

fn u16_at(data: &[u8], i: usize) -> u16 {
	u16::from_le_bytes([data[i], data[i + 1]])
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DeviceDescriptor {
	pub usb: u16,
	pub class: u8,
	pub subclass: u8,
	pub protocol: u8,
	pub max_packet_size0: u8,
	pub vendor: u16,
	pub product: u16,
	pub device: u16,
	pub num_configurations: u8,
}

impl DeviceDescriptor {
	/// Decode from the first bytes of a GET_DESCRIPTOR(DEVICE) response.
	/// Full-speed devices may return only the 8-byte prefix at first.
	pub fn parse(data: &[u8]) -> Option<Self> {
		if data.len() < 8 || data[1] != DESC_DEVICE {
			return None;
		}
		let mut desc = Self {
			usb: u16_at(data, 2),
			class: data[4],
			subclass: data[5],
			protocol: data[6],
			max_packet_size0: data[7],
			..Self::default()
		};
		if data.len() >= 18 {
			desc.vendor = u16_at(data, 8);
			desc.product = u16_at(data, 10);
			desc.device = u16_at(data, 12);
			desc.num_configurations = data[17];
		}
		Some(desc)
	}

	/// EP0 max packet size. USB 3.x encodes it as a power of two.
	pub fn max_packet0(&self) -> u32 {
		if self.usb >= 0x0300 {
			1 << self.max_packet_size0
		} else {
			self.max_packet_size0.into()
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConfigDescriptor {
	pub total_length: u16,
	pub num_interfaces: u8,
	pub configuration_value: u8,
}

impl ConfigDescriptor {
	pub fn parse(data: &[u8]) -> Option<Self> {
		if data.len() < 9 || data[1] != DESC_CONFIGURATION {
			return None;
		}
		Some(Self {
			total_length: u16_at(data, 2),
			num_interfaces: data[4],
			configuration_value: data[5],
		})
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterfaceDescriptor {
	pub interface_number: u8,
	pub alternate_setting: u8,
	pub num_endpoints: u8,
	pub class: u8,
	pub subclass: u8,
	pub protocol: u8,
}

impl InterfaceDescriptor {
	pub fn parse(data: &[u8]) -> Option<Self> {
		if data.len() < 9 || data[1] != DESC_INTERFACE {
			return None;
		}
		Some(Self {
			interface_number: data[2],
			alternate_setting: data[3],
			num_endpoints: data[4],
			class: data[5],
			subclass: data[6],
			protocol: data[7],
		})
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndpointKind {
	Control,
	Isochronous,
	Bulk,
	Interrupt,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EndpointDescriptor {
	pub address: u8,
	pub attributes: u8,
	pub max_packet_size: u16,
	pub interval: u8,
}

impl EndpointDescriptor {
	pub fn parse(data: &[u8]) -> Option<Self> {
		if data.len() < 7 || data[1] != DESC_ENDPOINT {
			return None;
		}
		Some(Self {
			address: data[2],
			attributes: data[3],
			max_packet_size: u16_at(data, 4),
			interval: data[6],
		})
	}

	pub fn number(&self) -> u8 {
		self.address & 0x0f
	}

	pub fn direction(&self) -> Direction {
		if self.address & 0x80 != 0 {
			Direction::In
		} else {
			Direction::Out
		}
	}

	pub fn kind(&self) -> EndpointKind {
		match self.attributes & 0x03 {
			0 => EndpointKind::Control,
			1 => EndpointKind::Isochronous,
			2 => EndpointKind::Bulk,
			_ => EndpointKind::Interrupt,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HubDescriptor {
	pub num_ports: u8,
	pub characteristics: u16,
}

impl HubDescriptor {
	pub fn parse(data: &[u8]) -> Option<Self> {
		if data.len() < 5 || (data[1] != DESC_HUB && data[1] != DESC_HUB_SUPER_SPEED) {
			return None;
		}
		Some(Self {
			num_ports: data[2],
			characteristics: u16_at(data, 3),
		})
	}

	/// TT think time, bits 5..6 of wHubCharacteristics.
	pub fn tt_think_time(&self) -> u8 {
		((self.characteristics >> 5) & 0x3) as u8
	}
}

/// Walk the concatenated descriptors inside a configuration blob.
///
/// Yields `(descriptor_type, bytes)` per descriptor, bounds-checked against
/// the declared lengths.
pub fn descriptors(config: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
	let mut rest = config;
	core::iter::from_fn(move || {
		if rest.len() < 2 {
			return None;
		}
		let len = rest[0] as usize;
		if len < 2 || len > rest.len() {
			return None;
		}
		let (desc, tail) = rest.split_at(len);
		rest = tail;
		Some((desc[1], desc))
	})
}

/// Interfaces of a configuration blob, each with its endpoint descriptors.
pub fn interfaces(config: &[u8]) -> Vec<(InterfaceDescriptor, Vec<EndpointDescriptor>)> {
	let mut out = Vec::new();
	for (ty, bytes) in descriptors(config) {
		match ty {
			DESC_INTERFACE => {
				if let Some(i) = InterfaceDescriptor::parse(bytes) {
					out.push((i, Vec::new()));
				}
			}
			DESC_ENDPOINT => {
				if let (Some(e), Some(last)) = (EndpointDescriptor::parse(bytes), out.last_mut()) {
					last.1.push(e);
				}
			}
			_ => {}
		}
	}
	out
}

bitflags! {
	/// Abstract port status bits reported to the bus driver.
	#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
	pub struct PortState: u16 {
		const CONNECTION = 0x0001;
		const ENABLE = 0x0002;
		const SUSPEND = 0x0004;
		const OVERCURRENT = 0x0008;
		const RESET = 0x0010;
		const POWER = 0x0100;
		const LOW_SPEED = 0x0200;
		const HIGH_SPEED = 0x0400;
		const SUPER_SPEED = 0x0800;
	}
}

bitflags! {
	/// Abstract port change bits. Each is reported exactly once.
	#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
	pub struct PortChange: u16 {
		const C_CONNECTION = 0x0001;
		const C_ENABLE = 0x0002;
		const C_SUSPEND = 0x0004;
		const C_OVERCURRENT = 0x0008;
		const C_RESET = 0x0010;
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PortStatus {
	pub status: PortState,
	pub change: PortChange,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PortFeature {
	Enable,
	Suspend,
	Reset,
	Power,
	Owner,
	ConnectChange,
	EnableChange,
	SuspendChange,
	OverCurrentChange,
	ResetChange,
}

bitflags! {
	/// USB-level result of a finished transfer. Empty means no error.
	#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
	pub struct TransferResult: u32 {
		const NOT_EXECUTE = 0x001;
		const STALL = 0x002;
		const BUFFER = 0x004;
		const BABBLE = 0x008;
		const NAK = 0x010;
		const CRC = 0x020;
		const TIMEOUT = 0x040;
		const BITSTUFF = 0x080;
		const SYSTEM = 0x100;
		const TRANSACTION = 0x200;
	}
}
