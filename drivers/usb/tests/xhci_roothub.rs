mod util;

use driver_usb::usb::{PortChange, PortFeature, PortState};
use driver_usb::{Error, Xhci};
use util::MockXhci;

#[test]
fn out_of_range_port_is_rejected() {
	let mock = MockXhci::new(2, 32);
	let mut xhc = Xhci::new(&mock).unwrap();
	assert_eq!(xhc.get_root_hub_port_status(2).unwrap_err(), Error::InvalidParameter);
	assert_eq!(
		xhc.set_root_hub_port_feature(2, PortFeature::Reset).unwrap_err(),
		Error::InvalidParameter
	);
	assert_eq!(
		xhc.clear_root_hub_port_feature(2, PortFeature::ConnectChange).unwrap_err(),
		Error::InvalidParameter
	);
}

#[test]
fn port_reset_waits_for_reset_change() {
	let mock = MockXhci::new(1, 32);
	let mut xhc = Xhci::new(&mock).unwrap();

	mock.attach(0, 0);
	// Consume the connect change so the reset is observed in isolation.
	xhc.get_root_hub_port_status(0).unwrap();

	xhc.set_root_hub_port_feature(0, PortFeature::Reset).unwrap();
	let status = xhc.get_root_hub_port_status(0).unwrap();
	assert!(status.change.contains(PortChange::C_RESET));
	assert!(status.status.contains(PortState::ENABLE));

	// And the change bit was acknowledged during the read.
	let again = xhc.get_root_hub_port_status(0).unwrap();
	assert!(!again.change.contains(PortChange::C_RESET));
}

#[test]
fn software_cannot_enable_a_port() {
	let mock = MockXhci::new(1, 32);
	let mut xhc = Xhci::new(&mock).unwrap();

	mock.attach(0, 0);
	xhc.get_root_hub_port_status(0).unwrap();

	// Clearing Enable disables the port; setting it back is a no-op by
	// architecture.
	xhc.clear_root_hub_port_feature(0, PortFeature::Enable).unwrap();
	let status = xhc.get_root_hub_port_status(0).unwrap();
	assert!(!status.status.contains(PortState::ENABLE));

	xhc.set_root_hub_port_feature(0, PortFeature::Enable).unwrap();
	let status = xhc.get_root_hub_port_status(0).unwrap();
	assert!(!status.status.contains(PortState::ENABLE));
}

#[test]
fn write_preserves_unrelated_change_bits() {
	let mock = MockXhci::new(1, 32);
	let mut xhc = Xhci::new(&mock).unwrap();

	// Connect change pending while another feature is cleared: the
	// unrelated w1c bit must survive the register write.
	mock.attach(0, 0);
	xhc.clear_root_hub_port_feature(0, PortFeature::OverCurrentChange).unwrap();
	assert_ne!(mock.portsc(0) & 1 << 17, 0, "connect change was eaten");

	let status = xhc.get_root_hub_port_status(0).unwrap();
	assert!(status.change.contains(PortChange::C_CONNECTION));
}

#[test]
fn port_power_follows_the_capability_bit() {
	let mock = MockXhci::new(1, 32);
	let mut xhc = Xhci::new(&mock).unwrap();

	// The model advertises port power control, so Power is honored.
	assert_ne!(mock.portsc(0) & 1 << 9, 0);
	xhc.clear_root_hub_port_feature(0, PortFeature::Power).unwrap();
	assert_eq!(mock.portsc(0) & 1 << 9, 0);
	xhc.set_root_hub_port_feature(0, PortFeature::Power).unwrap();
	assert_ne!(mock.portsc(0) & 1 << 9, 0);
}
