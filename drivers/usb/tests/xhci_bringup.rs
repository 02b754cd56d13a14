mod util;

use driver_usb::usb::Speed;
use driver_usb::{HcState, ResetAttributes, Xhci};
use util::MockXhci;

#[test]
fn bring_up_programs_the_schedule() {
	let mock = MockXhci::new(4, 32);
	let xhc = Xhci::new(&mock).unwrap();

	assert_eq!(mock.reset_count(), 1);
	assert_eq!(mock.config_reg(), 32);
	assert_ne!(mock.dcbaap(), 0);
	// Command ring installed with the initial ring cycle state.
	assert_ne!(mock.crcr() & !0x3f, 0);
	assert_eq!(mock.crcr() & 1, 1);
	// One event ring per transfer class, each with its interrupter enabled.
	for interrupter in 0..5 {
		assert_ne!(mock.erstba(interrupter), 0, "interrupter {}", interrupter);
		assert_ne!(mock.iman(interrupter) & 0x2, 0, "interrupter {}", interrupter);
	}
	// Running, BIOS-owned, and HSEE mirrors the PCI SERR# enable.
	assert_eq!(mock.usbcmd() & 1, 1);
	assert!(mock.bios_owned());
	assert_ne!(mock.usbcmd() & 0x8, 0);
	assert_eq!(xhc.state(), HcState::Operational);

	let caps = xhc.get_capability();
	assert_eq!(caps.port_number, 4);
	assert_eq!(caps.max_speed, Speed::Super);
	assert!(caps.is_64_bit_capable);
	assert_eq!(xhc.revision(), (3, 0));
}

#[test]
fn state_transitions() {
	let mock = MockXhci::new(1, 32);
	let mut xhc = Xhci::new(&mock).unwrap();

	assert_eq!(xhc.state(), HcState::Operational);
	xhc.set_state(HcState::Halt).unwrap();
	assert_eq!(xhc.state(), HcState::Halt);
	xhc.set_state(HcState::Operational).unwrap();
	assert_eq!(xhc.state(), HcState::Operational);
	assert_eq!(xhc.set_state(HcState::Suspend), Err(driver_usb::Error::Unsupported));
}

#[test]
fn reset_rebuilds_the_schedule() {
	let mock = MockXhci::new(1, 32);
	let mut xhc = Xhci::new(&mock).unwrap();

	assert_eq!(
		xhc.reset(ResetAttributes::GlobalWithDebug),
		Err(driver_usb::Error::Unsupported)
	);

	xhc.reset(ResetAttributes::HostController).unwrap();
	assert_eq!(mock.reset_count(), 2);
	// The schedule is reprogrammed from scratch.
	assert_ne!(mock.dcbaap(), 0);
	assert_ne!(mock.crcr() & !0x3f, 0);
	for interrupter in 0..5 {
		assert_ne!(mock.erstba(interrupter), 0);
	}
	// Reset leaves the controller halted; the bus restarts it explicitly.
	assert_eq!(xhc.state(), HcState::Halt);
	xhc.set_state(HcState::Operational).unwrap();
}

#[test]
fn exit_boot_services_hands_off_to_the_os() {
	let mock = MockXhci::new(1, 32);
	let mut xhc = Xhci::new(&mock).unwrap();
	assert!(mock.bios_owned());

	xhc.exit_boot_services();
	assert_eq!(xhc.state(), HcState::Halt);
	assert!(mock.os_owned());
}

#[test]
fn stop_releases_everything_balanced() {
	let mock = MockXhci::new(2, 32);
	let xhc = Xhci::new(&mock).unwrap();
	xhc.stop();
	assert!(mock.os_owned());
	assert_eq!(mock.tpl_depth(), 0);
}
