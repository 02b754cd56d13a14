//! Controller errata keyed by PCI identity.
//!
//! Real controllers deviate from the architected behavior in small ways.
//! The register layer looks the deviations up once at bind time and applies
//! the workarounds where the affected sequences run.

/// Known deviations of one controller model.
#[derive(Clone, Copy, Default)]
pub struct Errata {
	/// The controller raises no port-status-change events after a reset;
	/// every port gets kicked with a port reset once the controller runs so
	/// already-attached devices surface a connect change.
	pub no_psce_on_reset: bool,
	/// MMIO arriving too soon after `HCRST` wedges the controller; the
	/// reset sequence holds off an extra millisecond beyond the architected
	/// stall before touching registers again.
	pub hang_after_reset: bool,
}

impl Errata {
	pub fn for_device(vendor: u16, device: u16) -> Self {
		match (vendor, device) {
			// qemu-xhci forgets the PSCEs unless the ports are kicked.
			(0x1b36, 0x000d) => Self { no_psce_on_reset: true, ..Self::default() },
			(0x8086, _) => Self { hang_after_reset: true, ..Self::default() },
			_ => Self::default(),
		}
	}

	pub fn any(self) -> bool {
		self.no_psce_on_reset || self.hang_after_reset
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn qemu_needs_a_port_kick() {
		let errata = Errata::for_device(0x1b36, 0x000d);
		assert!(errata.no_psce_on_reset);
		assert!(!errata.hang_after_reset);
	}

	#[test]
	fn intel_parts_get_the_reset_grace() {
		let errata = Errata::for_device(0x8086, 0x22b5);
		assert!(errata.hang_after_reset);
		assert!(!errata.no_psce_on_reset);
	}

	#[test]
	fn unknown_devices_have_none() {
		assert!(!Errata::for_device(0x1234, 0x5678).any());
	}
}
