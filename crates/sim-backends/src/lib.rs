//! Remote [`regspace::RegisterSpace`] backends.
//!
//! Both backends satisfy the exact same read/write contract as the
//! in-process map-based space, so a conformance test can run unchanged
//! against a pure software model, an HDL co-simulation, or a live QEMU
//! machine. Accesses block on a network round-trip with no timeout; a hung
//! remote side hangs the test.

mod qemu;
mod vpi;

pub use qemu::{PciAddress, QemuRegisterSpace, QemuSpaceKind, QmpControl, QtestConnection};
pub use vpi::{VpiConnection, VpiRegisterSpace, VpiSpaceKind, DEFAULT_VPI_ENDPOINT};
