//! Addressable register spaces with side-effecting access hooks.
//!
//! A [`RegisterSpace`] is the unit of device state the rest of the harness is
//! built on: an address- and size-tagged read/write surface that is
//! polymorphic over its backend. The in-process backend is
//! [`MapRegisterSpace`], a flat table of named 64-bit cells whose optional
//! pre-write/post-read hook can inspect and mutate the access and touch
//! sibling registers. That hook mechanism is what lets a flat table emulate
//! stateful hardware well enough to drive a real driver's command state
//! machine.
//!
//! Remote backends (socket co-simulation, live QEMU) implement the same trait
//! in the `sim-backends` crate and are interchangeable with the map-based
//! space from the caller's point of view.

mod error;
mod map;
#[cfg(test)]
mod proptests;

pub use error::{Error, Result};
pub use map::{AccessHook, MapRegisterSpace, RegisterDef, RegisterFile};

/// Supported access widths for a register read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Word16,
    Word32,
    Word64,
}

impl AccessSize {
    pub fn bytes(self) -> usize {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Word16 => 2,
            AccessSize::Word32 => 4,
            AccessSize::Word64 => 8,
        }
    }

    pub fn from_bytes(size: usize) -> Result<Self> {
        match size {
            1 => Ok(AccessSize::Byte),
            2 => Ok(AccessSize::Word16),
            4 => Ok(AccessSize::Word32),
            8 => Ok(AccessSize::Word64),
            _ => Err(Error::UnsupportedSize { size }),
        }
    }

    /// Truncate `value` to this access width.
    pub fn mask(self, value: u64) -> u64 {
        match self {
            AccessSize::Byte => value & 0xFF,
            AccessSize::Word16 => value & 0xFFFF,
            AccessSize::Word32 => value & 0xFFFF_FFFF,
            AccessSize::Word64 => value,
        }
    }
}

/// Sized, addressable register access.
///
/// `read` may run a post-read hook and `write` a pre-write hook; either hook
/// can perform further loads/stores on sibling registers of the same space
/// before the triggering operation returns. Implementations must guarantee
/// that a failed access leaves the space unmodified.
pub trait RegisterSpace {
    /// Diagnostic name, used only in log output.
    fn name(&self) -> &str;

    fn read(&mut self, addr: u64, size: AccessSize) -> Result<u64>;

    fn write(&mut self, addr: u64, size: AccessSize, value: u64) -> Result<()>;
}
