//! Boot-service analogues consumed by the driver under test.
//!
//! Covers exactly the surface a host-based unit test of a firmware driver
//! touches: a GUID-keyed protocol database plus no-op event/timer/TPL calls.
//! This is not a general UEFI emulation layer.
//!
//! The database grows on demand; the fixed-capacity handle/protocol tables of
//! the firmware original were an artifact of static allocation, not a
//! semantic requirement.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol not found")]
    NotFound,

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// EFI GUID layout: one 32-bit, two 16-bit, eight 8-bit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub u32, pub u16, pub u16, pub [u8; 8]);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.0,
            self.1,
            self.2,
            self.3[0],
            self.3[1],
            self.3[2],
            self.3[3],
            self.3[4],
            self.3[5],
            self.3[6],
            self.3[7]
        )
    }
}

/// Opaque handle into the protocol database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

/// A dynamically typed protocol interface. The harness is single-threaded
/// (see the concurrency model), so plain `Rc` suffices.
pub type Interface = Rc<dyn Any>;

#[derive(Default)]
struct HandleEntry {
    protocols: Vec<(Guid, Interface)>,
}

/// Process-wide protocol/handle directory, initialized once before tests run
/// and never torn down mid-run.
#[derive(Default)]
pub struct BootServices {
    handles: Vec<HandleEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Cancel,
    Periodic,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tpl(pub usize);

impl BootServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an interface on `handle`, allocating a fresh handle when
    /// `None` is passed. Returns the handle the interface landed on.
    pub fn install_protocol_interface(
        &mut self,
        handle: Option<Handle>,
        guid: Guid,
        interface: Interface,
    ) -> Result<Handle> {
        let handle = match handle {
            Some(handle) => {
                self.entry(handle)?;
                handle
            }
            None => {
                self.handles.push(HandleEntry::default());
                Handle(self.handles.len() - 1)
            }
        };
        debug!(%guid, handle = handle.0, "install protocol interface");
        self.handles[handle.0].protocols.push((guid, interface));
        Ok(handle)
    }

    /// Install several interfaces on one handle, allocating it on the first
    /// installation.
    pub fn install_multiple_protocol_interfaces(
        &mut self,
        mut handle: Option<Handle>,
        interfaces: impl IntoIterator<Item = (Guid, Interface)>,
    ) -> Result<Handle> {
        for (guid, interface) in interfaces {
            handle = Some(self.install_protocol_interface(handle, guid, interface)?);
        }
        handle.ok_or(Error::InvalidParameter("no interfaces supplied"))
    }

    pub fn open_protocol(&self, handle: Handle, guid: &Guid) -> Result<Interface> {
        let entry = self.entry(handle)?;
        entry
            .protocols
            .iter()
            .find(|(g, _)| g == guid)
            .map(|(_, interface)| Rc::clone(interface))
            .ok_or(Error::NotFound)
    }

    /// First match by linear scan across handles in installation order.
    pub fn locate_protocol(&self, guid: &Guid) -> Result<Interface> {
        self.handles
            .iter()
            .flat_map(|entry| entry.protocols.iter())
            .find(|(g, _)| g == guid)
            .map(|(_, interface)| Rc::clone(interface))
            .ok_or(Error::NotFound)
    }

    pub fn close_protocol(&mut self, handle: Handle, _guid: &Guid) -> Result<()> {
        self.entry(handle)?;
        Ok(())
    }

    // Event, timer, and TPL services: the driver under test calls these on
    // its way through a transfer, and a synchronous harness satisfies them
    // with success-returning no-ops.

    pub fn create_event(&mut self) -> Result<Event> {
        Ok(Event(()))
    }

    pub fn set_timer(&mut self, _event: Event, _kind: TimerKind, _trigger_100ns: u64) -> Result<()> {
        Ok(())
    }

    pub fn close_event(&mut self, _event: Event) -> Result<()> {
        Ok(())
    }

    pub fn stall(&self, _microseconds: u64) {}

    pub fn raise_tpl(&self, new: Tpl) -> Tpl {
        new
    }

    pub fn restore_tpl(&self, _old: Tpl) {}

    fn entry(&self, handle: Handle) -> Result<&HandleEntry> {
        self.handles
            .get(handle.0)
            .ok_or(Error::InvalidParameter("stale handle"))
    }
}
