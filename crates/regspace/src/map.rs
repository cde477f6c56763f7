use tracing::{trace, warn};

use crate::{AccessSize, Error, RegisterSpace, Result};

/// One entry of a register map template: a named, sized cell keyed by offset.
///
/// `size` records the register's architectural width in bytes for diagnostic
/// purposes; access-width enforcement happens at the caller (the PCI-IO
/// adapter), not here.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDef {
    pub offset: u64,
    pub name: &'static str,
    pub size: u32,
    pub init: u64,
}

#[derive(Debug, Clone)]
struct Register {
    def: RegisterDef,
    value: u64,
}

/// Ordered storage of 64-bit register cells with *unhooked* accessors.
///
/// Hooks receive `&mut RegisterFile` rather than the owning space, so a
/// nested load/store from inside a hook can never re-enter the hook. The
/// original formulation of this mock had hooks disable and re-enable
/// themselves around nested accesses; splitting storage from hook dispatch
/// makes that re-entry unrepresentable instead.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    regs: Vec<Register>,
}

impl RegisterFile {
    /// Populate from a template. Offsets must be unique within one map.
    pub fn new(template: &[RegisterDef]) -> Result<Self> {
        let mut regs: Vec<Register> = Vec::with_capacity(template.len());
        for def in template {
            if regs.iter().any(|r| r.def.offset == def.offset) {
                return Err(Error::InvalidParameter("duplicate register offset in map"));
            }
            regs.push(Register {
                def: *def,
                value: def.init,
            });
        }
        Ok(Self { regs })
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.lookup(addr).is_some()
    }

    fn lookup(&self, addr: u64) -> Option<usize> {
        self.regs.iter().position(|r| r.def.offset == addr)
    }

    /// Read a cell without invoking any hook, truncated to `size`.
    pub fn load(&self, addr: u64, size: AccessSize) -> Result<u64> {
        let Some(index) = self.lookup(addr) else {
            warn!(addr = format_args!("{addr:#x}"), "register read miss");
            return Err(Error::NotFound { addr });
        };
        let reg = &self.regs[index];
        let value = size.mask(reg.value);
        trace!(reg = reg.def.name, value = format_args!("{value:#x}"), "register read");
        Ok(value)
    }

    /// Write a cell without invoking any hook. The stored value is masked to
    /// the access width.
    pub fn store(&mut self, addr: u64, size: AccessSize, value: u64) -> Result<()> {
        let Some(index) = self.lookup(addr) else {
            warn!(addr = format_args!("{addr:#x}"), "register write miss");
            return Err(Error::NotFound { addr });
        };
        let reg = &mut self.regs[index];
        reg.value = size.mask(value);
        trace!(reg = reg.def.name, value = format_args!("{:#x}", reg.value), "register write");
        Ok(())
    }
}

/// Device-model strategy invoked around map accesses.
///
/// `pre_write` runs after the offset lookup succeeds and before the store
/// commits; it may rewrite the incoming value (e.g. fold a clear-on-write-1
/// mask against the latched value) and load/store sibling cells. `post_read`
/// runs after the load and may rewrite the outgoing value (e.g. produce the
/// next PIO word). A hook error aborts the access and propagates to the
/// caller.
pub trait AccessHook {
    fn pre_write(
        &mut self,
        _regs: &mut RegisterFile,
        _addr: u64,
        _size: AccessSize,
        _value: &mut u64,
    ) -> Result<()> {
        Ok(())
    }

    fn post_read(
        &mut self,
        _regs: &mut RegisterFile,
        _addr: u64,
        _size: AccessSize,
        _value: &mut u64,
    ) -> Result<()> {
        Ok(())
    }
}

/// Register space backed by a fixed table of named cells plus an optional
/// access hook.
pub struct MapRegisterSpace {
    name: String,
    file: RegisterFile,
    hook: Option<Box<dyn AccessHook>>,
}

impl MapRegisterSpace {
    pub fn new(name: impl Into<String>, template: &[RegisterDef]) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            file: RegisterFile::new(template)?,
            hook: None,
        })
    }

    pub fn with_hook(
        name: impl Into<String>,
        template: &[RegisterDef],
        hook: Box<dyn AccessHook>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            file: RegisterFile::new(template)?,
            hook: Some(hook),
        })
    }

    /// Direct cell access for fixture setup and assertions.
    pub fn file(&self) -> &RegisterFile {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut RegisterFile {
        &mut self.file
    }
}

impl RegisterSpace for MapRegisterSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, addr: u64, size: AccessSize) -> Result<u64> {
        let mut value = self.file.load(addr, size)?;
        if let Some(hook) = self.hook.as_mut() {
            hook.post_read(&mut self.file, addr, size, &mut value)?;
        }
        Ok(value)
    }

    fn write(&mut self, addr: u64, size: AccessSize, mut value: u64) -> Result<()> {
        // Miss before hook: a failed lookup must leave the map untouched and
        // skip all side effects.
        if !self.file.contains(addr) {
            warn!(addr = format_args!("{addr:#x}"), space = %self.name, "register write miss");
            return Err(Error::NotFound { addr });
        }
        if let Some(hook) = self.hook.as_mut() {
            hook.pre_write(&mut self.file, addr, size, &mut value)?;
        }
        self.file.store(addr, size, value)
    }
}
