//! Live-QEMU backend.
//!
//! Register accesses travel over QEMU's qtest socket (the same transport
//! libqos uses): `readb`/`readw`/`readl` against a mapped BAR, and port I/O
//! through the 0xCF8/0xCFC config-address mechanism for PCI config space.
//! The accompanying [`QmpControl`] client speaks just enough QMP (JSON) to
//! negotiate capabilities and shut the machine down after a run; machine
//! launch and device discovery are external tooling.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use regspace::{AccessSize, Error, RegisterSpace, Result};

const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Bus/device/function of the device under test on the QEMU machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// CONFIG_ADDRESS dword selecting `offset` of this function.
    fn config_address(&self, offset: u64) -> u32 {
        0x8000_0000
            | (u32::from(self.bus) << 16)
            | (u32::from(self.device) << 11)
            | (u32::from(self.function) << 8)
            | (offset as u32 & 0xFC)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum QemuSpaceKind {
    /// Memory BAR mapped at `base` in guest physical space.
    Bar { base: u64 },
    /// PCI configuration registers of one function.
    PciConfig { address: PciAddress },
}

/// One qtest control connection.
pub struct QtestConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl QtestConnection {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Rc<RefCell<Self>>> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        debug!("connected to qtest socket");
        Ok(Rc::new(RefCell::new(Self { stream, reader })))
    }

    /// Issue one qtest command and return the payload after the `OK`
    /// acknowledgement (empty for writes).
    fn transact(&mut self, cmd: &str) -> Result<String> {
        self.stream.write_all(cmd.as_bytes())?;
        self.stream.write_all(b"\n")?;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(Error::DeviceError("qtest socket closed".into()));
            }
            let line = line.trim();
            // The qtest protocol interleaves IRQ notifications; skip them.
            if line.starts_with("IRQ") {
                continue;
            }
            return match line.strip_prefix("OK") {
                Some(rest) => Ok(rest.trim().to_string()),
                None => Err(Error::DeviceError(format!("qtest error response {line:?}"))),
            };
        }
    }

    fn read_value(&mut self, cmd: &str) -> Result<u64> {
        let payload = self.transact(cmd)?;
        let digits = payload.strip_prefix("0x").unwrap_or(&payload);
        u64::from_str_radix(digits, 16)
            .map_err(|_| Error::DeviceError(format!("malformed qtest value {payload:?}")))
    }

    fn out(&mut self, size: AccessSize, port: u16, value: u64) -> Result<()> {
        let op = match size {
            AccessSize::Byte => "outb",
            AccessSize::Word16 => "outw",
            AccessSize::Word32 => "outl",
            AccessSize::Word64 => return Err(Error::UnsupportedSize { size: 8 }),
        };
        self.transact(&format!("{op} {port:#x} {value:#x}"))?;
        Ok(())
    }

    fn in_(&mut self, size: AccessSize, port: u16) -> Result<u64> {
        let op = match size {
            AccessSize::Byte => "inb",
            AccessSize::Word16 => "inw",
            AccessSize::Word32 => "inl",
            AccessSize::Word64 => return Err(Error::UnsupportedSize { size: 8 }),
        };
        self.read_value(&format!("{op} {port:#x}"))
    }
}

/// Register space backed by a live QEMU machine.
pub struct QemuRegisterSpace {
    name: String,
    kind: QemuSpaceKind,
    conn: Rc<RefCell<QtestConnection>>,
}

impl QemuRegisterSpace {
    pub fn new(
        name: impl Into<String>,
        kind: QemuSpaceKind,
        conn: Rc<RefCell<QtestConnection>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            conn,
        }
    }
}

fn mem_ops(size: AccessSize) -> Result<(&'static str, &'static str)> {
    match size {
        AccessSize::Byte => Ok(("readb", "writeb")),
        AccessSize::Word16 => Ok(("readw", "writew")),
        AccessSize::Word32 => Ok(("readl", "writel")),
        // The controller's registers are at most 32 bits wide and the qtest
        // transport carries nothing wider here.
        AccessSize::Word64 => Err(Error::DeviceError(
            "64-bit access not carried by the qtest link".into(),
        )),
    }
}

impl RegisterSpace for QemuRegisterSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, addr: u64, size: AccessSize) -> Result<u64> {
        let mut conn = self.conn.borrow_mut();
        let value = match self.kind {
            QemuSpaceKind::Bar { base } => {
                let (read_op, _) = mem_ops(size)?;
                conn.read_value(&format!("{read_op} {:#x}", base + addr))?
            }
            QemuSpaceKind::PciConfig { address } => {
                mem_ops(size)?;
                conn.out(
                    AccessSize::Word32,
                    PCI_CONFIG_ADDRESS,
                    u64::from(address.config_address(addr)),
                )?;
                conn.in_(size, PCI_CONFIG_DATA + (addr as u16 & 3))?
            }
        };
        debug!(space = %self.name, addr, value = format_args!("{value:#x}"), "qemu read");
        Ok(size.mask(value))
    }

    fn write(&mut self, addr: u64, size: AccessSize, value: u64) -> Result<()> {
        let mut conn = self.conn.borrow_mut();
        match self.kind {
            QemuSpaceKind::Bar { base } => {
                let (_, write_op) = mem_ops(size)?;
                conn.transact(&format!("{write_op} {:#x} {:#x}", base + addr, size.mask(value)))?;
            }
            QemuSpaceKind::PciConfig { address } => {
                mem_ops(size)?;
                conn.out(
                    AccessSize::Word32,
                    PCI_CONFIG_ADDRESS,
                    u64::from(address.config_address(addr)),
                )?;
                conn.out(size, PCI_CONFIG_DATA + (addr as u16 & 3), size.mask(value))?;
            }
        }
        debug!(space = %self.name, addr, value = format_args!("{value:#x}"), "qemu write");
        Ok(())
    }
}

#[derive(Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
}

/// Minimal QMP control-session client: greeting, capability negotiation, and
/// machine shutdown after a test run.
pub struct QmpControl {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl QmpControl {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        let mut control = Self { stream, reader };

        let greeting = control.read_message()?;
        if greeting.get("QMP").is_none() {
            return Err(Error::DeviceError("missing QMP greeting".into()));
        }
        control.execute("qmp_capabilities")?;
        Ok(control)
    }

    pub fn execute(&mut self, command: &str) -> Result<Value> {
        let msg = serde_json::to_string(&QmpCommand { execute: command })
            .map_err(|e| Error::DeviceError(e.to_string()))?;
        self.stream.write_all(msg.as_bytes())?;
        self.stream.write_all(b"\n")?;

        // Responses interleave with asynchronous events; skip those.
        loop {
            let msg = self.read_message()?;
            if msg.get("event").is_some() {
                continue;
            }
            if let Some(error) = msg.get("error") {
                return Err(Error::DeviceError(format!("qmp error: {error}")));
            }
            if let Some(ret) = msg.get("return") {
                return Ok(ret.clone());
            }
        }
    }

    /// Shut the machine down at the end of a run.
    pub fn quit(&mut self) -> Result<()> {
        self.execute("quit")?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(Error::DeviceError("qmp socket closed".into()));
        }
        serde_json::from_str(&line).map_err(|e| Error::DeviceError(e.to_string()))
    }
}
