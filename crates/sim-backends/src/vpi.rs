//! Socket-based VPI co-simulation backend.
//!
//! Line protocol spoken to an external HDL simulator:
//!
//! ```text
//! read mem <addr> <size>
//! read pci <addr> <size>
//! write mem <addr> <size> <value>
//! write pci <addr> <size> <value>
//! done
//! ```
//!
//! Each read/write elicits one decimal-ASCII response line; `done` tells the
//! simulator to shut the connection down.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::rc::Rc;

use tracing::debug;

use regspace::{AccessSize, Error, RegisterSpace, Result};

pub const DEFAULT_VPI_ENDPOINT: &str = "localhost:5001";

/// Whether a space addresses the simulated device's memory BAR or its PCI
/// config registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpiSpaceKind {
    Mem,
    Pci,
}

impl VpiSpaceKind {
    fn keyword(self) -> &'static str {
        match self {
            VpiSpaceKind::Mem => "mem",
            VpiSpaceKind::Pci => "pci",
        }
    }
}

/// One TCP connection to the simulator, shared by the config-space and BAR
/// register spaces of a device (the wire protocol multiplexes both).
pub struct VpiConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    closed: bool,
}

impl VpiConnection {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Rc<RefCell<Self>>> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        debug!("connected to vpi simulator");
        Ok(Rc::new(RefCell::new(Self {
            stream,
            reader,
            closed: false,
        })))
    }

    /// Send one command line and block for the one-line response.
    fn transact(&mut self, msg: &str) -> Result<String> {
        self.stream.write_all(msg.as_bytes())?;
        self.stream.write_all(b"\n")?;
        let mut response = String::new();
        if self.reader.read_line(&mut response)? == 0 {
            return Err(Error::DeviceError("simulator closed the connection".into()));
        }
        Ok(response.trim().to_string())
    }

    /// Tell the simulator the session is over. Also runs on drop.
    pub fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.stream.write_all(b"done\n")?;
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for VpiConnection {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.stream.write_all(b"done\n");
        }
    }
}

/// Register space routed over a [`VpiConnection`].
pub struct VpiRegisterSpace {
    name: String,
    kind: VpiSpaceKind,
    conn: Rc<RefCell<VpiConnection>>,
}

impl VpiRegisterSpace {
    pub fn new(
        name: impl Into<String>,
        kind: VpiSpaceKind,
        conn: Rc<RefCell<VpiConnection>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            conn,
        }
    }
}

/// The simulator carries at most 32-bit accesses.
fn check_width(size: AccessSize) -> Result<()> {
    match size {
        AccessSize::Byte | AccessSize::Word16 | AccessSize::Word32 => Ok(()),
        AccessSize::Word64 => Err(Error::DeviceError(
            "64-bit access not carried by the vpi link".into(),
        )),
    }
}

impl RegisterSpace for VpiRegisterSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, addr: u64, size: AccessSize) -> Result<u64> {
        check_width(size)?;
        let msg = format!("read {} {} {}", self.kind.keyword(), addr, size.bytes());
        let response = self.conn.borrow_mut().transact(&msg)?;
        let value: u64 = response
            .parse()
            .map_err(|_| Error::DeviceError(format!("malformed read response {response:?}")))?;
        debug!(space = %self.name, addr, value = format_args!("{value:#x}"), "vpi read");
        Ok(size.mask(value))
    }

    fn write(&mut self, addr: u64, size: AccessSize, value: u64) -> Result<()> {
        check_width(size)?;
        let msg = format!(
            "write {} {} {} {}",
            self.kind.keyword(),
            addr,
            size.bytes(),
            size.mask(value)
        );
        // The simulator acknowledges writes with a response line too.
        self.conn.borrow_mut().transact(&msg)?;
        debug!(space = %self.name, addr, value = format_args!("{value:#x}"), "vpi write");
        Ok(())
    }
}
