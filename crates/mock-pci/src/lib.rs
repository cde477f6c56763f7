//! Mock PCI device and PCI-IO adapter.
//!
//! A [`MockPciDevice`] aggregates one config-space register space and up to
//! five BAR register spaces. [`MockPciIo`] fronts it with the width-tagged
//! memory/config operations a firmware driver expects, including the
//! FIFO-repeat access mode used to drain or fill a data-port register during
//! PIO block transfer, plus a trivial DMA mapping stub that lets an
//! all-software test exercise a driver's DMA path without an IOMMU.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use regspace::{AccessSize, Error, RegisterSpace, Result};

pub const BAR_COUNT: usize = 5;

/// The fixed device address [`MockPciIo::map`] always returns. A device
/// model's SDMA path treats this value as "the driver's mapped host buffer".
pub const DMA_SENTINEL_ADDR: u64 = 0x20;

/// Host buffer shared between the driver side (which maps it) and the device
/// model side (which copies blocks into it). Single-threaded by design.
pub type SharedBuffer = Rc<RefCell<Vec<u8>>>;

pub fn shared_buffer(len: usize) -> SharedBuffer {
    Rc::new(RefCell::new(vec![0u8; len]))
}

/// Access widths of the PCI-IO protocol surface. `FifoUint32` repeats a
/// 4-byte access at the same offset `count` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciIoWidth {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    FifoUint32,
}

impl PciIoWidth {
    fn access_size(self) -> Result<AccessSize> {
        match self {
            PciIoWidth::Uint8 => Ok(AccessSize::Byte),
            PciIoWidth::Uint16 => Ok(AccessSize::Word16),
            PciIoWidth::Uint32 | PciIoWidth::FifoUint32 => Ok(AccessSize::Word32),
            PciIoWidth::Uint64 => Ok(AccessSize::Word64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaOperation {
    BusMasterRead,
    BusMasterWrite,
    BusMasterCommonBuffer,
}

/// Opaque mapping handle; echoes the host buffer, as the mock performs no
/// real translation.
pub struct DmaMapping {
    host: SharedBuffer,
}

impl DmaMapping {
    pub fn host(&self) -> &SharedBuffer {
        &self.host
    }
}

/// One mock PCI device: a config space plus five BAR slots.
pub struct MockPciDevice {
    config: Box<dyn RegisterSpace>,
    bars: [Option<Box<dyn RegisterSpace>>; BAR_COUNT],
}

impl MockPciDevice {
    pub fn new(config: Box<dyn RegisterSpace>) -> Self {
        Self {
            config,
            bars: [None, None, None, None, None],
        }
    }

    pub fn register_bar(&mut self, space: Box<dyn RegisterSpace>, index: usize) -> Result<()> {
        if index >= BAR_COUNT {
            return Err(Error::InvalidParameter("BAR index out of range"));
        }
        self.bars[index] = Some(space);
        Ok(())
    }

    pub fn config_mut(&mut self) -> &mut dyn RegisterSpace {
        self.config.as_mut()
    }

    pub fn bar_mut(&mut self, index: usize) -> Result<&mut (dyn RegisterSpace + 'static)> {
        if index >= BAR_COUNT {
            return Err(Error::InvalidParameter("BAR index out of range"));
        }
        self.bars[index]
            .as_deref_mut()
            .ok_or(Error::Unsupported("no register space registered for BAR"))
    }
}

/// Register space that accepts every access and reads as zero. Stands in for
/// a config space whose contents the test under construction does not care
/// about.
pub struct NullRegisterSpace {
    name: String,
}

impl NullRegisterSpace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl RegisterSpace for NullRegisterSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, _addr: u64, _size: AccessSize) -> Result<u64> {
        Ok(0)
    }

    fn write(&mut self, _addr: u64, _size: AccessSize, _value: u64) -> Result<()> {
        Ok(())
    }
}

/// Width-tagged PCI-IO front end over a [`MockPciDevice`].
pub struct MockPciIo {
    device: MockPciDevice,
}

impl MockPciIo {
    pub fn new(device: MockPciDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &MockPciDevice {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut MockPciDevice {
        &mut self.device
    }

    pub fn mem_read(
        &mut self,
        width: PciIoWidth,
        bar_index: usize,
        offset: u64,
        count: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let space = self.device.bar_mut(bar_index)?;
        read_space(space, width, offset, count, buf)
    }

    pub fn mem_write(
        &mut self,
        width: PciIoWidth,
        bar_index: usize,
        offset: u64,
        count: usize,
        buf: &[u8],
    ) -> Result<()> {
        let space = self.device.bar_mut(bar_index)?;
        write_space(space, width, offset, count, buf)
    }

    pub fn config_read(
        &mut self,
        width: PciIoWidth,
        offset: u64,
        count: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        read_space(self.device.config_mut(), width, offset, count, buf)
    }

    pub fn config_write(&mut self, width: PciIoWidth, offset: u64, buf: &[u8]) -> Result<()> {
        // No FIFO mode on config writes.
        if width == PciIoWidth::FifoUint32 {
            return Err(Error::Unsupported("FIFO config write"));
        }
        write_space(self.device.config_mut(), width, offset, 1, buf)
    }

    /// DMA-map a host buffer. Always succeeds with the fixed sentinel device
    /// address; the mapping handle echoes the host buffer.
    pub fn map(&mut self, _op: DmaOperation, host: SharedBuffer) -> Result<(u64, DmaMapping)> {
        debug!(
            device_addr = format_args!("{DMA_SENTINEL_ADDR:#x}"),
            len = host.borrow().len(),
            "dma map"
        );
        Ok((DMA_SENTINEL_ADDR, DmaMapping { host }))
    }

    pub fn unmap(&mut self, _mapping: DmaMapping) -> Result<()> {
        Ok(())
    }

    // Capability surface the harness deliberately does not implement. Callers
    // relying on these are outside the mock's contract.

    pub fn io_read(
        &mut self,
        _width: PciIoWidth,
        _bar_index: usize,
        _offset: u64,
        _count: usize,
        _buf: &mut [u8],
    ) -> Result<()> {
        Err(Error::Unsupported("IO-space read"))
    }

    pub fn io_write(
        &mut self,
        _width: PciIoWidth,
        _bar_index: usize,
        _offset: u64,
        _count: usize,
        _buf: &[u8],
    ) -> Result<()> {
        Err(Error::Unsupported("IO-space write"))
    }

    pub fn poll_mem(
        &mut self,
        _width: PciIoWidth,
        _bar_index: usize,
        _offset: u64,
        _mask: u64,
        _value: u64,
    ) -> Result<u64> {
        Err(Error::Unsupported("poll_mem"))
    }

    pub fn poll_io(
        &mut self,
        _width: PciIoWidth,
        _bar_index: usize,
        _offset: u64,
        _mask: u64,
        _value: u64,
    ) -> Result<u64> {
        Err(Error::Unsupported("poll_io"))
    }

    pub fn copy_mem(&mut self) -> Result<()> {
        Err(Error::Unsupported("copy_mem"))
    }

    pub fn allocate_buffer(&mut self, _pages: usize) -> Result<Vec<u8>> {
        Err(Error::Unsupported("allocate_buffer"))
    }

    pub fn flush(&mut self) -> Result<()> {
        Err(Error::Unsupported("flush"))
    }

    pub fn get_location(&self) -> Result<(usize, usize, usize, usize)> {
        Err(Error::Unsupported("get_location"))
    }

    pub fn get_bar_attributes(&self, _bar_index: usize) -> Result<u64> {
        Err(Error::Unsupported("get_bar_attributes"))
    }

    pub fn set_bar_attributes(&mut self, _bar_index: usize, _attributes: u64) -> Result<()> {
        Err(Error::Unsupported("set_bar_attributes"))
    }

    /// Attribute manipulation is accepted and ignored.
    pub fn attributes(&mut self, _attributes: u64) -> Result<()> {
        Ok(())
    }
}

fn read_space(
    space: &mut dyn RegisterSpace,
    width: PciIoWidth,
    offset: u64,
    count: usize,
    buf: &mut [u8],
) -> Result<()> {
    if width == PciIoWidth::FifoUint32 {
        if buf.len() < count * 4 {
            return Err(Error::InvalidParameter("FIFO read buffer too short"));
        }
        for chunk in buf.chunks_exact_mut(4).take(count) {
            let value = space.read(offset, AccessSize::Word32)? as u32;
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        return Ok(());
    }

    let size = width.access_size()?;
    let n = size.bytes();
    if buf.len() < n {
        return Err(Error::InvalidParameter("read buffer too short"));
    }
    let value = space.read(offset, size)?;
    buf[..n].copy_from_slice(&value.to_le_bytes()[..n]);
    Ok(())
}

fn write_space(
    space: &mut dyn RegisterSpace,
    width: PciIoWidth,
    offset: u64,
    count: usize,
    buf: &[u8],
) -> Result<()> {
    if width == PciIoWidth::FifoUint32 {
        if buf.len() < count * 4 {
            return Err(Error::InvalidParameter("FIFO write buffer too short"));
        }
        for chunk in buf.chunks_exact(4).take(count) {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            space.write(offset, AccessSize::Word32, u64::from(value))?;
        }
        return Ok(());
    }

    let size = width.access_size()?;
    let n = size.bytes();
    if buf.len() < n {
        return Err(Error::InvalidParameter("write buffer too short"));
    }
    let mut bytes = [0u8; 8];
    bytes[..n].copy_from_slice(&buf[..n]);
    space.write(offset, size, u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regspace::{MapRegisterSpace, RegisterDef};

    const BAR_MAP: &[RegisterDef] = &[
        RegisterDef { offset: 0x00, name: "R0", size: 4, init: 0x1111_2222 },
        RegisterDef { offset: 0x04, name: "R1", size: 4, init: 0 },
    ];

    fn test_device() -> MockPciDevice {
        let mut dev = MockPciDevice::new(Box::new(NullRegisterSpace::new("cfg")));
        let bar = MapRegisterSpace::new("bar0", BAR_MAP).unwrap();
        dev.register_bar(Box::new(bar), 0).unwrap();
        dev
    }

    #[test]
    fn register_bar_rejects_out_of_range_index() {
        let mut dev = MockPciDevice::new(Box::new(NullRegisterSpace::new("cfg")));
        let bar = MapRegisterSpace::new("bar", BAR_MAP).unwrap();
        assert!(matches!(
            dev.register_bar(Box::new(bar), 5),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn unregistered_bar_is_unsupported() {
        let mut pci_io = MockPciIo::new(test_device());
        let mut buf = [0u8; 4];
        assert!(matches!(
            pci_io.mem_read(PciIoWidth::Uint32, 1, 0, 1, &mut buf),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn mem_read_uses_little_endian_byte_order() {
        let mut pci_io = MockPciIo::new(test_device());
        let mut buf = [0u8; 4];
        pci_io.mem_read(PciIoWidth::Uint32, 0, 0, 1, &mut buf).unwrap();
        assert_eq!(buf, [0x22, 0x22, 0x11, 0x11]);

        let mut short = [0u8; 2];
        pci_io.mem_read(PciIoWidth::Uint16, 0, 0, 1, &mut short).unwrap();
        assert_eq!(short, [0x22, 0x22]);
    }

    #[test]
    fn mem_write_round_trips_through_bar() {
        let mut pci_io = MockPciIo::new(test_device());
        pci_io
            .mem_write(PciIoWidth::Uint32, 0, 0x04, 1, &0xDEAD_BEEFu32.to_le_bytes())
            .unwrap();
        let mut buf = [0u8; 4];
        pci_io.mem_read(PciIoWidth::Uint32, 0, 0x04, 1, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xDEAD_BEEF);
    }

    #[test]
    fn fifo_read_repeats_at_same_offset() {
        let mut pci_io = MockPciIo::new(test_device());
        let mut buf = [0u8; 12];
        pci_io
            .mem_read(PciIoWidth::FifoUint32, 0, 0x00, 3, &mut buf)
            .unwrap();
        for chunk in buf.chunks_exact(4) {
            assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), 0x1111_2222);
        }
    }

    #[test]
    fn map_returns_fixed_sentinel_and_echoes_buffer() {
        let mut pci_io = MockPciIo::new(test_device());
        let host = shared_buffer(512);
        let (device_addr, mapping) = pci_io.map(DmaOperation::BusMasterWrite, host.clone()).unwrap();
        assert_eq!(device_addr, DMA_SENTINEL_ADDR);
        assert!(Rc::ptr_eq(mapping.host(), &host));
        pci_io.unmap(mapping).unwrap();
    }
}
