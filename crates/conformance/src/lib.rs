//! Conformance harness: a reference pass-through driver plus the fixtures
//! the end-to-end suites are built from.
//!
//! [`SdMmcPassThru`] reproduces the driver-side command/response state
//! machine the mock certifies: LED on, block registers programmed, command
//! issued, interrupt status polled and cleared, data moved by SDMA or PIO
//! FIFO, LED off. It talks to the controller exclusively through the PCI-IO
//! adapter, so it runs unchanged against the software model, a VPI
//! co-simulation, or a live QEMU machine.

use tracing::debug;

use mock_pci::{
    DmaMapping, DmaOperation, MockPciDevice, MockPciIo, PciIoWidth, SharedBuffer,
};
use regspace::{Error, Result};
use sdhci_model::{
    sd_config_space, SdhciModel, HOST_CTRL1_LED, NOR_INT_BUF_RD_READY, NOR_INT_BUF_WR_READY, NOR_INT_CMD_COMPLETE,
    NOR_INT_DMA, NOR_INT_XFER_COMPLETE, SD_ARG1, SD_BLK_COUNT, SD_BLK_SIZE, SD_BUF_DATA_PORT,
    SD_COMMAND, SD_HOST_CTRL1, SD_NOR_INT_STS, SD_PRESENT_STATE, SD_RESPONSE, SD_SDMA_ADDR,
    SD_TRANS_MODE, TRANS_MODE_DMA_ENABLE, TRANS_MODE_READ,
};
use uefi_stubs::Guid;

pub const EFI_PCI_IO_PROTOCOL_GUID: Guid = Guid(
    0x4cf5_b200,
    0x68b8,
    0x4ca5,
    [0x9e, 0xec, 0xb2, 0x3e, 0x3f, 0x50, 0x02, 0x9a],
);

pub const EFI_SD_MMC_PASS_THRU_PROTOCOL_GUID: Guid = Guid(
    0x716e_f0d9,
    0xff83,
    0x4f69,
    [0x81, 0xe9, 0x51, 0x8b, 0xd3, 0x9a, 0x8e, 0x70],
);

pub const SD_READ_SINGLE_BLOCK: u8 = 17;
pub const SD_WRITE_SINGLE_BLOCK: u8 = 24;

pub const BLOCK_SIZE: usize = 512;

/// The controller's media block used throughout the suites: 512 bytes of
/// the repeating pattern `EF BE AD DE`.
pub fn test_pattern_block() -> Vec<u8> {
    [0xEFu8, 0xBE, 0xAD, 0xDE].repeat(BLOCK_SIZE / 4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdMmcCommandType {
    Bc,
    Bcr,
    Ac,
    Adtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdMmcResponseType {
    R1,
    R1b,
    R2,
    R3,
    R6,
    R7,
}

#[derive(Debug, Clone, Copy)]
pub struct SdMmcCommand {
    pub index: u8,
    pub argument: u32,
    pub command_type: SdMmcCommandType,
    pub response_type: Option<SdMmcResponseType>,
}

/// One pass-through request: a command plus at most one data transfer.
pub struct PassThruPacket {
    pub timeout_s: u64,
    pub command: SdMmcCommand,
    /// Device-to-host transfer destination.
    pub in_transfer: Option<SharedBuffer>,
    /// Host-to-device transfer source.
    pub out_transfer: Option<Vec<u8>>,
    pub response: [u32; 4],
    pub transaction_status: std::result::Result<(), String>,
}

impl PassThruPacket {
    pub fn single_block_read(buffer: SharedBuffer) -> Self {
        Self {
            timeout_s: 5,
            command: SdMmcCommand {
                index: SD_READ_SINGLE_BLOCK,
                argument: 0,
                command_type: SdMmcCommandType::Adtc,
                response_type: Some(SdMmcResponseType::R1),
            },
            in_transfer: Some(buffer),
            out_transfer: None,
            response: [0; 4],
            transaction_status: Ok(()),
        }
    }

    pub fn single_block_write(block: Vec<u8>) -> Self {
        Self {
            timeout_s: 5,
            command: SdMmcCommand {
                index: SD_WRITE_SINGLE_BLOCK,
                argument: 0,
                command_type: SdMmcCommandType::Adtc,
                response_type: Some(SdMmcResponseType::R1),
            },
            in_transfer: None,
            out_transfer: Some(block),
            response: [0; 4],
            transaction_status: Ok(()),
        }
    }
}

// Command/data inhibit bits of the present-state register.
const PRESENT_STATE_INHIBIT: u64 = 0x3;

// The harness has no clock; a packet timeout becomes a bounded poll count.
const POLLS_PER_SECOND: u64 = 1000;

/// Reference driver-side state machine for single-block transfers.
pub struct SdMmcPassThru {
    pci_io: MockPciIo,
    sdma_supported: bool,
}

impl SdMmcPassThru {
    pub fn new(pci_io: MockPciIo, sdma_supported: bool) -> Self {
        Self {
            pci_io,
            sdma_supported,
        }
    }

    pub fn pci_io_mut(&mut self) -> &mut MockPciIo {
        &mut self.pci_io
    }

    pub fn pass_thru(&mut self, packet: &mut PassThruPacket) -> Result<()> {
        match self.execute(packet) {
            Ok(()) => {
                packet.transaction_status = Ok(());
                Ok(())
            }
            Err(err) => {
                packet.transaction_status = Err(err.to_string());
                Err(err)
            }
        }
    }

    fn execute(&mut self, packet: &mut PassThruPacket) -> Result<()> {
        let budget = packet.timeout_s.max(1) * POLLS_PER_SECOND;

        let present = self.read_reg(SD_PRESENT_STATE, PciIoWidth::Uint32)?;
        if present & PRESENT_STATE_INHIBIT != 0 {
            return Err(Error::DeviceError("command or data line busy".into()));
        }

        // LED on for the duration of the command.
        let ctrl = self.read_reg(SD_HOST_CTRL1, PciIoWidth::Uint8)?;
        self.write_reg(SD_HOST_CTRL1, PciIoWidth::Uint8, ctrl | HOST_CTRL1_LED)?;

        let data_len = packet
            .in_transfer
            .as_ref()
            .map(|buffer| buffer.borrow().len())
            .or_else(|| packet.out_transfer.as_ref().map(Vec::len))
            .unwrap_or(0);

        let mut mode = 0u64;
        let mut mapping: Option<DmaMapping> = None;
        if data_len > 0 {
            self.write_reg(SD_BLK_SIZE, PciIoWidth::Uint16, data_len as u64)?;
            self.write_reg(SD_BLK_COUNT, PciIoWidth::Uint16, 1)?;
            if let Some(buffer) = &packet.in_transfer {
                mode |= TRANS_MODE_READ;
                if self.sdma_supported {
                    let (device_addr, dma) = self
                        .pci_io
                        .map(DmaOperation::BusMasterWrite, buffer.clone())?;
                    self.write_reg(SD_SDMA_ADDR, PciIoWidth::Uint32, device_addr)?;
                    mode |= TRANS_MODE_DMA_ENABLE;
                    mapping = Some(dma);
                }
            }
        }

        self.write_reg(
            SD_ARG1,
            PciIoWidth::Uint32,
            u64::from(packet.command.argument),
        )?;
        self.write_reg(SD_TRANS_MODE, PciIoWidth::Uint16, mode)?;
        debug!(index = packet.command.index, mode, "issuing command");
        self.write_reg(
            SD_COMMAND,
            PciIoWidth::Uint16,
            u64::from(packet.command.index) << 8,
        )?;

        self.wait_and_clear(NOR_INT_CMD_COMPLETE, budget)?;

        if packet.command.response_type.is_some() {
            for (i, slot) in packet.response.iter_mut().enumerate() {
                *slot = self.read_reg(SD_RESPONSE + 4 * i as u64, PciIoWidth::Uint32)? as u32;
            }
        }

        if data_len > 0 {
            if mapping.is_some() {
                self.wait_and_clear(NOR_INT_XFER_COMPLETE | NOR_INT_DMA, budget)?;
            } else if let Some(buffer) = &packet.in_transfer {
                self.wait_and_clear(NOR_INT_BUF_RD_READY, budget)?;
                let words = data_len / 4;
                let mut block = vec![0u8; words * 4];
                self.pci_io.mem_read(
                    PciIoWidth::FifoUint32,
                    0,
                    SD_BUF_DATA_PORT,
                    words,
                    &mut block,
                )?;
                buffer.borrow_mut().copy_from_slice(&block);
                self.wait_and_clear(NOR_INT_XFER_COMPLETE, budget)?;
            } else if let Some(block) = &packet.out_transfer {
                self.wait_and_clear(NOR_INT_BUF_WR_READY, budget)?;
                self.pci_io.mem_write(
                    PciIoWidth::FifoUint32,
                    0,
                    SD_BUF_DATA_PORT,
                    block.len() / 4,
                    block,
                )?;
                self.wait_and_clear(NOR_INT_XFER_COMPLETE, budget)?;
            }
            if let Some(dma) = mapping.take() {
                self.pci_io.unmap(dma)?;
            }
        }

        // LED back off once the transaction settles.
        let ctrl = self.read_reg(SD_HOST_CTRL1, PciIoWidth::Uint8)?;
        self.write_reg(SD_HOST_CTRL1, PciIoWidth::Uint8, ctrl & !HOST_CTRL1_LED)?;
        Ok(())
    }

    fn wait_and_clear(&mut self, bits: u64, budget: u64) -> Result<()> {
        for _ in 0..budget {
            let sts = self.read_reg(SD_NOR_INT_STS, PciIoWidth::Uint16)?;
            if sts & bits == bits {
                // Clear-on-write-1 acknowledges exactly the bits we waited on.
                self.write_reg(SD_NOR_INT_STS, PciIoWidth::Uint16, bits)?;
                return Ok(());
            }
        }
        Err(Error::DeviceError(
            "timed out waiting for interrupt status".into(),
        ))
    }

    fn read_reg(&mut self, offset: u64, width: PciIoWidth) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.pci_io.mem_read(width, 0, offset, 1, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_reg(&mut self, offset: u64, width: PciIoWidth, value: u64) -> Result<()> {
        self.pci_io
            .mem_write(width, 0, offset, 1, &value.to_le_bytes())
    }
}

/// A controller fixture: the driver plus a handle onto the model behind it.
pub struct TestController {
    pub pass_thru: SdMmcPassThru,
    pub model: SdhciModel,
}

fn build_controller(block: Vec<u8>, sdma_supported: bool) -> Result<TestController> {
    let model = SdhciModel::new(block);
    let bar = model.bar_space("SD BAR")?;
    let mut device = MockPciDevice::new(Box::new(sd_config_space()));
    device.register_bar(Box::new(bar), 0)?;
    Ok(TestController {
        pass_thru: SdMmcPassThru::new(MockPciIo::new(device), sdma_supported),
        model,
    })
}

/// Controller with SDMA capability advertised; the data phase goes through
/// the mapped host buffer.
pub fn controller_ready_for_sdma_transfer(block: Vec<u8>) -> Result<TestController> {
    build_controller(block, true)
}

/// Controller without DMA capability; the data phase drains the buffer data
/// port word by word.
pub fn controller_ready_for_pio_transfer(block: Vec<u8>) -> Result<TestController> {
    build_controller(block, false)
}

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
