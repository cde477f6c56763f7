//! Behavioral model of an SD host controller, expressed as a register-map
//! access hook.
//!
//! The model reproduces the sequencing a real SDHCI controller shows its
//! driver: command issuance dispatches on the latched transfer mode, the PIO
//! path hands out successive 32-bit words of the media block through the
//! buffer data port, the SDMA path copies the block into the driver's mapped
//! host buffer, interrupt status latches are clear-on-write-1, and the
//! host-control LED bit is tracked for later assertion. Because the driver
//! under test is exercised purely through register side effects, this
//! ordering is the test oracle.
//!
//! Bit assignments follow the SDHCI specification's Normal Interrupt Status
//! layout.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use tracing::debug;

use mock_pci::{NullRegisterSpace, SharedBuffer, DMA_SENTINEL_ADDR};
use regspace::{AccessHook, AccessSize, MapRegisterSpace, RegisterDef, RegisterFile, Result};

// BAR 0 register offsets, per the SDHC register map.
pub const SD_SDMA_ADDR: u64 = 0x00;
pub const SD_BLK_SIZE: u64 = 0x04;
pub const SD_BLK_COUNT: u64 = 0x06;
pub const SD_ARG1: u64 = 0x08;
pub const SD_TRANS_MODE: u64 = 0x0C;
pub const SD_COMMAND: u64 = 0x0E;
pub const SD_RESPONSE: u64 = 0x10;
pub const SD_BUF_DATA_PORT: u64 = 0x20;
pub const SD_PRESENT_STATE: u64 = 0x24;
pub const SD_HOST_CTRL1: u64 = 0x28;
pub const SD_NOR_INT_STS: u64 = 0x30;
pub const SD_ERR_INT_STS: u64 = 0x32;

// Normal Interrupt Status bits.
pub const NOR_INT_CMD_COMPLETE: u64 = 1 << 0;
pub const NOR_INT_XFER_COMPLETE: u64 = 1 << 1;
pub const NOR_INT_DMA: u64 = 1 << 3;
pub const NOR_INT_BUF_WR_READY: u64 = 1 << 4;
pub const NOR_INT_BUF_RD_READY: u64 = 1 << 5;

// Transfer Mode bits.
pub const TRANS_MODE_DMA_ENABLE: u64 = 1 << 0;
pub const TRANS_MODE_READ: u64 = 1 << 4;

// Host Control 1 bits.
pub const HOST_CTRL1_LED: u64 = 1 << 0;

/// Register map template for BAR 0 of the mock controller.
pub const SD_BAR_MAP: &[RegisterDef] = &[
    RegisterDef { offset: SD_SDMA_ADDR, name: "SD_SDMA_ADDR", size: 4, init: 0 },
    RegisterDef { offset: SD_BLK_SIZE, name: "SD_BLK_SIZE", size: 2, init: 0 },
    RegisterDef { offset: SD_BLK_COUNT, name: "SD_BLK_COUNT", size: 2, init: 0 },
    RegisterDef { offset: SD_ARG1, name: "SD_ARG1", size: 4, init: 0 },
    RegisterDef { offset: SD_TRANS_MODE, name: "SD_TRANS_MODE", size: 2, init: 0 },
    RegisterDef { offset: SD_COMMAND, name: "SD_COMMAND", size: 2, init: 0 },
    RegisterDef { offset: SD_RESPONSE, name: "SD_RESPONSE0", size: 4, init: 0 },
    RegisterDef { offset: SD_RESPONSE + 4, name: "SD_RESPONSE1", size: 4, init: 0 },
    RegisterDef { offset: SD_RESPONSE + 8, name: "SD_RESPONSE2", size: 4, init: 0 },
    RegisterDef { offset: SD_RESPONSE + 12, name: "SD_RESPONSE3", size: 4, init: 0 },
    RegisterDef { offset: SD_BUF_DATA_PORT, name: "SD_BUF_DATA_PORT", size: 4, init: 0 },
    RegisterDef { offset: SD_PRESENT_STATE, name: "SD_PRESENT_STATE", size: 4, init: 0 },
    RegisterDef { offset: SD_HOST_CTRL1, name: "SD_HOST_CTRL1", size: 1, init: 0 },
    RegisterDef { offset: SD_NOR_INT_STS, name: "SD_NOR_INT_STS", size: 2, init: 0 },
    RegisterDef { offset: SD_ERR_INT_STS, name: "SD_ERR_INT_STS", size: 2, init: 0 },
];

/// Mutable device state, owned per model instance so multiple test devices
/// coexist in one process.
#[derive(Debug, Default)]
pub struct SdhciState {
    /// Media content served by reads and compared against by tests.
    pub block: Vec<u8>,
    /// Next word index of an active PIO transfer. Never exceeds
    /// `block.len() / 4`.
    pio_index: usize,
    pio_read_active: bool,
    pio_write_active: bool,
    /// Words captured from an out-transfer through the data port.
    pub written_block: Vec<u8>,
    /// Latched when the driver sets the LED bit; survives the driver
    /// clearing the bit again.
    pub led_enabled_seen: bool,
    dma_buffer: Option<SharedBuffer>,
}

/// Handle to one emulated SD host controller.
///
/// The state is shared between the hook installed into the BAR register
/// space and the test fixture, which inspects it after driving the driver.
#[derive(Clone)]
pub struct SdhciModel {
    state: Rc<RefCell<SdhciState>>,
}

impl SdhciModel {
    pub fn new(block: Vec<u8>) -> Self {
        Self {
            state: Rc::new(RefCell::new(SdhciState {
                block,
                ..SdhciState::default()
            })),
        }
    }

    /// Register the host buffer the SDMA path copies into when the SDMA
    /// address register holds [`DMA_SENTINEL_ADDR`].
    pub fn set_dma_buffer(&self, buffer: SharedBuffer) {
        self.state.borrow_mut().dma_buffer = Some(buffer);
    }

    pub fn state(&self) -> Ref<'_, SdhciState> {
        self.state.borrow()
    }

    pub fn led_enabled_seen(&self) -> bool {
        self.state.borrow().led_enabled_seen
    }

    /// Build the BAR 0 register space with this model's hook installed.
    pub fn bar_space(&self, name: impl Into<String>) -> Result<MapRegisterSpace> {
        MapRegisterSpace::with_hook(
            name,
            SD_BAR_MAP,
            Box::new(SdhciHook {
                state: Rc::clone(&self.state),
            }),
        )
    }
}

/// Permissive config-space stand-in for the mock controller: reads as zero,
/// accepts every write.
pub fn sd_config_space() -> NullRegisterSpace {
    NullRegisterSpace::new("SD controller PCI config")
}

struct SdhciHook {
    state: Rc<RefCell<SdhciState>>,
}

/// OR `bits` into an interrupt status latch without disturbing others.
fn raise(regs: &mut RegisterFile, offset: u64, bits: u64) -> Result<()> {
    let current = regs.load(offset, AccessSize::Word32)?;
    regs.store(offset, AccessSize::Word32, current | bits)
}

impl SdhciHook {
    fn dispatch_command(&self, regs: &mut RegisterFile) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let mode = regs.load(SD_TRANS_MODE, AccessSize::Word16)?;

        if mode & TRANS_MODE_DMA_ENABLE != 0 {
            let sdma_addr = regs.load(SD_SDMA_ADDR, AccessSize::Word32)?;
            debug!(sdma_addr = format_args!("{sdma_addr:#x}"), "dma transfer");
            if sdma_addr == DMA_SENTINEL_ADDR {
                if let Some(buffer) = &state.dma_buffer {
                    let mut host = buffer.borrow_mut();
                    let n = host.len().min(state.block.len());
                    host[..n].copy_from_slice(&state.block[..n]);
                    debug!(len = n, "copied block to mapped host buffer");
                }
                raise(
                    regs,
                    SD_NOR_INT_STS,
                    NOR_INT_CMD_COMPLETE | NOR_INT_XFER_COMPLETE | NOR_INT_DMA,
                )?;
            }
        } else if mode & TRANS_MODE_READ != 0 {
            debug!("pio in-transfer");
            state.pio_index = 0;
            state.pio_read_active = true;
            state.pio_write_active = false;
            raise(regs, SD_NOR_INT_STS, NOR_INT_CMD_COMPLETE | NOR_INT_BUF_RD_READY)?;
        } else {
            debug!("pio out-transfer");
            state.pio_index = 0;
            state.pio_write_active = true;
            state.pio_read_active = false;
            state.written_block.clear();
            raise(regs, SD_NOR_INT_STS, NOR_INT_CMD_COMPLETE | NOR_INT_BUF_WR_READY)?;
        }
        Ok(())
    }

    fn accept_pio_word(&self, regs: &mut RegisterFile, value: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.pio_write_active {
            return Ok(());
        }
        let words = state.block.len() / 4;
        if state.pio_index < words {
            state
                .written_block
                .extend_from_slice(&(value as u32).to_le_bytes());
            state.pio_index += 1;
            if state.pio_index == words {
                state.pio_write_active = false;
                raise(regs, SD_NOR_INT_STS, NOR_INT_XFER_COMPLETE)?;
            }
        }
        Ok(())
    }

    fn serve_pio_word(&self, regs: &mut RegisterFile, value: &mut u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.pio_read_active {
            // Reads with no transfer active (or past end of block) return the
            // raw cell value; the content is undefined, never a fault.
            return Ok(());
        }
        let words = state.block.len() / 4;
        if state.pio_index < words {
            let i = state.pio_index * 4;
            *value = u64::from(u32::from_le_bytes([
                state.block[i],
                state.block[i + 1],
                state.block[i + 2],
                state.block[i + 3],
            ]));
            state.pio_index += 1;
            if state.pio_index == words {
                state.pio_read_active = false;
                raise(regs, SD_NOR_INT_STS, NOR_INT_XFER_COMPLETE)?;
            }
        }
        Ok(())
    }
}

impl AccessHook for SdhciHook {
    fn pre_write(
        &mut self,
        regs: &mut RegisterFile,
        addr: u64,
        size: AccessSize,
        value: &mut u64,
    ) -> Result<()> {
        match addr {
            SD_COMMAND => self.dispatch_command(regs)?,
            SD_BUF_DATA_PORT => self.accept_pio_word(regs, *value)?,
            SD_NOR_INT_STS | SD_ERR_INT_STS => {
                // Clear-on-write-1: the effective value is the latch with the
                // written bits removed, never the written value itself.
                let current = regs.load(addr, size)?;
                *value = current & !*value;
                debug!(
                    addr = format_args!("{addr:#x}"),
                    latch = format_args!("{:#x}", *value),
                    "interrupt status clear"
                );
            }
            SD_HOST_CTRL1 => {
                if *value & HOST_CTRL1_LED != 0 {
                    debug!("led enabled");
                    self.state.borrow_mut().led_enabled_seen = true;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn post_read(
        &mut self,
        regs: &mut RegisterFile,
        addr: u64,
        _size: AccessSize,
        value: &mut u64,
    ) -> Result<()> {
        if addr == SD_BUF_DATA_PORT {
            self.serve_pio_word(regs, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regspace::RegisterSpace;

    fn test_block() -> Vec<u8> {
        // 512 bytes of the repeating pattern EF BE AD DE.
        [0xEFu8, 0xBE, 0xAD, 0xDE].repeat(128)
    }

    fn issue_command(space: &mut MapRegisterSpace, mode: u64) {
        space.write(SD_TRANS_MODE, AccessSize::Word16, mode).unwrap();
        space.write(SD_COMMAND, AccessSize::Word16, 17 << 8).unwrap();
    }

    #[test]
    fn pio_read_serves_block_and_completes_on_final_word() {
        let model = SdhciModel::new(test_block());
        let mut space = model.bar_space("SD BAR").unwrap();

        issue_command(&mut space, TRANS_MODE_READ);
        let sts = space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap();
        assert_eq!(sts, NOR_INT_CMD_COMPLETE | NOR_INT_BUF_RD_READY);

        let mut out = Vec::new();
        for i in 0..128 {
            let word = space.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();
            out.extend_from_slice(&(word as u32).to_le_bytes());

            let sts = space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap();
            let complete = sts & NOR_INT_XFER_COMPLETE != 0;
            assert_eq!(complete, i == 127, "transfer complete after read {i}");
        }
        assert_eq!(out, test_block());
    }

    #[test]
    fn pio_read_past_end_of_block_does_not_fault() {
        let model = SdhciModel::new(test_block());
        let mut space = model.bar_space("SD BAR").unwrap();

        issue_command(&mut space, TRANS_MODE_READ);
        for _ in 0..128 {
            space.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();
        }
        // Content past the end is undefined but must not error.
        space.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();
    }

    #[test]
    fn reissuing_a_command_resets_the_pio_index() {
        let model = SdhciModel::new(test_block());
        let mut space = model.bar_space("SD BAR").unwrap();

        issue_command(&mut space, TRANS_MODE_READ);
        space.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();
        space.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();

        issue_command(&mut space, TRANS_MODE_READ);
        let first = space.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();
        assert_eq!(first as u32, 0xDEAD_BEEF);
    }

    #[test]
    fn sdma_command_copies_block_to_mapped_buffer() {
        let model = SdhciModel::new(test_block());
        let buffer = mock_pci::shared_buffer(512);
        model.set_dma_buffer(buffer.clone());
        let mut space = model.bar_space("SD BAR").unwrap();

        space
            .write(SD_SDMA_ADDR, AccessSize::Word32, DMA_SENTINEL_ADDR)
            .unwrap();
        issue_command(&mut space, TRANS_MODE_DMA_ENABLE | TRANS_MODE_READ);

        assert_eq!(*buffer.borrow(), test_block());
        let sts = space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap();
        assert_eq!(
            sts,
            NOR_INT_CMD_COMPLETE | NOR_INT_XFER_COMPLETE | NOR_INT_DMA
        );
    }

    #[test]
    fn sdma_command_to_other_address_copies_nothing() {
        let model = SdhciModel::new(test_block());
        let buffer = mock_pci::shared_buffer(512);
        model.set_dma_buffer(buffer.clone());
        let mut space = model.bar_space("SD BAR").unwrap();

        space.write(SD_SDMA_ADDR, AccessSize::Word32, 0x1000).unwrap();
        issue_command(&mut space, TRANS_MODE_DMA_ENABLE | TRANS_MODE_READ);

        assert!(buffer.borrow().iter().all(|&b| b == 0));
        let sts = space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap();
        assert_eq!(sts, 0);
    }

    #[test]
    fn pio_write_captures_block_and_completes() {
        let model = SdhciModel::new(vec![0u8; 512]);
        let mut space = model.bar_space("SD BAR").unwrap();

        issue_command(&mut space, 0);
        let sts = space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap();
        assert_eq!(sts, NOR_INT_CMD_COMPLETE | NOR_INT_BUF_WR_READY);

        let block = test_block();
        for chunk in block.chunks_exact(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            space
                .write(SD_BUF_DATA_PORT, AccessSize::Word32, u64::from(word))
                .unwrap();
        }
        let sts = space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap();
        assert_ne!(sts & NOR_INT_XFER_COMPLETE, 0);
        assert_eq!(model.state().written_block, block);
    }

    #[test]
    fn interrupt_status_write_clears_only_written_bits() {
        let model = SdhciModel::new(test_block());
        let mut space = model.bar_space("SD BAR").unwrap();

        space
            .file_mut()
            .store(SD_NOR_INT_STS, AccessSize::Word32, 0b10_1011)
            .unwrap();

        // Clearing one bit leaves the others latched.
        space
            .write(SD_NOR_INT_STS, AccessSize::Word16, NOR_INT_CMD_COMPLETE)
            .unwrap();
        assert_eq!(
            space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap(),
            0b10_1010
        );

        // Writing the full latched value clears exactly those bits.
        space.write(SD_NOR_INT_STS, AccessSize::Word16, 0b10_1010).unwrap();
        assert_eq!(space.read(SD_NOR_INT_STS, AccessSize::Word16).unwrap(), 0);
    }

    #[test]
    fn error_interrupt_status_is_also_clear_on_write_one() {
        let model = SdhciModel::new(test_block());
        let mut space = model.bar_space("SD BAR").unwrap();

        space
            .file_mut()
            .store(SD_ERR_INT_STS, AccessSize::Word32, 0xF)
            .unwrap();
        space.write(SD_ERR_INT_STS, AccessSize::Word16, 0x5).unwrap();
        assert_eq!(space.read(SD_ERR_INT_STS, AccessSize::Word16).unwrap(), 0xA);
    }

    #[test]
    fn led_enable_is_latched_across_clear() {
        let model = SdhciModel::new(test_block());
        let mut space = model.bar_space("SD BAR").unwrap();
        assert!(!model.led_enabled_seen());

        space.write(SD_HOST_CTRL1, AccessSize::Byte, HOST_CTRL1_LED).unwrap();
        assert!(model.led_enabled_seen());
        assert_eq!(
            space.read(SD_HOST_CTRL1, AccessSize::Byte).unwrap() & HOST_CTRL1_LED,
            HOST_CTRL1_LED
        );

        space.write(SD_HOST_CTRL1, AccessSize::Byte, 0).unwrap();
        assert!(model.led_enabled_seen());
        assert_eq!(
            space.read(SD_HOST_CTRL1, AccessSize::Byte).unwrap() & HOST_CTRL1_LED,
            0
        );
    }

    #[test]
    fn two_models_do_not_share_state() {
        let a = SdhciModel::new(vec![0x11; 8]);
        let b = SdhciModel::new(vec![0x22; 8]);
        let mut sa = a.bar_space("A").unwrap();
        let mut sb = b.bar_space("B").unwrap();

        issue_command(&mut sa, TRANS_MODE_READ);
        sa.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();

        issue_command(&mut sb, TRANS_MODE_READ);
        let word = sb.read(SD_BUF_DATA_PORT, AccessSize::Word32).unwrap();
        assert_eq!(word as u32, 0x2222_2222);
    }
}
