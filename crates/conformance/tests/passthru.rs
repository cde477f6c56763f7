//! End-to-end single-block transfers against the software controller model.

use std::cell::RefCell;
use std::rc::Rc;

use conformance::{
    controller_ready_for_pio_transfer, controller_ready_for_sdma_transfer, init_test_tracing,
    test_pattern_block, PassThruPacket, SdMmcPassThru, BLOCK_SIZE,
    EFI_SD_MMC_PASS_THRU_PROTOCOL_GUID,
};
use mock_pci::{shared_buffer, PciIoWidth};
use sdhci_model::{SD_HOST_CTRL1, SD_NOR_INT_STS};
use uefi_stubs::BootServices;

fn read_bar_reg(pass_thru: &mut SdMmcPassThru, offset: u64, width: PciIoWidth) -> u64 {
    let mut buf = [0u8; 8];
    pass_thru
        .pci_io_mut()
        .mem_read(width, 0, offset, 1, &mut buf)
        .unwrap();
    u64::from_le_bytes(buf)
}

#[test]
fn sdma_single_block_read_returns_media_pattern() {
    init_test_tracing();
    let mut ctrl = controller_ready_for_sdma_transfer(test_pattern_block()).unwrap();

    let buffer = shared_buffer(BLOCK_SIZE);
    ctrl.model.set_dma_buffer(buffer.clone());

    let mut packet = PassThruPacket::single_block_read(buffer.clone());
    ctrl.pass_thru.pass_thru(&mut packet).unwrap();

    assert!(packet.transaction_status.is_ok());
    assert_eq!(*buffer.borrow(), test_pattern_block());

    // LED was driven during the transaction and restored afterwards.
    assert!(ctrl.model.led_enabled_seen());
    assert_eq!(
        read_bar_reg(&mut ctrl.pass_thru, SD_HOST_CTRL1, PciIoWidth::Uint8) & 1,
        0
    );
    // All latched interrupt bits were acknowledged.
    assert_eq!(
        read_bar_reg(&mut ctrl.pass_thru, SD_NOR_INT_STS, PciIoWidth::Uint16),
        0
    );
}

#[test]
fn pio_single_block_read_returns_media_pattern() {
    init_test_tracing();
    let mut ctrl = controller_ready_for_pio_transfer(test_pattern_block()).unwrap();

    let buffer = shared_buffer(BLOCK_SIZE);
    let mut packet = PassThruPacket::single_block_read(buffer.clone());
    ctrl.pass_thru.pass_thru(&mut packet).unwrap();

    assert!(packet.transaction_status.is_ok());
    assert_eq!(*buffer.borrow(), test_pattern_block());
    assert_eq!(
        read_bar_reg(&mut ctrl.pass_thru, SD_NOR_INT_STS, PciIoWidth::Uint16),
        0
    );
}

#[test]
fn pio_single_block_write_reaches_device() {
    init_test_tracing();
    let mut ctrl = controller_ready_for_pio_transfer(vec![0u8; BLOCK_SIZE]).unwrap();

    let block = test_pattern_block();
    let mut packet = PassThruPacket::single_block_write(block.clone());
    ctrl.pass_thru.pass_thru(&mut packet).unwrap();

    assert!(packet.transaction_status.is_ok());
    assert_eq!(ctrl.model.state().written_block, block);
}

#[test]
fn pass_thru_located_through_protocol_database() {
    init_test_tracing();
    let ctrl = controller_ready_for_pio_transfer(test_pattern_block()).unwrap();
    let instance = Rc::new(RefCell::new(ctrl.pass_thru));

    let mut bs = BootServices::new();
    bs.install_protocol_interface(None, EFI_SD_MMC_PASS_THRU_PROTOCOL_GUID, instance.clone())
        .unwrap();

    let located = bs
        .locate_protocol(&EFI_SD_MMC_PASS_THRU_PROTOCOL_GUID)
        .unwrap();
    let pass_thru = located
        .downcast::<RefCell<SdMmcPassThru>>()
        .ok()
        .expect("interface should be the pass-thru instance");

    let buffer = shared_buffer(BLOCK_SIZE);
    let mut packet = PassThruPacket::single_block_read(buffer.clone());
    pass_thru.borrow_mut().pass_thru(&mut packet).unwrap();
    assert_eq!(*buffer.borrow(), test_pattern_block());
}
