//! End-to-end flasher tests against a pin-level chip simulation.

use ccflash::{
    error::{ConnectionError, Error},
    flasher::Flasher,
    targets::Chip,
};

mod common;

use common::MockChip;

#[test]
fn identifies_a_cc2530() {
    let chip = MockChip::cc2530();
    let flasher = Flasher::connect(Box::new(chip)).unwrap();

    let info = flasher.device_info();
    assert_eq!(info.chip, Chip::Cc2530);
    assert_eq!(info.revision, 4);
    assert!(!info.is_locked);
    assert_eq!(info.flash_size, 262_144);
    assert_eq!(info.writable_flash_size, 262_128);
    assert_eq!(info.flash_bank_size, 32_768);
    assert_eq!(info.flash_page_size, 2048);
    assert_eq!(info.flash_pages, 128);
    assert_eq!(info.sram_size, 8192);
    // Stored least-significant first; reported in display order.
    assert_eq!(
        info.ieee_address,
        vec![0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn reads_memory_with_the_expected_instruction_sequence() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    state.borrow_mut().sram[0x1234..0x1238].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    state.borrow_mut().instructions.clear();

    let mut data = [0u8; 4];
    flasher.read_memory(0x1234, &mut data).unwrap();
    assert_eq!(data, [0xde, 0xad, 0xbe, 0xef]);

    // Set the pointer once, then alternate fetch and increment, with no
    // trailing increment after the last byte.
    assert_eq!(
        state.borrow().instructions,
        vec![
            vec![0x90, 0x12, 0x34],
            vec![0xe0],
            vec![0xa3],
            vec![0xe0],
            vec![0xa3],
            vec![0xe0],
            vec![0xa3],
            vec![0xe0],
        ]
    );
}

#[test]
fn writes_memory_and_verifies_each_address() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    let data = [0x01, 0x80, 0xff, 0x42];
    flasher.write_memory(0x0100, &data, true).unwrap();
    assert_eq!(&state.borrow().sram[0x0100..0x0104], &data);

    let mut readback = [0u8; 4];
    flasher.read_memory(0x0100, &mut readback).unwrap();
    assert_eq!(readback, data);
}

#[test]
fn executes_single_instructions() {
    let chip = MockChip::cc2530();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    // MOV A,#0x5a leaves the operand in the accumulator.
    assert_eq!(flasher.execute_instruction(&[0x74, 0x5a]).unwrap(), 0x5a);
}

#[test]
fn flash_reads_cross_bank_boundaries() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    let pattern: Vec<u8> = (0..0x20u32).map(|i| i as u8).collect();
    state.borrow_mut().flash[0x7ff0..0x8010].copy_from_slice(&pattern);

    let mut data = vec![0u8; 0x20];
    let read = flasher.read_flash(0x7ff0, &mut data).unwrap();
    assert_eq!(read, 0x20);
    assert_eq!(data, pattern);
}

#[test]
fn flash_reads_clamp_at_the_lock_bytes() {
    let chip = MockChip::cc2530();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    let writable = flasher.device_info().writable_flash_size;
    let mut data = vec![0u8; 16];
    let read = flasher.read_flash(writable - 8, &mut data).unwrap();
    assert_eq!(read, 8);

    assert!(matches!(
        flasher.read_flash(writable + 1, &mut data),
        Err(Error::BadRange { .. })
    ));
}

#[test]
fn writes_and_reads_back_a_flash_page() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    let page_size = flasher.device_info().flash_page_size as usize;
    let pattern: Vec<u8> = (0..page_size).map(|i| (i % 241) as u8).collect();

    flasher.write_flash_page(5, &pattern, true).unwrap();

    assert_eq!(flasher.read_flash_page(5).unwrap(), pattern);
    assert_eq!(
        &state.borrow().flash[5 * page_size..6 * page_size],
        &pattern
    );
    // Neighbouring pages stay erased.
    assert!(state.borrow().flash[4 * page_size..5 * page_size]
        .iter()
        .all(|&b| b == 0xff));
}

#[test]
fn multi_page_writes_splice_partial_pages() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    // Pre-existing content around the write target.
    state.borrow_mut().flash[0x0700..0x0800].fill(0x33);

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 239) as u8).collect();
    let written = flasher.write_flash(0x07f0, &data, true).unwrap();
    assert_eq!(written, 3000);

    let mut readback = vec![0u8; 3000];
    flasher.read_flash(0x07f0, &mut readback).unwrap();
    assert_eq!(readback, data);

    // Bytes ahead of the write survive the read-modify-write of the first
    // page.
    assert!(state.borrow().flash[0x0700..0x07f0].iter().all(|&b| b == 0x33));
}

#[test]
fn erases_single_pages() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    state.borrow_mut().flash[2 * 2048..3 * 2048].fill(0x55);
    state.borrow_mut().flash[3 * 2048..4 * 2048].fill(0x00);

    flasher.erase_flash_page(3).unwrap();

    assert!(state.borrow().flash[3 * 2048..4 * 2048].iter().all(|&b| b == 0xff));
    assert!(state.borrow().flash[2 * 2048..3 * 2048].iter().all(|&b| b == 0x55));

    assert!(matches!(
        flasher.erase_flash_page(128),
        Err(Error::BadRange { .. })
    ));
}

#[test]
fn cc2533_pages_map_directly_onto_faddrh() {
    let chip = MockChip::cc2533();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    assert_eq!(flasher.device_info().chip, Chip::Cc2533);
    assert_eq!(flasher.device_info().flash_size, 96 * 1024);
    assert_eq!(flasher.device_info().flash_page_size, 1024);

    state.borrow_mut().flash[2 * 1024..3 * 1024].fill(0x55);
    state.borrow_mut().flash[3 * 1024..4 * 1024].fill(0x00);

    flasher.erase_flash_page(3).unwrap();

    assert!(state.borrow().flash[3 * 1024..4 * 1024].iter().all(|&b| b == 0xff));
    assert!(state.borrow().flash[2 * 1024..3 * 1024].iter().all(|&b| b == 0x55));
}

#[test]
fn lock_bits_follow_the_bitmap_layout() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    let writable = flasher.device_info().writable_flash_size as usize;

    flasher.lock_flash_pages(8, 4).unwrap();

    // Bit k of byte k/8 is the unlock indicator of page k; locking pages
    // 8..=11 clears the low nibble of byte 1.
    {
        let state = state.borrow();
        assert_eq!(state.flash[writable + 1], 0xf0);
        for (i, &byte) in state.flash[writable..writable + 16].iter().enumerate() {
            if i != 1 {
                assert_eq!(byte, 0xff, "lock byte {i} should be untouched");
            }
        }
    }

    for page in 0..16 {
        let locked = flasher.is_flash_page_locked(page).unwrap();
        assert_eq!(locked, (8..12).contains(&page), "page {page}");
    }

    // Unlocking the middle of the range leaves the edges locked.
    flasher.unlock_flash_pages(9, 2).unwrap();
    assert_eq!(state.borrow().flash[writable + 1], 0xf6);
    assert!(flasher.is_flash_page_locked(8).unwrap());
    assert!(!flasher.is_flash_page_locked(9).unwrap());
    assert!(!flasher.is_flash_page_locked(10).unwrap());
    assert!(flasher.is_flash_page_locked(11).unwrap());
}

#[test]
fn aborted_page_write_reports_the_completed_byte_count() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    // The fourth program cycle (page index 3) fails with FCTL.ABORT.
    state.borrow_mut().abort_on_page_write = Some(4);

    let data = vec![0xa5u8; 4 * 2048];
    let error = flasher.write_flash(0, &data, false).unwrap_err();

    match error {
        Error::PartialTransfer { done, source } => {
            assert_eq!(done, 3 * 2048);
            assert!(matches!(*source, Error::FlashController { fctl } if fctl & 0x20 != 0));
        }
        other => panic!("expected a partial transfer, got {other:?}"),
    }

    // The pages before the failure made it to flash.
    assert!(state.borrow().flash[..3 * 2048].iter().all(|&b| b == 0xa5));
}

#[test]
fn chip_erase_lifts_the_debug_lock() {
    let chip = MockChip::cc2530();
    let state = chip.handle();

    // A cleared bit 7 in the last flash byte locks the debug interface at
    // reset.
    let flash_len = state.borrow().flash.len();
    state.borrow_mut().flash[flash_len - 1] = 0x7f;

    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();
    let info = flasher.device_info();
    assert!(info.is_locked);
    assert_eq!(info.chip, Chip::Cc2530);
    assert_eq!(info.flash_size, 0);

    let mut data = [0u8; 4];
    assert!(matches!(
        flasher.read_flash(0, &mut data),
        Err(Error::ChipLocked)
    ));

    flasher.erase_flash().unwrap();

    let info = flasher.device_info();
    assert!(!info.is_locked);
    assert_eq!(info.flash_size, 262_144);
    assert!(state.borrow().flash.iter().all(|&b| b == 0xff));
}

#[test]
fn locking_the_debug_interface_clears_the_fuse_bit() {
    let chip = MockChip::cc2530();
    let state = chip.handle();
    let mut flasher = Flasher::connect(Box::new(chip)).unwrap();

    flasher.lock_debug_interface().unwrap();

    assert!(flasher.device_info().is_locked);
    assert!(state.borrow().is_debug_locked());
    let flash_len = state.borrow().flash.len();
    assert_eq!(state.borrow().flash[flash_len - 1], 0x7f);
}

#[test]
fn slow_responses_are_retried_and_eventually_time_out() {
    // One throwaway byte is covered by the default retry budget.
    let chip = MockChip::cc2530();
    chip.handle().borrow_mut().response_delay_bytes = 1;
    assert!(Flasher::connect(Box::new(chip)).is_ok());

    // Three are not.
    let chip = MockChip::cc2530();
    chip.handle().borrow_mut().response_delay_bytes = 3;
    assert!(matches!(
        Flasher::connect(Box::new(chip)),
        Err(Error::Connection(ConnectionError::NoResponse(_)))
    ));
}
