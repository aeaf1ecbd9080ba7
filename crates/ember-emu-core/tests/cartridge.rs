use ember_emu_core::{
    apu::VolumeCell,
    cartridge::Cartridge,
    hardware::MachineMode,
    mmu::Mmu,
    state::RtcSnapshot,
};

fn mmu_with(rom: Vec<u8>) -> Mmu {
    let mut mmu = Mmu::new(MachineMode::Dmg, VolumeCell::default());
    mmu.load_cart(Cartridge::load(rom).unwrap());
    mmu
}

fn banked_rom(cart_type: u8, banks: usize) -> Vec<u8> {
    let mut rom = vec![0u8; banks * 0x4000];
    rom[0x134..0x13B].copy_from_slice(b"MBCTEST");
    rom[0x147] = cart_type;
    rom[0x148] = match banks {
        2 => 0x00,
        4 => 0x01,
        8 => 0x02,
        16 => 0x03,
        32 => 0x04,
        64 => 0x05,
        128 => 0x06,
        _ => 0x00,
    };
    for bank in 0..banks {
        rom[bank * 0x4000] = bank as u8;
    }
    rom
}

#[test]
fn mbc1_bank_zero_write_selects_bank_one() {
    let mut mmu = mmu_with(banked_rom(0x01, 32));

    // Writing 0x00 to the ROM-bank register must map bank 1, never bank 0.
    mmu.write_byte(0x2000, 0x00);
    assert_eq!(mmu.read_byte(0x4000), 0x01);
    assert_eq!(mmu.read_byte(0x0000), 0x00);

    mmu.write_byte(0x2000, 0x02);
    assert_eq!(mmu.read_byte(0x4000), 0x02);
}

#[test]
fn mbc1_upper_bits_and_mode() {
    let mut mmu = mmu_with(banked_rom(0x01, 128));

    mmu.write_byte(0x2000, 0x02);
    mmu.write_byte(0x4000, 0x01); // upper bits: bank 0x22
    assert_eq!(mmu.read_byte(0x4000), 0x22);

    // The 0x20/0x40/0x60 aliases resolve one bank up.
    mmu.write_byte(0x2000, 0x00);
    assert_eq!(mmu.read_byte(0x4000), 0x21);

    // RAM-banking mode drops the upper bits from the ROM window.
    mmu.write_byte(0x6000, 0x01);
    assert_eq!(mmu.read_byte(0x4000), 0x01);
}

#[test]
fn mbc1_ram_enable_gates_reads_and_writes() {
    let mut rom = banked_rom(0x03, 4);
    rom[0x149] = 0x03;
    let mut mmu = mmu_with(rom);

    mmu.write_byte(0xA000, 0x55);
    assert_eq!(mmu.read_byte(0xA000), 0xFF);

    mmu.write_byte(0x0000, 0x0A);
    mmu.write_byte(0xA000, 0x55);
    assert_eq!(mmu.read_byte(0xA000), 0x55);

    mmu.write_byte(0x0000, 0x00);
    assert_eq!(mmu.read_byte(0xA000), 0xFF);
}

#[test]
fn mbc3_rtc_latch_via_bus() {
    let mut rom = banked_rom(0x10, 4);
    rom[0x149] = 0x03;
    let mut mmu = mmu_with(rom);

    mmu.write_byte(0x0000, 0x0A);
    // Advance the clock ~2 emulated seconds.
    mmu.cart.as_mut().unwrap().step_rtc(4_194_304 * 2);

    // Latch on the 0 -> 1 transition, then select RTC seconds.
    mmu.write_byte(0x6000, 0x00);
    mmu.write_byte(0x6000, 0x01);
    mmu.write_byte(0x4000, 0x08);
    assert_eq!(mmu.read_byte(0xA000), 2);

    // Without a fresh latch the reading is stable.
    mmu.cart.as_mut().unwrap().step_rtc(4_194_304 * 3);
    assert_eq!(mmu.read_byte(0xA000), 2);
}

#[test]
fn mbc3_rom_bank_seven_bits() {
    let mut mmu = mmu_with(banked_rom(0x11, 128));
    mmu.write_byte(0x2000, 0x7F);
    assert_eq!(mmu.read_byte(0x4000), 0x7F);
    mmu.write_byte(0x2000, 0x00);
    assert_eq!(mmu.read_byte(0x4000), 0x01);
}

#[test]
fn mbc5_bank_zero_is_reachable() {
    let mut mmu = mmu_with(banked_rom(0x19, 64));
    mmu.write_byte(0x2000, 0x00);
    assert_eq!(mmu.read_byte(0x4000), 0x00);
    mmu.write_byte(0x2000, 0x3F);
    assert_eq!(mmu.read_byte(0x4000), 0x3F);
}

#[test]
fn mbc2_address_decode() {
    let mut mmu = mmu_with(banked_rom(0x06, 16));
    // Bank select lives at 0x2100-0x21FF; the enable range is below it.
    mmu.write_byte(0x2100, 0x05);
    assert_eq!(mmu.read_byte(0x4000), 0x05);
    mmu.write_byte(0x0000, 0x0A);
    mmu.write_byte(0xA000, 0x09);
    assert_eq!(mmu.read_byte(0xA000), 0xF9);
}

#[test]
fn rtc_snapshot_json_round_trip_credits_elapsed_time() {
    let mut rom = banked_rom(0x10, 4);
    rom[0x149] = 0x03;
    let mut cart = Cartridge::load(rom).unwrap();

    let snap = RtcSnapshot {
        seconds: 10,
        minutes: 5,
        hours: 1,
        days_low: 2,
        days_high: 0,
        latched_seconds: 10,
        latched_minutes: 5,
        latched_hours: 1,
        latched_days_low: 2,
        latched_days_high: 0,
        last_time: 1_000_000,
    };
    let json = serde_json::to_string(&snap).unwrap();
    let decoded: RtcSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, snap);

    // Loading 90 wall-clock seconds later credits the gap.
    let rtc = cart.rtc_mut().unwrap();
    rtc.restore(&decoded, 1_000_090);
    let out = rtc.snapshot(1_000_090);
    assert_eq!(out.seconds, 40);
    assert_eq!(out.minutes, 6);
    assert_eq!(out.hours, 1);

    // A halted clock ignores elapsed time entirely.
    let halted = RtcSnapshot {
        days_high: 0x40,
        ..snap
    };
    rtc.restore(&halted, 2_000_000);
    let out = rtc.snapshot(2_000_000);
    assert_eq!(out.seconds, 10);
    assert_eq!(out.minutes, 5);
}
