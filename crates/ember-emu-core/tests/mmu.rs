use ember_emu_core::{
    apu::VolumeCell,
    cartridge::Cartridge,
    hardware::MachineMode,
    mmu::Mmu,
};

fn blank_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 0x8000];
    rom[0x134..0x13B].copy_from_slice(b"MMUTEST");
    rom
}

fn dmg_mmu() -> Mmu {
    Mmu::new(MachineMode::Dmg, VolumeCell::default())
}

fn cgb_mmu() -> Mmu {
    Mmu::new(MachineMode::Cgb, VolumeCell::default())
}

#[test]
fn wram_echo_and_bank_switch() {
    let mut mmu = cgb_mmu();
    mmu.write_byte(0xC000, 0xAA);
    assert_eq!(mmu.read_byte(0xC000), 0xAA);
    mmu.write_byte(0xE000, 0xBB);
    assert_eq!(mmu.read_byte(0xC000), 0xBB);

    mmu.write_byte(0xFF70, 0x02);
    mmu.write_byte(0xD000, 0xCC);
    assert_eq!(mmu.read_byte(0xD000), 0xCC);

    mmu.write_byte(0xFF70, 0x03);
    assert_eq!(mmu.read_byte(0xD000), 0x00);
    mmu.write_byte(0xD000, 0xDD);
    assert_eq!(mmu.read_byte(0xD000), 0xDD);

    mmu.write_byte(0xFF70, 0x02);
    assert_eq!(mmu.read_byte(0xD000), 0xCC);

    // Bank 0 selects bank 1.
    mmu.write_byte(0xFF70, 0x00);
    assert_eq!(mmu.wram_bank, 1);
}

#[test]
fn vram_bank_switch() {
    let mut mmu = cgb_mmu();
    mmu.write_byte(0x8000, 0x11);
    assert_eq!(mmu.read_byte(0x8000), 0x11);

    mmu.write_byte(0xFF4F, 0x01);
    assert_eq!(mmu.read_byte(0xFF4F), 0xFF);
    assert_eq!(mmu.read_byte(0x8000), 0x00);
    mmu.write_byte(0x8000, 0x22);
    assert_eq!(mmu.read_byte(0x8000), 0x22);

    mmu.write_byte(0xFF4F, 0x00);
    assert_eq!(mmu.read_byte(0x8000), 0x11);
}

#[test]
fn vram_and_oam_gated_by_mode() {
    let mut mmu = dmg_mmu();
    // LCD off: everything accessible.
    mmu.write_byte(0x8000, 0x12);
    assert_eq!(mmu.read_byte(0x8000), 0x12);
    mmu.write_byte(0xFE00, 0x34);
    assert_eq!(mmu.read_byte(0xFE00), 0x34);

    // LCD on, start of line: OAM scan blocks OAM but not VRAM.
    mmu.write_byte(0xFF40, 0x91);
    assert_eq!(mmu.ppu.mode_stat(), 2);
    assert_eq!(mmu.read_byte(0xFE00), 0xFF);
    mmu.write_byte(0xFE00, 0x55);
    assert_eq!(mmu.read_byte(0x8000), 0x12);

    // Pixel transfer blocks VRAM; writes are dropped silently.
    mmu.tick(80, 0);
    assert_eq!(mmu.ppu.mode_stat(), 3);
    assert_eq!(mmu.read_byte(0x8000), 0xFF);
    mmu.write_byte(0x8000, 0x99);

    // H-Blank: both visible again, and the dropped writes never landed.
    mmu.tick(300, 0);
    assert_eq!(mmu.ppu.mode_stat(), 0);
    assert_eq!(mmu.read_byte(0x8000), 0x12);
    assert_eq!(mmu.read_byte(0xFE00), 0x34);
}

#[test]
fn oam_dma_copies_a0_bytes_at_once() {
    let mut mmu = dmg_mmu();
    for i in 0..0xA0u16 {
        mmu.write_byte(0x8000 + i, i as u8);
    }
    mmu.write_byte(0xFF46, 0x80);
    assert_eq!(mmu.read_byte(0xFF46), 0x80);
    assert_eq!(mmu.ppu.oam[0x00], 0x00);
    assert_eq!(mmu.ppu.oam[0x5A], 0x5A);
    assert_eq!(mmu.ppu.oam[0x9F], 0x9F);
}

#[test]
fn oam_dma_lands_during_oam_scan() {
    let mut mmu = dmg_mmu();
    for i in 0..0xA0u16 {
        mmu.write_byte(0xC000 + i, 0x77);
    }
    mmu.write_byte(0xFF40, 0x91);
    assert_eq!(mmu.ppu.mode_stat(), 2);
    // CPU writes to OAM are blocked, but the DMA engine's are not.
    mmu.write_byte(0xFE10, 0x01);
    assert_eq!(mmu.ppu.oam[0x10], 0x00);
    mmu.write_byte(0xFF46, 0xC0);
    assert_eq!(mmu.ppu.oam[0x10], 0x77);
}

#[test]
fn hdma_wait_loop_observes_idle_ff55() {
    let mut mmu = cgb_mmu();
    mmu.write_byte(0xFF40, 0x80);

    for (i, addr) in (0xC000..0xC010).enumerate() {
        mmu.write_byte(addr, i as u8);
    }

    mmu.write_byte(0xFF51, 0xC0);
    mmu.write_byte(0xFF52, 0x00);
    mmu.write_byte(0xFF53, 0x00);
    mmu.write_byte(0xFF54, 0x00);

    // One 16-byte H-Blank block. The LCD is on and inside OAM scan, so the
    // transfer waits.
    mmu.write_byte(0xFF55, 0x80);
    assert_ne!(mmu.read_byte(0xFF55), 0xFF, "HDMA should report busy");

    mmu.hdma_hblank_transfer();
    assert_eq!(mmu.read_byte(0xFF55), 0xFF);
    for i in 0..16usize {
        assert_eq!(mmu.ppu.vram[0][i], i as u8);
    }
}

#[test]
fn gdma_transfers_immediately_and_stalls() {
    let mut mmu = cgb_mmu();
    for (i, addr) in (0xC000..0xC020).enumerate() {
        mmu.write_byte(addr, (i as u8) ^ 0xA5);
    }
    mmu.write_byte(0xFF51, 0xC0);
    mmu.write_byte(0xFF52, 0x00);
    mmu.write_byte(0xFF53, 0x01);
    mmu.write_byte(0xFF54, 0x00);

    mmu.write_byte(0xFF55, 0x01); // 2 blocks, general mode
    assert_eq!(mmu.read_byte(0xFF55), 0xFF);
    for i in 0..32usize {
        assert_eq!(mmu.ppu.vram[0][0x100 + i], (i as u8) ^ 0xA5);
    }
    assert_eq!(mmu.take_dma_stall(), 64);
    assert_eq!(mmu.take_dma_stall(), 0);
}

#[test]
fn hdma_cancel_mid_transfer() {
    let mut mmu = cgb_mmu();
    mmu.write_byte(0xFF40, 0x80);
    mmu.write_byte(0xFF51, 0xC0);
    mmu.write_byte(0xFF52, 0x00);
    mmu.write_byte(0xFF53, 0x00);
    mmu.write_byte(0xFF54, 0x00);

    mmu.write_byte(0xFF55, 0x82); // 3 blocks, H-Blank mode
    mmu.hdma_hblank_transfer();
    assert_eq!(mmu.read_byte(0xFF55), 0x01); // 2 blocks left, busy

    mmu.write_byte(0xFF55, 0x00); // clear bit 7: cancel
    assert_eq!(mmu.read_byte(0xFF55), 0x80 | 0x01);
    // Further H-Blanks move nothing.
    let before = mmu.ppu.vram[0][0x10];
    mmu.hdma_hblank_transfer();
    assert_eq!(mmu.ppu.vram[0][0x10], before);
}

#[test]
fn boot_rom_overlay_and_disable() {
    let mut mmu = dmg_mmu();
    let mut rom = blank_rom();
    rom[0x0000] = 0xBB;
    mmu.load_cart(Cartridge::load(rom).unwrap());
    mmu.load_boot_rom(vec![0xAA; 0x100]);

    assert_eq!(mmu.read_byte(0x0000), 0xAA);
    mmu.write_byte(0xFF50, 1);
    assert_eq!(mmu.read_byte(0x0000), 0xBB);
}

#[test]
fn cgb_boot_rom_mapping_leaves_header_visible() {
    let mut rom = blank_rom();
    rom[0x0000] = 0xC0;
    rom[0x0100] = 0xC2;
    rom[0x01FF] = 0xC3;
    rom[0x0200] = 0xC4;
    rom[0x08FF] = 0xC5;

    let mut mmu = cgb_mmu();
    mmu.load_cart(Cartridge::load(rom).unwrap());

    let mut boot = vec![0u8; 0x900];
    boot[0x0000] = 0xA0;
    boot[0x0200] = 0xA4;
    boot[0x08FF] = 0xA5;
    mmu.load_boot_rom(boot);

    assert_eq!(mmu.read_byte(0x0000), 0xA0);
    assert_eq!(mmu.read_byte(0x0100), 0xC2);
    assert_eq!(mmu.read_byte(0x01FF), 0xC3);
    assert_eq!(mmu.read_byte(0x0200), 0xA4);
    assert_eq!(mmu.read_byte(0x08FF), 0xA5);

    mmu.write_byte(0xFF50, 1);
    assert_eq!(mmu.read_byte(0x0000), 0xC0);
    assert_eq!(mmu.read_byte(0x0200), 0xC4);
}

#[test]
fn open_bus_read_patterns() {
    let mut mmu = dmg_mmu();
    // Joypad upper bits always read set.
    assert_eq!(mmu.read_byte(0xFF00) & 0xC0, 0xC0);
    // APU write-only bits.
    assert_eq!(mmu.read_byte(0xFF10), 0x80);
    assert_eq!(mmu.read_byte(0xFF11), 0x3F);
    assert_eq!(mmu.read_byte(0xFF26) & 0x70, 0x70);
    // TAC and IF upper bits.
    assert_eq!(mmu.read_byte(0xFF07) & 0xF8, 0xF8);
    assert_eq!(mmu.read_byte(0xFF0F) & 0xE0, 0xE0);
    // Unmapped I/O and the FEA0 hole.
    assert_eq!(mmu.read_byte(0xFF03), 0xFF);
    assert_eq!(mmu.read_byte(0xFEA0), 0xFF);
    mmu.write_byte(0xFF03, 0x12);
    assert_eq!(mmu.read_byte(0xFF03), 0xFF);
    // CGB-only registers read open on DMG.
    assert_eq!(mmu.read_byte(0xFF4D), 0xFF);
    assert_eq!(mmu.read_byte(0xFF70), 0xFF);
    assert_eq!(mmu.read_byte(0xFF55), 0xFF);
}

#[test]
fn no_cartridge_reads_open_bus() {
    let mut mmu = dmg_mmu();
    assert_eq!(mmu.read_byte(0x0000), 0xFF);
    assert_eq!(mmu.read_byte(0x4000), 0xFF);
    assert_eq!(mmu.read_byte(0xA000), 0xFF);
    mmu.write_byte(0x2000, 0x03); // silently dropped
}
