use log::trace;

use crate::{
    apu::{Apu, VolumeCell},
    cartridge::Cartridge,
    hardware::MachineMode,
    input::Input,
    ppu::Ppu,
    serial::Serial,
    timer::Timer,
};

const WRAM_BANK_SIZE: usize = 0x1000;

/// Transfer mode for CGB VRAM DMA operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaMode {
    /// General DMA (immediate, CPU stalled)
    Gdma,
    /// H-Blank DMA (16 bytes per H-Blank)
    Hdma,
}

#[derive(Debug)]
struct HdmaState {
    /// 16-bit source pointer (upper 12 bits writable)
    src: u16,
    /// Destination in VRAM (0x8000 | (dst & 0x1FF0))
    dst: u16,
    /// Remaining 0x10-byte blocks
    blocks: u8,
    mode: DmaMode,
    active: bool,
    /// Set when the previous transfer was cancelled via FF55 bit 7.
    cancelled: bool,
}

pub struct Mmu {
    pub wram: [[u8; WRAM_BANK_SIZE]; 8],
    pub wram_bank: usize,
    pub hram: [u8; 0x7F],
    pub cart: Option<Cartridge>,
    pub boot_rom: Option<Vec<u8>>,
    pub boot_mapped: bool,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub input: Input,
    hdma: HdmaState,
    pub key1: u8,
    /// CGB infrared port register; the port itself is unconnected.
    rp: u8,
    /// Stall cycles owed to the CPU by General/H-Blank DMA transfers.
    dma_stall: u32,
    mode: MachineMode,
}

impl Mmu {
    pub fn new(mode: MachineMode, volume: VolumeCell) -> Self {
        Self {
            wram: [[0; WRAM_BANK_SIZE]; 8],
            wram_bank: 1,
            hram: [0; 0x7F],
            cart: None,
            boot_rom: None,
            boot_mapped: false,
            if_reg: 0xE0,
            ie_reg: 0,
            serial: Serial::new(mode.is_cgb_game()),
            ppu: Ppu::new(mode),
            apu: Apu::new(mode.is_cgb_game(), volume),
            timer: Timer::new(),
            input: Input::new(),
            hdma: HdmaState {
                src: 0,
                dst: Self::sanitize_vram_dma_dest(0),
                blocks: 0,
                mode: DmaMode::Gdma,
                active: false,
                cancelled: false,
            },
            key1: if mode.is_cgb_hardware() { 0x7E } else { 0 },
            rp: 0,
            dma_stall: 0,
            mode,
        }
    }

    #[inline]
    pub fn is_cgb(&self) -> bool {
        self.mode.is_cgb_game()
    }

    pub fn machine_mode(&self) -> MachineMode {
        self.mode
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.boot_rom = Some(data);
        self.boot_mapped = true;
    }

    #[inline]
    pub fn double_speed(&self) -> bool {
        self.key1 & 0x80 != 0
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        match addr {
            // Boot ROM overlay. DMG covers 0x0000-0x00FF; the CGB boot ROM
            // also maps 0x0200-0x08FF, leaving the header visible.
            0x0000..=0x00FF if self.boot_mapped => self
                .boot_rom
                .as_ref()
                .and_then(|b| b.get(addr as usize).copied())
                .unwrap_or(0xFF),
            0x0200..=0x08FF if self.boot_mapped && self.mode.is_cgb_hardware() => self
                .boot_rom
                .as_ref()
                .and_then(|b| b.get(addr as usize).copied())
                .unwrap_or(0xFF),
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                self.cart.as_ref().map(|c| c.read(addr)).unwrap_or(0xFF)
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[self.ppu.vram_bank][(addr - 0x8000) as usize]
                } else {
                    0xFF
                }
            }
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize],
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize],
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize],
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize],
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => self.input.read(),
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.if_reg | 0xE0,
            0xFF10..=0xFF3F => self.apu.read_reg(addr),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF68..=0xFF6B => self.ppu.read_reg(addr),
            0xFF46 => self.ppu.dma,
            0xFF4D => {
                if self.mode.is_cgb_hardware() {
                    (self.key1 & 0x81) | 0x7E
                } else {
                    0xFF
                }
            }
            0xFF4F => {
                if self.is_cgb() {
                    0xFE | self.ppu.vram_bank as u8
                } else {
                    0xFF
                }
            }
            0xFF51 => {
                if self.is_cgb() {
                    (self.hdma.src >> 8) as u8
                } else {
                    0xFF
                }
            }
            0xFF52 => {
                if self.is_cgb() {
                    (self.hdma.src & 0x00F0) as u8
                } else {
                    0xFF
                }
            }
            0xFF53 => {
                if self.is_cgb() {
                    ((self.hdma.dst & 0x1F00) >> 8) as u8
                } else {
                    0xFF
                }
            }
            0xFF54 => {
                if self.is_cgb() {
                    (self.hdma.dst & 0x00F0) as u8
                } else {
                    0xFF
                }
            }
            0xFF55 => {
                if !self.is_cgb() {
                    0xFF
                } else if self.hdma.active {
                    // Busy: bit 7 clear, remaining blocks minus one below.
                    self.hdma.blocks.saturating_sub(1) & 0x7F
                } else if self.hdma.cancelled {
                    0x80 | (self.hdma.blocks.saturating_sub(1) & 0x7F)
                } else {
                    0xFF
                }
            }
            0xFF56 => {
                if self.is_cgb() {
                    self.rp | 0x3C
                } else {
                    0xFF
                }
            }
            0xFF70 => {
                if self.is_cgb() {
                    0xF8 | self.wram_bank as u8
                } else {
                    0xFF
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg,
            _ => 0xFF,
        }
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.write_vram(addr - 0x8000, val);
                } else {
                    trace!(target: "ember::mmu", "VRAM write blocked {addr:04X}={val:02X}");
                }
            }
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize] = val,
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize] = val,
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize] = val,
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize] = val,
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.write_oam(addr - 0xFE00, val);
                } else {
                    trace!(target: "ember::mmu", "OAM write blocked {addr:04X}={val:02X}");
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00 => self.input.write(val),
            0xFF01 | 0xFF02 => self.serial.write(addr, val),
            0xFF04..=0xFF07 => self.timer.write(addr, val, &mut self.if_reg),
            0xFF0F => self.if_reg = (val & 0x1F) | 0xE0,
            0xFF10..=0xFF3F => self.apu.write_reg(addr, val),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF68..=0xFF6B => {
                let lcd_was_on = self.ppu.lcd_enabled();
                self.ppu.write_reg(addr, val, &mut self.if_reg);
                if addr == 0xFF40 && lcd_was_on && !self.ppu.lcd_enabled() {
                    self.complete_active_hdma();
                }
            }
            0xFF46 => {
                self.ppu.dma = val;
                self.oam_dma(val);
            }
            0xFF4D => {
                if self.mode.is_cgb_hardware() {
                    self.key1 = (self.key1 & 0x80) | (val & 0x01);
                }
            }
            0xFF4F => {
                if self.is_cgb() {
                    self.ppu.vram_bank = (val & 0x01) as usize;
                }
            }
            0xFF50 => self.boot_mapped = false,
            0xFF51 => {
                if self.is_cgb() && !self.hdma.active {
                    self.hdma.src = (val as u16) << 8 | (self.hdma.src & 0x00FF);
                }
            }
            0xFF52 => {
                if self.is_cgb() && !self.hdma.active {
                    self.hdma.src = (self.hdma.src & 0xFF00) | (val & 0xF0) as u16;
                }
            }
            0xFF53 => {
                if self.is_cgb() && !self.hdma.active {
                    let raw = (((val & 0x1F) as u16) << 8) | (self.hdma.dst & 0x00F0);
                    self.hdma.dst = Self::sanitize_vram_dma_dest(raw);
                }
            }
            0xFF54 => {
                if self.is_cgb() && !self.hdma.active {
                    let raw = (self.hdma.dst & 0x1F00) | (val as u16 & 0x00F0);
                    self.hdma.dst = Self::sanitize_vram_dma_dest(raw);
                }
            }
            0xFF55 => self.write_hdma_control(val),
            0xFF56 => {
                if self.is_cgb() {
                    self.rp = val & 0xC1;
                }
            }
            0xFF70 => {
                if self.is_cgb() {
                    let bank = (val & 0x07) as usize;
                    self.wram_bank = if bank == 0 { 1 } else { bank };
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val,
            _ => {}
        }
    }

    /// Raw read used by the DMA engines: no access gating, and on DMG the
    /// 0xFE00-0xFF9F region aliases WRAM.
    fn dma_read_byte(&mut self, addr: u16) -> u8 {
        let addr = if !self.is_cgb() && (0xFE00..=0xFF9F).contains(&addr) {
            addr.wrapping_sub(0x2000)
        } else {
            addr
        };
        match addr {
            0x8000..=0x9FFF => self.ppu.vram[self.ppu.vram_bank][(addr - 0x8000) as usize],
            0xFE00..=0xFE9F => self.ppu.oam[(addr - 0xFE00) as usize],
            _ => self.read_byte(addr),
        }
    }

    /// OAM DMA (FF46): 160 bytes land at once; the PPU's mode is treated as
    /// H-Blank for the duration, so the copy is never gated.
    fn oam_dma(&mut self, source_page: u8) {
        let src = (source_page as u16) << 8;
        for i in 0..0xA0u16 {
            let byte = self.dma_read_byte(src.wrapping_add(i));
            self.ppu.dma_write_oam(i, byte);
        }
    }

    // ------------------------------------------------------------------
    // CGB VRAM DMA
    // ------------------------------------------------------------------

    #[inline]
    fn sanitize_vram_dma_dest(addr: u16) -> u16 {
        0x8000 | (addr & 0x1FF0)
    }

    fn write_hdma_control(&mut self, val: u8) {
        if !self.is_cgb() {
            return;
        }
        self.hdma.dst = Self::sanitize_vram_dma_dest(self.hdma.dst);
        let requested_blocks = (val & 0x7F) + 1;
        if self.hdma.active && val & 0x80 == 0 {
            // Cancel mid-transfer; FF55 keeps reporting the remainder with
            // bit 7 set.
            self.hdma.active = false;
            self.hdma.cancelled = true;
        } else if val & 0x80 == 0 {
            self.start_gdma(requested_blocks);
        } else {
            self.hdma.mode = DmaMode::Hdma;
            self.hdma.blocks = requested_blocks;
            self.hdma.active = true;
            self.hdma.cancelled = false;
            if !self.ppu.lcd_enabled() || self.ppu.in_hblank() {
                self.hdma_hblank_transfer();
            }
        }
    }

    /// Perform a General DMA immediately; the CPU pays for it via
    /// `take_dma_stall`.
    fn start_gdma(&mut self, blocks: u8) {
        self.hdma.mode = DmaMode::Gdma;
        self.hdma.blocks = blocks;
        self.hdma.active = true;
        self.hdma.cancelled = false;
        for _ in 0..blocks {
            self.perform_hdma_block();
        }
    }

    /// One 0x10-byte burst during H-Blank.
    pub fn hdma_hblank_transfer(&mut self) {
        if !(self.hdma.active && self.hdma.mode == DmaMode::Hdma) {
            return;
        }
        self.perform_hdma_block();
    }

    fn perform_hdma_block(&mut self) {
        self.hdma.dst = Self::sanitize_vram_dma_dest(self.hdma.dst);
        for _ in 0..0x10 {
            let byte = self.dma_read_byte(self.hdma.src);
            let offset = self.hdma.dst & 0x1FFF;
            self.ppu.dma_write_vram(offset, byte);
            self.hdma.src = self.hdma.src.wrapping_add(1);
            self.hdma.dst = 0x8000 | (self.hdma.dst.wrapping_add(1) & 0x1FFF);
        }

        self.hdma.blocks = self.hdma.blocks.saturating_sub(1);
        if self.hdma.blocks == 0 {
            self.hdma.active = false;
            self.hdma.cancelled = false;
        }
        self.hdma.dst = Self::sanitize_vram_dma_dest(self.hdma.dst);
        self.dma_stall += if self.double_speed() { 64 } else { 32 };
    }

    /// Turning the LCD off releases any pending H-Blank DMA in one burst.
    fn complete_active_hdma(&mut self) {
        while self.hdma.active && self.hdma.mode == DmaMode::Hdma {
            self.perform_hdma_block();
        }
    }

    /// Claim the DMA stall debt accrued since the last instruction.
    pub fn take_dma_stall(&mut self) -> u32 {
        std::mem::take(&mut self.dma_stall)
    }

    pub fn hdma_active(&self) -> bool {
        self.hdma.active
    }

    pub fn hdma_registers(&self) -> (u16, u16, u8, bool, bool) {
        (
            self.hdma.src,
            self.hdma.dst,
            self.hdma.blocks,
            self.hdma.active && self.hdma.mode == DmaMode::Hdma,
            self.hdma.cancelled,
        )
    }

    pub fn restore_hdma_registers(&mut self, src: u16, dst: u16, blocks: u8, hblank: bool, cancelled: bool) {
        self.hdma.src = src;
        self.hdma.dst = Self::sanitize_vram_dma_dest(dst);
        self.hdma.blocks = blocks;
        self.hdma.mode = if hblank { DmaMode::Hdma } else { DmaMode::Gdma };
        self.hdma.active = hblank && blocks > 0;
        self.hdma.cancelled = cancelled;
    }

    // ------------------------------------------------------------------
    // Clock fan-out
    // ------------------------------------------------------------------

    /// Advance every peripheral for one CPU step of `cpu_ticks` T-cycles.
    /// LCD and audio advance by the double-speed-scaled count; DIV, TIMA,
    /// and serial advance at the CPU rate.
    pub fn tick(&mut self, cpu_ticks: u32, double_speed_shift: u8) {
        let dots = cpu_ticks >> double_speed_shift;
        self.timer.step(cpu_ticks, &mut self.if_reg);
        self.serial.step(cpu_ticks, &mut self.if_reg);
        if let Some(cart) = self.cart.as_mut() {
            cart.step_rtc(dots);
        }
        self.apu.accumulate(dots);
        if self.ppu.step(dots, &mut self.if_reg) {
            self.hdma_hblank_transfer();
        }
    }

    /// Pending, enabled interrupt lines.
    #[inline]
    pub fn irq_line(&self) -> u8 {
        self.if_reg & self.ie_reg & 0x1F
    }
}
