use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::RtcSnapshot;

/// Machine clocks per RTC second.
const RTC_CYCLES_PER_SECOND: u32 = 4_194_304;

#[derive(Error, Debug)]
pub enum CartridgeError {
    #[error("ROM image too small ({len} bytes, need at least 0x4000)")]
    TooSmall { len: usize },

    #[error("unsupported cartridge type byte {0:#04X}")]
    UnsupportedMbc(u8),
}

/// Mapper family, decoded from the cartridge-type byte at 0x147.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MbcType {
    None,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
    Mbc7,
    HuC1,
    HuC3,
    Mmm01,
    Tama5,
    Camera,
}

/// Feature flags decoded alongside the mapper tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartFeatures {
    pub sram: bool,
    pub battery: bool,
    pub rtc: bool,
    pub rumble: bool,
    pub camera: bool,
}

#[derive(Debug)]
pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub features: CartFeatures,
    /// 11-byte title from 0x134-0x13E, trimmed.
    pub title: String,
    /// 4-byte game code from 0x13F-0x142.
    pub game_code: String,
    /// Color-compatibility byte at 0x143.
    pub cgb_flag: u8,
    /// Raw new-licensee bytes (0x144, 0x145).
    pub licensee: [u8; 2],
    pub rom_banks: usize,
    pub ram_banks: usize,
    cart_type: u8,
    state: MbcState,
    /// Any MBC RAM write since the flag was last cleared. Hosts use this to
    /// debounce autosave.
    ram_dirty: bool,
    /// Rumble motor line (MBC5 rumble variant, MBC7).
    rumble_on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MbcState {
    None,
    Mbc1 {
        /// Combined 7-bit bank offset: bits 0-4 from 2000-3FFF writes,
        /// bits 5-6 from 4000-5FFF writes while in ROM mode.
        rom_bank_offset: u8,
        ram_bank: u8,
        /// Mode bit: 0 = ROM banking, 1 = RAM banking.
        mode: u8,
        ram_enabled: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enabled: bool,
    },
    Mbc3 {
        rom_bank: u8,
        /// 0x00-0x03 select RAM, 0x08-0x0C select an RTC register.
        ram_bank: u8,
        ram_enabled: bool,
        rtc: Option<Rtc>,
        latch_armed: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enabled: bool,
        rumble_wired: bool,
    },
    Mbc7 {
        rom_bank: u8,
        ram_enabled: bool,
    },
    HuC3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enabled: bool,
    },
    Mmm01 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enabled: bool,
    },
    Tama5,
    Camera {
        rom_bank: u8,
        ram_bank: u8,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RtcRegs {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub days_low: u8,
    /// Bit 0 = day bit 8, bit 6 = halt, bit 7 = day carry.
    pub days_high: u8,
}

impl RtcRegs {
    fn halted(&self) -> bool {
        self.days_high & 0x40 != 0
    }

    fn day_tick(&mut self) {
        let days = ((self.days_high as u16 & 0x01) << 8) | self.days_low as u16;
        if days >= 0x1FF {
            self.days_low = 0;
            self.days_high = (self.days_high & 0x40) | 0x80;
        } else {
            let next = days + 1;
            self.days_low = next as u8;
            self.days_high = (self.days_high & 0xC0) | ((next >> 8) as u8 & 0x01);
        }
    }

    fn advance_seconds(&mut self, mut seconds: u64) {
        while seconds > 0 {
            seconds -= 1;
            self.seconds = (self.seconds + 1) & 0x3F;
            if self.seconds == 60 || self.seconds == 0 {
                self.seconds = 0;
                self.minutes = (self.minutes + 1) & 0x3F;
                if self.minutes == 60 || self.minutes == 0 {
                    self.minutes = 0;
                    self.hours = (self.hours + 1) & 0x1F;
                    if self.hours == 24 || self.hours == 0 {
                        self.hours = 0;
                        self.day_tick();
                    }
                }
            }
        }
    }
}

/// MBC3 real-time clock. Advanced by CPU cycles while running; a wall-clock
/// timestamp rides along in snapshots so elapsed host time is credited on
/// load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rtc {
    pub regs: RtcRegs,
    pub latched: RtcRegs,
    sub_cycles: u32,
    /// Unix seconds at the last snapshot sync.
    last_time: u64,
}

impl Rtc {
    fn new() -> Self {
        Self {
            regs: RtcRegs::default(),
            latched: RtcRegs::default(),
            sub_cycles: 0,
            last_time: 0,
        }
    }

    fn latch(&mut self) {
        self.latched = self.regs;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds,
            0x09 => self.latched.minutes,
            0x0A => self.latched.hours,
            0x0B => self.latched.days_low,
            0x0C => self.latched.days_high,
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                self.sub_cycles = 0;
            }
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days_low = value,
            0x0C => self.regs.days_high = value & 0xC1,
            _ => {}
        }
    }

    pub fn step(&mut self, cycles: u32) {
        if self.regs.halted() {
            return;
        }
        let total = self.sub_cycles as u64 + cycles as u64;
        let seconds = total / RTC_CYCLES_PER_SECOND as u64;
        self.sub_cycles = (total % RTC_CYCLES_PER_SECOND as u64) as u32;
        if seconds > 0 {
            self.regs.advance_seconds(seconds);
        }
    }

    pub fn snapshot(&self, now: u64) -> RtcSnapshot {
        RtcSnapshot {
            seconds: self.regs.seconds,
            minutes: self.regs.minutes,
            hours: self.regs.hours,
            days_low: self.regs.days_low,
            days_high: self.regs.days_high,
            latched_seconds: self.latched.seconds,
            latched_minutes: self.latched.minutes,
            latched_hours: self.latched.hours,
            latched_days_low: self.latched.days_low,
            latched_days_high: self.latched.days_high,
            last_time: now,
        }
    }

    pub fn restore(&mut self, snap: &RtcSnapshot, now: u64) {
        self.regs = RtcRegs {
            seconds: snap.seconds & 0x3F,
            minutes: snap.minutes & 0x3F,
            hours: snap.hours & 0x1F,
            days_low: snap.days_low,
            days_high: snap.days_high & 0xC1,
        };
        self.latched = RtcRegs {
            seconds: snap.latched_seconds & 0x3F,
            minutes: snap.latched_minutes & 0x3F,
            hours: snap.latched_hours & 0x1F,
            days_low: snap.latched_days_low,
            days_high: snap.latched_days_high & 0xC1,
        };
        self.sub_cycles = 0;
        self.last_time = snap.last_time;
        if !self.regs.halted() && now > snap.last_time {
            self.regs.advance_seconds(now - snap.last_time);
        }
    }
}

impl Cartridge {
    /// Parse a raw ROM image. Rejects images too small to carry a header
    /// and cartridge-type bytes this core has no mapper for.
    pub fn load(data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.len() < 0x4000 {
            return Err(CartridgeError::TooSmall { len: data.len() });
        }

        let header = Header { data: &data };
        let cart_type = header.cart_type();
        let (mbc, features) = decode_cart_type(cart_type)?;

        let rom_banks = header.rom_banks();
        let ram_banks = header.ram_banks();
        let ram_size = match mbc {
            // MBC2 carries 512x4-bit internal RAM regardless of the header.
            MbcType::Mbc2 => 0x200,
            MbcType::Mbc7 => 0x800,
            _ => ram_banks * 0x2000,
        };

        let state = initial_state(mbc, &features);
        let cart = Self {
            title: header.title(),
            game_code: header.game_code(),
            cgb_flag: header.cgb_flag(),
            licensee: header.licensee(),
            rom_banks,
            ram_banks,
            ram: vec![0; ram_size],
            rom: data,
            mbc,
            features,
            cart_type,
            state,
            ram_dirty: false,
            rumble_on: false,
        };

        info!(
            target: "ember::cartridge",
            "loaded \"{}\" ({:?}, {} ROM banks, {} RAM banks{})",
            cart.title,
            cart.mbc,
            cart.rom_banks,
            cart.ram_banks,
            if cart.features.rtc { ", RTC" } else { "" },
        );
        Ok(cart)
    }

    /// Title is color-capable per the 0x143 byte (0x80 dual, 0xC0 CGB-only,
    /// plus the single-title 0x32 exception).
    pub fn cgb_flagged(&self) -> bool {
        matches!(self.cgb_flag, 0x80 | 0xC0 | 0x32)
    }

    pub fn has_battery(&self) -> bool {
        self.features.battery
    }

    pub fn has_rtc(&self) -> bool {
        self.features.rtc
    }

    pub fn ram_dirty(&self) -> bool {
        self.ram_dirty
    }

    pub fn clear_ram_dirty(&mut self) {
        self.ram_dirty = false;
    }

    pub fn rumble_on(&self) -> bool {
        self.rumble_on
    }

    pub fn rtc(&self) -> Option<&Rtc> {
        match &self.state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }

    pub fn rtc_mut(&mut self) -> Option<&mut Rtc> {
        match &mut self.state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }

    pub fn step_rtc(&mut self, cycles: u32) {
        if let Some(rtc) = self.rtc_mut() {
            rtc.step(cycles);
        }
    }

    pub fn mbc_state(&self) -> &MbcState {
        &self.state
    }

    pub fn restore_mbc_state(&mut self, state: MbcState) {
        self.state = state;
    }

    /// Effective 0x4000-byte bank mapped into the switchable window.
    fn switchable_bank(&self) -> usize {
        let bank = match &self.state {
            MbcState::None | MbcState::Tama5 => 1,
            MbcState::Mbc1 {
                rom_bank_offset,
                ram_bank,
                mode,
                ..
            } => {
                let mut offset = *rom_bank_offset as usize & 0x1F;
                if *mode == 0 {
                    offset |= ((*ram_bank as usize) & 0x03) << 5;
                }
                // Offsets with a zero low quintet alias up by one, so the
                // 4000-7FFF window never shows bank 0 (or 0x20/0x40/0x60).
                if offset & 0x1F == 0 {
                    offset += 1;
                }
                offset
            }
            MbcState::Mbc2 { rom_bank, .. } => {
                let bank = (*rom_bank & 0x0F) as usize;
                if bank == 0 { 1 } else { bank }
            }
            MbcState::Mbc3 { rom_bank, .. }
            | MbcState::Mbc7 { rom_bank, .. }
            | MbcState::HuC3 { rom_bank, .. }
            | MbcState::Mmm01 { rom_bank, .. }
            | MbcState::Camera { rom_bank, .. } => {
                let bank = *rom_bank as usize;
                if bank == 0 { 1 } else { bank }
            }
            MbcState::Mbc5 { rom_bank, .. } => *rom_bank as usize,
        };
        bank % self.rom_banks.max(1)
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x3FFF => self.rom.get(addr as usize).copied().unwrap_or(0xFF),
            0x4000..=0x7FFF => {
                let offset = self.switchable_bank() * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            0xA000..=0xBFFF => self.read_ram(addr),
            _ => 0xFF,
        }
    }

    fn read_ram(&self, addr: u16) -> u8 {
        match &self.state {
            MbcState::None => self.ram.get(addr as usize - 0xA000).copied().unwrap_or(0xFF),
            MbcState::Mbc1 { ram_enabled, .. } => {
                if !ram_enabled {
                    return 0xFF;
                }
                self.ram.get(self.ram_index(addr)).copied().unwrap_or(0xFF)
            }
            MbcState::Mbc2 { ram_enabled, .. } => {
                if !ram_enabled {
                    return 0xFF;
                }
                let idx = (addr as usize - 0xA000) & 0x1FF;
                0xF0 | (self.ram.get(idx).copied().unwrap_or(0x0F) & 0x0F)
            }
            MbcState::Mbc3 {
                ram_enabled,
                ram_bank,
                rtc,
                ..
            } => {
                if !ram_enabled {
                    return 0xFF;
                }
                match *ram_bank {
                    0x00..=0x03 => self.ram.get(self.ram_index(addr)).copied().unwrap_or(0xFF),
                    0x08..=0x0C => rtc
                        .as_ref()
                        .map(|r| r.read_latched(*ram_bank))
                        .unwrap_or(0xFF),
                    _ => 0xFF,
                }
            }
            MbcState::Mbc5 { ram_enabled, .. } => {
                if !ram_enabled {
                    return 0xFF;
                }
                self.ram.get(self.ram_index(addr)).copied().unwrap_or(0xFF)
            }
            MbcState::Mbc7 { ram_enabled, .. } => {
                if !ram_enabled {
                    return 0xFF;
                }
                // Accelerometer register window; the sensor rests at the
                // neutral 0x8000 reading. Plain RAM sits above it.
                match addr & 0xF0F0 {
                    0xA020 | 0xA040 => 0x00, // X/Y low
                    0xA030 | 0xA050 => 0x80, // X/Y high
                    0xA060 => 0x00,
                    _ => self
                        .ram
                        .get((addr as usize - 0xA000) & 0x7FF)
                        .copied()
                        .unwrap_or(0xFF),
                }
            }
            MbcState::HuC3 { ram_enabled, .. } | MbcState::Mmm01 { ram_enabled, .. } => {
                if !ram_enabled {
                    return 0xFF;
                }
                self.ram.get(self.ram_index(addr)).copied().unwrap_or(0xFF)
            }
            MbcState::Tama5 => 0xFF,
            MbcState::Camera { .. } => self.ram.get(self.ram_index(addr)).copied().unwrap_or(0xFF),
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF => self.write_control(addr, val),
            0xA000..=0xBFFF => self.write_ram(addr, val),
            _ => {}
        }
    }

    fn write_control(&mut self, addr: u16, val: u8) {
        match &mut self.state {
            MbcState::None | MbcState::Tama5 => {}
            MbcState::Mbc1 {
                rom_bank_offset,
                ram_bank,
                mode,
                ram_enabled,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    *rom_bank_offset = (*rom_bank_offset & 0x60) | (val & 0x1F);
                }
                0x4000..=0x5FFF => {
                    *ram_bank = val & 0x03;
                    if *mode == 0 {
                        *rom_bank_offset = (*rom_bank_offset & 0x1F) | ((val & 0x03) << 5);
                    }
                }
                _ => *mode = val & 0x01,
            },
            MbcState::Mbc2 {
                rom_bank,
                ram_enabled,
            } => match addr {
                0x0000..=0x0FFF => *ram_enabled = val & 0x0F == 0x0A,
                0x2100..=0x21FF => {
                    *rom_bank = val & 0x0F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
                _ => {}
            },
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enabled,
                rtc,
                latch_armed,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    *rom_bank = val & 0x7F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
                0x4000..=0x5FFF => *ram_bank = val,
                _ => {
                    // Latch fires on a 0 -> 1 transition.
                    if val == 0 {
                        *latch_armed = true;
                    } else {
                        if val == 1 && *latch_armed {
                            if let Some(rtc) = rtc {
                                rtc.latch();
                            }
                        }
                        *latch_armed = false;
                    }
                }
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enabled,
                rumble_wired,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = val & 0x0F == 0x0A,
                0x2000..=0x2FFF => *rom_bank = (*rom_bank & 0x100) | val as u16,
                0x3000..=0x3FFF => *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8),
                0x4000..=0x5FFF => {
                    if *rumble_wired {
                        *ram_bank = val & 0x07;
                        self.rumble_on = val & 0x08 != 0;
                    } else {
                        *ram_bank = val & 0x0F;
                    }
                }
                _ => {}
            },
            MbcState::Mbc7 {
                rom_bank,
                ram_enabled,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    *rom_bank = val & 0x7F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
                _ => {}
            },
            MbcState::HuC3 {
                rom_bank,
                ram_bank,
                ram_enabled,
            }
            | MbcState::Mmm01 {
                rom_bank,
                ram_bank,
                ram_enabled,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    *rom_bank = val & 0x7F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
                0x4000..=0x5FFF => *ram_bank = val & 0x0F,
                _ => {}
            },
            MbcState::Camera { rom_bank, ram_bank } => match addr {
                0x2000..=0x3FFF => {
                    *rom_bank = val & 0x3F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
                0x4000..=0x5FFF => *ram_bank = val & 0x0F,
                _ => {}
            },
        }
    }

    fn write_ram(&mut self, addr: u16, val: u8) {
        enum Target {
            Ram { idx: usize, byte: u8 },
            Rtc(u8),
            Dropped,
        }

        let target = match &self.state {
            MbcState::None | MbcState::Camera { .. } => Target::Ram {
                idx: self.ram_index(addr),
                byte: val,
            },
            MbcState::Mbc1 { ram_enabled, .. }
            | MbcState::Mbc5 { ram_enabled, .. }
            | MbcState::HuC3 { ram_enabled, .. }
            | MbcState::Mmm01 { ram_enabled, .. } => {
                if *ram_enabled {
                    Target::Ram {
                        idx: self.ram_index(addr),
                        byte: val,
                    }
                } else {
                    Target::Dropped
                }
            }
            MbcState::Mbc2 { ram_enabled, .. } => {
                if *ram_enabled {
                    Target::Ram {
                        idx: (addr as usize - 0xA000) & 0x1FF,
                        byte: val & 0x0F,
                    }
                } else {
                    Target::Dropped
                }
            }
            MbcState::Mbc3 {
                ram_enabled,
                ram_bank,
                ..
            } => {
                if !*ram_enabled {
                    Target::Dropped
                } else {
                    match *ram_bank {
                        0x00..=0x03 => Target::Ram {
                            idx: self.ram_index(addr),
                            byte: val,
                        },
                        0x08..=0x0C => Target::Rtc(*ram_bank),
                        _ => Target::Dropped,
                    }
                }
            }
            MbcState::Mbc7 { ram_enabled, .. } => {
                if *ram_enabled {
                    Target::Ram {
                        idx: (addr as usize - 0xA000) & 0x7FF,
                        byte: val,
                    }
                } else {
                    Target::Dropped
                }
            }
            MbcState::Tama5 => Target::Dropped,
        };

        match target {
            Target::Ram { idx, byte } => {
                if let Some(b) = self.ram.get_mut(idx) {
                    *b = byte;
                    self.ram_dirty = true;
                }
            }
            Target::Rtc(reg) => {
                if let Some(rtc) = self.rtc_mut() {
                    rtc.write_register(reg, val);
                    self.ram_dirty = true;
                }
            }
            Target::Dropped => {}
        }
    }

    fn ram_index(&self, addr: u16) -> usize {
        let base = addr as usize - 0xA000;
        let bank = match &self.state {
            MbcState::Mbc1 { ram_bank, mode, .. } => {
                if *mode == 0 {
                    0
                } else {
                    (*ram_bank & 0x03) as usize
                }
            }
            MbcState::Mbc3 { ram_bank, .. } => (*ram_bank & 0x03) as usize,
            MbcState::Mbc5 { ram_bank, .. }
            | MbcState::HuC3 { ram_bank, .. }
            | MbcState::Mmm01 { ram_bank, .. }
            | MbcState::Camera { ram_bank, .. } => (*ram_bank & 0x0F) as usize,
            _ => 0,
        };
        let bank = if self.ram_banks > 0 {
            bank % self.ram_banks
        } else {
            0
        };
        bank * 0x2000 + base
    }
}

fn initial_state(mbc: MbcType, features: &CartFeatures) -> MbcState {
    match mbc {
        MbcType::None => MbcState::None,
        MbcType::Mbc1 | MbcType::HuC1 => MbcState::Mbc1 {
            rom_bank_offset: 1,
            ram_bank: 0,
            mode: 0,
            ram_enabled: false,
        },
        MbcType::Mbc2 => MbcState::Mbc2 {
            rom_bank: 1,
            ram_enabled: false,
        },
        MbcType::Mbc3 => MbcState::Mbc3 {
            rom_bank: 1,
            ram_bank: 0,
            ram_enabled: false,
            rtc: features.rtc.then(Rtc::new),
            latch_armed: false,
        },
        MbcType::Mbc5 => MbcState::Mbc5 {
            rom_bank: 1,
            ram_bank: 0,
            ram_enabled: false,
            rumble_wired: features.rumble,
        },
        MbcType::Mbc7 => MbcState::Mbc7 {
            rom_bank: 1,
            ram_enabled: false,
        },
        MbcType::HuC3 => MbcState::HuC3 {
            rom_bank: 1,
            ram_bank: 0,
            ram_enabled: false,
        },
        MbcType::Mmm01 => MbcState::Mmm01 {
            rom_bank: 1,
            ram_bank: 0,
            ram_enabled: false,
        },
        MbcType::Tama5 => MbcState::Tama5,
        MbcType::Camera => MbcState::Camera {
            rom_bank: 1,
            ram_bank: 0,
        },
    }
}

fn decode_cart_type(cart_type: u8) -> Result<(MbcType, CartFeatures), CartridgeError> {
    let mut f = CartFeatures::default();
    let mbc = match cart_type {
        0x00 => MbcType::None,
        0x01 => MbcType::Mbc1,
        0x02 => {
            f.sram = true;
            MbcType::Mbc1
        }
        0x03 => {
            f.sram = true;
            f.battery = true;
            MbcType::Mbc1
        }
        0x05 => MbcType::Mbc2,
        0x06 => {
            f.battery = true;
            MbcType::Mbc2
        }
        0x08 => {
            f.sram = true;
            MbcType::None
        }
        0x09 => {
            f.sram = true;
            f.battery = true;
            MbcType::None
        }
        0x0B => MbcType::Mmm01,
        0x0C => {
            f.sram = true;
            MbcType::Mmm01
        }
        0x0D => {
            f.sram = true;
            f.battery = true;
            MbcType::Mmm01
        }
        0x0F => {
            f.battery = true;
            f.rtc = true;
            MbcType::Mbc3
        }
        0x10 => {
            f.sram = true;
            f.battery = true;
            f.rtc = true;
            MbcType::Mbc3
        }
        0x11 => MbcType::Mbc3,
        0x12 => {
            f.sram = true;
            MbcType::Mbc3
        }
        0x13 => {
            f.sram = true;
            f.battery = true;
            MbcType::Mbc3
        }
        0x19 => MbcType::Mbc5,
        0x1A => {
            f.sram = true;
            MbcType::Mbc5
        }
        0x1B => {
            f.sram = true;
            f.battery = true;
            MbcType::Mbc5
        }
        0x1C => {
            f.rumble = true;
            MbcType::Mbc5
        }
        0x1D => {
            f.sram = true;
            f.rumble = true;
            MbcType::Mbc5
        }
        0x1E => {
            f.sram = true;
            f.battery = true;
            f.rumble = true;
            MbcType::Mbc5
        }
        0x22 => {
            f.sram = true;
            f.battery = true;
            f.rumble = true;
            MbcType::Mbc7
        }
        0xFC => {
            f.sram = true;
            f.battery = true;
            f.camera = true;
            MbcType::Camera
        }
        0xFD => MbcType::Tama5,
        0xFE => {
            f.sram = true;
            MbcType::HuC3
        }
        0xFF => {
            f.sram = true;
            f.battery = true;
            MbcType::HuC1
        }
        other => return Err(CartridgeError::UnsupportedMbc(other)),
    };
    Ok((mbc, f))
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn title(&self) -> String {
        let slice = &self.data[0x134..0x13F];
        let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
        String::from_utf8_lossy(&slice[..end]).trim().to_string()
    }

    fn game_code(&self) -> String {
        let slice = &self.data[0x13F..0x143];
        let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
        String::from_utf8_lossy(&slice[..end]).trim().to_string()
    }

    fn cgb_flag(&self) -> u8 {
        self.data[0x143]
    }

    fn licensee(&self) -> [u8; 2] {
        [self.data[0x144], self.data[0x145]]
    }

    fn cart_type(&self) -> u8 {
        self.data[0x147]
    }

    fn rom_banks(&self) -> usize {
        match self.data[0x148] {
            n @ 0x00..=0x08 => 2 << n,
            0x52 => 72,
            0x53 => 80,
            0x54 => 96,
            _ => 2,
        }
    }

    fn ram_banks(&self) -> usize {
        match self.data[0x149] {
            0x00 => 0,
            0x01 => 1,
            0x02 => 2,
            0x03 => 4,
            0x04 => 16,
            _ => 0,
        }
    }
}
