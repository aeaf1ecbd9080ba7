//! Snapshot types for save states, battery RAM, and the RTC.
//!
//! Snapshots are plain serde data structures; hosts key them by cartridge
//! title and encode them however they like (the tests round-trip through
//! JSON). Loading validates shapes and rejects snapshots for a different
//! cartridge, leaving the running machine untouched on failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cartridge::MbcState;
use crate::hardware::MachineMode;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("no cartridge inserted")]
    NoCartridge,

    #[error("snapshot belongs to a different cartridge")]
    TitleMismatch,

    #[error("snapshot field has the wrong shape: {0}")]
    BadShape(&'static str),
}

/// MBC3 real-time-clock snapshot. `last_time` is unix seconds at save;
/// loading credits wall-clock time elapsed since then.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RtcSnapshot {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub days_low: u8,
    pub days_high: u8,
    pub latched_seconds: u8,
    pub latched_minutes: u8,
    pub latched_hours: u8,
    pub latched_days_low: u8,
    pub latched_days_high: u8,
    pub last_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuState {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub cycles: u64,
    pub ime: bool,
    pub ime_delay: u8,
    pub halted: bool,
    pub stopped: bool,
    pub double_speed: bool,
    pub skip_pc_increment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerState {
    pub div: u16,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
    pub tima_ticks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpuState {
    pub vram0: Vec<u8>,
    pub vram1: Vec<u8>,
    pub vram_bank: u8,
    pub oam: Vec<u8>,
    pub lcdc: u8,
    pub stat: u8,
    pub scy: u8,
    pub scx: u8,
    pub wy: u8,
    pub wx: u8,
    pub ly: u8,
    pub lyc: u8,
    pub bgp: u8,
    pub obp0: u8,
    pub obp1: u8,
    pub dma: u8,
    pub bcps: u8,
    pub ocps: u8,
    pub bg_pal_ram: Vec<u8>,
    pub ob_pal_ram: Vec<u8>,
    pub mode_stat: u8,
    pub lcd_ticks: u32,
    pub actual_scan_line: u8,
    pub mode3_end: u32,
    pub window_line: u8,
    pub frames_since_on: u64,
    pub lyc_match: bool,
    pub frame_ready: bool,
    // JIT bookkeeping and the in-progress frame. Restoring these keeps the
    // first post-load frame byte-identical.
    pub queued_scan_lines: u8,
    pub last_unrendered_line: u8,
    pub mid_scanline_x: u8,
    pub window_seen_this_line: bool,
    pub framebuffer: Vec<u32>,
    pub line_bg_index: Vec<u8>,
    pub line_bg_priority: Vec<bool>,
    pub line_sprite_x: Vec<u16>,
    pub line_sprites: Vec<u8>,
    pub line_sprite_count: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApuState {
    pub regs: Vec<u8>,
    pub wave_ram: Vec<u8>,
    pub enabled: bool,
    pub sequencer_position: u8,
    pub sequencer_clocks: u32,
    pub ch_enabled: [bool; 4],
    pub ch_lengths: [u16; 4],
    pub ch_volumes: [u8; 4],
    pub ch_counters: [u32; 4],
    pub ch1_duty_pos: u8,
    pub ch2_duty_pos: u8,
    pub ch3_position: u8,
    pub ch4_position: u32,
    pub sweep_shadow: u16,
    pub sweep_countdown: u8,
    pub sweep_negative: bool,
    pub sweep_fault: bool,
    pub resampler_index: u32,
    pub accum_l: u32,
    pub accum_r: u32,
}

/// A complete machine snapshot: every piece of mutable CPU, memory, PPU,
/// APU, and MBC state. Derived structures (tile cache, mixer caches,
/// decoded palettes) are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub title: String,
    pub mode: MachineMode,
    /// Scheduler progress inside the current iteration budget.
    pub iteration_ticks: u32,
    pub cpu: CpuState,
    pub timer: TimerState,
    pub wram: Vec<u8>,
    pub wram_bank: u8,
    pub hram: Vec<u8>,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub key1: u8,
    pub boot_mapped: bool,
    pub serial_sb: u8,
    pub serial_sc: u8,
    pub joypad_keys: u8,
    pub joypad_select: u8,
    pub ppu: PpuState,
    pub apu: ApuState,
    pub cart_ram: Vec<u8>,
    pub mbc: MbcState,
    pub hdma_src: u16,
    pub hdma_dst: u16,
    pub hdma_blocks: u8,
    pub hdma_hblank_active: bool,
    pub hdma_cancelled: bool,
}
