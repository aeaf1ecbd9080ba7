use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::{
    apu::VolumeCell,
    audio_queue::{AudioConsumer, AudioProducer, audio_queue},
    cartridge::{Cartridge, CartridgeError},
    cpu::Cpu,
    hardware::{HardwarePreference, MachineMode},
    input::Key,
    mmu::Mmu,
    state::{RtcSnapshot, Snapshot, StateError},
};

/// Machine clock at normal speed.
pub const BASE_CLOCK_HZ: u32 = 4_194_304;
/// Host cadence `run()` is sized for.
const ITERATIONS_PER_SECOND: u32 = 60;

/// Immutable construction-time settings. Audio volume is the one mutable
/// knob and lives in a shared atomic cell instead.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the audio ring buffer, in stereo frames.
    pub audio_buffer_frames: usize,
    /// Hardware the host wants; `Auto` follows the cartridge header.
    pub hardware: HardwarePreference,
    /// Optional 0x100-byte DMG boot ROM. Absent means post-boot state is
    /// injected directly.
    pub dmg_boot_rom: Option<Vec<u8>>,
    /// Optional 0x900-byte CGB boot ROM.
    pub cgb_boot_rom: Option<Vec<u8>>,
    /// Initial audio volume, 0.0..=1.0.
    pub volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio_buffer_frames: 8192,
            hardware: HardwarePreference::Auto,
            dmg_boot_rom: None,
            cgb_boot_rom: None,
            volume: 1.0,
        }
    }
}

struct Core {
    cpu: Cpu,
    mmu: Mmu,
    mode: MachineMode,
}

/// The emulated machine plus its iteration scheduler.
///
/// Hosts call [`GameBoy::run`] at roughly 60 Hz between which they may
/// deliver key events, change speed, or snapshot state; the core is
/// single-threaded and never reenters itself. A separate host audio thread
/// drains the [`AudioConsumer`].
pub struct GameBoy {
    config: Config,
    volume: VolumeCell,
    audio_producer: AudioProducer,
    audio_consumer: AudioConsumer,
    core: Option<Core>,
    started: bool,
    /// Emulation speed multiplier.
    speed: f32,
    clocks_per_second: u32,
    /// Progress inside the current iteration, in CPU T-cycles.
    cpu_ticks: u32,
}

impl GameBoy {
    pub fn new(config: Config) -> Self {
        let (producer, consumer) = audio_queue(config.audio_buffer_frames);
        let volume = VolumeCell::new(config.volume);
        Self {
            config,
            volume,
            audio_producer: producer,
            audio_consumer: consumer,
            core: None,
            started: false,
            speed: 1.0,
            clocks_per_second: BASE_CLOCK_HZ,
            cpu_ticks: 0,
        }
    }

    /// Parse a ROM image and build the machine for it. The machine mode is
    /// latched here from the header and the configured hardware preference.
    /// On error the core is left uninitialized.
    pub fn insert_cartridge(&mut self, rom: Vec<u8>) -> Result<(), CartridgeError> {
        let cart = Cartridge::load(rom)?;
        let mode = self.config.hardware.resolve(cart.cgb_flagged());

        let cpu = Cpu::new(mode.is_cgb_hardware());
        let mut mmu = Mmu::new(mode, self.volume.clone());
        mmu.apu.connect_sink(self.audio_producer.clone());
        mmu.load_cart(cart);

        self.core = Some(Core { cpu, mmu, mode });
        self.started = false;
        self.cpu_ticks = 0;
        Ok(())
    }

    /// Power on: map the boot ROM when one is configured, otherwise inject
    /// the post-boot register state.
    pub fn start(&mut self) {
        let Some(core) = self.core.as_mut() else {
            warn!(target: "ember::gameboy", "start() without a cartridge");
            return;
        };

        let boot_rom = if core.mode.is_cgb_hardware() {
            self.config.cgb_boot_rom.clone()
        } else {
            self.config.dmg_boot_rom.clone()
        };

        match boot_rom {
            Some(rom) => {
                core.cpu = Cpu::new_power_on();
                core.mmu.load_boot_rom(rom);
            }
            None => {
                core.mmu.ppu.apply_post_boot_state();
                core.mmu.timer.load_state(&crate::state::TimerState {
                    div: 0xAB00,
                    tima: 0,
                    tma: 0,
                    tac: 0,
                    tima_ticks: 0,
                });
            }
        }

        let clocks = self.clocks_per_second;
        core.mmu.apu.set_clock_rate(clocks);
        self.started = true;
    }

    #[inline]
    fn base_cycles_per_iteration(&self) -> u32 {
        self.clocks_per_second / ITERATIONS_PER_SECOND
    }

    /// Advance by one iteration budget. The budget covers ~1/60 s of
    /// emulated time, extended by up to 2x when the audio queue reports an
    /// underrun. Never panics; an unstarted core is a no-op.
    pub fn run(&mut self) {
        if !self.started || self.core.is_none() {
            return;
        }

        let base = self.base_cycles_per_iteration();
        let factor = {
            let core = self.core.as_ref().unwrap();
            core.mmu.apu.resampler_factor()
        };

        // Feed-forward from the audio queue: refill whatever the sink has
        // drained, capped at twice the base budget and kept in multiples
        // of 4.
        let underrun = self.audio_producer.remaining() as u32;
        let extra = (underrun.saturating_mul(factor)).min(base * 2) & !3;

        let core = self.core.as_mut().unwrap();
        let shift = core.cpu.double_speed_shift as u32;
        let cycles_total = (base + extra) << shift;

        while self.cpu_ticks < cycles_total {
            let remaining = cycles_total - self.cpu_ticks;
            self.cpu_ticks += core.cpu.step(&mut core.mmu, remaining);
        }
        self.cpu_ticks -= cycles_total;

        // Iteration end: settle the audio pipeline so the sink sees every
        // sample this budget produced.
        core.mmu.apu.flush();
        debug!(
            target: "ember::gameboy",
            "iteration done: {} cycles (+{} underrun), frame {}",
            cycles_total,
            extra,
            core.mmu.ppu.frames()
        );
    }

    /// Execute a single CPU instruction (or interrupt dispatch / halt
    /// period). Test and debugger hook; `run()` is the production path.
    pub fn step_instruction(&mut self) -> u32 {
        let budget = self.base_cycles_per_iteration();
        match self.core.as_mut() {
            Some(core) => core.cpu.step(&mut core.mmu, budget),
            None => 0,
        }
    }

    /// Rescale the emulated clock. Audio resampling follows so the output
    /// rate stays at the host sample rate.
    pub fn set_speed(&mut self, multiplier: f32) {
        let multiplier = multiplier.clamp(0.1, 8.0);
        self.speed = multiplier;
        self.clocks_per_second = (BASE_CLOCK_HZ as f64 * multiplier as f64) as u32;
        if let Some(core) = self.core.as_mut() {
            core.mmu.apu.set_clock_rate(self.clocks_per_second);
        }
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn key_down(&mut self, key: Key) {
        if let Some(core) = self.core.as_mut() {
            let edge = core.mmu.input.key_down(key);
            // Any key press wakes a stopped CPU.
            core.cpu.stopped = false;
            if edge && !core.mode.is_cgb_game() {
                core.mmu.if_reg |= 0x10;
            }
        }
    }

    pub fn key_up(&mut self, key: Key) {
        if let Some(core) = self.core.as_mut() {
            core.mmu.input.key_up(key);
        }
    }

    /// Shared volume handle; safe to hand to the audio thread.
    pub fn volume(&self) -> VolumeCell {
        self.volume.clone()
    }

    /// Consumer side of the audio ring buffer for the host sink.
    pub fn audio_consumer(&self) -> AudioConsumer {
        self.audio_consumer.clone()
    }

    /// Frames of audio the queue can still absorb.
    pub fn remaining_audio_buffer(&self) -> usize {
        self.audio_producer.remaining()
    }

    pub fn frame_ready(&self) -> bool {
        self.core
            .as_ref()
            .map(|c| c.mmu.ppu.frame_ready())
            .unwrap_or(false)
    }

    /// Presented 160x144 frame, top byte cleared.
    pub fn framebuffer(&self) -> Option<&[u32]> {
        self.core.as_ref().map(|c| c.mmu.ppu.output_frame())
    }

    pub fn clear_frame_flag(&mut self) {
        if let Some(core) = self.core.as_mut() {
            core.mmu.ppu.clear_frame_flag();
        }
    }

    pub fn machine_mode(&self) -> Option<MachineMode> {
        self.core.as_ref().map(|c| c.mode)
    }

    /// Direct machine access, for tests and debugger-style tooling.
    pub fn mmu(&self) -> Option<&Mmu> {
        self.core.as_ref().map(|c| &c.mmu)
    }

    pub fn mmu_mut(&mut self) -> Option<&mut Mmu> {
        self.core.as_mut().map(|c| &mut c.mmu)
    }

    pub fn cpu(&self) -> Option<&Cpu> {
        self.core.as_ref().map(|c| &c.cpu)
    }

    pub fn cpu_mut(&mut self) -> Option<&mut Cpu> {
        self.core.as_mut().map(|c| &mut c.cpu)
    }

    pub fn title(&self) -> Option<&str> {
        self.core
            .as_ref()
            .and_then(|c| c.mmu.cart.as_ref())
            .map(|cart| cart.title.as_str())
    }

    /// Battery RAM has been written since the flag was last cleared; hosts
    /// debounce autosave on this.
    pub fn sram_dirty(&self) -> bool {
        self.core
            .as_ref()
            .and_then(|c| c.mmu.cart.as_ref())
            .map(|cart| cart.ram_dirty())
            .unwrap_or(false)
    }

    pub fn clear_sram_dirty(&mut self) {
        if let Some(cart) = self.core.as_mut().and_then(|c| c.mmu.cart.as_mut()) {
            cart.clear_ram_dirty();
        }
    }

    pub fn rumble_on(&self) -> bool {
        self.core
            .as_ref()
            .and_then(|c| c.mmu.cart.as_ref())
            .map(|cart| cart.rumble_on())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Battery-backed cartridge RAM, when the cartridge has a battery.
    pub fn save_sram(&self) -> Option<Vec<u8>> {
        let cart = self.core.as_ref()?.mmu.cart.as_ref()?;
        cart.has_battery().then(|| cart.ram.clone())
    }

    /// Restore battery RAM. Short blobs fill a prefix; oversized blobs are
    /// truncated, matching a host that stored a snapshot for a different
    /// RAM-size header revision.
    pub fn load_sram(&mut self, data: &[u8]) {
        if let Some(cart) = self.core.as_mut().and_then(|c| c.mmu.cart.as_mut()) {
            let n = data.len().min(cart.ram.len());
            cart.ram[..n].copy_from_slice(&data[..n]);
            cart.clear_ram_dirty();
        }
    }

    pub fn save_rtc(&self) -> Option<RtcSnapshot> {
        let cart = self.core.as_ref()?.mmu.cart.as_ref()?;
        cart.rtc().map(|rtc| rtc.snapshot(unix_now()))
    }

    pub fn load_rtc(&mut self, snapshot: &RtcSnapshot) {
        if let Some(rtc) = self
            .core
            .as_mut()
            .and_then(|c| c.mmu.cart.as_mut())
            .and_then(|cart| cart.rtc_mut())
        {
            rtc.restore(snapshot, unix_now());
        }
    }

    /// Full machine snapshot. The audio pipeline is flushed first so the
    /// snapshot sits on a sample boundary and replays deterministically.
    pub fn save_state(&mut self) -> Result<Snapshot, StateError> {
        let core = self.core.as_mut().ok_or(StateError::NoCartridge)?;
        core.mmu.apu.flush();
        let cart = core.mmu.cart.as_ref().ok_or(StateError::NoCartridge)?;

        let mut wram = Vec::with_capacity(8 * 0x1000);
        for bank in &core.mmu.wram {
            wram.extend_from_slice(bank);
        }
        let (hdma_src, hdma_dst, hdma_blocks, hdma_hblank_active, hdma_cancelled) =
            core.mmu.hdma_registers();

        Ok(Snapshot {
            title: cart.title.clone(),
            mode: core.mode,
            iteration_ticks: self.cpu_ticks,
            cpu: core.cpu.save_state(),
            timer: core.mmu.timer.save_state(),
            wram,
            wram_bank: core.mmu.wram_bank as u8,
            hram: core.mmu.hram.to_vec(),
            if_reg: core.mmu.if_reg,
            ie_reg: core.mmu.ie_reg,
            key1: core.mmu.key1,
            boot_mapped: core.mmu.boot_mapped,
            serial_sb: core.mmu.serial.sb(),
            serial_sc: core.mmu.serial.sc(),
            joypad_keys: core.mmu.input.raw_keys(),
            joypad_select: core.mmu.input.select_bits(),
            ppu: core.mmu.ppu.save_state(),
            apu: core.mmu.apu.save_state(),
            cart_ram: cart.ram.clone(),
            mbc: cart.mbc_state().clone(),
            hdma_src,
            hdma_dst,
            hdma_blocks,
            hdma_hblank_active,
            hdma_cancelled,
        })
    }

    /// Restore a snapshot saved for the same cartridge. On error the
    /// machine keeps running with its prior state.
    pub fn load_state(&mut self, snapshot: &Snapshot) -> Result<(), StateError> {
        let core = self.core.as_mut().ok_or(StateError::NoCartridge)?;
        {
            let cart = core.mmu.cart.as_ref().ok_or(StateError::NoCartridge)?;
            if cart.title != snapshot.title {
                return Err(StateError::TitleMismatch);
            }
        }
        if snapshot.wram.len() != 8 * 0x1000 {
            return Err(StateError::BadShape("wram"));
        }
        if snapshot.hram.len() != 0x7F {
            return Err(StateError::BadShape("hram"));
        }

        // Validate the component states before mutating anything visible.
        core.mmu.ppu.load_state(&snapshot.ppu)?;
        core.mmu.apu.load_state(&snapshot.apu)?;

        core.cpu.load_state(&snapshot.cpu);
        core.mmu.timer.load_state(&snapshot.timer);
        for (i, bank) in core.mmu.wram.iter_mut().enumerate() {
            bank.copy_from_slice(&snapshot.wram[i * 0x1000..(i + 1) * 0x1000]);
        }
        core.mmu.wram_bank = (snapshot.wram_bank & 0x07).max(1) as usize;
        core.mmu.hram.copy_from_slice(&snapshot.hram);
        core.mmu.if_reg = snapshot.if_reg;
        core.mmu.ie_reg = snapshot.ie_reg;
        core.mmu.key1 = snapshot.key1;
        core.mmu.boot_mapped = snapshot.boot_mapped && core.mmu.boot_rom.is_some();
        core.mmu.serial.set_regs(snapshot.serial_sb, snapshot.serial_sc);
        core.mmu.input.set_raw_keys(snapshot.joypad_keys);
        core.mmu.input.set_select_bits(snapshot.joypad_select);
        core.mmu.restore_hdma_registers(
            snapshot.hdma_src,
            snapshot.hdma_dst,
            snapshot.hdma_blocks,
            snapshot.hdma_hblank_active,
            snapshot.hdma_cancelled,
        );

        if let Some(cart) = core.mmu.cart.as_mut() {
            let n = snapshot.cart_ram.len().min(cart.ram.len());
            cart.ram[..n].copy_from_slice(&snapshot.cart_ram[..n]);
            cart.restore_mbc_state(snapshot.mbc.clone());
        }

        self.cpu_ticks = snapshot.iteration_ticks;
        self.started = true;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
