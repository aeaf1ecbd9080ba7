use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::audio_queue::AudioProducer;

/// 512 Hz frame sequencer tick, in machine clocks.
const FRAME_SEQUENCER_PERIOD: u32 = 0x2000;
const BASE_CLOCK_HZ: u32 = 4_194_304;
const SAMPLE_RATE_HZ: u32 = 44_100;

// Duty table for the pulse channels. Index (0..3) corresponds to the duty
// selector in NRx1.
const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 1], // 12.5%
    [1, 0, 0, 0, 0, 0, 0, 1], // 25%
    [1, 0, 0, 0, 0, 1, 1, 1], // 50%
    [0, 1, 1, 1, 1, 1, 1, 0], // 75%
];

/// Read-back OR masks for FF10-FF26. Write-only and unused bits read set.
const READ_MASKS: [u8; 0x17] = [
    0x80, 0x3F, 0x00, 0xFF, 0xBF, // NR10-NR14
    0xFF, 0x3F, 0x00, 0xFF, 0xBF, // NR20-NR24
    0x7F, 0xFF, 0x9F, 0xFF, 0xBF, // NR30-NR34
    0xFF, 0xFF, 0x00, 0x00, 0xBF, // NR40-NR44
    0x00, 0x00, 0x70, // NR50-NR52
];

const NOISE_DIVISORS: [u32; 8] = [8, 16, 32, 48, 64, 80, 96, 112];

/// Shared mutable volume cell (f32 bits). The host owns the other handle.
#[derive(Clone)]
pub struct VolumeCell(Arc<AtomicU32>);

impl VolumeCell {
    pub fn new(volume: f32) -> Self {
        Self(Arc::new(AtomicU32::new(volume.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, volume: f32) {
        self.0.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl Default for VolumeCell {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[derive(Default, Clone, Copy)]
struct Envelope {
    volume: u8,
    add: bool,
    /// Remaining sweeps until the next volume step.
    sweeps: u8,
    /// Reload value for `sweeps`.
    sweeps_last: u8,
}

impl Envelope {
    fn clock(&mut self) {
        if self.sweeps_last == 0 {
            return;
        }
        if self.sweeps > 1 {
            self.sweeps -= 1;
            return;
        }
        self.sweeps = self.sweeps_last;
        if self.add && self.volume < 15 {
            self.volume += 1;
        } else if !self.add && self.volume > 0 {
            self.volume -= 1;
        }
    }

    /// Mid-tone NRx2 rewrite perturbs the live volume ("zombie mode").
    fn zombie_update(&mut self, old_val: u8, new_val: u8) {
        let old_add = old_val & 0x08 != 0;
        let new_add = new_val & 0x08 != 0;
        let mut vol = self.volume;
        if old_val & 0x07 == 0 {
            let automatic = if old_add { vol < 15 } else { vol > 0 };
            if automatic {
                vol = vol.wrapping_add(1);
            } else if !old_add {
                vol = vol.wrapping_add(2);
            }
        }
        if old_add != new_add {
            vol = 16u8.wrapping_sub(vol);
        }
        self.volume = vol & 0x0F;
        self.add = new_add;
        self.sweeps_last = new_val & 0x07;
    }
}

#[derive(Default)]
struct SquareChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    duty: u8,
    duty_pos: u8,
    frequency: u16,
    /// Machine clocks until the next duty edge.
    counter: u32,
    envelope: Envelope,
}

impl SquareChannel {
    fn period(&self) -> u32 {
        ((0x800 - self.frequency as u32) << 2).max(1)
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || !self.dac_enabled {
            return 0;
        }
        DUTY_TABLE[self.duty as usize][self.duty_pos as usize] * self.envelope.volume
    }
}

#[derive(Default)]
struct Sweep {
    divider: u8,
    negate: bool,
    shift: u8,
    /// Remaining sweep clocks until the next iteration.
    countdown: u8,
    shadow: u16,
    enabled: bool,
    /// A subtraction calculation has happened since the last trigger.
    swept_negative: bool,
    /// Latched negate-then-positive fault; clears only on retrigger.
    fault: bool,
}

impl Sweep {
    fn calculate(&self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow.wrapping_add(delta)
        }
    }
}

#[derive(Default)]
struct WaveChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    /// NR32 output level shift (4 = mute).
    volume_shift: u8,
    frequency: u16,
    counter: u32,
    position: u8,
    /// Wave RAM index latched by the most recent sample fetch; drives the
    /// read-while-playing quirk.
    last_sample_lookup: u8,
    current_sample: u8,
}

impl WaveChannel {
    fn period(&self) -> u32 {
        ((0x800 - self.frequency as u32) << 1).max(1)
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || !self.dac_enabled || self.volume_shift >= 4 {
            return 0;
        }
        self.current_sample >> self.volume_shift
    }
}

#[derive(Default)]
struct NoiseChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    /// Machine clocks between LSFR steps, from NR43.
    period: u32,
    counter: u32,
    /// Position within the expanded LSFR table.
    position: u32,
    /// 0x7FFF for 15-bit mode, 0x7F for 7-bit.
    position_mask: u32,
    width7: bool,
    envelope: Envelope,
}

impl NoiseChannel {
    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }
}

pub struct Apu {
    cgb: bool,
    enabled: bool,
    /// Raw NRxx bytes for read-back (FF10-FF26).
    regs: [u8; 0x17],
    pub wave_ram: [u8; 0x10],

    ch1: SquareChannel,
    sweep: Sweep,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,

    sequencer_position: u8,
    sequencer_clocks: u32,

    // LSFR output tables, pre-expanded across the 16 envelope volumes:
    // table[volume * span + step] is the channel output at that step.
    lsfr15: Vec<u8>,
    lsfr7: Vec<u8>,

    // Cached per-channel stereo contributions and the packed mix, updated
    // whenever any input changes rather than per output sample.
    channel_cache: [(u32, u32); 4],
    mixer_cache_l: u32,
    mixer_cache_r: u32,

    // Resampler.
    resampler_factor: u32,
    resampler_index: u32,
    accum_l: u32,
    accum_r: u32,

    /// Machine clocks owed to the synthesizer; flushed on register access
    /// and at iteration end.
    pending_clocks: u32,

    sink: Option<AudioProducer>,
    volume: VolumeCell,
    /// Stereo frames emitted since power-on.
    samples_emitted: u64,
}

fn build_lsfr_table(bits: u32) -> Vec<u8> {
    let span = 1usize << bits;
    let mut table = vec![0u8; span * 16];
    let mut lsfr: u32 = (1 << bits) - 1;
    let tap = bits - 1;
    for step in 0..span {
        // Output is the inverted low bit of the register.
        let out = ((lsfr & 1) ^ 1) as u8;
        for volume in 0..16usize {
            table[volume * span + step] = out * volume as u8;
        }
        let feedback = (lsfr ^ (lsfr >> 1)) & 1;
        lsfr = (lsfr >> 1) | (feedback << tap);
    }
    table
}

impl Apu {
    pub fn new(cgb: bool, volume: VolumeCell) -> Self {
        let mut apu = Self {
            cgb,
            enabled: false,
            regs: [0; 0x17],
            wave_ram: [0; 0x10],
            ch1: SquareChannel::default(),
            sweep: Sweep::default(),
            ch2: SquareChannel::default(),
            ch3: WaveChannel::default(),
            ch4: NoiseChannel {
                position_mask: 0x7FFF,
                period: NOISE_DIVISORS[0],
                ..Default::default()
            },
            sequencer_position: 0,
            sequencer_clocks: FRAME_SEQUENCER_PERIOD,
            lsfr15: build_lsfr_table(15),
            lsfr7: build_lsfr_table(7),
            channel_cache: [(0, 0); 4],
            mixer_cache_l: 0,
            mixer_cache_r: 0,
            resampler_factor: BASE_CLOCK_HZ / SAMPLE_RATE_HZ,
            resampler_index: 0,
            accum_l: 0,
            accum_r: 0,
            pending_clocks: 0,
            sink: None,
            volume,
            samples_emitted: 0,
        };
        apu.write_reg(0xFF26, 0x80);
        apu
    }

    pub fn connect_sink(&mut self, sink: AudioProducer) {
        self.sink = Some(sink);
    }

    /// Recompute the resampler ratio after an emulation-speed change.
    pub fn set_clock_rate(&mut self, clocks_per_second: u32) {
        self.flush();
        self.resampler_factor = (clocks_per_second / SAMPLE_RATE_HZ).max(1);
        self.resampler_index = 0;
        self.accum_l = 0;
        self.accum_r = 0;
    }

    pub fn resampler_factor(&self) -> u32 {
        self.resampler_factor
    }

    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted
    }

    /// Queue machine clocks for the synthesizer. Cheap; the actual signal
    /// walk happens at the next flush point.
    #[inline]
    pub fn accumulate(&mut self, clocks: u32) {
        self.pending_clocks += clocks;
    }

    // ------------------------------------------------------------------
    // Register surface
    // ------------------------------------------------------------------

    pub fn read_reg(&mut self, addr: u16) -> u8 {
        self.flush();
        match addr {
            0xFF10..=0xFF25 => {
                let idx = (addr - 0xFF10) as usize;
                self.regs[idx] | READ_MASKS[idx]
            }
            0xFF26 => {
                let mut v = 0x70;
                if self.enabled {
                    v |= 0x80;
                }
                if self.ch1.enabled {
                    v |= 0x01;
                }
                if self.ch2.enabled {
                    v |= 0x02;
                }
                if self.ch3.enabled {
                    v |= 0x04;
                }
                if self.ch4.enabled {
                    v |= 0x08;
                }
                v
            }
            0xFF30..=0xFF3F => {
                if self.ch3.enabled && self.ch3.dac_enabled {
                    // While playing, reads see the byte the channel last
                    // fetched, not the addressed one.
                    self.wave_ram[(self.ch3.last_sample_lookup >> 1) as usize]
                } else {
                    self.wave_ram[(addr - 0xFF30) as usize]
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        self.flush();

        if let 0xFF30..=0xFF3F = addr {
            // Wave RAM ignores the master-enable lock.
            self.wave_ram[(addr - 0xFF30) as usize] = val;
            return;
        }

        if !self.enabled && addr != 0xFF26 {
            // Master-off locks every NRxx write; DMG leaves the length
            // counters writable through NRx1.
            let length_reg = matches!(addr, 0xFF11 | 0xFF16 | 0xFF1B | 0xFF20);
            if !(length_reg && !self.cgb) {
                return;
            }
            match addr {
                0xFF11 => self.ch1.length = 64 - (val & 0x3F) as u16,
                0xFF16 => self.ch2.length = 64 - (val & 0x3F) as u16,
                0xFF1B => self.ch3.length = 256 - val as u16,
                0xFF20 => self.ch4.length = 64 - (val & 0x3F) as u16,
                _ => {}
            }
            return;
        }

        if let 0xFF10..=0xFF25 = addr {
            self.regs[(addr - 0xFF10) as usize] = val;
        }

        match addr {
            0xFF10 => {
                let old_negate = self.sweep.negate;
                self.sweep.divider = (val >> 4) & 0x07;
                self.sweep.negate = val & 0x08 != 0;
                self.sweep.shift = val & 0x07;
                // Leaving negate mode after a subtraction sweep kills the
                // channel.
                if old_negate && !self.sweep.negate && self.sweep.swept_negative {
                    self.sweep.fault = true;
                    self.ch1.enabled = false;
                }
            }
            0xFF11 => {
                self.ch1.duty = val >> 6;
                self.ch1.length = 64 - (val & 0x3F) as u16;
            }
            0xFF12 => {
                let old = self.regs[0x02];
                self.ch1.dac_enabled = val & 0xF8 != 0;
                if !self.ch1.dac_enabled {
                    self.ch1.enabled = false;
                }
                if self.ch1.enabled {
                    self.ch1.envelope.zombie_update(old, val);
                } else {
                    self.ch1.envelope.add = val & 0x08 != 0;
                    self.ch1.envelope.sweeps_last = val & 0x07;
                }
                self.regs[0x02] = val;
            }
            0xFF13 => {
                self.ch1.frequency = (self.ch1.frequency & 0x700) | val as u16;
            }
            0xFF14 => {
                self.ch1.frequency = (self.ch1.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                self.write_length_enable(0, val & 0x40 != 0);
                if val & 0x80 != 0 {
                    self.trigger_ch1();
                }
            }
            0xFF16 => {
                self.ch2.duty = val >> 6;
                self.ch2.length = 64 - (val & 0x3F) as u16;
            }
            0xFF17 => {
                let old = self.regs[0x07];
                self.ch2.dac_enabled = val & 0xF8 != 0;
                if !self.ch2.dac_enabled {
                    self.ch2.enabled = false;
                }
                if self.ch2.enabled {
                    self.ch2.envelope.zombie_update(old, val);
                } else {
                    self.ch2.envelope.add = val & 0x08 != 0;
                    self.ch2.envelope.sweeps_last = val & 0x07;
                }
                self.regs[0x07] = val;
            }
            0xFF18 => {
                self.ch2.frequency = (self.ch2.frequency & 0x700) | val as u16;
            }
            0xFF19 => {
                self.ch2.frequency = (self.ch2.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                self.write_length_enable(1, val & 0x40 != 0);
                if val & 0x80 != 0 {
                    self.trigger_ch2();
                }
            }
            0xFF1A => {
                self.ch3.dac_enabled = val & 0x80 != 0;
                if !self.ch3.dac_enabled {
                    self.ch3.enabled = false;
                }
            }
            0xFF1B => self.ch3.length = 256 - val as u16,
            0xFF1C => {
                self.ch3.volume_shift = match (val >> 5) & 0x03 {
                    1 => 0,
                    2 => 1,
                    3 => 2,
                    _ => 4,
                };
            }
            0xFF1D => {
                self.ch3.frequency = (self.ch3.frequency & 0x700) | val as u16;
            }
            0xFF1E => {
                self.ch3.frequency = (self.ch3.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                self.write_length_enable(2, val & 0x40 != 0);
                if val & 0x80 != 0 {
                    self.trigger_ch3();
                }
            }
            0xFF20 => self.ch4.length = 64 - (val & 0x3F) as u16,
            0xFF21 => {
                let old = self.regs[0x11];
                self.ch4.dac_enabled = val & 0xF8 != 0;
                if !self.ch4.dac_enabled {
                    self.ch4.enabled = false;
                }
                if self.ch4.enabled {
                    self.ch4.envelope.zombie_update(old, val);
                } else {
                    self.ch4.envelope.add = val & 0x08 != 0;
                    self.ch4.envelope.sweeps_last = val & 0x07;
                }
                self.regs[0x11] = val;
            }
            0xFF22 => {
                self.ch4.period = NOISE_DIVISORS[(val & 0x07) as usize] << (val >> 4);
                self.ch4.width7 = val & 0x08 != 0;
                self.ch4.position_mask = if self.ch4.width7 { 0x7F } else { 0x7FFF };
                self.ch4.position &= self.ch4.position_mask;
            }
            0xFF23 => {
                self.write_length_enable(3, val & 0x40 != 0);
                if val & 0x80 != 0 {
                    self.trigger_ch4();
                }
            }
            0xFF24 | 0xFF25 => {}
            0xFF26 => {
                let was_enabled = self.enabled;
                self.enabled = val & 0x80 != 0;
                if was_enabled && !self.enabled {
                    self.power_off();
                } else if !was_enabled && self.enabled {
                    self.sequencer_position = 0;
                    self.sequencer_clocks = FRAME_SEQUENCER_PERIOD;
                    self.ch1.duty_pos = 0;
                    self.ch2.duty_pos = 0;
                    self.ch3.position = 0;
                }
            }
            _ => {}
        }

        self.refresh_caches();
    }

    fn power_off(&mut self) {
        // NR52 master-off clears every register and silences the channels;
        // wave RAM survives, as do DMG length counters.
        self.regs = [0; 0x17];
        let lengths = (
            self.ch1.length,
            self.ch2.length,
            self.ch3.length,
            self.ch4.length,
        );
        self.ch1 = SquareChannel::default();
        self.ch2 = SquareChannel::default();
        self.ch3 = WaveChannel::default();
        let mask = self.ch4.position_mask;
        self.ch4 = NoiseChannel {
            period: NOISE_DIVISORS[0],
            position_mask: mask,
            ..Default::default()
        };
        if !self.cgb {
            self.ch1.length = lengths.0;
            self.ch2.length = lengths.1;
            self.ch3.length = lengths.2;
            self.ch4.length = lengths.3;
        }
    }

    /// NRx4 length-enable writes clock the length counter once when the
    /// enable rises during the first half of the sequencer period.
    fn write_length_enable(&mut self, ch: usize, enable: bool) {
        let first_half = self.sequencer_position & 1 == 1;
        let (length_enable, length, enabled): (&mut bool, &mut u16, &mut bool) = match ch {
            0 => (
                &mut self.ch1.length_enable,
                &mut self.ch1.length,
                &mut self.ch1.enabled,
            ),
            1 => (
                &mut self.ch2.length_enable,
                &mut self.ch2.length,
                &mut self.ch2.enabled,
            ),
            2 => (
                &mut self.ch3.length_enable,
                &mut self.ch3.length,
                &mut self.ch3.enabled,
            ),
            _ => (
                &mut self.ch4.length_enable,
                &mut self.ch4.length,
                &mut self.ch4.enabled,
            ),
        };
        let was_enabled = *length_enable;
        *length_enable = enable;
        if !was_enabled && enable && first_half && *length > 0 {
            *length -= 1;
            if *length == 0 {
                *enabled = false;
            }
        }
    }

    fn trigger_ch1(&mut self) {
        self.ch1.enabled = self.ch1.dac_enabled;
        if self.ch1.length == 0 {
            self.ch1.length = 64;
        }
        self.ch1.counter = self.ch1.period();
        self.ch1.envelope.volume = self.regs[0x02] >> 4;
        self.ch1.envelope.sweeps = self.ch1.envelope.sweeps_last;

        self.sweep.shadow = self.ch1.frequency;
        self.sweep.countdown = if self.sweep.divider == 0 {
            8
        } else {
            self.sweep.divider
        };
        self.sweep.enabled = self.sweep.divider != 0 || self.sweep.shift != 0;
        self.sweep.swept_negative = false;
        self.sweep.fault = false;
        if self.sweep.shift != 0 {
            // Immediate overflow check on trigger.
            if self.sweep.negate {
                self.sweep.swept_negative = true;
            }
            if self.sweep.calculate() > 0x7FF {
                self.ch1.enabled = false;
            }
        }
    }

    fn trigger_ch2(&mut self) {
        self.ch2.enabled = self.ch2.dac_enabled;
        if self.ch2.length == 0 {
            self.ch2.length = 64;
        }
        self.ch2.counter = self.ch2.period();
        self.ch2.envelope.volume = self.regs[0x07] >> 4;
        self.ch2.envelope.sweeps = self.ch2.envelope.sweeps_last;
    }

    fn trigger_ch3(&mut self) {
        self.ch3.enabled = self.ch3.dac_enabled;
        if self.ch3.length == 0 {
            self.ch3.length = 256;
        }
        self.ch3.counter = self.ch3.period();
        self.ch3.position = 0;
        self.ch3.last_sample_lookup = 0;
    }

    fn trigger_ch4(&mut self) {
        self.ch4.enabled = self.ch4.dac_enabled;
        if self.ch4.length == 0 {
            self.ch4.length = 64;
        }
        self.ch4.counter = self.ch4.period;
        self.ch4.position = 0;
        self.ch4.envelope.volume = self.regs[0x11] >> 4;
        self.ch4.envelope.sweeps = self.ch4.envelope.sweeps_last;
    }

    // ------------------------------------------------------------------
    // Mixer caches
    // ------------------------------------------------------------------

    fn channel_output(&self, ch: usize) -> u32 {
        match ch {
            0 => self.ch1.output() as u32,
            1 => self.ch2.output() as u32,
            2 => self.ch3.output() as u32,
            _ => {
                if !self.ch4.enabled || !self.ch4.dac_enabled {
                    0
                } else {
                    let span = (self.ch4.position_mask + 1) as usize;
                    let table = if self.ch4.width7 { &self.lsfr7 } else { &self.lsfr15 };
                    let volume = self.ch4.envelope.volume as usize;
                    table[volume * span + (self.ch4.position & self.ch4.position_mask) as usize]
                        as u32
                }
            }
        }
    }

    /// Recompute the cached per-channel contributions and the packed mix.
    /// Inputs: channel outputs, NR51 routing, NR50 master volumes.
    fn refresh_caches(&mut self) {
        let nr51 = self.regs[0x15];
        for ch in 0..4 {
            let out = self.channel_output(ch);
            let left = if nr51 & (0x10 << ch) != 0 { out } else { 0 };
            let right = if nr51 & (0x01 << ch) != 0 { out } else { 0 };
            self.channel_cache[ch] = (left, right);
        }
        let nr50 = self.regs[0x14];
        let vin_l = ((nr50 >> 4) & 0x07) as u32 + 1;
        let vin_r = (nr50 & 0x07) as u32 + 1;
        let sum_l: u32 = self.channel_cache.iter().map(|c| c.0).sum();
        let sum_r: u32 = self.channel_cache.iter().map(|c| c.1).sum();
        self.mixer_cache_l = sum_l * vin_l;
        self.mixer_cache_r = sum_r * vin_r;
    }

    /// Packed left|right mix, matching the render cascade's final stage.
    pub fn mixer_output_cache(&self) -> u32 {
        (self.mixer_cache_l << 16) | self.mixer_cache_r
    }

    // ------------------------------------------------------------------
    // Signal generation
    // ------------------------------------------------------------------

    /// Render all owed clocks. Called before any register access and at
    /// iteration end so register changes land on exact sample boundaries.
    pub fn flush(&mut self) {
        let mut clocks = std::mem::take(&mut self.pending_clocks);

        while clocks > 0 {
            // Walk to the nearest of: next channel event, next sequencer
            // tick, resampler boundary.
            let mut chunk = clocks
                .min(self.sequencer_clocks)
                .min(self.resampler_factor - self.resampler_index);
            if self.enabled {
                if self.ch1.enabled && self.ch1.dac_enabled {
                    chunk = chunk.min(self.ch1.counter);
                }
                if self.ch2.enabled && self.ch2.dac_enabled {
                    chunk = chunk.min(self.ch2.counter);
                }
                if self.ch3.enabled && self.ch3.dac_enabled {
                    chunk = chunk.min(self.ch3.counter);
                }
                if self.ch4.enabled && self.ch4.dac_enabled {
                    chunk = chunk.min(self.ch4.counter);
                }
            }
            let chunk = chunk.max(1);

            self.accum_l += self.mixer_cache_l * chunk;
            self.accum_r += self.mixer_cache_r * chunk;
            self.resampler_index += chunk;
            if self.resampler_index >= self.resampler_factor {
                self.emit_sample();
            }

            if self.enabled {
                self.advance_channels(chunk);
                self.sequencer_clocks -= chunk;
                if self.sequencer_clocks == 0 {
                    self.sequencer_clocks = FRAME_SEQUENCER_PERIOD;
                    self.clock_sequencer();
                }
            } else {
                self.sequencer_clocks = match self.sequencer_clocks.checked_sub(chunk) {
                    Some(0) | None => FRAME_SEQUENCER_PERIOD,
                    Some(rest) => rest,
                };
            }

            clocks -= chunk;
        }
    }

    fn advance_channels(&mut self, chunk: u32) {
        let mut dirty = false;

        if self.ch1.enabled && self.ch1.dac_enabled {
            if self.ch1.counter <= chunk {
                self.ch1.counter = self.ch1.period();
                self.ch1.duty_pos = (self.ch1.duty_pos + 1) & 7;
                dirty = true;
            } else {
                self.ch1.counter -= chunk;
            }
        }
        if self.ch2.enabled && self.ch2.dac_enabled {
            if self.ch2.counter <= chunk {
                self.ch2.counter = self.ch2.period();
                self.ch2.duty_pos = (self.ch2.duty_pos + 1) & 7;
                dirty = true;
            } else {
                self.ch2.counter -= chunk;
            }
        }
        if self.ch3.enabled && self.ch3.dac_enabled {
            if self.ch3.counter <= chunk {
                self.ch3.counter = self.ch3.period();
                self.ch3.position = (self.ch3.position + 1) & 0x1F;
                self.ch3.last_sample_lookup = self.ch3.position;
                let byte = self.wave_ram[(self.ch3.position >> 1) as usize];
                self.ch3.current_sample = if self.ch3.position & 1 == 0 {
                    byte >> 4
                } else {
                    byte & 0x0F
                };
                dirty = true;
            } else {
                self.ch3.counter -= chunk;
            }
        }
        if self.ch4.enabled && self.ch4.dac_enabled {
            if self.ch4.counter <= chunk {
                self.ch4.counter = self.ch4.period;
                self.ch4.position = (self.ch4.position + 1) & self.ch4.position_mask;
                dirty = true;
            } else {
                self.ch4.counter -= chunk;
            }
        }

        if dirty {
            self.refresh_caches();
        }
    }

    fn clock_sequencer(&mut self) {
        let step = self.sequencer_position;
        self.sequencer_position = (self.sequencer_position + 1) & 7;

        if step & 1 == 0 {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if step == 2 || step == 6 {
            self.clock_sweep();
        }
        if step == 7 {
            self.ch1.envelope.clock();
            self.ch2.envelope.clock();
            self.ch4.envelope.clock();
        }
        self.refresh_caches();
    }

    fn clock_sweep(&mut self) {
        if !self.sweep.enabled || self.sweep.fault {
            return;
        }
        if self.sweep.countdown > 1 {
            self.sweep.countdown -= 1;
            return;
        }
        self.sweep.countdown = if self.sweep.divider == 0 {
            8
        } else {
            self.sweep.divider
        };
        if self.sweep.divider == 0 {
            return;
        }

        let new_freq = self.sweep.calculate();
        if self.sweep.negate {
            self.sweep.swept_negative = true;
        }
        if new_freq > 0x7FF {
            self.ch1.enabled = false;
            self.sweep.enabled = false;
            return;
        }
        if self.sweep.shift != 0 {
            self.sweep.shadow = new_freq;
            self.ch1.frequency = new_freq;
            self.regs[0x03] = new_freq as u8;
            self.regs[0x04] = (self.regs[0x04] & 0xF8) | ((new_freq >> 8) as u8 & 0x07);
            // Second overflow check validates the following step.
            if self.sweep.calculate() > 0x7FF {
                self.ch1.enabled = false;
                self.sweep.enabled = false;
            }
        }
    }

    fn emit_sample(&mut self) {
        let divider = (self.resampler_factor * 0xF0) as f32;
        let left = (self.accum_l as f32 / divider) - 1.0;
        let right = (self.accum_r as f32 / divider) - 1.0;
        self.resampler_index = 0;
        self.accum_l = 0;
        self.accum_r = 0;
        self.samples_emitted += 1;

        let volume = self.volume.get();
        if let Some(sink) = &self.sink {
            sink.push_stereo(left * volume, right * volume);
        }
    }

    // ------------------------------------------------------------------
    // Snapshot plumbing
    // ------------------------------------------------------------------

    pub fn save_state(&self) -> crate::state::ApuState {
        crate::state::ApuState {
            regs: self.regs.to_vec(),
            wave_ram: self.wave_ram.to_vec(),
            enabled: self.enabled,
            sequencer_position: self.sequencer_position,
            sequencer_clocks: self.sequencer_clocks,
            ch_enabled: [
                self.ch1.enabled,
                self.ch2.enabled,
                self.ch3.enabled,
                self.ch4.enabled,
            ],
            ch_lengths: [
                self.ch1.length,
                self.ch2.length,
                self.ch3.length,
                self.ch4.length,
            ],
            ch_volumes: [
                self.ch1.envelope.volume,
                self.ch2.envelope.volume,
                0,
                self.ch4.envelope.volume,
            ],
            ch_counters: [
                self.ch1.counter,
                self.ch2.counter,
                self.ch3.counter,
                self.ch4.counter,
            ],
            ch1_duty_pos: self.ch1.duty_pos,
            ch2_duty_pos: self.ch2.duty_pos,
            ch3_position: self.ch3.position,
            ch4_position: self.ch4.position,
            sweep_shadow: self.sweep.shadow,
            sweep_countdown: self.sweep.countdown,
            sweep_negative: self.sweep.swept_negative,
            sweep_fault: self.sweep.fault,
            resampler_index: self.resampler_index,
            accum_l: self.accum_l,
            accum_r: self.accum_r,
        }
    }

    pub fn load_state(&mut self, s: &crate::state::ApuState) -> Result<(), crate::state::StateError> {
        use crate::state::StateError;
        if s.regs.len() != 0x17 {
            return Err(StateError::BadShape("apu regs"));
        }
        if s.wave_ram.len() != 0x10 {
            return Err(StateError::BadShape("wave ram"));
        }

        self.pending_clocks = 0;
        self.wave_ram.copy_from_slice(&s.wave_ram);

        // Replay the register file through the normal write path so every
        // derived field (duty, periods, envelopes, routing) is rebuilt.
        self.enabled = true;
        self.regs = [0; 0x17];
        let regs: [u8; 0x17] = s.regs[..].try_into().unwrap();
        for (i, &val) in regs.iter().enumerate() {
            let addr = 0xFF10 + i as u16;
            if matches!(addr, 0xFF14 | 0xFF19 | 0xFF1E | 0xFF23) {
                // Strip trigger bits; live state is restored below.
                self.write_reg(addr, val & 0x7F);
            } else if addr != 0xFF26 {
                self.write_reg(addr, val);
            }
        }
        self.regs = regs;
        self.enabled = s.enabled;

        self.sequencer_position = s.sequencer_position & 7;
        self.sequencer_clocks = s.sequencer_clocks.clamp(1, FRAME_SEQUENCER_PERIOD);
        self.ch1.enabled = s.ch_enabled[0];
        self.ch2.enabled = s.ch_enabled[1];
        self.ch3.enabled = s.ch_enabled[2];
        self.ch4.enabled = s.ch_enabled[3];
        self.ch1.length = s.ch_lengths[0];
        self.ch2.length = s.ch_lengths[1];
        self.ch3.length = s.ch_lengths[2];
        self.ch4.length = s.ch_lengths[3];
        self.ch1.envelope.volume = s.ch_volumes[0];
        self.ch2.envelope.volume = s.ch_volumes[1];
        self.ch4.envelope.volume = s.ch_volumes[3];
        self.ch1.counter = s.ch_counters[0].max(1);
        self.ch2.counter = s.ch_counters[1].max(1);
        self.ch3.counter = s.ch_counters[2].max(1);
        self.ch4.counter = s.ch_counters[3].max(1);
        self.ch1.duty_pos = s.ch1_duty_pos & 7;
        self.ch2.duty_pos = s.ch2_duty_pos & 7;
        self.ch3.position = s.ch3_position & 0x1F;
        self.ch4.position = s.ch4_position & self.ch4.position_mask;
        self.sweep.shadow = s.sweep_shadow;
        self.sweep.countdown = s.sweep_countdown;
        self.sweep.swept_negative = s.sweep_negative;
        self.sweep.fault = s.sweep_fault;
        self.resampler_index = s.resampler_index.min(self.resampler_factor - 1);
        self.accum_l = s.accum_l;
        self.accum_r = s.accum_r;
        self.refresh_caches();
        Ok(())
    }
}
