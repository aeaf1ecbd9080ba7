use serde::{Deserialize, Serialize};

/// Emulated machine flavor, latched when a cartridge is inserted.
///
/// `CgbAsDmg` is a CGB booted with a DMG-only title: the CPU reports CGB
/// boot registers but the PPU runs with the DMG compatibility palettes and
/// none of the CGB-only registers respond.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineMode {
    #[default]
    Dmg,
    Cgb,
    CgbAsDmg,
}

impl MachineMode {
    /// CGB register file and double-speed support are available.
    #[inline]
    pub const fn is_cgb_hardware(self) -> bool {
        matches!(self, MachineMode::Cgb | MachineMode::CgbAsDmg)
    }

    /// CGB rendering features (palette RAM, VRAM banks, attributes) are in
    /// effect. False for a DMG title running on CGB hardware.
    #[inline]
    pub const fn is_cgb_game(self) -> bool {
        matches!(self, MachineMode::Cgb)
    }
}

/// Hardware the host wants to emulate, before the cartridge header has a
/// say. `Auto` picks CGB for color-capable titles and DMG otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HardwarePreference {
    #[default]
    Auto,
    ForceDmg,
    ForceCgb,
}

impl HardwarePreference {
    /// Resolve the machine mode for a cartridge whose 0x143 byte marked it
    /// color-capable (`cgb_flagged`) or not.
    pub fn resolve(self, cgb_flagged: bool) -> MachineMode {
        match (self, cgb_flagged) {
            (HardwarePreference::ForceDmg, _) => MachineMode::Dmg,
            (HardwarePreference::ForceCgb, true) => MachineMode::Cgb,
            (HardwarePreference::ForceCgb, false) => MachineMode::CgbAsDmg,
            (HardwarePreference::Auto, true) => MachineMode::Cgb,
            (HardwarePreference::Auto, false) => MachineMode::Dmg,
        }
    }
}
