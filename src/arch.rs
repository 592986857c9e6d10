//! Guest architectures and the host-pushed register mappings.
//!
//! The controller is architecture-neutral except for two lookups: the program
//! counter and stack pointer. Everything else about the register file comes
//! in over the boundary as flat mapping tables held in [ArchConfig].

use fxhash::{FxHashMap, FxHashSet};

use crate::engine::{well_known, EngineRegId};
use crate::ir::RegOffset;

/// Guest architectures the accelerator can select PC/SP registers for.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum GuestArch {
    X86 = 0,
    Amd64,
    Arm,
    Arm64,
    Mips32,
    Mips64,
}

// Register-file offsets of the program counter as the lifter numbers them.
const X86_OFFSET_EIP: RegOffset = 68;
const AMD64_OFFSET_RIP: RegOffset = 184;
const ARM_OFFSET_R15T: RegOffset = 68;
const ARM64_OFFSET_PC: RegOffset = 272;
const MIPS32_OFFSET_PC: RegOffset = 136;
const MIPS64_OFFSET_PC: RegOffset = 272;

impl GuestArch {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(GuestArch::X86),
            1 => Some(GuestArch::Amd64),
            2 => Some(GuestArch::Arm),
            3 => Some(GuestArch::Arm64),
            4 => Some(GuestArch::Mips32),
            5 => Some(GuestArch::Mips64),
            _ => None,
        }
    }

    /// Register-file offset of the program counter.
    pub fn pc_reg_offset(self) -> RegOffset {
        match self {
            GuestArch::X86 => X86_OFFSET_EIP,
            GuestArch::Amd64 => AMD64_OFFSET_RIP,
            GuestArch::Arm => ARM_OFFSET_R15T,
            GuestArch::Arm64 => ARM64_OFFSET_PC,
            GuestArch::Mips32 => MIPS32_OFFSET_PC,
            GuestArch::Mips64 => MIPS64_OFFSET_PC,
        }
    }

    /// Engine register id of the program counter.
    pub fn pc_engine_reg(self) -> EngineRegId {
        match self {
            GuestArch::X86 => well_known::X86_EIP,
            GuestArch::Amd64 => well_known::AMD64_RIP,
            GuestArch::Arm => well_known::ARM_PC,
            GuestArch::Arm64 => well_known::ARM64_PC,
            GuestArch::Mips32 => well_known::MIPS32_PC,
            GuestArch::Mips64 => well_known::MIPS64_PC,
        }
    }

    /// Engine register id of the stack pointer.
    pub fn sp_engine_reg(self) -> EngineRegId {
        match self {
            GuestArch::X86 => well_known::X86_ESP,
            GuestArch::Amd64 => well_known::AMD64_RSP,
            GuestArch::Arm => well_known::ARM_SP,
            GuestArch::Arm64 => well_known::ARM64_SP,
            GuestArch::Mips32 => well_known::MIPS32_SP,
            GuestArch::Mips64 => well_known::MIPS64_SP,
        }
    }

    /// Width of a pointer in bytes.
    pub fn pointer_bytes(self) -> usize {
        match self {
            GuestArch::X86 | GuestArch::Arm | GuestArch::Mips32 => 4,
            GuestArch::Amd64 | GuestArch::Arm64 | GuestArch::Mips64 => 8,
        }
    }
}

/// Register-file knowledge pushed by the host before a run. All setters are
/// idempotent: each call replaces the previous table wholesale.
#[derive(Debug, Default, Clone)]
pub struct ArchConfig {
    /// The architecture symbolic register tracking is enabled for, if any.
    pub guest_arch: Option<GuestArch>,

    /// Register-file offset to register width in bytes.
    pub reg_sizes: FxHashMap<RegOffset, u64>,

    /// Register-file offset to engine register id.
    pub reg_to_engine: FxHashMap<RegOffset, EngineRegId>,

    /// Sub-register offset to the offset of the full register containing it.
    pub sub_reg_map: FxHashMap<RegOffset, RegOffset>,

    /// Lifter-internal registers with no guest counterpart.
    pub artificial_regs: FxHashSet<RegOffset>,

    /// Registers the host refuses as concrete dependencies.
    pub blacklist: FxHashSet<RegOffset>,

    /// CPU flag register-file offsets and the bitmask each one occupies in
    /// the engine's flags register.
    pub cpu_flags: FxHashMap<RegOffset, u64>,

    /// Engine register id of the flags register the bitmasks apply to.
    pub flags_register_id: Option<EngineRegId>,
}

impl ArchConfig {
    /// Canonicalize a possibly-sub-register offset to its full register.
    pub fn full_register_offset(&self, offset: RegOffset) -> RegOffset {
        self.sub_reg_map.get(&offset).copied().unwrap_or(offset)
    }

    /// Whether symbolic register tracking is enabled.
    pub fn tracking_enabled(&self) -> bool {
        self.guest_arch.is_some()
    }

    /// Register-file offset of the program counter, if tracking is enabled.
    pub fn pc_offset(&self) -> Option<RegOffset> {
        self.guest_arch.map(GuestArch::pc_reg_offset)
    }

    /// Artificial registers never qualify as dependencies.
    pub fn is_valid_dependency(&self, offset: RegOffset) -> bool {
        !self.artificial_regs.contains(&offset)
    }

    /// Blacklisted registers are never saved as concrete dependencies.
    pub fn is_blacklisted(&self, offset: RegOffset) -> bool {
        self.blacklist.contains(&offset)
    }

    /// Width of the register at `offset`, defaulting to the pointer width.
    pub fn register_size(&self, offset: RegOffset) -> u64 {
        self.reg_sizes.get(&offset).copied().unwrap_or_else(|| {
            self.guest_arch
                .map(|arch| arch.pointer_bytes() as u64)
                .unwrap_or(8)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_register_canonicalization() {
        let mut config = ArchConfig::default();
        config.sub_reg_map.insert(24, 16);
        config.sub_reg_map.insert(28, 16);

        assert_eq!(config.full_register_offset(24), 16);
        assert_eq!(config.full_register_offset(28), 16);
        assert_eq!(config.full_register_offset(16), 16);
        assert_eq!(config.full_register_offset(999), 999);
    }

    #[test]
    fn pc_lookup_follows_enabled_arch() {
        let mut config = ArchConfig::default();
        assert!(!config.tracking_enabled());
        assert_eq!(config.pc_offset(), None);

        config.guest_arch = Some(GuestArch::Amd64);
        assert_eq!(config.pc_offset(), Some(GuestArch::Amd64.pc_reg_offset()));
    }
}
