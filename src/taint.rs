//! The taint data model: per-byte taint labels, the entities taint attaches
//! to, the per-instruction and per-block analysis records, and the
//! register/temporary taint state tracked while a block executes.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use fxhash::FxHashSet;
use smallvec::SmallVec;

use crate::engine::{MAX_MEM_ACCESS_BYTES, MAX_REGISTER_BYTES};
use crate::ir::{Address, RegOffset, TmpId};
use crate::stop::StopReason;

/// Taint label of one byte of guest memory.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Taint {
    /// Untracked concrete data.
    #[default]
    None = 0,

    /// Concrete data with a pending write whose prior taint is journaled.
    Dirty = 1,

    /// Data whose value only the host analyzer knows.
    Symbolic = 2,
}

/// Something taint can attach to: a register, a block-local temporary, or a
/// memory reference described by the entities computing its address.
///
/// Equality and hashing cover the variant payload only; `instr_addr` is
/// metadata recording where the entity was used as a sink.
#[derive(Debug, Clone)]
pub enum TaintEntity {
    Reg {
        offset: RegOffset,
        instr_addr: Address,
    },
    Tmp {
        id: TmpId,
        instr_addr: Address,
    },
    Mem {
        /// The address-computing entities, in evaluation order.
        deps: Vec<TaintEntity>,
        instr_addr: Address,
    },
}

impl TaintEntity {
    pub fn instr_addr(&self) -> Address {
        match self {
            TaintEntity::Reg { instr_addr, .. }
            | TaintEntity::Tmp { instr_addr, .. }
            | TaintEntity::Mem { instr_addr, .. } => *instr_addr,
        }
    }
}

impl PartialEq for TaintEntity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TaintEntity::Reg { offset: a, .. }, TaintEntity::Reg { offset: b, .. }) => a == b,
            (TaintEntity::Tmp { id: a, .. }, TaintEntity::Tmp { id: b, .. }) => a == b,
            (TaintEntity::Mem { deps: a, .. }, TaintEntity::Mem { deps: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for TaintEntity {}

impl Hash for TaintEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TaintEntity::Reg { offset, .. } => {
                state.write_u8(0);
                offset.hash(state);
            }
            TaintEntity::Tmp { id, .. } => {
                state.write_u8(1);
                id.hash(state);
            }
            TaintEntity::Mem { deps, .. } => {
                state.write_u8(2);
                for dep in deps {
                    dep.hash(state);
                }
            }
        }
    }
}

/// Cumulative taint classification of a set of sources.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum TaintStatus {
    Concrete,
    /// The data is concrete but was (or would be) read through an address
    /// computed from symbolic entities.
    DependsOnReadFromSymbolicAddr,
    Symbolic,
}

/// Result of visiting one IR expression: the leaf entities it touches and
/// the entities appearing inside if-then-else conditions.
#[derive(Debug, Default, Clone)]
pub struct TaintSources {
    pub sources: FxHashSet<TaintEntity>,
    pub ite_cond_entities: FxHashSet<TaintEntity>,
    pub unsupported: Option<StopReason>,
}

impl TaintSources {
    pub fn merge(&mut self, other: TaintSources) {
        self.sources.extend(other.sources);
        self.ite_cond_entities.extend(other.ite_cond_entities);
        if self.unsupported.is_none() {
            self.unsupported = other.unsupported;
        }
    }
}

/// Data-flow summary of one guest instruction, produced by the analyzer.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InstructionTaintEntry {
    /// Sink to direct-source pairs, in program order.
    pub taint_sink_src_map: Vec<(TaintEntity, FxHashSet<TaintEntity>)>,

    /// Register entities whose concrete value must be captured if this
    /// instruction is later classified symbolic.
    pub dependencies_to_save: FxHashSet<TaintEntity>,

    /// Entities appearing in any if-then-else condition of the instruction.
    pub ite_cond_entity_list: FxHashSet<TaintEntity>,

    /// Registers the instruction writes, and whether the written value
    /// depends on the register's previous value.
    pub modified_regs: SmallVec<[(RegOffset, bool); 4]>,

    pub has_memory_read: bool,
    pub has_memory_write: bool,
}

/// Data-flow summary of one lifted block, memoized by block address.
/// All fields participate in equality.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BlockTaintEntry {
    /// Instruction address to its taint entry, in address order.
    pub instr_entries: BTreeMap<Address, InstructionTaintEntry>,

    /// Entities feeding the guard of the block's conditional exit.
    pub exit_guard_deps: FxHashSet<TaintEntity>,

    /// Entities feeding the block's fall-through target expression.
    pub next_expr_deps: FxHashSet<TaintEntity>,

    pub exit_stmt_instr_addr: Address,

    /// Set when the block contains an IR construct propagation refuses.
    pub unsupported: Option<StopReason>,
}

/// A memory value captured for re-execution, at most 8 bytes.
/// Equality compares only the `size` live bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct MemoryValue {
    pub address: u64,
    pub value: [u8; MAX_MEM_ACCESS_BYTES],
    pub size: u64,
}

impl PartialEq for MemoryValue {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.size == other.size
            && self.value[..self.size as usize] == other.value[..other.size as usize]
    }
}

impl Eq for MemoryValue {}

/// A register snapshot taken at block entry.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegisterValue {
    pub offset: u64,
    pub value: [u8; MAX_REGISTER_BYTES],
}

impl Default for RegisterValue {
    fn default() -> Self {
        Self {
            offset: 0,
            value: [0; MAX_REGISTER_BYTES],
        }
    }
}

/// One instruction the host must re-execute symbolically.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct InstrDetails {
    pub instr_addr: u64,
    pub has_memory_dep: bool,
    /// Captured only when the instruction read memory through a concrete
    /// address; zeroed otherwise.
    pub memory_value: MemoryValue,
}

impl Ord for InstrDetails {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.instr_addr.cmp(&other.instr_addr)
    }
}

impl PartialOrd for InstrDetails {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Mutable record of the block the engine is currently executing.
#[derive(Debug, Default, Clone)]
pub struct BlockDetails {
    pub block_addr: Address,
    pub block_size: u64,
    pub vex_lift_failed: bool,

    /// Instructions to re-execute symbolically, ordered by address, unique.
    pub symbolic_instrs: Vec<InstrDetails>,

    /// Concrete register snapshots the symbolic instructions depend on,
    /// deduplicated by register offset.
    pub register_values: Vec<RegisterValue>,
}

impl BlockDetails {
    pub fn reset(&mut self) {
        self.block_addr = 0;
        self.block_size = 0;
        self.vex_lift_failed = false;
        self.symbolic_instrs.clear();
        self.register_values.clear();
    }

    /// Insert keeping `symbolic_instrs` sorted by address and unique.
    pub fn add_symbolic_instr(&mut self, details: InstrDetails) {
        match self
            .symbolic_instrs
            .binary_search_by_key(&details.instr_addr, |d| d.instr_addr)
        {
            Ok(pos) => {
                // A later classification may add a memory dependency.
                if details.has_memory_dep {
                    self.symbolic_instrs[pos] = details;
                }
            }
            Err(pos) => self.symbolic_instrs.insert(pos, details),
        }
    }

    /// Record a snapshot unless one for this offset is already present.
    pub fn add_register_value(&mut self, value: RegisterValue) {
        if !self.register_values.iter().any(|v| v.offset == value.offset) {
            self.register_values.push(value);
        }
    }
}

/// Outcome of one executed memory read, delivered by the read hook.
#[derive(Debug, Copy, Clone)]
pub struct MemReadResult {
    pub address: u64,
    pub value: [u8; MAX_MEM_ACCESS_BYTES],
    pub size: u8,
    pub is_value_symbolic: bool,
}

/// Register and temporary taint, split into a persistent set that survives
/// across blocks and block-level overlays that commit or roll back with the
/// block. Offsets stored here are always canonical full-register offsets.
#[derive(Debug, Default, Clone)]
pub struct TaintState {
    symbolic_registers: FxHashSet<RegOffset>,
    block_symbolic_registers: FxHashSet<RegOffset>,
    block_concrete_registers: FxHashSet<RegOffset>,
    block_symbolic_temps: FxHashSet<TmpId>,
}

impl TaintState {
    /// Mark a register symbolic. Block-level marks stay in the overlay until
    /// the block commits; direct marks (host seeding) hit the persistent set.
    pub fn mark_register_symbolic(&mut self, offset: RegOffset, block_level: bool) {
        if block_level {
            self.block_symbolic_registers.insert(offset);
            self.block_concrete_registers.remove(&offset);
        } else {
            self.symbolic_registers.insert(offset);
        }
    }

    pub fn mark_register_concrete(&mut self, offset: RegOffset, block_level: bool) {
        if block_level {
            self.block_concrete_registers.insert(offset);
            self.block_symbolic_registers.remove(&offset);
        } else {
            self.symbolic_registers.remove(&offset);
        }
    }

    pub fn mark_temp_symbolic(&mut self, id: TmpId) {
        self.block_symbolic_temps.insert(id);
    }

    /// Block overlays take precedence over the persistent set.
    pub fn is_symbolic_register(&self, offset: RegOffset) -> bool {
        if self.block_symbolic_registers.contains(&offset) {
            return true;
        }
        if self.block_concrete_registers.contains(&offset) {
            return false;
        }
        self.symbolic_registers.contains(&offset)
    }

    pub fn is_symbolic_temp(&self, id: TmpId) -> bool {
        self.block_symbolic_temps.contains(&id)
    }

    /// Fold the block overlays into the persistent set. Temporaries are
    /// block-local and discarded.
    pub fn commit_block(&mut self) {
        for offset in self.block_symbolic_registers.drain() {
            self.symbolic_registers.insert(offset);
        }
        for offset in self.block_concrete_registers.drain() {
            self.symbolic_registers.remove(&offset);
        }
        self.block_symbolic_temps.clear();
    }

    /// Discard the block overlays, restoring the taint visible at block
    /// entry.
    pub fn rollback_block(&mut self) {
        self.block_symbolic_registers.clear();
        self.block_concrete_registers.clear();
        self.block_symbolic_temps.clear();
    }

    pub fn symbolic_registers(&self) -> &FxHashSet<RegOffset> {
        &self.symbolic_registers
    }

    pub fn any_symbolic_registers(&self) -> bool {
        !self.symbolic_registers.is_empty() || !self.block_symbolic_registers.is_empty()
    }
}
