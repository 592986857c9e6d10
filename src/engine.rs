//! The seam between the controller and the CPU emulator.
//!
//! The engine is an external collaborator: it owns guest registers and guest
//! memory and executes machine code. The controller only observes execution
//! through the [RunHooks] callbacks and touches engine state through
//! [EngineState]. Both sides run on the same thread; [Engine::run] must
//! invoke hooks synchronously and poll [RunHooks::stop_requested] at every
//! hook edge so cooperative cancellation takes effect at the next safe point.

use crate::arch::GuestArch;

/// Engine-native register identifier. PC and SP use the well-known values in
/// [well_known]; every other id is an opaque number the host configures.
pub type EngineRegId = u64;

/// The widest guest register the boundary transports.
pub const MAX_REGISTER_BYTES: usize = 32;

/// The widest single memory access the taint engine tracks.
pub const MAX_MEM_ACCESS_BYTES: usize = 8;

/// Register identifiers every conforming engine must honor for the program
/// counter and stack pointer of each supported architecture. All remaining
/// register numbering is engine-defined and reaches the controller only
/// through the host's offset-to-engine-id mapping.
pub mod well_known {
    use super::EngineRegId;

    pub const X86_EIP: EngineRegId = 0x1000;
    pub const X86_ESP: EngineRegId = 0x1001;
    pub const AMD64_RIP: EngineRegId = 0x1010;
    pub const AMD64_RSP: EngineRegId = 0x1011;
    pub const ARM_PC: EngineRegId = 0x1020;
    pub const ARM_SP: EngineRegId = 0x1021;
    pub const ARM64_PC: EngineRegId = 0x1030;
    pub const ARM64_SP: EngineRegId = 0x1031;
    pub const MIPS32_PC: EngineRegId = 0x1040;
    pub const MIPS32_SP: EngineRegId = 0x1041;
    pub const MIPS64_PC: EngineRegId = 0x1050;
    pub const MIPS64_SP: EngineRegId = 0x1051;
}

#[derive(thiserror::Error, Debug)]
pub enum AccessError {
    #[error("engine has no register {0:#x}")]
    NoSuchRegister(EngineRegId),

    #[error("memory {addr:#x}+{size:#x} is not mapped")]
    Unmapped { addr: u64, size: u64 },

    #[error("engine rejected the operation: {0}")]
    Rejected(String),
}

pub type AccessResult<T> = std::result::Result<T, AccessError>;

/// Synchronous access to the paused engine. Values are little-endian; a
/// register read fills `out` up to the register's width.
pub trait EngineState {
    fn arch(&self) -> GuestArch;

    fn read_register(&self, reg: EngineRegId, out: &mut [u8]) -> AccessResult<()>;

    fn write_register(&mut self, reg: EngineRegId, value: &[u8]) -> AccessResult<()>;

    fn read_memory(&self, addr: u64, out: &mut [u8]) -> AccessResult<()>;

    /// Map one page of guest memory with the given contents and permissions.
    fn map_page(&mut self, addr: u64, perms: u64, bytes: &[u8]) -> AccessResult<()>;
}

/// Why [Engine::run] returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EngineExit {
    /// The engine ran out of scheduled work.
    Completed,

    /// A halt instruction was executed.
    Halt,

    /// Instruction fetch from unmapped memory that no hook resolved.
    UnmappedFetch(u64),

    /// Data read from unmapped memory that no hook resolved.
    UnmappedRead(u64),

    /// Data write to unmapped memory that no hook resolved.
    UnmappedWrite(u64),

    /// An access violated page permissions.
    ProtectionFault(u64),

    ZeroDivision,

    /// The bytes at the address did not decode to an instruction.
    NoDecode(u64),

    /// The run was halted because [RunHooks::stop_requested] returned true.
    Interrupted,

    /// The engine failed internally.
    InternalError,
}

/// Which kind of access faulted on unmapped memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnmappedKind {
    Fetch,
    Read,
    Write,
}

/// Callbacks the engine delivers while running. Hook receivers get the
/// engine's state, never the running engine itself.
pub trait RunHooks {
    /// A new basic block is about to execute.
    fn on_block(&mut self, state: &mut dyn EngineState, addr: u64, size: u32);

    /// A memory read of `size` bytes at `addr` just completed.
    fn on_mem_read(&mut self, state: &mut dyn EngineState, addr: u64, size: u8);

    /// A memory write of `size` bytes is being performed; `value` holds the
    /// written bytes little-endian.
    fn on_mem_write(&mut self, state: &mut dyn EngineState, addr: u64, size: u8, value: u64);

    /// An access faulted on unmapped memory. Return true if the fault was
    /// resolved (a page was mapped) and the engine should retry the access.
    fn on_unmapped(&mut self, state: &mut dyn EngineState, kind: UnmappedKind, addr: u64, size: u64)
        -> bool;

    /// A CPU interrupt was raised.
    fn on_interrupt(&mut self, state: &mut dyn EngineState, intno: u32);

    /// Polled at every hook edge; true asks the engine to halt at the next
    /// safe point.
    fn stop_requested(&self) -> bool;
}

/// The CPU emulator.
pub trait Engine: EngineState {
    /// Execute guest code starting at `pc`, delivering [RunHooks] callbacks
    /// until the run ends.
    fn run(&mut self, pc: u64, hooks: &mut dyn RunHooks) -> EngineExit;
}
