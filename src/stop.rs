//! The stop-reason taxonomy. Every way a run can end maps to exactly one
//! [StopReason]; the partition helpers drive the commit/rollback decision in
//! the controller.

/// Why the controller halted the engine. The discriminants are part of the
/// external ABI and must stay stable.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StopReason {
    /// Step limit reached or the engine ran out of work.
    Normal = 0,

    /// A configured stop point was hit at a block boundary.
    StopPoint,

    /// The engine reported an internal error.
    Error,

    /// An interrupt classified as a system call was raised.
    Syscall,

    /// Execution reached memory with no backing code.
    ExecNone,

    /// Execution reached the zero page.
    ZeroPage,

    /// The engine could not begin executing at the requested address.
    NoStart,

    /// An unresolvable data access fault.
    Segfault,

    /// Integer division by zero.
    ZeroDiv,

    /// The engine could not decode an instruction.
    NoDecode,

    /// A halt instruction was executed.
    Hlt,

    /// The lifter failed to translate a block while symbolic state was live.
    VexLiftFailed,

    /// An if-then-else condition turned symbolic.
    SymbolicCondition,

    /// A symbolic value flowed into the program counter.
    SymbolicPc,

    /// A memory read whose address is symbolic.
    SymbolicReadAddr,

    /// Symbolic data was read while symbolic tracking is disabled.
    SymbolicReadSymbolicTrackingDisabled,

    /// A memory write whose address is symbolic.
    SymbolicWriteAddr,

    /// The guard of the block's exit statement turned symbolic.
    SymbolicBlockExitStmt,

    /// More than one memory read in a single instruction.
    MultipleMemoryReads,

    UnsupportedStmtPutI,
    UnsupportedStmtStoreG,
    UnsupportedStmtLoadG,
    UnsupportedStmtCas,
    UnsupportedStmtLlsc,
    UnsupportedStmtDirty,
    UnsupportedStmtUnknown,
    UnsupportedExprGetI,
    UnsupportedExprUnknown,

    /// A memory write the taint engine was not expecting.
    UnknownMemoryWrite,

    /// A memory read the taint engine was not expecting.
    UnknownMemoryRead,
}

impl StopReason {
    /// Normal termination: the run ended without losing any information.
    pub fn is_normal_exit(self) -> bool {
        matches!(
            self,
            StopReason::Normal | StopReason::StopPoint | StopReason::Hlt | StopReason::Syscall
        )
    }

    /// Engine faults are fatal to the run and reported as-is.
    pub fn is_engine_fault(self) -> bool {
        matches!(
            self,
            StopReason::Error
                | StopReason::Segfault
                | StopReason::ZeroDiv
                | StopReason::NoDecode
                | StopReason::ExecNone
                | StopReason::ZeroPage
                | StopReason::NoStart
        )
    }

    /// A symbolic boundary was reached; the host takes over from the block
    /// start.
    pub fn is_symbolic_boundary(self) -> bool {
        matches!(
            self,
            StopReason::SymbolicPc
                | StopReason::SymbolicCondition
                | StopReason::SymbolicReadAddr
                | StopReason::SymbolicWriteAddr
                | StopReason::SymbolicBlockExitStmt
                | StopReason::SymbolicReadSymbolicTrackingDisabled
        )
    }

    /// Constructs this implementation cannot track through.
    pub fn is_capability_gap(self) -> bool {
        matches!(
            self,
            StopReason::MultipleMemoryReads
                | StopReason::VexLiftFailed
                | StopReason::UnsupportedStmtPutI
                | StopReason::UnsupportedStmtStoreG
                | StopReason::UnsupportedStmtLoadG
                | StopReason::UnsupportedStmtCas
                | StopReason::UnsupportedStmtLlsc
                | StopReason::UnsupportedStmtDirty
                | StopReason::UnsupportedStmtUnknown
                | StopReason::UnsupportedExprGetI
                | StopReason::UnsupportedExprUnknown
                | StopReason::UnknownMemoryWrite
                | StopReason::UnknownMemoryRead
        )
    }

    /// Whether the in-flight block must be rewound to its entry state.
    pub fn requires_rollback(self) -> bool {
        self.is_symbolic_boundary() || self.is_capability_gap()
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw <= StopReason::UnknownMemoryRead as u32 {
            // SAFETY: repr(u32) with contiguous discriminants starting at 0
            Some(unsafe { std::mem::transmute::<u32, StopReason>(raw) })
        } else {
            None
        }
    }
}

/// The final outcome of a run, reported to the host.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StopDetails {
    pub reason: StopReason,
    pub block_addr: u64,
    pub block_size: u64,
}

impl Default for StopDetails {
    fn default() -> Self {
        Self {
            reason: StopReason::Normal,
            block_addr: 0,
            block_size: 0,
        }
    }
}
