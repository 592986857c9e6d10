//! The architecture-neutral intermediate representation handed over by the
//! external lifter, and the [Lifter] seam itself.
//!
//! The accelerator never evaluates IR semantics. It only needs the *shape* of
//! each block: which registers, temporaries, and memory locations every
//! statement reads and writes. Constructs whose data flow cannot be described
//! that way are carried as explicit variants so the analyzer can map them to
//! typed stop reasons instead of failing out-of-band.

use crate::stop::StopReason;

/// A guest address.
pub type Address = u64;

/// Offset of a register into the guest register file, as used by the lifter.
pub type RegOffset = u64;

/// Identifier of a block-local temporary.
pub type TmpId = u64;

#[derive(thiserror::Error, Debug)]
pub enum LiftError {
    #[error("no translation for code at {0:#x}")]
    NoTranslation(Address),

    #[error("lifter rejected block at {addr:#x}: {reason}")]
    Rejected { addr: Address, reason: String },
}

/// The external lifter. Given the raw bytes of a basic block, produce its IR.
///
/// Implementations live on the host side of the boundary; the crate ships
/// none.
pub trait Lifter {
    fn lift(&mut self, addr: Address, bytes: &[u8]) -> Result<IrBlock, LiftError>;
}

/// One lifted basic block.
#[derive(Debug, Clone, PartialEq)]
pub struct IrBlock {
    pub addr: Address,
    /// Guest bytes covered by this block.
    pub size: u32,
    pub stmts: Vec<IrStmt>,
    /// The fall-through / final jump target expression.
    pub next: IrExpr,
    pub jumpkind: IrJumpKind,
}

/// How the block leaves through its `next` expression.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IrJumpKind {
    Boring,
    Call,
    Ret,
    Syscall,
    NoDecode,
    Yield,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrStmt {
    /// Marks the start of a guest instruction. Statements that follow belong
    /// to it until the next marker.
    IMark { addr: Address, len: u32 },

    /// Assign an expression to a block-local temporary.
    WrTmp { tmp: TmpId, value: IrExpr },

    /// Write an expression to a fixed register-file offset.
    Put { offset: RegOffset, value: IrExpr },

    /// Write to a computed register-file offset. Unsupported.
    PutI { value: IrExpr },

    /// Store a value at a computed address.
    Store { addr: IrExpr, value: IrExpr },

    /// Guarded store. Unsupported.
    StoreG {
        guard: IrExpr,
        addr: IrExpr,
        value: IrExpr,
    },

    /// Guarded load. Unsupported.
    LoadG {
        guard: IrExpr,
        tmp: TmpId,
        addr: IrExpr,
    },

    /// Compare-and-swap. Unsupported.
    Cas { addr: IrExpr },

    /// Load-linked / store-conditional. Unsupported.
    Llsc { addr: IrExpr },

    /// A call with side effects the IR cannot describe. Unsupported.
    Dirty,

    /// Memory fence. Taint-neutral.
    MemFence,

    /// Application binary interface hint. Taint-neutral.
    AbiHint,

    NoOp,

    /// Conditional side exit of the block.
    Exit { guard: IrExpr, dst: Address },

    /// A statement form this implementation does not recognize. Unsupported.
    Unknown,
}

impl IrStmt {
    /// The stop reason for statements the analyzer refuses, if any.
    pub fn unsupported_reason(&self) -> Option<StopReason> {
        match self {
            IrStmt::PutI { .. } => Some(StopReason::UnsupportedStmtPutI),
            IrStmt::StoreG { .. } => Some(StopReason::UnsupportedStmtStoreG),
            IrStmt::LoadG { .. } => Some(StopReason::UnsupportedStmtLoadG),
            IrStmt::Cas { .. } => Some(StopReason::UnsupportedStmtCas),
            IrStmt::Llsc { .. } => Some(StopReason::UnsupportedStmtLlsc),
            IrStmt::Dirty => Some(StopReason::UnsupportedStmtDirty),
            IrStmt::Unknown => Some(StopReason::UnsupportedStmtUnknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrExpr {
    /// Read a register at a fixed offset.
    Get { offset: RegOffset, size: u8 },

    /// Read a register at a computed offset. Unsupported.
    GetI,

    /// Read a block-local temporary.
    RdTmp(TmpId),

    /// Load from a computed address.
    Load { addr: Box<IrExpr>, size: u8 },

    Const(u64),

    Unop(Box<IrExpr>),

    Binop(Box<IrExpr>, Box<IrExpr>),

    Triop(Box<IrExpr>, Box<IrExpr>, Box<IrExpr>),

    Qop(Vec<IrExpr>),

    /// If-then-else. The condition is tracked separately from the arms.
    Ite {
        cond: Box<IrExpr>,
        if_true: Box<IrExpr>,
        if_false: Box<IrExpr>,
    },

    /// Call to a pure helper; data flow is the union of the arguments.
    CCall(Vec<IrExpr>),

    /// A form this implementation does not recognize.
    Unknown,
}
