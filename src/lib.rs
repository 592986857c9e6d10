//! A hybrid concrete/symbolic execution accelerator.
//!
//! The crate sits between a host symbolic analyzer and a CPU emulator (the
//! engine): guest code runs concretely on the engine for as long as no
//! symbolic information would be lost. Per-byte shadow taint, a per-block
//! write journal, and an IR-level taint propagation engine decide for every
//! instruction whether it is purely concrete, depends on a read from a
//! symbolic address, or is outright symbolic. When continued concrete
//! execution would lose information — a symbolic value flowing into a branch
//! condition, a memory address, or the program counter — the run stops, the
//! in-flight block is rewound, and the host receives the minimal slice of
//! instructions (plus the concrete register and memory values they depend
//! on) to re-execute symbolically.
//!
//! The emulator, the IR lifter, and the host analyzer are external
//! collaborators reached through the [engine::Engine] and [ir::Lifter]
//! seams or the flat [ffi] surface. This crate never evaluates symbolic
//! expressions and never emulates instructions itself.

pub mod analyzer;
pub mod arch;
pub mod cache;
pub mod controller;
pub mod engine;
pub mod ffi;
pub mod ir;
pub mod mem;
mod propagate;
pub mod stop;
pub mod taint;

pub use arch::{ArchConfig, GuestArch};
pub use controller::{Controller, MAX_BLOCK_SIZE};
pub use engine::{Engine, EngineExit, EngineState, RunHooks, UnmappedKind};
pub use ir::{Address, IrBlock, IrExpr, IrJumpKind, IrStmt, LiftError, Lifter, RegOffset, TmpId};
pub use stop::{StopDetails, StopReason};
pub use taint::{
    BlockDetails, BlockTaintEntry, InstrDetails, MemoryValue, RegisterValue, Taint, TaintEntity,
};
