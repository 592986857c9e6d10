//! Shared harness for the integration tests: a scripted mock engine, a
//! table-driven mock lifter, and builders for IR blocks.
//!
//! The mock engine replays a fixed script of basic blocks and memory events,
//! delivering the same hook sequence a real emulator would, while its
//! register file and sparse byte memory stand in for guest state.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use concolic_accel::engine::{
    AccessError, AccessResult, Engine, EngineExit, EngineRegId, EngineState, RunHooks,
    UnmappedKind,
};
use concolic_accel::ir::{IrBlock, IrExpr, IrJumpKind, IrStmt, LiftError, Lifter};
use concolic_accel::mem::{page_base, PAGE_SIZE};
use concolic_accel::{Controller, GuestArch};

// Register-file offsets used throughout the scenarios (x86-64 numbering).
pub const RAX: u64 = 16;
pub const RBX: u64 = 24;
pub const RCX: u64 = 32;
pub const RDX: u64 = 40;
pub const EAX_SUB: u64 = 17;
pub const FLAGS: u64 = 128;

// Engine register ids for the mapped registers.
pub const ENGINE_RAX: u64 = 1;
pub const ENGINE_RBX: u64 = 2;
pub const ENGINE_RCX: u64 = 3;
pub const ENGINE_RDX: u64 = 4;
pub const ENGINE_FLAGS: u64 = 10;

#[derive(Debug, Clone)]
pub enum Event {
    Read { addr: u64, size: u8, at_pc: u64 },
    Write {
        addr: u64,
        size: u8,
        value: u64,
        at_pc: u64,
    },
    Interrupt(u32),
}

#[derive(Debug, Clone)]
pub struct BlockScript {
    pub addr: u64,
    pub size: u32,
    pub events: Vec<Event>,
    pub exit: Option<EngineExit>,
}

impl BlockScript {
    pub fn new(addr: u64, size: u32) -> Self {
        Self {
            addr,
            size,
            events: Vec::new(),
            exit: None,
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn with_exit(mut self, exit: EngineExit) -> Self {
        self.exit = Some(exit);
        self
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    regs: HashMap<EngineRegId, [u8; 32]>,
    mem: HashMap<u64, u8>,
    mapped: BTreeSet<u64>,
}

impl MockState {
    pub fn set_reg(&mut self, reg: EngineRegId, value: u64) {
        let mut raw = [0u8; 32];
        raw[..8].copy_from_slice(&value.to_le_bytes());
        self.regs.insert(reg, raw);
    }

    pub fn reg(&self, reg: EngineRegId) -> u64 {
        let raw = self.regs.get(&reg).copied().unwrap_or([0; 32]);
        u64::from_le_bytes(raw[..8].try_into().unwrap())
    }

    /// Map the pages covering `[addr, addr + bytes.len())` and fill them.
    pub fn map_bytes(&mut self, addr: u64, bytes: &[u8]) {
        let end = addr + bytes.len() as u64;
        let mut page = page_base(addr);
        while page < end {
            self.mapped.insert(page);
            page += PAGE_SIZE as u64;
        }
        for (i, &byte) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u64, byte);
        }
    }

    pub fn poke(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u64, byte);
        }
    }

    pub fn byte_at(&self, addr: u64) -> u8 {
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    fn range_mapped(&self, addr: u64, len: u64) -> bool {
        let end = addr + len.max(1);
        let mut page = page_base(addr);
        while page < end {
            if !self.mapped.contains(&page) {
                return false;
            }
            page += PAGE_SIZE as u64;
        }
        true
    }

    fn set_pc(&mut self, pc: u64) {
        let pc_reg = GuestArch::Amd64.pc_engine_reg();
        self.set_reg(pc_reg, pc);
    }
}

impl EngineState for MockState {
    fn arch(&self) -> GuestArch {
        GuestArch::Amd64
    }

    fn read_register(&self, reg: EngineRegId, out: &mut [u8]) -> AccessResult<()> {
        let raw = self
            .regs
            .get(&reg)
            .ok_or(AccessError::NoSuchRegister(reg))?;
        let len = out.len().min(32);
        out[..len].copy_from_slice(&raw[..len]);
        Ok(())
    }

    fn write_register(&mut self, reg: EngineRegId, value: &[u8]) -> AccessResult<()> {
        let slot = self.regs.entry(reg).or_insert([0; 32]);
        let len = value.len().min(32);
        slot[..len].copy_from_slice(&value[..len]);
        Ok(())
    }

    fn read_memory(&self, addr: u64, out: &mut [u8]) -> AccessResult<()> {
        if !self.range_mapped(addr, out.len() as u64) {
            return Err(AccessError::Unmapped {
                addr,
                size: out.len() as u64,
            });
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.byte_at(addr + i as u64);
        }
        Ok(())
    }

    fn map_page(&mut self, addr: u64, _perms: u64, bytes: &[u8]) -> AccessResult<()> {
        self.mapped.insert(page_base(addr));
        self.poke(addr, bytes);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockEngine {
    pub state: MockState,
    pub script: Vec<BlockScript>,
}

impl EngineState for MockEngine {
    fn arch(&self) -> GuestArch {
        self.state.arch()
    }

    fn read_register(&self, reg: EngineRegId, out: &mut [u8]) -> AccessResult<()> {
        self.state.read_register(reg, out)
    }

    fn write_register(&mut self, reg: EngineRegId, value: &[u8]) -> AccessResult<()> {
        self.state.write_register(reg, value)
    }

    fn read_memory(&self, addr: u64, out: &mut [u8]) -> AccessResult<()> {
        self.state.read_memory(addr, out)
    }

    fn map_page(&mut self, addr: u64, perms: u64, bytes: &[u8]) -> AccessResult<()> {
        self.state.map_page(addr, perms, bytes)
    }
}

impl Engine for MockEngine {
    fn run(&mut self, pc: u64, hooks: &mut dyn RunHooks) -> EngineExit {
        let script = self.script.clone();
        let Some(start) = script.iter().position(|block| block.addr == pc) else {
            if !hooks.on_unmapped(&mut self.state, UnmappedKind::Fetch, pc, 1) {
                return EngineExit::UnmappedFetch(pc);
            }
            return EngineExit::Completed;
        };

        for block in &script[start..] {
            if !self.state.range_mapped(block.addr, block.size as u64) {
                let resolved = hooks.on_unmapped(
                    &mut self.state,
                    UnmappedKind::Fetch,
                    block.addr,
                    block.size as u64,
                );
                if !resolved || !self.state.range_mapped(block.addr, block.size as u64) {
                    return EngineExit::UnmappedFetch(block.addr);
                }
            }

            self.state.set_pc(block.addr);
            hooks.on_block(&mut self.state, block.addr, block.size);
            if hooks.stop_requested() {
                return EngineExit::Interrupted;
            }

            for event in &block.events {
                match event {
                    Event::Read { addr, size, at_pc } => {
                        self.state.set_pc(*at_pc);
                        hooks.on_mem_read(&mut self.state, *addr, *size);
                    }
                    Event::Write {
                        addr,
                        size,
                        value,
                        at_pc,
                    } => {
                        self.state.set_pc(*at_pc);
                        let bytes = value.to_le_bytes();
                        self.state.poke(*addr, &bytes[..*size as usize]);
                        hooks.on_mem_write(&mut self.state, *addr, *size, *value);
                    }
                    Event::Interrupt(intno) => {
                        hooks.on_interrupt(&mut self.state, *intno);
                    }
                }
                if hooks.stop_requested() {
                    return EngineExit::Interrupted;
                }
            }

            if let Some(exit) = block.exit {
                return exit;
            }
        }
        EngineExit::Completed
    }
}

#[derive(Debug, Default)]
pub struct MockLifter {
    pub blocks: HashMap<u64, IrBlock>,
    pub lift_calls: std::rc::Rc<std::cell::Cell<u64>>,
}

impl Lifter for MockLifter {
    fn lift(&mut self, addr: u64, _bytes: &[u8]) -> Result<IrBlock, LiftError> {
        self.lift_calls.set(self.lift_calls.get() + 1);
        self.blocks
            .get(&addr)
            .cloned()
            .ok_or(LiftError::NoTranslation(addr))
    }
}

// IR builders.

pub fn get(offset: u64) -> IrExpr {
    IrExpr::Get { offset, size: 8 }
}

pub fn rdtmp(id: u64) -> IrExpr {
    IrExpr::RdTmp(id)
}

pub fn con(value: u64) -> IrExpr {
    IrExpr::Const(value)
}

pub fn load(addr: IrExpr) -> IrExpr {
    IrExpr::Load {
        addr: Box::new(addr),
        size: 8,
    }
}

pub fn add(lhs: IrExpr, rhs: IrExpr) -> IrExpr {
    IrExpr::Binop(Box::new(lhs), Box::new(rhs))
}

pub fn imark(addr: u64, len: u32) -> IrStmt {
    IrStmt::IMark { addr, len }
}

pub fn wrtmp(tmp: u64, value: IrExpr) -> IrStmt {
    IrStmt::WrTmp { tmp, value }
}

pub fn put(offset: u64, value: IrExpr) -> IrStmt {
    IrStmt::Put { offset, value }
}

pub fn store(addr: IrExpr, value: IrExpr) -> IrStmt {
    IrStmt::Store { addr, value }
}

pub fn exit_stmt(guard: IrExpr, dst: u64) -> IrStmt {
    IrStmt::Exit { guard, dst }
}

pub fn ir_block(addr: u64, size: u32, stmts: Vec<IrStmt>) -> IrBlock {
    IrBlock {
        addr,
        size,
        stmts,
        next: con(addr + size as u64),
        jumpkind: IrJumpKind::Boring,
    }
}

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(0x5e55_0000);

pub fn fresh_session_key() -> u64 {
    NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed)
}

/// A controller over the mock engine/lifter with the standard x86-64 test
/// register file configured and tracking enabled.
pub fn setup_controller(
    script: Vec<BlockScript>,
    blocks: Vec<IrBlock>,
) -> Controller<MockEngine, MockLifter> {
    let mut engine = MockEngine::default();
    engine.script = script;
    for (reg, value) in [
        (ENGINE_RAX, 0u64),
        (ENGINE_RBX, 0),
        (ENGINE_RCX, 0),
        (ENGINE_RDX, 0),
        (ENGINE_FLAGS, 0),
        (GuestArch::Amd64.pc_engine_reg(), 0),
        (GuestArch::Amd64.sp_engine_reg(), 0x7fff_0000),
    ] {
        engine.state.set_reg(reg, value);
    }

    let mut lifter = MockLifter::default();
    for block in blocks {
        lifter.blocks.insert(block.addr, block);
    }

    let mut controller = Controller::new(engine, lifter, fresh_session_key());
    let offsets = [RAX, RBX, RCX, RDX, FLAGS];
    let engine_ids = [ENGINE_RAX, ENGINE_RBX, ENGINE_RCX, ENGINE_RDX, ENGINE_FLAGS];
    let sizes = [8u64; 5];
    controller.set_reg_to_engine_mappings(&offsets, &engine_ids);
    controller.set_register_sizes(&offsets, &sizes);
    controller.set_sub_reg_mappings(&[EAX_SUB], &[RAX]);
    controller.enable_symbolic_reg_tracking(GuestArch::Amd64);
    controller.hook();
    controller
}

/// Map `size` filler code bytes at `addr` in the engine so fetches and
/// lifting succeed.
pub fn map_code(controller: &mut Controller<MockEngine, MockLifter>, addr: u64, size: u32) {
    controller
        .engine_mut()
        .state
        .map_bytes(addr, &vec![0x90u8; size as usize]);
}
