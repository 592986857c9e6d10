//! The flat `extern "C"` surface.
//!
//! Everything crossing this boundary is a plain integer, a `#[repr(C)]`
//! struct, or a caller-owned flat array. The engine and the lifter come in
//! as function tables; IR blocks come back as index-linked flat records that
//! this module converts into the owned [IrBlock] form. Pointers returned to
//! the host (symbolic block details, sync lists) stay valid until the next
//! `concolic_start` call on the same controller; the host copies before
//! resuming.

use std::os::raw::c_void;

use crate::arch::GuestArch;
use crate::controller::Controller;
use crate::engine::{
    AccessError, AccessResult, Engine, EngineExit, EngineRegId, EngineState, RunHooks,
    UnmappedKind,
};
use crate::ir::{Address, IrBlock, IrExpr, IrJumpKind, IrStmt, LiftError, Lifter};
use crate::stop::{StopDetails, StopReason};
use crate::taint::{InstrDetails, RegisterValue};

/// The controller type instantiated over the C function tables.
pub type Handle = Controller<ExternEngine, ExternLifter>;

/// Engine exit codes as returned by [EngineVtable::run].
const EXIT_COMPLETED: u32 = 0;
const EXIT_HALT: u32 = 1;
const EXIT_UNMAPPED_FETCH: u32 = 2;
const EXIT_UNMAPPED_READ: u32 = 3;
const EXIT_UNMAPPED_WRITE: u32 = 4;
const EXIT_PROTECTION_FAULT: u32 = 5;
const EXIT_ZERO_DIVISION: u32 = 6;
const EXIT_NO_DECODE: u32 = 7;
const EXIT_INTERRUPTED: u32 = 8;

/// The engine as a C function table. All callbacks return 0 on success.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct EngineVtable {
    pub ctx: *mut c_void,
    pub arch: unsafe extern "C" fn(ctx: *mut c_void) -> u32,
    pub read_register:
        unsafe extern "C" fn(ctx: *mut c_void, reg: u64, out: *mut u8, len: u64) -> i32,
    pub write_register:
        unsafe extern "C" fn(ctx: *mut c_void, reg: u64, value: *const u8, len: u64) -> i32,
    pub read_memory:
        unsafe extern "C" fn(ctx: *mut c_void, addr: u64, out: *mut u8, len: u64) -> i32,
    pub map_page: unsafe extern "C" fn(
        ctx: *mut c_void,
        addr: u64,
        perms: u64,
        bytes: *const u8,
        len: u64,
    ) -> i32,
    /// Run from `pc`, delivering callbacks through `hooks`/`hook_vtable` and
    /// polling `stop_requested` at every hook edge. Returns an `EXIT_*`
    /// code; `fault_addr` receives the faulting address for fault exits.
    pub run: unsafe extern "C" fn(
        ctx: *mut c_void,
        pc: u64,
        hooks: *mut c_void,
        hook_vtable: *const HookVtable,
        fault_addr: *mut u64,
    ) -> u32,
}

/// Callbacks the engine invokes while running. The `hooks` pointer handed to
/// [EngineVtable::run] must be passed back verbatim as `ctx`.
#[repr(C)]
pub struct HookVtable {
    pub on_block: unsafe extern "C" fn(ctx: *mut c_void, addr: u64, size: u32),
    pub on_mem_read: unsafe extern "C" fn(ctx: *mut c_void, addr: u64, size: u8),
    pub on_mem_write: unsafe extern "C" fn(ctx: *mut c_void, addr: u64, size: u8, value: u64),
    /// kind: 0 fetch, 1 read, 2 write. Returns nonzero when the fault was
    /// resolved and the access should be retried.
    pub on_unmapped: unsafe extern "C" fn(ctx: *mut c_void, kind: u32, addr: u64, size: u64) -> i32,
    pub on_interrupt: unsafe extern "C" fn(ctx: *mut c_void, intno: u32),
    pub stop_requested: unsafe extern "C" fn(ctx: *mut c_void) -> i32,
}

struct HookBridge<'a> {
    hooks: &'a mut dyn RunHooks,
    shim: ExternEngine,
}

unsafe extern "C" fn bridge_on_block(ctx: *mut c_void, addr: u64, size: u32) {
    let bridge = &mut *(ctx as *mut HookBridge);
    bridge.hooks.on_block(&mut bridge.shim, addr, size);
}

unsafe extern "C" fn bridge_on_mem_read(ctx: *mut c_void, addr: u64, size: u8) {
    let bridge = &mut *(ctx as *mut HookBridge);
    bridge.hooks.on_mem_read(&mut bridge.shim, addr, size);
}

unsafe extern "C" fn bridge_on_mem_write(ctx: *mut c_void, addr: u64, size: u8, value: u64) {
    let bridge = &mut *(ctx as *mut HookBridge);
    bridge.hooks.on_mem_write(&mut bridge.shim, addr, size, value);
}

unsafe extern "C" fn bridge_on_unmapped(ctx: *mut c_void, kind: u32, addr: u64, size: u64) -> i32 {
    let bridge = &mut *(ctx as *mut HookBridge);
    let kind = match kind {
        0 => UnmappedKind::Fetch,
        1 => UnmappedKind::Read,
        _ => UnmappedKind::Write,
    };
    bridge.hooks.on_unmapped(&mut bridge.shim, kind, addr, size) as i32
}

unsafe extern "C" fn bridge_on_interrupt(ctx: *mut c_void, intno: u32) {
    let bridge = &mut *(ctx as *mut HookBridge);
    bridge.hooks.on_interrupt(&mut bridge.shim, intno);
}

unsafe extern "C" fn bridge_stop_requested(ctx: *mut c_void) -> i32 {
    let bridge = &*(ctx as *const HookBridge);
    bridge.hooks.stop_requested() as i32
}

static HOOK_VTABLE: HookVtable = HookVtable {
    on_block: bridge_on_block,
    on_mem_read: bridge_on_mem_read,
    on_mem_write: bridge_on_mem_write,
    on_unmapped: bridge_on_unmapped,
    on_interrupt: bridge_on_interrupt,
    stop_requested: bridge_stop_requested,
};

/// An engine living on the far side of the boundary.
pub struct ExternEngine {
    vt: EngineVtable,
    arch: GuestArch,
}

impl ExternEngine {
    /// # Safety
    /// The vtable's callbacks must stay valid for the engine's lifetime.
    pub unsafe fn from_vtable(vt: EngineVtable) -> Option<Self> {
        let arch = GuestArch::from_raw((vt.arch)(vt.ctx))?;
        Some(Self { vt, arch })
    }
}

impl EngineState for ExternEngine {
    fn arch(&self) -> GuestArch {
        self.arch
    }

    fn read_register(&self, reg: EngineRegId, out: &mut [u8]) -> AccessResult<()> {
        let rc =
            unsafe { (self.vt.read_register)(self.vt.ctx, reg, out.as_mut_ptr(), out.len() as u64) };
        if rc == 0 {
            Ok(())
        } else {
            Err(AccessError::NoSuchRegister(reg))
        }
    }

    fn write_register(&mut self, reg: EngineRegId, value: &[u8]) -> AccessResult<()> {
        let rc = unsafe {
            (self.vt.write_register)(self.vt.ctx, reg, value.as_ptr(), value.len() as u64)
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(AccessError::NoSuchRegister(reg))
        }
    }

    fn read_memory(&self, addr: u64, out: &mut [u8]) -> AccessResult<()> {
        let rc =
            unsafe { (self.vt.read_memory)(self.vt.ctx, addr, out.as_mut_ptr(), out.len() as u64) };
        if rc == 0 {
            Ok(())
        } else {
            Err(AccessError::Unmapped {
                addr,
                size: out.len() as u64,
            })
        }
    }

    fn map_page(&mut self, addr: u64, perms: u64, bytes: &[u8]) -> AccessResult<()> {
        let rc = unsafe {
            (self.vt.map_page)(self.vt.ctx, addr, perms, bytes.as_ptr(), bytes.len() as u64)
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(AccessError::Rejected(format!(
                "map_page({addr:#x}) returned {rc}"
            )))
        }
    }
}

impl Engine for ExternEngine {
    fn run(&mut self, pc: u64, hooks: &mut dyn RunHooks) -> EngineExit {
        let mut bridge = HookBridge {
            hooks,
            shim: ExternEngine {
                vt: self.vt,
                arch: self.arch,
            },
        };
        let mut fault_addr = 0u64;
        let code = unsafe {
            (self.vt.run)(
                self.vt.ctx,
                pc,
                &mut bridge as *mut HookBridge as *mut c_void,
                &HOOK_VTABLE,
                &mut fault_addr,
            )
        };
        match code {
            EXIT_COMPLETED => EngineExit::Completed,
            EXIT_HALT => EngineExit::Halt,
            EXIT_UNMAPPED_FETCH => EngineExit::UnmappedFetch(fault_addr),
            EXIT_UNMAPPED_READ => EngineExit::UnmappedRead(fault_addr),
            EXIT_UNMAPPED_WRITE => EngineExit::UnmappedWrite(fault_addr),
            EXIT_PROTECTION_FAULT => EngineExit::ProtectionFault(fault_addr),
            EXIT_ZERO_DIVISION => EngineExit::ZeroDivision,
            EXIT_NO_DECODE => EngineExit::NoDecode(fault_addr),
            EXIT_INTERRUPTED => EngineExit::Interrupted,
            _ => EngineExit::InternalError,
        }
    }
}

/// One flattened IR expression. Operand fields `a`..`d` hold expression
/// indices or immediate payloads depending on `kind`; `n` is the live
/// operand count for the variadic kinds.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct FfiIrExpr {
    /// 0 Get(a=offset, b=size), 1 GetI, 2 RdTmp(a), 3 Load(a=addr, b=size),
    /// 4 Const(a), 5 Unop(a), 6 Binop(a, b), 7 Triop(a, b, c),
    /// 8 Qop(a..d), 9 Ite(a=cond, b=true, c=false), 10 CCall(a.. per n),
    /// anything else Unknown.
    pub kind: u32,
    pub n: u32,
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

/// One flattened IR statement referencing expressions by index.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct FfiIrStmt {
    /// 0 IMark(a=addr, b=len), 1 WrTmp(a=tmp, b=value), 2 Put(a=offset,
    /// b=value), 3 PutI(a=value), 4 Store(a=addr, b=value),
    /// 5 StoreG(a=guard, b=addr, c=value), 6 LoadG(a=guard, b=tmp, c=addr),
    /// 7 Cas(a=addr), 8 Llsc(a=addr), 9 Dirty, 10 MemFence, 11 AbiHint,
    /// 12 NoOp, 13 Exit(a=guard, b=dst), anything else Unknown.
    pub kind: u32,
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

/// A lifted block as flat arrays. The host owns the arrays; they only need
/// to stay valid for the duration of the lift callback.
#[repr(C)]
pub struct FfiIrBlock {
    pub addr: u64,
    pub size: u32,
    /// 0 Boring, 1 Call, 2 Ret, 3 Syscall, 4 NoDecode, 5 Yield.
    pub jumpkind: u32,
    /// Index of the fall-through target expression.
    pub next_expr: u64,
    pub stmts: *const FfiIrStmt,
    pub stmt_count: u64,
    pub exprs: *const FfiIrExpr,
    pub expr_count: u64,
}

/// The lifter as a C function table. `lift` fills `out` and returns 0, or
/// nonzero when no translation exists.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct LifterVtable {
    pub ctx: *mut c_void,
    pub lift: unsafe extern "C" fn(
        ctx: *mut c_void,
        addr: u64,
        bytes: *const u8,
        len: u64,
        out: *mut FfiIrBlock,
    ) -> i32,
}

pub struct ExternLifter {
    vt: LifterVtable,
}

const MAX_EXPR_DEPTH: u32 = 256;

fn convert_expr(
    exprs: &[FfiIrExpr],
    index: u64,
    depth: u32,
    addr: Address,
) -> Result<IrExpr, LiftError> {
    if depth > MAX_EXPR_DEPTH {
        return Err(LiftError::Rejected {
            addr,
            reason: "expression tree too deep".into(),
        });
    }
    let expr = exprs
        .get(index as usize)
        .ok_or_else(|| LiftError::Rejected {
            addr,
            reason: format!("expression index {index} out of bounds"),
        })?;

    let child = |i: u64| convert_expr(exprs, i, depth + 1, addr);

    Ok(match expr.kind {
        0 => IrExpr::Get {
            offset: expr.a,
            size: expr.b as u8,
        },
        1 => IrExpr::GetI,
        2 => IrExpr::RdTmp(expr.a),
        3 => IrExpr::Load {
            addr: Box::new(child(expr.a)?),
            size: expr.b as u8,
        },
        4 => IrExpr::Const(expr.a),
        5 => IrExpr::Unop(Box::new(child(expr.a)?)),
        6 => IrExpr::Binop(Box::new(child(expr.a)?), Box::new(child(expr.b)?)),
        7 => IrExpr::Triop(
            Box::new(child(expr.a)?),
            Box::new(child(expr.b)?),
            Box::new(child(expr.c)?),
        ),
        8 => {
            let operands = [expr.a, expr.b, expr.c, expr.d];
            let mut args = Vec::with_capacity(4);
            for &operand in operands.iter().take((expr.n as usize).min(4)) {
                args.push(child(operand)?);
            }
            IrExpr::Qop(args)
        }
        9 => IrExpr::Ite {
            cond: Box::new(child(expr.a)?),
            if_true: Box::new(child(expr.b)?),
            if_false: Box::new(child(expr.c)?),
        },
        10 => {
            let operands = [expr.a, expr.b, expr.c, expr.d];
            let mut args = Vec::with_capacity(4);
            for &operand in operands.iter().take((expr.n as usize).min(4)) {
                args.push(child(operand)?);
            }
            IrExpr::CCall(args)
        }
        _ => IrExpr::Unknown,
    })
}

fn convert_block(raw: &FfiIrBlock) -> Result<IrBlock, LiftError> {
    // SAFETY: the lift callback promised stmt_count/expr_count elements.
    let stmts = unsafe { slice_or_empty(raw.stmts, raw.stmt_count) };
    let exprs = unsafe { slice_or_empty(raw.exprs, raw.expr_count) };

    let mut converted = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        let expr = |i: u64| convert_expr(exprs, i, 0, raw.addr);
        converted.push(match stmt.kind {
            0 => IrStmt::IMark {
                addr: stmt.a,
                len: stmt.b as u32,
            },
            1 => IrStmt::WrTmp {
                tmp: stmt.a,
                value: expr(stmt.b)?,
            },
            2 => IrStmt::Put {
                offset: stmt.a,
                value: expr(stmt.b)?,
            },
            3 => IrStmt::PutI { value: expr(stmt.a)? },
            4 => IrStmt::Store {
                addr: expr(stmt.a)?,
                value: expr(stmt.b)?,
            },
            5 => IrStmt::StoreG {
                guard: expr(stmt.a)?,
                addr: expr(stmt.b)?,
                value: expr(stmt.c)?,
            },
            6 => IrStmt::LoadG {
                guard: expr(stmt.a)?,
                tmp: stmt.b,
                addr: expr(stmt.c)?,
            },
            7 => IrStmt::Cas { addr: expr(stmt.a)? },
            8 => IrStmt::Llsc { addr: expr(stmt.a)? },
            9 => IrStmt::Dirty,
            10 => IrStmt::MemFence,
            11 => IrStmt::AbiHint,
            12 => IrStmt::NoOp,
            13 => IrStmt::Exit {
                guard: expr(stmt.a)?,
                dst: stmt.b,
            },
            _ => IrStmt::Unknown,
        });
    }

    Ok(IrBlock {
        addr: raw.addr,
        size: raw.size,
        stmts: converted,
        next: convert_expr(exprs, raw.next_expr, 0, raw.addr)?,
        jumpkind: match raw.jumpkind {
            0 => IrJumpKind::Boring,
            1 => IrJumpKind::Call,
            2 => IrJumpKind::Ret,
            3 => IrJumpKind::Syscall,
            4 => IrJumpKind::NoDecode,
            _ => IrJumpKind::Yield,
        },
    })
}

impl Lifter for ExternLifter {
    fn lift(&mut self, addr: Address, bytes: &[u8]) -> Result<IrBlock, LiftError> {
        let mut raw = FfiIrBlock {
            addr,
            size: bytes.len() as u32,
            jumpkind: 0,
            next_expr: 0,
            stmts: std::ptr::null(),
            stmt_count: 0,
            exprs: std::ptr::null(),
            expr_count: 0,
        };
        let rc = unsafe {
            (self.vt.lift)(self.vt.ctx, addr, bytes.as_ptr(), bytes.len() as u64, &mut raw)
        };
        if rc != 0 {
            return Err(LiftError::NoTranslation(addr));
        }
        convert_block(&raw)
    }
}

/// One node of the `sync` result list.
#[repr(C)]
pub struct MemUpdate {
    pub address: u64,
    pub length: u64,
    pub next: *mut MemUpdate,
}

/// Flat view of one block's symbolic instructions, for cross-language
/// transport. Pointers are owned by the controller and stay valid until the
/// next `concolic_start`.
#[repr(C)]
pub struct BlockDetailsRet {
    pub block_addr: u64,
    pub block_size: u64,
    pub symbolic_instrs: *const InstrDetails,
    pub symbolic_instrs_count: u64,
    pub register_values: *const RegisterValue,
    pub register_values_count: u64,
}

unsafe fn slice_or_empty<'a, T>(ptr: *const T, count: u64) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, count as usize)
    }
}

/// # Safety
/// `engine` and `lifter` must point to vtables whose callbacks stay valid
/// until `concolic_dealloc`.
#[no_mangle]
pub unsafe extern "C" fn concolic_alloc(
    engine: *const EngineVtable,
    lifter: *const LifterVtable,
    session_key: u64,
) -> *mut Handle {
    if engine.is_null() || lifter.is_null() {
        return std::ptr::null_mut();
    }
    let Some(engine) = ExternEngine::from_vtable(*engine) else {
        return std::ptr::null_mut();
    };
    let lifter = ExternLifter { vt: *lifter };
    Box::into_raw(Box::new(Controller::new(engine, lifter, session_key)))
}

/// # Safety
/// `handle` must have come from [concolic_alloc] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn concolic_dealloc(handle: *mut Handle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_hook(handle: *mut Handle) {
    (*handle).hook();
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_unhook(handle: *mut Handle) {
    (*handle).unhook();
}

/// Returns the stop reason of the finished run.
///
/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_start(handle: *mut Handle, pc: u64, step: u64) -> u32 {
    (*handle).start(pc, step).reason as u32
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_stop(handle: *mut Handle, reason: u32) {
    let reason = StopReason::from_raw(reason).unwrap_or(StopReason::Normal);
    (*handle).stop(reason);
}

/// # Safety
/// `handle` must be live; `stops` must hold `count` addresses.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_stops(handle: *mut Handle, count: u64, stops: *const u64) {
    (*handle).set_stops(slice_or_empty(stops, count));
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_tracking(
    handle: *mut Handle,
    track_bbls: bool,
    track_stack: bool,
) {
    (*handle).set_tracking(track_bbls, track_stack);
}

/// # Safety
/// `handle` must be live; `offsets` must hold `count` elements.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_artificial_registers(
    handle: *mut Handle,
    offsets: *const u64,
    count: u64,
) {
    (*handle).set_artificial_registers(slice_or_empty(offsets, count));
}

/// # Safety
/// `handle` must be live; both arrays must hold `count` elements.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_vex_offset_to_register_size_mapping(
    handle: *mut Handle,
    offsets: *const u64,
    sizes: *const u64,
    count: u64,
) {
    (*handle).set_register_sizes(slice_or_empty(offsets, count), slice_or_empty(sizes, count));
}

/// # Safety
/// `handle` must be live; both arrays must hold `count` elements.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_vex_to_engine_reg_mappings(
    handle: *mut Handle,
    vex_offsets: *const u64,
    engine_ids: *const u64,
    count: u64,
) {
    (*handle).set_reg_to_engine_mappings(
        slice_or_empty(vex_offsets, count),
        slice_or_empty(engine_ids, count),
    );
}

/// # Safety
/// `handle` must be live; both arrays must hold `count` elements.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_vex_sub_reg_to_reg_mappings(
    handle: *mut Handle,
    sub_offsets: *const u64,
    parent_offsets: *const u64,
    count: u64,
) {
    (*handle).set_sub_reg_mappings(
        slice_or_empty(sub_offsets, count),
        slice_or_empty(parent_offsets, count),
    );
}

/// # Safety
/// `handle` must be live; both arrays must hold `count` elements.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_cpu_flags_details(
    handle: *mut Handle,
    flag_vex_ids: *const u64,
    bitmasks: *const u64,
    count: u64,
) {
    (*handle).set_cpu_flags_details(
        slice_or_empty(flag_vex_ids, count),
        slice_or_empty(bitmasks, count),
    );
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_engine_flags_register_id(handle: *mut Handle, id: i64) {
    if id >= 0 {
        (*handle).set_flags_register_id(id as u64);
    }
}

/// # Safety
/// `handle` must be live; `offsets` must hold `count` elements.
#[no_mangle]
pub unsafe extern "C" fn concolic_set_register_blacklist(
    handle: *mut Handle,
    offsets: *const u64,
    count: u64,
) {
    (*handle).set_register_blacklist(slice_or_empty(offsets, count));
}

/// Returns false when `guest_arch` does not name a supported architecture.
///
/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_enable_symbolic_reg_tracking(
    handle: *mut Handle,
    guest_arch: u32,
) -> bool {
    match GuestArch::from_raw(guest_arch) {
        Some(arch) => {
            (*handle).enable_symbolic_reg_tracking(arch);
            true
        }
        None => false,
    }
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_disable_symbolic_reg_tracking(handle: *mut Handle) {
    (*handle).disable_symbolic_reg_tracking();
}

/// # Safety
/// `handle` must be live; `offsets` must hold `count` elements.
#[no_mangle]
pub unsafe extern "C" fn concolic_symbolic_register_data(
    handle: *mut Handle,
    count: u64,
    offsets: *const u64,
) {
    (*handle).set_symbolic_register_data(slice_or_empty(offsets, count));
}

/// Writes the symbolic register offsets into `output` and returns how many
/// were written.
///
/// # Safety
/// `handle` must be live; `output` must have room for every symbolic
/// register.
#[no_mangle]
pub unsafe extern "C" fn concolic_get_symbolic_registers(
    handle: *mut Handle,
    output: *mut u64,
) -> u64 {
    let offsets = (*handle).symbolic_registers();
    for (i, offset) in offsets.iter().enumerate() {
        *output.add(i) = *offset;
    }
    offsets.len() as u64
}

/// # Safety
/// `handle` must be live; `bytes` must hold `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn concolic_cache_page(
    handle: *mut Handle,
    addr: u64,
    length: u64,
    bytes: *const u8,
    permissions: u64,
) -> bool {
    (*handle).cache_page(addr, slice_or_empty(bytes, length), permissions)
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_uncache_pages_touching_region(
    handle: *mut Handle,
    addr: u64,
    length: u64,
) {
    (*handle).uncache_pages_touching_region(addr, length);
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_wipe_page_from_cache(handle: *mut Handle, addr: u64) {
    (*handle).wipe_page_from_cache(addr);
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_clear_page_cache(handle: *mut Handle) {
    (*handle).clear_page_cache();
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_in_cache(handle: *mut Handle, addr: u64) -> bool {
    (*handle).in_cache(addr)
}

/// Activate shadow pages for the range, OR-ing in `taint` bytes when
/// non-null.
///
/// # Safety
/// `handle` must be live; `taint`, when non-null, must hold `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn concolic_activate(
    handle: *mut Handle,
    addr: u64,
    length: u64,
    taint: *const u8,
) {
    let taint = if taint.is_null() {
        None
    } else {
        Some(slice_or_empty(taint, length))
    };
    (*handle).activate(addr, length, taint);
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_bbl_addrs(handle: *mut Handle) -> *const u64 {
    (*handle).bbl_addrs().as_ptr()
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_bbl_addr_count(handle: *mut Handle) -> u64 {
    (*handle).bbl_addrs().len() as u64
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_stack_pointers(handle: *mut Handle) -> *const u64 {
    (*handle).stack_pointers().as_ptr()
}

/// Drains one executed page base per call; u64::MAX once exhausted.
///
/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_executed_pages(handle: *mut Handle) -> u64 {
    (*handle).next_executed_page().unwrap_or(u64::MAX)
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_syscall_count(handle: *mut Handle) -> u64 {
    (*handle).syscall_count()
}

/// Number of basic blocks stepped in the last run.
///
/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_step(handle: *mut Handle) -> u64 {
    (*handle).step_count()
}

/// Returns the committed byte ranges of the last run as a linked list the
/// caller must release with [concolic_destroy].
///
/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_sync(handle: *mut Handle) -> *mut MemUpdate {
    let mut head: *mut MemUpdate = std::ptr::null_mut();
    for (address, length) in (*handle).sync().into_iter().rev() {
        head = Box::into_raw(Box::new(MemUpdate {
            address,
            length,
            next: head,
        }));
    }
    head
}

/// # Safety
/// `head` must be a list returned by [concolic_sync], not yet destroyed.
#[no_mangle]
pub unsafe extern "C" fn concolic_destroy(head: *mut MemUpdate) {
    let mut node = head;
    while !node.is_null() {
        let boxed = Box::from_raw(node);
        node = boxed.next;
    }
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_get_stop_details(handle: *mut Handle) -> StopDetails {
    (*handle).stop_details()
}

/// # Safety
/// `handle` must be a live controller.
#[no_mangle]
pub unsafe extern "C" fn concolic_get_count_of_blocks_with_symbolic_instrs(
    handle: *mut Handle,
) -> u64 {
    (*handle).blocks_with_symbolic_instrs().len() as u64
}

/// Fill `out` with one record per block carrying symbolic instructions. The
/// embedded pointers stay valid until the next `concolic_start`.
///
/// # Safety
/// `handle` must be live; `out` must have room for
/// [concolic_get_count_of_blocks_with_symbolic_instrs] records.
#[no_mangle]
pub unsafe extern "C" fn concolic_get_details_of_blocks_with_symbolic_instrs(
    handle: *mut Handle,
    out: *mut BlockDetailsRet,
) {
    for (i, block) in (*handle).blocks_with_symbolic_instrs().iter().enumerate() {
        *out.add(i) = BlockDetailsRet {
            block_addr: block.block_addr,
            block_size: block.block_size,
            symbolic_instrs: block.symbolic_instrs.as_ptr(),
            symbolic_instrs_count: block.symbolic_instrs.len() as u64,
            register_values: block.register_values.as_ptr(),
            register_values_count: block.register_values.len() as u64,
        };
    }
}
