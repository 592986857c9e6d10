//! The execution controller: drives the engine block by block, feeds the
//! taint machinery from the engine's hooks, and decides at every stop
//! whether the in-flight block commits or rewinds to its entry state.

use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;
use log::{debug, trace, warn};

use crate::arch::ArchConfig;
use crate::cache::{session_cache, PageCache};
use crate::engine::{
    Engine, EngineExit, EngineState, RunHooks, UnmappedKind, MAX_MEM_ACCESS_BYTES,
};
use crate::ir::{Address, Lifter, RegOffset};
use crate::mem::{page_base, ShadowMemory, WriteJournal, PAGE_SIZE};
use crate::propagate::InstrSliceDetails;
use crate::stop::{StopDetails, StopReason};
use crate::taint::{
    BlockDetails, BlockTaintEntry, InstrDetails, MemReadResult, RegisterValue, TaintState,
};

/// Largest basic block the analyzer accepts, in guest bytes.
pub const MAX_BLOCK_SIZE: u32 = 800;

/// One controller bound to an engine and a lifter. All taint bookkeeping
/// lives in [ControllerState] so the engine can be borrowed for a run while
/// the state receives the hooks.
pub struct Controller<E: Engine, L: Lifter> {
    engine: E,
    state: ControllerState<L>,
}

pub(crate) struct ControllerState<L: Lifter> {
    pub(crate) lifter: L,
    pub(crate) config: ArchConfig,

    pub(crate) shadow: ShadowMemory,
    pub(crate) journal: WriteJournal,
    pub(crate) page_cache: Arc<Mutex<PageCache>>,
    pub(crate) block_taint_cache: FxHashMap<Address, Rc<BlockTaintEntry>>,
    pub(crate) taint: TaintState,

    // In-flight block.
    pub(crate) block_details: BlockDetails,
    pub(crate) block_in_flight: bool,
    pub(crate) propagation_disabled_for_block: bool,
    pub(crate) cur_block_entry: Option<Rc<BlockTaintEntry>>,
    pub(crate) taint_next_instr: Option<Address>,
    pub(crate) mem_read_pending_instr: Option<Address>,
    pub(crate) mem_reads_map: FxHashMap<Address, MemReadResult>,
    pub(crate) mem_writes_taint_map: FxHashMap<Address, bool>,
    pub(crate) reg_instr_slice: FxHashMap<RegOffset, Vec<InstrDetails>>,
    pub(crate) instr_slice_details: FxHashMap<Address, InstrSliceDetails>,
    pub(crate) block_start_reg_values: FxHashMap<RegOffset, RegisterValue>,
    pub(crate) flags_entry_value: Option<[u8; 8]>,

    // Run state.
    pub(crate) hooked: bool,
    pub(crate) stopped: bool,
    pub(crate) stop_finalized: bool,
    pub(crate) stop_details: StopDetails,
    pub(crate) cur_steps: u64,
    pub(crate) max_steps: u64,
    pub(crate) stop_points: BTreeSet<Address>,
    pub(crate) bbl_addrs: Vec<Address>,
    pub(crate) stack_pointers: Vec<Address>,
    pub(crate) executed_pages: BTreeSet<Address>,
    pub(crate) syscall_count: u64,
    pub(crate) blocks_with_symbolic_instrs: Vec<BlockDetails>,
    pub(crate) track_bbls: bool,
    pub(crate) track_stack: bool,
    pub(crate) selfmod_pending: Option<(Address, u64)>,
    pub(crate) pending_reentry: Option<Address>,
    pub(crate) ignore_next_oversize: bool,
    pub(crate) halt_for_reentry: bool,
}

impl<E: Engine, L: Lifter> Controller<E, L> {
    /// Bind a controller to an engine and lifter. Controllers allocated with
    /// the same session key share one page cache.
    pub fn new(engine: E, lifter: L, session_key: u64) -> Self {
        Self {
            engine,
            state: ControllerState {
                lifter,
                config: ArchConfig::default(),
                shadow: ShadowMemory::default(),
                journal: WriteJournal::default(),
                page_cache: session_cache(session_key),
                block_taint_cache: FxHashMap::default(),
                taint: TaintState::default(),
                block_details: BlockDetails::default(),
                block_in_flight: false,
                propagation_disabled_for_block: false,
                cur_block_entry: None,
                taint_next_instr: None,
                mem_read_pending_instr: None,
                mem_reads_map: FxHashMap::default(),
                mem_writes_taint_map: FxHashMap::default(),
                reg_instr_slice: FxHashMap::default(),
                instr_slice_details: FxHashMap::default(),
                block_start_reg_values: FxHashMap::default(),
                flags_entry_value: None,
                hooked: false,
                stopped: false,
                stop_finalized: false,
                stop_details: StopDetails::default(),
                cur_steps: 0,
                max_steps: 0,
                stop_points: BTreeSet::new(),
                bbl_addrs: Vec::new(),
                stack_pointers: Vec::new(),
                executed_pages: BTreeSet::new(),
                syscall_count: 0,
                blocks_with_symbolic_instrs: Vec::new(),
                track_bbls: true,
                track_stack: true,
                selfmod_pending: None,
                pending_reentry: None,
                ignore_next_oversize: false,
                halt_for_reentry: false,
            },
        }
    }

    pub fn hook(&mut self) {
        self.state.hooked = true;
    }

    pub fn unhook(&mut self) {
        self.state.hooked = false;
    }

    /// Run the engine from `pc` for at most `max_steps` basic blocks and
    /// report how the run ended.
    pub fn start(&mut self, pc: Address, max_steps: u64) -> StopDetails {
        if !self.state.hooked {
            self.state.stop_details = StopDetails {
                reason: StopReason::NoStart,
                block_addr: pc,
                block_size: 0,
            };
            return self.state.stop_details;
        }

        self.state.begin_run(max_steps);
        debug!("starting engine at {pc:#x} for {max_steps} steps");

        let mut entry_pc = pc;
        let exit = loop {
            let exit = self.engine.run(entry_pc, &mut self.state);
            if let Some(next) = self.state.pending_reentry.take() {
                self.state.halt_for_reentry = false;
                trace!("re-entering engine at {next:#x}");
                entry_pc = next;
                continue;
            }
            break exit;
        };

        let state = &mut self.state;
        if !state.stopped {
            match exit {
                EngineExit::Completed => {
                    state.finalize_block();
                    state.record_stop(StopReason::Normal);
                }
                EngineExit::Halt => {
                    state.finalize_block();
                    state.record_stop(StopReason::Hlt);
                }
                EngineExit::ZeroDivision => {
                    state.record_stop(StopReason::ZeroDiv);
                }
                EngineExit::NoDecode(_) => {
                    state.record_stop(StopReason::NoDecode);
                }
                EngineExit::InternalError => {
                    state.record_stop(StopReason::Error);
                }
                EngineExit::UnmappedFetch(_) => {
                    state.record_stop(if state.cur_steps == 0 {
                        StopReason::NoStart
                    } else {
                        StopReason::ExecNone
                    });
                }
                EngineExit::UnmappedRead(_)
                | EngineExit::UnmappedWrite(_)
                | EngineExit::ProtectionFault(_) => {
                    state.record_stop(StopReason::Segfault);
                }
                EngineExit::Interrupted => {
                    // A host-requested stop with no reason recorded yet.
                    state.record_stop(StopReason::Normal);
                }
            }
        }
        state.finalize_stop(&mut self.engine);
        debug!("run ended: {:?}", state.stop_details);
        state.stop_details
    }

    /// Cooperatively stop the run; the engine halts at the next hook edge and
    /// the commit/rollback decision is made when control returns.
    pub fn stop(&mut self, reason: StopReason) {
        self.state.record_stop(reason);
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn lifter(&self) -> &L {
        &self.state.lifter
    }

    // Configuration. Every setter replaces the previous table wholesale so
    // repeated calls with the same arguments are idempotent.

    pub fn set_stops(&mut self, stops: &[Address]) {
        self.state.stop_points = stops.iter().copied().collect();
    }

    pub fn set_tracking(&mut self, track_bbls: bool, track_stack: bool) {
        self.state.track_bbls = track_bbls;
        self.state.track_stack = track_stack;
    }

    pub fn set_artificial_registers(&mut self, offsets: &[RegOffset]) {
        self.state.config.artificial_regs = offsets.iter().copied().collect();
    }

    pub fn set_register_sizes(&mut self, offsets: &[RegOffset], sizes: &[u64]) {
        self.state.config.reg_sizes = offsets.iter().copied().zip(sizes.iter().copied()).collect();
    }

    pub fn set_reg_to_engine_mappings(&mut self, offsets: &[RegOffset], engine_ids: &[u64]) {
        self.state.config.reg_to_engine = offsets
            .iter()
            .copied()
            .zip(engine_ids.iter().copied())
            .collect();
    }

    pub fn set_sub_reg_mappings(&mut self, sub_offsets: &[RegOffset], parents: &[RegOffset]) {
        self.state.config.sub_reg_map = sub_offsets
            .iter()
            .copied()
            .zip(parents.iter().copied())
            .collect();
    }

    pub fn set_cpu_flags_details(&mut self, offsets: &[RegOffset], bitmasks: &[u64]) {
        self.state.config.cpu_flags = offsets
            .iter()
            .copied()
            .zip(bitmasks.iter().copied())
            .collect();
    }

    pub fn set_flags_register_id(&mut self, id: u64) {
        self.state.config.flags_register_id = Some(id);
    }

    pub fn set_register_blacklist(&mut self, offsets: &[RegOffset]) {
        self.state.config.blacklist = offsets.iter().copied().collect();
    }

    pub fn enable_symbolic_reg_tracking(&mut self, arch: crate::arch::GuestArch) {
        self.state.config.guest_arch = Some(arch);
    }

    pub fn disable_symbolic_reg_tracking(&mut self) {
        self.state.config.guest_arch = None;
    }

    /// Seed the registers that are symbolic before the run begins.
    pub fn set_symbolic_register_data(&mut self, offsets: &[RegOffset]) {
        for &offset in offsets {
            let full = self.state.config.full_register_offset(offset);
            self.state.taint.mark_register_symbolic(full, false);
        }
    }

    // Memory.

    pub fn cache_page(&mut self, addr: Address, bytes: &[u8], perms: u64) -> bool {
        let cache = self.state.page_cache.clone();
        let mut cache = cache.lock().expect("page cache poisoned");
        match cache.cache_page(addr, bytes, perms) {
            Ok(_) => true,
            Err(err) => {
                warn!("cache_page({addr:#x}) rejected: {err}");
                false
            }
        }
    }

    pub fn uncache_pages_touching_region(&mut self, addr: Address, len: u64) {
        self.state
            .page_cache
            .lock()
            .expect("page cache poisoned")
            .uncache_pages_touching_region(addr, len);
    }

    pub fn wipe_page_from_cache(&mut self, addr: Address) {
        self.state
            .page_cache
            .lock()
            .expect("page cache poisoned")
            .wipe_page(addr);
    }

    pub fn clear_page_cache(&mut self) {
        self.state
            .page_cache
            .lock()
            .expect("page cache poisoned")
            .clear();
    }

    pub fn in_cache(&self, addr: Address) -> bool {
        self.state
            .page_cache
            .lock()
            .expect("page cache poisoned")
            .in_cache(addr)
    }

    /// Map cached bytes covering `[addr, addr + size)` into the engine.
    pub fn map_cache(&mut self, addr: Address, size: u64) -> bool {
        let cache = self.state.page_cache.clone();
        let cache = cache.lock().expect("page cache poisoned");
        cache.map_cache(&mut self.engine, addr, size)
    }

    /// Activate shadow pages for `[addr, addr + len)`, OR-ing in `taint`.
    pub fn activate(&mut self, addr: Address, len: u64, taint: Option<&[u8]>) {
        self.state.shadow.activate_region(addr, len, taint);
    }

    // Queries.

    pub fn bbl_addrs(&self) -> &[Address] {
        &self.state.bbl_addrs
    }

    pub fn stack_pointers(&self) -> &[Address] {
        &self.state.stack_pointers
    }

    /// Drain-style retrieval: each call returns one executed page base until
    /// the set is exhausted.
    pub fn next_executed_page(&mut self) -> Option<Address> {
        self.state.executed_pages.pop_first()
    }

    pub fn syscall_count(&self) -> u64 {
        self.state.syscall_count
    }

    /// Number of basic blocks stepped in the last run.
    pub fn step_count(&self) -> u64 {
        self.state.cur_steps
    }

    pub fn stop_details(&self) -> StopDetails {
        self.state.stop_details
    }

    /// The currently symbolic registers, sorted for stable iteration.
    pub fn symbolic_registers(&self) -> Vec<RegOffset> {
        let mut offsets: Vec<RegOffset> =
            self.state.taint.symbolic_registers().iter().copied().collect();
        offsets.sort_unstable();
        offsets
    }

    pub fn blocks_with_symbolic_instrs(&self) -> &[BlockDetails] {
        &self.state.blocks_with_symbolic_instrs
    }

    /// Coalesced byte ranges written and committed during the last run; the
    /// host copies these out of engine memory.
    pub fn sync(&self) -> Vec<(Address, u64)> {
        self.state.journal.committed_ranges()
    }

    /// Address of the first tainted byte in `[addr, addr + len)`, if any.
    pub fn find_tainted(&self, addr: Address, len: u64) -> Option<Address> {
        self.state.shadow.find_tainted(addr, len)
    }
}

impl<L: Lifter> ControllerState<L> {
    fn begin_run(&mut self, max_steps: u64) {
        self.stopped = false;
        self.stop_finalized = false;
        self.stop_details = StopDetails::default();
        self.cur_steps = 0;
        self.max_steps = if max_steps == 0 { u64::MAX } else { max_steps };
        self.bbl_addrs.clear();
        self.stack_pointers.clear();
        self.executed_pages.clear();
        self.syscall_count = 0;
        self.blocks_with_symbolic_instrs.clear();
        self.journal.clear_committed_ranges();
        self.block_details.reset();
        self.block_in_flight = false;
        self.selfmod_pending = None;
        self.pending_reentry = None;
        self.ignore_next_oversize = false;
        self.halt_for_reentry = false;
        self.clear_block_propagation_state();
    }

    fn clear_block_propagation_state(&mut self) {
        self.propagation_disabled_for_block = false;
        self.cur_block_entry = None;
        self.taint_next_instr = None;
        self.mem_read_pending_instr = None;
        self.mem_reads_map.clear();
        self.mem_writes_taint_map.clear();
        self.reg_instr_slice.clear();
        self.instr_slice_details.clear();
        self.block_start_reg_values.clear();
        self.flags_entry_value = None;
    }

    /// Record the stop reason; the engine halts at the next hook edge.
    /// Returns false when a reason was already recorded.
    pub(crate) fn record_stop(&mut self, reason: StopReason) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        self.stop_details = StopDetails {
            reason,
            block_addr: self.block_details.block_addr,
            block_size: self.block_details.block_size,
        };
        trace!("stop recorded: {reason:?} at {:#x}", self.block_details.block_addr);
        true
    }

    /// Apply the commit/rollback policy for the recorded stop. Idempotent.
    pub(crate) fn finalize_stop(&mut self, state: &mut dyn EngineState) {
        if self.stop_finalized {
            return;
        }
        self.stop_finalized = true;

        if !self.block_in_flight {
            return;
        }
        self.block_in_flight = false;

        if self.stop_details.reason.requires_rollback() {
            self.publish_block_details();
            self.rollback_block(state);
        } else {
            self.commit_block();
        }
    }

    /// Full stop from inside a hook: record and immediately finalize.
    pub(crate) fn stop(&mut self, state: &mut dyn EngineState, reason: StopReason) {
        if self.record_stop(reason) {
            self.finalize_stop(state);
        }
    }

    /// A rewound block always reports what it accumulated (plus a lift
    /// failure marker) so the host can replay exactly the reported slice.
    fn publish_block_details(&mut self) {
        if !self.block_details.symbolic_instrs.is_empty() || self.block_details.vex_lift_failed {
            self.blocks_with_symbolic_instrs.push(self.block_details.clone());
        }
    }

    /// Commit the block that just finished: apply the journal, fold the
    /// block-level register taint into the persistent set, and publish the
    /// block's symbolic instructions if it produced any.
    fn commit_block(&mut self) {
        self.journal.commit(&mut self.shadow);
        self.taint.commit_block();
        if !self.block_details.symbolic_instrs.is_empty() {
            self.blocks_with_symbolic_instrs.push(self.block_details.clone());
        }
    }

    /// Rewind the in-flight block: restore taint shadow and register taint to
    /// their block-entry state and put the engine's registers back where the
    /// block started. Engine memory contents are never touched.
    fn rollback_block(&mut self, state: &mut dyn EngineState) {
        self.journal.rollback(&mut self.shadow);
        self.taint.rollback_block();

        for (offset, snapshot) in &self.block_start_reg_values {
            if let Some(&engine_id) = self.config.reg_to_engine.get(offset) {
                let size = self.config.register_size(*offset).min(32) as usize;
                if let Err(err) = state.write_register(engine_id, &snapshot.value[..size]) {
                    warn!("rollback failed to restore register {offset:#x}: {err}");
                }
            }
        }
        if let (Some(flags_id), Some(raw)) = (self.config.flags_register_id, self.flags_entry_value)
        {
            if let Err(err) = state.write_register(flags_id, &raw) {
                warn!("rollback failed to restore flags register: {err}");
            }
        }

        let pc_reg = state.arch().pc_engine_reg();
        let pc_bytes = self.block_details.block_addr.to_le_bytes();
        let width = state.arch().pointer_bytes();
        if let Err(err) = state.write_register(pc_reg, &pc_bytes[..width]) {
            warn!("rollback failed to rewind program counter: {err}");
        }
        debug!(
            "rolled back block {:#x}+{:#x}",
            self.block_details.block_addr, self.block_details.block_size
        );
    }

    /// Close out a block that ran to its boundary without a stop.
    fn finalize_block(&mut self) {
        if !self.block_in_flight {
            return;
        }
        self.block_in_flight = false;
        self.commit_block();
    }

    fn invalidate_self_modified(&mut self, addr: Address, len: u64) {
        self.page_cache
            .lock()
            .expect("page cache poisoned")
            .uncache_pages_touching_region(addr, len);

        let start_page = page_base(addr);
        let end = addr.saturating_add(len);
        self.block_taint_cache.retain(|&block_addr, _| {
            !(block_addr >= start_page && block_addr < page_base(end) + PAGE_SIZE as u64)
        });
        debug!("invalidated caches for self-modified range {addr:#x}+{len:#x}");
    }
}

impl<L: Lifter> RunHooks for ControllerState<L> {
    fn on_block(&mut self, state: &mut dyn EngineState, addr: u64, size: u32) {
        if self.stopped || self.halt_for_reentry {
            return;
        }

        self.finalize_block();

        if let Some((write_addr, write_len)) = self.selfmod_pending.take() {
            self.invalidate_self_modified(write_addr, write_len);
        }

        self.block_details.reset();
        self.block_details.block_addr = addr;
        self.block_details.block_size = size as u64;
        self.clear_block_propagation_state();

        if self.cur_steps >= self.max_steps {
            self.stop(state, StopReason::Normal);
            return;
        }
        if page_base(addr) == 0 {
            self.stop(state, StopReason::ZeroPage);
            return;
        }
        if self.stop_points.contains(&addr) {
            self.stop(state, StopReason::StopPoint);
            return;
        }

        // Oversized engine blocks are not lifted; halt and re-enter so the
        // engine regenerates the block at its natural boundary.
        if size > MAX_BLOCK_SIZE && !self.ignore_next_oversize {
            self.ignore_next_oversize = true;
            self.pending_reentry = Some(addr);
            self.halt_for_reentry = true;
            trace!("block {addr:#x} exceeds {MAX_BLOCK_SIZE} bytes, re-entering");
            return;
        }
        let oversize = size > MAX_BLOCK_SIZE;
        if oversize {
            self.ignore_next_oversize = false;
        }

        self.block_in_flight = true;
        self.cur_steps += 1;

        if self.track_bbls {
            self.bbl_addrs.push(addr);
        }
        if self.track_stack {
            let sp_reg = state.arch().sp_engine_reg();
            let mut raw = [0u8; 8];
            let width = state.arch().pointer_bytes();
            if state.read_register(sp_reg, &mut raw[..width]).is_ok() {
                self.stack_pointers.push(u64::from_le_bytes(raw));
            }
        }
        let mut page = page_base(addr);
        while page < addr + size as u64 {
            self.executed_pages.insert(page);
            page += PAGE_SIZE as u64;
        }

        self.snapshot_block_entry_registers(state);

        if oversize {
            self.propagation_disabled_for_block = true;
            return;
        }
        self.start_propagating_taint(state, addr, size);
    }

    fn on_mem_read(&mut self, state: &mut dyn EngineState, addr: u64, size: u8) {
        if self.stopped || self.halt_for_reentry || !self.block_in_flight {
            return;
        }

        if !self.config.tracking_enabled() {
            if self.shadow.find_tainted(addr, size as u64).is_some() {
                self.stop(state, StopReason::SymbolicReadSymbolicTrackingDisabled);
            }
            return;
        }
        if self.propagation_disabled_for_block {
            if self.shadow.find_tainted(addr, size as u64).is_some() {
                self.stop(state, StopReason::VexLiftFailed);
            }
            return;
        }

        let Some(instr_addr) = self.mem_read_pending_instr else {
            self.stop(state, StopReason::UnknownMemoryRead);
            return;
        };
        if self.mem_reads_map.contains_key(&instr_addr) {
            self.stop(state, StopReason::MultipleMemoryReads);
            return;
        }
        if size as usize > MAX_MEM_ACCESS_BYTES {
            self.stop(state, StopReason::UnknownMemoryRead);
            return;
        }

        let mut value = [0u8; MAX_MEM_ACCESS_BYTES];
        if state.read_memory(addr, &mut value[..size as usize]).is_err() {
            self.stop(state, StopReason::Error);
            return;
        }
        let is_value_symbolic = self.shadow.find_tainted(addr, size as u64).is_some();
        self.mem_reads_map.insert(
            instr_addr,
            MemReadResult {
                address: addr,
                value,
                size,
                is_value_symbolic,
            },
        );
        trace!(
            "read {size} bytes at {addr:#x} for instr {instr_addr:#x} (symbolic: {is_value_symbolic})"
        );

        self.propagate_taint_of_mem_read_instr(state, instr_addr);
    }

    fn on_mem_write(&mut self, state: &mut dyn EngineState, addr: u64, size: u8, value: u64) {
        if self.stopped || self.halt_for_reentry || !self.block_in_flight {
            return;
        }

        // Writes into the executing block's bytes invalidate caches at the
        // next block fetch.
        let block_start = self.block_details.block_addr;
        let block_end = block_start + self.block_details.block_size;
        if addr < block_end && addr + size as u64 > block_start {
            let merged = match self.selfmod_pending {
                Some((prev_addr, prev_len)) => {
                    let start = prev_addr.min(addr);
                    let end = (prev_addr + prev_len).max(addr + size as u64);
                    (start, end - start)
                }
                None => (addr, size as u64),
            };
            self.selfmod_pending = Some(merged);
        }

        let is_symbolic = if !self.config.tracking_enabled() || self.propagation_disabled_for_block
        {
            false
        } else {
            let pc_reg = state.arch().pc_engine_reg();
            let mut raw = [0u8; 8];
            let width = state.arch().pointer_bytes();
            if state.read_register(pc_reg, &mut raw[..width]).is_err() {
                self.stop(state, StopReason::UnknownMemoryWrite);
                return;
            }
            let instr_addr = u64::from_le_bytes(raw);
            match self.mem_writes_taint_map.get(&instr_addr) {
                Some(&is_symbolic) => is_symbolic,
                None => {
                    self.stop(state, StopReason::UnknownMemoryWrite);
                    return;
                }
            }
        };

        let bytes = value.to_le_bytes();
        let size = (size as usize).min(MAX_MEM_ACCESS_BYTES);
        if !self
            .journal
            .log_write(&mut self.shadow, addr, &bytes[..size], is_symbolic)
        {
            self.stop(state, StopReason::UnknownMemoryWrite);
        }
    }

    fn on_unmapped(
        &mut self,
        state: &mut dyn EngineState,
        kind: UnmappedKind,
        addr: u64,
        size: u64,
    ) -> bool {
        if self.stopped || self.halt_for_reentry {
            return false;
        }

        let cache = self.page_cache.clone();
        let resolved = cache
            .lock()
            .expect("page cache poisoned")
            .map_cache(state, addr, size.max(1));
        if resolved {
            trace!("resolved {kind:?} fault at {addr:#x} from page cache");
            return true;
        }

        let reason = match kind {
            UnmappedKind::Fetch if self.cur_steps == 0 => StopReason::NoStart,
            UnmappedKind::Fetch => StopReason::ExecNone,
            UnmappedKind::Read | UnmappedKind::Write => StopReason::Segfault,
        };
        self.stop(state, reason);
        false
    }

    fn on_interrupt(&mut self, state: &mut dyn EngineState, intno: u32) {
        if self.stopped || self.halt_for_reentry {
            return;
        }
        trace!("interrupt {intno} treated as syscall");
        self.syscall_count += 1;
        self.stop(state, StopReason::Syscall);
    }

    fn stop_requested(&self) -> bool {
        self.stopped || self.halt_for_reentry
    }
}
