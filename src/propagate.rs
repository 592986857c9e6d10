//! Per-instruction taint propagation and slice building.
//!
//! Propagation runs ahead of the engine: when a block hook fires, every
//! instruction of the block is resolved in order until one reads memory,
//! where the concrete address is only known once the engine's read hook
//! delivers it. The read hook then resumes the walk. Sinks are resolved in
//! the analyzer's listed order so later instructions observe earlier taint
//! updates, and sources are evaluated before their sink is touched so a
//! read-modify-write sees the register's previous taint.

use std::collections::BTreeSet;
use std::ops::Bound;

use fxhash::FxHashSet;
use log::trace;

use crate::analyzer::analyze_block;
use crate::controller::ControllerState;
use crate::engine::EngineState;
use crate::ir::{Address, Lifter, RegOffset};
use crate::stop::StopReason;
use crate::taint::{
    BlockTaintEntry, InstrDetails, InstructionTaintEntry, MemoryValue, RegisterValue, TaintEntity,
    TaintStatus,
};

/// The dependency closure of one instruction: the earlier in-block
/// instructions that produce values it consumes, and the registers whose
/// block-entry value must be snapshotted because nothing in the block
/// produces them.
#[derive(Debug, Default, Clone)]
pub(crate) struct InstrSliceDetails {
    pub(crate) dependent_instrs: BTreeSet<InstrDetails>,
    pub(crate) concrete_registers: FxHashSet<RegOffset>,
}

impl<L: Lifter> ControllerState<L> {
    /// Snapshot every mapped register (and the CPU flag bits) at block
    /// entry. The snapshots double as the slice builder's concrete values
    /// and the restore source for rollback.
    pub(crate) fn snapshot_block_entry_registers(&mut self, state: &mut dyn EngineState) {
        self.block_start_reg_values.clear();
        self.flags_entry_value = None;

        for (&offset, &engine_id) in &self.config.reg_to_engine {
            let size = self.config.register_size(offset).min(32) as usize;
            let mut snapshot = RegisterValue {
                offset,
                ..Default::default()
            };
            if state.read_register(engine_id, &mut snapshot.value[..size]).is_ok() {
                self.block_start_reg_values.insert(offset, snapshot);
            }
        }

        if let Some(flags_id) = self.config.flags_register_id {
            let mut raw = [0u8; 8];
            if state.read_register(flags_id, &mut raw).is_ok() {
                self.flags_entry_value = Some(raw);
                let flags = u64::from_le_bytes(raw);
                for (&offset, &mask) in &self.config.cpu_flags {
                    let mut snapshot = RegisterValue {
                        offset,
                        ..Default::default()
                    };
                    snapshot.value[..8].copy_from_slice(&(flags & mask).to_le_bytes());
                    self.block_start_reg_values.insert(offset, snapshot);
                }
            }
        }
    }

    /// Lift and analyze the block (or reuse the memoized entry) and resolve
    /// as many instructions as possible before the engine starts executing.
    pub(crate) fn start_propagating_taint(
        &mut self,
        state: &mut dyn EngineState,
        addr: Address,
        size: u32,
    ) {
        if !self.config.tracking_enabled() {
            return;
        }

        let cached = self.block_taint_cache.get(&addr).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => {
                let mut bytes = vec![0u8; size as usize];
                if state.read_memory(addr, &mut bytes).is_err() {
                    self.disable_propagation_for_block(state);
                    return;
                }
                match self.lifter.lift(addr, &bytes) {
                    Ok(block) => {
                        let entry = std::rc::Rc::new(analyze_block(&block));
                        self.block_taint_cache.insert(addr, entry.clone());
                        entry
                    }
                    Err(err) => {
                        trace!("lift failed for block {addr:#x}: {err}");
                        self.disable_propagation_for_block(state);
                        return;
                    }
                }
            }
        };

        if let Some(reason) = entry.unsupported {
            self.stop(state, reason);
            return;
        }

        self.taint_next_instr = entry.instr_entries.keys().next().copied();
        self.cur_block_entry = Some(entry);
        self.propagate_taints(state);
    }

    /// Lift failure: run the block without taint propagation. Safe only
    /// while no symbolic state is live.
    fn disable_propagation_for_block(&mut self, state: &mut dyn EngineState) {
        self.block_details.vex_lift_failed = true;
        self.propagation_disabled_for_block = true;
        if self.taint.any_symbolic_registers() {
            self.stop(state, StopReason::VexLiftFailed);
        }
    }

    /// Walk unresolved instructions in address order, pausing at a memory
    /// read whose result has not arrived yet.
    pub(crate) fn propagate_taints(&mut self, state: &mut dyn EngineState) {
        let Some(entry) = self.cur_block_entry.clone() else {
            return;
        };

        while let Some(instr_addr) = self.taint_next_instr {
            let Some(instr_entry) = entry.instr_entries.get(&instr_addr) else {
                self.advance_past(&entry, instr_addr);
                continue;
            };

            if instr_entry.has_memory_read && !self.mem_reads_map.contains_key(&instr_addr) {
                // Wait for the engine's read hook to deliver the access.
                self.mem_read_pending_instr = Some(instr_addr);
                return;
            }

            self.propagate_taint_of_one_instr(state, instr_addr, instr_entry);
            if self.stopped {
                return;
            }

            if instr_addr == entry.exit_stmt_instr_addr
                && !entry.exit_guard_deps.is_empty()
                && self.final_taint_status_of(entry.exit_guard_deps.iter()) == TaintStatus::Symbolic
            {
                self.record_stop_instr_slice(instr_addr);
                self.stop(state, StopReason::SymbolicBlockExitStmt);
                return;
            }

            self.advance_past(&entry, instr_addr);
        }

        // Whole block resolved; a symbolic fall-through target means the
        // program counter is about to go symbolic.
        if !entry.next_expr_deps.is_empty()
            && self.final_taint_status_of(entry.next_expr_deps.iter()) == TaintStatus::Symbolic
        {
            if let Some(last) = entry.instr_entries.keys().next_back().copied() {
                self.record_stop_instr_slice(last);
            }
            self.stop(state, StopReason::SymbolicPc);
        }
    }

    fn advance_past(&mut self, entry: &BlockTaintEntry, instr_addr: Address) {
        self.taint_next_instr = entry
            .instr_entries
            .range((Bound::Excluded(instr_addr), Bound::Unbounded))
            .next()
            .map(|(&addr, _)| addr);
    }

    /// Resume propagation once the engine delivered the memory access the
    /// walk was paused on.
    pub(crate) fn propagate_taint_of_mem_read_instr(
        &mut self,
        state: &mut dyn EngineState,
        instr_addr: Address,
    ) {
        debug_assert_eq!(self.taint_next_instr, Some(instr_addr));
        trace!("resuming propagation at {instr_addr:#x}");
        self.propagate_taints(state);
    }

    fn propagate_taint_of_one_instr(
        &mut self,
        state: &mut dyn EngineState,
        instr_addr: Address,
        instr_entry: &InstructionTaintEntry,
    ) {
        let slice_details = self.compute_instr_slice_details(instr_entry);
        self.instr_slice_details.insert(instr_addr, slice_details);

        if self.final_taint_status_of(instr_entry.ite_cond_entity_list.iter())
            == TaintStatus::Symbolic
        {
            self.record_stop_instr_slice(instr_addr);
            self.stop(state, StopReason::SymbolicCondition);
            return;
        }

        let mut instr_symbolic = false;
        for (sink, sources) in &instr_entry.taint_sink_src_map {
            let mut status = TaintStatus::Concrete;
            for source in sources {
                match source {
                    TaintEntity::Mem { deps, .. } => {
                        if self.final_taint_status_of(deps.iter()) != TaintStatus::Concrete {
                            self.record_stop_instr_slice(instr_addr);
                            self.stop(state, StopReason::SymbolicReadAddr);
                            return;
                        }
                        if let Some(read) = self.mem_reads_map.get(&instr_addr) {
                            if read.is_value_symbolic {
                                status = TaintStatus::Symbolic;
                            }
                        }
                    }
                    other => {
                        if self.entity_taint_status(other) == TaintStatus::Symbolic {
                            status = TaintStatus::Symbolic;
                        }
                    }
                }
            }

            match sink {
                TaintEntity::Tmp { id, .. } => {
                    if status == TaintStatus::Symbolic {
                        self.taint.mark_temp_symbolic(*id);
                    }
                }
                TaintEntity::Reg { offset, .. } => {
                    let full = self.config.full_register_offset(*offset);
                    if status == TaintStatus::Symbolic {
                        let pc = self
                            .config
                            .pc_offset()
                            .map(|pc| self.config.full_register_offset(pc));
                        if pc == Some(full) {
                            self.record_stop_instr_slice(instr_addr);
                            self.stop(state, StopReason::SymbolicPc);
                            return;
                        }
                        self.taint.mark_register_symbolic(full, true);
                    } else {
                        self.taint.mark_register_concrete(full, true);
                    }
                }
                TaintEntity::Mem { deps, .. } => {
                    if self.final_taint_status_of(deps.iter()) != TaintStatus::Concrete {
                        self.record_stop_instr_slice(instr_addr);
                        self.stop(state, StopReason::SymbolicWriteAddr);
                        return;
                    }
                    self.mem_writes_taint_map
                        .insert(instr_addr, status == TaintStatus::Symbolic);
                }
            }

            if status == TaintStatus::Symbolic {
                instr_symbolic = true;
            }
        }

        if instr_symbolic {
            self.compute_slice_of_instrs(instr_addr, instr_entry);
        } else {
            self.update_register_slice(instr_addr, instr_entry);
        }
    }

    /// Taint classification of a single entity under the current state.
    fn entity_taint_status(&self, entity: &TaintEntity) -> TaintStatus {
        match entity {
            TaintEntity::Reg { offset, .. } => {
                if self
                    .taint
                    .is_symbolic_register(self.config.full_register_offset(*offset))
                {
                    TaintStatus::Symbolic
                } else {
                    TaintStatus::Concrete
                }
            }
            TaintEntity::Tmp { id, .. } => {
                if self.taint.is_symbolic_temp(*id) {
                    TaintStatus::Symbolic
                } else {
                    TaintStatus::Concrete
                }
            }
            TaintEntity::Mem { deps, .. } => {
                if self.final_taint_status_of(deps.iter()) != TaintStatus::Concrete {
                    TaintStatus::DependsOnReadFromSymbolicAddr
                } else {
                    TaintStatus::Concrete
                }
            }
        }
    }

    /// Cumulative status of a set of entities: the worst individual status.
    pub(crate) fn final_taint_status_of<'a>(
        &self,
        entities: impl IntoIterator<Item = &'a TaintEntity>,
    ) -> TaintStatus {
        let mut status = TaintStatus::Concrete;
        for entity in entities {
            status = status.max(self.entity_taint_status(entity));
            if status == TaintStatus::Symbolic {
                break;
            }
        }
        status
    }

    /// Resolve the instruction's register dependencies against the slices
    /// built so far: dependencies produced inside the block pull in their
    /// producing instructions, everything else needs a block-entry snapshot.
    fn compute_instr_slice_details(
        &self,
        instr_entry: &InstructionTaintEntry,
    ) -> InstrSliceDetails {
        let mut details = InstrSliceDetails::default();

        for dependency in &instr_entry.dependencies_to_save {
            let TaintEntity::Reg { offset, .. } = dependency else {
                continue;
            };
            let full = self.config.full_register_offset(*offset);
            if !self.config.is_valid_dependency(full) {
                continue;
            }
            // Symbolic registers are the host's to provide; only concrete
            // inputs are captured.
            if self.taint.is_symbolic_register(full) {
                continue;
            }

            if let Some(slice) = self.reg_instr_slice.get(&full) {
                if !slice.is_empty() {
                    for producer in slice {
                        details.dependent_instrs.insert(*producer);
                        if let Some(producer_details) =
                            self.instr_slice_details.get(&producer.instr_addr)
                        {
                            details
                                .concrete_registers
                                .extend(producer_details.concrete_registers.iter().copied());
                        }
                    }
                    continue;
                }
            }

            if !self.config.is_blacklisted(full) {
                details.concrete_registers.insert(full);
            }
        }

        details
    }

    fn compute_instr_details(
        &self,
        instr_addr: Address,
        instr_entry: &InstructionTaintEntry,
    ) -> InstrDetails {
        let mut details = InstrDetails {
            instr_addr,
            ..Default::default()
        };
        if instr_entry.has_memory_read {
            // The read is only replayable when its address was concrete.
            let address_concrete = instr_entry
                .taint_sink_src_map
                .iter()
                .flat_map(|(_, sources)| sources)
                .all(|source| match source {
                    TaintEntity::Mem { deps, .. } => {
                        self.final_taint_status_of(deps.iter()) == TaintStatus::Concrete
                    }
                    _ => true,
                });
            if address_concrete {
                if let Some(read) = self.mem_reads_map.get(&instr_addr) {
                    details.has_memory_dep = true;
                    details.memory_value = MemoryValue {
                        address: read.address,
                        value: read.value,
                        size: read.size as u64,
                    };
                }
            }
        }
        details
    }

    /// A concrete instruction that writes registers becomes (part of) the
    /// slice of those registers: a plain overwrite replaces the slice, a
    /// read-modify-write extends it.
    fn update_register_slice(&mut self, instr_addr: Address, instr_entry: &InstructionTaintEntry) {
        if instr_entry.modified_regs.is_empty() {
            return;
        }

        let own_details = self.compute_instr_details(instr_addr, instr_entry);
        let slice_details = self
            .instr_slice_details
            .get(&instr_addr)
            .cloned()
            .unwrap_or_default();

        let mut closure: Vec<InstrDetails> =
            slice_details.dependent_instrs.iter().copied().collect();
        closure.push(own_details);

        for (offset, depends_on_previous) in &instr_entry.modified_regs {
            let full = self.config.full_register_offset(*offset);
            if !self.config.is_valid_dependency(full) {
                continue;
            }
            let slot = self.reg_instr_slice.entry(full).or_default();
            if *depends_on_previous {
                for details in &closure {
                    if !slot.contains(details) {
                        slot.push(*details);
                    }
                }
            } else {
                *slot = closure.clone();
            }
        }
    }

    /// An instruction classified symbolic joins the block's re-execution
    /// list together with its dependency closure and the block-entry
    /// snapshots of every concrete register the closure consumes.
    fn compute_slice_of_instrs(&mut self, instr_addr: Address, instr_entry: &InstructionTaintEntry) {
        let slice_details = self
            .instr_slice_details
            .get(&instr_addr)
            .cloned()
            .unwrap_or_default();

        for producer in &slice_details.dependent_instrs {
            self.block_details.add_symbolic_instr(*producer);
        }
        let own = self.compute_instr_details(instr_addr, instr_entry);
        self.block_details.add_symbolic_instr(own);

        for &offset in &slice_details.concrete_registers {
            if let Some(snapshot) = self.block_start_reg_values.get(&offset) {
                self.block_details.add_register_value(*snapshot);
            }
        }
    }

    /// Fold the instruction that triggered a symbolic stop into the block's
    /// re-execution slice before the block is rewound, so the host knows
    /// exactly what to replay and what concrete state it needs.
    pub(crate) fn record_stop_instr_slice(&mut self, instr_addr: Address) {
        let Some(entry) = self.cur_block_entry.clone() else {
            return;
        };
        let Some(instr_entry) = entry.instr_entries.get(&instr_addr) else {
            return;
        };
        if !self.instr_slice_details.contains_key(&instr_addr) {
            let details = self.compute_instr_slice_details(instr_entry);
            self.instr_slice_details.insert(instr_addr, details);
        }
        self.compute_slice_of_instrs(instr_addr, instr_entry);
    }
}
