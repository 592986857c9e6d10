//! One-shot analysis of a lifted IR block into a [BlockTaintEntry].
//!
//! The walk is pure: the same block always produces the same entry, which is
//! what makes the per-address memoization in the controller sound. No taint
//! state is consulted here; the analyzer only records *which* entities every
//! instruction reads and writes. Deciding whether those entities are
//! symbolic happens later, during propagation, when the engine's concrete
//! execution can be observed.

use fxhash::FxHashSet;

use crate::ir::{Address, IrBlock, IrExpr, IrStmt};
use crate::stop::StopReason;
use crate::taint::{BlockTaintEntry, InstructionTaintEntry, TaintEntity, TaintSources};

/// Walk `block` in statement order and summarize its data flow.
///
/// On the first unsupported construct the entry is returned immediately with
/// its `unsupported` reason set; propagation refuses such blocks and the
/// controller hands the block to the host.
pub fn analyze_block(block: &IrBlock) -> BlockTaintEntry {
    let mut entry = BlockTaintEntry {
        exit_stmt_instr_addr: block.addr,
        ..Default::default()
    };

    let mut cur_instr = block.addr;
    entry.instr_entries.entry(cur_instr).or_default();

    for stmt in &block.stmts {
        if let Some(reason) = stmt.unsupported_reason() {
            entry.unsupported = Some(reason);
            return entry;
        }

        match stmt {
            IrStmt::IMark { addr, .. } => {
                cur_instr = *addr;
                entry.instr_entries.entry(cur_instr).or_default();
            }

            IrStmt::WrTmp { tmp, value } => {
                let sources = visit_expr(value, cur_instr);
                if let Some(reason) = sources.unsupported {
                    entry.unsupported = Some(reason);
                    return entry;
                }
                let sink = TaintEntity::Tmp {
                    id: *tmp,
                    instr_addr: cur_instr,
                };
                record_sink(instr_entry(&mut entry, cur_instr), sink, sources);
            }

            IrStmt::Put { offset, value } => {
                let sources = visit_expr(value, cur_instr);
                if let Some(reason) = sources.unsupported {
                    entry.unsupported = Some(reason);
                    return entry;
                }
                let old_value = TaintEntity::Reg {
                    offset: *offset,
                    instr_addr: cur_instr,
                };
                let depends_on_old = sources.sources.contains(&old_value);
                let sink = TaintEntity::Reg {
                    offset: *offset,
                    instr_addr: cur_instr,
                };
                let instr = instr_entry(&mut entry, cur_instr);
                instr.modified_regs.push((*offset, depends_on_old));
                record_sink(instr, sink, sources);
            }

            IrStmt::Store { addr, value } => {
                let mut addr_sources = visit_expr(addr, cur_instr);
                let value_sources = visit_expr(value, cur_instr);
                if let Some(reason) = addr_sources.unsupported.or(value_sources.unsupported) {
                    entry.unsupported = Some(reason);
                    return entry;
                }

                let sink = TaintEntity::Mem {
                    deps: ordered_leaves(addr, cur_instr),
                    instr_addr: cur_instr,
                };
                let instr = instr_entry(&mut entry, cur_instr);
                instr.has_memory_write = true;
                // The address-computing registers must be captured too.
                save_register_dependencies(instr, addr_sources.sources.iter());
                addr_sources.sources.clear();
                addr_sources.merge(value_sources);
                record_sink(instr, sink, addr_sources);
            }

            IrStmt::Exit { guard, .. } => {
                let sources = visit_expr(guard, cur_instr);
                if let Some(reason) = sources.unsupported {
                    entry.unsupported = Some(reason);
                    return entry;
                }
                entry.exit_guard_deps.extend(sources.sources.iter().cloned());
                entry
                    .exit_guard_deps
                    .extend(sources.ite_cond_entities.iter().cloned());
                entry.exit_stmt_instr_addr = cur_instr;

                let instr = instr_entry(&mut entry, cur_instr);
                save_register_dependencies(instr, sources.sources.iter());
                save_register_dependencies(instr, sources.ite_cond_entities.iter());
            }

            IrStmt::MemFence | IrStmt::AbiHint | IrStmt::NoOp => {}

            // Unsupported statements were rejected above.
            IrStmt::PutI { .. }
            | IrStmt::StoreG { .. }
            | IrStmt::LoadG { .. }
            | IrStmt::Cas { .. }
            | IrStmt::Llsc { .. }
            | IrStmt::Dirty
            | IrStmt::Unknown => unreachable!("rejected by unsupported_reason"),
        }
    }

    let next_sources = visit_expr(&block.next, cur_instr);
    if let Some(reason) = next_sources.unsupported {
        entry.unsupported = Some(reason);
        return entry;
    }
    entry
        .next_expr_deps
        .extend(next_sources.sources.iter().cloned());
    entry
        .next_expr_deps
        .extend(next_sources.ite_cond_entities.iter().cloned());

    // The jump target's inputs belong to the block's final instruction so a
    // symbolic target can be re-executed from its slice.
    let instr = instr_entry(&mut entry, cur_instr);
    save_register_dependencies(instr, next_sources.sources.iter());
    save_register_dependencies(instr, next_sources.ite_cond_entities.iter());

    entry
}

fn instr_entry(entry: &mut BlockTaintEntry, addr: Address) -> &mut InstructionTaintEntry {
    entry.instr_entries.entry(addr).or_default()
}

/// Append a sink/source pair in program order and fold the bookkeeping the
/// pair implies into the instruction entry.
fn record_sink(instr: &mut InstructionTaintEntry, sink: TaintEntity, sources: TaintSources) {
    if sources
        .sources
        .iter()
        .any(|entity| matches!(entity, TaintEntity::Mem { .. }))
    {
        instr.has_memory_read = true;
    }

    save_register_dependencies(instr, sources.sources.iter());
    save_register_dependencies(instr, sources.ite_cond_entities.iter());

    instr
        .ite_cond_entity_list
        .extend(sources.ite_cond_entities.into_iter());
    instr.taint_sink_src_map.push((sink, sources.sources));
}

/// Collect every register entity reachable from `entities` (including the
/// address-computing registers inside memory references) into the
/// instruction's save set.
fn save_register_dependencies<'a>(
    instr: &mut InstructionTaintEntry,
    entities: impl Iterator<Item = &'a TaintEntity>,
) {
    fn walk(entity: &TaintEntity, out: &mut FxHashSet<TaintEntity>) {
        match entity {
            TaintEntity::Reg { .. } => {
                out.insert(entity.clone());
            }
            TaintEntity::Tmp { .. } => {}
            TaintEntity::Mem { deps, .. } => {
                for dep in deps {
                    walk(dep, out);
                }
            }
        }
    }

    for entity in entities {
        walk(entity, &mut instr.dependencies_to_save);
    }
}

/// Visit one expression, producing its flat leaf entities and the entities
/// appearing inside if-then-else conditions.
fn visit_expr(expr: &IrExpr, instr_addr: Address) -> TaintSources {
    let mut sources = TaintSources::default();
    visit_expr_into(expr, instr_addr, &mut sources);
    sources
}

fn visit_expr_into(expr: &IrExpr, instr_addr: Address, out: &mut TaintSources) {
    match expr {
        IrExpr::Get { offset, .. } => {
            out.sources.insert(TaintEntity::Reg {
                offset: *offset,
                instr_addr,
            });
        }

        IrExpr::RdTmp(id) => {
            out.sources.insert(TaintEntity::Tmp {
                id: *id,
                instr_addr,
            });
        }

        IrExpr::Load { addr, .. } => {
            // Nested condition entities inside the address still count.
            let mut addr_sources = TaintSources::default();
            visit_expr_into(addr, instr_addr, &mut addr_sources);
            if addr_sources.unsupported.is_some() {
                out.unsupported = out.unsupported.or(addr_sources.unsupported);
                return;
            }
            out.ite_cond_entities.extend(addr_sources.ite_cond_entities);
            out.sources.insert(TaintEntity::Mem {
                deps: ordered_leaves(addr, instr_addr),
                instr_addr,
            });
        }

        IrExpr::Const(_) => {}

        IrExpr::Unop(arg) => visit_expr_into(arg, instr_addr, out),

        IrExpr::Binop(lhs, rhs) => {
            visit_expr_into(lhs, instr_addr, out);
            visit_expr_into(rhs, instr_addr, out);
        }

        IrExpr::Triop(a, b, c) => {
            visit_expr_into(a, instr_addr, out);
            visit_expr_into(b, instr_addr, out);
            visit_expr_into(c, instr_addr, out);
        }

        IrExpr::Qop(args) | IrExpr::CCall(args) => {
            for arg in args {
                visit_expr_into(arg, instr_addr, out);
            }
        }

        IrExpr::Ite {
            cond,
            if_true,
            if_false,
        } => {
            let mut cond_sources = TaintSources::default();
            visit_expr_into(cond, instr_addr, &mut cond_sources);
            out.unsupported = out.unsupported.or(cond_sources.unsupported);
            out.ite_cond_entities.extend(cond_sources.sources);
            out.ite_cond_entities.extend(cond_sources.ite_cond_entities);

            visit_expr_into(if_true, instr_addr, out);
            visit_expr_into(if_false, instr_addr, out);
        }

        IrExpr::GetI => {
            out.unsupported = out
                .unsupported
                .or(Some(StopReason::UnsupportedExprGetI));
        }

        IrExpr::Unknown => {
            out.unsupported = out
                .unsupported
                .or(Some(StopReason::UnsupportedExprUnknown));
        }
    }
}

/// The leaf entities of an address expression in evaluation order, for the
/// ordered sub-entity list of a memory reference.
fn ordered_leaves(expr: &IrExpr, instr_addr: Address) -> Vec<TaintEntity> {
    fn walk(expr: &IrExpr, instr_addr: Address, out: &mut Vec<TaintEntity>) {
        match expr {
            IrExpr::Get { offset, .. } => {
                let entity = TaintEntity::Reg {
                    offset: *offset,
                    instr_addr,
                };
                if !out.contains(&entity) {
                    out.push(entity);
                }
            }
            IrExpr::RdTmp(id) => {
                let entity = TaintEntity::Tmp {
                    id: *id,
                    instr_addr,
                };
                if !out.contains(&entity) {
                    out.push(entity);
                }
            }
            IrExpr::Load { addr, .. } => {
                let entity = TaintEntity::Mem {
                    deps: ordered_leaves(addr, instr_addr),
                    instr_addr,
                };
                if !out.contains(&entity) {
                    out.push(entity);
                }
            }
            IrExpr::Const(_) | IrExpr::GetI | IrExpr::Unknown => {}
            IrExpr::Unop(arg) => walk(arg, instr_addr, out),
            IrExpr::Binop(lhs, rhs) => {
                walk(lhs, instr_addr, out);
                walk(rhs, instr_addr, out);
            }
            IrExpr::Triop(a, b, c) => {
                walk(a, instr_addr, out);
                walk(b, instr_addr, out);
                walk(c, instr_addr, out);
            }
            IrExpr::Qop(args) | IrExpr::CCall(args) => {
                for arg in args {
                    walk(arg, instr_addr, out);
                }
            }
            IrExpr::Ite {
                cond,
                if_true,
                if_false,
            } => {
                walk(cond, instr_addr, out);
                walk(if_true, instr_addr, out);
                walk(if_false, instr_addr, out);
            }
        }
    }

    let mut out = Vec::new();
    walk(expr, instr_addr, &mut out);
    out
}
