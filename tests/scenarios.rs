//! End-to-end scenarios driving the controller through the scripted mock
//! engine: pure concrete runs, every symbolic boundary, cache behavior, and
//! the self-modifying-code guard.

mod common;

use common::*;
use concolic_accel::engine::EngineExit;
use concolic_accel::mem::PAGE_SIZE;
use concolic_accel::{GuestArch, StopReason};

fn pc_of(controller: &concolic_accel::Controller<MockEngine, MockLifter>) -> u64 {
    controller
        .engine()
        .state
        .reg(GuestArch::Amd64.pc_engine_reg())
}

/// S1: a purely concrete block runs to completion with nothing symbolic.
#[test]
fn pure_concrete_run() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 4),
            put(RAX, add(get(RAX), con(1))),
            imark(0x4004, 4),
            put(RAX, add(get(RAX), con(4))),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);

    let details = controller.start(0x4000, 100);

    assert_eq!(details.reason, StopReason::Normal);
    assert_eq!(controller.bbl_addrs(), &[0x4000]);
    assert!(controller.blocks_with_symbolic_instrs().is_empty());
    assert_eq!(controller.syscall_count(), 0);
    assert_eq!(controller.step_count(), 1);
    assert!(controller.symbolic_registers().is_empty());
}

/// S2: a symbolic flag flowing into the block's conditional exit rolls the
/// block back and reports the branch with its concrete inputs.
#[test]
fn symbolic_flag_into_branch() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 2),
            wrtmp(0, get(FLAGS)),
            imark(0x4002, 6),
            exit_stmt(add(rdtmp(0), get(RBX)), 0x5000),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.engine_mut().state.set_reg(ENGINE_RBX, 7);
    controller.set_symbolic_register_data(&[FLAGS]);

    let details = controller.start(0x4000, 100);

    assert_eq!(details.reason, StopReason::SymbolicBlockExitStmt);
    assert_eq!(details.block_addr, 0x4000);

    // The block was rewound to its entry.
    assert_eq!(pc_of(&controller), 0x4000);

    let blocks = controller.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);
    let addrs: Vec<u64> = blocks[0]
        .symbolic_instrs
        .iter()
        .map(|i| i.instr_addr)
        .collect();
    assert!(addrs.contains(&0x4002), "branch instruction in {addrs:?}");
    assert!(addrs.contains(&0x4000));

    // The branch's concrete input was snapshotted at block entry.
    let rbx = blocks[0]
        .register_values
        .iter()
        .find(|v| v.offset == RBX)
        .expect("RBX snapshot");
    assert_eq!(u64::from_le_bytes(rbx.value[..8].try_into().unwrap()), 7);
}

/// S3: a read through a symbolic address defers the whole block to the host.
#[test]
fn symbolic_read_address() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 8),
            wrtmp(0, load(get(RBX))),
            put(RAX, rdtmp(0)),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8).with_events(vec![Event::Read {
        addr: 0x8000,
        size: 8,
        at_pc: 0x4000,
    }])];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.engine_mut().state.map_bytes(0x8000, &[0u8; 8]);
    controller.engine_mut().state.set_reg(ENGINE_RBX, 0x8000);
    controller.set_symbolic_register_data(&[RBX]);

    let details = controller.start(0x4000, 100);

    assert_eq!(details.reason, StopReason::SymbolicReadAddr);
    assert_eq!(pc_of(&controller), 0x4000);

    let blocks = controller.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);
    let read_instr = blocks[0]
        .symbolic_instrs
        .iter()
        .find(|i| i.instr_addr == 0x4000)
        .expect("read instruction");
    // The read went through a symbolic address, so its bytes cannot be
    // replayed.
    assert!(!read_instr.has_memory_dep);
}

/// S4: a symbolic value written to memory and read back taints the reading
/// register, with no rollback anywhere.
#[test]
fn symbolic_value_through_memory() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 4),
            store(con(0x8000), get(RAX)),
            imark(0x4004, 4),
            wrtmp(1, load(con(0x8000))),
            put(RCX, rdtmp(1)),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8).with_events(vec![
        Event::Write {
            addr: 0x8000,
            size: 8,
            value: 0xdead_beef,
            at_pc: 0x4000,
        },
        Event::Read {
            addr: 0x8000,
            size: 8,
            at_pc: 0x4004,
        },
    ])];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.engine_mut().state.map_bytes(0x8000, &[0u8; 8]);
    controller.set_symbolic_register_data(&[RAX]);

    let details = controller.start(0x4000, 100);

    assert_eq!(details.reason, StopReason::Normal);

    // The written bytes stay symbolic after commit.
    for addr in 0x8000..0x8008u64 {
        assert_eq!(controller.find_tainted(addr, 1), Some(addr));
    }
    assert!(controller.symbolic_registers().contains(&RCX));

    let blocks = controller.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);
    let addrs: Vec<u64> = blocks[0]
        .symbolic_instrs
        .iter()
        .map(|i| i.instr_addr)
        .collect();
    assert_eq!(addrs, vec![0x4000, 0x4004]);
    let read_instr = &blocks[0].symbolic_instrs[1];
    assert!(read_instr.has_memory_dep);
    assert_eq!(read_instr.memory_value.address, 0x8000);
    assert_eq!(read_instr.memory_value.size, 8);
}

/// S5: execution leaving the cached range stops with EXECNONE and commits
/// nothing partial.
#[test]
fn page_cache_coverage_failure() {
    let block_a = ir_block(0x1000, 0x40, vec![imark(0x1000, 0x40)]);
    let script = vec![
        BlockScript::new(0x1000, 0x40),
        BlockScript::new(0x2000, 0x40),
    ];
    let mut controller = setup_controller(script, vec![block_a]);
    // Nothing is mapped in the engine; the first block is resolved from the
    // page cache, the second has no backing at all.
    assert!(controller.cache_page(0x1000, &[0x90u8; PAGE_SIZE], 5));

    let details = controller.start(0x1000, 100);

    assert_eq!(details.reason, StopReason::ExecNone);
    assert_eq!(controller.bbl_addrs(), &[0x1000]);
    assert!(controller.blocks_with_symbolic_instrs().is_empty());
    assert!(controller.sync().is_empty());
}

/// A run that cannot even start (entry point unmapped and uncached) reports
/// NOSTART rather than EXECNONE.
#[test]
fn unmapped_entry_is_nostart() {
    let script = vec![BlockScript::new(0x7000, 0x10)];
    let mut controller = setup_controller(script, vec![]);

    let details = controller.start(0x7000, 100);
    assert_eq!(details.reason, StopReason::NoStart);
    assert_eq!(controller.step_count(), 0);
}

/// S6: a block writing into its own bytes invalidates the page cache and
/// the block-taint cache for that region, and execution continues into
/// freshly lifted code.
#[test]
fn self_modifying_code_invalidates_caches() {
    let block_a = ir_block(
        0x4000,
        8,
        vec![imark(0x4000, 8), store(con(0x4004), con(0x9090))],
    );
    let block_b = ir_block(0x4008, 4, vec![imark(0x4008, 4), put(RAX, con(1))]);
    let script = vec![
        BlockScript::new(0x4000, 8).with_events(vec![Event::Write {
            addr: 0x4004,
            size: 4,
            value: 0x9090,
            at_pc: 0x4000,
        }]),
        BlockScript::new(0x4008, 4),
    ];
    let mut controller = setup_controller(script, vec![block_a, block_b]);
    map_code(&mut controller, 0x4000, 0x10);
    assert!(controller.cache_page(0x4000, &[0x90u8; PAGE_SIZE], 5));
    assert!(controller.in_cache(0x4000));

    let details = controller.start(0x4000, 100);

    assert_eq!(details.reason, StopReason::Normal);
    assert_eq!(controller.bbl_addrs(), &[0x4000, 0x4008]);
    // The write overlapped the executing block; its cached page is gone.
    assert!(!controller.in_cache(0x4000));
}

/// Identical `set_stops` calls are idempotent and the configured stop point
/// halts the run at the block boundary.
#[test]
fn stop_points_are_idempotent() {
    let block_a = ir_block(0x4000, 4, vec![imark(0x4000, 4), put(RAX, con(1))]);
    let block_b = ir_block(0x4004, 4, vec![imark(0x4004, 4), put(RAX, con(2))]);
    let script = vec![
        BlockScript::new(0x4000, 4),
        BlockScript::new(0x4004, 4),
    ];
    let mut controller = setup_controller(script, vec![block_a, block_b]);
    map_code(&mut controller, 0x4000, 8);
    controller.set_stops(&[0x4004, 0x9000]);
    controller.set_stops(&[0x4004, 0x9000]);

    let details = controller.start(0x4000, 100);

    assert_eq!(details.reason, StopReason::StopPoint);
    assert_eq!(details.block_addr, 0x4004);
    assert_eq!(controller.bbl_addrs(), &[0x4000]);
}

/// The step budget halts the run with a NORMAL stop at a block boundary.
#[test]
fn max_steps_budget() {
    let block_a = ir_block(0x4000, 4, vec![imark(0x4000, 4), put(RAX, con(1))]);
    let block_b = ir_block(0x4004, 4, vec![imark(0x4004, 4), put(RAX, con(2))]);
    let script = vec![
        BlockScript::new(0x4000, 4),
        BlockScript::new(0x4004, 4),
    ];
    let mut controller = setup_controller(script, vec![block_a, block_b]);
    map_code(&mut controller, 0x4000, 8);

    let details = controller.start(0x4000, 1);

    assert_eq!(details.reason, StopReason::Normal);
    assert_eq!(controller.step_count(), 1);
    assert_eq!(controller.bbl_addrs(), &[0x4000]);
}

/// An interrupt is classified as a syscall and counted.
#[test]
fn interrupt_stops_as_syscall() {
    let block = ir_block(0x4000, 4, vec![imark(0x4000, 4), put(RAX, con(1))]);
    let script =
        vec![BlockScript::new(0x4000, 4).with_events(vec![Event::Interrupt(0x80)])];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 4);

    let details = controller.start(0x4000, 100);

    assert_eq!(details.reason, StopReason::Syscall);
    assert_eq!(controller.syscall_count(), 1);
}

/// A block landing on the zero page is fatal.
#[test]
fn zero_page_execution() {
    let block = ir_block(0x0, 4, vec![imark(0x0, 4)]);
    let script = vec![BlockScript::new(0x0, 4)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x0, 4);

    let details = controller.start(0x0, 100);
    assert_eq!(details.reason, StopReason::ZeroPage);
}

/// A symbolic if-then-else condition stops with SYMBOLIC_CONDITION and
/// rolls back.
#[test]
fn symbolic_ite_condition() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 8),
            wrtmp(
                0,
                concolic_accel::IrExpr::Ite {
                    cond: Box::new(get(FLAGS)),
                    if_true: Box::new(get(RBX)),
                    if_false: Box::new(con(0)),
                },
            ),
            put(RAX, rdtmp(0)),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.set_symbolic_register_data(&[FLAGS]);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::SymbolicCondition);
    assert_eq!(pc_of(&controller), 0x4000);
}

/// A store through a symbolic address stops before the engine performs it.
#[test]
fn symbolic_write_address() {
    let block = ir_block(
        0x4000,
        8,
        vec![imark(0x4000, 8), store(get(RBX), con(0x42))],
    );
    let script = vec![BlockScript::new(0x4000, 8)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.set_symbolic_register_data(&[RBX]);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::SymbolicWriteAddr);
    assert!(controller.sync().is_empty());
}

/// A symbolic fall-through target stops with SYMBOLIC_PC.
#[test]
fn symbolic_jump_target() {
    let mut block = ir_block(
        0x4000,
        8,
        vec![imark(0x4000, 8), wrtmp(0, get(RAX))],
    );
    block.next = get(RAX);
    let script = vec![BlockScript::new(0x4000, 8)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.set_symbolic_register_data(&[RAX]);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::SymbolicPc);
    assert_eq!(pc_of(&controller), 0x4000);
}

/// Two memory reads inside one instruction are a capability gap.
#[test]
fn multiple_reads_in_one_instruction() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 8),
            wrtmp(0, load(get(RBX))),
            put(RAX, rdtmp(0)),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8).with_events(vec![
        Event::Read {
            addr: 0x8000,
            size: 8,
            at_pc: 0x4000,
        },
        Event::Read {
            addr: 0x8008,
            size: 8,
            at_pc: 0x4000,
        },
    ])];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.engine_mut().state.map_bytes(0x8000, &[0u8; 16]);
    controller.engine_mut().state.set_reg(ENGINE_RBX, 0x8000);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::MultipleMemoryReads);
}

/// A write the taint engine did not predict is a capability gap.
#[test]
fn unexpected_memory_write() {
    let block = ir_block(0x4000, 4, vec![imark(0x4000, 4), put(RAX, con(1))]);
    let script = vec![BlockScript::new(0x4000, 4).with_events(vec![Event::Write {
        addr: 0x8000,
        size: 4,
        value: 0x42,
        at_pc: 0x4000,
    }])];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 4);
    controller.engine_mut().state.map_bytes(0x8000, &[0u8; 8]);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::UnknownMemoryWrite);
}

/// Unsupported IR constructs stop with their typed reason.
#[test]
fn unsupported_statement_stops() {
    let block = ir_block(
        0x4000,
        4,
        vec![imark(0x4000, 4), concolic_accel::IrStmt::Cas { addr: con(0x8000) }],
    );
    let script = vec![BlockScript::new(0x4000, 4)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 4);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::UnsupportedStmtCas);
}

/// Reading tainted bytes while symbolic tracking is disabled stops with the
/// dedicated reason.
#[test]
fn tainted_read_with_tracking_disabled() {
    let block = ir_block(0x4000, 4, vec![imark(0x4000, 4)]);
    let script = vec![BlockScript::new(0x4000, 4).with_events(vec![Event::Read {
        addr: 0x8000,
        size: 8,
        at_pc: 0x4000,
    }])];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 4);
    controller.engine_mut().state.map_bytes(0x8000, &[0u8; 8]);
    controller.disable_symbolic_reg_tracking();

    let mut taint = vec![0u8; PAGE_SIZE];
    taint[0] = 2;
    controller.activate(0x8000, PAGE_SIZE as u64, Some(&taint));

    let details = controller.start(0x4000, 100);
    assert_eq!(
        details.reason,
        StopReason::SymbolicReadSymbolicTrackingDisabled
    );
}

/// A lift failure with symbolic state live defers the block to the host; a
/// lift failure with nothing symbolic keeps running concretely.
#[test]
fn lift_failure_policy() {
    // No IR registered for the block, so every lift fails.
    let script = vec![BlockScript::new(0x6000, 4)];
    let mut controller = setup_controller(script.clone(), vec![]);
    map_code(&mut controller, 0x6000, 4);
    controller.set_symbolic_register_data(&[RAX]);

    let details = controller.start(0x6000, 100);
    assert_eq!(details.reason, StopReason::VexLiftFailed);
    let blocks = controller.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].vex_lift_failed);

    let mut controller = setup_controller(script, vec![]);
    map_code(&mut controller, 0x6000, 4);
    let details = controller.start(0x6000, 100);
    assert_eq!(details.reason, StopReason::Normal);
    assert!(controller.blocks_with_symbolic_instrs().is_empty());
}

/// Block analysis is memoized: executing the same block twice lifts once.
#[test]
fn block_analysis_is_memoized() {
    let block = ir_block(0x4000, 4, vec![imark(0x4000, 4), put(RAX, con(1))]);
    let script = vec![
        BlockScript::new(0x4000, 4),
        BlockScript::new(0x4000, 4),
    ];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 4);

    let calls = controller.lifter().lift_calls.clone();
    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::Normal);
    assert_eq!(controller.bbl_addrs(), &[0x4000, 0x4000]);
    assert_eq!(calls.get(), 1);
}

/// Every register a symbolic instruction's slice needs is either
/// snapshotted or produced by an earlier instruction of the slice.
#[test]
fn slice_closure_snapshots_only_external_inputs() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 4),
            put(RBX, get(RDX)),
            imark(0x4004, 4),
            wrtmp(0, get(FLAGS)),
            put(RAX, add(rdtmp(0), get(RBX))),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.engine_mut().state.set_reg(ENGINE_RDX, 0x1234);
    controller.set_symbolic_register_data(&[FLAGS]);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::Normal);

    let blocks = controller.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);
    let addrs: Vec<u64> = blocks[0]
        .symbolic_instrs
        .iter()
        .map(|i| i.instr_addr)
        .collect();
    assert_eq!(addrs, vec![0x4000, 0x4004]);

    // RDX feeds the closure from outside the block: snapshotted. RBX is
    // produced by the first slice instruction: not snapshotted.
    let offsets: Vec<u64> = blocks[0].register_values.iter().map(|v| v.offset).collect();
    assert!(offsets.contains(&RDX));
    assert!(!offsets.contains(&RBX));
    let rdx = blocks[0]
        .register_values
        .iter()
        .find(|v| v.offset == RDX)
        .unwrap();
    assert_eq!(u64::from_le_bytes(rdx.value[..8].try_into().unwrap()), 0x1234);
}

/// Committed concrete writes surface through sync as coalesced ranges.
#[test]
fn sync_reports_committed_ranges() {
    let block = ir_block(
        0x4000,
        8,
        vec![
            imark(0x4000, 4),
            store(con(0x8000), con(0x11)),
            imark(0x4004, 4),
            store(con(0x8004), con(0x22)),
        ],
    );
    let script = vec![BlockScript::new(0x4000, 8).with_events(vec![
        Event::Write {
            addr: 0x8000,
            size: 4,
            value: 0x11,
            at_pc: 0x4000,
        },
        Event::Write {
            addr: 0x8004,
            size: 4,
            value: 0x22,
            at_pc: 0x4004,
        },
    ])];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.engine_mut().state.map_bytes(0x8000, &[0u8; 8]);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::Normal);
    assert_eq!(controller.sync(), vec![(0x8000, 8)]);
    // DIRTY was only a pending-commit marker.
    assert_eq!(controller.find_tainted(0x8000, 8), None);
}

/// Sub-register writes canonicalize onto the full register.
#[test]
fn sub_register_taint_aliases_full_register() {
    let block = ir_block(
        0x4000,
        8,
        vec![imark(0x4000, 8), put(EAX_SUB, get(FLAGS))],
    );
    let script = vec![BlockScript::new(0x4000, 8)];
    let mut controller = setup_controller(script, vec![block]);
    map_code(&mut controller, 0x4000, 8);
    controller.set_symbolic_register_data(&[FLAGS]);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::Normal);
    assert!(controller.symbolic_registers().contains(&RAX));
    assert!(!controller.symbolic_registers().contains(&EAX_SUB));
}

/// An oversized engine block forces a halt and a re-entry at the same
/// address, after which execution proceeds without taint tracking for that
/// block.
#[test]
fn oversized_block_reenters() {
    let big = ir_block(0x4000, 1000, vec![imark(0x4000, 4)]);
    let script = vec![
        BlockScript::new(0x4000, 1000),
        BlockScript::new(0x5000, 4).with_exit(EngineExit::Halt),
    ];
    let small = ir_block(0x5000, 4, vec![imark(0x5000, 4), put(RAX, con(1))]);
    let mut controller = setup_controller(script, vec![big, small]);
    map_code(&mut controller, 0x4000, 1000);
    map_code(&mut controller, 0x5000, 4);

    let details = controller.start(0x4000, 100);
    assert_eq!(details.reason, StopReason::Hlt);
    assert_eq!(controller.bbl_addrs(), &[0x4000, 0x5000]);
}
