use criterion::{black_box, criterion_group, criterion_main, Criterion};

use concolic_accel::analyzer::analyze_block;
use concolic_accel::ir::{IrBlock, IrExpr, IrJumpKind, IrStmt};

fn synthetic_block(instr_count: u64) -> IrBlock {
    let mut stmts = Vec::new();
    for i in 0..instr_count {
        let addr = 0x40_0000 + i * 4;
        stmts.push(IrStmt::IMark { addr, len: 4 });
        stmts.push(IrStmt::WrTmp {
            tmp: i,
            value: IrExpr::Binop(
                Box::new(IrExpr::Get {
                    offset: 16 + (i % 8) * 8,
                    size: 8,
                }),
                Box::new(IrExpr::Const(i)),
            ),
        });
        stmts.push(IrStmt::Put {
            offset: 16 + (i % 8) * 8,
            value: IrExpr::RdTmp(i),
        });
    }
    stmts.push(IrStmt::Exit {
        guard: IrExpr::RdTmp(0),
        dst: 0x41_0000,
    });

    IrBlock {
        addr: 0x40_0000,
        size: (instr_count * 4) as u32,
        stmts,
        next: IrExpr::Const(0x40_0000 + instr_count * 4),
        jumpkind: IrJumpKind::Boring,
    }
}

fn bench_analyze(c: &mut Criterion) {
    let block = synthetic_block(32);
    c.bench_function("analyze_block/32", |b| {
        b.iter(|| analyze_block(black_box(&block)))
    });

    let block = synthetic_block(128);
    c.bench_function("analyze_block/128", |b| {
        b.iter(|| analyze_block(black_box(&block)))
    });
}

criterion_group!(benches, bench_analyze);
criterion_main!(benches);
