//! Compiler and VM-level properties: determinism, symbolize caching,
//! symbol-table extension, scratch exhaustion and recovery.

use std::sync::Arc;

use vex_asm::Fault;
use vex_types::{Composer, Symtab};

use super::data::{taxi_chunks, taxi_rows};
use crate::expr::{compile_filter, BinOp, Expr};
use crate::interpreter::{ExecEnv, Machine, VReg};
use crate::memory::Window;
use crate::pipeline::{ChunkBuilder, MemTable};
use crate::ssa::CompiledExpr;
use crate::{Engine, EngineParams};

fn engine(workers: usize) -> Engine {
    Engine::new(EngineParams::default().with_parallelism(workers))
}

fn sample_symtab() -> Symtab {
    let mut st = Symtab::new();
    st.intern("fare_amount");
    st.intern("passenger_count");
    st
}

#[test]
fn recompilation_is_byte_identical() {
    let expr = Expr::bin(
        BinOp::And,
        Expr::bin(BinOp::Lt, Expr::path("passenger_count"), Expr::Int(3)),
        Expr::bin(BinOp::Gt, Expr::path("fare_amount"), Expr::Float(5.0)),
    );
    let symtab = sample_symtab();

    let mut a = CompiledExpr::new(compile_filter(&expr).unwrap());
    let mut b = CompiledExpr::new(compile_filter(&expr).unwrap());
    let pa = a.symbolize(&symtab).unwrap();
    let pb = b.symbolize(&symtab).unwrap();
    assert_eq!(pa.code(), pb.code());
    assert_eq!(pa.literals(), pb.literals());
    assert_eq!(pa.stack_size(), pb.stack_size());
}

#[test]
fn symbolize_with_same_table_is_a_no_op() {
    let expr = Expr::bin(BinOp::Lt, Expr::path("passenger_count"), Expr::Int(3));
    let symtab = sample_symtab();
    let mut compiled = CompiledExpr::new(compile_filter(&expr).unwrap());

    let first = compiled.symbolize(&symtab).unwrap().clone();
    let second = compiled.symbolize(&symtab).unwrap().clone();
    // The cached program is reused, not recompiled: same backing bytecode.
    assert!(std::ptr::eq(
        first.code().as_ptr(),
        second.code().as_ptr()
    ));
}

#[test]
fn extended_tables_recompile_and_stay_correct() {
    // Queries compiled against a table remain correct when re-symbolized
    // against an extension of it.
    let rows = taxi_rows(200);
    let base_chunks = taxi_chunks(&rows, 64);

    // A second batch whose symbol table extends the first with a new name.
    let mut extended = base_chunks[0].symtab().as_ref().clone();
    extended.intern("surcharge");
    let extended = Arc::new(extended);
    let mut builder = ChunkBuilder::new();
    let mut c = Composer::new();
    let fare = extended.lookup("fare_amount").unwrap();
    let pax = extended.lookup("passenger_count").unwrap();
    c.begin_struct();
    c.field(fare);
    c.put_f64(3.0);
    c.field(pax);
    c.put_int(1);
    c.end();
    builder.push_record(&c.take()).unwrap();
    let extra = builder.finish(extended);

    let mut chunks = base_chunks;
    chunks.push(extra);
    let table = MemTable::new(chunks);

    let predicate = Expr::bin(BinOp::Lt, Expr::path("passenger_count"), Expr::Int(3));
    let expected = rows.iter().filter(|r| r.passenger_count < 3).count() as u64 + 1;
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

#[test]
fn programs_validate_their_bytecode() {
    let expr = Expr::bin(BinOp::Gt, Expr::path("fare_amount"), Expr::Float(1.0));
    let symtab = sample_symtab();
    let mut compiled = CompiledExpr::new(compile_filter(&expr).unwrap());
    let program = compiled.symbolize(&symtab).unwrap();
    let stats = vex_asm::unpack::scan(program.code()).unwrap();
    assert!(stats.terminated);
    assert!(stats.ops > 0);
}

/// Boxing into an undersized scratch arena faults with `MoreScratch` and
/// leaves the reserved prefix untouched.
#[test]
fn scratch_exhaustion_faults_and_preserves_the_reserve() {
    use vex_asm::{Assembler, Op};
    use crate::program::{OutputContract, ProgFlags, Program};

    // broadcast 2.5 to lanes; box all 16 lanes (needs 144 bytes).
    let mut asm = Assembler::new();
    asm.op(Op::BROADCAST_F);
    asm.slot(8);
    asm.imm_f64(2.5);
    asm.op(Op::BOX_F);
    asm.slot(136);
    asm.slot(8);
    asm.slot(0);
    asm.op(Op::RET_V);
    asm.slot(136);
    asm.slot(0);
    let program = Program::new(
        asm.finish(),
        vec![],
        vec![],
        296,
        0,
        4,
        0,
        ProgFlags::empty(),
        OutputContract::Value,
    )
    .unwrap();

    let mut machine = Machine::new(program);
    let chunk = [0u8; 16];
    let lits = [0u8; 0];

    // Too small: 64 usable bytes, 4 reserved.
    let mut scratch = vec![0u8; 64];
    let mut window = Window::new(&chunk, &lits, &mut scratch, 4);
    let mut env = ExecEnv {
        window: &mut window,
        agg: None,
        groups: None,
    };
    let err = machine
        .run_group(&mut env, &VReg::default(), 0xffff)
        .unwrap_err();
    assert_eq!(err, Fault::MoreScratch);
    assert_eq!(machine.fault(), Some(Fault::MoreScratch));
    assert_eq!(window.scratch_len(), 4);

    // Large enough: the same program completes.
    let mut scratch = vec![0u8; 256];
    let mut window = Window::new(&chunk, &lits, &mut scratch, 4);
    let mut env = ExecEnv {
        window: &mut window,
        agg: None,
        groups: None,
    };
    machine.run_group(&mut env, &VReg::default(), 0xffff).unwrap();
    let (vals, mask) = machine.out_value().unwrap();
    assert_eq!(mask, 0xffff);
    let bytes = window.bytes(vals.lane(0)).unwrap();
    let header = vex_types::decode_header(bytes).unwrap();
    assert_eq!(header.kind, vex_types::Kind::Float);
    assert_eq!(
        vex_types::read_f64(&bytes[header.header_len..]).unwrap(),
        2.5
    );
}

/// The pipeline recovers from scratch exhaustion by growing the arena and
/// retrying the chunk.
#[test]
fn concat_heavy_projection_retries_with_more_scratch() {
    let mut symtab = Symtab::new();
    let s = symtab.intern("s");
    let symtab = Arc::new(symtab);

    // 16 KiB strings; concatenation of two per lane overruns the default
    // scratch arena well before a chunk completes.
    let big = "x".repeat(16 * 1024);
    let mut builder = ChunkBuilder::new();
    let mut c = Composer::new();
    for _ in 0..64 {
        c.begin_struct();
        c.field(s);
        c.put_string(&big);
        c.end();
        builder.push_record(&c.take()).unwrap();
    }
    let table = MemTable::new(vec![builder.finish(symtab)]);

    let bindings = vec![(
        "joined".to_owned(),
        Expr::Concat(Box::new(Expr::path("s")), Box::new(Expr::path("s"))),
    )];
    let collected = engine(1).project_collect(&table, &bindings).unwrap();
    let out_symtab = collected.symtab();
    let out = collected.rows();
    assert_eq!(out.len(), 64);
    let joined = super::data::read_field_str(&out[0], &out_symtab, "joined").unwrap();
    assert_eq!(joined.len(), 2 * big.len());
}

/// Hand-written assembly driving opcodes the expression layer does not
/// reach directly: timestamp extraction feeding integer boxing.
#[test]
fn handwritten_timestamp_program() {
    use vex_asm::{Assembler, Op};
    use crate::program::{OutputContract, ProgFlags, Program};

    // 2000-01-01T13:37:42 in epoch microseconds.
    let micros = (946_684_800i64 + 13 * 3600 + 37 * 60 + 42) * 1_000_000;

    let mut asm = Assembler::new();
    asm.op(Op::BROADCAST_TS);
    asm.slot(8);
    asm.imm_i64(micros);
    asm.op(Op::TS_YEAR);
    asm.slot(136);
    asm.slot(8);
    asm.slot(0);
    asm.op(Op::BOX_I);
    asm.slot(264);
    asm.slot(136);
    asm.slot(0);
    asm.op(Op::RET_V);
    asm.slot(264);
    asm.slot(0);
    let program = Program::new(
        asm.finish(),
        vec![],
        vec![],
        424,
        0,
        0,
        0,
        ProgFlags::empty(),
        OutputContract::Value,
    )
    .unwrap();

    let mut machine = Machine::new(program);
    let chunk = [0u8; 16];
    let lits = [0u8; 0];
    let mut scratch = vec![0u8; 512];
    let mut window = Window::new(&chunk, &lits, &mut scratch, 0);
    let mut env = ExecEnv {
        window: &mut window,
        agg: None,
        groups: None,
    };
    machine.run_group(&mut env, &VReg::default(), 0xffff).unwrap();

    let (vals, mask) = machine.out_value().unwrap();
    assert_eq!(mask, 0xffff);
    for lane in [0usize, 7, 15] {
        let bytes = window.bytes(vals.lane(lane)).unwrap();
        let header = vex_types::decode_header(bytes).unwrap();
        assert_eq!(header.kind, vex_types::Kind::Uint);
        assert_eq!(
            vex_types::read_int(header.kind, &bytes[header.header_len..]).unwrap(),
            2000
        );
    }
}

#[test]
fn cancellation_surfaces_between_chunks() {
    use crate::pipeline::{CancelToken, Count, Table};

    let rows = taxi_rows(500);
    let table = MemTable::new(taxi_chunks(&rows, 32));
    let sink = Count::new(None).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = table.write_chunks(&sink, 2, &cancel).unwrap_err();
    assert!(matches!(err, crate::error::VmError::Cancelled));
}
