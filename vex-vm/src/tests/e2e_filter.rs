//! Filter end-to-end: predicate counts, soundness, boundaries, parallelism.

use super::data::{read_field_f64, read_field_i64, taxi_chunks, taxi_rows};
use crate::expr::{BinOp, Expr};
use crate::pipeline::{ChunkBuilder, MemTable};
use crate::{Engine, EngineParams};

fn engine(workers: usize) -> Engine {
    Engine::new(EngineParams::default().with_parallelism(workers))
}

#[test]
fn integer_equality_count() {
    let rows = taxi_rows(8_560);
    let table = MemTable::new(taxi_chunks(&rows, 512));
    let expected = rows.iter().filter(|r| r.passenger_count == 2).count() as u64;
    let predicate = Expr::bin(BinOp::Eq, Expr::path("passenger_count"), Expr::Int(2));
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

#[test]
fn integer_range_count() {
    let rows = taxi_rows(8_560);
    let table = MemTable::new(taxi_chunks(&rows, 512));
    let expected = rows.iter().filter(|r| r.passenger_count < 3).count() as u64;
    let predicate = Expr::bin(BinOp::Lt, Expr::path("passenger_count"), Expr::Int(3));
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

#[test]
fn float_range_count() {
    let rows = taxi_rows(8_560);
    let table = MemTable::new(taxi_chunks(&rows, 512));
    let expected = rows.iter().filter(|r| r.trip_distance < 2.5).count() as u64;
    let predicate = Expr::bin(BinOp::Lt, Expr::path("trip_distance"), Expr::Float(2.5));
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

#[test]
fn boolean_connectives_count() {
    let rows = taxi_rows(4_000);
    let table = MemTable::new(taxi_chunks(&rows, 256));
    let expected = rows
        .iter()
        .filter(|r| r.passenger_count >= 2 && r.trip_distance < 10.0 || r.fare_amount > 100.0)
        .count() as u64;
    let predicate = Expr::bin(
        BinOp::Or,
        Expr::bin(
            BinOp::And,
            Expr::bin(BinOp::Ge, Expr::path("passenger_count"), Expr::Int(2)),
            Expr::bin(BinOp::Lt, Expr::path("trip_distance"), Expr::Float(10.0)),
        ),
        Expr::bin(BinOp::Gt, Expr::path("fare_amount"), Expr::Float(100.0)),
    );
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

/// Every row surviving the filter satisfies the predicate when re-checked
/// against the decoded record.
#[test]
fn surviving_rows_satisfy_the_predicate() {
    let rows = taxi_rows(2_000);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    let predicate = Expr::bin(BinOp::Lt, Expr::path("trip_distance"), Expr::Float(2.5));
    let collected = engine(2).filter_collect(&table, &predicate).unwrap();

    let symtab = collected.symtab();
    let out = collected.rows();
    let expected = rows.iter().filter(|r| r.trip_distance < 2.5).count();
    assert_eq!(out.len(), expected);
    for rec in &out {
        let d = read_field_f64(rec, &symtab, "trip_distance").unwrap();
        assert!(d < 2.5, "row with distance {d} passed the filter");
    }
}

#[test]
fn counts_are_independent_of_parallelism() {
    let rows = taxi_rows(8_560);
    let table = MemTable::new(taxi_chunks(&rows, 256));
    let predicate = Expr::bin(BinOp::Lt, Expr::path("passenger_count"), Expr::Int(3));
    let solo = engine(1).count(&table, Some(&predicate)).unwrap();
    for workers in [2, 4, 8] {
        assert_eq!(engine(workers).count(&table, Some(&predicate)).unwrap(), solo);
    }
}

#[test]
fn zero_length_chunks_pass_through() {
    let rows = taxi_rows(40);
    let mut chunks = taxi_chunks(&rows, 16);
    // Splice an empty chunk between the real ones.
    let empty = ChunkBuilder::new().finish(chunks[0].symtab().clone());
    chunks.insert(1, empty);
    let table = MemTable::new(chunks);
    let predicate = Expr::bin(BinOp::Ge, Expr::path("passenger_count"), Expr::Int(0));
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), 40);
}

#[test]
fn short_chunks_mask_their_tail_lanes() {
    // 5 rows: fewer than one lane group.
    let rows = taxi_rows(5);
    let table = MemTable::new(taxi_chunks(&rows, 16));
    assert_eq!(engine(1).count(&table, None).unwrap(), 5);

    let expected = rows.iter().filter(|r| r.passenger_count < 3).count() as u64;
    let predicate = Expr::bin(BinOp::Lt, Expr::path("passenger_count"), Expr::Int(3));
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

#[test]
fn missing_fields_never_match() {
    let rows = taxi_rows(64);
    let table = MemTable::new(taxi_chunks(&rows, 16));
    let predicate = Expr::bin(BinOp::Gt, Expr::path("no_such_field"), Expr::Int(0));
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), 0);

    // IS NULL treats missing as null.
    let is_null = Expr::IsNull(Box::new(Expr::path("no_such_field")));
    assert_eq!(engine(1).count(&table, Some(&is_null)).unwrap(), 64);
}

#[test]
fn projection_rewrites_rows() {
    let rows = taxi_rows(300);
    let table = MemTable::new(taxi_chunks(&rows, 64));
    let bindings = vec![
        ("fare".to_owned(), Expr::path("fare_amount")),
        (
            "double_fare".to_owned(),
            Expr::bin(BinOp::Mul, Expr::path("fare_amount"), Expr::Float(2.0)),
        ),
        (
            "cheap".to_owned(),
            Expr::bin(BinOp::Lt, Expr::path("fare_amount"), Expr::Float(10.0)),
        ),
    ];
    let collected = engine(1).project_collect(&table, &bindings).unwrap();
    let symtab = collected.symtab();
    let out = collected.rows();
    assert_eq!(out.len(), rows.len());

    // Output order within one worker is input order.
    for (rec, row) in out.iter().zip(&rows) {
        let fare = read_field_f64(rec, &symtab, "fare").unwrap();
        assert_eq!(fare, row.fare_amount);
        let double = read_field_f64(rec, &symtab, "double_fare").unwrap();
        assert_eq!(double, row.fare_amount * 2.0);
    }
}

#[test]
fn in_list_membership() {
    let rows = taxi_rows(1_000);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    let expected = rows
        .iter()
        .filter(|r| [1, 3, 5].contains(&r.passenger_count))
        .count() as u64;
    let predicate = Expr::In(
        Box::new(Expr::path("passenger_count")),
        vec![Expr::Int(1), Expr::Int(3), Expr::Int(5)],
    );
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

#[test]
fn arithmetic_in_predicates() {
    let rows = taxi_rows(1_000);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    // fare / distance > 10 (per-mile price), guarded by distance > 0.
    let expected = rows
        .iter()
        .filter(|r| r.trip_distance > 0.0 && r.fare_amount / r.trip_distance > 10.0)
        .count() as u64;
    let predicate = Expr::bin(
        BinOp::And,
        Expr::bin(BinOp::Gt, Expr::path("trip_distance"), Expr::Float(0.0)),
        Expr::bin(
            BinOp::Gt,
            Expr::bin(
                BinOp::Div,
                Expr::path("fare_amount"),
                Expr::path("trip_distance"),
            ),
            Expr::Float(10.0),
        ),
    );
    assert_eq!(engine(1).count(&table, Some(&predicate)).unwrap(), expected);
}

#[test]
fn passenger_counts_survive_decoding() {
    let rows = taxi_rows(100);
    let table = MemTable::new(taxi_chunks(&rows, 32));
    let predicate = Expr::bin(BinOp::Eq, Expr::path("passenger_count"), Expr::Int(6));
    let collected = engine(1).filter_collect(&table, &predicate).unwrap();
    let symtab = collected.symtab();
    for rec in collected.rows() {
        assert_eq!(read_field_i64(&rec, &symtab, "passenger_count"), Some(6));
    }
}
