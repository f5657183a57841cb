//! String predicate end-to-end: LIKE, prefix/suffix, equality.

use super::data::{citation_chunks, citation_rows};
use crate::expr::{BinOp, Expr};
use crate::pipeline::MemTable;
use crate::{Engine, EngineParams};

fn engine(workers: usize) -> Engine {
    Engine::new(EngineParams::default().with_parallelism(workers))
}

fn like(pattern: &str) -> Expr {
    Expr::Like {
        expr: Box::new(Expr::path("ViolationDescr")),
        pattern: pattern.to_owned(),
        ci: false,
    }
}

#[test]
fn like_contains() {
    let rows = citation_rows(1_000);
    let table = MemTable::new(citation_chunks(&rows, 128));
    // `%NO%` is plain containment; the reference check is independent of
    // the engine's pattern machinery.
    let expected = rows.iter().filter(|r| r.descr.contains("NO")).count() as u64;
    assert!(expected > 0);
    assert_eq!(
        engine(1).count(&table, Some(&like("%NO%"))).unwrap(),
        expected
    );
}

#[test]
fn like_anchored_prefix_and_suffix() {
    let rows = citation_rows(1_000);
    let table = MemTable::new(citation_chunks(&rows, 128));

    let starts = rows.iter().filter(|r| r.descr.starts_with("NO")).count() as u64;
    assert_eq!(engine(1).count(&table, Some(&like("NO%"))).unwrap(), starts);

    let ends = rows.iter().filter(|r| r.descr.ends_with("ZONE")).count() as u64;
    assert!(ends > 0);
    assert_eq!(engine(1).count(&table, Some(&like("%ZONE"))).unwrap(), ends);
}

#[test]
fn like_single_wildcards() {
    let rows = citation_rows(1_000);
    let table = MemTable::new(citation_chunks(&rows, 128));
    // `_O%`: second byte is a literal O.
    let expected = rows
        .iter()
        .filter(|r| r.descr.as_bytes().get(1) == Some(&b'O'))
        .count() as u64;
    assert!(expected > 0);
    assert_eq!(engine(1).count(&table, Some(&like("_O%"))).unwrap(), expected);
}

#[test]
fn like_mixed_pattern() {
    let rows = citation_rows(1_000);
    let table = MemTable::new(citation_chunks(&rows, 128));
    // `_O%_DENCE%R_G` picks out "NO EVIDENCE OF REG" and nothing else in
    // the pool.
    let expected = rows
        .iter()
        .filter(|r| r.descr == "NO EVIDENCE OF REG")
        .count() as u64;
    assert!(expected > 0);
    assert_eq!(
        engine(1)
            .count(&table, Some(&like("_O%_DENCE%R_G")))
            .unwrap(),
        expected
    );
}

#[test]
fn string_equality_and_inequality() {
    let rows = citation_rows(600);
    let table = MemTable::new(citation_chunks(&rows, 64));

    let eq = Expr::bin(
        BinOp::Eq,
        Expr::path("ViolationDescr"),
        Expr::Str("RED ZONE".to_owned()),
    );
    let expected = rows.iter().filter(|r| r.descr == "RED ZONE").count() as u64;
    assert_eq!(engine(1).count(&table, Some(&eq)).unwrap(), expected);

    let ne = Expr::bin(
        BinOp::Ne,
        Expr::path("ViolationDescr"),
        Expr::Str("RED ZONE".to_owned()),
    );
    assert_eq!(
        engine(1).count(&table, Some(&ne)).unwrap(),
        rows.len() as u64 - expected
    );
}

#[test]
fn string_ordering_against_literals() {
    let rows = citation_rows(600);
    let table = MemTable::new(citation_chunks(&rows, 64));
    let lt = Expr::bin(
        BinOp::Lt,
        Expr::path("ViolationDescr"),
        Expr::Str("NO".to_owned()),
    );
    let expected = rows.iter().filter(|r| r.descr.as_str() < "NO").count() as u64;
    assert_eq!(engine(1).count(&table, Some(&lt)).unwrap(), expected);
}

#[test]
fn like_counts_are_parallel_stable() {
    let rows = citation_rows(2_000);
    let table = MemTable::new(citation_chunks(&rows, 64));
    let solo = engine(1).count(&table, Some(&like("%NO%"))).unwrap();
    assert_eq!(engine(4).count(&table, Some(&like("%NO%"))).unwrap(), solo);
}

#[test]
fn substring_projection() {
    let rows = citation_rows(200);
    let table = MemTable::new(citation_chunks(&rows, 32));
    let bindings = vec![(
        "head".to_owned(),
        Expr::Substr(
            Box::new(Expr::path("ViolationDescr")),
            Box::new(Expr::Int(1)),
            Box::new(Expr::Int(2)),
        ),
    )];
    let collected = engine(1).project_collect(&table, &bindings).unwrap();
    let symtab = collected.symtab();
    for (rec, row) in collected.rows().iter().zip(&rows) {
        let head = super::data::read_field_str(rec, &symtab, "head").unwrap();
        assert_eq!(head, row.descr[..2]);
    }
}

#[test]
fn strlen_and_trim_compose() {
    let rows = citation_rows(400);
    let table = MemTable::new(citation_chunks(&rows, 64));
    // Every description in the pool is at least 8 bytes long.
    let pred = Expr::bin(
        BinOp::Ge,
        Expr::StrLen(Box::new(Expr::Trim(Box::new(Expr::path("ViolationDescr"))))),
        Expr::Int(8),
    );
    assert_eq!(
        engine(1).count(&table, Some(&pred)).unwrap(),
        rows.len() as u64
    );
}
