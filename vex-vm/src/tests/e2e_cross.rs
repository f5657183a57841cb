//! Cross-join end-to-end.

use super::data::{citation_chunks, citation_rows, numbers_chunk};
use crate::expr::{BinOp, Expr};
use crate::pipeline::MemTable;
use crate::{Engine, EngineParams};

fn engine(workers: usize) -> Engine {
    Engine::new(EngineParams::default().with_parallelism(workers))
}

/// Joining against a small table and filtering on `right.n = 1` recovers
/// exactly the left row count.
#[test]
fn cross_join_with_unit_filter_preserves_left_count() {
    let rows = citation_rows(1_023);
    let left = MemTable::new(citation_chunks(&rows, 128));
    let right = vec![numbers_chunk(5)];
    let predicate = Expr::bin(BinOp::Eq, Expr::path("n"), Expr::Int(1));

    let n = engine(1)
        .cross_filter_count(&left, &right, &predicate)
        .unwrap();
    assert_eq!(n, 1_023);
}

#[test]
fn unfiltered_cross_join_multiplies() {
    let rows = citation_rows(200);
    let left = MemTable::new(citation_chunks(&rows, 64));
    let right = vec![numbers_chunk(5)];
    let all = Expr::Bool(true);
    let n = engine(2).cross_filter_count(&left, &right, &all).unwrap();
    assert_eq!(n, 200 * 5);
}

#[test]
fn joined_rows_keep_both_sides_addressable() {
    let rows = citation_rows(60);
    let left = MemTable::new(citation_chunks(&rows, 16));
    let right = vec![numbers_chunk(3)];

    // Combined predicate touching both sides.
    let predicate = Expr::bin(
        BinOp::And,
        Expr::bin(BinOp::Eq, Expr::path("n"), Expr::Int(2)),
        Expr::bin(BinOp::Ge, Expr::path("Fine"), Expr::Int(25)),
    );
    let n = engine(1)
        .cross_filter_count(&left, &right, &predicate)
        .unwrap();
    // Every fine is >= 25, so the join keeps one right row per left row.
    assert_eq!(n, 60);
}
