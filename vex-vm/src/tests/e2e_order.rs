//! Ordering end-to-end: full sorts, the single-column fast path, top-K.

use super::data::{read_field_f64, read_field_i64, taxi_chunks, taxi_rows, TaxiRow};
use crate::expr::Expr;
use crate::pipeline::{MemTable, OrderKey, OrderSpec};
use crate::{Engine, EngineParams};

fn engine(workers: usize) -> Engine {
    Engine::new(EngineParams::default().with_parallelism(workers))
}

fn fare_key(desc: bool) -> OrderKey {
    OrderKey {
        expr: Expr::path("fare_amount"),
        desc,
    }
}

fn sorted_fares(rows: &[TaxiRow]) -> Vec<f64> {
    let mut fares: Vec<f64> = rows.iter().map(|r| r.fare_amount).collect();
    fares.sort_by(|a, b| a.partial_cmp(b).unwrap());
    fares
}

#[test]
fn single_column_sort_is_ascending() {
    let rows = taxi_rows(1_500);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    let collected = engine(1)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![fare_key(false)],
                limit: None,
            },
        )
        .unwrap();

    let symtab = collected.symtab();
    let fares: Vec<f64> = collected
        .rows()
        .iter()
        .map(|r| read_field_f64(r, &symtab, "fare_amount").unwrap())
        .collect();
    assert_eq!(fares, sorted_fares(&rows));
}

#[test]
fn descending_sort_reverses() {
    let rows = taxi_rows(800);
    let table = MemTable::new(taxi_chunks(&rows, 64));
    let collected = engine(1)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![fare_key(true)],
                limit: None,
            },
        )
        .unwrap();

    let symtab = collected.symtab();
    let fares: Vec<f64> = collected
        .rows()
        .iter()
        .map(|r| read_field_f64(r, &symtab, "fare_amount").unwrap())
        .collect();
    let mut expected = sorted_fares(&rows);
    expected.reverse();
    assert_eq!(fares, expected);
}

#[test]
fn multi_column_sort_orders_lexicographically() {
    let rows = taxi_rows(1_200);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    let collected = engine(2)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![
                    OrderKey {
                        expr: Expr::path("passenger_count"),
                        desc: false,
                    },
                    fare_key(true),
                ],
                limit: None,
            },
        )
        .unwrap();

    let symtab = collected.symtab();
    let decoded: Vec<(i64, f64)> = collected
        .rows()
        .iter()
        .map(|r| {
            (
                read_field_i64(r, &symtab, "passenger_count").unwrap(),
                read_field_f64(r, &symtab, "fare_amount").unwrap(),
            )
        })
        .collect();

    let mut expected: Vec<(i64, f64)> = rows
        .iter()
        .map(|r| (r.passenger_count, r.fare_amount))
        .collect();
    expected.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap())
    });
    assert_eq!(decoded, expected);
}

/// The spec's central top-K property: the bounded heap's output equals the
/// first `limit` elements of the full sort.
#[test]
fn top_k_equals_sorted_prefix() {
    let rows = taxi_rows(5_000);
    let table = MemTable::new(taxi_chunks(&rows, 256));
    for (limit, offset) in [(10, 0), (25, 5), (1, 0), (100, 17)] {
        let collected = engine(1)
            .order_collect(
                &table,
                OrderSpec {
                    keys: vec![fare_key(false)],
                    limit: Some((limit, offset)),
                },
            )
            .unwrap();
        let symtab = collected.symtab();
        let fares: Vec<f64> = collected
            .rows()
            .iter()
            .map(|r| read_field_f64(r, &symtab, "fare_amount").unwrap())
            .collect();

        let full = sorted_fares(&rows);
        let expected: Vec<f64> = full.iter().copied().skip(offset).take(limit).collect();
        assert_eq!(fares, expected, "limit {limit} offset {offset}");
    }
}

#[test]
fn top_k_descending_takes_the_largest() {
    let rows = taxi_rows(3_000);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    let collected = engine(1)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![fare_key(true)],
                limit: Some((20, 0)),
            },
        )
        .unwrap();
    let symtab = collected.symtab();
    let fares: Vec<f64> = collected
        .rows()
        .iter()
        .map(|r| read_field_f64(r, &symtab, "fare_amount").unwrap())
        .collect();

    let mut expected = sorted_fares(&rows);
    expected.reverse();
    expected.truncate(20);
    assert_eq!(fares, expected);
}

/// The prefilter only ever discards rows that cannot enter the heap, so
/// results are identical with many workers and many chunks.
#[test]
fn top_k_is_parallel_stable() {
    let rows = taxi_rows(6_000);
    let table = MemTable::new(taxi_chunks(&rows, 64));
    let spec = || OrderSpec {
        keys: vec![fare_key(false)],
        limit: Some((50, 0)),
    };
    let solo = engine(1).order_collect(&table, spec()).unwrap();
    let fleet = engine(4).order_collect(&table, spec()).unwrap();

    let sy1 = solo.symtab();
    let sy4 = fleet.symtab();
    let f1: Vec<f64> = solo
        .rows()
        .iter()
        .map(|r| read_field_f64(r, &sy1, "fare_amount").unwrap())
        .collect();
    let f4: Vec<f64> = fleet
        .rows()
        .iter()
        .map(|r| read_field_f64(r, &sy4, "fare_amount").unwrap())
        .collect();
    assert_eq!(f1, f4);
}

/// Integer keys beyond double precision: consecutive values up there alias
/// pairwise when rounded to a double, so the sort must not go through one.
#[test]
fn integer_keys_above_double_precision_sort_exactly() {
    use std::sync::Arc;

    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use vex_types::{Composer, Symtab};

    use crate::pipeline::ChunkBuilder;

    let base = 1i64 << 53;
    let mut values: Vec<i64> = (0..240).map(|i| base + i).collect();
    values.shuffle(&mut rand::rngs::StdRng::seed_from_u64(0x0bde_7));

    let mut symtab = Symtab::new();
    let big = symtab.intern("big");
    let symtab = Arc::new(symtab);
    let mut chunks = Vec::new();
    for batch in values.chunks(64) {
        let mut builder = ChunkBuilder::new();
        let mut c = Composer::new();
        for &v in batch {
            c.begin_struct();
            c.field(big);
            c.put_int(v);
            c.end();
            builder.push_record(&c.take()).unwrap();
        }
        chunks.push(builder.finish(Arc::clone(&symtab)));
    }
    let table = MemTable::new(chunks);

    let key = || OrderKey {
        expr: Expr::path("big"),
        desc: false,
    };
    let mut expected = values.clone();
    expected.sort_unstable();

    let collected = engine(1)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![key()],
                limit: None,
            },
        )
        .unwrap();
    let out_symtab = collected.symtab();
    let sorted: Vec<i64> = collected
        .rows()
        .iter()
        .map(|r| read_field_i64(r, &out_symtab, "big").unwrap())
        .collect();
    assert_eq!(sorted, expected);

    // The bounded heap (and its exact integer prefilter) agrees with the
    // full sort's prefix.
    let topk = engine(2)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![key()],
                limit: Some((10, 0)),
            },
        )
        .unwrap();
    let topk_symtab = topk.symtab();
    let head: Vec<i64> = topk
        .rows()
        .iter()
        .map(|r| read_field_i64(r, &topk_symtab, "big").unwrap())
        .collect();
    assert_eq!(head, expected[..10]);
}

/// A record referencing a symbol id its own table never assigned cannot be
/// remapped; the sort surfaces that as the categorical fault.
#[test]
fn incompatible_symbol_references_fail_the_sort() {
    use std::sync::Arc;

    use vex_asm::Fault;
    use vex_types::{Composer, SymbolId, Symtab};

    use crate::pipeline::ChunkBuilder;

    let mut st1 = Symtab::new();
    let a = st1.intern("a");
    let mut builder = ChunkBuilder::new();
    let mut c = Composer::new();
    c.begin_struct();
    c.field(a);
    c.put_int(1);
    c.end();
    builder.push_record(&c.take()).unwrap();
    let chunk1 = builder.finish(Arc::new(st1));

    // The second chunk's table assigns only `b`, but its record labels a
    // field with an id two past the table's end.
    let mut st2 = Symtab::new();
    st2.intern("b");
    let rogue = SymbolId::new(12).unwrap();
    let mut builder = ChunkBuilder::new();
    c.begin_struct();
    c.field(rogue);
    c.put_int(2);
    c.end();
    builder.push_record(&c.take()).unwrap();
    let chunk2 = builder.finish(Arc::new(st2));

    let table = MemTable::new(vec![chunk1, chunk2]);
    let err = engine(1)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![OrderKey {
                    expr: Expr::path("a"),
                    desc: false,
                }],
                limit: None,
            },
        )
        .unwrap_err();
    assert_eq!(err.fault(), Some(Fault::SymbolTableIncompatible));
}

#[test]
fn string_keys_sort_and_prefilter() {
    let rows = super::data::citation_rows(2_000);
    let table = MemTable::new(super::data::citation_chunks(&rows, 64));
    let collected = engine(2)
        .order_collect(
            &table,
            OrderSpec {
                keys: vec![OrderKey {
                    expr: Expr::path("ViolationDescr"),
                    desc: false,
                }],
                limit: Some((30, 0)),
            },
        )
        .unwrap();

    let symtab = collected.symtab();
    let descrs: Vec<String> = collected
        .rows()
        .iter()
        .map(|r| super::data::read_field_str(r, &symtab, "ViolationDescr").unwrap())
        .collect();

    let mut expected: Vec<String> = rows.iter().map(|r| r.descr.clone()).collect();
    expected.sort();
    expected.truncate(30);
    assert_eq!(descrs, expected);
}
