//! Grouped aggregation end-to-end.

use std::collections::HashMap;

use vex_types::{decode_header, read_int, Kind};

use super::data::{taxi_chunks, taxi_rows};
use crate::agg::{AggKind, AggValue};
use crate::expr::{AggSpec, BinOp, Expr};
use crate::pipeline::MemTable;
use crate::{Engine, EngineParams};

fn engine(workers: usize) -> Engine {
    Engine::new(EngineParams::default().with_parallelism(workers))
}

fn decode_int_key(bytes: &[u8]) -> i64 {
    let h = decode_header(bytes).unwrap();
    read_int(h.kind, &bytes[h.header_len..h.total_len()]).unwrap()
}

#[test]
fn group_by_int_sums_and_counts() {
    let rows = taxi_rows(4_000);
    let table = MemTable::new(taxi_chunks(&rows, 256));

    let groups = engine(1)
        .group_aggregate(
            &table,
            vec![Expr::path("passenger_count")],
            vec![
                AggSpec {
                    label: "total".into(),
                    kind: AggKind::SumF,
                    arg: Some(Expr::path("fare_amount")),
                    filter: None,
                },
                AggSpec {
                    label: "rides".into(),
                    kind: AggKind::Count,
                    arg: None,
                    filter: None,
                },
            ],
        )
        .unwrap();

    let mut expected_cents: HashMap<i64, i64> = HashMap::new();
    let mut expected_counts: HashMap<i64, u64> = HashMap::new();
    for r in &rows {
        *expected_cents.entry(r.passenger_count).or_default() +=
            (r.fare_amount * 100.0).round() as i64;
        *expected_counts.entry(r.passenger_count).or_default() += 1;
    }

    assert_eq!(groups.len(), expected_counts.len());
    for g in &groups {
        let key = decode_int_key(&g.keys[0]);
        let want_sum = expected_cents[&key] as f64 / 100.0;
        match g.values[0] {
            AggValue::Float(got) => {
                assert!((got - want_sum).abs() <= want_sum.abs() * 1e-9, "group {key}")
            }
            ref other => panic!("unexpected {other:?}"),
        }
        assert_eq!(g.values[1], AggValue::UInt(expected_counts[&key]));
    }
}

#[test]
fn grouped_min_max() {
    let rows = taxi_rows(2_000);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    let groups = engine(1)
        .group_aggregate(
            &table,
            vec![Expr::path("passenger_count")],
            vec![
                AggSpec {
                    label: "lo".into(),
                    kind: AggKind::MinF,
                    arg: Some(Expr::path("fare_amount")),
                    filter: None,
                },
                AggSpec {
                    label: "hi".into(),
                    kind: AggKind::MaxF,
                    arg: Some(Expr::path("fare_amount")),
                    filter: None,
                },
            ],
        )
        .unwrap();

    let mut lo: HashMap<i64, f64> = HashMap::new();
    let mut hi: HashMap<i64, f64> = HashMap::new();
    for r in &rows {
        let l = lo.entry(r.passenger_count).or_insert(f64::INFINITY);
        *l = l.min(r.fare_amount);
        let h = hi.entry(r.passenger_count).or_insert(f64::NEG_INFINITY);
        *h = h.max(r.fare_amount);
    }
    for g in &groups {
        let key = decode_int_key(&g.keys[0]);
        assert_eq!(g.values[0], AggValue::Float(lo[&key]));
        assert_eq!(g.values[1], AggValue::Float(hi[&key]));
    }
}

#[test]
fn grouped_results_are_parallel_stable() {
    let rows = taxi_rows(3_000);
    let table = MemTable::new(taxi_chunks(&rows, 64));
    let run = |workers| {
        let groups = engine(workers)
            .group_aggregate(
                &table,
                vec![Expr::path("passenger_count")],
                vec![AggSpec {
                    label: "rides".into(),
                    kind: AggKind::Count,
                    arg: None,
                    filter: None,
                }],
            )
            .unwrap();
        let mut by_key: Vec<(i64, u64)> = groups
            .iter()
            .map(|g| {
                let k = decode_int_key(&g.keys[0]);
                match g.values[0] {
                    AggValue::UInt(n) => (k, n),
                    ref other => panic!("unexpected {other:?}"),
                }
            })
            .collect();
        by_key.sort_unstable();
        by_key
    };
    assert_eq!(run(1), run(4));
}

#[test]
fn grouped_filters_apply_per_aggregate() {
    let rows = taxi_rows(1_500);
    let table = MemTable::new(taxi_chunks(&rows, 128));
    let long_trip = Expr::bin(BinOp::Gt, Expr::path("trip_distance"), Expr::Float(10.0));
    let groups = engine(1)
        .group_aggregate(
            &table,
            vec![Expr::path("passenger_count")],
            vec![
                AggSpec {
                    label: "all".into(),
                    kind: AggKind::Count,
                    arg: None,
                    filter: None,
                },
                AggSpec {
                    label: "long".into(),
                    kind: AggKind::Count,
                    arg: None,
                    filter: Some(long_trip),
                },
            ],
        )
        .unwrap();

    let mut all: HashMap<i64, u64> = HashMap::new();
    let mut long: HashMap<i64, u64> = HashMap::new();
    for r in &rows {
        *all.entry(r.passenger_count).or_default() += 1;
        if r.trip_distance > 10.0 {
            *long.entry(r.passenger_count).or_default() += 1;
        }
    }
    for g in &groups {
        let key = decode_int_key(&g.keys[0]);
        assert_eq!(g.values[0], AggValue::UInt(all[&key]));
        assert_eq!(
            g.values[1],
            AggValue::UInt(long.get(&key).copied().unwrap_or(0))
        );
    }
}

#[test]
fn string_group_keys_round_trip() {
    let rows = super::data::citation_rows(800);
    let table = MemTable::new(super::data::citation_chunks(&rows, 64));
    let groups = engine(1)
        .group_aggregate(
            &table,
            vec![Expr::path("ViolationDescr")],
            vec![AggSpec {
                label: "n".into(),
                kind: AggKind::Count,
                arg: None,
                filter: None,
            }],
        )
        .unwrap();

    let mut expected: HashMap<String, u64> = HashMap::new();
    for r in &rows {
        *expected.entry(r.descr.clone()).or_default() += 1;
    }
    assert_eq!(groups.len(), expected.len());
    for g in &groups {
        let h = decode_header(&g.keys[0]).unwrap();
        assert_eq!(h.kind, Kind::String);
        let key = String::from_utf8(g.keys[0][h.header_len..h.total_len()].to_vec()).unwrap();
        match g.values[0] {
            AggValue::UInt(n) => assert_eq!(n, expected[&key], "group {key}"),
            ref other => panic!("unexpected {other:?}"),
        }
    }
}
