//! Deterministic synthetic datasets shaped like the classic demo tables:
//! a taxi-trip table (numeric columns) and a parking-citation table
//! (string-heavy). Fixed seeds keep every expected value reproducible.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vex_types::{Composer, Symtab};

use crate::pipeline::{Chunk, ChunkBuilder};

pub const TAXI_SEED: u64 = 0x7a78_6921;
pub const CITATION_SEED: u64 = 0x9ca7_0451;

#[derive(Debug, Clone)]
pub struct TaxiRow {
    pub fare_amount: f64,
    pub passenger_count: i64,
    pub trip_distance: f64,
    pub payment: &'static str,
}

const PAYMENTS: [&str; 4] = ["CASH", "CREDIT", "DISPUTE", "NO CHARGE"];

pub fn taxi_rows(n: usize) -> Vec<TaxiRow> {
    let mut rng = StdRng::seed_from_u64(TAXI_SEED);
    (0..n)
        .map(|_| {
            // Two-decimal fares so float sums have an exact reference.
            let cents: i64 = rng.gen_range(250..=11690);
            let fare_amount = cents as f64 / 100.0;
            TaxiRow {
                fare_amount,
                passenger_count: rng.gen_range(0..=6),
                trip_distance: (rng.gen_range(1..=400) as f64) / 16.0,
                payment: PAYMENTS[rng.gen_range(0..PAYMENTS.len())],
            }
        })
        .collect()
}

/// Encode taxi rows into chunks of `chunk_rows` under one shared table.
pub fn taxi_chunks(rows: &[TaxiRow], chunk_rows: usize) -> Vec<Chunk> {
    let mut symtab = Symtab::new();
    let fare = symtab.intern("fare_amount");
    let passengers = symtab.intern("passenger_count");
    let distance = symtab.intern("trip_distance");
    let payment = symtab.intern("payment");
    let symtab = Arc::new(symtab);

    let mut chunks = Vec::new();
    for batch in rows.chunks(chunk_rows.max(1)) {
        let mut builder = ChunkBuilder::new();
        let mut c = Composer::new();
        for row in batch {
            c.begin_struct();
            c.field(fare);
            c.put_f64(row.fare_amount);
            c.field(passengers);
            c.put_int(row.passenger_count);
            c.field(distance);
            c.put_f64(row.trip_distance);
            c.field(payment);
            c.put_string(row.payment);
            c.end();
            builder.push_record(&c.take()).unwrap();
        }
        chunks.push(builder.finish(Arc::clone(&symtab)));
    }
    chunks
}

#[derive(Debug, Clone)]
pub struct CitationRow {
    pub descr: String,
    pub fine: i64,
}

const DESCR_POOL: [&str; 8] = [
    "NO PARKING",
    "NO EVIDENCE OF REG",
    "EXPIRED METER",
    "RED ZONE",
    "NO STOPPING",
    "BLOCKING DRIVEWAY",
    "STANDING IN BUS ZONE",
    "METER EXPIRED NO COIN",
];

pub fn citation_rows(n: usize) -> Vec<CitationRow> {
    let mut rng = StdRng::seed_from_u64(CITATION_SEED);
    (0..n)
        .map(|_| CitationRow {
            descr: DESCR_POOL[rng.gen_range(0..DESCR_POOL.len())].to_owned(),
            fine: rng.gen_range(25..=330),
        })
        .collect()
}

pub fn citation_chunks(rows: &[CitationRow], chunk_rows: usize) -> Vec<Chunk> {
    let mut symtab = Symtab::new();
    let descr = symtab.intern("ViolationDescr");
    let fine = symtab.intern("Fine");
    let symtab = Arc::new(symtab);

    let mut chunks = Vec::new();
    for batch in rows.chunks(chunk_rows.max(1)) {
        let mut builder = ChunkBuilder::new();
        let mut c = Composer::new();
        for row in batch {
            c.begin_struct();
            c.field(descr);
            c.put_string(&row.descr);
            c.field(fine);
            c.put_int(row.fine);
            c.end();
            builder.push_record(&c.take()).unwrap();
        }
        chunks.push(builder.finish(Arc::clone(&symtab)));
    }
    chunks
}

/// A tiny keyed table for join tests: `{n: 1}` .. `{n: count}`.
pub fn numbers_chunk(count: usize) -> Chunk {
    let mut symtab = Symtab::new();
    let n = symtab.intern("n");
    let mut builder = ChunkBuilder::new();
    let mut c = Composer::new();
    for i in 1..=count {
        c.begin_struct();
        c.field(n);
        c.put_int(i as i64);
        c.end();
        builder.push_record(&c.take()).unwrap();
    }
    builder.finish(Arc::new(symtab))
}

/// Decode a named float field from an encoded record.
pub fn read_field_f64(record: &[u8], symtab: &Symtab, name: &str) -> Option<f64> {
    let sym = symtab.lookup(name)?;
    let header = vex_types::decode_header(record).ok()?;
    for field in vex_types::FieldIter::new(&record[header.header_len..header.total_len()]) {
        let (fsym, value) = field.ok()?;
        if fsym == sym {
            let vh = vex_types::decode_header(value).ok()?;
            return match vh.kind {
                vex_types::Kind::Float => {
                    vex_types::read_f64(&value[vh.header_len..]).ok()
                }
                vex_types::Kind::Uint | vex_types::Kind::Int => {
                    vex_types::read_int(vh.kind, &value[vh.header_len..])
                        .ok()
                        .map(|v| v as f64)
                }
                _ => None,
            };
        }
    }
    None
}

/// Decode a named integer field from an encoded record, losslessly.
pub fn read_field_i64(record: &[u8], symtab: &Symtab, name: &str) -> Option<i64> {
    let sym = symtab.lookup(name)?;
    let header = vex_types::decode_header(record).ok()?;
    for field in vex_types::FieldIter::new(&record[header.header_len..header.total_len()]) {
        let (fsym, value) = field.ok()?;
        if fsym == sym {
            let vh = vex_types::decode_header(value).ok()?;
            return match vh.kind {
                vex_types::Kind::Uint | vex_types::Kind::Int => {
                    vex_types::read_int(vh.kind, &value[vh.header_len..vh.total_len()]).ok()
                }
                vex_types::Kind::Float => vex_types::read_f64(&value[vh.header_len..vh.total_len()])
                    .ok()
                    .map(|v| v as i64),
                _ => None,
            };
        }
    }
    None
}

/// Decode a named string field from an encoded record.
pub fn read_field_str(record: &[u8], symtab: &Symtab, name: &str) -> Option<String> {
    let sym = symtab.lookup(name)?;
    let header = vex_types::decode_header(record).ok()?;
    for field in vex_types::FieldIter::new(&record[header.header_len..header.total_len()]) {
        let (fsym, value) = field.ok()?;
        if fsym == sym {
            let vh = vex_types::decode_header(value).ok()?;
            if vh.kind != vex_types::Kind::String {
                return None;
            }
            return String::from_utf8(value[vh.header_len..vh.total_len()].to_vec()).ok();
        }
    }
    None
}
