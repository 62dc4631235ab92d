//! Benchmarks for value decoding and encoding.

#![allow(clippy::unwrap_used, missing_docs)]

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tds_protocol::collation::Collation;
use tds_protocol::metadata::TypeInfo;
use tds_protocol::version::ProtocolTier;
use tds_protocol::wire::Reader;
use tds_values::plp::{PlpMode, PlpReader, write_plp};
use tds_values::{SqlValue, decode_value, encode_type_info, encode_value, param_type_info};

const LATIN1: Collation = Collation::new(0x00D0_0409, 0x34);

fn encoded(value: &SqlValue) -> (TypeInfo, Vec<u8>) {
    let info = param_type_info(value, LATIN1).unwrap();
    let mut header = Vec::new();
    encode_type_info(&mut header, &info).unwrap();
    let info = TypeInfo::decode(&mut Reader::exact(&header), ProtocolTier::Denali).unwrap();
    let mut data = Vec::new();
    encode_value(&mut data, value, &info).unwrap();
    (info, data)
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_value");

    for (name, value) in [
        ("int", SqlValue::Int(123_456)),
        ("nvarchar", SqlValue::from("This is a typical database column value")),
        (
            "datetime2",
            SqlValue::DateTime2(
                chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
                    .unwrap()
                    .and_hms_opt(12, 30, 0)
                    .unwrap(),
            ),
        ),
    ] {
        let (info, data) = encoded(&value);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| decode_value(&mut Reader::new(black_box(&data)), &info).unwrap())
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let value = SqlValue::from("This is a typical database column value");
    let info = param_type_info(&value, LATIN1).unwrap();
    c.bench_function("encode_value/nvarchar", |b| {
        b.iter(|| {
            let mut buf = Vec::with_capacity(128);
            encode_value(&mut buf, black_box(&value), &info).unwrap();
            black_box(buf)
        })
    });
}

fn bench_plp(c: &mut Criterion) {
    let mut group = c.benchmark_group("plp");
    let data = vec![0x5Au8; 1 << 20];
    let mut wire = Vec::new();
    write_plp(&mut wire, &data, 8000, true);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, mode) in [("materialize", PlpMode::Materialize), ("skip", PlpMode::Skip)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut reader = PlpReader::new(mode);
                let mut pos = 0;
                // Feed in 4096-byte slices, the size of a default packet.
                loop {
                    let end = (pos + 4096).min(wire.len());
                    let (used, value) = reader.advance(&wire[pos..end]).unwrap();
                    pos += used;
                    if let Some(value) = value {
                        break black_box(value);
                    }
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode, bench_plp);
criterion_main!(benches);
