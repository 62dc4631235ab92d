//! Benchmarks for token stream decoding.

#![allow(clippy::unwrap_used, missing_docs)]

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tds_codec::Channel;
use tds_engine::{Collect, Discard, Session, SessionConfig, SessionState, TokenSink, TokenStream};
use tds_protocol::token::{Done, DoneStatus, TokenType};
use tds_protocol::version::ProtocolTier;
use tds_protocol::wire::Step;

const ROWS: u32 = 1000;

/// Three columns (INT, NVARCHAR(64), nullable BIGINT) and `ROWS` rows, framed
/// into 4096-byte packets.
fn wire() -> Vec<u8> {
    let mut payload = vec![0x81, 0x03, 0x00];
    let columns: [(&[u8], &str); 3] = [
        (&[0x38], "id"),
        (&[0xE7, 0x80, 0x00, 0x09, 0x04, 0xD0, 0x00, 0x34], "name"),
        (&[0x26, 0x08], "total"),
    ];
    for (type_info, name) in columns {
        payload.extend_from_slice(&[0, 0, 0, 0, 0x01, 0x00]);
        payload.extend_from_slice(type_info);
        payload.push(name.len() as u8);
        payload.extend(name.encode_utf16().flat_map(u16::to_le_bytes));
    }
    for i in 0..ROWS {
        payload.push(0xD1);
        payload.extend_from_slice(&i.to_le_bytes());
        let name: Vec<u8> = format!("customer {i}")
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
        payload.extend(name);
        payload.push(8);
        payload.extend_from_slice(&(i64::from(i) * 100).to_le_bytes());
    }
    Done {
        status: DoneStatus::COUNT,
        cur_cmd: 0xC1,
        row_count: u64::from(ROWS),
    }
    .encode(TokenType::Done, ProtocolTier::Denali, &mut payload);

    let mut out = Vec::new();
    let chunks: Vec<&[u8]> = payload.chunks(4088).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let status = u8::from(i + 1 == chunks.len());
        out.extend_from_slice(&[0x04, status]);
        out.extend_from_slice(&((8 + chunk.len()) as u16).to_be_bytes());
        out.extend_from_slice(&[0x00, 0x00, (i + 1) as u8, 0x00]);
        out.extend_from_slice(chunk);
    }
    out
}

fn logged_in() -> Session {
    let mut session = Session::new(&SessionConfig::default());
    session.transition(SessionState::OpenNotLoggedIn).unwrap();
    session.transition(SessionState::OpenLoggedIn).unwrap();
    session
}

fn run(wire: &[u8], sink: &mut dyn TokenSink) -> u64 {
    let mut ch = Channel::new();
    ch.feed(wire);
    let mut session = logged_in();
    let mut stream = TokenStream::new();
    match stream.advance(&mut ch, &mut session, sink).unwrap() {
        Step::Ready(summary) => summary.rows_affected,
        Step::NeedMore => unreachable!("response is complete"),
    }
}

fn bench_rows(c: &mut Criterion) {
    let wire = wire();
    let mut group = c.benchmark_group("token_stream");
    group.throughput(Throughput::Elements(u64::from(ROWS)));

    group.bench_function("materialize", |b| {
        b.iter_batched(
            Collect::new,
            |mut collect| black_box(run(&wire, &mut collect)),
            BatchSize::SmallInput,
        )
    });
    group.bench_function("skip", |b| b.iter(|| black_box(run(&wire, &mut Discard))));
    group.finish();
}

criterion_group!(benches, bench_rows);
criterion_main!(benches);
