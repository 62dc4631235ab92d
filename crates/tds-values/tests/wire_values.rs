//! Value codec behavior against wire input split at arbitrary points.

#![allow(clippy::unwrap_used, clippy::panic, missing_docs)]

use bytes::Bytes;
use proptest::prelude::*;
use tds_protocol::collation::Collation;
use tds_protocol::metadata::TypeInfo;
use tds_protocol::version::ProtocolTier;
use tds_protocol::wire::Reader;
use tds_values::plp::{PlpMode, PlpReader, PlpValue, write_plp_chunks};
use tds_values::{
    DecodeError, FromSql, SqlValue, decode_value, encode_type_info, encode_value,
    param_type_info,
};

const LATIN1: Collation = Collation::new(0x00D0_0409, 0x34);

fn wire(value: &SqlValue) -> (TypeInfo, Vec<u8>) {
    let info = param_type_info(value, LATIN1).unwrap();
    let mut header = Vec::new();
    encode_type_info(&mut header, &info).unwrap();
    let info = TypeInfo::decode(&mut Reader::exact(&header), ProtocolTier::Denali).unwrap();
    let mut data = Vec::new();
    encode_value(&mut data, value, &info).unwrap();
    (info, data)
}

#[test]
fn every_proper_prefix_is_incomplete() {
    let value = SqlValue::from("prefix check");
    let (info, data) = wire(&value);
    for end in 0..data.len() {
        assert_eq!(
            decode_value(&mut Reader::new(&data[..end]), &info),
            Err(DecodeError::Incomplete),
            "prefix of {end} bytes"
        );
    }
    assert_eq!(decode_value(&mut Reader::new(&data), &info).unwrap(), value);
}

#[test]
fn plp_chunks_reassemble_across_buffers() {
    let mut data = Vec::new();
    write_plp_chunks(&mut data, None, [&b"first "[..], b"", b"second"]);

    let mut reader = PlpReader::new(PlpMode::Materialize);
    let (used, value) = reader.advance(&data[..10]).unwrap();
    assert!(value.is_none());
    let (_, value) = reader.advance(&data[used..]).unwrap();
    assert_eq!(
        value,
        Some(PlpValue::Data(Bytes::from_static(b"first second")))
    );
}

#[test]
fn decoded_values_convert() {
    let (info, data) = wire(&SqlValue::BigInt(-40));
    let value = decode_value(&mut Reader::new(&data), &info).unwrap();
    assert_eq!(i64::from_sql(&value).unwrap(), -40);
    assert_eq!(Option::<String>::from_sql(&SqlValue::Null).unwrap(), None);
}

proptest! {
    #[test]
    fn strings_round_trip(s in "\\PC{0,300}") {
        let value = SqlValue::String(s);
        let (info, data) = wire(&value);
        prop_assert_eq!(decode_value(&mut Reader::new(&data), &info).unwrap(), value);
    }

    #[test]
    fn integers_round_trip(v in any::<i64>()) {
        let value = SqlValue::BigInt(v);
        let (info, data) = wire(&value);
        prop_assert_eq!(decode_value(&mut Reader::new(&data), &info).unwrap(), value);
    }

    #[test]
    fn plp_survives_any_split(
        payload in proptest::collection::vec(any::<u8>(), 0..2000),
        chunk in 1usize..700,
        split in 1usize..64,
    ) {
        let mut data = Vec::new();
        tds_values::plp::write_plp(&mut data, &payload, chunk, true);

        let mut reader = PlpReader::new(PlpMode::Materialize);
        let mut pending: Vec<u8> = Vec::new();
        let mut out = None;
        for piece in data.chunks(split) {
            pending.extend_from_slice(piece);
            let (used, value) = reader.advance(&pending).unwrap();
            pending.drain(..used);
            if value.is_some() {
                out = value;
            }
        }
        prop_assert!(pending.is_empty());
        prop_assert_eq!(out, Some(PlpValue::Data(Bytes::from(payload))));
    }
}
