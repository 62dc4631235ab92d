//! Framing behavior across packet and transport boundaries.

#![allow(clippy::unwrap_used)]

use bytes::BytesMut;
use proptest::prelude::*;
use tds_codec::{Channel, CodecError, Connection};
use tds_protocol::packet::{PacketStatus, PacketType};
use tds_protocol::wire::Step;

fn tabular(status: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut buf = vec![0x04, status];
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&[0x00, 0x35, id, 0x00]);
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn packet_size_grows_in_the_middle_of_a_response() {
    let mut ch = Channel::new();
    // First packet fits the 4096 default; the second only fits after the
    // session announces 8192.
    ch.feed(&tabular(0, 1, &[0xE3; 100]));
    ch.feed(&tabular(1, 2, &[0xAA; 7000]));

    assert_eq!(ch.try_read_bytes(100).unwrap(), Step::Ready(vec![0xE3; 100].into()));
    ch.set_packet_size(8192).unwrap();
    let Step::Ready(rest) = ch.try_read_bytes(7000).unwrap() else {
        panic!("second packet not decoded");
    };
    assert!(rest.iter().all(|b| *b == 0xAA));
    assert!(ch.message_complete());
}

#[test]
fn oversize_packet_without_negotiation_is_fatal() {
    let mut ch = Channel::new();
    ch.feed(&tabular(1, 1, &[0; 7000]));
    let err = ch.try_fill().unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
    assert!(ch.is_broken());
}

#[test]
fn every_message_starts_at_packet_one() {
    let mut ch = Channel::new();
    ch.set_packet_size(512).unwrap();
    ch.write_message(PacketType::Rpc, &[0; 1500]).unwrap();
    ch.write_message(PacketType::SqlBatch, &[0; 600]).unwrap();

    let headers: Vec<_> = ch.take_packets().map(|p| p.header).collect();
    let ids: Vec<_> = headers.iter().map(|h| h.packet_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 1, 2]);
    assert!(headers[2].status.contains(PacketStatus::END_OF_MESSAGE));
    assert!(headers[4].status.contains(PacketStatus::END_OF_MESSAGE));
}

#[tokio::test]
async fn response_split_at_odd_transport_boundaries() {
    let wire = [tabular(0, 1, b"abc"), tabular(1, 2, b"defg")].concat();
    let mock = tokio_test::io::Builder::new()
        .read(&wire[..5])
        .read(&wire[5..13])
        .read(&wire[13..])
        .build();
    let mut conn = Connection::new(mock);

    let message = conn.read_message().await.unwrap();
    assert_eq!(&message[..], b"abcdefg");
    assert_eq!(conn.channel().incoming_type(), Some(PacketType::TabularResult));
}

#[tokio::test]
async fn truncated_response_breaks_the_connection() {
    let wire = tabular(1, 1, b"abcdef");
    let mock = tokio_test::io::Builder::new().read(&wire[..10]).build();
    let mut conn = Connection::new(mock);

    assert!(conn.read_message().await.is_err());
    assert!(conn.channel().is_broken());
}

proptest! {
    #[test]
    fn messages_survive_packetization(
        len in 0usize..20_000,
        size in 512usize..=32_767,
    ) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let mut sender = Channel::new();
        sender.set_packet_size(size).unwrap();
        sender.write_message(PacketType::TabularResult, &payload).unwrap();
        let mut wire = BytesMut::new();
        sender.encode_output(&mut wire).unwrap();

        let expected_packets = len.div_ceil(size - 8).max(1);
        prop_assert_eq!(wire.len(), len + 8 * expected_packets);

        let mut receiver = Channel::new();
        receiver.set_packet_size(size).unwrap();
        receiver.feed(&wire);
        while !receiver.message_complete() {
            prop_assert_eq!(receiver.try_fill().unwrap(), Step::Ready(()));
        }
        prop_assert_eq!(receiver.payload(), &payload[..]);
    }
}
