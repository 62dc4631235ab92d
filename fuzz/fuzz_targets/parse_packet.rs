#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::packet::PacketHeader;

fuzz_target!(|data: &[u8]| {
    let _ = PacketHeader::from_bytes(data);
});
