#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tds_protocol::metadata::TypeInfo;
use tds_protocol::version::ProtocolTier;
use tds_protocol::wire::Reader;

/// Raw TYPE_INFO bytes followed by a value.
#[derive(Debug, Arbitrary)]
struct FuzzInput {
    type_info: Vec<u8>,
    value: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let Ok(info) = TypeInfo::decode(&mut Reader::new(&input.type_info), ProtocolTier::Denali) else {
        return;
    };
    let decoded = tds_values::decode_value(&mut Reader::new(&input.value), &info);
    let skipped = tds_values::skip_value(&mut Reader::new(&input.value), &info);
    // Skipping and decoding agree on whether the value is well formed.
    if decoded.is_ok() {
        assert!(skipped.is_ok());
    }
});
