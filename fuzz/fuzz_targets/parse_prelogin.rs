#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::prelogin::PreLogin;

fuzz_target!(|data: &[u8]| {
    if let Ok(prelogin) = PreLogin::decode(data) {
        // Whatever decodes must encode again.
        let _ = prelogin.encode();
    }
});
