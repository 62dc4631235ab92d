#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tds_codec::Channel;
use tds_engine::{Collect, Session, SessionConfig, SessionState, TokenStream};
use tds_protocol::wire::Step;

/// A response payload fed to the stream in pieces.
#[derive(Debug, Arbitrary)]
struct FuzzInput {
    payload: Vec<u8>,
    split: u16,
}

fn packet(status: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x04, status];
    out.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 1, 0]);
    out.extend_from_slice(payload);
    out
}

fuzz_target!(|input: FuzzInput| {
    let payload = &input.payload[..input.payload.len().min(4000)];
    let at = usize::from(input.split).min(payload.len());

    let mut session = Session::new(&SessionConfig::default());
    if session.transition(SessionState::OpenNotLoggedIn).is_err()
        || session.transition(SessionState::OpenLoggedIn).is_err()
    {
        return;
    }
    let mut ch = Channel::new();
    let mut stream = TokenStream::new();
    let mut sink = Collect::new();

    ch.feed(&packet(0x00, &payload[..at]));
    match stream.advance(&mut ch, &mut session, &mut sink) {
        Ok(Step::NeedMore) => {}
        _ => return,
    }
    ch.feed(&packet(0x01, &payload[at..]));
    let _ = stream.advance(&mut ch, &mut session, &mut sink);
});
