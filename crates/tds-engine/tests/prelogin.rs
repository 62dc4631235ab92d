//! PRELOGIN exchanges against scripted transports.

#![allow(clippy::unwrap_used, missing_docs)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tds_engine::login::prelogin_request;
use tds_engine::{Error, SessionConfig, SessionDriver};
use tds_protocol::prelogin::{EncryptionLevel, PreLogin};
use tokio_test::io::{Builder, Mock};

fn framed(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut out = vec![packet_type, 0x01];
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]);
    out.extend_from_slice(payload);
    out
}

fn config() -> SessionConfig {
    SessionConfig::new()
        .server_name("db1")
        .instance("SQLEXPRESS")
        .sql_auth("app", "secret")
}

fn instance_failure(config: &SessionConfig) -> Mock {
    let request = framed(0x12, &prelogin_request(config).encode());
    let mut refused = PreLogin::new();
    refused.instance_status = Some(1);
    Builder::new()
        .write(&request)
        .read(&framed(0x04, &refused.encode()))
        .build()
}

#[tokio::test]
async fn named_instance_failure_without_reconnect_is_reported() {
    let config = config();
    // One exchange only: the mock panics if PRELOGIN is resent on it.
    let transport = instance_failure(&config);

    let mut driver = SessionDriver::new(transport, config).unwrap();
    let err = driver.login().await.unwrap_err();
    assert!(matches!(err, Error::InstanceFailure));
    assert!(err.is_transient());
    assert!(driver.session().state().is_broken());
}

#[tokio::test]
async fn named_instance_retry_uses_a_new_transport() {
    let config = config();
    let first = instance_failure(&config);
    let mut second = Some(instance_failure(&config));
    let opened = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&opened);
    let mut driver = SessionDriver::new(first, config)
        .unwrap()
        .with_reconnect(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = second.take();
            async move { next.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected)) }.boxed()
        }));

    let err = driver.login().await.unwrap_err();
    assert!(matches!(err, Error::InstanceFailure));
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert!(driver.session().state().is_broken());
}

#[tokio::test]
async fn failed_reconnect_surfaces_the_io_error() {
    let config = config();
    let mut driver = SessionDriver::new(instance_failure(&config), config)
        .unwrap()
        .with_reconnect(Box::new(|| {
            async { Err::<Mock, _>(io::Error::from(io::ErrorKind::ConnectionRefused)) }.boxed()
        }));

    let err = driver.login().await.unwrap_err();
    assert!(matches!(err, Error::Codec(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn refused_encryption_fails_before_login7() {
    let config = config().encryption(EncryptionLevel::On);
    let request = framed(0x12, &prelogin_request(&config).encode());
    let response = framed(
        0x04,
        &PreLogin::new()
            .with_encryption(EncryptionLevel::NotSupported)
            .encode(),
    );

    let transport = Builder::new().write(&request).read(&response).build();

    let mut driver = SessionDriver::new(transport, config).unwrap();
    let err = driver.login().await.unwrap_err();
    assert!(matches!(err, Error::EncryptionRefused(_)));
    assert!(err.is_fatal());
}

#[test]
fn invalid_configuration_is_rejected_up_front() {
    let config = config().packet_size(100);
    let transport = Builder::new().build();
    assert!(matches!(
        SessionDriver::new(transport, config),
        Err(Error::Config(_))
    ));
}
