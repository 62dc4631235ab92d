//! Session scenarios against a scripted server on an in-memory transport.

#![allow(clippy::unwrap_used, clippy::panic, missing_docs)]

use std::sync::{Arc, Mutex};

use tds_engine::{
    Collect, Error, Phase, Result, Row, SessionConfig, SessionDriver, SessionState, TimeoutConfig,
    TokenSink, TransportUpgrade,
};
use tds_engine::SqlValue;
use tds_protocol::metadata::ColumnDescriptor;
use tds_protocol::prelogin::{EncryptionLevel, EncryptionMode, PreLogin};
use tds_protocol::token::{
    Done, DoneStatus, EnvChange, EnvChangeType, EnvValue, LoginAck, TokenType,
};
use tds_protocol::version::{ProtocolTier, TdsVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::time::Duration;

const EOM: u8 = 0x01;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[derive(Clone, Default)]
struct Upgrades(Arc<Mutex<Vec<&'static str>>>);

impl TransportUpgrade for Upgrades {
    fn begin_tls(&mut self) -> Result<()> {
        self.0.lock().unwrap().push("begin");
        Ok(())
    }

    fn end_tls(&mut self) -> Result<()> {
        self.0.lock().unwrap().push("end");
        Ok(())
    }
}

/// One client message: packet type, payload and how many packets carried it.
struct Received {
    kind: u8,
    payload: Vec<u8>,
    packets: usize,
}

async fn receive(server: &mut DuplexStream) -> Received {
    let mut payload = Vec::new();
    let mut packets = 0;
    loop {
        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; len - 8];
        server.read_exact(&mut body).await.unwrap();
        payload.extend(body);
        packets += 1;
        if header[1] & EOM != 0 {
            return Received {
                kind: header[0],
                payload,
                packets,
            };
        }
    }
}

async fn send_packet(server: &mut DuplexStream, status: u8, id: u8, payload: &[u8]) {
    let len = (8 + payload.len()) as u16;
    let mut out = vec![0x04, status];
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x34, id, 0x00]);
    out.extend_from_slice(payload);
    server.write_all(&out).await.unwrap();
}

fn done(status: DoneStatus, rows: u64) -> Vec<u8> {
    let mut out = Vec::new();
    Done {
        status,
        cur_cmd: 0xC1,
        row_count: rows,
    }
    .encode(TokenType::Done, ProtocolTier::Denali, &mut out);
    out
}

fn packet_size_change(new: &str, old: &str) -> Vec<u8> {
    let mut out = Vec::new();
    EnvChange {
        kind: EnvChangeType::PacketSize,
        new_value: EnvValue::String(new.into()),
        old_value: EnvValue::String(old.into()),
    }
    .encode(&mut out)
    .unwrap();
    out
}

fn b_varchar(out: &mut Vec<u8>, text: &str) {
    out.push(text.encode_utf16().count() as u8);
    out.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
}

/// COLMETADATA for nullable columns; each entry is the TYPE_INFO bytes and
/// the column name.
fn colmetadata(columns: &[(&[u8], &str)]) -> Vec<u8> {
    let mut out = vec![0x81];
    out.extend_from_slice(&(columns.len() as u16).to_le_bytes());
    for (type_info, name) in columns {
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0x0001u16.to_le_bytes());
        out.extend_from_slice(type_info);
        b_varchar(&mut out, name);
    }
    out
}

const INT4: &[u8] = &[0x38];

async fn accept_login(server: &mut DuplexStream) {
    let prelogin = receive(server).await;
    assert_eq!(prelogin.kind, 0x12);
    let request = PreLogin::decode(&prelogin.payload).unwrap();
    assert_eq!(request.encryption, EncryptionLevel::Off);
    let response = PreLogin::new().with_encryption(EncryptionLevel::Off);
    send_packet(server, EOM, 1, &response.encode()).await;

    let login = receive(server).await;
    assert_eq!(login.kind, 0x10);

    let mut payload = Vec::new();
    LoginAck {
        interface: 1,
        version: TdsVersion::V7_4,
        prog_name: "Microsoft SQL Server".into(),
        prog_version: [16, 0, 0x10, 0x00],
    }
    .encode(&mut payload)
    .unwrap();
    payload.extend(done(DoneStatus::empty(), 0));
    send_packet(server, EOM, 1, &payload).await;
}

fn config() -> SessionConfig {
    SessionConfig::new()
        .server_name("db1")
        .sql_auth("app", "secret")
        .database("orders")
        .timeouts(
            TimeoutConfig::new()
                .login_timeout(Duration::from_secs(5))
                .command_timeout(Duration::from_secs(5))
                .attention_timeout(Duration::from_secs(5)),
        )
}

async fn connect() -> (SessionDriver<DuplexStream>, DuplexStream, Upgrades) {
    init_tracing();
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let upgrades = Upgrades::default();
    let mut driver = SessionDriver::new(client, config())
        .unwrap()
        .with_upgrade(Box::new(upgrades.clone()));
    let (result, ()) = tokio::join!(driver.login(), accept_login(&mut server));
    result.unwrap();
    (driver, server, upgrades)
}

#[tokio::test]
async fn login_round_trip_encrypts_only_login7() {
    let (driver, _server, upgrades) = connect().await;
    assert_eq!(driver.session().state(), SessionState::OpenLoggedIn);
    assert_eq!(driver.encryption(), Some(EncryptionMode::LoginOnly));
    assert_eq!(*upgrades.0.lock().unwrap(), vec!["begin", "end"]);
    assert_eq!(driver.session().tds_version(), Some(TdsVersion::V7_4));
}

#[tokio::test]
async fn done_with_more_keeps_reading() {
    let (mut driver, mut server, upgrades) = connect().await;
    let serve = async {
        let batch = receive(&mut server).await;
        assert_eq!(batch.kind, 0x01);
        send_packet(&mut server, 0x00, 1, &done(DoneStatus::MORE | DoneStatus::COUNT, 2)).await;
        send_packet(&mut server, EOM, 2, &done(DoneStatus::COUNT, 3)).await;
    };
    let mut collect = Collect::new();
    let (result, ()) = tokio::join!(driver.execute("UPDATE a SET x = 1; UPDATE b SET y = 2", &mut collect), serve);
    let summary = result.unwrap();
    assert_eq!(summary.rows_affected, 5);
    assert_eq!(collect.row_counts, vec![2, 3]);
    // Nothing after login goes through TLS.
    assert_eq!(upgrades.0.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn nbcrow_nulls_take_no_value_bytes() {
    let (mut driver, mut server, _) = connect().await;
    let serve = async {
        receive(&mut server).await;
        let mut payload = colmetadata(&[(INT4, "a"), (INT4, "b"), (INT4, "c"), (INT4, "d"), (INT4, "e")]);
        payload.push(0xD2);
        payload.push(0b0000_0101);
        for v in [20i32, 40, 50] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload.extend(done(DoneStatus::COUNT, 1));
        send_packet(&mut server, EOM, 1, &payload).await;
    };
    let (result, ()) = tokio::join!(driver.query("SELECT a, b, c, d, e FROM t"), serve);
    let collect = result.unwrap();
    let rows = collect.first_rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_null(0));
    assert_eq!(rows[0].get::<i32>(1).unwrap(), 20);
    assert!(rows[0].is_null(2));
    assert_eq!(rows[0].get::<i32>(3).unwrap(), 40);
    assert_eq!(rows[0].get_by_name::<i32>("E").unwrap(), 50);
}

/// Collects rows and signals once column metadata has arrived.
struct Signalling {
    inner: Collect,
    ready: Arc<Notify>,
}

impl TokenSink for Signalling {
    fn on_metadata(&mut self, columns: &Arc<[ColumnDescriptor]>) -> Result<()> {
        self.ready.notify_one();
        self.inner.on_metadata(columns)
    }

    fn on_row(&mut self, row: Row) -> Result<()> {
        self.inner.on_row(row)
    }
}

#[tokio::test]
async fn attention_mid_row_drains_to_acknowledgment() {
    let (mut driver, mut server, _) = connect().await;
    let cancel = driver.cancel_handle();
    let ready = Arc::new(Notify::new());
    let mut sink = Signalling {
        inner: Collect::new(),
        ready: Arc::clone(&ready),
    };

    let serve = async {
        receive(&mut server).await;
        let mut first = colmetadata(&[(INT4, "n")]);
        first.push(0xD1);
        first.extend_from_slice(&7i32.to_le_bytes()[..2]);
        send_packet(&mut server, 0x00, 1, &first).await;

        ready.notified().await;
        cancel.cancel().await.unwrap();
        let attention = receive(&mut server).await;
        assert_eq!(attention.kind, 0x06);
        assert!(attention.payload.is_empty());

        let mut rest = 7i32.to_le_bytes()[2..].to_vec();
        rest.push(0xD1);
        rest.extend_from_slice(&8i32.to_le_bytes());
        rest.extend(done(DoneStatus::ATTN, 0));
        send_packet(&mut server, EOM, 2, &rest).await;
    };
    let (result, ()) = tokio::join!(driver.execute("SELECT n FROM big", &mut sink), serve);
    let summary = result.unwrap();
    assert!(summary.cancelled);
    // The row being read completes; the one after the attention is skipped.
    let rows = sink.inner.first_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value(0), Some(&SqlValue::Int(7)));
    assert!(!driver.cancel_handle().is_cancelling());
    assert_eq!(driver.open_results(), 0);

    // The channel is usable again.
    let serve = async {
        receive(&mut server).await;
        send_packet(&mut server, EOM, 1, &done(DoneStatus::COUNT, 1)).await;
    };
    let mut sink = Collect::new();
    let (result, ()) = tokio::join!(driver.execute("DELETE FROM t WHERE id = 1", &mut sink), serve);
    assert_eq!(result.unwrap().rows_affected, 1);
}

#[tokio::test]
async fn packet_size_change_applies_within_the_message() {
    let (mut driver, mut server, _) = connect().await;
    assert_eq!(driver.packet_size(), 4096);

    let serve = async {
        receive(&mut server).await;
        send_packet(&mut server, 0x00, 1, &packet_size_change("8192", "4096")).await;

        // Larger than a 4096-byte packet could carry.
        let mut payload = colmetadata(&[(&[0xA5, 0x40, 0x1F], "blob")]);
        payload.push(0xD1);
        payload.extend_from_slice(&5000u16.to_le_bytes());
        payload.extend(std::iter::repeat_n(0xAB, 5000));
        payload.extend(done(DoneStatus::COUNT, 1));
        send_packet(&mut server, EOM, 2, &payload).await;
    };
    let (result, ()) = tokio::join!(driver.query("SELECT blob FROM files"), serve);
    let collect = result.unwrap();
    match collect.first_rows()[0].value(0) {
        Some(SqlValue::Binary(bytes)) => assert_eq!(bytes.len(), 5000),
        other => panic!("unexpected value {other:?}"),
    }
    assert_eq!(driver.packet_size(), 8192);
    assert_eq!(driver.session().packet_size(), 8192);

    // Requests are cut at the new size too.
    let sql = format!("SELECT '{}'", "x".repeat(3000));
    let serve = async {
        let batch = receive(&mut server).await;
        assert_eq!(batch.packets, 1);
        assert!(batch.payload.len() > 4096);
        send_packet(&mut server, EOM, 1, &done(DoneStatus::empty(), 0)).await;
    };
    let mut sink = Collect::new();
    let (result, ()) = tokio::join!(driver.execute(&sql, &mut sink), serve);
    result.unwrap();
}

#[tokio::test]
async fn server_error_leaves_session_usable() {
    let (mut driver, mut server, _) = connect().await;
    let serve = async {
        receive(&mut server).await;
        let mut payload = Vec::new();
        tds_protocol::token::ServerMessage {
            number: 208,
            state: 1,
            class: 16,
            message: "Invalid object name 'missing'.".into(),
            server: "db1".into(),
            procedure: String::new(),
            line: 1,
        }
        .encode(TokenType::Error, &mut payload)
        .unwrap();
        payload.extend(done(DoneStatus::ERROR, 0));
        send_packet(&mut server, EOM, 1, &payload).await;
    };
    let (result, ()) = tokio::join!(driver.query("SELECT * FROM missing"), serve);
    let err = result.unwrap_err();
    assert!(err.is_server_error(208));
    assert!(!err.is_fatal());
    assert_eq!(driver.session().state(), SessionState::OpenLoggedIn);
}

#[tokio::test]
async fn closed_transport_breaks_the_session() {
    let (mut driver, server, _) = connect().await;
    drop(server);
    let err = driver.query("SELECT 1").await.unwrap_err();
    assert!(err.is_fatal());
    assert!(driver.session().state().is_broken());
    assert!(matches!(driver.query("SELECT 1").await, Err(Error::Broken)));
}

#[tokio::test]
async fn attention_without_acknowledgment_is_fatal() {
    init_tracing();
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let config = config().timeouts(
        TimeoutConfig::new()
            .command_timeout(Duration::from_millis(30))
            .attention_timeout(Duration::from_millis(30)),
    );
    let mut driver = SessionDriver::new(client, config)
        .unwrap()
        .with_upgrade(Box::new(Upgrades::default()));
    let (result, ()) = tokio::join!(driver.login(), accept_login(&mut server));
    result.unwrap();

    let err = driver.query("WAITFOR DELAY '00:10'").await.unwrap_err();
    assert!(matches!(err, Error::Timeout { phase: Phase::Attention }));
    assert!(driver.session().state().is_broken());
}
